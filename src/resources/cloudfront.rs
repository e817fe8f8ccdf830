use super::*;

pub const DISTRIBUTION_LOGICAL_ID: &str = "SiteDistribution";
pub const DEFAULT_ORIGIN_ID: &str = "origin0";

/// caching optimized:
/// https://docs.aws.amazon.com/AmazonCloudFront/latest/DeveloperGuide/using-managed-cache-policies.html#managed-cache-caching-optimized
pub const CACHING_OPTIMIZED_POLICY_ID: &str = "658327ea-f89d-4fab-a63d-7e88639e58f6";

/// origin status codes answered with the entry document instead, so
/// client-side routes resolve to the application shell.
pub const SPA_FALLBACK_STATUS_CODES: &[u16] = &[400, 404];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    #[serde(rename = "ErrorCode")]
    pub error_code: u16,
    #[serde(rename = "ResponseCode")]
    pub response_code: u16,
    #[serde(rename = "ResponsePagePath")]
    pub response_page_path: String,
}

/// every fallback code rewritten to `/<entry_document>` with status 200.
pub fn spa_error_responses(entry_document: &str) -> Vec<ErrorResponse> {
    SPA_FALLBACK_STATUS_CODES
        .iter()
        .map(|code| ErrorResponse {
            error_code: *code,
            response_code: 200,
            response_page_path: format!("/{entry_document}"),
        })
        .collect()
}

/// the rewrite an edge applies to an origin answering `status`, if any.
pub fn rewrite_for(responses: &[ErrorResponse], status: u16) -> Option<&ErrorResponse> {
    responses.iter().find(|r| r.error_code == status)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributionHandle {
    pub logical_id: String,
}

/// Declares the distribution in front of `bucket`.
/// - the entry document answers the root path
/// - the origin is read through `identity` only
/// - plain http viewers are redirected to https
/// - 400 and 404 from the origin serve the entry document with 200
/// The certificate is imported into `unit`, so the distribution cannot be
/// created before the certificate exists.
pub fn create(
    unit: &mut StackUnit,
    bucket: &BucketRef,
    identity: &OriginAccessIdentityRef,
    certificate: &CertificateHandle,
    hostnames: &[Hostname],
    entry_document: &str,
) -> Result<DistributionHandle> {
    if hostnames.is_empty() {
        return Err(Error::template(&unit.name, "Distribution needs at least one hostname"));
    }
    if let Some(other) = hostnames.iter().find(|h| h.as_str() != certificate.domain_name()) {
        return Err(Error::Configuration(format!(
            "Hostname {other} is not covered by the certificate for {}",
            certificate.domain_name()
        )));
    }
    let certificate_arn = acm_cert::import(unit, certificate)?;
    let aliases: Vec<&str> = hostnames.iter().map(|h| h.as_str()).collect();
    let error_responses = spa_error_responses(entry_document);
    let distribution = Resource::new(
        "AWS::CloudFront::Distribution",
        json!({
            "DistributionConfig": {
                "Enabled": true,
                "Comment": format!("{} static site", aliases.join(", ")),
                "Aliases": aliases,
                "DefaultRootObject": entry_document,
                "HttpVersion": "http2",
                "IPV6Enabled": false,
                "ViewerCertificate": {
                    "AcmCertificateArn": certificate_arn,
                    "MinimumProtocolVersion": "TLSv1.2_2021",
                    "SslSupportMethod": "sni-only",
                },
                "Origins": [{
                    "Id": DEFAULT_ORIGIN_ID,
                    "DomainName": get_att(&bucket.logical_id, "RegionalDomainName"),
                    "S3OriginConfig": {
                        "OriginAccessIdentity": sub(&format!(
                            "origin-access-identity/cloudfront/${{{}}}",
                            identity.logical_id
                        )),
                    },
                }],
                "DefaultCacheBehavior": {
                    "TargetOriginId": DEFAULT_ORIGIN_ID,
                    "ViewerProtocolPolicy": "redirect-to-https",
                    "CachePolicyId": CACHING_OPTIMIZED_POLICY_ID,
                    "AllowedMethods": ["GET", "HEAD"],
                    "CachedMethods": ["GET", "HEAD"],
                    "Compress": true,
                },
                "CustomErrorResponses": error_responses,
            },
        }),
    );
    unit.template.add_resource(DISTRIBUTION_LOGICAL_ID, distribution)?;
    Ok(DistributionHandle {
        logical_id: DISTRIBUTION_LOGICAL_ID.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regions::CERTIFICATE_REGION;

    fn setup(env: &str) -> (StackUnit, StackUnit, CertificateHandle, Hostname) {
        let env = EnvironmentName::new(env).unwrap();
        let domain = SiteDomain::new("example.house", "ledger");
        let zone = HostedZone::new("Z0123", "example.house");
        let mut certs = StackUnit::new("certs", CERTIFICATE_REGION);
        let cert = acm_cert::provision(&mut certs, &env, &domain, &zone).unwrap();
        let web = StackUnit::new("web", "us-west-1");
        (certs, web, cert, hostname(&env, &domain))
    }

    #[test]
    fn distribution_serves_spa_fallbacks() {
        let (_, mut web, cert, host) = setup("dev");
        let bucket = create_bucket(&mut web, false).unwrap();
        let identity = create_origin_access_identity(&mut web, "site").unwrap();
        create(&mut web, &bucket, &identity, &cert, &[host], "index.html").unwrap();
        web.template.validate("web").unwrap();

        let config = &web.template.resources[DISTRIBUTION_LOGICAL_ID].properties["DistributionConfig"];
        assert_eq!(config["DefaultRootObject"], "index.html");
        assert_eq!(config["Aliases"][0], "ledger.dev.example.house");
        assert_eq!(config["DefaultCacheBehavior"]["ViewerProtocolPolicy"], "redirect-to-https");
        assert_eq!(config["ViewerCertificate"]["AcmCertificateArn"], get_ref(CERTIFICATE_ARN_PARAMETER));
        let responses: Vec<ErrorResponse> =
            serde_json::from_value(config["CustomErrorResponses"].clone()).unwrap();
        assert_eq!(responses, spa_error_responses("index.html"));
        for code in [400, 404] {
            let rewrite = rewrite_for(&responses, code).unwrap();
            assert_eq!(rewrite.response_code, 200);
            assert_eq!(rewrite.response_page_path, "/index.html");
        }
        assert!(rewrite_for(&responses, 403).is_none());
    }

    #[test]
    fn distribution_depends_on_identity_and_bucket() {
        let (_, mut web, cert, host) = setup("prod");
        let bucket = create_bucket(&mut web, false).unwrap();
        let identity = create_origin_access_identity(&mut web, "site").unwrap();
        create(&mut web, &bucket, &identity, &cert, &[host], "index.html").unwrap();
        let deps = web.template.dependencies_of(DISTRIBUTION_LOGICAL_ID);
        assert!(deps.contains(BUCKET_LOGICAL_ID));
        assert!(deps.contains(ORIGIN_ACCESS_IDENTITY_LOGICAL_ID));
        assert!(deps.contains(CERTIFICATE_ARN_PARAMETER));
    }

    #[test]
    fn hostname_must_match_certificate() {
        let (_, mut web, cert, _) = setup("dev");
        let bucket = create_bucket(&mut web, false).unwrap();
        let identity = create_origin_access_identity(&mut web, "site").unwrap();
        let other = hostname(
            &EnvironmentName::new("qa").unwrap(),
            &SiteDomain::new("example.house", "ledger"),
        );
        assert!(create(&mut web, &bucket, &identity, &cert, &[other], "index.html").is_err());
        assert!(create(&mut web, &bucket, &identity, &cert, &[], "index.html").is_err());
    }
}
