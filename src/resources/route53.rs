use super::*;

/// this is static for all of AWS for aliases to CloudFront.
/// see https://docs.aws.amazon.com/AWSCloudFormation/latest/UserGuide/aws-properties-route53-aliastarget.html#cfn-route53-aliastarget-hostedzoneid
pub const CLOUDFRONT_ALIAS_ZONE_ID: &str = "Z2FDTNDATAQYW2";

pub const ALIAS_RECORD_LOGICAL_ID: &str = "SiteAliasRecord";

/// a hosted zone that already exists in the account. never created
/// or modified by this crate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostedZone {
    /// bare id, without the `/hostedzone/` prefix.
    pub id: String,
    /// zone name without the trailing dot.
    pub name: String,
}

impl HostedZone {
    pub fn new<I: AsRef<str>, N: AsRef<str>>(id: I, name: N) -> Self {
        let id = id.as_ref();
        let id = id.strip_prefix("/hostedzone/").unwrap_or(id);
        Self {
            id: id.to_string(),
            name: name.as_ref().trim_end_matches('.').to_string(),
        }
    }

    /// true if records for `host` belong in this zone.
    pub fn contains(&self, host: &Hostname) -> bool {
        host.as_str() == self.name || host.as_str().ends_with(&format!(".{}", self.name))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AliasRecordRef {
    pub logical_id: String,
    pub record_name: String,
}

/// points `hostname` at the distribution with an alias A record, so the
/// record follows the distribution's edge addresses without manual updates.
/// The logical id is fixed, so re-deploying the same environment updates
/// the record in place instead of adding another.
pub fn bind(
    unit: &mut StackUnit,
    zone: &HostedZone,
    hostname: &Hostname,
    distribution: &DistributionHandle,
) -> Result<AliasRecordRef> {
    if !zone.contains(hostname) {
        return Err(Error::Configuration(format!(
            "Hostname {hostname} is not part of hosted zone {}",
            zone.name
        )));
    }
    let record_name = hostname.record_name();
    let record = Resource::new(
        "AWS::Route53::RecordSet",
        json!({
            "HostedZoneId": zone.id,
            "Name": record_name,
            "Type": "A",
            "Comment": format!("alias for {hostname}"),
            "AliasTarget": {
                "DNSName": get_att(&distribution.logical_id, "DomainName"),
                "HostedZoneId": CLOUDFRONT_ALIAS_ZONE_ID,
            },
        }),
    );
    unit.template.add_resource(ALIAS_RECORD_LOGICAL_ID, record)?;
    Ok(AliasRecordRef {
        logical_id: ALIAS_RECORD_LOGICAL_ID.to_string(),
        record_name,
    })
}
