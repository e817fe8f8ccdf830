use super::*;

use crate::regions::CERTIFICATE_REGION;

pub const CERTIFICATE_LOGICAL_ID: &str = "SiteCertificate";
/// output of the certificate unit holding the certificate ARN.
pub const CERTIFICATE_ARN_OUTPUT: &str = "CertificateArn";
/// parameter of a consuming unit that receives the ARN.
pub const CERTIFICATE_ARN_PARAMETER: &str = "CertificateArn";

/// Reference to an issued certificate. The only thing a consumer can do
/// with it is import it into a unit; it serializes so it can cross the
/// region boundary between units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateHandle {
    unit: String,
    region: String,
    output: String,
    domain_name: String,
}

impl CertificateHandle {
    pub fn unit(&self) -> &str {
        &self.unit
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn domain_name(&self) -> &str {
        &self.domain_name
    }
}

/// Declares a public certificate for the environment's hostname, validated
/// through DNS records in `zone`. The zone must already exist; it is only
/// referenced by id. The unit has to live in the certificate region.
pub fn provision(
    unit: &mut StackUnit,
    environment: &EnvironmentName,
    domain: &SiteDomain,
    zone: &HostedZone,
) -> Result<CertificateHandle> {
    if unit.region != CERTIFICATE_REGION {
        return Err(Error::template(
            &unit.name,
            format!(
                "Distribution certificates must be issued in {CERTIFICATE_REGION}, not {}",
                unit.region
            ),
        ));
    }
    let host = hostname(environment, domain);
    if !zone.contains(&host) {
        return Err(Error::Configuration(format!(
            "Cannot validate {host} through hosted zone {}",
            zone.name
        )));
    }
    let cert = Resource::new(
        "AWS::CertificateManager::Certificate",
        json!({
            "DomainName": host.as_str(),
            "ValidationMethod": "DNS",
            "DomainValidationOptions": [{
                "DomainName": host.as_str(),
                "HostedZoneId": zone.id,
            }],
            "Tags": [{ "Key": "environment", "Value": environment.as_str() }],
        }),
    );
    unit.template.add_resource(CERTIFICATE_LOGICAL_ID, cert)?;
    unit.template.add_output(
        CERTIFICATE_ARN_OUTPUT,
        format!("certificate for {host}"),
        get_ref(CERTIFICATE_LOGICAL_ID),
    );
    Ok(CertificateHandle {
        unit: unit.name.clone(),
        region: unit.region.clone(),
        output: CERTIFICATE_ARN_OUTPUT.to_string(),
        domain_name: host.as_str().to_string(),
    })
}

/// makes the certificate usable inside `unit` and returns the value to
/// reference it with. Across units this is a parameter filled from the
/// exporting unit's output at deploy time.
pub fn import(unit: &mut StackUnit, certificate: &CertificateHandle) -> Result<serde_json::Value> {
    if certificate.unit == unit.name {
        return Ok(get_ref(CERTIFICATE_LOGICAL_ID));
    }
    if !unit.template.parameters.contains_key(CERTIFICATE_ARN_PARAMETER) {
        unit.template.add_parameter(
            CERTIFICATE_ARN_PARAMETER,
            TemplateParameter {
                ty: "String".into(),
                description: Some(format!(
                    "ARN of the certificate for {} issued in {}",
                    certificate.domain_name, certificate.region
                )),
                allowed_pattern: Some(format!(
                    "^arn:aws[a-z-]*:acm:{}:[0-9]{{12}}:certificate/.+$",
                    certificate.region
                )),
            },
        )?;
        unit.imports.push(Import {
            parameter: CERTIFICATE_ARN_PARAMETER.to_string(),
            from_unit: certificate.unit.clone(),
            output: certificate.output.clone(),
        });
    }
    Ok(get_ref(CERTIFICATE_ARN_PARAMETER))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zone() -> HostedZone {
        HostedZone::new("Z0123", "example.house")
    }

    #[test]
    fn certificate_uses_dns_validation_in_the_zone() {
        let env = EnvironmentName::new("staging").unwrap();
        let domain = SiteDomain::new("example.house", "ledger");
        let mut unit = StackUnit::new("certs", CERTIFICATE_REGION);
        let handle = provision(&mut unit, &env, &domain, &zone()).unwrap();
        assert_eq!(handle.domain_name(), "ledger.staging.example.house");
        assert_eq!(handle.region(), CERTIFICATE_REGION);
        let props = &unit.template.resources[CERTIFICATE_LOGICAL_ID].properties;
        assert_eq!(props["DomainName"], "ledger.staging.example.house");
        assert_eq!(props["ValidationMethod"], "DNS");
        assert_eq!(props["DomainValidationOptions"][0]["HostedZoneId"], "Z0123");
        assert_eq!(
            unit.template.outputs[CERTIFICATE_ARN_OUTPUT].value,
            get_ref(CERTIFICATE_LOGICAL_ID)
        );
    }

    #[test]
    fn certificate_must_be_in_the_certificate_region() {
        let env = EnvironmentName::new("dev").unwrap();
        let domain = SiteDomain::new("example.house", "ledger");
        let mut unit = StackUnit::new("certs", "us-west-1");
        assert!(provision(&mut unit, &env, &domain, &zone()).is_err());
    }

    #[test]
    fn importing_adds_a_parameter_once() {
        let env = EnvironmentName::new("dev").unwrap();
        let domain = SiteDomain::new("example.house", "ledger");
        let mut certs = StackUnit::new("certs", CERTIFICATE_REGION);
        let handle = provision(&mut certs, &env, &domain, &zone()).unwrap();

        let mut web = StackUnit::new("web", "us-west-1");
        let first = import(&mut web, &handle).unwrap();
        let second = import(&mut web, &handle).unwrap();
        assert_eq!(first, get_ref(CERTIFICATE_ARN_PARAMETER));
        assert_eq!(first, second);
        assert_eq!(web.imports.len(), 1);
        assert_eq!(web.imports[0].from_unit, "certs");
        assert_eq!(web.imports[0].output, CERTIFICATE_ARN_OUTPUT);

        // same unit: plain reference, no parameter
        assert_eq!(import(&mut certs, &handle).unwrap(), get_ref(CERTIFICATE_LOGICAL_ID));
        assert!(certs.imports.is_empty());
    }

    #[test]
    fn handle_survives_serialization() {
        let env = EnvironmentName::new("dev").unwrap();
        let domain = SiteDomain::new("example.house", "ledger");
        let mut certs = StackUnit::new("certs", CERTIFICATE_REGION);
        let handle = provision(&mut certs, &env, &domain, &zone()).unwrap();
        let s = serde_json::to_string(&handle).unwrap();
        let back: CertificateHandle = serde_json::from_str(&s).unwrap();
        assert_eq!(back, handle);
    }
}
