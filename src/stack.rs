//! Composition of the site into two units: the certificate unit, pinned to
//! the certificate region, and the web unit holding everything else.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use crate::config::SiteConfig;
use crate::environment::EnvironmentName;
use crate::error::{Error, Result};
use crate::graph::{ResourceAddress, ResourceGraph};
use crate::naming::{hostname, Hostname};
use crate::regions::CERTIFICATE_REGION;
use crate::resources::{
    acm_cert, cloudfront, route53, s3_bucket, AliasRecordRef, BucketRef, CertificateHandle,
    DistributionHandle, HostedZone,
};
use crate::template::{get_att, get_ref, validate_stack_name, Template};

pub const BUCKET_NAME_OUTPUT: &str = "BucketName";
pub const DISTRIBUTION_ID_OUTPUT: &str = "DistributionId";
pub const DISTRIBUTION_DOMAIN_OUTPUT: &str = "DistributionDomainName";
pub const SITE_HOSTNAME_OUTPUT: &str = "SiteHostname";

/// a parameter of one unit filled from an output of another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Import {
    pub parameter: String,
    pub from_unit: String,
    pub output: String,
}

/// one provisioning unit, ie: one CloudFormation stack in one region.
#[derive(Debug, Clone, PartialEq)]
pub struct StackUnit {
    pub name: String,
    pub region: String,
    pub template: Template,
    pub imports: Vec<Import>,
}

impl StackUnit {
    pub fn new<N: AsRef<str>, R: AsRef<str>>(name: N, region: R) -> Self {
        Self {
            name: name.as_ref().to_string(),
            region: region.as_ref().to_string(),
            template: Template::default(),
            imports: vec![],
        }
    }

    /// parameter values for this unit given the outputs of already
    /// deployed units, keyed by unit name.
    pub fn parameter_values(
        &self,
        deployed: &BTreeMap<String, BTreeMap<String, String>>,
    ) -> Result<BTreeMap<String, String>> {
        let mut out = BTreeMap::new();
        for import in self.imports.iter() {
            let value = deployed
                .get(&import.from_unit)
                .and_then(|outputs| outputs.get(&import.output))
                .ok_or_else(|| {
                    Error::provider(
                        &self.name,
                        format!(
                            "Output '{}' of '{}' is not available for parameter '{}'",
                            import.output, import.from_unit, import.parameter
                        ),
                    )
                })?;
            out.insert(import.parameter.clone(), value.clone());
        }
        Ok(out)
    }
}

/// names of the two units of an environment. They only depend on the
/// configuration, so teardown and publish can find the stacks without
/// re-composing the site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitNames {
    pub certificates: String,
    pub web: String,
}

impl UnitNames {
    pub fn new(config: &SiteConfig, environment: &EnvironmentName) -> Result<Self> {
        let prefix = &config.site.stack_prefix;
        let certificates = format!("{prefix}-{environment}-certificates");
        let web = format!("{prefix}-{environment}-web");
        validate_stack_name(&certificates).map_err(Error::Configuration)?;
        validate_stack_name(&web).map_err(Error::Configuration)?;
        Ok(Self { certificates, web })
    }
}

/// the fully wired site of one environment.
#[derive(Debug, Clone)]
pub struct SiteApp {
    pub environment: EnvironmentName,
    pub hostname: Hostname,
    pub zone: HostedZone,
    pub units: Vec<StackUnit>,
    pub certificate: CertificateHandle,
    pub bucket: BucketRef,
    pub distribution: DistributionHandle,
    pub record: AliasRecordRef,
}

/// Wires certificate, origin, distribution and alias record for
/// `environment`. Bucket and identity have no dependency on the
/// certificate; the distribution imports it across the unit boundary.
pub fn compose(config: &SiteConfig, environment: &EnvironmentName, zone: &HostedZone) -> Result<SiteApp> {
    let names = UnitNames::new(config, environment)?;
    let domain = config.site_domain();
    let host = hostname(environment, &domain);
    let entry_document = &config.site.entry_document;

    let mut certificates = StackUnit::new(&names.certificates, CERTIFICATE_REGION);
    certificates.template.description = Some(format!("TLS certificate for {host}"));
    let certificate = acm_cert::provision(&mut certificates, environment, &domain, zone)?;

    let mut web = StackUnit::new(&names.web, &config.site.deploy_region);
    web.template.description = Some(format!("static site {host}"));
    let bucket = s3_bucket::create_bucket(&mut web, true)?;
    let identity = s3_bucket::create_origin_access_identity(&mut web, &format!("read access for {host}"))?;
    s3_bucket::grant_read(&mut web, &bucket, &identity)?;
    let distribution = cloudfront::create(
        &mut web,
        &bucket,
        &identity,
        &certificate,
        std::slice::from_ref(&host),
        entry_document,
    )?;
    let record = route53::bind(&mut web, zone, &host, &distribution)?;

    web.template.add_output(BUCKET_NAME_OUTPUT, "bucket holding the site artifacts", get_ref(&bucket.logical_id));
    web.template.add_output(DISTRIBUTION_ID_OUTPUT, "distribution serving the site", get_ref(&distribution.logical_id));
    web.template.add_output(
        DISTRIBUTION_DOMAIN_OUTPUT,
        "edge domain of the distribution",
        get_att(&distribution.logical_id, "DomainName"),
    );
    web.template.add_output(SITE_HOSTNAME_OUTPUT, "public hostname of the site", json!(host.as_str()));

    for unit in [&certificates, &web] {
        unit.template.validate(&unit.name)?;
    }

    let app = SiteApp {
        environment: environment.clone(),
        hostname: host,
        zone: zone.clone(),
        units: vec![certificates, web],
        certificate,
        bucket,
        distribution,
        record,
    };
    // rejects cycles before anything is submitted
    app.graph()?.topological_order()?;
    info!(environment = %app.environment, hostname = %app.hostname, "composed site");
    Ok(app)
}

impl SiteApp {
    pub fn graph(&self) -> Result<ResourceGraph> {
        ResourceGraph::from_units(&self.units)
    }

    pub fn unit(&self, name: &str) -> Option<&StackUnit> {
        self.units.iter().find(|u| u.name == name)
    }

    pub fn certificate_unit(&self) -> Result<&StackUnit> {
        self.unit(self.certificate.unit())
            .ok_or_else(|| Error::template(self.certificate.unit(), "certificate unit missing"))
    }

    /// the unit owning the distribution
    pub fn web_unit(&self) -> Result<&StackUnit> {
        self.units
            .iter()
            .find(|u| u.template.resources.contains_key(&self.distribution.logical_id))
            .ok_or_else(|| Error::template(&self.distribution.logical_id, "web unit missing"))
    }

    pub fn certificate_address(&self) -> ResourceAddress {
        ResourceAddress::new(self.certificate.unit(), acm_cert::CERTIFICATE_LOGICAL_ID)
    }

    pub fn distribution_address(&self) -> Result<ResourceAddress> {
        Ok(ResourceAddress::new(&self.web_unit()?.name, &self.distribution.logical_id))
    }

    pub fn record_address(&self) -> Result<ResourceAddress> {
        Ok(ResourceAddress::new(&self.web_unit()?.name, &self.record.logical_id))
    }

    /// units in the order they have to be deployed.
    pub fn deployment_order(&self) -> Result<Vec<&StackUnit>> {
        let order = self.graph()?.unit_order()?;
        order
            .iter()
            .map(|name| {
                self.unit(name)
                    .ok_or_else(|| Error::template(name, "unit missing from the app"))
            })
            .collect()
    }

    /// Writes one `<stack>.template.json` per unit plus `manifest.json`
    /// describing regions, imports and the deployment order.
    pub fn synth<P: AsRef<Path>>(&self, out_dir: P) -> Result<Vec<PathBuf>> {
        let out_dir = out_dir.as_ref();
        let write = |path: PathBuf, contents: String| -> Result<PathBuf> {
            std::fs::write(&path, contents).map_err(|source| Error::Artifact {
                path: path.clone(),
                source,
            })?;
            debug!(path = ?path, "wrote synth output");
            Ok(path)
        };
        std::fs::create_dir_all(out_dir).map_err(|source| Error::Artifact {
            path: out_dir.to_path_buf(),
            source,
        })?;
        let mut written = vec![];
        for unit in self.units.iter() {
            let path = out_dir.join(format!("{}.template.json", unit.name));
            written.push(write(path, unit.template.to_json_pretty()?)?);
        }
        let manifest = serde_json::to_string_pretty(&self.manifest()?)
            .map_err(|e| Error::template("", format!("Failed to serialize manifest\n{e}")))?;
        written.push(write(out_dir.join("manifest.json"), manifest)?);
        Ok(written)
    }

    pub fn manifest(&self) -> Result<serde_json::Value> {
        let graph = self.graph()?;
        let order: Vec<String> = graph
            .topological_order()?
            .iter()
            .map(|a| a.to_string())
            .collect();
        let units: Vec<serde_json::Value> = self
            .deployment_order()?
            .iter()
            .map(|u| {
                json!({
                    "name": u.name,
                    "region": u.region,
                    "template": format!("{}.template.json", u.name),
                    "imports": u.imports,
                })
            })
            .collect();
        Ok(json!({
            "environment": self.environment.as_str(),
            "hostname": self.hostname.as_str(),
            "hostedZone": self.zone,
            "certificate": self.certificate,
            "units": units,
            "resourceOrder": order,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{
        ALIAS_RECORD_LOGICAL_ID, BUCKET_LOGICAL_ID, CERTIFICATE_LOGICAL_ID, DISTRIBUTION_LOGICAL_ID,
        ORIGIN_ACCESS_IDENTITY_LOGICAL_ID,
    };

    fn config() -> SiteConfig {
        SiteConfig::from_toml_str(
            r#"
[site]
apex_domain = "example.house"
app_label = "ledger"
"#,
        )
        .unwrap()
    }

    fn zone() -> HostedZone {
        HostedZone::new("/hostedzone/Z0123", "example.house.")
    }

    fn app(env: &str) -> SiteApp {
        compose(&config(), &EnvironmentName::new(env).unwrap(), &zone()).unwrap()
    }

    #[test]
    fn units_are_split_across_regions() {
        let app = app("dev");
        let certs = app.certificate_unit().unwrap();
        let web = app.web_unit().unwrap();
        assert_eq!(certs.name, "SiteStack-dev-certificates");
        assert_eq!(certs.region, CERTIFICATE_REGION);
        assert_eq!(web.name, "SiteStack-dev-web");
        assert_eq!(web.region, "us-west-1");
        assert!(certs.template.resources.contains_key(CERTIFICATE_LOGICAL_ID));
        assert!(!web.template.resources.contains_key(CERTIFICATE_LOGICAL_ID));
        assert_eq!(web.imports.len(), 1);
        assert_eq!(web.imports[0].from_unit, certs.name);
    }

    #[test]
    fn all_three_agree_on_the_hostname() {
        for env in ["dev", "staging", "prod"] {
            let app = app(env);
            let expected = app.hostname.as_str().to_string();
            let certs = app.certificate_unit().unwrap();
            let web = app.web_unit().unwrap();
            let cert_domain = &certs.template.resources[CERTIFICATE_LOGICAL_ID].properties["DomainName"];
            let alias = &web.template.resources[DISTRIBUTION_LOGICAL_ID].properties["DistributionConfig"]["Aliases"][0];
            let record = &web.template.resources[ALIAS_RECORD_LOGICAL_ID].properties["Name"];
            assert_eq!(cert_domain, &json!(expected));
            assert_eq!(alias, &json!(expected));
            assert_eq!(record, &json!(format!("{expected}.")));
        }
        assert_eq!(app("prod").hostname.as_str(), "ledger.example.house");
    }

    #[test]
    fn distribution_depends_on_certificate_but_origin_does_not() {
        let app = app("dev");
        let graph = app.graph().unwrap();
        let dist = app.distribution_address().unwrap();
        let record = app.record_address().unwrap();
        let cert = app.certificate_address();
        assert!(graph.depends_on(&dist, &cert));
        assert!(graph.depends_on(&record, &dist));
        let web = &app.web_unit().unwrap().name;
        for independent in [BUCKET_LOGICAL_ID, ORIGIN_ACCESS_IDENTITY_LOGICAL_ID] {
            assert!(!graph.depends_on(&ResourceAddress::new(web, independent), &cert));
        }
    }

    #[test]
    fn certificate_unit_deploys_first() {
        let app = app("dev");
        let order: Vec<&str> = app.deployment_order().unwrap().iter().map(|u| u.name.as_str()).collect();
        assert_eq!(order, vec!["SiteStack-dev-certificates", "SiteStack-dev-web"]);
    }

    #[test]
    fn parameters_come_from_exporter_outputs() {
        let app = app("dev");
        let web = app.web_unit().unwrap();
        let mut deployed = BTreeMap::new();
        assert!(web.parameter_values(&deployed).is_err());
        let mut outputs = BTreeMap::new();
        outputs.insert(acm_cert::CERTIFICATE_ARN_OUTPUT.to_string(), "arn:aws:acm:us-east-1:123456789012:certificate/abc".to_string());
        deployed.insert(app.certificate.unit().to_string(), outputs);
        let params = web.parameter_values(&deployed).unwrap();
        assert_eq!(
            params.get(acm_cert::CERTIFICATE_ARN_PARAMETER).map(|s| s.as_str()),
            Some("arn:aws:acm:us-east-1:123456789012:certificate/abc")
        );
    }

    #[test]
    fn hostname_outside_the_zone_fails() {
        let other = HostedZone::new("Z9", "other.house");
        let err = compose(&config(), &EnvironmentName::new("dev").unwrap(), &other).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn synth_writes_templates_and_manifest() {
        let app = app("dev");
        let dir = tempfile::tempdir().unwrap();
        let written = app.synth(dir.path()).unwrap();
        assert_eq!(written.len(), 3);
        let manifest: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join("manifest.json")).unwrap()).unwrap();
        assert_eq!(manifest["units"][0]["region"], CERTIFICATE_REGION);
        assert_eq!(manifest["units"][1]["imports"][0]["parameter"], "CertificateArn");
        let web: Template = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join("SiteStack-dev-web.template.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(&web, &app.web_unit().unwrap().template);
    }
}
