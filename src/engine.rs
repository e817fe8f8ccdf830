//! A provisioning run: look up the zone, compose the site, deploy the units
//! in dependency order while polling each stack, then publish.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::SiteConfig;
use crate::environment::{resolve, EnvironmentName, ProvisioningContext};
use crate::error::{Error, Result};
use crate::provider::{CloudProvider, StackState, Submission};
use crate::publish::{collect_artifacts, PublishReport, Publisher};
use crate::regions::CERTIFICATE_REGION;
use crate::resources::HostedZone;
use crate::stack::{
    compose, SiteApp, StackUnit, UnitNames, BUCKET_NAME_OUTPUT, DISTRIBUTION_DOMAIN_OUTPUT,
    DISTRIBUTION_ID_OUTPUT, SITE_HOSTNAME_OUTPUT,
};

const TIMED_OUT: &str = "timed out waiting for the stack to finish";

/// outputs of a deployed web unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WebOutputs {
    pub stack_name: String,
    pub region: String,
    pub bucket_name: String,
    pub distribution_id: String,
    pub distribution_domain_name: String,
    pub site_hostname: String,
}

impl WebOutputs {
    fn from_outputs(stack_name: &str, region: &str, outputs: &BTreeMap<String, String>) -> Result<Self> {
        let get = |key: &str| {
            outputs.get(key).cloned().ok_or_else(|| {
                Error::provider(stack_name, format!("Stack has no output '{key}'"))
            })
        };
        Ok(Self {
            stack_name: stack_name.to_string(),
            region: region.to_string(),
            bucket_name: get(BUCKET_NAME_OUTPUT)?,
            distribution_id: get(DISTRIBUTION_ID_OUTPUT)?,
            distribution_domain_name: get(DISTRIBUTION_DOMAIN_OUTPUT)?,
            site_hostname: get(SITE_HOSTNAME_OUTPUT)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitReport {
    pub name: String,
    pub region: String,
    pub changed: bool,
    pub outputs: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeployReport {
    pub environment: String,
    pub hostname: String,
    pub units: Vec<UnitReport>,
    pub web: WebOutputs,
    pub publish: Option<PublishReport>,
}

pub struct Provisioner<'a, P: ?Sized> {
    provider: &'a P,
    config: &'a SiteConfig,
    stack_timeout: Duration,
    poll_interval: Duration,
}

impl<'a, P: CloudProvider + ?Sized> Provisioner<'a, P> {
    pub fn new(provider: &'a P, config: &'a SiteConfig) -> Self {
        Self {
            provider,
            config,
            stack_timeout: config.deploy.stack_timeout(),
            poll_interval: config.deploy.poll_interval(),
        }
    }

    /// overrides the timeouts of `[deploy]`.
    pub fn with_timeouts(mut self, stack_timeout: Duration, poll_interval: Duration) -> Self {
        self.stack_timeout = stack_timeout;
        self.poll_interval = poll_interval;
        self
    }

    pub async fn hosted_zone(&self) -> Result<HostedZone> {
        let domain = &self.config.site.apex_domain;
        let zone = self.provider.find_hosted_zone(domain).await?.ok_or_else(|| Error::Lookup {
            domain: domain.clone(),
            reason: "no hosted zone with that name in this account".into(),
        })?;
        info!(zone_id = %zone.id, zone = %zone.name, "found hosted zone");
        Ok(zone)
    }

    /// composes the site against the live hosted zone.
    pub async fn compose(&self, environment: &EnvironmentName) -> Result<SiteApp> {
        let zone = self.hosted_zone().await?;
        compose(self.config, environment, &zone)
    }

    pub async fn synth<D: AsRef<Path>>(&self, environment: &EnvironmentName, out_dir: D) -> Result<SiteApp> {
        let app = self.compose(environment).await?;
        let written = app.synth(out_dir)?;
        info!(files = written.len(), "synthesized templates");
        Ok(app)
    }

    /// Deploys both units in order. With `publish` the artifacts are
    /// mirrored into the bucket afterwards; their directory is checked
    /// before anything is provisioned.
    pub async fn deploy(&self, environment: &EnvironmentName, publish: bool) -> Result<DeployReport> {
        if publish {
            collect_artifacts(&self.config.site.artifact_dir, &self.config.site.entry_document)?;
        }
        let app = self.compose(environment).await?;
        info!(environment = %environment, hostname = %app.hostname, "deploying site");

        let mut deployed: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        let mut units = vec![];
        for unit in app.deployment_order()? {
            let report = self.deploy_unit(&app, unit, &deployed).await?;
            deployed.insert(report.name.clone(), report.outputs.clone());
            units.push(report);
        }

        let web_unit = app.web_unit()?;
        let web_outputs = deployed.get(&web_unit.name).cloned().unwrap_or_default();
        let web = WebOutputs::from_outputs(&web_unit.name, &web_unit.region, &web_outputs)?;

        let publish = if publish {
            Some(self.publish_to(&web).await?)
        } else {
            None
        };
        Ok(DeployReport {
            environment: environment.to_string(),
            hostname: app.hostname.to_string(),
            units,
            web,
            publish,
        })
    }

    /// resolves the environment from `context`, then deploys it. A missing
    /// or invalid environment fails before any provider call.
    pub async fn deploy_from_context(&self, context: &ProvisioningContext, publish: bool) -> Result<DeployReport> {
        let environment = resolve(context)?;
        self.deploy(&environment, publish).await
    }

    async fn deploy_unit(
        &self,
        app: &SiteApp,
        unit: &StackUnit,
        deployed: &BTreeMap<String, BTreeMap<String, String>>,
    ) -> Result<UnitReport> {
        let parameters = unit.parameter_values(deployed)?;
        // we make it pretty so if a user needs to look at the stack in the console, it looks nice
        let body = unit.template.to_json_pretty()?;
        info!(stack = %unit.name, region = %unit.region, "submitting stack");
        let submission = self
            .provider
            .submit_stack(&unit.region, &unit.name, &body, &parameters)
            .await?;
        let outputs = match submission {
            Submission::NoChanges => {
                info!(stack = %unit.name, "stack is up to date");
                let state = self.provider.stack_state(&unit.region, &unit.name).await?;
                match state.stable_outputs() {
                    Some(outputs) => outputs.clone(),
                    None => {
                        return Err(Error::provider(
                            &unit.name,
                            format!("Stack reported no changes but is {:?}", state),
                        ))
                    }
                }
            }
            Submission::Started => {
                let is_certificate_unit = unit.name == app.certificate.unit();
                match self.wait_for_stack(unit).await {
                    Err(Error::Provider { message, .. }) if message == TIMED_OUT && is_certificate_unit => {
                        return Err(Error::ValidationTimeout {
                            stack: unit.name.clone(),
                            domain: app.certificate.domain_name().to_string(),
                            waited: self.stack_timeout,
                        });
                    }
                    other => other?,
                }
            }
        };
        info!(stack = %unit.name, outputs = outputs.len(), "stack complete");
        Ok(UnitReport {
            name: unit.name.clone(),
            region: unit.region.clone(),
            changed: submission == Submission::Started,
            outputs,
        })
    }

    async fn wait_for_stack(&self, unit: &StackUnit) -> Result<BTreeMap<String, String>> {
        let started = Instant::now();
        loop {
            tokio::time::sleep(self.poll_interval).await;
            match self.provider.stack_state(&unit.region, &unit.name).await? {
                StackState::Complete { outputs } => return Ok(outputs),
                // a rolled back update still serves, but the change we submitted failed
                StackState::Failed { reason, resource } | StackState::RolledBack { reason, resource, .. } => {
                    let resource = match resource {
                        Some(r) => format!("{}/{r}", unit.name),
                        None => unit.name.clone(),
                    };
                    return Err(Error::Provider { resource, message: reason });
                }
                StackState::Missing => {
                    return Err(Error::provider(&unit.name, "Stack disappeared while it was being deployed"));
                }
                StackState::InProgress { status } => {
                    debug!(stack = %unit.name, status = %status, waited = ?started.elapsed(), "waiting for stack");
                    if started.elapsed() >= self.stack_timeout {
                        warn!(stack = %unit.name, status = %status, "stack timed out");
                        return Err(Error::provider(&unit.name, TIMED_OUT));
                    }
                }
            }
        }
    }

    /// outputs of the deployed web unit of `environment`.
    pub async fn web_outputs(&self, environment: &EnvironmentName) -> Result<WebOutputs> {
        let names = UnitNames::new(self.config, environment)?;
        let region = &self.config.site.deploy_region;
        let state = self.provider.stack_state(region, &names.web).await?;
        if let StackState::RolledBack { reason, .. } = &state {
            warn!(stack = %names.web, reason = %reason, "last update was rolled back, using the previous outputs");
        }
        match (state.stable_outputs(), &state) {
            (Some(outputs), _) => WebOutputs::from_outputs(&names.web, region, outputs),
            (None, StackState::Missing) => Err(Error::provider(
                &names.web,
                format!("Environment {environment} is not deployed"),
            )),
            (None, other) => Err(Error::provider(&names.web, format!("Stack is not ready: {:?}", other))),
        }
    }

    /// publishes the artifacts to an already deployed environment.
    pub async fn publish(&self, environment: &EnvironmentName) -> Result<PublishReport> {
        collect_artifacts(&self.config.site.artifact_dir, &self.config.site.entry_document)?;
        let web = self.web_outputs(environment).await?;
        self.publish_to(&web).await
    }

    async fn publish_to(&self, web: &WebOutputs) -> Result<PublishReport> {
        let deploy = &self.config.deploy;
        Publisher::new(self.provider, &web.region, &web.bucket_name, &web.distribution_id)
            .wait_for_invalidation(deploy.wait_for_invalidation, self.poll_interval, self.stack_timeout)
            .publish(&self.config.site.artifact_dir, &self.config.site.entry_document)
            .await
    }

    /// Deletes the web unit, then the certificate unit. The certificate
    /// cannot go while a distribution still uses it.
    pub async fn destroy(&self, environment: &EnvironmentName) -> Result<()> {
        let names = UnitNames::new(self.config, environment)?;
        let units = [
            (names.web, self.config.site.deploy_region.clone()),
            (names.certificates, CERTIFICATE_REGION.to_string()),
        ];
        for (name, region) in units.iter() {
            if self.provider.stack_state(region, name).await? == StackState::Missing {
                info!(stack = %name, "stack does not exist, skipping");
                continue;
            }
            self.provider.delete_stack(region, name).await?;
            self.wait_for_deletion(region, name).await?;
            info!(stack = %name, "stack deleted");
        }
        Ok(())
    }

    async fn wait_for_deletion(&self, region: &str, name: &str) -> Result<()> {
        let started = Instant::now();
        loop {
            tokio::time::sleep(self.poll_interval).await;
            match self.provider.stack_state(region, name).await? {
                StackState::Missing => return Ok(()),
                StackState::Failed { reason, resource } => {
                    let resource = match resource {
                        Some(r) => format!("{name}/{r}"),
                        None => name.to_string(),
                    };
                    return Err(Error::Provider { resource, message: reason });
                }
                state => {
                    debug!(stack = name, state = ?state, "waiting for deletion");
                    if started.elapsed() >= self.stack_timeout {
                        return Err(Error::provider(name, TIMED_OUT));
                    }
                }
            }
        }
    }
}

