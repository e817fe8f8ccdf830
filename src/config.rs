use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::environment::ProvisioningContext;
use crate::error::{Error, Result};
use crate::naming::SiteDomain;
use crate::regions::verify_region;
use crate::template::validate_stack_name;

pub const DEFAULT_CONFIG_FILE: &str = "site.toml";

/// contents of `site.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SiteConfig {
    pub site: SiteSettings,
    #[serde(default)]
    pub deploy: DeploySettings,
    /// default provisioning context values. lowest precedence.
    #[serde(default)]
    pub context: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SiteSettings {
    /// domain of the pre-existing hosted zone, eg: `example.com`
    pub apex_domain: String,
    /// first label of every site hostname, eg: `app` => `app.dev.example.com`
    pub app_label: String,
    #[serde(default = "default_entry_document")]
    pub entry_document: String,
    /// directory of pre-built static assets. relative paths are resolved
    /// against the directory holding the config file.
    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: PathBuf,
    #[serde(default = "default_stack_prefix")]
    pub stack_prefix: String,
    /// region of the bucket, distribution and record stack.
    #[serde(default = "default_deploy_region")]
    pub deploy_region: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeploySettings {
    /// how long a single stack may stay in progress before the run fails.
    /// certificate validation usually dominates this.
    #[serde(default = "default_stack_timeout_secs")]
    pub stack_timeout_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub wait_for_invalidation: bool,
}

impl Default for DeploySettings {
    fn default() -> Self {
        Self {
            stack_timeout_secs: default_stack_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            wait_for_invalidation: false,
        }
    }
}

impl DeploySettings {
    pub fn stack_timeout(&self) -> Duration {
        Duration::from_secs(self.stack_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn default_entry_document() -> String {
    "index.html".into()
}
fn default_artifact_dir() -> PathBuf {
    PathBuf::from("build")
}
fn default_stack_prefix() -> String {
    "SiteStack".into()
}
fn default_deploy_region() -> String {
    "us-west-1".into()
}
fn default_stack_timeout_secs() -> u64 {
    45 * 60
}
fn default_poll_interval_ms() -> u64 {
    5000
}

impl SiteConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: SiteConfig = toml::from_str(s)
            .map_err(|e| Error::Configuration(format!("Failed to parse site config\n{e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("Failed to read site config {:?}\n{e}", path))
        })?;
        let mut config = Self::from_toml_str(&contents)?;
        if config.site.artifact_dir.is_relative() {
            if let Some(base) = path.parent() {
                config.site.artifact_dir = base.join(&config.site.artifact_dir);
            }
        }
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let SiteSettings {
            apex_domain,
            app_label,
            entry_document,
            stack_prefix,
            deploy_region,
            ..
        } = &self.site;
        if apex_domain.trim_end_matches('.').is_empty() || !apex_domain.contains('.') {
            return Err(Error::Configuration(format!(
                "Invalid apex domain {:?}. Must be a domain such as example.com",
                apex_domain
            )));
        }
        let label_ok = !app_label.is_empty()
            && app_label.len() <= 63
            && app_label
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
            && !app_label.starts_with('-')
            && !app_label.ends_with('-');
        if !label_ok {
            return Err(Error::Configuration(format!(
                "Invalid app label {:?}. Must be a single lowercase DNS label",
                app_label
            )));
        }
        if entry_document.is_empty() || entry_document.contains('/') {
            return Err(Error::Configuration(format!(
                "Invalid entry document {:?}. Must be a file name at the root of the artifacts",
                entry_document
            )));
        }
        validate_stack_name(stack_prefix).map_err(Error::Configuration)?;
        verify_region(deploy_region)?;
        if self.deploy.poll_interval_ms == 0 {
            return Err(Error::Configuration("poll_interval_ms must be greater than 0".into()));
        }
        Ok(())
    }

    pub fn site_domain(&self) -> SiteDomain {
        SiteDomain::new(&self.site.apex_domain, &self.site.app_label)
    }

    /// The provisioning context of a run: `[context]` defaults, then the
    /// `.env` style file, then `key=value` pairs. Later layers win.
    pub fn provisioning_context<S: AsRef<str>>(
        &self,
        env_file: Option<&Path>,
        pairs: &[S],
    ) -> Result<ProvisioningContext> {
        let mut context = ProvisioningContext::new();
        context.merge(self.context.iter());
        if let Some(path) = env_file {
            context.load_dot_env(path)?;
        }
        for pair in pairs {
            context.merge([ProvisioningContext::parse_pair(pair.as_ref())?]);
        }
        Ok(context)
    }
}
