use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use tracing::debug;

use crate::error::{Error, Result};

/// context key holding the deployment environment name.
pub const ENVIRONMENT_CONTEXT_KEY: &str = "app-environment";

/// key/value provisioning context. later layers override earlier ones.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisioningContext {
    values: BTreeMap<String, String>,
}

impl ProvisioningContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set<K: AsRef<str>, V: AsRef<str>>(&mut self, key: K, val: V) {
        self.values.insert(key.as_ref().into(), val.as_ref().into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|s| s.as_str())
    }

    /// merges every pair of `layer` on top of this context.
    pub fn merge<I, K, V>(&mut self, layer: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, val) in layer {
            self.set(key, val);
        }
    }

    /// parses `KEY=value` lines. blank lines and lines starting
    /// with `#` are skipped, surrounding quotes on the value are dropped.
    pub fn parse_dot_env(contents: &str) -> Vec<(String, String)> {
        let mut out = vec![];
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, val)) = line.split_once('=') {
                let val = val.trim();
                let val = val
                    .strip_prefix('"')
                    .and_then(|v| v.strip_suffix('"'))
                    .unwrap_or(val);
                out.push((key.trim().to_string(), val.to_string()));
            }
        }
        out
    }

    pub fn load_dot_env<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("Failed to load .env file {:?}: {}", path, e))
        })?;
        let pairs = Self::parse_dot_env(&contents);
        debug!(path = ?path, count = pairs.len(), "loaded context file");
        self.merge(pairs);
        Ok(())
    }

    /// parses a `key=value` pair as given on the command line.
    pub fn parse_pair(s: &str) -> Result<(String, String)> {
        match s.split_once('=') {
            Some((key, val)) if !key.trim().is_empty() => {
                Ok((key.trim().to_string(), val.to_string()))
            }
            _ => Err(Error::Configuration(format!(
                "Invalid context pair {:?}. Expected key=value",
                s
            ))),
        }
    }
}

/// validated name of the deployment target, e.g. `dev` or `prod`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EnvironmentName(String);

impl EnvironmentName {
    pub fn new<S: AsRef<str>>(name: S) -> Result<Self> {
        let name = name.as_ref().trim();
        if name.is_empty() {
            return Err(Error::Configuration(format!(
                "Environment context variable '{ENVIRONMENT_CONTEXT_KEY}' is required."
            )));
        }
        // the name becomes one label of the site hostname.
        let restriction = "Must only consist of lowercase letters, digits and hyphens, must not start or end with a hyphen, and cannot be longer than 63 characters.";
        let valid_chars = name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
        if !valid_chars || name.len() > 63 || name.starts_with('-') || name.ends_with('-') {
            return Err(Error::Configuration(format!(
                "Invalid environment name {:?}\n{}",
                name, restriction
            )));
        }
        Ok(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EnvironmentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// reads the environment name from the context. A missing value is a
/// caller mistake and aborts the run.
pub fn resolve(context: &ProvisioningContext) -> Result<EnvironmentName> {
    let raw = context.get(ENVIRONMENT_CONTEXT_KEY).unwrap_or_default();
    EnvironmentName::new(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_environment_is_a_configuration_error() {
        let ctx = ProvisioningContext::new();
        let err = resolve(&ctx).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(err.to_string().contains(ENVIRONMENT_CONTEXT_KEY));
    }

    #[test]
    fn empty_or_blank_environment_is_rejected() {
        for val in ["", "   "] {
            let mut ctx = ProvisioningContext::new();
            ctx.set(ENVIRONMENT_CONTEXT_KEY, val);
            assert!(matches!(resolve(&ctx), Err(Error::Configuration(_))));
        }
    }

    #[test]
    fn environment_must_be_a_dns_label() {
        assert!(EnvironmentName::new("staging").is_ok());
        assert!(EnvironmentName::new("pr-42").is_ok());
        assert!(EnvironmentName::new("Dev").is_err());
        assert!(EnvironmentName::new("-dev").is_err());
        assert!(EnvironmentName::new("dev.eu").is_err());
        assert!(EnvironmentName::new("a".repeat(64)).is_err());
    }

    #[test]
    fn later_layers_win() {
        let mut ctx = ProvisioningContext::new();
        ctx.set(ENVIRONMENT_CONTEXT_KEY, "dev");
        let dot_env = ProvisioningContext::parse_dot_env(
            "# comment\n\napp-environment=\"staging\"\nOTHER=1\n",
        );
        ctx.merge(dot_env);
        assert_eq!(resolve(&ctx).unwrap().as_str(), "staging");
        let pair = ProvisioningContext::parse_pair("app-environment=prod").unwrap();
        ctx.merge([pair]);
        assert_eq!(resolve(&ctx).unwrap().as_str(), "prod");
        assert_eq!(ctx.get("OTHER"), Some("1"));
    }

    #[test]
    fn context_pair_needs_a_key() {
        assert!(ProvisioningContext::parse_pair("=dev").is_err());
        assert!(ProvisioningContext::parse_pair("nokey").is_err());
        let (k, v) = ProvisioningContext::parse_pair("a=b=c").unwrap();
        assert_eq!((k.as_str(), v.as_str()), ("a", "b=c"));
    }
}
