//! The one hostname rule shared by the certificate, the distribution
//! and the alias record.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::environment::EnvironmentName;

/// the only environment served directly under the app label.
pub const PRODUCTION_ENVIRONMENT: &str = "prod";

/// apex domain (the hosted zone) plus the application label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteDomain {
    pub apex: String,
    pub label: String,
}

impl SiteDomain {
    pub fn new<A: AsRef<str>, L: AsRef<str>>(apex: A, label: L) -> Self {
        Self {
            apex: apex.as_ref().trim_end_matches('.').to_string(),
            label: label.as_ref().to_string(),
        }
    }
}

/// fully qualified hostname of the site for one environment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Hostname(String);

impl Hostname {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// hosted zones address records in absolute form, ie: with a trailing dot.
    pub fn record_name(&self) -> String {
        format!("{}.", self.0)
    }
}

impl fmt::Display for Hostname {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// `prod` => `label.apex`, anything else => `label.environment.apex`
pub fn hostname(environment: &EnvironmentName, domain: &SiteDomain) -> Hostname {
    let SiteDomain { apex, label } = domain;
    if environment.as_str() == PRODUCTION_ENVIRONMENT {
        Hostname(format!("{label}.{apex}"))
    } else {
        Hostname(format!("{label}.{environment}.{apex}"))
    }
}
