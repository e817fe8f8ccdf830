use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Every failure aborts the provisioning run. Nothing here is retried.
#[derive(Error, Debug)]
pub enum Error {
    /// Missing or malformed input, detected before any resource call.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The referenced hosted zone does not exist in the account.
    #[error("hosted zone lookup failed for '{domain}': {reason}")]
    Lookup { domain: String, reason: String },

    /// DNS validation of the certificate never completed. The operator has
    /// to fix the validation records out of band and re-run.
    #[error("certificate for '{domain}' in stack '{stack}' was not validated within {}s", .waited.as_secs())]
    ValidationTimeout {
        stack: String,
        domain: String,
        waited: Duration,
    },

    /// A control-plane call failed. `resource` names the failing stack or
    /// logical resource.
    #[error("provider error on '{resource}': {message}")]
    Provider { resource: String, message: String },

    /// Synthesis produced an invalid template.
    #[error("invalid template for stack '{stack}': {reason}")]
    Template { stack: String, reason: String },

    #[error("failed to read artifact {path:?}: {source}")]
    Artifact {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub fn provider(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Provider {
            resource: resource.into(),
            message: message.into(),
        }
    }

    pub fn template(stack: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Template {
            stack: stack.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
