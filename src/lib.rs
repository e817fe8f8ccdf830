//! Declares and provisions a static single page application behind
//! CloudFront, on an environment-scoped HTTPS hostname.
//!
//! The site is split in two CloudFormation stacks: one in `us-east-1` for
//! the certificate, one in the configured region for the bucket,
//! distribution and alias record. The certificate crosses the region
//! boundary as a stack parameter.

pub mod config;
pub mod engine;
pub mod environment;
pub mod error;
pub mod graph;
pub mod naming;
pub mod provider;
pub mod publish;
pub mod regions;
pub mod resources;
pub mod stack;
pub mod template;
pub mod verify;

pub use config::SiteConfig;
pub use engine::{DeployReport, Provisioner, WebOutputs};
pub use environment::{resolve, EnvironmentName, ProvisioningContext};
pub use error::{Error, Result};
pub use naming::{hostname, Hostname, SiteDomain};
pub use provider::{AwsProvider, CloudProvider, MemoryProvider};
pub use stack::{compose, SiteApp};
