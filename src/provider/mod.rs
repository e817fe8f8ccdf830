//! The cloud control plane as seen by the engine and the publisher.
//! `aws` talks to the real services, `memory` simulates them for tests.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::Result;
use crate::resources::HostedZone;

pub mod aws;
pub mod memory;

pub use aws::AwsProvider;
pub use memory::MemoryProvider;

/// user metadata key holding the base64 SHA-256 of an uploaded object.
pub const CHECKSUM_METADATA_KEY: &str = "sha256";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackState {
    Missing,
    InProgress { status: String },
    Complete { outputs: BTreeMap<String, String> },
    Failed {
        reason: String,
        /// logical id of the resource that failed, when the provider knows it.
        resource: Option<String>,
    },
    /// the last update failed and was rolled back. The stack is stable and
    /// still holds the outputs of the previous good change.
    RolledBack {
        reason: String,
        resource: Option<String>,
        outputs: BTreeMap<String, String>,
    },
}

impl StackState {
    /// outputs of a stack that is stable and usable, rolled back or not.
    pub fn stable_outputs(&self) -> Option<&BTreeMap<String, String>> {
        match self {
            StackState::Complete { outputs } | StackState::RolledBack { outputs, .. } => Some(outputs),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    Started,
    /// the stack already matches the template and parameters.
    NoChanges,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    pub key: String,
    /// value of the checksum metadata, absent for objects not uploaded by us.
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectUpload {
    pub key: String,
    pub body: Vec<u8>,
    pub content_type: String,
    /// base64 SHA-256 of `body`
    pub checksum: String,
}

#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// the public hosted zone named exactly `domain`, if one exists.
    async fn find_hosted_zone(&self, domain: &str) -> Result<Option<HostedZone>>;

    /// creates the stack, or updates it if it already exists.
    async fn submit_stack(
        &self,
        region: &str,
        name: &str,
        template_body: &str,
        parameters: &BTreeMap<String, String>,
    ) -> Result<Submission>;

    async fn stack_state(&self, region: &str, name: &str) -> Result<StackState>;

    async fn delete_stack(&self, region: &str, name: &str) -> Result<()>;

    async fn list_objects(&self, region: &str, bucket: &str) -> Result<Vec<RemoteObject>>;

    async fn put_object(&self, region: &str, bucket: &str, upload: ObjectUpload) -> Result<()>;

    async fn delete_object(&self, region: &str, bucket: &str, key: &str) -> Result<()>;

    /// returns the invalidation id.
    async fn create_invalidation(
        &self,
        distribution_id: &str,
        paths: &[String],
        caller_reference: &str,
    ) -> Result<String>;

    async fn invalidation_complete(&self, distribution_id: &str, invalidation_id: &str) -> Result<bool>;
}
