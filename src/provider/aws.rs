use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use aws_sdk_cloudformation::types::{Capability, OnFailure, Parameter, Stack, StackStatus};
use aws_sdk_cloudfront::types::{InvalidationBatch, Paths};
use aws_sdk_s3::primitives::ByteStream;
use tracing::{debug, info, warn};

use super::{CloudProvider, ObjectUpload, RemoteObject, StackState, Submission, CHECKSUM_METADATA_KEY};
use crate::error::{Error, Result};
use crate::regions::CERTIFICATE_REGION;
use crate::resources::HostedZone;

/// Route 53 and CloudFront are global services; their clients are pinned
/// to this region.
const GLOBAL_SERVICE_REGION: &str = CERTIFICATE_REGION;

/// Provider backed by the AWS SDK. One shared credential/config chain, one
/// client per region as units live in different regions.
pub struct AwsProvider {
    shared_config: aws_config::SdkConfig,
    /// how long replacing a rolled back stack may take.
    wait_timeout: Duration,
}

impl AwsProvider {
    pub async fn from_env() -> Self {
        let shared_config = aws_config::from_env().load().await;
        Self {
            shared_config,
            wait_timeout: Duration::from_secs(45 * 60),
        }
    }

    pub fn with_wait_timeout(mut self, wait_timeout: Duration) -> Self {
        self.wait_timeout = wait_timeout;
        self
    }

    /// deletes a stack left in ROLLBACK_COMPLETE and waits until it is gone.
    async fn remove_rolled_back(&self, client: &aws_sdk_cloudformation::Client, name: &str) -> Result<()> {
        warn!(stack = name, "replacing stack left in ROLLBACK_COMPLETE");
        client
            .delete_stack()
            .stack_name(name)
            .send()
            .await
            .map_err(|e| Error::provider(name, aws_sdk_cloudformation::error::DisplayErrorContext(&e).to_string()))?;
        let started = Instant::now();
        loop {
            let stack = match describe_stack(client, name).await? {
                None => return Ok(()),
                Some(s) => s,
            };
            match stack.stack_status() {
                Some(StackStatus::DeleteComplete) => return Ok(()),
                Some(StackStatus::DeleteFailed) => {
                    let reason = stack.stack_status_reason().unwrap_or("no reason given");
                    return Err(Error::provider(name, format!("DELETE_FAILED while replacing rolled back stack ({reason})")));
                }
                _ => {}
            }
            if started.elapsed() >= self.wait_timeout {
                return Err(Error::provider(name, "timed out deleting the rolled back stack"));
            }
            tokio::time::sleep(Duration::from_millis(700)).await;
        }
    }

    fn cfn(&self, region: &str) -> aws_sdk_cloudformation::Client {
        let conf = aws_sdk_cloudformation::config::Builder::from(&self.shared_config)
            .region(aws_sdk_cloudformation::config::Region::new(region.to_string()))
            .build();
        aws_sdk_cloudformation::Client::from_conf(conf)
    }

    fn s3(&self, region: &str) -> aws_sdk_s3::Client {
        let conf = aws_sdk_s3::config::Builder::from(&self.shared_config)
            .region(aws_sdk_s3::config::Region::new(region.to_string()))
            .build();
        aws_sdk_s3::Client::from_conf(conf)
    }

    fn cloudfront(&self) -> aws_sdk_cloudfront::Client {
        let conf = aws_sdk_cloudfront::config::Builder::from(&self.shared_config)
            .region(aws_sdk_cloudfront::config::Region::new(GLOBAL_SERVICE_REGION))
            .build();
        aws_sdk_cloudfront::Client::from_conf(conf)
    }

    fn route53(&self) -> aws_sdk_route53::Client {
        let conf = aws_sdk_route53::config::Builder::from(&self.shared_config)
            .region(aws_sdk_route53::config::Region::new(GLOBAL_SERVICE_REGION))
            .build();
        aws_sdk_route53::Client::from_conf(conf)
    }
}

async fn describe_stack(client: &aws_sdk_cloudformation::Client, name: &str) -> Result<Option<Stack>> {
    match client.describe_stacks().stack_name(name).send().await {
        Ok(d) => Ok(d.stacks().and_then(|s| s.first()).cloned()),
        Err(e) => {
            let e_str = aws_sdk_cloudformation::error::DisplayErrorContext(&e).to_string();
            if e_str.contains("does not exist") {
                return Ok(None);
            }
            Err(Error::provider(name, e_str))
        }
    }
}

/// The earliest failed resource event of the most recent stack operation.
/// Later failures are usually cancellations caused by that one.
async fn first_failed_resource(
    client: &aws_sdk_cloudformation::Client,
    name: &str,
) -> Option<(String, String)> {
    let resp = match client.describe_stack_events().stack_name(name).send().await {
        Ok(r) => r,
        Err(e) => {
            warn!(stack = name, error = %aws_sdk_cloudformation::error::DisplayErrorContext(&e), "failed to read stack events");
            return None;
        }
    };
    let mut found = None;
    // events are newest first
    for event in resp.stack_events().unwrap_or_default() {
        let status = event.resource_status().map(|s| s.as_str()).unwrap_or_default();
        let logical_id = event.logical_resource_id().unwrap_or_default();
        if logical_id == name && (status == "CREATE_IN_PROGRESS" || status == "UPDATE_IN_PROGRESS") {
            break;
        }
        if status.ends_with("_FAILED") && logical_id != name {
            let reason = event.resource_status_reason().unwrap_or("no reason given");
            found = Some((logical_id.to_string(), reason.to_string()));
        }
    }
    found
}

fn outputs_of(stack: &Stack) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for output in stack.outputs().unwrap_or_default() {
        if let (Some(key), Some(val)) = (output.output_key(), output.output_value()) {
            out.insert(key.to_string(), val.to_string());
        }
    }
    out
}

#[async_trait]
impl CloudProvider for AwsProvider {
    async fn find_hosted_zone(&self, domain: &str) -> Result<Option<HostedZone>> {
        let domain = domain.trim_end_matches('.');
        let resp = self
            .route53()
            .list_hosted_zones_by_name()
            .dns_name(domain)
            .send()
            .await
            .map_err(|e| Error::Lookup {
                domain: domain.to_string(),
                reason: aws_sdk_route53::error::DisplayErrorContext(&e).to_string(),
            })?;
        let zone = resp.hosted_zones().unwrap_or_default().iter().find_map(|z| {
            let name = z.name()?;
            let id = z.id()?;
            (name.trim_end_matches('.') == domain).then(|| HostedZone::new(id, name))
        });
        Ok(zone)
    }

    async fn submit_stack(
        &self,
        region: &str,
        name: &str,
        template_body: &str,
        parameters: &BTreeMap<String, String>,
    ) -> Result<Submission> {
        let client = self.cfn(region);
        let params: Vec<Parameter> = parameters
            .iter()
            .map(|(k, v)| Parameter::builder().parameter_key(k).parameter_value(v).build())
            .collect();

        let existing = describe_stack(&client, name).await?;
        // a stack whose creation rolled back cannot be updated, only replaced
        let existing = match existing {
            Some(stack) if stack.stack_status() == Some(&StackStatus::RollbackComplete) => {
                self.remove_rolled_back(&client, name).await?;
                None
            }
            other => other,
        };

        if existing.is_some() {
            info!(stack = name, region, "updating stack");
            match client
                .update_stack()
                .capabilities(Capability::CapabilityNamedIam)
                .capabilities(Capability::CapabilityIam)
                .stack_name(name)
                .template_body(template_body)
                .set_parameters(Some(params))
                .send()
                .await
            {
                Ok(_) => Ok(Submission::Started),
                Err(e) => {
                    let e_str = aws_sdk_cloudformation::error::DisplayErrorContext(&e).to_string();
                    if e_str.contains("No updates are to be performed") {
                        return Ok(Submission::NoChanges);
                    }
                    Err(Error::provider(name, e_str))
                }
            }
        } else {
            info!(stack = name, region, "creating stack");
            client
                .create_stack()
                .on_failure(OnFailure::Rollback)
                .capabilities(Capability::CapabilityNamedIam)
                .capabilities(Capability::CapabilityIam)
                .stack_name(name)
                .template_body(template_body)
                .set_parameters(Some(params))
                .send()
                .await
                .map_err(|e| Error::provider(name, aws_sdk_cloudformation::error::DisplayErrorContext(&e).to_string()))?;
            Ok(Submission::Started)
        }
    }

    async fn stack_state(&self, region: &str, name: &str) -> Result<StackState> {
        let client = self.cfn(region);
        let stack = match describe_stack(&client, name).await? {
            Some(s) => s,
            None => return Ok(StackState::Missing),
        };
        let status = match stack.stack_status() {
            Some(s) => s.clone(),
            None => return Err(Error::provider(name, format!("Stack {name} has no status"))),
        };
        let state = match status {
            StackStatus::DeleteComplete => StackState::Missing,
            StackStatus::CreateComplete | StackStatus::UpdateComplete | StackStatus::ImportComplete => {
                StackState::Complete { outputs: outputs_of(&stack) }
            }
            StackStatus::CreateInProgress
            | StackStatus::DeleteInProgress
            | StackStatus::ImportInProgress
            | StackStatus::ImportRollbackInProgress
            | StackStatus::ReviewInProgress
            | StackStatus::RollbackInProgress
            | StackStatus::UpdateCompleteCleanupInProgress
            | StackStatus::UpdateInProgress
            | StackStatus::UpdateRollbackCompleteCleanupInProgress
            | StackStatus::UpdateRollbackInProgress => StackState::InProgress {
                status: status.as_str().to_string(),
            },
            // stable: the failed update was undone and the old outputs still apply
            StackStatus::UpdateRollbackComplete | StackStatus::ImportRollbackComplete => {
                let (resource, reason) = match first_failed_resource(&client, name).await {
                    Some((resource, reason)) => (Some(resource), reason),
                    None => (None, stack.stack_status_reason().unwrap_or("update rolled back").to_string()),
                };
                StackState::RolledBack {
                    reason: format!("{} ({reason})", status.as_str()),
                    resource,
                    outputs: outputs_of(&stack),
                }
            }
            // everything else is a failure
            _ => {
                let stack_reason = stack
                    .stack_status_reason()
                    .unwrap_or("Failed to get stack failure reason")
                    .to_string();
                match first_failed_resource(&client, name).await {
                    Some((resource, reason)) => StackState::Failed {
                        reason: format!("{} ({reason})", status.as_str()),
                        resource: Some(resource),
                    },
                    None => StackState::Failed {
                        reason: format!("{} ({stack_reason})", status.as_str()),
                        resource: None,
                    },
                }
            }
        };
        debug!(stack = name, state = ?state, "described stack");
        Ok(state)
    }

    async fn delete_stack(&self, region: &str, name: &str) -> Result<()> {
        info!(stack = name, region, "deleting stack");
        self.cfn(region)
            .delete_stack()
            .stack_name(name)
            .send()
            .await
            .map_err(|e| Error::provider(name, aws_sdk_cloudformation::error::DisplayErrorContext(&e).to_string()))?;
        Ok(())
    }

    async fn list_objects(&self, region: &str, bucket: &str) -> Result<Vec<RemoteObject>> {
        let client = self.s3(region);
        let mut keys = vec![];
        let mut token: Option<String> = None;
        loop {
            let resp = client
                .list_objects_v2()
                .bucket(bucket)
                .set_continuation_token(token.take())
                .send()
                .await
                .map_err(|e| Error::provider(bucket, aws_sdk_s3::error::DisplayErrorContext(&e).to_string()))?;
            for obj in resp.contents().unwrap_or_default() {
                if let Some(key) = obj.key() {
                    keys.push(key.to_string());
                }
            }
            match resp.next_continuation_token() {
                Some(t) => token = Some(t.to_string()),
                None => break,
            }
        }

        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            let head = client
                .head_object()
                .bucket(bucket)
                .key(&key)
                .send()
                .await
                .map_err(|e| Error::provider(format!("{bucket}/{key}"), aws_sdk_s3::error::DisplayErrorContext(&e).to_string()))?;
            let checksum = head
                .metadata()
                .and_then(|m| m.get(CHECKSUM_METADATA_KEY))
                .cloned();
            out.push(RemoteObject { key, checksum });
        }
        Ok(out)
    }

    async fn put_object(&self, region: &str, bucket: &str, upload: ObjectUpload) -> Result<()> {
        let ObjectUpload { key, body, content_type, checksum } = upload;
        self.s3(region)
            .put_object()
            .bucket(bucket)
            .key(&key)
            .content_type(content_type)
            .checksum_sha256(&checksum)
            .metadata(CHECKSUM_METADATA_KEY, &checksum)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| Error::provider(format!("{bucket}/{key}"), aws_sdk_s3::error::DisplayErrorContext(&e).to_string()))?;
        Ok(())
    }

    async fn delete_object(&self, region: &str, bucket: &str, key: &str) -> Result<()> {
        self.s3(region)
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| Error::provider(format!("{bucket}/{key}"), aws_sdk_s3::error::DisplayErrorContext(&e).to_string()))?;
        Ok(())
    }

    async fn create_invalidation(
        &self,
        distribution_id: &str,
        paths: &[String],
        caller_reference: &str,
    ) -> Result<String> {
        let items = Paths::builder()
            .quantity(paths.len() as i32)
            .set_items(Some(paths.to_vec()))
            .build();
        let batch = InvalidationBatch::builder()
            .paths(items)
            .caller_reference(caller_reference)
            .build();
        let resp = self
            .cloudfront()
            .create_invalidation()
            .distribution_id(distribution_id)
            .invalidation_batch(batch)
            .send()
            .await
            .map_err(|e| Error::provider(distribution_id, aws_sdk_cloudfront::error::DisplayErrorContext(&e).to_string()))?;
        resp.invalidation()
            .and_then(|i| i.id())
            .map(|id| id.to_string())
            .ok_or_else(|| Error::provider(distribution_id, "Invalidation created without an id"))
    }

    async fn invalidation_complete(&self, distribution_id: &str, invalidation_id: &str) -> Result<bool> {
        let resp = self
            .cloudfront()
            .get_invalidation()
            .distribution_id(distribution_id)
            .id(invalidation_id)
            .send()
            .await
            .map_err(|e| Error::provider(distribution_id, aws_sdk_cloudfront::error::DisplayErrorContext(&e).to_string()))?;
        Ok(resp.invalidation().and_then(|i| i.status()) == Some("Completed"))
    }
}
