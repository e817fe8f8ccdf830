//! In-memory control plane. Stacks are applied by interpreting their
//! templates: intrinsic functions are resolved, resources are created in
//! dependency order and their effects (buckets, grants, distributions,
//! alias records) are kept so tests can send requests through the
//! simulated edge.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use super::{CloudProvider, ObjectUpload, RemoteObject, StackState, Submission};
use crate::error::{Error, Result};
use crate::graph::ResourceGraph;
use crate::publish::checksum;
use crate::regions::CERTIFICATE_REGION;
use crate::resources::{rewrite_for, ErrorResponse, HostedZone, CLEANUP_RESOURCE_TYPE};
use crate::stack::StackUnit;
use crate::template::Template;

pub const ACCOUNT_ID: &str = "123456789012";
/// S3 rejects longer keys with `400 KeyTooLongError`.
pub const MAX_KEY_LENGTH: usize = 1024;
const OAI_PATH_PREFIX: &str = "origin-access-identity/cloudfront/";

/// control-plane calls in the order they were made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    FindHostedZone { domain: String },
    SubmitStack { region: String, name: String },
    DeleteStack { region: String, name: String },
    ListObjects { bucket: String },
    PutObject { bucket: String, key: String },
    DeleteObject { bucket: String, key: String },
    CreateInvalidation { distribution_id: String, paths: Vec<String> },
}

/// how a named stack reacts to changes.
#[derive(Debug, Clone, Default)]
pub struct StackBehaviour {
    /// polls answered with an in-progress status before a change applies.
    pub pending_polls: u32,
    /// the change fails on this logical resource and is rolled back.
    pub fail_resource: Option<String>,
    /// the change never finishes, eg: validation records that never resolve.
    pub stuck: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invalidation {
    pub id: String,
    pub distribution_id: String,
    pub paths: Vec<String>,
    pub caller_reference: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeResponse {
    pub status: u16,
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    pub location: Option<String>,
}

impl EdgeResponse {
    fn status(status: u16) -> Self {
        Self { status, body: vec![], content_type: None, location: None }
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Clone)]
struct StoredObject {
    body: Vec<u8>,
    content_type: String,
    checksum: String,
}

#[derive(Debug, Clone, Default)]
struct SimBucket {
    public_access_blocked: bool,
    auto_delete: bool,
    objects: BTreeMap<String, StoredObject>,
    /// canonical user => allowed actions
    readers: BTreeMap<String, BTreeSet<String>>,
}

#[derive(Debug, Clone)]
struct SimCertificate {
    domain: String,
    region: String,
}

#[derive(Debug, Clone)]
struct SimDistribution {
    id: String,
    domain_name: String,
    aliases: Vec<String>,
    default_root_object: Option<String>,
    error_responses: Vec<ErrorResponse>,
    origin_bucket: String,
    origin_identity: Option<String>,
    redirect_to_https: bool,
    certificate_arn: String,
}

#[derive(Debug, Clone)]
struct SimRecord {
    zone_id: String,
    target: String,
}

#[derive(Debug, Clone, PartialEq)]
struct Physical {
    ty: String,
    reference: String,
    attributes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    fn in_progress(&self) -> &'static str {
        match self {
            Operation::Create => "CREATE_IN_PROGRESS",
            Operation::Update => "UPDATE_IN_PROGRESS",
            Operation::Delete => "DELETE_IN_PROGRESS",
        }
    }
}

#[derive(Debug, Clone)]
enum Phase {
    Stable,
    Pending {
        operation: Operation,
        polls_left: u32,
        stuck: bool,
    },
    Failed {
        status: &'static str,
        reason: String,
        resource: Option<String>,
    },
    /// an update failed and the previous template is back in place.
    RolledBack {
        reason: String,
        resource: Option<String>,
    },
}

/// what a stack looked like after its last successful change.
#[derive(Debug, Clone)]
struct Applied {
    body: String,
    template: Template,
    parameters: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
struct SimStack {
    body: String,
    template: Template,
    parameters: BTreeMap<String, String>,
    physical: BTreeMap<String, Physical>,
    outputs: BTreeMap<String, String>,
    phase: Phase,
    previous: Option<Applied>,
}

/// why a resource could not be applied.
enum Blocked {
    /// waits on something outside the stack, eg: DNS validation records.
    Stuck,
    Rejected(String),
}

impl From<String> for Blocked {
    fn from(s: String) -> Self {
        Blocked::Rejected(s)
    }
}

#[derive(Default)]
struct World {
    next_id: u64,
    zones: Vec<HostedZone>,
    behaviours: BTreeMap<String, StackBehaviour>,
    failing_uploads: BTreeSet<String>,
    invalidations_held: bool,
    stacks: BTreeMap<(String, String), SimStack>,
    certificates: BTreeMap<String, SimCertificate>,
    buckets: BTreeMap<String, SimBucket>,
    identities: BTreeMap<String, String>,
    distributions: BTreeMap<String, SimDistribution>,
    records: BTreeMap<String, SimRecord>,
    invalidations: Vec<Invalidation>,
    calls: Vec<Call>,
}

#[derive(Default)]
pub struct MemoryProvider {
    world: Mutex<World>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// a provider that already hosts the zone for `domain`.
    pub fn with_zone(domain: &str) -> Self {
        let provider = Self::new();
        provider.add_hosted_zone(HostedZone::new("/hostedzone/Z0SIMULATED", domain));
        provider
    }

    fn world(&self) -> MutexGuard<'_, World> {
        self.world.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_hosted_zone(&self, zone: HostedZone) {
        self.world().zones.push(zone);
    }

    pub fn set_behaviour(&self, stack_name: &str, behaviour: StackBehaviour) {
        self.world().behaviours.insert(stack_name.to_string(), behaviour);
    }

    /// uploads of `key` fail from now on.
    pub fn fail_uploads_of(&self, key: &str) {
        self.world().failing_uploads.insert(key.to_string());
    }

    /// invalidations stay in progress from now on.
    pub fn hold_invalidations(&self) {
        self.world().invalidations_held = true;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.world().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.world().calls.clear();
    }

    pub fn invalidations(&self) -> Vec<Invalidation> {
        self.world().invalidations.clone()
    }

    pub fn stack_names(&self) -> Vec<(String, String)> {
        self.world().stacks.keys().cloned().collect()
    }

    pub fn stack_template(&self, region: &str, name: &str) -> Option<Template> {
        self.world()
            .stacks
            .get(&(region.to_string(), name.to_string()))
            .map(|s| s.template.clone())
    }

    pub fn bucket_names(&self) -> Vec<String> {
        self.world().buckets.keys().cloned().collect()
    }

    /// key => body of every object in `bucket`
    pub fn objects(&self, bucket: &str) -> BTreeMap<String, Vec<u8>> {
        self.world()
            .buckets
            .get(bucket)
            .map(|b| b.objects.iter().map(|(k, o)| (k.clone(), o.body.clone())).collect())
            .unwrap_or_default()
    }

    /// places an object without going through the publisher, eg: a stale
    /// file left by an earlier release.
    pub fn seed_object(&self, bucket: &str, key: &str, body: &[u8]) {
        if let Some(b) = self.world().buckets.get_mut(bucket) {
            b.objects.insert(
                key.to_string(),
                StoredObject {
                    body: body.to_vec(),
                    content_type: "application/octet-stream".into(),
                    checksum: checksum(body),
                },
            );
        }
    }

    /// number of alias records in all hosted zones.
    pub fn record_count(&self) -> usize {
        self.world().records.len()
    }

    pub fn certificate_count(&self) -> usize {
        self.world().certificates.len()
    }

    /// what an alias record for `host` points at.
    pub fn resolve(&self, host: &str) -> Option<String> {
        let world = self.world();
        let host = host.trim_end_matches('.');
        world.records.get(host).and_then(|r| {
            world
                .zones
                .iter()
                .any(|z| z.id == r.zone_id)
                .then(|| r.target.clone())
        })
    }

    /// An unauthenticated GET straight against the bucket, bypassing the
    /// distribution.
    pub fn anonymous_get(&self, bucket: &str, key: &str) -> u16 {
        let world = self.world();
        match world.buckets.get(bucket) {
            None => 404,
            Some(b) if b.public_access_blocked => 403,
            Some(b) => match b.readers.get("*") {
                Some(actions) if actions.contains("s3:GetObject") => {
                    if b.objects.contains_key(key) {
                        200
                    } else {
                        404
                    }
                }
                _ => 403,
            },
        }
    }

    /// A request sent to `host` through DNS and the distribution's edge.
    /// `None` when the name does not resolve to any distribution.
    pub fn edge_get(&self, host: &str, path: &str, https: bool) -> Option<EdgeResponse> {
        let world = self.world();
        let host = host.trim_end_matches('.');
        let target = match world.records.get(host) {
            Some(r) => r.target.clone(),
            None => host.to_string(),
        };
        let dist = world.distributions.values().find(|d| d.domain_name == target)?;
        if host != dist.domain_name && !dist.aliases.iter().any(|a| a == host) {
            // CNAME not configured on the distribution
            return Some(EdgeResponse::status(403));
        }
        if !https && dist.redirect_to_https {
            let mut resp = EdgeResponse::status(301);
            resp.location = Some(format!("https://{host}{path}"));
            return Some(resp);
        }
        let path = path.split('?').next().unwrap_or_default();
        let mut key = path.trim_start_matches('/').to_string();
        if key.is_empty() {
            if let Some(root) = &dist.default_root_object {
                key = root.clone();
            }
        }
        let resp = world.origin_get(dist, &key);
        if let Some(rewrite) = rewrite_for(&dist.error_responses, resp.status) {
            let page = world.origin_get(dist, rewrite.response_page_path.trim_start_matches('/'));
            if page.status != 200 {
                return Some(page);
            }
            return Some(EdgeResponse { status: rewrite.response_code, ..page });
        }
        Some(resp)
    }
}

impl World {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// a GET from the distribution to its origin, signed as its identity.
    fn origin_get(&self, dist: &SimDistribution, key: &str) -> EdgeResponse {
        if key.len() > MAX_KEY_LENGTH {
            return EdgeResponse::status(400);
        }
        let bucket = match self.buckets.get(&dist.origin_bucket) {
            Some(b) => b,
            None => return EdgeResponse::status(502),
        };
        let actions = dist
            .origin_identity
            .as_ref()
            .and_then(|id| self.identities.get(id))
            .and_then(|canonical| bucket.readers.get(canonical));
        let allowed = |action: &str| actions.map(|a| a.contains(action)).unwrap_or(false);
        if !allowed("s3:GetObject") {
            return EdgeResponse::status(403);
        }
        match bucket.objects.get(key) {
            Some(obj) if !key.is_empty() => EdgeResponse {
                status: 200,
                body: obj.body.clone(),
                content_type: Some(obj.content_type.clone()),
                location: None,
            },
            _ if allowed("s3:ListBucket") => EdgeResponse::status(404),
            _ => EdgeResponse::status(403),
        }
    }

    fn upsert(
        &mut self,
        region: &str,
        stack_name: &str,
        ty: &str,
        props: &Value,
        existing: Option<&Physical>,
    ) -> std::result::Result<Physical, Blocked> {
        let mut attributes = BTreeMap::new();
        let reference = match ty {
            "AWS::CertificateManager::Certificate" => {
                let domain = str_prop(props, "DomainName")?;
                let zone_id = props["DomainValidationOptions"][0]["HostedZoneId"]
                    .as_str()
                    .unwrap_or_default();
                let validates = self.zones.iter().any(|z| {
                    z.id == zone_id && (domain == z.name || domain.ends_with(&format!(".{}", z.name)))
                });
                if !validates {
                    // the validation record never appears, so ACM waits forever
                    return Err(Blocked::Stuck);
                }
                let arn = match existing {
                    Some(p) => p.reference.clone(),
                    None => format!(
                        "arn:aws:acm:{region}:{ACCOUNT_ID}:certificate/{:08x}-sim",
                        self.next_id()
                    ),
                };
                self.certificates.insert(
                    arn.clone(),
                    SimCertificate { domain: domain.to_string(), region: region.to_string() },
                );
                arn
            }
            "AWS::S3::Bucket" => {
                let name = match existing {
                    Some(p) => p.reference.clone(),
                    None => format!("{}-sitebucket-{}", stack_name.to_lowercase(), self.next_id()),
                };
                let block = &props["PublicAccessBlockConfiguration"];
                let blocked = ["BlockPublicAcls", "BlockPublicPolicy", "IgnorePublicAcls", "RestrictPublicBuckets"]
                    .iter()
                    .all(|k| block[*k].as_bool().unwrap_or(false));
                let bucket = self.buckets.entry(name.clone()).or_default();
                bucket.public_access_blocked = blocked;
                attributes.insert("Arn".into(), format!("arn:aws:s3:::{name}"));
                attributes.insert("DomainName".into(), format!("{name}.s3.amazonaws.com"));
                attributes.insert(
                    "RegionalDomainName".into(),
                    format!("{name}.s3.{region}.amazonaws.com"),
                );
                name
            }
            "AWS::CloudFront::CloudFrontOriginAccessIdentity" => {
                let (id, canonical) = match existing {
                    Some(p) => (
                        p.reference.clone(),
                        p.attributes.get("S3CanonicalUserId").cloned().unwrap_or_default(),
                    ),
                    None => {
                        let n = self.next_id();
                        (format!("E{n:012X}"), format!("{n:064x}"))
                    }
                };
                self.identities.insert(id.clone(), canonical.clone());
                attributes.insert("Id".into(), id.clone());
                attributes.insert("S3CanonicalUserId".into(), canonical);
                id
            }
            "AWS::S3::BucketPolicy" => {
                let bucket_name = str_prop(props, "Bucket")?.to_string();
                let bucket = self
                    .buckets
                    .get_mut(&bucket_name)
                    .ok_or_else(|| format!("The specified bucket does not exist: {bucket_name}"))?;
                let mut readers: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
                let statements = props["PolicyDocument"]["Statement"].as_array().cloned().unwrap_or_default();
                for statement in statements.iter() {
                    if statement["Effect"] != "Allow" {
                        continue;
                    }
                    let principal = match &statement["Principal"] {
                        Value::String(s) => s.clone(),
                        p => p["CanonicalUser"]
                            .as_str()
                            .or_else(|| p["AWS"].as_str())
                            .unwrap_or_default()
                            .to_string(),
                    };
                    if principal == "*" && bucket.public_access_blocked {
                        return Err(Blocked::Rejected("Access Denied: public policies are blocked on this bucket".into()));
                    }
                    let actions: Vec<String> = match &statement["Action"] {
                        Value::String(s) => vec![s.clone()],
                        Value::Array(a) => a.iter().filter_map(|v| v.as_str().map(String::from)).collect(),
                        _ => vec![],
                    };
                    readers.entry(principal).or_default().extend(actions);
                }
                bucket.readers = readers;
                attributes.insert("Bucket".into(), bucket_name.clone());
                format!("{bucket_name}-policy")
            }
            "AWS::CloudFront::Distribution" => {
                let config = &props["DistributionConfig"];
                let certificate_arn = config["ViewerCertificate"]["AcmCertificateArn"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string();
                let certificate = self
                    .certificates
                    .get(&certificate_arn)
                    .filter(|c| c.region == CERTIFICATE_REGION)
                    .ok_or_else(|| {
                        format!("The specified SSL certificate doesn't exist, isn't in {CERTIFICATE_REGION} region, isn't valid, or doesn't include a valid certificate chain.")
                    })?
                    .clone();
                let aliases: Vec<String> = config["Aliases"]
                    .as_array()
                    .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
                    .unwrap_or_default();
                if let Some(alias) = aliases.iter().find(|a| **a != certificate.domain) {
                    return Err(Blocked::Rejected(format!(
                        "The certificate that is attached to your distribution doesn't cover the alternate domain name (CNAME) {alias}"
                    )));
                }
                let own_id = existing.map(|p| p.reference.clone());
                let taken = self.distributions.values().any(|d| {
                    Some(&d.id) != own_id.as_ref() && d.aliases.iter().any(|a| aliases.contains(a))
                });
                if taken {
                    return Err(Blocked::Rejected("CNAMEAlreadyExists".into()));
                }
                let origin = &config["Origins"][0];
                let origin_domain = str_prop(origin, "DomainName")?;
                let origin_bucket = origin_domain.split(".s3.").next().unwrap_or_default().to_string();
                if !self.buckets.contains_key(&origin_bucket) {
                    return Err(Blocked::Rejected(format!("Origin bucket {origin_bucket} does not exist")));
                }
                let origin_identity = match origin["S3OriginConfig"]["OriginAccessIdentity"].as_str() {
                    Some(s) if !s.is_empty() => {
                        let id = s.strip_prefix(OAI_PATH_PREFIX).unwrap_or(s).to_string();
                        if !self.identities.contains_key(&id) {
                            return Err(Blocked::Rejected(format!("The specified origin access identity does not exist: {id}")));
                        }
                        Some(id)
                    }
                    _ => None,
                };
                let error_responses: Vec<ErrorResponse> =
                    serde_json::from_value(config["CustomErrorResponses"].clone()).unwrap_or_default();
                let (id, domain_name) = match existing {
                    Some(p) => (p.reference.clone(), p.attributes.get("DomainName").cloned().unwrap_or_default()),
                    None => {
                        let n = self.next_id();
                        (format!("E{n:012X}D"), format!("d{n:013x}.cloudfront.net"))
                    }
                };
                self.distributions.insert(
                    id.clone(),
                    SimDistribution {
                        id: id.clone(),
                        domain_name: domain_name.clone(),
                        aliases,
                        default_root_object: config["DefaultRootObject"].as_str().map(String::from),
                        error_responses,
                        origin_bucket,
                        origin_identity,
                        redirect_to_https: config["DefaultCacheBehavior"]["ViewerProtocolPolicy"]
                            == "redirect-to-https",
                        certificate_arn,
                    },
                );
                attributes.insert("Id".into(), id.clone());
                attributes.insert("DomainName".into(), domain_name);
                id
            }
            "AWS::Route53::RecordSet" => {
                let zone_id = str_prop(props, "HostedZoneId")?;
                let zone = self
                    .zones
                    .iter()
                    .find(|z| z.id == zone_id)
                    .ok_or_else(|| format!("No hosted zone found with ID: {zone_id}"))?;
                let name = str_prop(props, "Name")?.trim_end_matches('.').to_string();
                if name != zone.name && !name.ends_with(&format!(".{}", zone.name)) {
                    return Err(Blocked::Rejected(format!("{name} is not permitted in zone {}", zone.name)));
                }
                let target = props["AliasTarget"]["DNSName"]
                    .as_str()
                    .unwrap_or_default()
                    .trim_end_matches('.')
                    .to_string();
                if let Some(old) = existing {
                    if old.reference != name {
                        self.records.remove(&old.reference);
                    }
                }
                self.records.insert(name.clone(), SimRecord { zone_id: zone_id.to_string(), target });
                name
            }
            "AWS::IAM::Role" | "AWS::Lambda::Function" => {
                let name = match existing {
                    Some(p) => p.reference.clone(),
                    None => format!("{stack_name}-{}", self.next_id()),
                };
                let arn = if ty == "AWS::IAM::Role" {
                    format!("arn:aws:iam::{ACCOUNT_ID}:role/{name}")
                } else {
                    format!("arn:aws:lambda:{region}:{ACCOUNT_ID}:function:{name}")
                };
                attributes.insert("Arn".into(), arn);
                name
            }
            t if t == CLEANUP_RESOURCE_TYPE => {
                let bucket_name = str_prop(props, "BucketName")?.to_string();
                let bucket = self
                    .buckets
                    .get_mut(&bucket_name)
                    .ok_or_else(|| format!("The specified bucket does not exist: {bucket_name}"))?;
                bucket.auto_delete = true;
                attributes.insert("BucketName".into(), bucket_name.clone());
                format!("{bucket_name}-cleanup")
            }
            other => {
                return Err(Blocked::Rejected(format!("Unrecognized resource type: {other}")));
            }
        };
        Ok(Physical { ty: ty.to_string(), reference, attributes })
    }

    fn destroy(&mut self, physical: &Physical) -> std::result::Result<(), String> {
        let reference = &physical.reference;
        match physical.ty.as_str() {
            "AWS::CertificateManager::Certificate" => {
                if self.distributions.values().any(|d| &d.certificate_arn == reference) {
                    return Err(format!("Certificate {reference} in account {ACCOUNT_ID} is in use."));
                }
                self.certificates.remove(reference);
            }
            "AWS::S3::Bucket" => {
                let empty = self.buckets.get(reference).map(|b| b.objects.is_empty()).unwrap_or(true);
                if !empty {
                    return Err("The bucket you tried to delete is not empty".into());
                }
                self.buckets.remove(reference);
            }
            "AWS::S3::BucketPolicy" => {
                if let Some(b) = physical.attributes.get("Bucket").and_then(|n| self.buckets.get_mut(n)) {
                    b.readers.clear();
                }
            }
            "AWS::CloudFront::CloudFrontOriginAccessIdentity" => {
                if self.distributions.values().any(|d| d.origin_identity.as_ref() == Some(reference)) {
                    return Err("CloudFrontOriginAccessIdentityInUse".into());
                }
                self.identities.remove(reference);
            }
            "AWS::CloudFront::Distribution" => {
                self.distributions.remove(reference);
            }
            "AWS::Route53::RecordSet" => {
                self.records.remove(reference);
            }
            t if t == CLEANUP_RESOURCE_TYPE => {
                if let Some(b) = physical.attributes.get("BucketName").and_then(|n| self.buckets.get_mut(n)) {
                    if b.auto_delete {
                        b.objects.clear();
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// creates or updates every resource of `template`. `physical` holds the
    /// applied resources when this returns, including on failure.
    fn apply(
        &mut self,
        region: &str,
        stack_name: &str,
        template: &Template,
        parameters: &BTreeMap<String, String>,
        old: &BTreeMap<String, Physical>,
        physical: &mut BTreeMap<String, Physical>,
    ) -> std::result::Result<BTreeMap<String, String>, (Option<String>, Blocked)> {
        let order = creation_order(region, stack_name, template).map_err(|e| (None, Blocked::Rejected(e)))?;
        let mut created = vec![];
        for logical_id in order.iter() {
            let resource = &template.resources[logical_id];
            let scope = Scope { region, stack_name, parameters, physical };
            let outcome = scope
                .resolve(&resource.properties)
                .map_err(Blocked::Rejected)
                .and_then(|props| {
                    let existing = old.get(logical_id).filter(|p| p.ty == resource.ty);
                    self.upsert(region, stack_name, &resource.ty, &props, existing)
                });
            match outcome {
                Ok(p) => {
                    if !old.contains_key(logical_id) {
                        created.push(logical_id.clone());
                    }
                    physical.insert(logical_id.clone(), p);
                }
                Err(Blocked::Stuck) => return Err((Some(logical_id.clone()), Blocked::Stuck)),
                Err(Blocked::Rejected(reason)) => {
                    for id in created.iter().rev() {
                        if let Some(p) = physical.remove(id) {
                            if let Err(e) = self.destroy(&p) {
                                warn!(stack = stack_name, resource = %id, error = %e, "failed to roll back resource");
                            }
                        }
                    }
                    return Err((Some(logical_id.clone()), Blocked::Rejected(reason)));
                }
            }
        }
        for (logical_id, p) in old.iter().rev() {
            if !physical.contains_key(logical_id) {
                self.destroy(p).map_err(|e| (Some(logical_id.clone()), Blocked::Rejected(e)))?;
            }
        }
        let scope = Scope { region, stack_name, parameters, physical };
        let mut outputs = BTreeMap::new();
        for (name, output) in template.outputs.iter() {
            let value = scope
                .resolve(&output.value)
                .map_err(|e| (None, Blocked::Rejected(e)))?;
            let value = match value {
                Value::String(s) => s,
                other => other.to_string(),
            };
            outputs.insert(name.clone(), value);
        }
        Ok(outputs)
    }

    /// advances a pending stack by one poll.
    fn poll(&mut self, key: &(String, String)) -> StackState {
        let mut stack = match self.stacks.remove(key) {
            Some(s) => s,
            None => return StackState::Missing,
        };
        let (region, name) = key;
        let state = match stack.phase.clone() {
            Phase::Stable => StackState::Complete { outputs: stack.outputs.clone() },
            Phase::Failed { status, reason, resource } => StackState::Failed {
                reason: format!("{status} ({reason})"),
                resource,
            },
            Phase::RolledBack { reason, resource } => StackState::RolledBack {
                reason: format!("UPDATE_ROLLBACK_COMPLETE ({reason})"),
                resource,
                outputs: stack.outputs.clone(),
            },
            Phase::Pending { operation, stuck: true, .. } => StackState::InProgress {
                status: operation.in_progress().into(),
            },
            Phase::Pending { operation, polls_left, .. } if polls_left > 0 => {
                stack.phase = Phase::Pending { operation, polls_left: polls_left - 1, stuck: false };
                StackState::InProgress { status: operation.in_progress().into() }
            }
            Phase::Pending { operation: Operation::Delete, .. } => {
                let order = creation_order(region, name, &stack.template).unwrap_or_else(|_| {
                    stack.physical.keys().cloned().collect()
                });
                for logical_id in order.iter().rev() {
                    let p = match stack.physical.get(logical_id) {
                        Some(p) => p.clone(),
                        None => continue,
                    };
                    if let Err(reason) = self.destroy(&p) {
                        stack.phase = Phase::Failed {
                            status: "DELETE_FAILED",
                            reason: reason.clone(),
                            resource: Some(logical_id.clone()),
                        };
                        let state = StackState::Failed {
                            reason: format!("DELETE_FAILED ({reason})"),
                            resource: Some(logical_id.clone()),
                        };
                        self.stacks.insert(key.clone(), stack);
                        return state;
                    }
                    stack.physical.remove(logical_id);
                }
                debug!(stack = %name, "simulated stack deleted");
                return StackState::Missing;
            }
            Phase::Pending { operation, .. } => {
                let behaviour = self.behaviours.get(name).cloned().unwrap_or_default();
                let old = stack.physical.clone();
                let mut physical = old.clone();
                let result = match behaviour.fail_resource {
                    Some(resource) => Err((
                        Some(resource),
                        Blocked::Rejected("Resource handler returned message: \"simulated failure\"".into()),
                    )),
                    None => self.apply(region, name, &stack.template, &stack.parameters, &old, &mut physical),
                };
                match result {
                    Ok(outputs) => {
                        stack.physical = physical;
                        stack.outputs = outputs.clone();
                        stack.phase = Phase::Stable;
                        stack.previous = None;
                        StackState::Complete { outputs }
                    }
                    Err((_, Blocked::Stuck)) => {
                        stack.physical = physical;
                        stack.phase = Phase::Pending { operation, polls_left: 0, stuck: true };
                        StackState::InProgress { status: operation.in_progress().into() }
                    }
                    Err((resource, Blocked::Rejected(reason))) if operation == Operation::Update => {
                        stack.physical = physical;
                        if let Some(previous) = stack.previous.take() {
                            stack.body = previous.body;
                            stack.template = previous.template;
                            stack.parameters = previous.parameters;
                        }
                        stack.phase = Phase::RolledBack { reason: reason.clone(), resource: resource.clone() };
                        StackState::RolledBack {
                            reason: format!("UPDATE_ROLLBACK_COMPLETE ({reason})"),
                            resource,
                            outputs: stack.outputs.clone(),
                        }
                    }
                    Err((resource, Blocked::Rejected(reason))) => {
                        stack.physical = physical;
                        stack.phase = Phase::Failed { status: "ROLLBACK_COMPLETE", reason: reason.clone(), resource: resource.clone() };
                        StackState::Failed { reason: format!("ROLLBACK_COMPLETE ({reason})"), resource }
                    }
                }
            }
        };
        self.stacks.insert(key.clone(), stack);
        state
    }
}

fn str_prop<'a>(props: &'a Value, key: &str) -> std::result::Result<&'a str, Blocked> {
    props[key]
        .as_str()
        .ok_or_else(|| Blocked::Rejected(format!("Property {key} is required")))
}

/// logical ids of `template` in dependency order.
fn creation_order(region: &str, stack_name: &str, template: &Template) -> std::result::Result<Vec<String>, String> {
    let mut unit = StackUnit::new(stack_name, region);
    unit.template = template.clone();
    let graph = ResourceGraph::from_units(&[unit]).map_err(|e| e.to_string())?;
    let order = graph.topological_order().map_err(|e| e.to_string())?;
    Ok(order.into_iter().map(|a| a.logical_id).collect())
}

/// evaluation context for intrinsic functions inside one stack.
struct Scope<'a> {
    region: &'a str,
    stack_name: &'a str,
    parameters: &'a BTreeMap<String, String>,
    physical: &'a BTreeMap<String, Physical>,
}

impl Scope<'_> {
    fn reference(&self, name: &str) -> std::result::Result<String, String> {
        match name {
            "AWS::AccountId" => Ok(ACCOUNT_ID.into()),
            "AWS::Partition" => Ok("aws".into()),
            "AWS::Region" => Ok(self.region.into()),
            "AWS::StackName" => Ok(self.stack_name.into()),
            "AWS::URLSuffix" => Ok("amazonaws.com".into()),
            _ => self
                .parameters
                .get(name)
                .cloned()
                .or_else(|| self.physical.get(name).map(|p| p.reference.clone()))
                .ok_or_else(|| format!("Unresolved resource dependencies [{name}] in the Resources block of the template")),
        }
    }

    fn attribute(&self, name: &str, attribute: &str) -> std::result::Result<String, String> {
        self.physical
            .get(name)
            .and_then(|p| p.attributes.get(attribute))
            .cloned()
            .ok_or_else(|| format!("Template error: resource {name} does not support attribute {attribute}"))
    }

    fn substitute(&self, s: &str, locals: &BTreeMap<String, String>) -> std::result::Result<String, String> {
        let mut out = String::with_capacity(s.len());
        let mut rest = s;
        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after
                .find('}')
                .ok_or_else(|| format!("Unterminated variable in {s:?}"))?;
            let var = &after[..end];
            if let Some(literal) = var.strip_prefix('!') {
                out.push_str("${");
                out.push_str(literal);
                out.push('}');
            } else if let Some(v) = locals.get(var) {
                out.push_str(v);
            } else if let Some((name, attribute)) = var.split_once('.') {
                out.push_str(&self.attribute(name, attribute)?);
            } else {
                out.push_str(&self.reference(var)?);
            }
            rest = &after[end + 1..];
        }
        out.push_str(rest);
        Ok(out)
    }

    fn resolve(&self, value: &Value) -> std::result::Result<Value, String> {
        match value {
            Value::Object(map) if map.len() == 1 => {
                if let Some(target) = map.get("Ref") {
                    let name = target.as_str().ok_or("Ref must be a string")?;
                    return self.reference(name).map(Value::String);
                }
                if let Some(att) = map.get("Fn::GetAtt") {
                    let (name, attribute) = match att {
                        Value::Array(parts) => (
                            parts.first().and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                            parts.get(1).and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                        ),
                        Value::String(s) => match s.split_once('.') {
                            Some((n, a)) => (n.to_string(), a.to_string()),
                            None => return Err(format!("Invalid Fn::GetAtt {s}")),
                        },
                        _ => return Err("Invalid Fn::GetAtt".into()),
                    };
                    return self.attribute(&name, &attribute).map(Value::String);
                }
                if let Some(sub) = map.get("Fn::Sub") {
                    return match sub {
                        Value::String(s) => self.substitute(s, &BTreeMap::new()).map(Value::String),
                        Value::Array(parts) => {
                            let mut locals = BTreeMap::new();
                            if let Some(Value::Object(vars)) = parts.get(1) {
                                for (k, v) in vars {
                                    let v = match self.resolve(v)? {
                                        Value::String(s) => s,
                                        other => other.to_string(),
                                    };
                                    locals.insert(k.clone(), v);
                                }
                            }
                            let s = parts.first().and_then(|v| v.as_str()).unwrap_or_default();
                            self.substitute(s, &locals).map(Value::String)
                        }
                        _ => Err("Invalid Fn::Sub".into()),
                    };
                }
                self.resolve_map(map)
            }
            Value::Object(map) => self.resolve_map(map),
            Value::Array(items) => items
                .iter()
                .map(|v| self.resolve(v))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map(Value::Array),
            other => Ok(other.clone()),
        }
    }

    fn resolve_map(&self, map: &serde_json::Map<String, Value>) -> std::result::Result<Value, String> {
        let mut out = serde_json::Map::with_capacity(map.len());
        for (k, v) in map {
            out.insert(k.clone(), self.resolve(v)?);
        }
        Ok(Value::Object(out))
    }
}

#[async_trait]
impl CloudProvider for MemoryProvider {
    async fn find_hosted_zone(&self, domain: &str) -> Result<Option<HostedZone>> {
        let mut world = self.world();
        let domain = domain.trim_end_matches('.');
        world.calls.push(Call::FindHostedZone { domain: domain.to_string() });
        Ok(world.zones.iter().find(|z| z.name == domain).cloned())
    }

    async fn submit_stack(
        &self,
        region: &str,
        name: &str,
        template_body: &str,
        parameters: &BTreeMap<String, String>,
    ) -> Result<Submission> {
        let mut world = self.world();
        world.calls.push(Call::SubmitStack { region: region.into(), name: name.into() });
        let template: Template = serde_json::from_str(template_body)
            .map_err(|e| Error::provider(name, format!("Template format error: {e}")))?;
        for param in template.parameters.keys() {
            if !parameters.contains_key(param) {
                return Err(Error::provider(name, format!("Parameters: [{param}] must have values")));
            }
        }
        if let Some(extra) = parameters.keys().find(|p| !template.parameters.contains_key(*p)) {
            return Err(Error::provider(name, format!("Parameters: [{extra}] do not exist in the template")));
        }
        let behaviour = world.behaviours.get(name).cloned().unwrap_or_default();
        let key = (region.to_string(), name.to_string());
        let operation = match world.stacks.get(&key) {
            Some(stack) => match &stack.phase {
                Phase::Pending { operation, .. } => {
                    return Err(Error::provider(
                        name,
                        format!("Stack:{name} is in {} state and can not be updated.", operation.in_progress()),
                    ));
                }
                Phase::Stable | Phase::RolledBack { .. }
                    if stack.body == template_body && &stack.parameters == parameters =>
                {
                    return Ok(Submission::NoChanges);
                }
                Phase::Failed { status: "ROLLBACK_COMPLETE", .. } => Operation::Create,
                _ => Operation::Update,
            },
            None => Operation::Create,
        };
        let stack = world.stacks.entry(key).or_insert_with(|| SimStack {
            body: String::new(),
            template: Template::default(),
            parameters: BTreeMap::new(),
            physical: BTreeMap::new(),
            outputs: BTreeMap::new(),
            phase: Phase::Stable,
            previous: None,
        });
        stack.previous = (operation == Operation::Update).then(|| Applied {
            body: std::mem::take(&mut stack.body),
            template: stack.template.clone(),
            parameters: stack.parameters.clone(),
        });
        stack.body = template_body.to_string();
        stack.template = template;
        stack.parameters = parameters.clone();
        stack.phase = Phase::Pending { operation, polls_left: behaviour.pending_polls, stuck: behaviour.stuck };
        debug!(stack = name, region, ?operation, "simulated stack submitted");
        Ok(Submission::Started)
    }

    async fn stack_state(&self, region: &str, name: &str) -> Result<StackState> {
        let mut world = self.world();
        Ok(world.poll(&(region.to_string(), name.to_string())))
    }

    async fn delete_stack(&self, region: &str, name: &str) -> Result<()> {
        let mut world = self.world();
        world.calls.push(Call::DeleteStack { region: region.into(), name: name.into() });
        if let Some(stack) = world.stacks.get_mut(&(region.to_string(), name.to_string())) {
            stack.phase = Phase::Pending { operation: Operation::Delete, polls_left: 0, stuck: false };
        }
        Ok(())
    }

    async fn list_objects(&self, _region: &str, bucket: &str) -> Result<Vec<RemoteObject>> {
        let mut world = self.world();
        world.calls.push(Call::ListObjects { bucket: bucket.into() });
        let b = world
            .buckets
            .get(bucket)
            .ok_or_else(|| Error::provider(bucket, "NoSuchBucket"))?;
        Ok(b.objects
            .iter()
            .map(|(key, obj)| RemoteObject { key: key.clone(), checksum: Some(obj.checksum.clone()) })
            .collect())
    }

    async fn put_object(&self, _region: &str, bucket: &str, upload: ObjectUpload) -> Result<()> {
        let mut world = self.world();
        world.calls.push(Call::PutObject { bucket: bucket.into(), key: upload.key.clone() });
        if world.failing_uploads.contains(&upload.key) {
            return Err(Error::provider(format!("{bucket}/{}", upload.key), "InternalError"));
        }
        if checksum(&upload.body) != upload.checksum {
            return Err(Error::provider(format!("{bucket}/{}", upload.key), "BadDigest"));
        }
        let b = world
            .buckets
            .get_mut(bucket)
            .ok_or_else(|| Error::provider(bucket, "NoSuchBucket"))?;
        b.objects.insert(
            upload.key,
            StoredObject { body: upload.body, content_type: upload.content_type, checksum: upload.checksum },
        );
        Ok(())
    }

    async fn delete_object(&self, _region: &str, bucket: &str, key: &str) -> Result<()> {
        let mut world = self.world();
        world.calls.push(Call::DeleteObject { bucket: bucket.into(), key: key.into() });
        let b = world
            .buckets
            .get_mut(bucket)
            .ok_or_else(|| Error::provider(bucket, "NoSuchBucket"))?;
        b.objects.remove(key);
        Ok(())
    }

    async fn create_invalidation(
        &self,
        distribution_id: &str,
        paths: &[String],
        caller_reference: &str,
    ) -> Result<String> {
        let mut world = self.world();
        world.calls.push(Call::CreateInvalidation {
            distribution_id: distribution_id.into(),
            paths: paths.to_vec(),
        });
        if !world.distributions.contains_key(distribution_id) {
            return Err(Error::provider(distribution_id, "NoSuchDistribution"));
        }
        if let Some(bad) = paths.iter().find(|p| !p.starts_with('/')) {
            return Err(Error::provider(distribution_id, format!("InvalidArgument: {bad}")));
        }
        if let Some(existing) = world
            .invalidations
            .iter()
            .find(|i| i.distribution_id == distribution_id && i.caller_reference == caller_reference)
        {
            return Ok(existing.id.clone());
        }
        let id = format!("I{:012X}", world.next_id());
        world.invalidations.push(Invalidation {
            id: id.clone(),
            distribution_id: distribution_id.into(),
            paths: paths.to_vec(),
            caller_reference: caller_reference.into(),
        });
        Ok(id)
    }

    async fn invalidation_complete(&self, distribution_id: &str, invalidation_id: &str) -> Result<bool> {
        let world = self.world();
        let known = world
            .invalidations
            .iter()
            .any(|i| i.distribution_id == distribution_id && i.id == invalidation_id);
        if !known {
            return Err(Error::provider(distribution_id, format!("NoSuchInvalidation: {invalidation_id}")));
        }
        Ok(!world.invalidations_held)
    }
}
