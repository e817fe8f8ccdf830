//! Mirrors the built artifacts into the site bucket, then invalidates the
//! distribution's cache once.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;
use rayon::prelude::*;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::provider::{CloudProvider, ObjectUpload, RemoteObject};

/// every object of the site.
pub const INVALIDATION_PATHS: &[&str] = &["/*"];

/// base64 SHA-256, the encoding S3 expects for `x-amz-checksum-sha256`.
pub fn checksum(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(Sha256::digest(bytes))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalArtifact {
    /// object key, `/` separated, relative to the artifact directory.
    pub key: String,
    pub path: PathBuf,
    pub checksum: String,
}

fn iter_files_recursively<P: AsRef<Path>>(
    start_dir: P,
    callback: &mut impl FnMut(PathBuf) -> Result<()>,
) -> Result<()> {
    let start_dir = start_dir.as_ref();
    let artifact_err = |source| Error::Artifact { path: start_dir.to_path_buf(), source };
    let readdir = std::fs::read_dir(start_dir).map_err(artifact_err)?;
    for entry in readdir {
        let direntry = entry.map_err(artifact_err)?;
        let path = direntry.path();
        let fp = direntry.file_type().map_err(|source| Error::Artifact { path: path.clone(), source })?;
        if fp.is_dir() {
            iter_files_recursively(&path, callback)?;
        } else {
            callback(path)?;
        }
    }
    Ok(())
}

fn object_key(root: &Path, path: &Path) -> Result<String> {
    let relative = path
        .strip_prefix(root)
        .map_err(|_| Error::Configuration(format!("{:?} is outside of {:?}", path, root)))?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(parts.join("/"))
}

/// Every file under `dir` with its key and checksum, sorted by key. Files
/// are hashed in parallel.
pub fn scan_artifacts<P: AsRef<Path>>(dir: P) -> Result<Vec<LocalArtifact>> {
    let dir = dir.as_ref();
    if !dir.is_dir() {
        return Err(Error::Configuration(format!(
            "Artifact directory {:?} does not exist. Build the site before deploying",
            dir
        )));
    }
    let mut paths = vec![];
    iter_files_recursively(dir, &mut |p| {
        paths.push(p);
        Ok(())
    })?;
    let mut artifacts = paths
        .into_par_iter()
        .map(|path| {
            let key = object_key(dir, &path)?;
            let bytes = std::fs::read(&path).map_err(|source| Error::Artifact { path: path.clone(), source })?;
            Ok(LocalArtifact { key, checksum: checksum(&bytes), path })
        })
        .collect::<Result<Vec<_>>>()?;
    artifacts.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(artifacts)
}

/// the artifacts of a deployable site: the directory exists and holds the
/// entry document at its root.
pub fn collect_artifacts<P: AsRef<Path>>(dir: P, entry_document: &str) -> Result<Vec<LocalArtifact>> {
    let local = scan_artifacts(dir.as_ref())?;
    if !local.iter().any(|a| a.key == entry_document) {
        return Err(Error::Configuration(format!(
            "Artifact directory {:?} has no entry document {entry_document}",
            dir.as_ref()
        )));
    }
    Ok(local)
}

/// content type from the file extension. unknown types are served as
/// binary.
pub fn content_type(key: &str) -> &'static str {
    let ext = key.rsplit_once('.').map(|(_, e)| e.to_ascii_lowercase()).unwrap_or_default();
    match ext.as_str() {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" | "mjs" => "text/javascript; charset=utf-8",
        "json" | "map" => "application/json",
        "webmanifest" => "application/manifest+json",
        "txt" => "text/plain; charset=utf-8",
        "xml" => "application/xml",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "avif" => "image/avif",
        "ico" => "image/x-icon",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "ttf" => "font/ttf",
        "otf" => "font/otf",
        "wasm" => "application/wasm",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncPlan {
    /// in upload order. the entry document comes last.
    pub uploads: Vec<String>,
    pub deletions: Vec<String>,
    pub unchanged: Vec<String>,
}

impl SyncPlan {
    pub fn is_empty(&self) -> bool {
        self.uploads.is_empty() && self.deletions.is_empty()
    }
}

/// full mirror of `local` onto `remote`: new and changed files are
/// uploaded, remote objects without a local file are deleted.
pub fn plan_sync(local: &[LocalArtifact], remote: &[RemoteObject], entry_document: &str) -> SyncPlan {
    let remote: BTreeMap<&str, Option<&str>> = remote
        .iter()
        .map(|o| (o.key.as_str(), o.checksum.as_deref()))
        .collect();
    let mut plan = SyncPlan::default();
    let mut entry = None;
    for artifact in local {
        let same = remote.get(artifact.key.as_str()) == Some(&Some(artifact.checksum.as_str()));
        if same {
            plan.unchanged.push(artifact.key.clone());
        } else if artifact.key == entry_document {
            entry = Some(artifact.key.clone());
        } else {
            plan.uploads.push(artifact.key.clone());
        }
    }
    plan.uploads.extend(entry);
    let local_keys: Vec<&str> = local.iter().map(|a| a.key.as_str()).collect();
    plan.deletions = remote
        .keys()
        .filter(|k| !local_keys.contains(*k))
        .map(|k| k.to_string())
        .collect();
    plan
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishReport {
    pub bucket: String,
    pub distribution_id: String,
    pub plan: SyncPlan,
    pub invalidation_id: String,
    pub invalidation_completed: bool,
}

/// Target of a publish: the web unit's bucket and distribution.
pub struct Publisher<'a, P: ?Sized> {
    provider: &'a P,
    region: String,
    bucket: String,
    distribution_id: String,
    wait_for_invalidation: bool,
    poll_interval: Duration,
    invalidation_timeout: Duration,
}

impl<'a, P: CloudProvider + ?Sized> Publisher<'a, P> {
    pub fn new(provider: &'a P, region: &str, bucket: &str, distribution_id: &str) -> Self {
        Self {
            provider,
            region: region.to_string(),
            bucket: bucket.to_string(),
            distribution_id: distribution_id.to_string(),
            wait_for_invalidation: false,
            poll_interval: Duration::from_secs(5),
            invalidation_timeout: Duration::from_secs(15 * 60),
        }
    }

    /// with `wait`, publishing only returns once the invalidation completed,
    /// or fails after `timeout`.
    pub fn wait_for_invalidation(mut self, wait: bool, poll_interval: Duration, timeout: Duration) -> Self {
        self.wait_for_invalidation = wait;
        self.poll_interval = poll_interval;
        self.invalidation_timeout = timeout;
        self
    }

    /// Syncs `artifact_dir` into the bucket and invalidates `/*` exactly
    /// once. Any error during the sync returns before the invalidation.
    pub async fn publish<D: AsRef<Path>>(&self, artifact_dir: D, entry_document: &str) -> Result<PublishReport> {
        let local = collect_artifacts(artifact_dir, entry_document)?;
        let remote = self.provider.list_objects(&self.region, &self.bucket).await?;
        let plan = plan_sync(&local, &remote, entry_document);
        info!(
            bucket = %self.bucket,
            uploads = plan.uploads.len(),
            deletions = plan.deletions.len(),
            unchanged = plan.unchanged.len(),
            "sync plan"
        );

        let by_key: BTreeMap<&str, &LocalArtifact> = local.iter().map(|a| (a.key.as_str(), a)).collect();
        for key in plan.uploads.iter() {
            let artifact = by_key
                .get(key.as_str())
                .ok_or_else(|| Error::Configuration(format!("No local file for {key}")))?;
            let body = std::fs::read(&artifact.path)
                .map_err(|source| Error::Artifact { path: artifact.path.clone(), source })?;
            debug!(key = %key, bytes = body.len(), "uploading");
            self.provider
                .put_object(
                    &self.region,
                    &self.bucket,
                    ObjectUpload {
                        key: key.clone(),
                        content_type: content_type(key).to_string(),
                        checksum: checksum(&body),
                        body,
                    },
                )
                .await?;
        }
        for key in plan.deletions.iter() {
            debug!(key = %key, "deleting stale object");
            self.provider.delete_object(&self.region, &self.bucket, key).await?;
        }

        let paths: Vec<String> = INVALIDATION_PATHS.iter().map(|p| p.to_string()).collect();
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let caller_reference = format!("{}-{millis}", self.bucket);
        let invalidation_id = self
            .provider
            .create_invalidation(&self.distribution_id, &paths, &caller_reference)
            .await?;
        info!(distribution = %self.distribution_id, invalidation = %invalidation_id, "invalidated cache");

        let mut invalidation_completed = false;
        if self.wait_for_invalidation {
            let started = Instant::now();
            while !self
                .provider
                .invalidation_complete(&self.distribution_id, &invalidation_id)
                .await?
            {
                if started.elapsed() >= self.invalidation_timeout {
                    return Err(Error::provider(
                        &self.distribution_id,
                        format!("timed out waiting for invalidation {invalidation_id}"),
                    ));
                }
                debug!(invalidation = %invalidation_id, "waiting for invalidation");
                tokio::time::sleep(self.poll_interval).await;
            }
            invalidation_completed = true;
        }

        Ok(PublishReport {
            bucket: self.bucket.clone(),
            distribution_id: self.distribution_id.clone(),
            plan,
            invalidation_id,
            invalidation_completed,
        })
    }
}
