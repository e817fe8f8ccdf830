//! Live checks of a deployed environment, from the outside.

use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::engine::WebOutputs;
use crate::error::{Error, Result};
use crate::provider::memory::MAX_KEY_LENGTH;
use crate::provider::MemoryProvider;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResponse {
    pub status: u16,
    pub location: Option<String>,
    pub body: String,
}

/// one GET without following redirects.
pub trait Probe {
    fn get(&self, url: &str) -> Result<ProbeResponse>;
}

pub struct UreqProbe {
    agent: ureq::Agent,
}

impl UreqProbe {
    pub fn new(timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().redirects(0).timeout(timeout).build();
        Self { agent }
    }
}

fn into_probe_response(url: &str, resp: ureq::Response) -> Result<ProbeResponse> {
    let status = resp.status();
    let location = resp.header("location").map(String::from);
    let body = resp
        .into_string()
        .map_err(|e| Error::provider(url, format!("Failed to read response body\n{e}")))?;
    Ok(ProbeResponse { status, location, body })
}

impl Probe for UreqProbe {
    fn get(&self, url: &str) -> Result<ProbeResponse> {
        match self.agent.get(url).call() {
            Ok(resp) => into_probe_response(url, resp),
            Err(ureq::Error::Status(_, resp)) => into_probe_response(url, resp),
            Err(e) => Err(Error::provider(url, format!("Failed to request {url}\n{e}"))),
        }
    }
}

/// requests go through the simulated DNS and edge.
impl Probe for MemoryProvider {
    fn get(&self, url: &str) -> Result<ProbeResponse> {
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| Error::Configuration(format!("Invalid url {url}")))?;
        let (host, path) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, "/"),
        };
        if let Some((bucket, _)) = host.split_once(".s3.") {
            let status = self.anonymous_get(bucket, path.trim_start_matches('/'));
            return Ok(ProbeResponse { status, location: None, body: String::new() });
        }
        let resp = self
            .edge_get(host, path, scheme == "https")
            .ok_or_else(|| Error::provider(url, format!("Could not resolve host {host}")))?;
        Ok(ProbeResponse { status: resp.status, location: resp.location.clone(), body: resp.text() })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckResult {
    pub name: &'static str,
    pub url: String,
    pub passed: bool,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    pub hostname: String,
    pub checks: Vec<CheckResult>,
}

impl VerifyReport {
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    pub fn failures(&self) -> Vec<&CheckResult> {
        self.checks.iter().filter(|c| !c.passed).collect()
    }
}

fn check(name: &'static str, url: String, passed: bool, detail: String) -> CheckResult {
    if passed {
        info!(check = name, url = %url, "check passed");
    } else {
        warn!(check = name, url = %url, detail = %detail, "check failed");
    }
    CheckResult { name, url, passed, detail }
}

/// Probes the public hostname and the bucket of a deployed environment:
/// - the root serves the entry document
/// - an unknown client route and an over-long key both fall back to it
/// - plain http redirects to https
/// - the bucket refuses anonymous reads
pub fn verify<P: Probe + ?Sized>(probe: &P, web: &WebOutputs, entry_document: &str) -> Result<VerifyReport> {
    let host = &web.site_hostname;
    let mut checks = vec![];

    let root_url = format!("https://{host}/");
    let root = probe.get(&root_url)?;
    let shell = root.body.clone();
    checks.push(check(
        "root",
        root_url,
        root.status == 200 && !shell.is_empty(),
        format!("status {}", root.status),
    ));

    let fallbacks = [
        ("missing-route", format!("https://{host}/sitestack-verify/unknown/route")),
        ("bad-request", format!("https://{host}/{}", "k".repeat(MAX_KEY_LENGTH + 1))),
    ];
    for (name, url) in fallbacks {
        let resp = probe.get(&url)?;
        let same = resp.body == shell;
        checks.push(check(
            name,
            url,
            resp.status == 200 && same,
            format!("status {}, serves {}: {same}", resp.status, entry_document),
        ));
    }

    let http_url = format!("http://{host}/");
    let http = probe.get(&http_url)?;
    let to_https = http
        .location
        .as_deref()
        .map(|l| l.starts_with("https://"))
        .unwrap_or(false);
    checks.push(check(
        "https-redirect",
        http_url,
        (300..400).contains(&http.status) && to_https,
        format!("status {}, location {:?}", http.status, http.location),
    ));

    let bucket_url = format!(
        "https://{}.s3.{}.amazonaws.com/{entry_document}",
        web.bucket_name, web.region
    );
    let direct = probe.get(&bucket_url)?;
    checks.push(check(
        "bucket-private",
        bucket_url,
        direct.status == 403,
        format!("status {}", direct.status),
    ));

    Ok(VerifyReport { hostname: host.clone(), checks })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    /// answers with fixed responses per url prefix.
    struct Canned(BTreeMap<&'static str, ProbeResponse>);

    impl Probe for Canned {
        fn get(&self, url: &str) -> Result<ProbeResponse> {
            self.0
                .iter()
                .filter(|(prefix, _)| url.starts_with(*prefix))
                .max_by_key(|(prefix, _)| prefix.len())
                .map(|(_, r)| r.clone())
                .ok_or_else(|| Error::provider(url, "no canned response"))
        }
    }

    fn ok(body: &str) -> ProbeResponse {
        ProbeResponse { status: 200, location: None, body: body.into() }
    }

    fn web() -> WebOutputs {
        WebOutputs {
            stack_name: "SiteStack-dev-web".into(),
            region: "us-west-1".into(),
            bucket_name: "site-bucket".into(),
            distribution_id: "E1".into(),
            distribution_domain_name: "d1.cloudfront.net".into(),
            site_hostname: "ledger.dev.example.house".into(),
        }
    }

    #[test]
    fn healthy_site_passes_every_check() {
        let mut responses = BTreeMap::new();
        responses.insert("https://ledger.dev.example.house/", ok("<html>shell</html>"));
        responses.insert(
            "http://ledger.dev.example.house/",
            ProbeResponse { status: 301, location: Some("https://ledger.dev.example.house/".into()), body: String::new() },
        );
        responses.insert(
            "https://site-bucket.s3.",
            ProbeResponse { status: 403, location: None, body: String::new() },
        );
        let report = verify(&Canned(responses), &web(), "index.html").unwrap();
        assert_eq!(report.checks.len(), 5);
        assert!(report.passed(), "{:?}", report.failures());
    }

    #[test]
    fn public_bucket_and_missing_fallback_fail() {
        let mut responses = BTreeMap::new();
        responses.insert("https://ledger.dev.example.house/", ok("<html>shell</html>"));
        responses.insert(
            "https://ledger.dev.example.house/sitestack-verify",
            ProbeResponse { status: 404, location: None, body: "Not Found".into() },
        );
        responses.insert(
            "http://ledger.dev.example.house/",
            ProbeResponse { status: 301, location: Some("https://ledger.dev.example.house/".into()), body: String::new() },
        );
        responses.insert("https://site-bucket.s3.", ok("<html>shell</html>"));
        let report = verify(&Canned(responses), &web(), "index.html").unwrap();
        let failed: Vec<&str> = report.failures().iter().map(|c| c.name).collect();
        assert_eq!(failed, vec!["missing-route", "bucket-private"]);
    }
}
