use std::path::Path;
use std::time::Duration;

use sitestack::provider::memory::{Call, StackBehaviour};
use sitestack::verify::verify;
use sitestack::{EnvironmentName, Error, MemoryProvider, Provisioner, SiteConfig};

const INDEX: &str = "<!doctype html><html><body><div id=\"app\"></div></body></html>";
const APP_JS: &str = "console.log('ledger')";

fn write(dir: &Path, rel: &str, contents: &str) {
    let path = dir.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, contents).unwrap();
}

fn site(artifacts: &Path) -> SiteConfig {
    let mut config = SiteConfig::from_toml_str(
        r#"
        [site]
        apex_domain = "example.house"
        app_label = "ledger"
        "#,
    )
    .unwrap();
    config.site.artifact_dir = artifacts.to_path_buf();
    config
}

fn build_dir() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "index.html", INDEX);
    write(dir.path(), "static/app.js", APP_JS);
    dir
}

fn env(name: &str) -> EnvironmentName {
    EnvironmentName::new(name).unwrap()
}

fn provisioner<'a>(provider: &'a MemoryProvider, config: &'a SiteConfig) -> Provisioner<'a, MemoryProvider> {
    Provisioner::new(provider, config).with_timeouts(Duration::from_millis(200), Duration::from_millis(1))
}

fn count(calls: &[Call], pred: impl Fn(&Call) -> bool) -> usize {
    calls.iter().filter(|c| pred(c)).count()
}

#[tokio::test]
async fn dev_deploy_serves_the_app_behind_https() {
    let build = build_dir();
    let config = site(build.path());
    let provider = MemoryProvider::with_zone("example.house");

    let report = provisioner(&provider, &config).deploy(&env("dev"), true).await.unwrap();
    assert_eq!(report.hostname, "ledger.dev.example.house");
    assert_eq!(report.web.site_hostname, "ledger.dev.example.house");
    assert_eq!(report.units.len(), 2);
    assert!(report.units.iter().all(|u| u.changed));

    let host = "ledger.dev.example.house";
    assert_eq!(provider.resolve(host).as_deref(), Some(report.web.distribution_domain_name.as_str()));

    let root = provider.edge_get(host, "/", true).unwrap();
    assert_eq!(root.status, 200);
    assert_eq!(root.text(), INDEX);

    let js = provider.edge_get(host, "/static/app.js", true).unwrap();
    assert_eq!(js.status, 200);
    assert_eq!(js.text(), APP_JS);
    assert_eq!(js.content_type.as_deref(), Some("text/javascript; charset=utf-8"));

    // client side routes and over-long keys both come back as the app shell
    let route = provider.edge_get(host, "/accounts/42/settings", true).unwrap();
    assert_eq!((route.status, route.text().as_str()), (200, INDEX));
    let long = format!("/{}", "x".repeat(2000));
    let bad = provider.edge_get(host, &long, true).unwrap();
    assert_eq!((bad.status, bad.text().as_str()), (200, INDEX));

    let plain = provider.edge_get(host, "/", false).unwrap();
    assert_eq!(plain.status, 301);
    assert_eq!(plain.location.as_deref(), Some("https://ledger.dev.example.house/"));

    assert_eq!(provider.anonymous_get(&report.web.bucket_name, "index.html"), 403);

    let checks = verify(&provider, &report.web, "index.html").unwrap();
    assert!(checks.passed(), "{:?}", checks.failures());
}

#[tokio::test]
async fn prod_uses_the_bare_application_hostname() {
    let build = build_dir();
    let config = site(build.path());
    let provider = MemoryProvider::with_zone("example.house");

    let report = provisioner(&provider, &config).deploy(&env("prod"), true).await.unwrap();
    assert_eq!(report.web.site_hostname, "ledger.example.house");
    assert_eq!(provider.edge_get("ledger.example.house", "/", true).unwrap().status, 200);
    assert!(provider.resolve("ledger.prod.example.house").is_none());
}

#[tokio::test]
async fn environments_are_isolated() {
    let build = build_dir();
    let config = site(build.path());
    let provider = MemoryProvider::with_zone("example.house");

    let dev = provisioner(&provider, &config).deploy(&env("dev"), true).await.unwrap();
    let staging = provisioner(&provider, &config).deploy(&env("staging"), true).await.unwrap();

    assert_ne!(dev.web.bucket_name, staging.web.bucket_name);
    assert_ne!(dev.web.distribution_id, staging.web.distribution_id);
    assert_eq!(provider.stack_names().len(), 4);
    assert_eq!(provider.record_count(), 2);
    assert_eq!(provider.certificate_count(), 2);
    assert_eq!(provider.edge_get("ledger.staging.example.house", "/", true).unwrap().status, 200);
}

#[tokio::test]
async fn certificate_stack_goes_first_in_us_east_1() {
    let build = build_dir();
    let mut config = site(build.path());
    config.site.deploy_region = "eu-west-1".into();
    let provider = MemoryProvider::with_zone("example.house");

    provisioner(&provider, &config).deploy(&env("dev"), false).await.unwrap();

    let submitted: Vec<(String, String)> = provider
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            Call::SubmitStack { region, name } => Some((region, name)),
            _ => None,
        })
        .collect();
    assert_eq!(
        submitted,
        vec![
            ("us-east-1".to_string(), "SiteStack-dev-certificates".to_string()),
            ("eu-west-1".to_string(), "SiteStack-dev-web".to_string()),
        ]
    );

    // the certificate reaches the web stack as a parameter, not a shared resource
    let web = provider.stack_template("eu-west-1", "SiteStack-dev-web").unwrap();
    assert!(web.parameters.contains_key("CertificateArn"));
    assert!(!web.resources.contains_key("SiteCertificate"));
}

#[tokio::test]
async fn redeploying_unchanged_input_changes_nothing() {
    let build = build_dir();
    let config = site(build.path());
    let provider = MemoryProvider::with_zone("example.house");
    let p = provisioner(&provider, &config);

    p.deploy(&env("dev"), true).await.unwrap();
    provider.clear_calls();

    let again = p.deploy(&env("dev"), true).await.unwrap();
    assert!(again.units.iter().all(|u| !u.changed));
    let publish = again.publish.unwrap();
    assert!(publish.plan.is_empty());
    assert_eq!(publish.plan.unchanged.len(), 2);

    let calls = provider.calls();
    assert_eq!(count(&calls, |c| matches!(c, Call::PutObject { .. })), 0);
    assert_eq!(count(&calls, |c| matches!(c, Call::DeleteObject { .. })), 0);
    // every publish still invalidates, exactly once
    assert_eq!(count(&calls, |c| matches!(c, Call::CreateInvalidation { .. })), 1);
    assert_eq!(provider.record_count(), 1);
}

#[tokio::test]
async fn publish_mirrors_the_artifact_directory() {
    let build = build_dir();
    let config = site(build.path());
    let provider = MemoryProvider::with_zone("example.house");
    let p = provisioner(&provider, &config);

    let report = p.deploy(&env("dev"), true).await.unwrap();
    let bucket = report.web.bucket_name.clone();
    provider.seed_object(&bucket, "static/old-chunk.js", b"stale");

    write(build.path(), "index.html", "<html>v2</html>");
    write(build.path(), "static/app.js", "console.log('v2')");
    provider.clear_calls();

    let publish = p.publish(&env("dev")).await.unwrap();
    assert_eq!(publish.plan.uploads, vec!["static/app.js", "index.html"]);
    assert_eq!(publish.plan.deletions, vec!["static/old-chunk.js"]);

    let objects = provider.objects(&bucket);
    let keys: Vec<&str> = objects.keys().map(|k| k.as_str()).collect();
    assert_eq!(keys, vec!["index.html", "static/app.js"]);

    let calls = provider.calls();
    let invalidations: Vec<&Call> = calls
        .iter()
        .filter(|c| matches!(c, Call::CreateInvalidation { .. }))
        .collect();
    assert_eq!(invalidations.len(), 1);
    match invalidations[0] {
        Call::CreateInvalidation { distribution_id, paths } => {
            assert_eq!(distribution_id, &report.web.distribution_id);
            assert_eq!(paths, &vec!["/*".to_string()]);
        }
        _ => unreachable!(),
    }
    // the invalidation comes after the last object change
    assert!(matches!(calls.last(), Some(Call::CreateInvalidation { .. })));

    let root = provider.edge_get("ledger.dev.example.house", "/", true).unwrap();
    assert_eq!(root.text(), "<html>v2</html>");
}

#[tokio::test]
async fn failed_upload_skips_the_invalidation() {
    let build = build_dir();
    let config = site(build.path());
    let provider = MemoryProvider::with_zone("example.house");
    let p = provisioner(&provider, &config);

    p.deploy(&env("dev"), false).await.unwrap();
    provider.fail_uploads_of("static/app.js");
    provider.clear_calls();

    let err = p.publish(&env("dev")).await.unwrap_err();
    assert!(matches!(err, Error::Provider { ref resource, .. } if resource.ends_with("static/app.js")));
    let calls = provider.calls();
    assert_eq!(count(&calls, |c| matches!(c, Call::CreateInvalidation { .. })), 0);
    assert!(provider.invalidations().is_empty());
}

#[tokio::test]
async fn missing_environment_stops_before_any_call() {
    let build = build_dir();
    let config = site(build.path());
    let provider = MemoryProvider::with_zone("example.house");
    let p = provisioner(&provider, &config);

    let empty = config.provisioning_context::<&str>(None, &[]).unwrap();
    let err = p.deploy_from_context(&empty, true).await.unwrap_err();
    assert!(matches!(err, Error::Configuration(_)), "{err}");

    let invalid = config.provisioning_context(None, &["app-environment=Dev_1"]).unwrap();
    let err = p.deploy_from_context(&invalid, true).await.unwrap_err();
    assert!(matches!(err, Error::Configuration(_)), "{err}");

    assert!(provider.calls().is_empty());
    assert!(provider.stack_names().is_empty());

    let dev = config.provisioning_context(None, &["app-environment=dev"]).unwrap();
    let report = p.deploy_from_context(&dev, true).await.unwrap();
    assert_eq!(report.environment, "dev");
}

#[tokio::test]
async fn missing_artifacts_stop_before_any_call() {
    let build = tempfile::tempdir().unwrap();
    let config = site(&build.path().join("does-not-exist"));
    let provider = MemoryProvider::with_zone("example.house");

    let err = provisioner(&provider, &config).deploy(&env("dev"), true).await.unwrap_err();
    assert!(matches!(err, Error::Configuration(_)), "{err}");
    assert!(provider.calls().is_empty());
}

#[tokio::test]
async fn unknown_hosted_zone_is_a_lookup_error() {
    let build = build_dir();
    let config = site(build.path());
    let provider = MemoryProvider::with_zone("other.house");

    let err = provisioner(&provider, &config).deploy(&env("dev"), true).await.unwrap_err();
    assert!(matches!(err, Error::Lookup { ref domain, .. } if domain == "example.house"));
    let calls = provider.calls();
    assert_eq!(count(&calls, |c| matches!(c, Call::SubmitStack { .. })), 0);
}

#[tokio::test]
async fn certificate_that_never_validates_times_out() {
    let build = build_dir();
    let config = site(build.path());
    let provider = MemoryProvider::with_zone("example.house");
    provider.set_behaviour(
        "SiteStack-dev-certificates",
        StackBehaviour { stuck: true, ..Default::default() },
    );

    let err = provisioner(&provider, &config).deploy(&env("dev"), true).await.unwrap_err();
    match err {
        Error::ValidationTimeout { stack, domain, .. } => {
            assert_eq!(stack, "SiteStack-dev-certificates");
            assert_eq!(domain, "ledger.dev.example.house");
        }
        other => panic!("unexpected error {other}"),
    }
    // the web stack is never attempted
    let calls = provider.calls();
    assert_eq!(count(&calls, |c| matches!(c, Call::SubmitStack { .. })), 1);
    assert_eq!(provider.record_count(), 0);
}

#[tokio::test]
async fn failed_resource_is_named_in_the_error() {
    let build = build_dir();
    let config = site(build.path());
    let provider = MemoryProvider::with_zone("example.house");
    provider.set_behaviour(
        "SiteStack-dev-web",
        StackBehaviour { fail_resource: Some("SiteDistribution".into()), ..Default::default() },
    );

    let err = provisioner(&provider, &config).deploy(&env("dev"), true).await.unwrap_err();
    match err {
        Error::Provider { resource, message } => {
            assert_eq!(resource, "SiteStack-dev-web/SiteDistribution");
            assert!(message.contains("ROLLBACK_COMPLETE"), "{message}");
        }
        other => panic!("unexpected error {other}"),
    }
    let calls = provider.calls();
    assert_eq!(count(&calls, |c| matches!(c, Call::PutObject { .. })), 0);
    assert_eq!(count(&calls, |c| matches!(c, Call::CreateInvalidation { .. })), 0);
}

#[tokio::test]
async fn slow_stacks_are_polled_until_complete() {
    let build = build_dir();
    let config = site(build.path());
    let provider = MemoryProvider::with_zone("example.house");
    provider.set_behaviour("SiteStack-dev-web", StackBehaviour { pending_polls: 3, ..Default::default() });

    let report = provisioner(&provider, &config).deploy(&env("dev"), false).await.unwrap();
    assert!(report.publish.is_none());
    assert_eq!(report.web.site_hostname, "ledger.dev.example.house");
}

#[tokio::test]
async fn publishing_an_undeployed_environment_fails() {
    let build = build_dir();
    let config = site(build.path());
    let provider = MemoryProvider::with_zone("example.house");

    let err = provisioner(&provider, &config).publish(&env("dev")).await.unwrap_err();
    assert!(matches!(err, Error::Provider { ref resource, .. } if resource == "SiteStack-dev-web"));
}

#[tokio::test]
async fn destroy_removes_web_before_certificates() {
    let build = build_dir();
    let config = site(build.path());
    let provider = MemoryProvider::with_zone("example.house");
    let p = provisioner(&provider, &config);

    p.deploy(&env("dev"), true).await.unwrap();
    provider.clear_calls();
    p.destroy(&env("dev")).await.unwrap();

    let deleted: Vec<String> = provider
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            Call::DeleteStack { name, .. } => Some(name),
            _ => None,
        })
        .collect();
    assert_eq!(deleted, vec!["SiteStack-dev-web", "SiteStack-dev-certificates"]);
    assert!(provider.stack_names().is_empty());
    assert!(provider.bucket_names().is_empty());
    assert_eq!(provider.record_count(), 0);
    assert_eq!(provider.certificate_count(), 0);

    // a second destroy has nothing left to do
    provider.clear_calls();
    p.destroy(&env("dev")).await.unwrap();
    assert!(provider.calls().is_empty());
}

#[tokio::test]
async fn synth_writes_both_templates_without_deploying() {
    let build = build_dir();
    let config = site(build.path());
    let provider = MemoryProvider::with_zone("example.house");
    let out = tempfile::tempdir().unwrap();

    let app = provisioner(&provider, &config).synth(&env("qa"), out.path()).await.unwrap();
    assert_eq!(app.hostname.to_string(), "ledger.qa.example.house");
    assert!(out.path().join("SiteStack-qa-certificates.template.json").is_file());
    assert!(out.path().join("SiteStack-qa-web.template.json").is_file());
    assert!(out.path().join("manifest.json").is_file());

    let graph = app.graph().unwrap();
    let distribution = app.distribution_address().unwrap();
    assert!(graph.depends_on(&distribution, &app.certificate_address()));

    let calls = provider.calls();
    assert_eq!(calls, vec![Call::FindHostedZone { domain: "example.house".into() }]);
}

#[tokio::test]
async fn rolled_back_update_keeps_the_environment_usable() {
    let build = build_dir();
    let config = site(build.path());
    let provider = MemoryProvider::with_zone("example.house");
    let before = provisioner(&provider, &config).deploy(&env("dev"), true).await.unwrap();

    // a change to the web unit only, failing on the distribution
    let mut changed = config.clone();
    changed.site.entry_document = "app.html".into();
    provider.set_behaviour(
        "SiteStack-dev-web",
        StackBehaviour { fail_resource: Some("SiteDistribution".into()), ..Default::default() },
    );
    let err = provisioner(&provider, &changed).deploy(&env("dev"), false).await.unwrap_err();
    match err {
        Error::Provider { resource, message } => {
            assert_eq!(resource, "SiteStack-dev-web/SiteDistribution");
            assert!(message.starts_with("UPDATE_ROLLBACK_COMPLETE"), "{message}");
        }
        other => panic!("unexpected error {other}"),
    }
    provider.set_behaviour("SiteStack-dev-web", StackBehaviour::default());

    let p = provisioner(&provider, &config);
    assert_eq!(p.web_outputs(&env("dev")).await.unwrap(), before.web);
    p.publish(&env("dev")).await.unwrap();
    assert_eq!(provider.edge_get("ledger.dev.example.house", "/", true).unwrap().text(), INDEX);

    // the last good input matches what the rollback restored
    provider.clear_calls();
    let again = p.deploy(&env("dev"), false).await.unwrap();
    assert!(again.units.iter().all(|u| !u.changed));
    assert_eq!(again.web, before.web);
}

#[tokio::test]
async fn invalidation_wait_is_bounded() {
    let build = build_dir();
    let mut config = site(build.path());
    config.deploy.wait_for_invalidation = true;
    let provider = MemoryProvider::with_zone("example.house");
    let p = provisioner(&provider, &config);

    let report = p.deploy(&env("dev"), true).await.unwrap();
    assert!(report.publish.unwrap().invalidation_completed);

    provider.hold_invalidations();
    let err = p.publish(&env("dev")).await.unwrap_err();
    match err {
        Error::Provider { resource, message } => {
            assert_eq!(resource, report.web.distribution_id);
            assert!(message.starts_with("timed out waiting for invalidation"), "{message}");
        }
        other => panic!("unexpected error {other}"),
    }
}
