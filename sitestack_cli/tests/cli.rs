use std::process::Command;

fn write_config(dir: &std::path::Path) -> std::path::PathBuf {
    let path = dir.join("site.toml");
    std::fs::write(
        &path,
        r#"
[site]
apex_domain = "example.house"
app_label = "ledger"
"#,
    )
    .unwrap();
    path
}

#[test]
fn json_mode_keeps_stdout_parseable() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    let out = dir.path().join("out");

    let output = Command::new(env!("CARGO_BIN_EXE_sitestack"))
        .arg("--json")
        .arg("--config")
        .arg(&config)
        .args(["-c", "app-environment=dev"])
        .arg("synth")
        .arg("--out")
        .arg(&out)
        .args(["--zone-id", "/hostedzone/Z0TEST"])
        .env("RUST_LOG", "debug")
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let manifest: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(manifest["environment"], "dev");
    assert_eq!(manifest["hostname"], "ledger.dev.example.house");
    // log lines go to stderr
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("resolved environment"), "{stderr}");
    assert!(out.join("SiteStack-dev-web.template.json").is_file());
}

#[test]
fn missing_environment_fails_without_output() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());

    let output = Command::new(env!("CARGO_BIN_EXE_sitestack"))
        .arg("--config")
        .arg(&config)
        .arg("synth")
        .args(["--zone-id", "/hostedzone/Z0TEST"])
        .arg("--out")
        .arg(dir.path().join("out"))
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(output.stdout.is_empty());
    assert!(!dir.path().join("out").exists());
}
