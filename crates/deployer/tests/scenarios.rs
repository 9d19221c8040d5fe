//! End-to-end deployment runs against fake serving and service layers.

mod common;

use std::fs;

use certshift::{ForceFlag, RunOptions, RunState};
use certshift_common::{CheckStatus, DeploymentMode, Severity};

use common::{challenge_server, host_of, FakeAuthority, Harness, Site};

#[tokio::test]
async fn test_fresh_host_serves_plaintext() {
    let site = Site::new(&["main", "api"], "example.com");
    let harness = Harness::new(&site, FakeAuthority::default());

    let run = harness.orchestrator.deploy(RunOptions::default()).await;

    assert_eq!(
        run.states,
        vec![
            RunState::Scanning,
            RunState::Deciding,
            RunState::Applying,
            RunState::Validating,
            RunState::Done
        ]
    );
    assert_eq!(run.plan.as_ref().unwrap().mode, DeploymentMode::HttpOnly);
    assert_eq!(run.report.exit_code(), 0, "{}", run.report.render_text());

    let missing = run
        .report
        .checks
        .iter()
        .find(|c| c.check == "certificate:main")
        .unwrap();
    assert_eq!(missing.status, CheckStatus::Ok);
    assert_eq!(missing.message, "No certificate installed");

    let live = site.live_config().unwrap();
    assert!(live.contains("listen 80"));
    assert!(!live.contains("443"));
    assert!(site.env_file().unwrap().contains("SECURE_SSL_REDIRECT=False"));
    assert_eq!(harness.serving.reloads(), 1);

    let monitor = harness.orchestrator.components().monitor.run().await;
    assert!(monitor.records.is_empty());
    assert_eq!(monitor.dispatched, 0);
    assert_eq!(monitor.report.exit_code(), 0);
}

#[tokio::test]
async fn test_one_expired_group_raises_single_critical_alert() {
    let mut site = Site::new(&["main", "api", "docs", "shop"], "example.com");
    let history = site.dir.path().join("alerts.jsonl");
    site.config.monitor.history_file = Some(history.clone());
    for group in ["main", "api", "docs"] {
        site.write_bundle(group, 60);
    }
    site.write_bundle("shop", -3);
    let harness = Harness::new(&site, FakeAuthority::default());

    let run = harness.orchestrator.deploy(RunOptions::default()).await;
    assert_eq!(run.state(), RunState::Done);
    // One required group lacks a valid bundle
    assert_eq!(run.plan.as_ref().unwrap().mode, DeploymentMode::HttpOnly);
    assert_eq!(run.report.overall_status, Severity::Warning);

    let monitor = harness.orchestrator.components().monitor.run().await;
    let critical: Vec<_> = monitor
        .records
        .iter()
        .filter(|r| r.severity == Severity::Critical)
        .collect();
    assert_eq!(monitor.records.len(), 4);
    assert_eq!(critical.len(), 1);
    assert_eq!(critical[0].group, "shop");
    assert_eq!(monitor.dispatched, 1);
    assert_eq!(monitor.report.exit_code(), 2);

    let lines = fs::read_to_string(&history).unwrap();
    assert_eq!(lines.lines().count(), 1);
    assert!(lines.contains("\"shop\""));
}

#[tokio::test]
async fn test_forced_encryption_without_certificates_aborts() {
    let site = Site::new(&["main"], "example.com");
    fs::write(&site.config.serving.live_config, "# previous\n").unwrap();
    let harness = Harness::new(&site, FakeAuthority::default());

    let run = harness
        .orchestrator
        .deploy(RunOptions {
            force: ForceFlag::Https,
            ..RunOptions::default()
        })
        .await;

    assert_eq!(
        run.states,
        vec![RunState::Scanning, RunState::Deciding, RunState::Aborted]
    );
    assert!(run.plan.is_none());
    assert_eq!(run.report.exit_code(), 2);
    let failure = run
        .report
        .checks
        .iter()
        .find(|c| c.check == "acquisition")
        .unwrap();
    assert_eq!(failure.status, CheckStatus::Critical);
    assert!(failure.message.contains("main"));

    assert_eq!(site.live_config().unwrap(), "# previous\n");
    assert!(site.env_file().is_none());
    assert_eq!(harness.serving.validations(), 0);
}

#[tokio::test]
async fn test_forced_encryption_aborts_before_acquisition() {
    let webroot = tempfile::tempdir().unwrap();
    let server = challenge_server(webroot.path()).await;
    let mut site = Site::new(&["main"], &host_of(&server));
    site.config.paths.webroot = webroot.path().to_path_buf();
    site.config.acquire_missing = true;
    fs::write(&site.config.serving.live_config, "# previous\n").unwrap();
    let harness = Harness::new(&site, FakeAuthority::default());

    let run = harness
        .orchestrator
        .deploy(RunOptions {
            force: ForceFlag::Https,
            acquire: true,
            ..RunOptions::default()
        })
        .await;

    assert_eq!(
        run.states,
        vec![RunState::Scanning, RunState::Deciding, RunState::Aborted]
    );
    assert_eq!(run.report.exit_code(), 2);
    assert_eq!(site.live_config().unwrap(), "# previous\n");
    assert_eq!(harness.serving.validations(), 0);
    assert_eq!(harness.serving.reloads(), 0);
    assert_eq!(harness.authority.issued(), 0);
}

#[tokio::test]
async fn test_dry_run_obtain_only_checks_reachability() {
    let webroot = tempfile::tempdir().unwrap();
    let server = challenge_server(webroot.path()).await;
    let mut site = Site::new(&["main"], &host_of(&server));
    site.config.paths.webroot = webroot.path().to_path_buf();
    site.config.groups.push(certshift_common::DomainGroup::new(
        "down",
        vec!["127.0.0.1:1".to_string()],
    ));
    let harness = Harness::new(&site, FakeAuthority::default());

    let report = harness
        .orchestrator
        .obtain(&site.config.groups, true)
        .await;

    let status = |name: &str| report.checks.iter().find(|c| c.check == name).unwrap().status;
    assert_eq!(status("acquire:main"), CheckStatus::Ok);
    assert_eq!(status("acquire:down"), CheckStatus::Warning);
    assert_eq!(harness.authority.issued(), 0);
    assert_eq!(harness.serving.validations(), 0);
    assert!(site.live_config().is_none());
    assert!(!site.config.paths.cert_root.join("main").exists());
    assert!(!site.config.paths.state_dir.join("applied.json").exists());
}

#[tokio::test]
async fn test_forced_plaintext_ignores_valid_certificates() {
    let site = Site::new(&["main"], "example.com");
    site.write_bundle("main", 60);
    let harness = Harness::new(&site, FakeAuthority::default());

    let run = harness
        .orchestrator
        .deploy(RunOptions {
            force: ForceFlag::Http,
            acquire: true,
            ..RunOptions::default()
        })
        .await;

    assert_eq!(run.state(), RunState::Done);
    assert_eq!(run.plan.unwrap().mode, DeploymentMode::ForcedHttp);
    assert_eq!(harness.authority.issued(), 0);
    assert!(!site.live_config().unwrap().contains("443"));
}

#[tokio::test]
async fn test_dry_run_leaves_host_untouched() {
    let site = Site::new(&["main"], "example.com");
    site.write_bundle("main", 60);
    let harness = Harness::new(&site, FakeAuthority::default());

    let run = harness
        .orchestrator
        .deploy(RunOptions {
            dry_run: true,
            ..RunOptions::default()
        })
        .await;

    assert_eq!(run.state(), RunState::Done);
    assert!(!run.states.contains(&RunState::Validating));
    assert!(run.applied.unwrap().dry_run);
    assert_eq!(harness.serving.validations(), 1);
    assert_eq!(harness.serving.reloads(), 0);
    assert!(site.live_config().is_none());
    assert!(site.env_file().is_none());
    assert_eq!(site.live_dir_entries(), Vec::<String>::new());
}

#[tokio::test]
async fn test_acquisition_moves_fresh_host_to_https() {
    let webroot = tempfile::tempdir().unwrap();
    let server = challenge_server(webroot.path()).await;
    let mut site = Site::new(&["main", "api"], &host_of(&server));
    site.config.paths.webroot = webroot.path().to_path_buf();
    let harness = Harness::new(&site, FakeAuthority::default());

    let run = harness
        .orchestrator
        .deploy(RunOptions {
            acquire: true,
            ..RunOptions::default()
        })
        .await;

    assert_eq!(
        run.states,
        vec![
            RunState::Scanning,
            RunState::Deciding,
            RunState::Acquiring,
            RunState::Applying,
            RunState::Validating,
            RunState::Done
        ],
        "{}",
        run.report.render_text()
    );
    assert_eq!(harness.authority.issued(), 2);
    let plan = run.plan.unwrap();
    assert_eq!(plan.mode, DeploymentMode::Https);
    assert!(plan.is_fully_encrypted());

    // Challenge-only during acquisition, then the encrypted variant
    assert_eq!(harness.serving.reloads(), 2);
    assert!(site.live_config().unwrap().contains("listen 443 ssl"));
    let env = site.env_file().unwrap();
    assert!(env.contains("SECURE_COOKIES=True"));
    assert!(env.contains("SECURE_SSL_REDIRECT=True"));

    let acquired: Vec<_> = run
        .report
        .checks
        .iter()
        .filter(|c| c.check.starts_with("acquire:"))
        .collect();
    assert_eq!(acquired.len(), 2);
    assert!(acquired.iter().all(|c| c.status == CheckStatus::Ok));
}

#[tokio::test]
async fn test_status_is_read_only() {
    let site = Site::new(&["main"], "example.com");
    site.write_bundle("main", 20);
    let harness = Harness::new(&site, FakeAuthority::default());

    let report = harness.orchestrator.status();

    let expiry = report.checks.iter().find(|c| c.check == "expiry:main").unwrap();
    assert_eq!(expiry.status, CheckStatus::Warning);
    let applied = report.checks.iter().find(|c| c.check == "applied").unwrap();
    assert_eq!(applied.message, "No configuration applied yet");
    assert!(site.live_config().is_none());
    assert!(!site.config.paths.state_dir.join("applied.json").exists());
}
