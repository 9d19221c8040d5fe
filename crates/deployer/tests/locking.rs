//! Mutual exclusion between concurrent mutating runs.

mod common;

use std::time::Duration;

use certshift_common::CheckStatus;

use common::{challenge_server, host_of, FakeAuthority, Harness, Site};

#[tokio::test]
async fn test_concurrent_obtain_is_refused() {
    let webroot = tempfile::tempdir().unwrap();
    let server = challenge_server(webroot.path()).await;
    let mut site = Site::new(&["main"], &host_of(&server));
    site.config.paths.webroot = webroot.path().to_path_buf();
    site.config.timeouts.lock_secs = 1;
    let harness = Harness::new(&site, FakeAuthority::slow(Duration::from_secs(3)));
    let groups = site.config.groups.clone();

    let (a, b) = tokio::join!(
        harness.orchestrator.obtain(&groups, false),
        harness.orchestrator.obtain(&groups, false),
    );

    let locked: Vec<_> = [&a, &b]
        .into_iter()
        .filter(|r| r.checks.iter().any(|c| c.check == "lock"))
        .collect();
    assert_eq!(locked.len(), 1, "exactly one run must be refused");
    let refused = locked[0].checks.iter().find(|c| c.check == "lock").unwrap();
    assert_eq!(refused.status, CheckStatus::Critical);
    assert_eq!(locked[0].exit_code(), 2);

    assert_eq!(harness.authority.issued(), 1);
}

#[tokio::test]
async fn test_lock_released_after_run() {
    let site = Site::new(&["main"], "example.com");
    let harness = Harness::new(&site, FakeAuthority::default());

    harness.orchestrator.deploy(Default::default()).await;
    let second = harness.orchestrator.deploy(Default::default()).await;
    assert!(!second.report.checks.iter().any(|c| c.check == "lock"));
}
