//! Certificate renewal.
//!
//! A pass renews every group whose existing bundle is within the renewal
//! window, then reloads the serving layer once if anything changed. Groups
//! without a bundle are left to `deploy`. Passes are idempotent: a second
//! pass right after a successful one renews nothing and reloads nothing.
//!
//! A dry pass lists the due groups and runs the reachability check for each,
//! without asking the authority, installing or reloading.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use certshift_common::DomainGroup;
use certshift_config::Config;

use super::engine::AcquisitionEngine;
use crate::error::{ConfigApplyError, DeployError, RenewalError};
use crate::lock::DeployLock;
use crate::schedule::RecurringTask;
use crate::store::CertificateStore;
use crate::switcher::ConfigSwitcher;

/// Default check interval (12 hours)
const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(12 * 3600);

/// Minimum check interval (1 hour)
const MIN_CHECK_INTERVAL: Duration = Duration::from_secs(3600);

/// Result of one renewal pass
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RenewalOutcome {
    /// Groups inspected
    pub checked: usize,
    /// Groups inside the renewal window
    pub due: Vec<String>,
    pub renewed: Vec<String>,
    /// `(group, error)` for renewals that failed
    pub failed: Vec<(String, String)>,
    /// Bundle swaps repaired before the pass
    pub recovered: Vec<String>,
    pub reloaded: bool,
    pub dry_run: bool,
}

impl RenewalOutcome {
    pub fn is_noop(&self) -> bool {
        self.renewed.is_empty() && self.failed.is_empty()
    }

    /// The failures as an error, if any
    pub fn partial_error(&self) -> Option<RenewalError> {
        if self.failed.is_empty() {
            None
        } else {
            Some(RenewalError::Partial {
                failed: self.failed.clone(),
            })
        }
    }

    pub fn summary(&self) -> String {
        if self.dry_run {
            return format!(
                "dry run: {} of {} groups due, {} unreachable",
                self.due.len(),
                self.checked,
                self.failed.len()
            );
        }
        if self.is_noop() {
            return format!("nothing to do ({} groups checked)", self.checked);
        }
        format!(
            "renewed {}, failed {}, reloaded: {}",
            self.renewed.len(),
            self.failed.len(),
            self.reloaded
        )
    }
}

/// Renews bundles nearing expiry
pub struct RenewalScheduler {
    engine: Arc<AcquisitionEngine>,
    store: Arc<CertificateStore>,
    switcher: Arc<ConfigSwitcher>,
    groups: Vec<DomainGroup>,
    renew_before_days: i64,
    lock: DeployLock,
    check_interval: Duration,
}

impl RenewalScheduler {
    pub fn new(
        config: &Config,
        engine: Arc<AcquisitionEngine>,
        store: Arc<CertificateStore>,
        switcher: Arc<ConfigSwitcher>,
    ) -> Self {
        Self {
            engine,
            store,
            switcher,
            groups: config.groups.clone(),
            renew_before_days: i64::from(config.renewal.renew_before_days),
            lock: DeployLock::new(&config.paths.state_dir, config.timeouts.lock()),
            check_interval: DEFAULT_CHECK_INTERVAL,
        }
        .with_interval(Duration::from_secs(config.renewal.interval_hours * 3600))
    }

    /// Set the check interval, clamped to a minimum of 1 hour
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval.max(MIN_CHECK_INTERVAL);
        self
    }

    pub fn check_interval(&self) -> Duration {
        self.check_interval
    }

    /// One renewal pass under the deployment lock
    pub async fn run_once(&self) -> Result<RenewalOutcome, RenewalError> {
        self.run_pass(false).await
    }

    /// One renewal pass; a dry pass only checks the due groups' reachability
    pub async fn run_pass(&self, dry_run: bool) -> Result<RenewalOutcome, RenewalError> {
        let guard = self.lock.acquire().await?;
        let mut outcome = RenewalOutcome {
            dry_run,
            ..RenewalOutcome::default()
        };

        if !dry_run {
            match self.store.recover_interrupted(&guard) {
                Ok(recovered) => outcome.recovered = recovered,
                Err(e) => warn!(error = %e, "Failed to repair interrupted bundle installs"),
            }
        }

        let now = Utc::now();
        let statuses = self.store.scan_at(&self.groups, now);
        outcome.checked = self.groups.len();

        let due: Vec<&DomainGroup> = self
            .groups
            .iter()
            .filter(|group| {
                let Some(status) = statuses.get(&group.name) else {
                    return false;
                };
                match status.bundle() {
                    Some(bundle) => {
                        let days = bundle.days_remaining(now);
                        debug!(group = %group.name, days_remaining = days, "Checked bundle expiry");
                        days < self.renew_before_days
                    }
                    None => {
                        debug!(group = %group.name, state = status.label(), "No bundle to renew");
                        false
                    }
                }
            })
            .collect();
        outcome.due = due.iter().map(|g| g.name.clone()).collect();

        if due.is_empty() {
            info!(groups = outcome.checked, "No certificates need renewal");
            return Ok(outcome);
        }

        if dry_run {
            for group in due {
                if let Err(e) = self.engine.check_reachability(group).await {
                    outcome.failed.push((group.name.clone(), e.to_string()));
                }
            }
            info!(due = ?outcome.due, unreachable = outcome.failed.len(), "Dry run: no certificates requested");
            return Ok(outcome);
        }

        info!(groups = ?due.iter().map(|g| &g.name).collect::<Vec<_>>(), "Renewing certificates");
        for group in due {
            match self.engine.obtain_locked(&guard, group).await {
                Ok(_) => outcome.renewed.push(group.name.clone()),
                Err(e) => outcome.failed.push((group.name.clone(), e.to_string())),
            }
        }

        if !outcome.renewed.is_empty() {
            let statuses = self.store.scan(&self.groups);
            match self.switcher.reapply_locked(&guard, &statuses).await {
                Ok(_) => {
                    outcome.reloaded = true;
                    info!(renewed = ?outcome.renewed, "Serving layer reloaded with renewed certificates");
                }
                Err(ConfigApplyError::NothingApplied) => {
                    debug!("No applied plan yet; renewed bundles take effect on next deploy");
                }
                Err(e) => {
                    error!(error = %e, "Reload after renewal failed");
                    return Err(e.into());
                }
            }
        }

        if !outcome.failed.is_empty() {
            warn!(failed = ?outcome.failed, "Some renewals failed");
        }
        Ok(outcome)
    }
}

#[async_trait]
impl RecurringTask for RenewalScheduler {
    fn name(&self) -> &'static str {
        "renew"
    }

    fn interval(&self) -> Duration {
        self.check_interval
    }

    async fn run_once(&self) -> Result<String, DeployError> {
        let outcome = RenewalScheduler::run_once(self).await?;
        match outcome.partial_error() {
            Some(e) => Err(e.into()),
            None => Ok(outcome.summary()),
        }
    }
}

impl std::fmt::Debug for RenewalScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenewalScheduler")
            .field("groups", &self.groups.len())
            .field("renew_before_days", &self.renew_before_days)
            .field("check_interval", &self.check_interval)
            .finish()
    }
}
