//! Certificate expiry monitoring.
//!
//! Classifies every parseable bundle by whole days remaining, reports one
//! check per group and forwards alerts at or above the configured severity
//! to the alert sinks. Monitoring never changes certificates or the serving
//! layer.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use certshift_common::{DomainGroup, ReportCheck, Severity, StatusReport};
use certshift_config::{Config, MonitorConfig};

use crate::error::{AlertError, DeployError};
use crate::schedule::RecurringTask;
use crate::store::{BundleStatus, CertificateBundle, CertificateStore, ScanResult};

mod sinks;

pub use sinks::{AlertSink, JsonlSink, LogSink, WebhookSink};

/// Day thresholds, inclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    pub warning_days: i64,
    pub critical_days: i64,
}

impl Thresholds {
    pub fn from_config(monitor: &MonitorConfig) -> Self {
        Self {
            warning_days: monitor.warning_days,
            critical_days: monitor.critical_days,
        }
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self::from_config(&MonitorConfig::default())
    }
}

/// Severity for a number of whole days remaining
pub fn classify_days(days_remaining: i64, thresholds: Thresholds) -> Severity {
    if days_remaining <= thresholds.critical_days {
        Severity::Critical
    } else if days_remaining <= thresholds.warning_days {
        Severity::Warning
    } else {
        Severity::Ok
    }
}

/// Severity of `bundle` at `now`
pub fn classify(bundle: &CertificateBundle, now: DateTime<Utc>, thresholds: Thresholds) -> Severity {
    classify_days(bundle.days_remaining(now), thresholds)
}

/// One group's expiry state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub group: String,
    pub severity: Severity,
    pub days_remaining: i64,
    pub not_after: DateTime<Utc>,
    pub subject_names: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

/// Outcome of a monitor run
#[derive(Debug, Clone)]
pub struct MonitorRun {
    pub records: Vec<AlertRecord>,
    pub report: StatusReport,
    /// Alerts delivered to at least one sink
    pub dispatched: usize,
}

pub struct ExpiryMonitor {
    store: Arc<CertificateStore>,
    groups: Vec<DomainGroup>,
    thresholds: Thresholds,
    min_severity: Severity,
    sinks: Vec<Arc<dyn AlertSink>>,
    interval: Duration,
}

impl ExpiryMonitor {
    pub fn new(config: &Config, store: Arc<CertificateStore>, sinks: Vec<Arc<dyn AlertSink>>) -> Self {
        Self {
            store,
            groups: config.groups.clone(),
            thresholds: Thresholds::from_config(&config.monitor),
            min_severity: config.monitor.min_severity,
            sinks,
            interval: Duration::from_secs(config.monitor.interval_hours.max(1) * 3600),
        }
    }

    /// Monitor with the sinks named in the configuration: always the log,
    /// plus the webhook and history file when configured.
    pub fn from_config(config: &Config, store: Arc<CertificateStore>) -> Result<Self, AlertError> {
        let mut sinks: Vec<Arc<dyn AlertSink>> = vec![Arc::new(LogSink)];
        if let Some(ref url) = config.monitor.webhook_url {
            sinks.push(Arc::new(WebhookSink::new(url.clone(), config.timeouts.network())?));
        }
        if let Some(ref path) = config.monitor.history_file {
            sinks.push(Arc::new(JsonlSink::new(path.clone())));
        }
        Ok(Self::new(config, store, sinks))
    }

    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
    }

    /// A record for every valid or expired bundle
    pub fn check(&self, statuses: &ScanResult, now: DateTime<Utc>) -> Vec<AlertRecord> {
        self.groups
            .iter()
            .filter_map(|group| {
                let bundle = statuses.get(&group.name)?.bundle()?;
                Some(AlertRecord {
                    group: group.name.clone(),
                    severity: classify(bundle, now, self.thresholds),
                    days_remaining: bundle.days_remaining(now),
                    not_after: bundle.not_after,
                    subject_names: bundle.subject_names.clone(),
                    timestamp: now,
                })
            })
            .collect()
    }

    /// One `expiry:<group>` check per configured group
    pub fn report(&self, statuses: &ScanResult, now: DateTime<Utc>) -> StatusReport {
        let records = self.check(statuses, now);
        let checks = self
            .groups
            .iter()
            .map(|group| {
                let name = format!("expiry:{}", group.name);
                if let Some(record) = records.iter().find(|r| r.group == group.name) {
                    let message = if record.days_remaining < 0 {
                        format!("Certificate expired {} days ago", -record.days_remaining)
                    } else {
                        format!("Certificate expires in {} days", record.days_remaining)
                    };
                    return ReportCheck::new(name, record.severity.into(), message).with_details(json!({
                        "days_remaining": record.days_remaining,
                        "not_after": record.not_after,
                        "subject_names": record.subject_names,
                    }));
                }
                match statuses.get(&group.name) {
                    Some(BundleStatus::Invalid { reason }) => {
                        ReportCheck::warning(name, format!("Certificate bundle unreadable: {}", reason))
                    }
                    _ => ReportCheck::ok(name, "No certificate installed"),
                }
            })
            .collect();
        StatusReport::from_checks(checks)
    }

    /// Send `records` at or above the minimum severity to every sink.
    /// Returns how many records reached at least one sink.
    pub async fn dispatch(&self, records: &[AlertRecord]) -> usize {
        let mut dispatched = 0;
        for record in records.iter().filter(|r| r.severity >= self.min_severity) {
            let mut delivered = false;
            for sink in &self.sinks {
                match sink.send(record).await {
                    Ok(()) => delivered = true,
                    Err(e) => warn!(sink = sink.name(), group = %record.group, error = %e, "Alert delivery failed"),
                }
            }
            if delivered {
                dispatched += 1;
            }
        }
        debug!(records = records.len(), dispatched, "Dispatched expiry alerts");
        dispatched
    }

    /// Scan, classify, alert and report
    pub async fn run(&self) -> MonitorRun {
        let now = Utc::now();
        let statuses = self.store.scan_at(&self.groups, now);
        let records = self.check(&statuses, now);
        let dispatched = self.dispatch(&records).await;
        let report = self.report(&statuses, now);

        info!(
            groups = self.groups.len(),
            alerts = dispatched,
            overall = %report.overall_status,
            "Expiry check complete"
        );
        MonitorRun {
            records,
            report,
            dispatched,
        }
    }
}

#[async_trait]
impl RecurringTask for ExpiryMonitor {
    fn name(&self) -> &'static str {
        "monitor"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run_once(&self) -> Result<String, DeployError> {
        let run = self.run().await;
        if run.dispatched == 0 {
            return Ok("nothing to do".to_string());
        }
        Ok(format!("{} alerts, overall {}", run.dispatched, run.report.overall_status))
    }
}

impl std::fmt::Debug for ExpiryMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpiryMonitor")
            .field("groups", &self.groups.len())
            .field("thresholds", &self.thresholds)
            .field("min_severity", &self.min_severity)
            .field("sinks", &self.sinks.iter().map(|s| s.name()).collect::<Vec<_>>())
            .finish()
    }
}
