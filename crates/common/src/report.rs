//! Structured status report.
//!
//! Every CLI tool ends by producing one [`StatusReport`]. The serialized form
//! is consumed by external monitoring:
//!
//! ```json
//! {
//!   "timestamp": "2026-01-01T00:00:00Z",
//!   "overall_status": "WARNING",
//!   "total_checks": 2,
//!   "failed_checks": 1,
//!   "checks": [
//!     {"check": "expiry:main", "status": "WARNING", "message": "...", "details": {}, "timestamp": "..."}
//!   ]
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{CheckStatus, Severity};

/// One entry of a status report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportCheck {
    /// Check identifier, e.g. `health:liveness` or `expiry:main`
    pub check: String,
    pub status: CheckStatus,
    pub message: String,
    /// Free-form structured detail
    #[serde(default)]
    pub details: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl ReportCheck {
    pub fn new(check: impl Into<String>, status: CheckStatus, message: impl Into<String>) -> Self {
        Self {
            check: check.into(),
            status,
            message: message.into(),
            details: serde_json::Value::Null,
            timestamp: Utc::now(),
        }
    }

    pub fn ok(check: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(check, CheckStatus::Ok, message)
    }

    pub fn warning(check: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(check, CheckStatus::Warning, message)
    }

    pub fn critical(check: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(check, CheckStatus::Critical, message)
    }

    pub fn skipped(check: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(check, CheckStatus::Skipped, message)
    }

    /// Attach structured details
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

/// Aggregate report for one invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub timestamp: DateTime<Utc>,
    pub overall_status: Severity,
    pub total_checks: usize,
    pub failed_checks: usize,
    pub checks: Vec<ReportCheck>,
}

impl StatusReport {
    /// Build a report, deriving the aggregate fields from the checks
    pub fn from_checks(checks: Vec<ReportCheck>) -> Self {
        let overall_status = checks
            .iter()
            .map(|c| c.status.severity())
            .max()
            .unwrap_or(Severity::Ok);
        let failed_checks = checks.iter().filter(|c| c.status.is_failure()).count();

        Self {
            timestamp: Utc::now(),
            overall_status,
            total_checks: checks.len(),
            failed_checks,
            checks,
        }
    }

    /// Append a check and recompute the aggregates
    pub fn push(&mut self, check: ReportCheck) {
        self.overall_status = self.overall_status.max(check.status.severity());
        if check.status.is_failure() {
            self.failed_checks += 1;
        }
        self.total_checks += 1;
        self.checks.push(check);
    }

    /// Merge the checks of another report into this one
    pub fn extend(&mut self, other: StatusReport) {
        for check in other.checks {
            self.push(check);
        }
    }

    /// Process exit code (0 success, 1 degraded, 2 critical)
    pub fn exit_code(&self) -> i32 {
        self.overall_status.exit_code()
    }

    /// Render the report as a short human-readable summary
    pub fn render_text(&self) -> String {
        let mut out = format!(
            "{} - {} check(s), {} failed\n",
            self.overall_status, self.total_checks, self.failed_checks
        );
        for check in &self.checks {
            out.push_str(&format!(
                "  [{:?}] {}: {}\n",
                check.status, check.check, check.message
            ));
        }
        out
    }
}

impl Default for StatusReport {
    fn default() -> Self {
        Self::from_checks(Vec::new())
    }
}
