//! Error types for every orchestrator component.
//!
//! Each component returns its own enum; [`DeployError`] unifies them at the
//! orchestrator and CLI boundary.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use certshift_common::Severity;
use certshift_config::ConfigError;

/// A certificate artifact failed to load or parse.
///
/// Captured inside a bundle status; never aborts a scan.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{artifact} is missing")]
    Missing { artifact: String },

    #[error("Failed to read {artifact}: {reason}")]
    Unreadable { artifact: String, reason: String },

    #[error("{artifact} is not valid PEM: {reason}")]
    Pem { artifact: String, reason: String },

    #[error("{artifact} contains an invalid X.509 certificate: {reason}")]
    Certificate { artifact: String, reason: String },

    #[error("privkey.pem does not match the leaf certificate")]
    KeyMismatch,
}

/// The deployment lock could not be taken.
#[derive(Error, Debug)]
pub enum LockError {
    #[error("Another certshift run holds {path} ({holder}); gave up after {waited:?}")]
    Locked {
        path: PathBuf,
        holder: String,
        waited: Duration,
    },

    #[error("Lock file error: {0}")]
    Io(#[from] std::io::Error),
}

/// Bundle persistence failed.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Issued bundle for group '{group}' failed verification: {reason}")]
    Verification { group: String, reason: String },

    #[error("No previous bundle retained for group '{0}'")]
    NoPrevious(String),
}

/// Certificate acquisition failed.
#[derive(Error, Debug)]
pub enum AcquisitionError {
    #[error("Cannot force HTTPS; groups without a valid certificate: {}", .groups.join(", "))]
    Precondition { groups: Vec<String> },

    #[error("Domain '{domain}' is not reachable over HTTP: {reason}")]
    Unreachable { domain: String, reason: String },

    #[error("No ACME contact email configured")]
    MissingEmail,

    #[error("Certificate authority error: {0}")]
    Authority(String),

    #[error("Challenge for '{domain}' failed: {reason}")]
    ChallengeFailed { domain: String, reason: String },

    #[error("{operation} timed out after {limit:?}")]
    Timeout {
        operation: &'static str,
        limit: Duration,
    },

    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Challenge webroot error: {0}")]
    Webroot(#[from] std::io::Error),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// A renewal run finished with failures.
#[derive(Error, Debug)]
pub enum RenewalError {
    #[error("Renewal failed for: {}", .failed.iter().map(|(g, e)| format!("{} ({})", g, e)).collect::<Vec<_>>().join(", "))]
    Partial { failed: Vec<(String, String)> },

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("Reload after renewal failed: {0}")]
    Apply(#[from] ConfigApplyError),
}

/// A supervised service could not be driven.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Unknown service '{0}'")]
    UnknownService(String),

    #[error("Service '{service}' has no {action} command configured")]
    Unsupported {
        service: String,
        action: &'static str,
    },

    #[error("Command `{command}` failed: {output}")]
    Command { command: String, output: String },

    #[error("Command IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The serving layer or application could not be reconfigured.
#[derive(Error, Debug)]
pub enum ConfigApplyError {
    #[error("Template {path:?} could not be read: {source}")]
    Template {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Template '{template}' failed to render: {reason}")]
    Render {
        template: &'static str,
        reason: String,
    },

    #[error("Plan references group '{0}' without a valid bundle")]
    MissingBundle(String),

    #[error("Serving layer rejected the candidate configuration: {output}")]
    Rejected { output: String },

    #[error("Command `{command}` failed: {output}")]
    Command { command: String, output: String },

    #[error("Configuration IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Applied plan state error: {0}")]
    State(#[from] serde_json::Error),

    #[error("Application restart failed: {0}")]
    Restart(#[from] RuntimeError),

    #[error("No plan has been applied yet")]
    NothingApplied,

    #[error("{cause}; previous configuration restored")]
    RolledBack { cause: Box<ConfigApplyError> },

    #[error(transparent)]
    Lock(#[from] LockError),
}

/// Post-apply health verification failed. Reported, never rolled back.
#[derive(Error, Debug)]
pub enum HealthCheckError {
    #[error("Health checks failed: {}", .failed.join(", "))]
    Failed { failed: Vec<String> },
}

/// An alert could not be delivered to a sink.
#[derive(Error, Debug)]
pub enum AlertError {
    #[error("Webhook request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Webhook answered with status {0}")]
    Status(u16),

    #[error("Alert history error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Alert encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Unified orchestrator error
#[derive(Error, Debug)]
pub enum DeployError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Acquisition(#[from] AcquisitionError),

    #[error(transparent)]
    Renewal(#[from] RenewalError),

    #[error(transparent)]
    Apply(#[from] ConfigApplyError),

    #[error(transparent)]
    Health(#[from] HealthCheckError),

    #[error("Interrupted by signal")]
    Interrupted,
}

impl DeployError {
    /// Report severity of this error.
    ///
    /// Partial renewal and post-apply health failures degrade the run;
    /// everything else is fatal.
    pub fn severity(&self) -> Severity {
        match self {
            Self::Renewal(RenewalError::Partial { .. }) | Self::Health(_) => Severity::Warning,
            _ => Severity::Critical,
        }
    }

    /// Short machine-friendly kind, used as the report check name
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Validation(_) => "validation",
            Self::Lock(_) => "lock",
            Self::Storage(_) => "storage",
            Self::Acquisition(_) => "acquisition",
            Self::Renewal(_) => "renewal",
            Self::Apply(_) => "apply",
            Self::Health(_) => "health",
            Self::Interrupted => "signal",
        }
    }
}
