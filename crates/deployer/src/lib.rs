//! certshift
//!
//! A certificate-aware deployment orchestrator. It keeps a site reachable
//! while TLS certificates come and go:
//!
//! - **Store**: inspects and atomically installs per-group certificate bundles
//! - **Mode**: decides between plaintext, mixed and encrypted serving
//! - **ACME**: obtains and renews certificates with HTTP-01 challenges
//! - **Switcher**: swaps the serving-layer configuration with validation and rollback
//! - **Health**: verifies services, dependencies and endpoints after a switch
//! - **Expiry**: classifies bundles and dispatches alerts
//!
//! # Example
//!
//! ```ignore
//! use certshift::{Components, Orchestrator, RunOptions, InterruptFlag};
//! use certshift_config::Config;
//!
//! let config = Config::from_file("/etc/certshift/certshift.kdl")?;
//! let components = Components::from_config(&config, false)?;
//! let orchestrator = Orchestrator::new(config, components, InterruptFlag::default());
//! let run = orchestrator.deploy(RunOptions::default()).await;
//! std::process::exit(run.report.exit_code());
//! ```

// ============================================================================
// Module Declarations
// ============================================================================

pub mod acme;
pub mod error;
pub mod expiry;
pub mod fsutil;
pub mod health;
pub mod lock;
pub mod mode;
pub mod orchestrator;
pub mod runtime;
pub mod schedule;
pub mod signals;
pub mod store;
pub mod switcher;

#[cfg(test)]
mod test_support;

// ============================================================================
// Public API Re-exports
// ============================================================================

// Errors
pub use error::{
    AcquisitionError, AlertError, ConfigApplyError, DeployError, HealthCheckError, LockError,
    RenewalError, RuntimeError, StorageError, ValidationError,
};

// Certificates
pub use acme::{
    AcmeAuthority, AcquisitionEngine, CertificateAuthority, ChallengeManager, RenewalOutcome,
    RenewalScheduler,
};
pub use store::{BundleStatus, CertificateBundle, CertificateStore, IssuedCertificate, ScanResult};

// Mode and switching
pub use mode::{decide, ForceFlag, ModePlan};
pub use switcher::{
    AppliedConfig, AppliedState, CommandServingLayer, ConfigSwitcher, SecurityFlags, ServingLayer,
};

// Verification and monitoring
pub use expiry::{AlertRecord, AlertSink, ExpiryMonitor, Thresholds};
pub use health::{HealthReport, HealthValidator};
pub use runtime::{CommandRuntime, ServiceRuntime};

// Orchestration
pub use lock::{DeployLock, LockGuard};
pub use orchestrator::{Components, DeployRun, Orchestrator, RunOptions, RunState};
pub use schedule::{RecurringTask, TaskRunner};
pub use signals::{InterruptFlag, SignalManager, SignalType};
