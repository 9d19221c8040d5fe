//! Common types and utilities shared by the certshift crates.
//!
//! - [`types`]: domain groups, deployment modes and severities
//! - [`report`]: the structured status report consumed by external monitoring
//! - [`ids`]: run identifiers for log correlation
//! - [`backoff`]: bounded linear retry schedules

pub mod backoff;
pub mod ids;
pub mod report;
pub mod types;

pub use backoff::LinearBackoff;
pub use ids::RunId;
pub use report::{ReportCheck, StatusReport};
pub use types::{CheckStatus, DeploymentMode, DomainGroup, PartialPolicy, Severity};
