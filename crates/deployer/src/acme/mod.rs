//! Certificate acquisition and renewal over ACME HTTP-01.
//!
//! - [`challenge`]: challenge responses published into the webroot
//! - [`client`]: the certificate authority seam and its ACME implementation
//! - [`engine`]: reachability precondition, issuance and installation
//! - [`scheduler`]: renewal of bundles nearing expiry

pub mod challenge;
pub mod client;
pub mod engine;
pub mod scheduler;

pub use challenge::{ChallengeManager, ACME_CHALLENGE_PREFIX};
pub use client::{identifiers_for, AcmeAuthority, CertificateAuthority};
pub use engine::{AcquisitionEngine, AcquisitionResults};
pub use scheduler::{RenewalOutcome, RenewalScheduler};
