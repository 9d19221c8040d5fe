//! Certificate validation
//!
//! Validates the on-disk bundle of every domain group: artifacts exist,
//! the chain parses as X.509 and has not expired.

use super::{ErrorCategory, ValidationError, ValidationResult, ValidationWarning};
use crate::Config;
use std::path::Path;
use std::time::{Duration, SystemTime};

/// File names of a bundle inside `<cert-root>/<group>/`
pub const BUNDLE_ARTIFACTS: [&str; 3] = ["fullchain.pem", "chain.pem", "privkey.pem"];

/// Validate the certificate bundles of all groups.
///
/// Missing bundles of required groups are warnings: a deployment without
/// certificates is valid and runs in plaintext.
pub async fn validate_certificates(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();

    for group in &config.groups {
        let dir = config.paths.cert_root.join(&group.name);

        let missing: Vec<&str> = BUNDLE_ARTIFACTS
            .iter()
            .copied()
            .filter(|name| !dir.join(name).exists())
            .collect();

        if missing.len() == BUNDLE_ARTIFACTS.len() {
            if group.required {
                result.add_warning(ValidationWarning::new(format!(
                    "Group '{}' has no certificate bundle in {:?}; it will be served in plaintext",
                    group.name, dir
                )));
            }
            continue;
        }

        if !missing.is_empty() {
            result.add_error(ValidationError::new(
                ErrorCategory::Certificate,
                format!(
                    "Group '{}' bundle is incomplete, missing: {}",
                    group.name,
                    missing.join(", ")
                ),
            ));
            continue;
        }

        match load_and_validate_cert(&dir.join("fullchain.pem"), config.monitor.warning_days) {
            Ok(Some(expiry_warning)) => result.add_warning(expiry_warning),
            Ok(None) => {}
            Err(e) => result.add_error(e),
        }
    }

    result
}

/// Load a certificate and check its expiry
fn load_and_validate_cert(
    cert_path: &Path,
    warning_days: i64,
) -> Result<Option<ValidationWarning>, ValidationError> {
    use std::fs;

    let cert_pem = fs::read(cert_path).map_err(|e| {
        ValidationError::new(
            ErrorCategory::Certificate,
            format!("Failed to read certificate {:?}: {}", cert_path, e),
        )
    })?;

    let pem = pem::parse(&cert_pem).map_err(|e| {
        ValidationError::new(
            ErrorCategory::Certificate,
            format!("Failed to parse certificate {:?}: {}", cert_path, e),
        )
    })?;

    let (_, cert) = x509_parser::parse_x509_certificate(pem.contents()).map_err(|e| {
        ValidationError::new(
            ErrorCategory::Certificate,
            format!("Invalid X509 certificate {:?}: {}", cert_path, e),
        )
    })?;

    let now = SystemTime::now();
    let not_after = cert.validity().not_after.timestamp().max(0) as u64;
    let expiry_time = SystemTime::UNIX_EPOCH + Duration::from_secs(not_after);

    if expiry_time < now {
        return Err(ValidationError::new(
            ErrorCategory::Certificate,
            format!(
                "Certificate expired: {:?} (expired at {})",
                cert_path,
                cert.validity().not_after
            ),
        ));
    }

    let window = Duration::from_secs(warning_days.max(0) as u64 * 86400);
    if expiry_time < now + window {
        return Ok(Some(ValidationWarning::new(format!(
            "Certificate expires soon: {:?} (expires at {})",
            cert_path,
            cert.validity().not_after
        ))));
    }

    Ok(None)
}
