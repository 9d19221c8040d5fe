//! Certificate bundles and their on-disk parsing.

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use rcgen::PublicKeyData;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::*;

use crate::error::ValidationError;

/// Full chain (leaf first) served by the serving layer
pub const FULLCHAIN: &str = "fullchain.pem";
/// Intermediate chain
pub const CHAIN: &str = "chain.pem";
/// Private key of the leaf
pub const PRIVKEY: &str = "privkey.pem";

/// All artifacts of a bundle, in reading order
pub const ARTIFACTS: [&str; 3] = [FULLCHAIN, CHAIN, PRIVKEY];

const SECONDS_PER_DAY: i64 = 86_400;

/// A parsed certificate bundle for one domain group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateBundle {
    pub group: String,
    #[serde(skip)]
    pub fullchain_pem: String,
    #[serde(skip)]
    pub chain_pem: String,
    #[serde(skip)]
    pub key_pem: String,
    pub issuer: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    /// DNS names of the leaf (SAN, or the subject CN if no SAN is present)
    pub subject_names: Vec<String>,
    /// Hex SHA-256 of the leaf certificate DER
    pub fingerprint: String,
}

impl CertificateBundle {
    /// Whole days until expiry, rounded toward negative infinity.
    ///
    /// A certificate expiring in 23 hours has 0 days remaining; one that
    /// expired an hour ago has -1.
    pub fn days_remaining(&self, now: DateTime<Utc>) -> i64 {
        days_between(now, self.not_after)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.not_after <= now
    }
}

/// `floor((to - from) / 86400)`
pub fn days_between(from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
    (to - from).num_seconds().div_euclid(SECONDS_PER_DAY)
}

/// Validity of a group's bundle as observed by a scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BundleStatus {
    Valid {
        days_remaining: i64,
        bundle: Box<CertificateBundle>,
    },
    Expired {
        bundle: Box<CertificateBundle>,
    },
    Missing {
        artifacts: Vec<String>,
    },
    Invalid {
        #[serde(serialize_with = "serialize_display")]
        reason: ValidationError,
    },
}

fn serialize_display<S: serde::Serializer>(
    value: &ValidationError,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}

impl BundleStatus {
    /// Classify a bundle directory at `now`
    pub fn observe(dir: &Path, group: &str, now: DateTime<Utc>) -> Self {
        let missing: Vec<String> = ARTIFACTS
            .iter()
            .filter(|name| !dir.join(name).exists())
            .map(|name| name.to_string())
            .collect();

        // A partially present bundle is broken, not absent
        if missing.len() == ARTIFACTS.len() {
            return Self::Missing { artifacts: missing };
        }
        if let Some(artifact) = missing.into_iter().next() {
            return Self::Invalid {
                reason: ValidationError::Missing { artifact },
            };
        }

        match read_bundle(dir, group) {
            Ok(bundle) if bundle.is_expired(now) => Self::Expired {
                bundle: Box::new(bundle),
            },
            Ok(bundle) => Self::Valid {
                days_remaining: bundle.days_remaining(now),
                bundle: Box::new(bundle),
            },
            Err(reason) => Self::Invalid { reason },
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid { .. })
    }

    /// The parsed bundle, for valid and expired statuses
    pub fn bundle(&self) -> Option<&CertificateBundle> {
        match self {
            Self::Valid { bundle, .. } | Self::Expired { bundle } => Some(bundle),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Valid { .. } => "valid",
            Self::Expired { .. } => "expired",
            Self::Missing { .. } => "missing",
            Self::Invalid { .. } => "invalid",
        }
    }
}

/// Read and verify the three artifacts in `dir`
pub fn read_bundle(dir: &Path, group: &str) -> Result<CertificateBundle, ValidationError> {
    let fullchain_pem = read_artifact(dir, FULLCHAIN)?;
    let chain_pem = read_artifact(dir, CHAIN)?;
    let key_pem = read_artifact(dir, PRIVKEY)?;

    let fullchain = parse_certificates(FULLCHAIN, &fullchain_pem)?;
    parse_certificates(CHAIN, &chain_pem)?;

    let leaf_der = &fullchain[0];
    let (_, leaf) = parse_x509_certificate(leaf_der).map_err(|e| ValidationError::Certificate {
        artifact: FULLCHAIN.to_string(),
        reason: e.to_string(),
    })?;

    verify_key_matches(&key_pem, leaf.public_key().raw)?;

    let not_before = asn1_to_utc(leaf.validity().not_before, FULLCHAIN)?;
    let not_after = asn1_to_utc(leaf.validity().not_after, FULLCHAIN)?;

    Ok(CertificateBundle {
        group: group.to_string(),
        issuer: leaf.issuer().to_string(),
        not_before,
        not_after,
        subject_names: subject_names(&leaf),
        fingerprint: hex::encode(Sha256::digest(leaf_der)),
        fullchain_pem,
        chain_pem,
        key_pem,
    })
}

fn read_artifact(dir: &Path, artifact: &str) -> Result<String, ValidationError> {
    fs::read_to_string(dir.join(artifact)).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ValidationError::Missing {
                artifact: artifact.to_string(),
            }
        } else {
            ValidationError::Unreadable {
                artifact: artifact.to_string(),
                reason: e.to_string(),
            }
        }
    })
}

/// DER of every certificate in a PEM file, leaf first. Fails on an empty file.
fn parse_certificates(artifact: &str, content: &str) -> Result<Vec<Vec<u8>>, ValidationError> {
    let blocks = ::pem::parse_many(content).map_err(|e| ValidationError::Pem {
        artifact: artifact.to_string(),
        reason: e.to_string(),
    })?;

    let ders: Vec<Vec<u8>> = blocks
        .into_iter()
        .filter(|p| p.tag() == "CERTIFICATE")
        .map(|p| p.into_contents())
        .collect();

    if ders.is_empty() {
        return Err(ValidationError::Pem {
            artifact: artifact.to_string(),
            reason: "no CERTIFICATE block".to_string(),
        });
    }

    for der in &ders {
        parse_x509_certificate(der).map_err(|e| ValidationError::Certificate {
            artifact: artifact.to_string(),
            reason: e.to_string(),
        })?;
    }

    Ok(ders)
}

fn verify_key_matches(key_pem: &str, leaf_spki: &[u8]) -> Result<(), ValidationError> {
    let block = ::pem::parse(key_pem).map_err(|e| ValidationError::Pem {
        artifact: PRIVKEY.to_string(),
        reason: e.to_string(),
    })?;
    if !block.tag().ends_with("PRIVATE KEY") {
        return Err(ValidationError::Pem {
            artifact: PRIVKEY.to_string(),
            reason: format!("unexpected block '{}'", block.tag()),
        });
    }

    let key = rcgen::KeyPair::from_pem(key_pem).map_err(|e| ValidationError::Pem {
        artifact: PRIVKEY.to_string(),
        reason: e.to_string(),
    })?;

    if key.subject_public_key_info() != leaf_spki {
        return Err(ValidationError::KeyMismatch);
    }
    Ok(())
}

fn asn1_to_utc(time: ASN1Time, artifact: &str) -> Result<DateTime<Utc>, ValidationError> {
    DateTime::from_timestamp(time.timestamp(), 0).ok_or_else(|| ValidationError::Certificate {
        artifact: artifact.to_string(),
        reason: format!("validity time out of range: {}", time),
    })
}

fn subject_names(cert: &X509Certificate<'_>) -> Vec<String> {
    let mut names: Vec<String> = match cert.subject_alternative_name() {
        Ok(Some(san)) => san
            .value
            .general_names
            .iter()
            .filter_map(|name| match name {
                GeneralName::DNSName(dns) => Some(dns.to_string()),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    };

    if names.is_empty() {
        names.extend(
            cert.subject()
                .iter_common_name()
                .filter_map(|cn| cn.as_str().ok())
                .map(str::to_string),
        );
    }
    names
}
