//! Certificate bundle storage.
//!
//! Each domain group owns one path under the certificate root resolving to a
//! directory with `fullchain.pem`, `chain.pem` and `privkey.pem`. The store
//! scans those directories into [`BundleStatus`] values and swaps them
//! atomically when a new certificate is issued.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, info, trace};

use certshift_common::DomainGroup;

use crate::error::StorageError;
use crate::lock::LockGuard;

mod bundle;
mod install;

pub use bundle::{
    days_between, read_bundle, BundleStatus, CertificateBundle, ARTIFACTS, CHAIN, FULLCHAIN,
    PRIVKEY,
};
pub use install::IssuedCertificate;

/// Scan result keyed by group name
pub type ScanResult = BTreeMap<String, BundleStatus>;

/// Filesystem-backed certificate store with a cache of the last scan
#[derive(Debug)]
pub struct CertificateStore {
    root: PathBuf,
    cache: RwLock<ScanResult>,
}

impl CertificateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            cache: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Live bundle directory of a group
    pub fn group_dir(&self, group: &str) -> PathBuf {
        install::group_dir(&self.root, group)
    }

    /// Read every group's bundle and refresh the cache
    pub fn scan(&self, groups: &[DomainGroup]) -> ScanResult {
        self.scan_at(groups, Utc::now())
    }

    /// [`scan`](Self::scan) against an explicit clock
    pub fn scan_at(&self, groups: &[DomainGroup], now: DateTime<Utc>) -> ScanResult {
        let mut result = BTreeMap::new();

        for group in groups {
            let status = BundleStatus::observe(&self.group_dir(&group.name), &group.name, now);
            match &status {
                BundleStatus::Valid { days_remaining, .. } => {
                    trace!(group = %group.name, days_remaining, "Bundle is valid")
                }
                other => debug!(group = %group.name, state = other.label(), "Bundle is not valid"),
            }
            result.insert(group.name.clone(), status);
        }

        let valid = result.values().filter(|s| s.is_valid()).count();
        debug!(groups = result.len(), valid, "Scanned certificate store");

        *self.cache.write() = result.clone();
        result
    }

    /// Result of the most recent scan
    pub fn cached(&self) -> ScanResult {
        self.cache.read().clone()
    }

    /// Atomically replace a group's bundle. Requires the deployment lock.
    pub fn install(
        &self,
        _lock: &LockGuard,
        group: &str,
        issued: &IssuedCertificate,
    ) -> Result<CertificateBundle, StorageError> {
        let bundle = install::install(&self.root, group, issued)?;
        self.cache.write().insert(
            group.to_string(),
            BundleStatus::Valid {
                days_remaining: bundle.days_remaining(Utc::now()),
                bundle: Box::new(bundle.clone()),
            },
        );
        Ok(bundle)
    }

    /// Restore the retained previous bundle of a group
    pub fn rollback(&self, _lock: &LockGuard, group: &str) -> Result<(), StorageError> {
        install::rollback(&self.root, group)?;
        self.cache.write().remove(group);
        Ok(())
    }

    /// Repair bundle swaps interrupted by a crash
    pub fn recover_interrupted(&self, _lock: &LockGuard) -> Result<Vec<String>, StorageError> {
        let recovered = install::recover_interrupted(&self.root)?;
        if !recovered.is_empty() {
            info!(groups = ?recovered, "Recovered interrupted bundle installs");
            self.cache.write().clear();
        }
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::DeployLock;
    use crate::test_support::{write_bundle, TestCert};
    use std::time::Duration;

    fn groups() -> Vec<DomainGroup> {
        vec![
            DomainGroup::new("main", vec!["example.com".to_string()]),
            DomainGroup::new("docs", vec!["docs.example.com".to_string()]).optional(),
        ]
    }

    #[test]
    fn test_scan_populates_cache() {
        let root = tempfile::tempdir().unwrap();
        let store = CertificateStore::new(root.path());
        write_bundle(
            &store.group_dir("main"),
            &TestCert::valid_for_days(&["example.com"], 45),
        );

        assert!(store.cached().is_empty());
        let result = store.scan(&groups());

        assert!(result["main"].is_valid());
        assert_eq!(result["docs"].label(), "missing");
        assert_eq!(store.cached(), result);
    }

    #[test]
    fn test_scan_is_read_only() {
        let root = tempfile::tempdir().unwrap();
        let store = CertificateStore::new(root.path().join("live"));
        store.scan(&groups());
        assert!(!root.path().join("live").exists());
    }

    #[tokio::test]
    async fn test_install_updates_cache() {
        let root = tempfile::tempdir().unwrap();
        let store = CertificateStore::new(root.path().join("live"));
        let lock = DeployLock::new(root.path(), Duration::from_secs(1));
        let guard = lock.acquire().await.unwrap();

        let cert = TestCert::valid_for_days(&["example.com"], 90);
        let issued = IssuedCertificate {
            chain_pem: cert.fullchain_pem.clone(),
            key_pem: cert.key_pem.clone(),
        };
        store.install(&guard, "main", &issued).unwrap();

        assert!(store.cached()["main"].is_valid());
        assert!(store.scan(&groups())["main"].is_valid());
    }

    #[tokio::test]
    async fn test_rollback_restores_previous_and_clears_cache() {
        let root = tempfile::tempdir().unwrap();
        let store = CertificateStore::new(root.path().join("live"));
        let lock = DeployLock::new(root.path(), Duration::from_secs(1));
        let guard = lock.acquire().await.unwrap();

        let old = TestCert::valid_for_days(&["example.com"], 20);
        write_bundle(&store.group_dir("main"), &old);
        let before = read_bundle(&store.group_dir("main"), "main").unwrap();

        let cert = TestCert::valid_for_days(&["example.com"], 90);
        let issued = IssuedCertificate {
            chain_pem: cert.fullchain_pem,
            key_pem: cert.key_pem,
        };
        store.install(&guard, "main", &issued).unwrap();
        store.rollback(&guard, "main").unwrap();

        assert!(store.cached().get("main").is_none());
        let after = read_bundle(&store.group_dir("main"), "main").unwrap();
        assert_eq!(after.fingerprint, before.fingerprint);
        assert!(matches!(
            store.rollback(&guard, "main"),
            Err(StorageError::NoPrevious(_))
        ));
    }
}
