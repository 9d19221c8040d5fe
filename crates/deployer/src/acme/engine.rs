//! Certificate acquisition for domain groups.
//!
//! One acquisition runs under the deployment lock and a wall-clock budget:
//!
//! 1. every domain must serve a freshly published probe token over plain
//!    HTTP, otherwise the group is abandoned before the authority is asked
//! 2. the authority issues the certificate, answering HTTP-01 challenges
//!    through the webroot
//! 3. the result is installed atomically into the certificate store
//!
//! Published challenge files are withdrawn whatever the outcome.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use certshift_common::DomainGroup;
use certshift_config::Config;

use super::challenge::{ChallengeManager, ACME_CHALLENGE_PREFIX};
use super::client::CertificateAuthority;
use crate::error::AcquisitionError;
use crate::lock::{DeployLock, LockGuard};
use crate::store::{CertificateBundle, CertificateStore};

/// Per-group acquisition results, in group order
pub type AcquisitionResults = Vec<(String, Result<CertificateBundle, AcquisitionError>)>;

/// Drives the authority and installs what it issues
pub struct AcquisitionEngine {
    store: Arc<CertificateStore>,
    authority: Arc<dyn CertificateAuthority>,
    challenges: ChallengeManager,
    http: reqwest::Client,
    lock: DeployLock,
    network_timeout: Duration,
    acquisition_timeout: Duration,
}

impl AcquisitionEngine {
    pub fn new(
        config: &Config,
        store: Arc<CertificateStore>,
        authority: Arc<dyn CertificateAuthority>,
    ) -> Result<Self, AcquisitionError> {
        let network_timeout = config.timeouts.network();
        let http = reqwest::Client::builder()
            .timeout(network_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| AcquisitionError::Authority(format!("HTTP client: {}", e)))?;

        Ok(Self {
            store,
            authority,
            challenges: ChallengeManager::new(&config.paths.webroot),
            http,
            lock: DeployLock::new(&config.paths.state_dir, config.timeouts.lock()),
            network_timeout,
            acquisition_timeout: config.timeouts.acquisition(),
        })
    }

    pub fn challenges(&self) -> &ChallengeManager {
        &self.challenges
    }

    /// Acquire a certificate for `group`, taking the deployment lock
    pub async fn obtain(&self, group: &DomainGroup) -> Result<CertificateBundle, AcquisitionError> {
        let guard = self.lock.acquire().await?;
        self.obtain_locked(&guard, group).await
    }

    /// Acquire a certificate for `group` under an already held lock
    pub async fn obtain_locked(
        &self,
        lock: &LockGuard,
        group: &DomainGroup,
    ) -> Result<CertificateBundle, AcquisitionError> {
        let start = Instant::now();
        info!(group = %group.name, domains = ?group.domains, "Acquiring certificate");

        let outcome = tokio::time::timeout(self.acquisition_timeout, self.acquire(lock, group)).await;
        self.challenges.clear();

        let result = outcome.unwrap_or(Err(AcquisitionError::Timeout {
            operation: "certificate acquisition",
            limit: self.acquisition_timeout,
        }));

        match &result {
            Ok(bundle) => info!(
                group = %group.name,
                not_after = %bundle.not_after,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Certificate acquired"
            ),
            Err(e) => error!(group = %group.name, error = %e, "Certificate acquisition failed"),
        }
        result
    }

    /// Acquire each group independently, taking the lock once
    pub async fn obtain_all(&self, groups: &[DomainGroup]) -> Result<AcquisitionResults, AcquisitionError> {
        let guard = self.lock.acquire().await?;
        Ok(self.obtain_all_locked(&guard, groups).await)
    }

    pub async fn obtain_all_locked(&self, lock: &LockGuard, groups: &[DomainGroup]) -> AcquisitionResults {
        let mut results = Vec::with_capacity(groups.len());
        for group in groups {
            let result = self.obtain_locked(lock, group).await;
            results.push((group.name.clone(), result));
        }
        results
    }

    async fn acquire(
        &self,
        lock: &LockGuard,
        group: &DomainGroup,
    ) -> Result<CertificateBundle, AcquisitionError> {
        self.check_reachability(group).await?;
        let issued = self.authority.issue(group, &self.challenges).await?;
        Ok(self.store.install(lock, &group.name, &issued)?)
    }

    /// Every domain of `group` must serve a probe token from the webroot
    pub async fn check_reachability(&self, group: &DomainGroup) -> Result<(), AcquisitionError> {
        for domain in &group.domains {
            let token = format!("certshift-probe-{}", uuid::Uuid::new_v4().simple());
            let expected = uuid::Uuid::new_v4().to_string();
            self.challenges.add_challenge(&token, &expected)?;

            let result = self.probe(domain, &token, &expected).await;
            self.challenges.remove_challenge(&token);

            if let Err(reason) = result {
                warn!(group = %group.name, domain = %domain, reason = %reason, "Domain unreachable");
                return Err(AcquisitionError::Unreachable {
                    domain: domain.clone(),
                    reason,
                });
            }
            debug!(domain = %domain, "Domain serves the challenge webroot");
        }
        Ok(())
    }

    async fn probe(&self, domain: &str, token: &str, expected: &str) -> Result<(), String> {
        let url = url::Url::parse(&format!("http://{}/", domain))
            .and_then(|base| base.join(&format!("{}{}", ACME_CHALLENGE_PREFIX, token)))
            .map_err(|e| format!("invalid domain {}: {}", domain, e))?;
        let request = async {
            let response = self.http.get(url.clone()).send().await.map_err(|e| e.to_string())?;
            let status = response.status();
            if status != reqwest::StatusCode::OK {
                return Err(format!("{} returned {}", url, status));
            }
            let body = response.text().await.map_err(|e| e.to_string())?;
            if body.trim() != expected {
                return Err(format!("{} served unexpected content", url));
            }
            Ok(())
        };

        tokio::time::timeout(self.network_timeout, request)
            .await
            .unwrap_or_else(|_| Err(format!("no response within {:?}", self.network_timeout)))
    }
}
