//! Certificate authority access.
//!
//! [`CertificateAuthority`] is the seam between acquisition and the CA so
//! tests can issue certificates locally. [`AcmeAuthority`] speaks ACME v2
//! through `instant-acme` and answers HTTP-01 challenges via the webroot.

use std::fmt::Display;
use std::fs;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, OrderStatus,
};
use rcgen::{CertificateParams, KeyPair};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use certshift_common::DomainGroup;
use certshift_config::AcmeConfig;

use super::challenge::ChallengeManager;
use crate::error::AcquisitionError;
use crate::fsutil;
use crate::store::IssuedCertificate;

/// Delay between order status polls
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Issues certificates for a domain group
#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    /// Obtain a certificate covering every domain of `group`, publishing
    /// HTTP-01 responses through `challenges`.
    async fn issue(
        &self,
        group: &DomainGroup,
        challenges: &ChallengeManager,
    ) -> Result<IssuedCertificate, AcquisitionError>;
}

/// Hostnames of a group as ACME identifiers: ports stripped, duplicates dropped
pub fn identifiers_for(group: &DomainGroup) -> Vec<String> {
    let mut names: Vec<String> = Vec::with_capacity(group.domains.len());
    for domain in &group.domains {
        let host = domain.split(':').next().unwrap_or(domain).to_ascii_lowercase();
        if !names.contains(&host) {
            names.push(host);
        }
    }
    names
}

/// ACME v2 certificate authority (Let's Encrypt by default)
#[derive(Debug, Clone)]
pub struct AcmeAuthority {
    directory_url: String,
    email: Option<String>,
    account_dir: PathBuf,
    network_timeout: Duration,
}

impl AcmeAuthority {
    /// Authority for the production or staging directory of `acme`.
    ///
    /// Account credentials are kept per directory under `<state_dir>/acme/`.
    pub fn new(acme: &AcmeConfig, state_dir: &Path, staging: bool, network_timeout: Duration) -> Self {
        let directory_url = acme.directory_for(staging).to_string();
        let digest = hex::encode(Sha256::digest(directory_url.as_bytes()));
        Self {
            account_dir: state_dir.join("acme").join(&digest[..16]),
            directory_url,
            email: acme.email.clone(),
            network_timeout,
        }
    }

    pub fn directory_url(&self) -> &str {
        &self.directory_url
    }

    fn credentials_path(&self) -> PathBuf {
        self.account_dir.join("credentials.json")
    }

    /// Bound one CA round trip by the network timeout
    async fn call<T, E, F>(&self, operation: &'static str, fut: F) -> Result<T, AcquisitionError>
    where
        F: Future<Output = Result<T, E>>,
        E: Display,
    {
        match tokio::time::timeout(self.network_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(AcquisitionError::Authority(format!("{}: {}", operation, e))),
            Err(_) => Err(AcquisitionError::Timeout {
                operation,
                limit: self.network_timeout,
            }),
        }
    }

    fn load_credentials(&self) -> Result<Option<AccountCredentials>, AcquisitionError> {
        match fs::read_to_string(self.credentials_path()) {
            Ok(content) => serde_json::from_str(&content).map(Some).map_err(|e| {
                AcquisitionError::Authority(format!("stored account credentials are corrupt: {}", e))
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AcquisitionError::Authority(format!(
                "failed to read account credentials: {}",
                e
            ))),
        }
    }

    fn save_credentials(&self, credentials: &AccountCredentials) -> Result<(), AcquisitionError> {
        let json = serde_json::to_vec_pretty(credentials).map_err(|e| {
            AcquisitionError::Authority(format!("failed to encode account credentials: {}", e))
        })?;
        fsutil::write_atomic(&self.credentials_path(), &json, Some(0o600))?;
        Ok(())
    }

    /// Restore the stored account, or register a new one
    async fn account(&self) -> Result<Account, AcquisitionError> {
        if let Some(credentials) = self.load_credentials()? {
            debug!(directory = %self.directory_url, "Restoring ACME account");
            return self
                .call("restore account", Account::from_credentials(credentials))
                .await;
        }

        let email = self.email.as_ref().ok_or(AcquisitionError::MissingEmail)?;
        info!(email = %email, directory = %self.directory_url, "Registering ACME account");

        let contact = format!("mailto:{}", email);
        let contact_refs: &[&str] = &[&contact];
        let new_account = NewAccount {
            contact: contact_refs,
            terms_of_service_agreed: true,
            only_return_existing: false,
        };

        let (account, credentials) = self
            .call(
                "register account",
                Account::create(&new_account, &self.directory_url, None),
            )
            .await?;
        self.save_credentials(&credentials)?;
        info!(account = %account.id(), "Registered ACME account");
        Ok(account)
    }
}

#[async_trait]
impl CertificateAuthority for AcmeAuthority {
    async fn issue(
        &self,
        group: &DomainGroup,
        challenges: &ChallengeManager,
    ) -> Result<IssuedCertificate, AcquisitionError> {
        let names = identifiers_for(group);
        let primary = names.first().cloned().unwrap_or_default();
        let account = self.account().await?;

        let identifiers: Vec<Identifier> = names.iter().cloned().map(Identifier::Dns).collect();
        let mut order = self
            .call(
                "create order",
                account.new_order(&NewOrder {
                    identifiers: &identifiers,
                }),
            )
            .await?;
        debug!(group = %group.name, domains = ?names, "Created ACME order");

        let authorizations = self.call("fetch authorizations", order.authorizations()).await?;
        for auth in authorizations {
            if auth.status == AuthorizationStatus::Valid {
                continue;
            }

            #[allow(unreachable_patterns)]
            let domain = match &auth.identifier {
                Identifier::Dns(name) => name.clone(),
                _ => primary.clone(),
            };
            let challenge = auth
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Http01)
                .ok_or_else(|| AcquisitionError::ChallengeFailed {
                    domain: domain.clone(),
                    reason: "authority offered no HTTP-01 challenge".to_string(),
                })?;

            let key_auth = order.key_authorization(challenge);
            challenges.add_challenge(&challenge.token, key_auth.as_str())?;
            self.call("mark challenge ready", order.set_challenge_ready(&challenge.url))
                .await?;
            debug!(domain = %domain, token = %challenge.token, "Challenge published and marked ready");
        }

        loop {
            let status = self.call("refresh order", order.refresh()).await?.status;
            match status {
                OrderStatus::Ready | OrderStatus::Valid => break,
                OrderStatus::Invalid => {
                    let reason = order
                        .state()
                        .error
                        .as_ref()
                        .map(|e| format!("{:?}", e))
                        .unwrap_or_else(|| "order became invalid".to_string());
                    warn!(group = %group.name, reason = %reason, "ACME order invalid");
                    return Err(AcquisitionError::ChallengeFailed {
                        domain: primary,
                        reason,
                    });
                }
                OrderStatus::Pending | OrderStatus::Processing => {
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
            }
        }

        let key_pair = KeyPair::generate().map_err(|e| AcquisitionError::KeyGeneration(e.to_string()))?;
        let csr = CertificateParams::new(names.clone())
            .and_then(|params| params.serialize_request(&key_pair))
            .map_err(|e| AcquisitionError::KeyGeneration(e.to_string()))?;

        if order.state().status != OrderStatus::Valid {
            self.call("finalize order", order.finalize(csr.der())).await?;
        }

        let chain_pem = loop {
            match self.call("download certificate", order.certificate()).await? {
                Some(chain) => break chain,
                None => tokio::time::sleep(POLL_INTERVAL).await,
            }
        };

        info!(group = %group.name, domains = ?names, "Certificate issued");
        Ok(IssuedCertificate {
            chain_pem,
            key_pem: key_pair.serialize_pem(),
        })
    }
}
