//! Fixtures shared by unit tests.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rcgen::{CertificateParams, KeyPair};
use wiremock::{Request, Respond, ResponseTemplate};

use certshift_common::{DeploymentMode, DomainGroup};
use certshift_config::{Config, PathsConfig};

use crate::acme::{identifiers_for, CertificateAuthority, ChallengeManager};
use crate::error::{AcquisitionError, ConfigApplyError, RuntimeError};
use crate::mode::ModePlan;
use crate::runtime::ServiceRuntime;
use crate::store::{IssuedCertificate, CHAIN, FULLCHAIN, PRIVKEY};
use crate::switcher::ServingLayer;

/// A self-signed certificate and its key
pub struct TestCert {
    pub fullchain_pem: String,
    pub key_pem: String,
}

impl TestCert {
    /// Certificate for `names` expiring `days` from now (negative: already expired)
    pub fn valid_for_days(names: &[&str], days: i64) -> Self {
        let key = KeyPair::generate().unwrap();
        let mut params =
            CertificateParams::new(names.iter().map(|n| n.to_string()).collect::<Vec<_>>())
                .unwrap();
        let now = time::OffsetDateTime::now_utc();
        params.not_before = now - time::Duration::days(100);
        params.not_after = now + time::Duration::days(days);
        let cert = params.self_signed(&key).unwrap();

        Self {
            fullchain_pem: cert.pem(),
            key_pem: key.serialize_pem(),
        }
    }
}

/// Write `cert` as a complete bundle into `dir`
pub fn write_bundle(dir: &Path, cert: &TestCert) {
    fs::create_dir_all(dir).unwrap();
    fs::write(dir.join(FULLCHAIN), &cert.fullchain_pem).unwrap();
    fs::write(dir.join(CHAIN), &cert.fullchain_pem).unwrap();
    fs::write(dir.join(PRIVKEY), &cert.key_pem).unwrap();
}

/// A scratch deployment: templates, paths and a configuration pointing at them
pub struct TestSite {
    pub dir: tempfile::TempDir,
    pub config: Config,
}

impl TestSite {
    /// Site with one required group per name. `main` serves `example.com`,
    /// any other group `<name>.example.com`.
    pub fn new(groups: &[&str]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let templates = root.join("templates");
        fs::create_dir_all(&templates).unwrap();
        fs::create_dir_all(root.join("nginx")).unwrap();

        fs::write(
            templates.join("http.conf"),
            "server {\n    listen 80;\n    server_name {{server_names}};\n    \
             location /.well-known/acme-challenge/ { root {{webroot}}; }\n}\n",
        )
        .unwrap();
        fs::write(
            templates.join("https.conf"),
            "server {\n    listen 443 ssl;\n    server_name {{server_names}};\n    \
             ssl_certificate {{fullchain}};\n    ssl_certificate_key {{privkey}};\n    \
             add_header Strict-Transport-Security \"max-age={{hsts_seconds}}\";\n}\n",
        )
        .unwrap();
        fs::write(
            templates.join("challenge.conf"),
            "server {\n    listen 80;\n    server_name {{server_names}};\n    \
             location /.well-known/acme-challenge/ { root {{webroot}}; }\n    \
             location / { return 503; }\n}\n",
        )
        .unwrap();

        let mut config = Config::default();
        config.paths = PathsConfig {
            cert_root: root.join("live"),
            state_dir: root.join("state"),
            webroot: root.join("webroot"),
        };
        config.serving.live_config = root.join("nginx").join("site.conf");
        config.serving.http_template = templates.join("http.conf");
        config.serving.https_template = templates.join("https.conf");
        config.serving.challenge_template = Some(templates.join("challenge.conf"));
        config.app.env_file = root.join("app.env");
        config.timeouts.lock_secs = 1;
        config.groups = groups
            .iter()
            .map(|name| {
                let domain = if *name == "main" {
                    "example.com".to_string()
                } else {
                    format!("{}.example.com", name)
                };
                DomainGroup::new(*name, vec![domain])
            })
            .collect();

        Self { dir, config }
    }

    /// Plan serving every group in plaintext
    pub fn plaintext_plan(&self) -> ModePlan {
        ModePlan {
            mode: DeploymentMode::HttpOnly,
            encrypted_groups: Vec::new(),
            plaintext_groups: self.config.groups.iter().map(|g| g.name.clone()).collect(),
            reason: "no valid certificates".to_string(),
        }
    }

    /// Sorted file names next to the live configuration
    pub fn live_dir_entries(&self) -> Vec<String> {
        let Some(dir) = self.config.serving.live_config.parent() else {
            return Vec::new();
        };
        let mut names: Vec<String> = fs::read_dir(dir)
            .map(|entries| {
                entries
                    .flatten()
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }
}

#[derive(Debug, Default)]
struct ServingState {
    reject: Option<String>,
    fail_reload: bool,
    validations: usize,
    reloads: usize,
}

/// In-memory serving layer recording its calls
#[derive(Debug, Default)]
pub struct FakeServing {
    state: Mutex<ServingState>,
}

impl FakeServing {
    /// Reject the next candidate with `output`
    pub fn reject_next(&self, output: &str) {
        self.state.lock().reject = Some(output.to_string());
    }

    pub fn fail_reload(&self) {
        self.state.lock().fail_reload = true;
    }

    pub fn validations(&self) -> usize {
        self.state.lock().validations
    }

    pub fn reloads(&self) -> usize {
        self.state.lock().reloads
    }
}

#[async_trait]
impl ServingLayer for FakeServing {
    async fn validate(&self, candidate: &Path) -> Result<(), ConfigApplyError> {
        assert!(candidate.exists(), "candidate must exist while validated");
        let mut state = self.state.lock();
        state.validations += 1;
        match state.reject.take() {
            Some(output) => Err(ConfigApplyError::Rejected { output }),
            None => Ok(()),
        }
    }

    async fn reload(&self) -> Result<(), ConfigApplyError> {
        let mut state = self.state.lock();
        if state.fail_reload {
            return Err(ConfigApplyError::Command {
                command: "reload".to_string(),
                output: "reload refused".to_string(),
            });
        }
        state.reloads += 1;
        Ok(())
    }
}

/// In-memory service runtime recording restart attempts
#[derive(Debug, Default)]
pub struct FakeRuntime {
    restarts: Mutex<Vec<String>>,
    unhealthy: Mutex<Vec<String>>,
    failing_restarts: AtomicUsize,
}

impl FakeRuntime {
    pub fn restarts(&self) -> Vec<String> {
        self.restarts.lock().clone()
    }

    /// Fail the next `count` restart attempts
    pub fn fail_restarts(&self, count: usize) {
        self.failing_restarts.store(count, Ordering::SeqCst);
    }

    pub fn set_unhealthy(&self, service: &str) {
        self.unhealthy.lock().push(service.to_string());
    }
}

#[async_trait]
impl ServiceRuntime for FakeRuntime {
    async fn start(&self, _service: &str) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn stop(&self, _service: &str) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn health(&self, service: &str) -> Result<bool, RuntimeError> {
        Ok(!self.unhealthy.lock().iter().any(|s| s == service))
    }

    async fn restart(&self, service: &str) -> Result<(), RuntimeError> {
        self.restarts.lock().push(service.to_string());
        let failing = self.failing_restarts.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_restarts.store(failing - 1, Ordering::SeqCst);
            return Err(RuntimeError::Command {
                command: format!("restart {}", service),
                output: "unit failed to start".to_string(),
            });
        }
        Ok(())
    }
}

/// Authority minting self-signed certificates locally
#[derive(Debug, Default)]
pub struct FakeAuthority {
    delay: Duration,
    fail: bool,
    issued: AtomicUsize,
}

impl FakeAuthority {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn issued(&self) -> usize {
        self.issued.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CertificateAuthority for FakeAuthority {
    async fn issue(
        &self,
        group: &DomainGroup,
        challenges: &ChallengeManager,
    ) -> Result<IssuedCertificate, AcquisitionError> {
        challenges.add_challenge("fake-token", "fake-token.thumbprint")?;
        tokio::time::sleep(self.delay).await;

        if self.fail {
            return Err(AcquisitionError::ChallengeFailed {
                domain: group.primary().unwrap_or_default().to_string(),
                reason: "urn:ietf:params:acme:error:connection".to_string(),
            });
        }

        let names = identifiers_for(group);
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let cert = TestCert::valid_for_days(&refs, 90);
        self.issued.fetch_add(1, Ordering::SeqCst);
        Ok(IssuedCertificate {
            chain_pem: cert.fullchain_pem,
            key_pem: cert.key_pem,
        })
    }
}

/// Serves files below a webroot, like the serving layer does for challenges
pub struct WebrootResponder {
    root: PathBuf,
}

impl WebrootResponder {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }
}

impl Respond for WebrootResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let relative = request.url.path().trim_start_matches('/');
        match fs::read_to_string(self.root.join(relative)) {
            Ok(body) => ResponseTemplate::new(200).set_body_string(body),
            Err(_) => ResponseTemplate::new(404),
        }
    }
}
