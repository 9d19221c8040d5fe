//! Fixtures for the integration tests.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rcgen::{CertificateParams, KeyPair};
use wiremock::matchers::path_regex;
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use certshift::acme::identifiers_for;
use certshift::store::{CHAIN, FULLCHAIN, PRIVKEY};
use certshift::{
    AcquisitionError, CertificateAuthority, ChallengeManager, Components, ConfigApplyError,
    InterruptFlag, IssuedCertificate, Orchestrator, RuntimeError, ServiceRuntime, ServingLayer,
};
use certshift_common::DomainGroup;
use certshift_config::{Config, PathsConfig};

/// PEM material for a self-signed certificate
pub struct TestCert {
    pub fullchain_pem: String,
    pub key_pem: String,
}

impl TestCert {
    pub fn valid_for_days(names: &[String], days: i64) -> Self {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(names.to_vec()).unwrap();
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

/// A deployment rooted in a temporary directory
pub struct Site {
    pub dir: tempfile::TempDir,
    pub config: Config,
}

impl Site {
    /// One required group per name, every group served at `host`
    pub fn new(groups: &[&str], host: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let templates = root.join("templates");
        fs::create_dir_all(&templates).unwrap();
        fs::create_dir_all(root.join("nginx")).unwrap();

        fs::write(
            templates.join("http.conf"),
            "server { listen 80; server_name {{server_names}}; root {{webroot}}; }\n",
        )
        .unwrap();
        fs::write(
            templates.join("https.conf"),
            "server { listen 443 ssl; server_name {{server_names}}; \
             ssl_certificate {{fullchain}}; ssl_certificate_key {{privkey}}; }\n",
        )
        .unwrap();
        fs::write(
            templates.join("challenge.conf"),
            "server { listen 80; server_name {{server_names}}; \
             location /.well-known/acme-challenge/ { root {{webroot}}; } }\n",
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
        config.health.external_probes = false;
        config.timeouts.lock_secs = 1;
        config.timeouts.network_secs = 5;
        config.groups = groups
            .iter()
            .map(|name| DomainGroup::new(*name, vec![host.to_string()]))
            .collect();

        Self { dir, config }
    }

    pub fn group(&self, name: &str) -> &DomainGroup {
        self.config.group(name).unwrap()
    }

    /// Install a bundle for `group` expiring in `days`
    pub fn write_bundle(&self, group: &str, days: i64) {
        let names = identifiers_for(self.group(group));
        let cert = TestCert::valid_for_days(&names, days);
        let dir = self.config.paths.cert_root.join(group);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(FULLCHAIN), &cert.fullchain_pem).unwrap();
        fs::write(dir.join(CHAIN), &cert.fullchain_pem).unwrap();
        fs::write(dir.join(PRIVKEY), &cert.key_pem).unwrap();
    }

    pub fn live_config(&self) -> Option<String> {
        fs::read_to_string(&self.config.serving.live_config).ok()
    }

    pub fn env_file(&self) -> Option<String> {
        fs::read_to_string(&self.config.app.env_file).ok()
    }

    pub fn live_dir_entries(&self) -> Vec<String> {
        let dir = self.config.serving.live_config.parent().unwrap();
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }
}

/// A running orchestrator with handles to its fakes
pub struct Harness {
    pub orchestrator: Orchestrator,
    pub serving: Arc<FakeServing>,
    pub runtime: Arc<FakeRuntime>,
    pub authority: Arc<FakeAuthority>,
}

impl Harness {
    pub fn new(site: &Site, authority: FakeAuthority) -> Self {
        let serving = Arc::new(FakeServing::default());
        let runtime = Arc::new(FakeRuntime::default());
        let authority = Arc::new(authority);
        let components = Components::assemble(
            &site.config,
            authority.clone(),
            serving.clone(),
            runtime.clone(),
        )
        .unwrap();
        let orchestrator =
            Orchestrator::new(site.config.clone(), components, InterruptFlag::default());
        Self {
            orchestrator,
            serving,
            runtime,
            authority,
        }
    }
}

/// Mock HTTP server answering challenge requests from `webroot`
pub async fn challenge_server(webroot: &Path) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(path_regex("^/.well-known/acme-challenge/.+$"))
        .respond_with(WebrootResponder {
            root: webroot.to_path_buf(),
        })
        .mount(&server)
        .await;
    server
}

/// `host:port` of a mock server
pub fn host_of(server: &MockServer) -> String {
    server.address().to_string()
}

struct WebrootResponder {
    root: PathBuf,
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

#[derive(Debug, Default)]
pub struct FakeServing {
    validations: AtomicUsize,
    reloads: AtomicUsize,
}

impl FakeServing {
    pub fn validations(&self) -> usize {
        self.validations.load(Ordering::SeqCst)
    }

    pub fn reloads(&self) -> usize {
        self.reloads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ServingLayer for FakeServing {
    async fn validate(&self, candidate: &Path) -> Result<(), ConfigApplyError> {
        assert!(candidate.exists());
        self.validations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn reload(&self) -> Result<(), ConfigApplyError> {
        self.reloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct FakeRuntime {
    restarts: Mutex<Vec<String>>,
}

impl FakeRuntime {
    pub fn restarts(&self) -> Vec<String> {
        self.restarts.lock().clone()
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

    async fn health(&self, _service: &str) -> Result<bool, RuntimeError> {
        Ok(true)
    }

    async fn restart(&self, service: &str) -> Result<(), RuntimeError> {
        self.restarts.lock().push(service.to_string());
        Ok(())
    }
}

/// Issues self-signed certificates, optionally after a delay
#[derive(Debug, Default)]
pub struct FakeAuthority {
    delay: Duration,
    issued: AtomicUsize,
}

impl FakeAuthority {
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
        challenges.add_challenge("integration-token", "integration-token.thumbprint")?;
        tokio::time::sleep(self.delay).await;

        let cert = TestCert::valid_for_days(&identifiers_for(group), 90);
        self.issued.fetch_add(1, Ordering::SeqCst);
        Ok(IssuedCertificate {
            chain_pem: cert.fullchain_pem,
            key_pem: cert.key_pem,
        })
    }
}
