//! Configuration section types and their defaults.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use certshift_common::types::Severity;

// ============================================================================
// ACME
// ============================================================================

/// Let's Encrypt production directory
pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// Let's Encrypt staging directory (lower trust, separate quota)
pub const LETS_ENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// Certificate authority settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcmeConfig {
    /// Operator contact email used for account registration
    pub email: Option<String>,
    /// Use the staging directory by default
    pub staging: bool,
    /// Production directory URL
    pub directory_url: String,
    /// Staging directory URL
    pub staging_directory_url: String,
}

impl AcmeConfig {
    /// Directory URL for the requested trust level
    pub fn directory_for(&self, staging: bool) -> &str {
        if staging {
            &self.staging_directory_url
        } else {
            &self.directory_url
        }
    }
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            email: None,
            staging: false,
            directory_url: LETS_ENCRYPT_PRODUCTION.to_string(),
            staging_directory_url: LETS_ENCRYPT_STAGING.to_string(),
        }
    }
}

// ============================================================================
// Paths
// ============================================================================

/// On-disk locations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Root of the per-group certificate bundles
    pub cert_root: PathBuf,
    /// Lock file, applied plan, heartbeats and ACME account credentials
    pub state_dir: PathBuf,
    /// Directory served at `/.well-known/acme-challenge/` by the serving layer
    pub webroot: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            cert_root: PathBuf::from("/etc/certshift/live"),
            state_dir: PathBuf::from("/var/lib/certshift"),
            webroot: PathBuf::from("/var/www/certshift"),
        }
    }
}

// ============================================================================
// Serving layer
// ============================================================================

/// Serving-layer (reverse proxy) configuration variants and commands
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServingConfig {
    /// The live configuration file read by the serving layer
    pub live_config: PathBuf,
    /// Optional preamble rendered once at the top of the live file
    pub header_template: Option<PathBuf>,
    /// Per-group plaintext server block
    pub http_template: PathBuf,
    /// Per-group encrypted server block
    pub https_template: PathBuf,
    /// Per-group challenge-only server block used during acquisition
    pub challenge_template: Option<PathBuf>,
    /// Syntax check command; `{path}` is replaced with the candidate file
    pub validate_command: String,
    /// Graceful reload command
    pub reload_command: String,
}

impl Default for ServingConfig {
    fn default() -> Self {
        Self {
            live_config: PathBuf::from("/etc/nginx/conf.d/site.conf"),
            header_template: None,
            http_template: PathBuf::from("/etc/certshift/templates/http.conf"),
            https_template: PathBuf::from("/etc/certshift/templates/https.conf"),
            challenge_template: None,
            validate_command: "nginx -t -q -c {path}".to_string(),
            reload_command: "nginx -s reload".to_string(),
        }
    }
}

// ============================================================================
// Application
// ============================================================================

/// Application security-flag surface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Environment file the application reads at start
    pub env_file: PathBuf,
    /// Liveness probe URL (200 when app and its data dependency are ready)
    pub liveness_url: Option<String>,
    /// HSTS max-age applied in encrypted mode
    pub hsts_seconds: u64,
    /// Service restarted when the flags change
    pub restart_service: Option<String>,
    pub secure_cookie_key: String,
    pub hsts_key: String,
    pub redirect_key: String,
}

pub fn default_hsts_seconds() -> u64 {
    31_536_000
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            env_file: PathBuf::from("/etc/certshift/app.env"),
            liveness_url: None,
            hsts_seconds: default_hsts_seconds(),
            restart_service: None,
            secure_cookie_key: "SECURE_COOKIES".to_string(),
            hsts_key: "SECURE_HSTS_SECONDS".to_string(),
            redirect_key: "SECURE_SSL_REDIRECT".to_string(),
        }
    }
}

// ============================================================================
// Services and dependencies
// ============================================================================

/// A supervised process, driven through command templates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    /// Exit status 0 means the process is alive
    pub health_command: String,
    pub start_command: Option<String>,
    pub stop_command: Option<String>,
    /// Required services are checked for liveness after every mode change
    pub required: bool,
}

/// A TCP dependency that must accept connections (e.g. the database)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyConfig {
    pub name: String,
    /// `host:port`
    pub address: String,
}

// ============================================================================
// Renewal, monitoring and health
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenewalConfig {
    /// Renew bundles with fewer days remaining than this
    pub renew_before_days: u32,
    /// Cadence of the recurring renewal task
    pub interval_hours: u64,
}

impl Default for RenewalConfig {
    fn default() -> Self {
        Self {
            renew_before_days: 30,
            interval_hours: 12,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub warning_days: i64,
    pub critical_days: i64,
    /// Lowest severity forwarded to alert sinks
    pub min_severity: Severity,
    pub webhook_url: Option<String>,
    /// Append-only JSON lines alert history
    pub history_file: Option<PathBuf>,
    /// Cadence of the recurring monitor task
    pub interval_hours: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            warning_days: 30,
            critical_days: 7,
            min_severity: Severity::Warning,
            webhook_url: None,
            history_file: None,
            interval_hours: 24,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Attempts per external reachability probe
    pub attempts: u32,
    /// Initial linear backoff step
    pub backoff_secs: u64,
    /// Probe the public domains after a mode change
    pub external_probes: bool,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            attempts: 5,
            backoff_secs: 2,
            external_probes: true,
        }
    }
}

/// Bounded waits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Wait for the directory lock before reporting "locked"
    pub lock_secs: u64,
    /// Per network call (authority, probes)
    pub network_secs: u64,
    /// Wall-clock budget of one group acquisition
    pub acquisition_secs: u64,
}

impl TimeoutConfig {
    pub fn lock(&self) -> Duration {
        Duration::from_secs(self.lock_secs)
    }

    pub fn network(&self) -> Duration {
        Duration::from_secs(self.network_secs)
    }

    pub fn acquisition(&self) -> Duration {
        Duration::from_secs(self.acquisition_secs)
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            lock_secs: 30,
            network_secs: 10,
            acquisition_secs: 300,
        }
    }
}
