//! Configuration for the certshift deployment orchestrator.
//!
//! Configuration is written in KDL:
//!
//! ```kdl
//! acme {
//!     email "ops@example.com"
//!     staging #false
//! }
//!
//! paths {
//!     cert-root "/etc/certshift/live"
//!     state-dir "/var/lib/certshift"
//!     webroot "/var/www/certshift"
//! }
//!
//! group "main" {
//!     domains "example.com" "www.example.com"
//! }
//!
//! serving {
//!     live-config "/etc/nginx/conf.d/site.conf"
//!     http-template "/etc/certshift/templates/http.conf"
//!     https-template "/etc/certshift/templates/https.conf"
//!     validate-command "nginx -t -q -c {path}"
//!     reload-command "nginx -s reload"
//! }
//!
//! partial-policy "all-or-nothing"
//! ```

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use certshift_common::types::{DomainGroup, PartialPolicy};

mod error;
mod parser;
mod sections;

#[cfg(feature = "validation")]
pub mod validate;

pub use error::ConfigError;
pub use sections::*;

/// Complete orchestrator configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub acme: AcmeConfig,
    pub paths: PathsConfig,
    pub groups: Vec<DomainGroup>,
    pub serving: ServingConfig,
    pub app: AppConfig,
    pub services: Vec<ServiceConfig>,
    pub dependencies: Vec<DependencyConfig>,
    pub renewal: RenewalConfig,
    pub monitor: MonitorConfig,
    pub health: HealthConfig,
    pub timeouts: TimeoutConfig,
    /// Behaviour when only some required groups have valid certificates
    pub partial_policy: PartialPolicy,
    /// Acquire certificates for invalid groups during `deploy`
    pub acquire_missing: bool,
}

impl Config {
    /// Load configuration from a KDL file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;

        Self::from_kdl(&content)
    }

    /// Parse configuration from KDL source
    pub fn from_kdl(source: &str) -> Result<Self, ConfigError> {
        let config = parser::parse_document(source)?;
        debug!(
            groups = config.groups.len(),
            services = config.services.len(),
            dependencies = config.dependencies.len(),
            "Parsed configuration"
        );
        Ok(config)
    }

    /// Look up a domain group by name
    pub fn group(&self, name: &str) -> Option<&DomainGroup> {
        self.groups.iter().find(|g| g.name == name)
    }

    /// Structural validation; rejects configurations the orchestrator cannot run
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.groups.is_empty() {
            return Err(ConfigError::Invalid(
                "At least one domain group is required, e.g., group \"main\" { domains \"example.com\" }"
                    .to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for group in &self.groups {
            if !seen.insert(group.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "Duplicate domain group '{}'",
                    group.name
                )));
            }
            if group.name.is_empty()
                || group.name.starts_with('.')
                || group.name.contains(['/', '\\'])
            {
                return Err(ConfigError::Invalid(format!(
                    "Domain group name '{}' must be a plain directory name",
                    group.name
                )));
            }
            if group.domains.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "Domain group '{}' has no domains",
                    group.name
                )));
            }
            for domain in &group.domains {
                if domain.is_empty() || domain.contains(['/', ' ']) {
                    return Err(ConfigError::Invalid(format!(
                        "Domain group '{}' contains an invalid hostname '{}'",
                        group.name, domain
                    )));
                }
            }
        }

        if self.monitor.critical_days > self.monitor.warning_days {
            return Err(ConfigError::Invalid(format!(
                "monitor critical-days ({}) must not exceed warning-days ({})",
                self.monitor.critical_days, self.monitor.warning_days
            )));
        }

        if self.renewal.interval_hours == 0 || self.monitor.interval_hours == 0 {
            return Err(ConfigError::Invalid(
                "Recurring task intervals must be at least one hour".to_string(),
            ));
        }

        if !self.serving.validate_command.contains("{path}") {
            return Err(ConfigError::Invalid(
                "serving validate-command must reference the candidate file via {path}"
                    .to_string(),
            ));
        }

        if self.timeouts.network_secs == 0 || self.timeouts.acquisition_secs == 0 {
            return Err(ConfigError::Invalid(
                "Network and acquisition timeouts must be non-zero".to_string(),
            ));
        }

        for url in self
            .app
            .liveness_url
            .iter()
            .chain(self.monitor.webhook_url.iter())
        {
            url::Url::parse(url)
                .map_err(|e| ConfigError::Invalid(format!("Invalid URL '{}': {}", url, e)))?;
        }

        let mut service_names = HashSet::new();
        for service in &self.services {
            if !service_names.insert(service.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "Duplicate service '{}'",
                    service.name
                )));
            }
        }
        if let Some(ref restart) = self.app.restart_service {
            if !service_names.contains(restart.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "app restart-service '{}' is not a configured service",
                    restart
                )));
            }
        }

        Ok(())
    }
}
