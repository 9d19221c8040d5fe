//! Network connectivity validation
//!
//! Validates that TCP dependencies accept connections.

use super::{ErrorCategory, ValidationError, ValidationResult, ValidationWarning};
use crate::Config;
use std::io;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Connect timeout for dependency probes
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of a single TCP probe
#[derive(Debug)]
pub enum TcpProbe {
    Connected,
    Refused(io::Error),
    TimedOut,
}

/// Attempt a TCP connection to `address` within `limit`
pub async fn probe_tcp(address: &str, limit: Duration) -> TcpProbe {
    match timeout(limit, TcpStream::connect(address)).await {
        Ok(Ok(_)) => TcpProbe::Connected,
        Ok(Err(e)) => TcpProbe::Refused(e),
        Err(_) => TcpProbe::TimedOut,
    }
}

/// Validate dependency connectivity
pub async fn validate_dependencies(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();

    for dep in &config.dependencies {
        match probe_tcp(&dep.address, CONNECT_TIMEOUT).await {
            TcpProbe::Connected => {}
            TcpProbe::Refused(e) => {
                result.add_error(ValidationError::new(
                    ErrorCategory::Network,
                    format!("Dependency '{}' at '{}' unreachable: {}", dep.name, dep.address, e),
                ));
            }
            TcpProbe::TimedOut => {
                result.add_warning(ValidationWarning::new(format!(
                    "Dependency '{}' at '{}' connection timeout ({}s)",
                    dep.name,
                    dep.address,
                    CONNECT_TIMEOUT.as_secs()
                )));
            }
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DependencyConfig;

    fn config_with(address: &str) -> Config {
        let mut config = Config::default();
        config.dependencies.push(DependencyConfig {
            name: "db".to_string(),
            address: address.to_string(),
        });
        config
    }

    #[tokio::test]
    async fn test_validate_dependencies_unreachable() {
        // Port 1 is reserved and nothing listens there
        let result = validate_dependencies(&config_with("127.0.0.1:1")).await;
        assert!(!result.errors.is_empty() || !result.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_validate_dependencies_reachable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let result = validate_dependencies(&config_with(&address)).await;
        assert!(result.is_ok());
        assert!(result.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_probe_tcp_connected() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        assert!(matches!(
            probe_tcp(&address, CONNECT_TIMEOUT).await,
            TcpProbe::Connected
        ));
    }
}
