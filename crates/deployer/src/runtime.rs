//! Process management behind a narrow interface.
//!
//! The orchestrator only needs to start, stop and health-check named
//! services. [`CommandRuntime`] drives them through configured shell command
//! templates, so any supervisor (systemd, docker compose, a process manager)
//! can be plugged in without the core knowing which.

use std::collections::HashMap;
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use certshift_config::ServiceConfig;

use crate::error::RuntimeError;

/// Result of a finished shell command
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub success: bool,
    pub code: Option<i32>,
    /// Combined, trimmed stdout and stderr
    pub output: String,
}

/// Run `command` through `sh -c`, killing it after `limit`
pub async fn run_shell(command: &str, limit: Duration) -> io::Result<CommandOutcome> {
    debug!(command = %command, "Running command");

    let child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .kill_on_drop(true)
        .output();

    let output = tokio::time::timeout(limit, child).await.map_err(|_| {
        io::Error::new(
            io::ErrorKind::TimedOut,
            format!("`{}` did not finish within {:?}", command, limit),
        )
    })??;

    let mut text = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.trim().is_empty() {
        if !text.trim().is_empty() {
            text.push('\n');
        }
        text.push_str(stderr.trim());
    }

    Ok(CommandOutcome {
        success: output.status.success(),
        code: output.status.code(),
        output: text.trim().to_string(),
    })
}

/// Quote `arg` as one `sh` word
pub fn shell_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', r"'\''"))
}

/// Narrow process-management interface
#[async_trait]
pub trait ServiceRuntime: Send + Sync {
    async fn start(&self, service: &str) -> Result<(), RuntimeError>;

    async fn stop(&self, service: &str) -> Result<(), RuntimeError>;

    /// `Ok(true)` if the service is alive
    async fn health(&self, service: &str) -> Result<bool, RuntimeError>;

    /// Stop then start, so the service re-reads its environment
    async fn restart(&self, service: &str) -> Result<(), RuntimeError> {
        self.stop(service).await?;
        self.start(service).await
    }
}

/// Runtime driven by per-service shell command templates
#[derive(Debug, Clone)]
pub struct CommandRuntime {
    services: HashMap<String, ServiceConfig>,
    timeout: Duration,
}

impl CommandRuntime {
    pub fn new(services: &[ServiceConfig], timeout: Duration) -> Self {
        Self {
            services: services
                .iter()
                .map(|s| (s.name.clone(), s.clone()))
                .collect(),
            timeout,
        }
    }

    fn service(&self, name: &str) -> Result<&ServiceConfig, RuntimeError> {
        self.services
            .get(name)
            .ok_or_else(|| RuntimeError::UnknownService(name.to_string()))
    }

    async fn run(&self, command: &str) -> Result<(), RuntimeError> {
        let outcome = run_shell(command, self.timeout).await?;
        if outcome.success {
            Ok(())
        } else {
            Err(RuntimeError::Command {
                command: command.to_string(),
                output: outcome.output,
            })
        }
    }
}

#[async_trait]
impl ServiceRuntime for CommandRuntime {
    async fn start(&self, service: &str) -> Result<(), RuntimeError> {
        let command = self
            .service(service)?
            .start_command
            .clone()
            .ok_or_else(|| RuntimeError::Unsupported {
                service: service.to_string(),
                action: "start",
            })?;
        info!(service = %service, "Starting service");
        self.run(&command).await
    }

    async fn stop(&self, service: &str) -> Result<(), RuntimeError> {
        let command = self
            .service(service)?
            .stop_command
            .clone()
            .ok_or_else(|| RuntimeError::Unsupported {
                service: service.to_string(),
                action: "stop",
            })?;
        info!(service = %service, "Stopping service");
        self.run(&command).await
    }

    async fn health(&self, service: &str) -> Result<bool, RuntimeError> {
        let command = self.service(service)?.health_command.clone();
        let outcome = run_shell(&command, self.timeout).await?;
        if !outcome.success {
            warn!(
                service = %service,
                code = ?outcome.code,
                output = %outcome.output,
                "Service health command failed"
            );
        }
        Ok(outcome.success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(name: &str, health: &str) -> ServiceConfig {
        ServiceConfig {
            name: name.to_string(),
            health_command: health.to_string(),
            start_command: Some("true".to_string()),
            stop_command: None,
            required: true,
        }
    }

    #[tokio::test]
    async fn test_run_shell_captures_output() {
        let outcome = run_shell("echo out; echo err >&2; exit 3", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.code, Some(3));
        assert_eq!(outcome.output, "out\nerr");
    }

    #[tokio::test]
    async fn test_shell_quote_keeps_one_word() {
        let arg = "it's a $HOME; rm x";
        let outcome = run_shell(&format!("printf %s {}", shell_quote(arg)), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.output, arg);
    }

    #[tokio::test]
    async fn test_run_shell_times_out() {
        let err = run_shell("sleep 5", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_health() {
        let runtime = CommandRuntime::new(
            &[service("web", "true"), service("worker", "false")],
            Duration::from_secs(5),
        );
        assert!(runtime.health("web").await.unwrap());
        assert!(!runtime.health("worker").await.unwrap());
        assert!(matches!(
            runtime.health("db").await,
            Err(RuntimeError::UnknownService(_))
        ));
    }

    #[tokio::test]
    async fn test_restart_without_stop_command() {
        let runtime = CommandRuntime::new(&[service("web", "true")], Duration::from_secs(5));
        runtime.start("web").await.unwrap();
        assert!(matches!(
            runtime.restart("web").await,
            Err(RuntimeError::Unsupported { action: "stop", .. })
        ));
    }
}
