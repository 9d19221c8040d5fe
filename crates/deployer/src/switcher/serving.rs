//! Serving-layer process contract.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::ConfigApplyError;
use crate::runtime::{run_shell, shell_quote};

/// Placeholder replaced by the quoted candidate file in the validate command
pub const PATH_PLACEHOLDER: &str = "{path}";

/// The reverse proxy in front of the application
#[async_trait]
pub trait ServingLayer: Send + Sync {
    /// Syntax-check a candidate configuration file
    async fn validate(&self, candidate: &Path) -> Result<(), ConfigApplyError>;

    /// Graceful reload of the live configuration
    async fn reload(&self) -> Result<(), ConfigApplyError>;
}

/// Serving layer driven by validate and reload command templates,
/// e.g. `nginx -t -q -c {path}` and `nginx -s reload`
#[derive(Debug, Clone)]
pub struct CommandServingLayer {
    validate_command: String,
    reload_command: String,
    timeout: Duration,
}

impl CommandServingLayer {
    pub fn new(
        validate_command: impl Into<String>,
        reload_command: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            validate_command: validate_command.into(),
            reload_command: reload_command.into(),
            timeout,
        }
    }
}

#[async_trait]
impl ServingLayer for CommandServingLayer {
    async fn validate(&self, candidate: &Path) -> Result<(), ConfigApplyError> {
        let command = self
            .validate_command
            .replace(PATH_PLACEHOLDER, &shell_quote(&candidate.display().to_string()));
        let outcome = run_shell(&command, self.timeout).await?;
        if outcome.success {
            debug!(candidate = %candidate.display(), "Serving layer accepted candidate");
            Ok(())
        } else {
            Err(ConfigApplyError::Rejected {
                output: outcome.output,
            })
        }
    }

    async fn reload(&self) -> Result<(), ConfigApplyError> {
        let outcome = run_shell(&self.reload_command, self.timeout).await?;
        if outcome.success {
            info!("Serving layer reloaded");
            Ok(())
        } else {
            Err(ConfigApplyError::Command {
                command: self.reload_command.clone(),
                output: outcome.output,
            })
        }
    }
}
