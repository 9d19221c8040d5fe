//! Configuration error types.

use thiserror::Error;

/// Errors raised while loading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("KDL syntax error: {0}")]
    Syntax(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<::kdl::KdlError> for ConfigError {
    fn from(err: ::kdl::KdlError) -> Self {
        // Render through miette so span labels survive into the message
        let report = miette::Report::new(err);
        ConfigError::Syntax(format!("{:?}", report))
    }
}

impl From<anyhow::Error> for ConfigError {
    fn from(err: anyhow::Error) -> Self {
        ConfigError::Invalid(format!("{:#}", err))
    }
}
