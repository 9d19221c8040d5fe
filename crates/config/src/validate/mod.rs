//! Extended configuration validation for `check-config`.
//!
//! Structural checks live in [`Config::validate`]. This module adds checks
//! that touch the outside world or express recommendations:
//!
//! - [`certs`]: bundle artifacts exist, parse and are not expired
//! - [`network`]: dependencies accept TCP connections
//! - [`lint`]: best-practice warnings

use std::fmt;

use crate::Config;

pub mod certs;
pub mod lint;
pub mod network;

/// Category of a validation error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Structure,
    Certificate,
    Network,
    Template,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Structure => "structure",
            Self::Certificate => "certificate",
            Self::Network => "network",
            Self::Template => "template",
        };
        f.write_str(s)
    }
}

/// A validation failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub category: ErrorCategory,
    pub message: String,
}

impl ValidationError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.category, self.message)
    }
}

/// A non-fatal recommendation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationWarning {
    pub message: String,
}

impl ValidationWarning {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Collected errors and warnings
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: ValidationWarning) {
        self.warnings.push(warning);
    }

    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Options for [`validate_all`]
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidateOptions {
    /// Also probe dependency addresses
    pub network: bool,
}

/// Run every validation stage
pub async fn validate_all(config: &Config, options: ValidateOptions) -> ValidationResult {
    let mut result = ValidationResult::new();

    if let Err(e) = config.validate() {
        result.add_error(ValidationError::new(ErrorCategory::Structure, e.to_string()));
        return result;
    }

    result.merge(validate_templates(config));
    result.merge(certs::validate_certificates(config).await);
    result.merge(lint::lint_config(config));

    if options.network {
        result.merge(network::validate_dependencies(config).await);
    }

    result
}

/// Check that the configured serving-layer templates exist
pub fn validate_templates(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();
    let serving = &config.serving;

    let mut templates = vec![&serving.http_template, &serving.https_template];
    templates.extend(serving.header_template.iter());
    templates.extend(serving.challenge_template.iter());

    for template in templates {
        if !template.exists() {
            result.add_error(ValidationError::new(
                ErrorCategory::Template,
                format!("Template not found: {:?}", template),
            ));
        }
    }

    result
}
