//! Configuration linting for best practices
//!
//! Checks configuration for missing best practices and potential issues.

use super::{ValidationResult, ValidationWarning};
use crate::Config;

/// HSTS max-age below this is considered too short for production
const MIN_RECOMMENDED_HSTS: u64 = 86_400 * 180;

/// Lint configuration for best practices
pub fn lint_config(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();

    if config.acme.staging {
        result.add_warning(ValidationWarning::new(
            "ACME staging is enabled; issued certificates are not publicly trusted",
        ));
    }

    if config.acme.email.is_none() {
        result.add_warning(ValidationWarning::new(
            "No ACME contact email configured (expiry notices from the authority will be lost)",
        ));
    }

    if config.app.hsts_seconds < MIN_RECOMMENDED_HSTS {
        result.add_warning(ValidationWarning::new(format!(
            "HSTS max-age of {}s is shorter than the recommended {}s",
            config.app.hsts_seconds, MIN_RECOMMENDED_HSTS
        )));
    }

    if config.app.liveness_url.is_none() {
        result.add_warning(ValidationWarning::new(
            "No application liveness-url configured; health validation will skip the app probe",
        ));
    }

    if config.monitor.webhook_url.is_none() && config.monitor.history_file.is_none() {
        result.add_warning(ValidationWarning::new(
            "No alert webhook or history file configured; expiry alerts only reach the log",
        ));
    }

    if config.serving.challenge_template.is_none() && config.acquire_missing {
        result.add_warning(ValidationWarning::new(
            "acquire-missing is enabled without a challenge-template; the plaintext variant must serve the webroot",
        ));
    }

    for group in config.groups.iter().filter(|g| !g.required) {
        result.add_warning(ValidationWarning::new(format!(
            "Group '{}' is optional and never blocks encrypted mode",
            group.name
        )));
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lint_defaults() {
        let config = Config::from_kdl(r#"group "main" { domains "example.com" }"#).unwrap();
        let result = lint_config(&config);

        assert!(result.errors.is_empty());
        assert!(result.warnings.iter().any(|w| w.message.contains("email")));
        assert!(result.warnings.iter().any(|w| w.message.contains("liveness-url")));
        assert!(result.warnings.iter().any(|w| w.message.contains("webhook")));
        assert!(!result.warnings.iter().any(|w| w.message.contains("staging")));
        assert!(!result.warnings.iter().any(|w| w.message.contains("HSTS")));
    }

    #[test]
    fn test_lint_clean_config() {
        let config = Config::from_kdl(
            r#"
            acme { email "ops@example.com" }
            group "main" { domains "example.com" }
            app { liveness-url "http://127.0.0.1:8000/healthz" }
            monitor { webhook "https://hooks.example.com/certs" }
            "#,
        )
        .unwrap();

        assert!(lint_config(&config).warnings.is_empty());
    }

    #[test]
    fn test_lint_short_hsts_and_staging() {
        let config = Config::from_kdl(
            r#"
            acme { staging #true }
            group "main" { domains "example.com" }
            app { hsts-seconds 300 }
            "#,
        )
        .unwrap();

        let result = lint_config(&config);
        assert!(result.warnings.iter().any(|w| w.message.contains("staging")));
        assert!(result.warnings.iter().any(|w| w.message.contains("HSTS")));
    }
}
