//! Section parsers.

use anyhow::Result;
use std::path::PathBuf;
use tracing::trace;

use certshift_common::types::{DomainGroup, Severity};

use crate::sections::*;

use super::helpers::{
    get_bool_entry, get_first_arg_string, get_second_arg_string, get_string_entry,
    get_string_list, get_u64_entry,
};

/// Parse `acme { ... }`
pub fn parse_acme(node: &kdl::KdlNode) -> Result<AcmeConfig> {
    trace!("Parsing acme block");
    let defaults = AcmeConfig::default();

    let email = get_string_entry(node, "email");
    if let Some(ref email) = email {
        if !email.contains('@') {
            return Err(anyhow::anyhow!(
                "acme email '{}' is not an email address",
                email
            ));
        }
    }

    Ok(AcmeConfig {
        email,
        staging: get_bool_entry(node, "staging").unwrap_or(false),
        directory_url: get_string_entry(node, "directory").unwrap_or(defaults.directory_url),
        staging_directory_url: get_string_entry(node, "staging-directory")
            .unwrap_or(defaults.staging_directory_url),
    })
}

/// Parse `paths { ... }`
pub fn parse_paths(node: &kdl::KdlNode) -> PathsConfig {
    let defaults = PathsConfig::default();
    PathsConfig {
        cert_root: get_string_entry(node, "cert-root")
            .map(PathBuf::from)
            .unwrap_or(defaults.cert_root),
        state_dir: get_string_entry(node, "state-dir")
            .map(PathBuf::from)
            .unwrap_or(defaults.state_dir),
        webroot: get_string_entry(node, "webroot")
            .map(PathBuf::from)
            .unwrap_or(defaults.webroot),
    }
}

/// Parse `group "name" { domains ...; required #bool }`
pub fn parse_group(node: &kdl::KdlNode) -> Result<DomainGroup> {
    let name = get_first_arg_string(node).ok_or_else(|| {
        anyhow::anyhow!("Domain group requires a name, e.g., group \"main\" {{ ... }}")
    })?;

    let domains = get_string_list(node, "domains");
    trace!(group = %name, domains = domains.len(), "Parsed domain group");

    Ok(DomainGroup {
        name,
        domains,
        required: get_bool_entry(node, "required").unwrap_or(true),
    })
}

/// Parse `serving { ... }`
pub fn parse_serving(node: &kdl::KdlNode) -> ServingConfig {
    let defaults = ServingConfig::default();
    ServingConfig {
        live_config: get_string_entry(node, "live-config")
            .map(PathBuf::from)
            .unwrap_or(defaults.live_config),
        header_template: get_string_entry(node, "header-template").map(PathBuf::from),
        http_template: get_string_entry(node, "http-template")
            .map(PathBuf::from)
            .unwrap_or(defaults.http_template),
        https_template: get_string_entry(node, "https-template")
            .map(PathBuf::from)
            .unwrap_or(defaults.https_template),
        challenge_template: get_string_entry(node, "challenge-template").map(PathBuf::from),
        validate_command: get_string_entry(node, "validate-command")
            .unwrap_or(defaults.validate_command),
        reload_command: get_string_entry(node, "reload-command")
            .unwrap_or(defaults.reload_command),
    }
}

/// Parse `app { ... }`
pub fn parse_app(node: &kdl::KdlNode) -> Result<AppConfig> {
    let defaults = AppConfig::default();
    Ok(AppConfig {
        env_file: get_string_entry(node, "env-file")
            .map(PathBuf::from)
            .unwrap_or(defaults.env_file),
        liveness_url: get_string_entry(node, "liveness-url"),
        hsts_seconds: get_u64_entry(node, "hsts-seconds")?.unwrap_or(defaults.hsts_seconds),
        restart_service: get_string_entry(node, "restart-service"),
        secure_cookie_key: get_string_entry(node, "secure-cookie-key")
            .unwrap_or(defaults.secure_cookie_key),
        hsts_key: get_string_entry(node, "hsts-key").unwrap_or(defaults.hsts_key),
        redirect_key: get_string_entry(node, "redirect-key").unwrap_or(defaults.redirect_key),
    })
}

/// Parse `services { service "name" { ... } ... }`
pub fn parse_services(node: &kdl::KdlNode) -> Result<Vec<ServiceConfig>> {
    let mut services = Vec::new();

    if let Some(children) = node.children() {
        for svc in children.nodes() {
            if svc.name().value() != "service" {
                continue;
            }

            let name = get_first_arg_string(svc).ok_or_else(|| {
                anyhow::anyhow!("Service requires a name, e.g., service \"web\" {{ ... }}")
            })?;

            let health_command = get_string_entry(svc, "health-command").ok_or_else(|| {
                anyhow::anyhow!(
                    "Service '{}' requires a 'health-command', e.g., health-command \"systemctl is-active web\"",
                    name
                )
            })?;

            trace!(service = %name, "Parsed service");

            services.push(ServiceConfig {
                name,
                health_command,
                start_command: get_string_entry(svc, "start-command"),
                stop_command: get_string_entry(svc, "stop-command"),
                required: get_bool_entry(svc, "required").unwrap_or(true),
            });
        }
    }

    Ok(services)
}

/// Parse `dependencies { tcp "name" "host:port" ... }`
pub fn parse_dependencies(node: &kdl::KdlNode) -> Result<Vec<DependencyConfig>> {
    let mut deps = Vec::new();

    if let Some(children) = node.children() {
        for dep in children.nodes() {
            match dep.name().value() {
                "tcp" => {
                    let name = get_first_arg_string(dep);
                    let address = get_second_arg_string(dep);
                    match (name, address) {
                        (Some(name), Some(address)) => {
                            deps.push(DependencyConfig { name, address })
                        }
                        _ => {
                            return Err(anyhow::anyhow!(
                                "Dependency requires a name and address, e.g., tcp \"db\" \"127.0.0.1:5432\""
                            ))
                        }
                    }
                }
                other => {
                    return Err(anyhow::anyhow!(
                        "Unknown dependency kind '{}'. Valid kinds: tcp",
                        other
                    ))
                }
            }
        }
    }

    Ok(deps)
}

/// Parse `renewal { ... }`
pub fn parse_renewal(node: &kdl::KdlNode) -> Result<RenewalConfig> {
    let defaults = RenewalConfig::default();
    let renew_before_days = match get_u64_entry(node, "renew-before-days")? {
        Some(v) => u32::try_from(v)
            .map_err(|_| anyhow::anyhow!("renew-before-days is out of range: {}", v))?,
        None => defaults.renew_before_days,
    };

    Ok(RenewalConfig {
        renew_before_days,
        interval_hours: get_u64_entry(node, "interval-hours")?.unwrap_or(defaults.interval_hours),
    })
}

/// Parse `monitor { ... }`
pub fn parse_monitor(node: &kdl::KdlNode) -> Result<MonitorConfig> {
    let defaults = MonitorConfig::default();

    let min_severity = match get_string_entry(node, "min-severity") {
        Some(s) => s.parse::<Severity>().map_err(|e| anyhow::anyhow!(e))?,
        None => defaults.min_severity,
    };

    Ok(MonitorConfig {
        warning_days: get_u64_entry(node, "warning-days")?
            .map(|v| v as i64)
            .unwrap_or(defaults.warning_days),
        critical_days: get_u64_entry(node, "critical-days")?
            .map(|v| v as i64)
            .unwrap_or(defaults.critical_days),
        min_severity,
        webhook_url: get_string_entry(node, "webhook"),
        history_file: get_string_entry(node, "history-file").map(PathBuf::from),
        interval_hours: get_u64_entry(node, "interval-hours")?.unwrap_or(defaults.interval_hours),
    })
}

/// Parse `health { ... }`
pub fn parse_health(node: &kdl::KdlNode) -> Result<HealthConfig> {
    let defaults = HealthConfig::default();
    Ok(HealthConfig {
        attempts: get_u64_entry(node, "attempts")?
            .map(|v| v.clamp(1, 100) as u32)
            .unwrap_or(defaults.attempts),
        backoff_secs: get_u64_entry(node, "backoff-secs")?.unwrap_or(defaults.backoff_secs),
        external_probes: get_bool_entry(node, "external-probes")
            .unwrap_or(defaults.external_probes),
    })
}

/// Parse `timeouts { ... }`
pub fn parse_timeouts(node: &kdl::KdlNode) -> Result<TimeoutConfig> {
    let defaults = TimeoutConfig::default();

    Ok(TimeoutConfig {
        lock_secs: get_u64_entry(node, "lock-secs")?.unwrap_or(defaults.lock_secs),
        network_secs: get_u64_entry(node, "network-secs")?.unwrap_or(defaults.network_secs),
        acquisition_secs: get_u64_entry(node, "acquisition-secs")?
            .unwrap_or(defaults.acquisition_secs),
    })
}
