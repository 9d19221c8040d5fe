//! KDL document parsing.

use anyhow::Result;
use kdl::KdlDocument;
use tracing::{trace, warn};

use crate::error::ConfigError;
use crate::Config;

mod helpers;
mod sections;

use helpers::get_first_arg_string;

/// Parse a complete configuration document
pub fn parse_document(source: &str) -> Result<Config, ConfigError> {
    let doc: KdlDocument = source.parse()?;
    let mut config = Config::default();

    for node in doc.nodes() {
        let name = node.name().value();
        trace!(node = %name, "Parsing top-level configuration node");

        match name {
            "acme" => config.acme = sections::parse_acme(node)?,
            "paths" => config.paths = sections::parse_paths(node),
            "group" => config.groups.push(sections::parse_group(node)?),
            "serving" => config.serving = sections::parse_serving(node),
            "app" => config.app = sections::parse_app(node)?,
            "services" => config.services = sections::parse_services(node)?,
            "dependencies" => config.dependencies = sections::parse_dependencies(node)?,
            "renewal" => config.renewal = sections::parse_renewal(node)?,
            "monitor" => config.monitor = sections::parse_monitor(node)?,
            "health" => config.health = sections::parse_health(node)?,
            "timeouts" => config.timeouts = sections::parse_timeouts(node)?,
            "partial-policy" => {
                let value = get_first_arg_string(node).ok_or_else(|| {
                    ConfigError::Invalid(
                        "partial-policy requires a value, e.g., partial-policy \"valid-subset\""
                            .to_string(),
                    )
                })?;
                config.partial_policy = value.parse().map_err(ConfigError::Invalid)?;
            }
            "acquire-missing" => {
                config.acquire_missing = helpers::args(node)
                    .next()
                    .and_then(|v| v.as_bool())
                    .unwrap_or(true);
            }
            other => {
                warn!(node = %other, "Ignoring unknown configuration node");
            }
        }
    }

    Ok(config)
}
