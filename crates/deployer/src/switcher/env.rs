//! Application security flags in the environment file.
//!
//! Only the three managed keys are rewritten; every other line of the file
//! is preserved as-is.

use serde::{Deserialize, Serialize};

use certshift_config::AppConfig;

use crate::mode::ModePlan;

/// Security posture the application reads at start
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityFlags {
    pub secure_cookies: bool,
    pub hsts_seconds: u64,
    pub ssl_redirect: bool,
}

impl SecurityFlags {
    /// Flags are on only when every group is served encrypted
    pub fn for_plan(plan: &ModePlan, hsts_seconds: u64) -> Self {
        if plan.is_fully_encrypted() {
            Self {
                secure_cookies: true,
                hsts_seconds,
                ssl_redirect: true,
            }
        } else {
            Self::off()
        }
    }

    pub fn off() -> Self {
        Self {
            secure_cookies: false,
            hsts_seconds: 0,
            ssl_redirect: false,
        }
    }

    fn entries(&self, app: &AppConfig) -> [(String, String); 3] {
        [
            (app.secure_cookie_key.clone(), bool_value(self.secure_cookies)),
            (app.hsts_key.clone(), self.hsts_seconds.to_string()),
            (app.redirect_key.clone(), bool_value(self.ssl_redirect)),
        ]
    }
}

fn bool_value(v: bool) -> String {
    if v { "True" } else { "False" }.to_string()
}

fn parse_bool(v: &str) -> Option<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

fn split_line(line: &str) -> Option<(&str, &str)> {
    let trimmed = line.trim_start();
    if trimmed.starts_with('#') {
        return None;
    }
    let trimmed = trimmed.strip_prefix("export ").unwrap_or(trimmed);
    let (key, value) = trimmed.split_once('=')?;
    Some((key.trim(), value.trim().trim_matches('"')))
}

/// Read the managed flags from an env file. `None` if any key is absent or malformed.
pub fn read_flags(content: &str, app: &AppConfig) -> Option<SecurityFlags> {
    let lookup = |key: &str| {
        content
            .lines()
            .filter_map(split_line)
            .filter(|(k, _)| *k == key)
            .map(|(_, v)| v)
            .last()
    };

    Some(SecurityFlags {
        secure_cookies: parse_bool(lookup(&app.secure_cookie_key)?)?,
        hsts_seconds: lookup(&app.hsts_key)?.parse().ok()?,
        ssl_redirect: parse_bool(lookup(&app.redirect_key)?)?,
    })
}

/// Rewrite the managed keys of `content`, appending any that are missing
pub fn apply_flags(content: &str, flags: &SecurityFlags, app: &AppConfig) -> String {
    let entries = flags.entries(app);
    let mut written = [false; 3];
    let mut out = String::with_capacity(content.len() + 96);

    for line in content.lines() {
        let managed = split_line(line)
            .and_then(|(key, _)| entries.iter().position(|(k, _)| k == key));
        match managed {
            Some(i) if !written[i] => {
                out.push_str(&format!("{}={}\n", entries[i].0, entries[i].1));
                written[i] = true;
            }
            // Drop duplicate definitions of a managed key
            Some(_) => {}
            None => {
                out.push_str(line);
                out.push('\n');
            }
        }
    }

    for (i, (key, value)) in entries.iter().enumerate() {
        if !written[i] {
            out.push_str(&format!("{}={}\n", key, value));
        }
    }

    out
}
