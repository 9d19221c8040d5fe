//! Core domain types.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Domain Groups
// ============================================================================

/// A set of hostnames covered by a single certificate.
///
/// The group is the unit of acquisition and renewal. The first domain is the
/// primary name and is used for logging and the certificate subject.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DomainGroup {
    /// Group name, also the on-disk directory name of its bundle
    pub name: String,
    /// Hostnames in the group (non-empty)
    pub domains: Vec<String>,
    /// Whether this group must be encrypted for the site to serve HTTPS
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

impl DomainGroup {
    /// Create a required group
    pub fn new(name: impl Into<String>, domains: Vec<String>) -> Self {
        Self {
            name: name.into(),
            domains,
            required: true,
        }
    }

    /// Mark this group as optional
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// Primary domain (first entry)
    pub fn primary(&self) -> Option<&str> {
        self.domains.first().map(String::as_str)
    }
}

// ============================================================================
// Deployment Mode
// ============================================================================

/// Mode the serving layer runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentMode {
    /// Plaintext, chosen because certificates are unavailable
    HttpOnly,
    /// Encrypted, chosen because certificates are valid
    Https,
    /// Plaintext, forced by the operator
    ForcedHttp,
    /// Encrypted, forced by the operator
    ForcedHttps,
}

impl DeploymentMode {
    /// Whether the mode serves the encrypted variant
    pub fn is_encrypted(&self) -> bool {
        matches!(self, Self::Https | Self::ForcedHttps)
    }

    /// Whether an operator flag selected this mode
    pub fn is_forced(&self) -> bool {
        matches!(self, Self::ForcedHttp | Self::ForcedHttps)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HttpOnly => "HTTP_ONLY",
            Self::Https => "HTTPS",
            Self::ForcedHttp => "FORCED_HTTP",
            Self::ForcedHttps => "FORCED_HTTPS",
        }
    }
}

impl fmt::Display for DeploymentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to do when only some required groups have valid certificates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PartialPolicy {
    /// Serve everything in plaintext until every required group is valid
    #[default]
    AllOrNothing,
    /// Encrypt the valid groups, keep the rest in plaintext
    ValidSubset,
}

impl FromStr for PartialPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "all-or-nothing" => Ok(Self::AllOrNothing),
            "valid-subset" => Ok(Self::ValidSubset),
            other => Err(format!(
                "Invalid partial policy '{}'. Valid policies: all-or-nothing, valid-subset",
                other
            )),
        }
    }
}

// ============================================================================
// Severity and Check Status
// ============================================================================

/// Alert severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Ok,
    Warning,
    Critical,
}

impl Severity {
    /// Process exit code for a run ending at this severity
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Ok => 0,
            Self::Warning => 1,
            Self::Critical => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Warning => "WARNING",
            Self::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "OK" => Ok(Self::Ok),
            "WARNING" | "WARN" => Ok(Self::Warning),
            "CRITICAL" | "CRIT" => Ok(Self::Critical),
            other => Err(format!("Invalid severity '{}'", other)),
        }
    }
}

/// Status of a single report check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckStatus {
    Ok,
    Warning,
    Critical,
    /// Not run because an earlier fatal check failed
    Skipped,
}

impl CheckStatus {
    /// Severity contribution to the overall report status
    pub fn severity(&self) -> Severity {
        match self {
            Self::Ok | Self::Skipped => Severity::Ok,
            Self::Warning => Severity::Warning,
            Self::Critical => Severity::Critical,
        }
    }

    /// Whether the check counts as failed
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Warning | Self::Critical)
    }
}

impl From<Severity> for CheckStatus {
    fn from(severity: Severity) -> Self {
        match severity {
            Severity::Ok => Self::Ok,
            Severity::Warning => Self::Warning,
            Severity::Critical => Self::Critical,
        }
    }
}
