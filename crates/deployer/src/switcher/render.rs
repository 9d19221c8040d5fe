//! Serving-layer configuration rendering.
//!
//! The live file is built from one optional header plus one server block per
//! domain group. Each block comes from the template matching the group's
//! treatment in the plan. Templates are Handlebars sources rendered in strict
//! mode, so a misspelled placeholder fails the render instead of reaching the
//! serving layer. Values are inserted verbatim:
//!
//! | placeholder | value |
//! |---|---|
//! | `{{group}}` | group name |
//! | `{{primary}}` | first domain, without port |
//! | `{{server_names}}` | all domains, space separated, without ports |
//! | `{{fullchain}}` `{{chain}}` `{{privkey}}` | bundle artifact paths |
//! | `{{webroot}}` | challenge webroot |
//! | `{{hsts_seconds}}` | HSTS max-age |
//! | `{{mode}}` `{{variant}}` | deployment mode and variant (header only) |

use std::fs;
use std::path::Path;

use handlebars::Handlebars;
use serde::Serialize;

use certshift_common::DomainGroup;
use certshift_config::ServingConfig;

use crate::error::ConfigApplyError;
use crate::mode::ModePlan;
use crate::store::{CHAIN, FULLCHAIN, PRIVKEY};

const HEADER: &str = "header";
const HTTP: &str = "http";
const HTTPS: &str = "https";
const CHALLENGE: &str = "challenge";

/// Which configuration the serving layer should run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServingVariant {
    Plaintext,
    Encrypted,
    /// Some groups encrypted, the rest plaintext
    Mixed,
    /// Only challenge paths served, used transiently during acquisition
    ChallengeOnly,
}

impl ServingVariant {
    pub fn for_plan(plan: &ModePlan) -> Self {
        match (plan.encrypted_groups.is_empty(), plan.plaintext_groups.is_empty()) {
            (true, _) => Self::Plaintext,
            (false, true) => Self::Encrypted,
            (false, false) => Self::Mixed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plaintext => "plaintext",
            Self::Encrypted => "encrypted",
            Self::Mixed => "mixed",
            Self::ChallengeOnly => "challenge-only",
        }
    }
}

/// Compiled serving-layer templates
pub struct TemplateSet {
    registry: Handlebars<'static>,
}

impl TemplateSet {
    /// Read and compile the configured templates
    pub fn load(serving: &ServingConfig) -> Result<Self, ConfigApplyError> {
        let header = serving
            .header_template
            .as_deref()
            .map(read_template)
            .transpose()?;
        let challenge = serving
            .challenge_template
            .as_deref()
            .map(read_template)
            .transpose()?;
        Self::compile(
            header.as_deref(),
            &read_template(&serving.http_template)?,
            &read_template(&serving.https_template)?,
            challenge.as_deref(),
        )
    }

    /// Compile template sources
    pub fn compile(
        header: Option<&str>,
        http: &str,
        https: &str,
        challenge: Option<&str>,
    ) -> Result<Self, ConfigApplyError> {
        let mut registry = Handlebars::new();
        registry.set_strict_mode(true);
        registry.register_escape_fn(handlebars::no_escape);

        let sources = [
            (HEADER, header),
            (HTTP, Some(http)),
            (HTTPS, Some(https)),
            (CHALLENGE, challenge),
        ];
        for (name, source) in sources {
            if let Some(source) = source {
                registry
                    .register_template_string(name, source)
                    .map_err(|e| ConfigApplyError::Render {
                        template: name,
                        reason: e.to_string(),
                    })?;
            }
        }
        Ok(Self { registry })
    }

    fn has(&self, name: &str) -> bool {
        self.registry.has_template(name)
    }

    fn render<T: Serialize>(&self, name: &'static str, data: &T) -> Result<String, ConfigApplyError> {
        self.registry
            .render(name, data)
            .map_err(|e| ConfigApplyError::Render {
                template: name,
                reason: e.to_string(),
            })
    }
}

fn read_template(path: &Path) -> Result<String, ConfigApplyError> {
    fs::read_to_string(path).map_err(|source| ConfigApplyError::Template {
        path: path.to_path_buf(),
        source,
    })
}

/// Values shared by every block
#[derive(Debug, Clone)]
pub struct RenderContext<'a> {
    pub cert_root: &'a Path,
    pub webroot: &'a Path,
    pub hsts_seconds: u64,
}

/// Render the full live configuration
pub fn render(
    templates: &TemplateSet,
    variant: ServingVariant,
    plan: &ModePlan,
    groups: &[DomainGroup],
    ctx: &RenderContext<'_>,
) -> Result<String, ConfigApplyError> {
    let mut out = String::new();

    if templates.has(HEADER) {
        let vars = HeaderVars {
            mode: plan.mode.to_string(),
            variant: variant.as_str(),
        };
        push_block(&mut out, &templates.render(HEADER, &vars)?);
    }

    for group in groups {
        let template = match variant {
            ServingVariant::ChallengeOnly if templates.has(CHALLENGE) => CHALLENGE,
            ServingVariant::ChallengeOnly => HTTP,
            _ if plan.encrypted_groups.contains(&group.name) => HTTPS,
            _ => HTTP,
        };
        push_block(&mut out, &templates.render(template, &GroupVars::new(group, ctx))?);
    }

    Ok(out)
}

fn push_block(out: &mut String, block: &str) {
    out.push_str(block);
    if !out.ends_with('\n') {
        out.push('\n');
    }
}

#[derive(Serialize)]
struct HeaderVars {
    mode: String,
    variant: &'static str,
}

#[derive(Serialize)]
struct GroupVars {
    group: String,
    primary: String,
    server_names: String,
    fullchain: String,
    chain: String,
    privkey: String,
    webroot: String,
    hsts_seconds: u64,
}

impl GroupVars {
    fn new(group: &DomainGroup, ctx: &RenderContext<'_>) -> Self {
        let dir = ctx.cert_root.join(&group.name);
        Self {
            group: group.name.clone(),
            primary: group.primary().map(strip_port).unwrap_or_default().to_string(),
            server_names: group
                .domains
                .iter()
                .map(|d| strip_port(d))
                .collect::<Vec<_>>()
                .join(" "),
            fullchain: dir.join(FULLCHAIN).display().to_string(),
            chain: dir.join(CHAIN).display().to_string(),
            privkey: dir.join(PRIVKEY).display().to_string(),
            webroot: ctx.webroot.display().to_string(),
            hsts_seconds: ctx.hsts_seconds,
        }
    }
}

fn strip_port(domain: &str) -> &str {
    domain.split(':').next().unwrap_or(domain)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use certshift_common::DeploymentMode;

    fn templates() -> TemplateSet {
        TemplateSet::compile(
            Some("# mode={{mode}} variant={{variant}}"),
            "http {{group}} {{server_names}} root={{webroot}}\n",
            "https {{primary}} cert={{fullchain}} key={{privkey}} hsts={{hsts_seconds}}\n",
            Some("challenge {{primary}}\n"),
        )
        .unwrap()
    }

    fn groups() -> Vec<DomainGroup> {
        vec![
            DomainGroup::new(
                "main",
                vec!["example.com".to_string(), "www.example.com:8080".to_string()],
            ),
            DomainGroup::new("docs", vec!["docs.example.com".to_string()]),
        ]
    }

    fn plan(encrypted: &[&str], plaintext: &[&str]) -> ModePlan {
        ModePlan {
            mode: if encrypted.is_empty() {
                DeploymentMode::HttpOnly
            } else {
                DeploymentMode::Https
            },
            encrypted_groups: encrypted.iter().map(|s| s.to_string()).collect(),
            plaintext_groups: plaintext.iter().map(|s| s.to_string()).collect(),
            reason: String::new(),
        }
    }

    fn ctx() -> RenderContext<'static> {
        RenderContext {
            cert_root: Path::new("/certs"),
            webroot: Path::new("/www"),
            hsts_seconds: 600,
        }
    }

    #[test]
    fn test_variant_for_plan() {
        assert_eq!(
            ServingVariant::for_plan(&plan(&[], &["main"])),
            ServingVariant::Plaintext
        );
        assert_eq!(
            ServingVariant::for_plan(&plan(&["main"], &[])),
            ServingVariant::Encrypted
        );
        assert_eq!(
            ServingVariant::for_plan(&plan(&["main"], &["docs"])),
            ServingVariant::Mixed
        );
    }

    #[test]
    fn test_render_plaintext() {
        let p = plan(&[], &["main", "docs"]);
        let out = render(&templates(), ServingVariant::Plaintext, &p, &groups(), &ctx()).unwrap();
        assert_eq!(
            out,
            "# mode=HTTP_ONLY variant=plaintext\n\
             http main example.com www.example.com root=/www\n\
             http docs docs.example.com root=/www\n"
        );
    }

    #[test]
    fn test_render_mixed() {
        let p = plan(&["main"], &["docs"]);
        let out = render(&templates(), ServingVariant::Mixed, &p, &groups(), &ctx()).unwrap();
        assert!(out.contains(
            "https example.com cert=/certs/main/fullchain.pem key=/certs/main/privkey.pem hsts=600"
        ));
        assert!(out.contains("http docs docs.example.com"));
    }

    #[test]
    fn test_render_challenge_only_falls_back_to_http() {
        let p = plan(&["main"], &["docs"]);
        let out = render(&templates(), ServingVariant::ChallengeOnly, &p, &groups(), &ctx()).unwrap();
        assert!(out.contains("challenge example.com"));
        assert!(!out.contains("https"));

        let no_challenge = TemplateSet::compile(None, "http {{group}}\n", "https\n", None).unwrap();
        let out = render(&no_challenge, ServingVariant::ChallengeOnly, &p, &groups(), &ctx()).unwrap();
        assert_eq!(out, "http main\nhttp docs\n");
    }

    #[test]
    fn test_nginx_braces_and_paths_kept_verbatim() {
        let set = TemplateSet::compile(
            None,
            "server { root {{webroot}}; location = /x { return 200 \"<&>\"; } }",
            "https\n",
            None,
        )
        .unwrap();
        let webroot = Path::new("/var/www/it's");
        let ctx = RenderContext {
            webroot,
            ..ctx()
        };
        let out = render(&set, ServingVariant::Plaintext, &plan(&[], &["docs"]), &groups()[1..], &ctx).unwrap();
        assert_eq!(
            out,
            "server { root /var/www/it's; location = /x { return 200 \"<&>\"; } }\n"
        );
    }

    #[test]
    fn test_unknown_placeholder_fails_render() {
        let set = TemplateSet::compile(None, "http\n", "ssl_certificate {{fulchain}};\n", None).unwrap();
        let result = render(&set, ServingVariant::Encrypted, &plan(&["docs"], &[]), &groups()[1..], &ctx());
        match result {
            Err(ConfigApplyError::Render { template, reason }) => {
                assert_eq!(template, "https");
                assert!(reason.contains("fulchain"), "{}", reason);
            }
            other => panic!("expected render error, got {:?}", other),
        }
    }

    #[test]
    fn test_malformed_template_rejected_at_compile() {
        assert!(matches!(
            TemplateSet::compile(None, "server { {{#if webroot}} }", "https\n", None),
            Err(ConfigApplyError::Render { template: "http", .. })
        ));
    }

    #[test]
    fn test_missing_template_reported() {
        let serving = ServingConfig {
            http_template: PathBuf::from("/nonexistent/http.conf"),
            ..ServingConfig::default()
        };
        assert!(matches!(
            TemplateSet::load(&serving),
            Err(ConfigApplyError::Template { .. })
        ));
    }
}
