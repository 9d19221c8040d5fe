//! Post-apply health verification.
//!
//! Checks run in stages, each depending on the previous one:
//!
//! | stage | check names | fatal |
//! |---|---|---|
//! | required service liveness | `health:service:<name>` | yes |
//! | dependency readiness (TCP) | `health:dependency:<name>` | yes |
//! | application liveness probe | `health:liveness` | yes |
//! | external reachability | `health:external:<scheme>:<domain>` | no |
//!
//! Every domain is probed over plaintext; domains of encrypted groups are
//! probed over TLS as well. Once a fatal stage fails, every later check is
//! reported as skipped.
//! Verification is read-only; failures degrade the run to WARNING and never
//! trigger a rollback.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, info, warn};

use certshift_common::{DomainGroup, LinearBackoff, ReportCheck, StatusReport};
use certshift_config::validate::network::{probe_tcp, TcpProbe, CONNECT_TIMEOUT};
use certshift_config::{Config, DependencyConfig, ServiceConfig};

use crate::error::HealthCheckError;
use crate::mode::ModePlan;
use crate::runtime::ServiceRuntime;

/// Outcome of a verification
#[derive(Debug, Clone)]
pub struct HealthReport {
    pub report: StatusReport,
    /// Names of failed checks, in execution order
    pub failed: Vec<String>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn error(&self) -> Option<HealthCheckError> {
        if self.failed.is_empty() {
            None
        } else {
            Some(HealthCheckError::Failed {
                failed: self.failed.clone(),
            })
        }
    }
}

pub struct HealthValidator {
    runtime: Arc<dyn ServiceRuntime>,
    services: Vec<ServiceConfig>,
    dependencies: Vec<DependencyConfig>,
    liveness_url: Option<String>,
    groups: Vec<DomainGroup>,
    backoff: LinearBackoff,
    external_probes: bool,
    http: reqwest::Client,
}

impl HealthValidator {
    pub fn new(config: &Config, runtime: Arc<dyn ServiceRuntime>) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(config.timeouts.network())
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            runtime,
            services: config.services.iter().filter(|s| s.required).cloned().collect(),
            dependencies: config.dependencies.clone(),
            liveness_url: config.app.liveness_url.clone(),
            groups: config.groups.clone(),
            backoff: LinearBackoff::new(
                config.health.attempts,
                Duration::from_secs(config.health.backoff_secs),
            ),
            external_probes: config.health.external_probes,
            http,
        })
    }

    /// Verify the deployment serving `plan`
    pub async fn verify(&self, plan: &ModePlan) -> HealthReport {
        let mut checks = Vec::new();
        let mut failed = Vec::new();
        let mut blocked: Option<&'static str> = None;

        // Stage 1: required services
        for service in &self.services {
            let name = format!("health:service:{}", service.name);
            let check = match self.runtime.health(&service.name).await {
                Ok(true) => ReportCheck::ok(&name, "Service is running"),
                Ok(false) => ReportCheck::warning(&name, "Service is not running"),
                Err(e) => ReportCheck::warning(&name, format!("Service health unknown: {}", e)),
            };
            record(&mut checks, &mut failed, &mut blocked, check, "required service down");
        }

        // Stage 2: dependencies
        for dep in &self.dependencies {
            let name = format!("health:dependency:{}", dep.name);
            if let Some(reason) = blocked {
                checks.push(ReportCheck::skipped(name, format!("Skipped: {}", reason)));
                continue;
            }
            let check = match probe_tcp(&dep.address, CONNECT_TIMEOUT).await {
                TcpProbe::Connected => ReportCheck::ok(&name, format!("{} accepts connections", dep.address)),
                TcpProbe::Refused(e) => {
                    ReportCheck::warning(&name, format!("{} refused: {}", dep.address, e))
                }
                TcpProbe::TimedOut => ReportCheck::warning(
                    &name,
                    format!("{} did not accept within {:?}", dep.address, CONNECT_TIMEOUT),
                ),
            };
            record(&mut checks, &mut failed, &mut blocked, check, "dependency not ready");
        }

        // Stage 3: application liveness
        if let Some(ref url) = self.liveness_url {
            let name = "health:liveness";
            if let Some(reason) = blocked {
                checks.push(ReportCheck::skipped(name, format!("Skipped: {}", reason)));
            } else {
                let check = match self.probe(url, |status| status == reqwest::StatusCode::OK).await {
                    Ok(attempts) => ReportCheck::ok(name, "Application is live")
                        .with_details(json!({ "url": url, "attempts": attempts })),
                    Err(reason) => ReportCheck::warning(name, format!("Liveness probe failed: {}", reason))
                        .with_details(json!({ "url": url })),
                };
                record(&mut checks, &mut failed, &mut blocked, check, "application not live");
            }
        }

        // Stage 4: external reachability
        if self.external_probes {
            for group in &self.groups {
                let schemes: &[&str] = if plan.encrypted_groups.contains(&group.name) {
                    &["http", "https"]
                } else {
                    &["http"]
                };
                for domain in &group.domains {
                    for scheme in schemes {
                        let name = format!("health:external:{}:{}", scheme, domain);
                        if let Some(reason) = blocked {
                            checks.push(ReportCheck::skipped(name, format!("Skipped: {}", reason)));
                            continue;
                        }
                        let url = format!("{}://{}/", scheme, domain);
                        let check = match self.probe(&url, |status| status.as_u16() < 500).await {
                            Ok(attempts) => ReportCheck::ok(&name, format!("Reachable over {}", scheme))
                                .with_details(json!({ "url": url, "attempts": attempts })),
                            Err(reason) => ReportCheck::warning(&name, format!("Unreachable over {}: {}", scheme, reason))
                                .with_details(json!({ "url": url })),
                        };
                        if check.status.is_failure() {
                            failed.push(check.check.clone());
                        }
                        checks.push(check);
                    }
                }
            }
        }

        let report = StatusReport::from_checks(checks);
        if failed.is_empty() {
            info!(checks = report.total_checks, "Health verification passed");
        } else {
            warn!(failed = ?failed, "Health verification failed");
        }
        HealthReport { report, failed }
    }

    /// GET `url` until `accept` holds, following the backoff schedule.
    /// Returns the number of attempts used.
    async fn probe(
        &self,
        url: &str,
        accept: impl Fn(reqwest::StatusCode) -> bool,
    ) -> Result<u32, String> {
        let mut attempt = 1;
        loop {
            let reason = match self.http.get(url).send().await {
                Ok(response) if accept(response.status()) => {
                    debug!(url = %url, attempt, status = %response.status(), "Probe succeeded");
                    return Ok(attempt);
                }
                Ok(response) => format!("status {}", response.status()),
                Err(e) => e.to_string(),
            };

            match self.backoff.delay_after(attempt) {
                Some(delay) => {
                    debug!(url = %url, attempt, reason = %reason, delay_ms = delay.as_millis() as u64, "Probe failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                None => return Err(format!("{} after {} attempts", reason, attempt)),
            }
        }
    }
}

/// Push `check`; a failure blocks every later stage
fn record(
    checks: &mut Vec<ReportCheck>,
    failed: &mut Vec<String>,
    blocked: &mut Option<&'static str>,
    check: ReportCheck,
    reason: &'static str,
) {
    if check.status.is_failure() {
        failed.push(check.check.clone());
        blocked.get_or_insert(reason);
    }
    checks.push(check);
}

impl std::fmt::Debug for HealthValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthValidator")
            .field("services", &self.services.len())
            .field("dependencies", &self.dependencies.len())
            .field("liveness_url", &self.liveness_url)
            .field("backoff", &self.backoff)
            .finish()
    }
}
