//! Deployment orchestration.
//!
//! A deployment run is a single forward pass through
//!
//! ```text
//! Scanning -> Deciding -> [Acquiring] -> Applying -> Validating -> Done
//!                  \              \            \
//!                   Aborted        Aborted      RolledBack
//! ```
//!
//! `Aborted` ends a run before the planned configuration was applied. On a
//! host with nothing applied yet, acquisition may have left the challenge-only
//! configuration live. `RolledBack` ends a run whose apply failed; the
//! previous live configuration is in place. Every transition is recorded in
//! the report.
//!
//! The other entry points (`obtain`, `renew`, `monitor`, `health`, `status`,
//! `check-config`) share the same components and produce the same report
//! type.

use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, info, info_span, warn, Instrument};

use certshift_common::{DomainGroup, ReportCheck, RunId, StatusReport};
use certshift_config::validate::{validate_all, ValidateOptions};
use certshift_config::Config;

use crate::acme::{AcmeAuthority, AcquisitionEngine, CertificateAuthority, RenewalScheduler};
use crate::error::DeployError;
use crate::expiry::ExpiryMonitor;
use crate::health::HealthValidator;
use crate::lock::{DeployLock, LockGuard};
use crate::mode::{decide, ForceFlag, ModePlan};
use crate::runtime::{CommandRuntime, ServiceRuntime};
use crate::schedule::read_heartbeats;
use crate::signals::InterruptFlag;
use crate::store::{BundleStatus, CertificateStore, ScanResult};
use crate::switcher::{AppliedConfig, CommandServingLayer, ConfigSwitcher, ServingLayer};

/// Position of a deployment run
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Scanning,
    Deciding,
    Acquiring,
    Applying,
    Validating,
    Done,
    RolledBack,
    Aborted,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::RolledBack | Self::Aborted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scanning => "scanning",
            Self::Deciding => "deciding",
            Self::Acquiring => "acquiring",
            Self::Applying => "applying",
            Self::Validating => "validating",
            Self::Done => "done",
            Self::RolledBack => "rolled_back",
            Self::Aborted => "aborted",
        }
    }

    fn allows(&self, next: RunState) -> bool {
        match next {
            Self::Aborted => *self < Self::Applying,
            Self::RolledBack => *self == Self::Applying,
            _ => !self.is_terminal() && next > *self,
        }
    }
}

/// Operator choices for one deployment run
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub force: ForceFlag,
    pub dry_run: bool,
    /// Acquire certificates for groups without a valid bundle
    pub acquire: bool,
}

/// Record of one deployment run
#[derive(Debug, Clone)]
pub struct DeployRun {
    pub run_id: RunId,
    /// Every state entered, in order
    pub states: Vec<RunState>,
    pub plan: Option<ModePlan>,
    pub applied: Option<AppliedConfig>,
    pub report: StatusReport,
}

impl DeployRun {
    fn new() -> Self {
        Self {
            run_id: RunId::new(),
            states: vec![RunState::Scanning],
            plan: None,
            applied: None,
            report: StatusReport::default(),
        }
    }

    pub fn state(&self) -> RunState {
        self.states.last().copied().unwrap_or(RunState::Scanning)
    }

    fn enter(&mut self, next: RunState) {
        let current = self.state();
        if !current.allows(next) {
            error!(from = current.as_str(), to = next.as_str(), "Illegal run transition ignored");
            return;
        }
        debug!(from = current.as_str(), to = next.as_str(), "Run state transition");
        self.states.push(next);
    }

    fn abort(&mut self, error: &DeployError) {
        self.report.push(error_check(error));
        self.enter(RunState::Aborted);
    }

    /// Append the `run` summary check
    fn finish(mut self) -> Self {
        let states: Vec<&str> = self.states.iter().map(|s| s.as_str()).collect();
        let message = format!("Deployment ended in state {}", self.state().as_str());
        let check = ReportCheck::ok("run", message).with_details(json!({
            "run_id": self.run_id.as_str(),
            "states": states,
            "mode": self.plan.as_ref().map(|p| p.mode.as_str()),
        }));
        self.report.push(check);
        self
    }
}

fn error_check(error: &DeployError) -> ReportCheck {
    ReportCheck::new(error.kind(), error.severity().into(), error.to_string())
}

/// The components an orchestrator drives
pub struct Components {
    pub store: Arc<CertificateStore>,
    pub engine: Arc<AcquisitionEngine>,
    pub switcher: Arc<ConfigSwitcher>,
    pub health: Arc<HealthValidator>,
    pub monitor: Arc<ExpiryMonitor>,
    pub renewal: Arc<RenewalScheduler>,
}

impl Components {
    /// Wire components around the given authority, serving layer and runtime
    pub fn assemble(
        config: &Config,
        authority: Arc<dyn CertificateAuthority>,
        serving: Arc<dyn ServingLayer>,
        runtime: Arc<dyn ServiceRuntime>,
    ) -> anyhow::Result<Self> {
        let store = Arc::new(CertificateStore::new(&config.paths.cert_root));
        let engine = Arc::new(AcquisitionEngine::new(config, store.clone(), authority)?);
        let switcher = Arc::new(ConfigSwitcher::new(config, serving, runtime.clone()));
        let health = Arc::new(HealthValidator::new(config, runtime)?);
        let monitor = Arc::new(ExpiryMonitor::from_config(config, store.clone())?);
        let renewal = Arc::new(RenewalScheduler::new(
            config,
            engine.clone(),
            store.clone(),
            switcher.clone(),
        ));

        Ok(Self {
            store,
            engine,
            switcher,
            health,
            monitor,
            renewal,
        })
    }

    /// Production wiring: ACME, command-driven serving layer and services
    pub fn from_config(config: &Config, staging: bool) -> anyhow::Result<Self> {
        let network = config.timeouts.network();
        let authority = Arc::new(AcmeAuthority::new(
            &config.acme,
            &config.paths.state_dir,
            staging,
            network,
        ));
        let serving = Arc::new(CommandServingLayer::new(
            config.serving.validate_command.clone(),
            config.serving.reload_command.clone(),
            config.timeouts.acquisition(),
        ));
        let runtime = Arc::new(CommandRuntime::new(
            &config.services,
            config.timeouts.acquisition(),
        ));
        Self::assemble(config, authority, serving, runtime)
    }
}

/// Runs deployments and the single-purpose subcommands
pub struct Orchestrator {
    config: Config,
    components: Components,
    lock: DeployLock,
    interrupt: InterruptFlag,
}

impl Orchestrator {
    pub fn new(config: Config, components: Components, interrupt: InterruptFlag) -> Self {
        let lock = DeployLock::new(&config.paths.state_dir, config.timeouts.lock());
        Self {
            config,
            components,
            lock,
            interrupt,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn components(&self) -> &Components {
        &self.components
    }

    fn check_interrupt(&self) -> Result<(), DeployError> {
        if self.interrupt.is_set() {
            Err(DeployError::Interrupted)
        } else {
            Ok(())
        }
    }

    /// One deployment pass
    pub async fn deploy(&self, options: RunOptions) -> DeployRun {
        let mut run = DeployRun::new();
        let span = info_span!("deploy", run_id = %run.run_id.short());
        async {
            self.deploy_inner(&mut run, options).await;
            info!(
                state = run.state().as_str(),
                mode = run.plan.as_ref().map(|p| p.mode.as_str()).unwrap_or("none"),
                "Deployment finished"
            );
        }
        .instrument(span)
        .await;
        run.finish()
    }

    async fn deploy_inner(&self, run: &mut DeployRun, options: RunOptions) {
        let groups = &self.config.groups;
        let store = &self.components.store;

        // Scanning
        let guard = match self.lock.acquire().await {
            Ok(guard) => guard,
            Err(e) => return run.abort(&DeployError::from(e)),
        };
        if !options.dry_run {
            match store.recover_interrupted(&guard) {
                Ok(recovered) if !recovered.is_empty() => run.report.push(
                    ReportCheck::ok("recovery", "Repaired interrupted bundle installs")
                        .with_details(json!({ "groups": recovered })),
                ),
                Ok(_) => {}
                Err(e) => return run.abort(&DeployError::from(e)),
            }
        }
        let mut statuses = store.scan(groups);
        run.report.extend(certificate_report(groups, &statuses));

        // Deciding
        run.enter(RunState::Deciding);
        let acquire = (options.acquire || self.config.acquire_missing)
            && !options.dry_run
            && options.force != ForceFlag::Http;
        let policy = self.config.partial_policy;

        // A forced encryption without valid bundles fails here, before
        // acquisition could touch the live configuration
        let mut plan = match decide(options.force, groups, &statuses, policy) {
            Ok(plan) => plan,
            Err(e) => return run.abort(&DeployError::from(e)),
        };
        if let Err(e) = self.check_interrupt() {
            return run.abort(&e);
        }

        // Acquiring
        let targets: Vec<DomainGroup> = groups
            .iter()
            .filter(|g| !statuses.get(&g.name).is_some_and(|s| s.is_valid()))
            .cloned()
            .collect();
        if acquire && !targets.is_empty() {
            run.enter(RunState::Acquiring);
            self.acquire_locked(&guard, &targets, &mut run.report).await;

            statuses = store.scan(groups);
            plan = match decide(options.force, groups, &statuses, policy) {
                Ok(plan) => plan,
                Err(e) => return run.abort(&DeployError::from(e)),
            };
            if let Err(e) = self.check_interrupt() {
                return run.abort(&e);
            }
        }

        info!(mode = %plan.mode, encrypted = ?plan.encrypted_groups, reason = %plan.reason, "Selected deployment mode");
        run.report.push(
            ReportCheck::ok("mode", format!("{}: {}", plan.mode, plan.reason)).with_details(json!({
                "mode": plan.mode.as_str(),
                "encrypted_groups": plan.encrypted_groups,
                "plaintext_groups": plan.plaintext_groups,
            })),
        );
        run.plan = Some(plan.clone());

        // Applying
        run.enter(RunState::Applying);
        match self
            .components
            .switcher
            .apply_locked(&guard, &plan, &statuses, options.dry_run)
            .await
        {
            Ok(applied) => {
                let message = if applied.dry_run {
                    format!("Dry run: {} configuration validated, not applied", applied.variant)
                } else {
                    format!("Applied {} configuration", applied.variant)
                };
                run.report.push(ReportCheck::ok("apply", message).with_details(json!(applied)));
                run.applied = Some(applied);
            }
            Err(e) => {
                let e = DeployError::from(e);
                error!(error = %e, "Apply failed, previous configuration in place");
                run.report.push(error_check(&e));
                run.enter(RunState::RolledBack);
                return;
            }
        }
        drop(guard);

        if options.dry_run {
            run.enter(RunState::Done);
            return;
        }

        // Validating
        if self.interrupt.is_set() {
            run.report.push(ReportCheck::warning(
                "signal",
                "Interrupted after apply, health verification skipped",
            ));
            run.enter(RunState::Done);
            return;
        }
        run.enter(RunState::Validating);
        let health = self.components.health.verify(&plan).await;
        if let Some(e) = health.error() {
            warn!(error = %e, "Deployment applied but health verification failed");
        }
        run.report.extend(health.report);
        run.enter(RunState::Done);
    }

    /// Obtain certificates for groups lacking a valid bundle, serving the
    /// challenge-only configuration first on a host with nothing applied.
    async fn acquire_locked(&self, guard: &LockGuard, targets: &[DomainGroup], report: &mut StatusReport) {
        let switcher = &self.components.switcher;
        let fresh_host = matches!(switcher.load_applied(), Ok(None));
        if fresh_host {
            match switcher.apply_challenge_only_locked(guard).await {
                Ok(_) => info!("Serving challenge-only configuration during acquisition"),
                Err(e) => {
                    warn!(error = %e, "Challenge-only configuration not applied");
                    report.push(ReportCheck::warning(
                        "apply:challenge-only",
                        format!("Challenge-only configuration not applied: {}", e),
                    ));
                }
            }
        }

        for (group, result) in self.components.engine.obtain_all_locked(guard, targets).await {
            let name = format!("acquire:{}", group);
            report.push(match result {
                Ok(bundle) => ReportCheck::ok(name, "Certificate acquired").with_details(json!({
                    "not_after": bundle.not_after,
                    "fingerprint": bundle.fingerprint,
                })),
                Err(e) => ReportCheck::warning(name, e.to_string()),
            });
        }
    }

    /// Acquire certificates for `groups` and make them live.
    ///
    /// A dry run only checks that every domain serves the challenge webroot.
    pub async fn obtain(&self, groups: &[DomainGroup], dry_run: bool) -> StatusReport {
        let mut report = StatusReport::default();
        let guard = match self.lock.acquire().await {
            Ok(guard) => guard,
            Err(e) => {
                report.push(error_check(&DeployError::from(e)));
                return report;
            }
        };

        if dry_run {
            for group in groups {
                let name = format!("acquire:{}", group.name);
                report.push(match self.components.engine.check_reachability(group).await {
                    Ok(()) => ReportCheck::ok(name, "Dry run: reachable, certificate not requested"),
                    Err(e) => ReportCheck::warning(name, e.to_string()),
                });
            }
            return report;
        }

        let switcher = &self.components.switcher;
        let prior = match switcher.load_applied() {
            Ok(prior) => prior,
            Err(e) => {
                report.push(error_check(&DeployError::from(e)));
                return report;
            }
        };
        self.acquire_locked(&guard, groups, &mut report).await;

        let statuses = self.components.store.scan(&self.config.groups);
        let applied = match prior {
            Some(_) => switcher.reapply_locked(&guard, &statuses).await,
            None => {
                // Leave the fresh host serving whatever is now possible
                match decide(ForceFlag::None, &self.config.groups, &statuses, self.config.partial_policy) {
                    Ok(plan) => switcher.apply_locked(&guard, &plan, &statuses, false).await,
                    Err(e) => {
                        report.push(error_check(&DeployError::from(e)));
                        return report;
                    }
                }
            }
        };
        match applied {
            Ok(applied) => report.push(
                ReportCheck::ok("apply", format!("Applied {} configuration", applied.variant))
                    .with_details(json!(applied)),
            ),
            Err(e) => report.push(error_check(&DeployError::from(e))),
        }
        report
    }

    /// One renewal pass
    pub async fn renew(&self, dry_run: bool) -> StatusReport {
        let mut report = StatusReport::default();
        match self.components.renewal.run_pass(dry_run).await {
            Ok(outcome) => {
                let check = match outcome.partial_error() {
                    Some(e) => error_check(&DeployError::from(e)),
                    None => ReportCheck::ok("renewal", outcome.summary()),
                };
                report.push(check.with_details(json!(outcome)));
            }
            Err(e) => report.push(error_check(&DeployError::from(e))),
        }
        report
    }

    /// One expiry check with alert dispatch
    pub async fn monitor(&self) -> StatusReport {
        self.components.monitor.run().await.report
    }

    /// Verify the deployment serving the last applied plan
    pub async fn health(&self) -> StatusReport {
        let plan = match self.components.switcher.load_applied() {
            Ok(Some(state)) => state.plan,
            Ok(None) => {
                debug!("No applied plan, verifying as plaintext");
                let statuses = ScanResult::new();
                match decide(ForceFlag::Http, &self.config.groups, &statuses, self.config.partial_policy) {
                    Ok(plan) => plan,
                    Err(e) => return StatusReport::from_checks(vec![error_check(&DeployError::from(e))]),
                }
            }
            Err(e) => return StatusReport::from_checks(vec![error_check(&DeployError::from(e))]),
        };
        self.components.health.verify(&plan).await.report
    }

    /// Read-only overview: bundles, expiry, applied plan and task heartbeats
    pub fn status(&self) -> StatusReport {
        let now = chrono::Utc::now();
        let statuses = self.components.store.scan_at(&self.config.groups, now);
        let mut report = self.components.monitor.report(&statuses, now);

        match self.components.switcher.load_applied() {
            Ok(Some(state)) => report.push(
                ReportCheck::ok("applied", format!("{} since {}", state.plan.mode, state.applied_at))
                    .with_details(json!(state)),
            ),
            Ok(None) => report.push(ReportCheck::ok("applied", "No configuration applied yet")),
            Err(e) => report.push(error_check(&DeployError::from(e))),
        }

        match read_heartbeats(&self.config.paths.state_dir) {
            Ok(beats) => {
                for beat in beats {
                    let name = format!("heartbeat:{}", beat.task);
                    let overdue = beat.next_run + chrono::Duration::hours(1) < now;
                    let message = format!("Last run {}: {}", beat.last_run, beat.message);
                    let check = if !beat.succeeded || overdue {
                        ReportCheck::warning(name, message)
                    } else {
                        ReportCheck::ok(name, message)
                    };
                    report.push(check.with_details(json!(beat)));
                }
            }
            Err(e) => report.push(ReportCheck::warning("heartbeat", format!("Heartbeats unreadable: {}", e))),
        }
        report
    }

    /// Structural, template, certificate and lint validation
    pub async fn check_config(&self, network: bool) -> StatusReport {
        let result = validate_all(&self.config, ValidateOptions { network }).await;
        let mut checks: Vec<ReportCheck> = result
            .errors
            .iter()
            .map(|e| ReportCheck::critical(format!("config:{}", e.category), e.message.clone()))
            .collect();
        checks.extend(
            result
                .warnings
                .iter()
                .map(|w| ReportCheck::warning("config:lint", w.message.clone())),
        );
        if checks.is_empty() {
            checks.push(ReportCheck::ok("config", "Configuration is valid"));
        }
        StatusReport::from_checks(checks)
    }
}

/// One `certificate:<group>` check per group
fn certificate_report(groups: &[DomainGroup], statuses: &ScanResult) -> StatusReport {
    let checks = groups
        .iter()
        .map(|group| {
            let name = format!("certificate:{}", group.name);
            match statuses.get(&group.name) {
                Some(BundleStatus::Valid { days_remaining, .. }) => {
                    ReportCheck::ok(name, format!("Valid, {} days remaining", days_remaining))
                }
                Some(BundleStatus::Expired { bundle }) => {
                    ReportCheck::warning(name, format!("Expired at {}", bundle.not_after))
                }
                Some(BundleStatus::Invalid { reason }) => ReportCheck::warning(name, reason.to_string()),
                Some(BundleStatus::Missing { .. }) | None => {
                    ReportCheck::ok(name, "No certificate installed")
                }
            }
        })
        .collect();
    StatusReport::from_checks(checks)
}
