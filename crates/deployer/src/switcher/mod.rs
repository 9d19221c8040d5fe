//! Atomic serving-layer and application reconfiguration.
//!
//! Applying a plan happens in three phases:
//!
//! 1. **stage** renders the variant into a hidden sibling of the live file
//!    and asks the serving layer to validate it. A rejected candidate is
//!    deleted and the live file is never touched.
//! 2. **commit** keeps `<live>.prev`, renames the candidate over the live
//!    file, rewrites the application's security flags, triggers a graceful
//!    reload and only then restarts the application if the flags changed.
//! 3. If any step after the rename fails, the previous live file and
//!    environment file are restored. A serving layer that already reloaded
//!    is reloaded again and an application whose restart was attempted is
//!    restarted again, so both end up on the previous configuration.
//!
//! The last applied plan is persisted so renewal can reload without
//! recomputing the mode.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use certshift_common::DomainGroup;
use certshift_config::{AppConfig, Config, ServingConfig};

use crate::error::ConfigApplyError;
use crate::fsutil;
use crate::lock::{DeployLock, LockGuard};
use crate::mode::ModePlan;
use crate::runtime::ServiceRuntime;
use crate::store::ScanResult;

mod env;
mod render;
mod serving;

pub use env::{apply_flags, read_flags, SecurityFlags};
pub use render::{render, RenderContext, ServingVariant, TemplateSet};
pub use serving::{CommandServingLayer, ServingLayer, PATH_PLACEHOLDER};

/// File in the state directory holding the last applied plan
pub const APPLIED_STATE_FILE: &str = "applied.json";

/// Persisted record of the last successful apply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedState {
    pub plan: ModePlan,
    pub flags: SecurityFlags,
    pub applied_at: DateTime<Utc>,
}

/// Outcome of an apply
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppliedConfig {
    pub plan: ModePlan,
    pub variant: &'static str,
    pub live_config: PathBuf,
    pub flags: SecurityFlags,
    pub flags_changed: bool,
    pub restarted: Option<String>,
    pub reloaded: bool,
    pub dry_run: bool,
}

/// Post-swap steps completed so far
#[derive(Debug, Default)]
struct CommitProgress {
    flags_changed: bool,
    reloaded: bool,
    restart_attempted: Option<String>,
    restarted: Option<String>,
}

/// A validated candidate that has not replaced the live file yet.
///
/// Dropping it without [`ConfigSwitcher::commit`] deletes the candidate.
#[derive(Debug)]
pub struct StagedConfig {
    path: PathBuf,
    rendered: String,
    plan: ModePlan,
    variant: ServingVariant,
    flags: SecurityFlags,
    committed: bool,
}

impl StagedConfig {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rendered(&self) -> &str {
        &self.rendered
    }

    pub fn variant(&self) -> ServingVariant {
        self.variant
    }

    /// Delete the candidate
    pub fn discard(self) {}
}

impl Drop for StagedConfig {
    fn drop(&mut self) {
        if !self.committed {
            match fs::remove_file(&self.path) {
                Ok(()) => debug!(path = %self.path.display(), "Discarded staged configuration"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to discard staged configuration"),
            }
        }
    }
}

/// Applies deployment plans to the serving layer and the application
pub struct ConfigSwitcher {
    serving: Arc<dyn ServingLayer>,
    runtime: Arc<dyn ServiceRuntime>,
    serving_config: ServingConfig,
    app: AppConfig,
    groups: Vec<DomainGroup>,
    cert_root: PathBuf,
    webroot: PathBuf,
    state_dir: PathBuf,
    lock: DeployLock,
}

impl ConfigSwitcher {
    pub fn new(
        config: &Config,
        serving: Arc<dyn ServingLayer>,
        runtime: Arc<dyn ServiceRuntime>,
    ) -> Self {
        Self {
            serving,
            runtime,
            serving_config: config.serving.clone(),
            app: config.app.clone(),
            groups: config.groups.clone(),
            cert_root: config.paths.cert_root.clone(),
            webroot: config.paths.webroot.clone(),
            state_dir: config.paths.state_dir.clone(),
            lock: DeployLock::new(&config.paths.state_dir, config.timeouts.lock()),
        }
    }

    pub fn live_config(&self) -> &Path {
        &self.serving_config.live_config
    }

    fn state_path(&self) -> PathBuf {
        self.state_dir.join(APPLIED_STATE_FILE)
    }

    /// Apply `plan`, taking the deployment lock for the duration
    pub async fn apply(
        &self,
        plan: &ModePlan,
        statuses: &ScanResult,
        dry_run: bool,
    ) -> Result<AppliedConfig, ConfigApplyError> {
        let guard = self.lock.acquire().await?;
        self.apply_locked(&guard, plan, statuses, dry_run).await
    }

    /// Apply `plan` under an already held lock
    pub async fn apply_locked(
        &self,
        lock: &LockGuard,
        plan: &ModePlan,
        statuses: &ScanResult,
        dry_run: bool,
    ) -> Result<AppliedConfig, ConfigApplyError> {
        for group in &plan.encrypted_groups {
            if !statuses.get(group).is_some_and(|s| s.is_valid()) {
                return Err(ConfigApplyError::MissingBundle(group.clone()));
            }
        }

        if !dry_run {
            self.remove_stale_candidates();
        }

        let staged = self.stage(plan, ServingVariant::for_plan(plan)).await?;

        if dry_run {
            info!(
                mode = %plan.mode,
                variant = staged.variant().as_str(),
                "Dry run: candidate configuration validated, not applied"
            );
            let applied = AppliedConfig {
                plan: plan.clone(),
                variant: staged.variant().as_str(),
                live_config: self.live_config().to_path_buf(),
                flags: staged.flags,
                flags_changed: false,
                restarted: None,
                reloaded: false,
                dry_run: true,
            };
            staged.discard();
            return Ok(applied);
        }

        let applied = self.commit(lock, staged).await?;
        self.persist(&applied)?;
        Ok(applied)
    }

    /// Serve only challenge paths while certificates are acquired.
    ///
    /// The application flags and the persisted plan are left alone.
    pub async fn apply_challenge_only_locked(
        &self,
        lock: &LockGuard,
    ) -> Result<AppliedConfig, ConfigApplyError> {
        let plan = ModePlan {
            mode: certshift_common::DeploymentMode::HttpOnly,
            encrypted_groups: Vec::new(),
            plaintext_groups: self.groups.iter().map(|g| g.name.clone()).collect(),
            reason: "serving challenge paths during acquisition".to_string(),
        };
        self.remove_stale_candidates();
        let staged = self.stage(&plan, ServingVariant::ChallengeOnly).await?;
        self.commit(lock, staged).await
    }

    /// Re-apply the persisted plan so the serving layer picks up new key material
    pub async fn reapply_locked(
        &self,
        lock: &LockGuard,
        statuses: &ScanResult,
    ) -> Result<AppliedConfig, ConfigApplyError> {
        let state = self.load_applied()?.ok_or(ConfigApplyError::NothingApplied)?;
        debug!(mode = %state.plan.mode, "Re-applying persisted plan");
        self.apply_locked(lock, &state.plan, statuses, false).await
    }

    /// The last successfully applied plan, if any
    pub fn load_applied(&self) -> Result<Option<AppliedState>, ConfigApplyError> {
        match fs::read_to_string(self.state_path()) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn persist(&self, applied: &AppliedConfig) -> Result<(), ConfigApplyError> {
        let state = AppliedState {
            plan: applied.plan.clone(),
            flags: applied.flags,
            applied_at: Utc::now(),
        };
        let json = serde_json::to_vec_pretty(&state)?;
        fsutil::write_atomic(&self.state_path(), &json, None)?;
        Ok(())
    }

    /// Render and validate a candidate without touching the live file
    pub async fn stage(
        &self,
        plan: &ModePlan,
        variant: ServingVariant,
    ) -> Result<StagedConfig, ConfigApplyError> {
        let templates = TemplateSet::load(&self.serving_config)?;
        let ctx = RenderContext {
            cert_root: &self.cert_root,
            webroot: &self.webroot,
            hsts_seconds: self.app.hsts_seconds,
        };
        let rendered = render(&templates, variant, plan, &self.groups, &ctx)?;

        let path = fsutil::write_staged(self.live_config(), rendered.as_bytes(), Some(0o644))?;
        let staged = StagedConfig {
            path,
            rendered,
            plan: plan.clone(),
            variant,
            flags: SecurityFlags::for_plan(plan, self.app.hsts_seconds),
            committed: false,
        };

        if let Err(e) = self.serving.validate(staged.path()).await {
            warn!(
                variant = variant.as_str(),
                error = %e,
                "Candidate configuration rejected, live configuration untouched"
            );
            return Err(e);
        }

        debug!(variant = variant.as_str(), path = %staged.path().display(), "Staged configuration");
        Ok(staged)
    }

    /// Swap a staged candidate into place, update the application and reload
    pub async fn commit(
        &self,
        _lock: &LockGuard,
        mut staged: StagedConfig,
    ) -> Result<AppliedConfig, ConfigApplyError> {
        let live = self.live_config().to_path_buf();
        let env_path = self.app.env_file.clone();
        let manage_flags = staged.variant != ServingVariant::ChallengeOnly;

        let had_live = fsutil::keep_previous(&live)?;
        let old_env = match fs::read_to_string(&env_path) {
            Ok(content) => Some(content),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        fs::rename(&staged.path, &live)?;
        staged.committed = true;
        info!(
            live = %live.display(),
            variant = staged.variant.as_str(),
            mode = %staged.plan.mode,
            "Activated serving configuration"
        );

        let mut progress = CommitProgress::default();
        match self
            .finish_commit(&staged, old_env.as_deref(), manage_flags, &mut progress)
            .await
        {
            Ok(()) => Ok(AppliedConfig {
                plan: staged.plan.clone(),
                variant: staged.variant.as_str(),
                live_config: live,
                flags: staged.flags,
                flags_changed: progress.flags_changed,
                restarted: progress.restarted,
                reloaded: true,
                dry_run: false,
            }),
            Err(cause) => {
                error!(error = %cause, "Post-swap step failed, restoring previous configuration");
                self.restore(&live, had_live, &env_path, old_env.as_deref());
                self.resync(&progress).await;
                Err(ConfigApplyError::RolledBack {
                    cause: Box::new(cause),
                })
            }
        }
    }

    async fn finish_commit(
        &self,
        staged: &StagedConfig,
        old_env: Option<&str>,
        manage_flags: bool,
        progress: &mut CommitProgress,
    ) -> Result<(), ConfigApplyError> {
        if manage_flags {
            let previous = old_env.and_then(|content| read_flags(content, &self.app));
            progress.flags_changed = previous != Some(staged.flags);

            if progress.flags_changed {
                let content = apply_flags(old_env.unwrap_or_default(), &staged.flags, &self.app);
                fsutil::write_atomic(&self.app.env_file, content.as_bytes(), Some(0o640))?;
                info!(
                    secure_cookies = staged.flags.secure_cookies,
                    hsts_seconds = staged.flags.hsts_seconds,
                    ssl_redirect = staged.flags.ssl_redirect,
                    "Updated application security flags"
                );
            }
        }

        self.serving.reload().await?;
        progress.reloaded = true;

        // The application reads its flags on start; restart only once the
        // serving layer runs the matching configuration
        if progress.flags_changed {
            if let Some(ref service) = self.app.restart_service {
                progress.restart_attempted = Some(service.clone());
                self.runtime.restart(service).await?;
                progress.restarted = Some(service.clone());
            }
        }
        Ok(())
    }

    fn restore(&self, live: &Path, had_live: bool, env_path: &Path, old_env: Option<&str>) {
        let prev = fsutil::prev_path(live);
        let restored = if had_live {
            fs::read(&prev).and_then(|content| fsutil::write_atomic(live, &content, Some(0o644)))
        } else {
            fs::remove_file(live)
        };
        if let Err(e) = restored {
            error!(live = %live.display(), error = %e, "Failed to restore previous serving configuration");
        }

        let env_restored = match old_env {
            Some(content) => fsutil::write_atomic(env_path, content.as_bytes(), Some(0o640)),
            None => match fs::remove_file(env_path) {
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                other => other,
            },
        };
        if let Err(e) = env_restored {
            error!(env = %env_path.display(), error = %e, "Failed to restore application environment");
        }
    }

    /// Bring running processes back onto the restored files
    async fn resync(&self, progress: &CommitProgress) {
        if progress.reloaded {
            match self.serving.reload().await {
                Ok(()) => info!("Serving layer reloaded with the previous configuration"),
                Err(e) => error!(error = %e, "Failed to reload the previous serving configuration"),
            }
        }
        if let Some(ref service) = progress.restart_attempted {
            match self.runtime.restart(service).await {
                Ok(()) => info!(service = %service, "Application restarted with the previous flags"),
                Err(e) => error!(service = %service, error = %e, "Failed to restart application with the previous flags"),
            }
        }
    }

    /// Remove candidates left behind by an interrupted run
    fn remove_stale_candidates(&self) {
        let live = self.live_config();
        let (Some(dir), Some(name)) = (live.parent(), live.file_name()) else {
            return;
        };
        let prefix = format!(".{}.tmp-", name.to_string_lossy());
        let Ok(entries) = fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            if entry.file_name().to_string_lossy().starts_with(&prefix) {
                match fs::remove_file(entry.path()) {
                    Ok(()) => debug!(path = %entry.path().display(), "Removed stale candidate"),
                    Err(e) => warn!(path = %entry.path().display(), error = %e, "Failed to remove stale candidate"),
                }
            }
        }
    }
}
