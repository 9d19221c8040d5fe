//! Recurring task execution for daemon mode.
//!
//! Tasks run sequentially on their own cadence and share the deployment
//! lock through the components they drive. After every run a heartbeat is
//! written to `<state-dir>/heartbeat/<task>.json` so `status` and external
//! monitoring can tell when each task last completed.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::DeployError;
use crate::fsutil;
use crate::signals::SignalType;

/// Directory below the state dir holding heartbeats
pub const HEARTBEAT_DIR: &str = "heartbeat";

/// Work repeated on a fixed cadence
#[async_trait]
pub trait RecurringTask: Send + Sync {
    fn name(&self) -> &'static str;

    fn interval(&self) -> Duration;

    /// One idempotent pass. Returns a one-line summary.
    async fn run_once(&self) -> Result<String, DeployError>;
}

/// Last completion of a recurring task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub task: String,
    pub last_run: DateTime<Utc>,
    pub succeeded: bool,
    pub message: String,
    pub next_run: DateTime<Utc>,
}

/// Read every heartbeat in `state_dir`, sorted by task name
pub fn read_heartbeats(state_dir: &Path) -> io::Result<Vec<Heartbeat>> {
    let dir = state_dir.join(HEARTBEAT_DIR);
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut beats = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        match fs::read_to_string(&path).map(|c| serde_json::from_str::<Heartbeat>(&c)) {
            Ok(Ok(beat)) => beats.push(beat),
            Ok(Err(e)) => warn!(path = %path.display(), error = %e, "Ignoring corrupt heartbeat"),
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to read heartbeat"),
        }
    }
    beats.sort_by(|a, b| a.task.cmp(&b.task));
    Ok(beats)
}

/// Runs recurring tasks until shutdown
#[derive(Debug, Clone)]
pub struct TaskRunner {
    heartbeat_dir: PathBuf,
}

impl TaskRunner {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            heartbeat_dir: state_dir.join(HEARTBEAT_DIR),
        }
    }

    /// Run one task now and record its heartbeat
    pub async fn run_task(&self, task: &dyn RecurringTask) -> Result<String, DeployError> {
        let name = task.name();
        debug!(task = name, "Running scheduled task");

        let result = task.run_once().await;
        let (succeeded, message) = match &result {
            Ok(summary) => {
                info!(task = name, summary = %summary, "Scheduled task finished");
                (true, summary.clone())
            }
            Err(e) => {
                error!(task = name, error = %e, "Scheduled task failed");
                (false, e.to_string())
            }
        };

        let now = Utc::now();
        let next = chrono::Duration::from_std(task.interval()).unwrap_or(chrono::Duration::zero());
        let beat = Heartbeat {
            task: name.to_string(),
            last_run: now,
            succeeded,
            message,
            next_run: now + next,
        };
        if let Err(e) = self.write_heartbeat(&beat) {
            warn!(task = name, error = %e, "Failed to write heartbeat");
        }

        result
    }

    fn write_heartbeat(&self, beat: &Heartbeat) -> io::Result<()> {
        let json = serde_json::to_vec_pretty(beat).map_err(io::Error::other)?;
        fsutil::write_atomic(
            &self.heartbeat_dir.join(format!("{}.json", beat.task)),
            &json,
            None,
        )
    }

    /// Run `tasks` on their cadence until a shutdown signal arrives.
    ///
    /// Every task runs once at start. SIGHUP makes all tasks due immediately.
    pub async fn run(
        &self,
        tasks: &[Arc<dyn RecurringTask>],
        mut signals: broadcast::Receiver<SignalType>,
    ) {
        for task in tasks {
            info!(
                task = task.name(),
                interval_hours = task.interval().as_secs() / 3600,
                "Scheduling recurring task"
            );
        }

        let mut due: Vec<Instant> = tasks.iter().map(|_| Instant::now()).collect();

        loop {
            for (task, next) in tasks.iter().zip(due.iter_mut()) {
                if Instant::now() >= *next {
                    // Failures are recorded in the heartbeat; the loop keeps going
                    let _ = self.run_task(task.as_ref()).await;
                    *next = Instant::now() + task.interval();
                }
            }

            let Some(wake) = due.iter().min().copied() else {
                return;
            };

            tokio::select! {
                _ = tokio::time::sleep_until(wake) => {}
                signal = signals.recv() => match signal {
                    Ok(SignalType::Shutdown) | Err(RecvError::Closed) => {
                        info!("Stopping recurring tasks");
                        return;
                    }
                    Ok(SignalType::RunNow) => {
                        info!("Running all recurring tasks now");
                        let now = Instant::now();
                        due.iter_mut().for_each(|d| *d = now);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Signal receiver lagged");
                    }
                },
            }
        }
    }
}
