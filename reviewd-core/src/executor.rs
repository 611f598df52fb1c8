//! Review-generator subprocess orchestration.
//!
//! Runs the external generator for one PR at a time per repository batch,
//! tracks live tasks in a flat identity → pid table, and enforces liveness
//! with a watchdog. Cancellation is process-level termination; the waiting
//! task observes the exit and records the outcome through the store, so the
//! identity leaves the live table only after the store write.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::pr::{PrId, TrackedPr};
use crate::store::Store;

/// Tasks older than this are logged by the watchdog.
const SOFT_THRESHOLD: Duration = Duration::from_secs(2 * 60);
/// Tasks older than this are killed by the watchdog.
const HARD_THRESHOLD: Duration = Duration::from_secs(5 * 60);
/// Watchdog scan period.
const WATCHDOG_TICK: Duration = Duration::from_secs(30);
/// Generation tasks are submitted in repository sub-batches of at most this
/// many, executed sequentially to keep system load bounded.
pub const BATCH_SIZE: usize = 5;

/// A currently executing generator subprocess.
#[derive(Debug, Clone)]
struct LiveTask {
    pid: u32,
    started_at: Instant,
}

/// Outcome of one generator run, for callers and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Exit 0, artifact present, store accepted the completion.
    Completed,
    /// Non-zero exit or missing artifact; row marked error.
    Failed,
    /// The artifact was produced for a head sha the store no longer holds;
    /// it was deleted and the row left alone.
    StaleDiscarded,
    /// The reconciler invalidated the row mid-flight; nothing recorded.
    Invalidated,
    /// A task for this identity is already live.
    AlreadyRunning,
    /// Shutdown arrived while the generator was running.
    Canceled,
}

pub struct ReviewExecutor {
    generator: PathBuf,
    reviews_dir: PathBuf,
    soft_threshold: Duration,
    hard_threshold: Duration,
    live: Mutex<HashMap<PrId, LiveTask>>,
}

impl ReviewExecutor {
    pub fn new(generator: impl Into<PathBuf>, reviews_dir: impl Into<PathBuf>) -> Self {
        Self {
            generator: generator.into(),
            reviews_dir: reviews_dir.into(),
            soft_threshold: SOFT_THRESHOLD,
            hard_threshold: HARD_THRESHOLD,
            live: Mutex::new(HashMap::new()),
        }
    }

    #[cfg(test)]
    fn with_thresholds(mut self, soft: Duration, hard: Duration) -> Self {
        self.soft_threshold = soft;
        self.hard_threshold = hard;
        self
    }

    /// Run the generator for one PR and record the outcome in the store.
    ///
    /// At most one task per identity is ever live; a duplicate submission
    /// returns [`RunOutcome::AlreadyRunning`] without touching anything.
    pub async fn run(
        &self,
        store: &Store,
        pr: &TrackedPr,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome> {
        {
            let live = self.live.lock().unwrap();
            if live.contains_key(&pr.id) {
                return Ok(RunOutcome::AlreadyRunning);
            }
        }

        tokio::fs::create_dir_all(&self.reviews_dir)
            .await
            .with_context(|| format!("creating {}", self.reviews_dir.display()))?;
        let reviews_dir = tokio::fs::canonicalize(&self.reviews_dir).await?;
        let file_name = pr.id.artifact_file_name();
        let output_path = reviews_dir.join(&file_name);
        let spawned_sha = pr.head_sha.clone();

        store.set_generating(pr, Utc::now())?;

        let spawned = Command::new(&self.generator)
            .arg("review")
            .arg(format!("--repo-name={}", pr.id.repo_name()))
            .arg("-n")
            .arg("3")
            .arg("-p")
            .arg(pr.id.number.to_string())
            .arg(format!("--output={}", output_path.display()))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();

        let mut child = match spawned {
            Ok(c) => c,
            Err(e) => {
                warn!(pr = %pr.id, error = %e, "failed to spawn review generator");
                store.error_unless_invalidated(&pr.id, &spawned_sha, Utc::now())?;
                return Ok(RunOutcome::Failed);
            }
        };

        if let Some(pid) = child.id() {
            let mut live = self.live.lock().unwrap();
            live.insert(
                pr.id.clone(),
                LiveTask {
                    pid,
                    started_at: Instant::now(),
                },
            );
        }
        info!(pr = %pr.id, sha = %spawned_sha, "review generation started");

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                self.remove_live(&pr.id);
                return Ok(RunOutcome::Canceled);
            }
        };

        let artifact_exists = tokio::fs::try_exists(&output_path).await.unwrap_or(false);
        let outcome = if status.success() && artifact_exists {
            if store.complete_if_current(&pr.id, &spawned_sha, &file_name, Utc::now())? {
                info!(pr = %pr.id, artifact = %file_name, "review generation completed");
                RunOutcome::Completed
            } else {
                // The head commit moved while we were generating; the artifact
                // describes a commit nobody cares about any more.
                let _ = tokio::fs::remove_file(&output_path).await;
                info!(pr = %pr.id, "stale artifact discarded");
                RunOutcome::StaleDiscarded
            }
        } else if store.error_unless_invalidated(&pr.id, &spawned_sha, Utc::now())? {
            warn!(pr = %pr.id, code = ?status.code(), artifact_exists, "review generation failed");
            RunOutcome::Failed
        } else {
            RunOutcome::Invalidated
        };

        // Only now is the identity released — the live table never points at
        // work whose outcome is not yet durable.
        self.remove_live(&pr.id);
        Ok(outcome)
    }

    /// Run a repository group of pending PRs in sub-batches of
    /// [`BATCH_SIZE`], sequentially within each batch.
    pub async fn run_batch(
        &self,
        store: &Store,
        prs: &[TrackedPr],
        cancel: &CancellationToken,
    ) -> Result<()> {
        for batch in prs.chunks(BATCH_SIZE) {
            for pr in batch {
                if cancel.is_cancelled() {
                    return Ok(());
                }
                if let Err(e) = self.run(store, pr, cancel).await {
                    warn!(pr = %pr.id, error = %e, "review task errored");
                }
            }
        }
        Ok(())
    }

    /// Terminate the live task for `id`, if any. Idempotent; returns whether
    /// a process existed.
    pub fn cancel(&self, id: &PrId) -> bool {
        let task = {
            let mut live = self.live.lock().unwrap();
            live.remove(id)
        };
        match task {
            Some(task) => {
                info!(pr = %id, pid = task.pid, "cancelling live review task");
                kill(task.pid);
                true
            }
            None => false,
        }
    }

    /// Terminate every live task. Used at shutdown.
    pub fn cancel_all(&self) {
        let tasks: Vec<(PrId, LiveTask)> = {
            let mut live = self.live.lock().unwrap();
            live.drain().collect()
        };
        for (id, task) in tasks {
            info!(pr = %id, pid = task.pid, "terminating live review task");
            kill(task.pid);
        }
    }

    /// Whether a task is live for `id`.
    pub fn is_running(&self, id: &PrId) -> bool {
        self.live.lock().unwrap().contains_key(id)
    }

    /// The longest-running live task, if any, with its elapsed time.
    pub fn running_task(&self) -> Option<(PrId, Duration)> {
        let live = self.live.lock().unwrap();
        live.iter()
            .max_by_key(|(_, t)| t.started_at.elapsed())
            .map(|(id, t)| (id.clone(), t.started_at.elapsed()))
    }

    /// Watchdog loop: every 30 s, log tasks past the soft threshold and kill
    /// tasks past the hard threshold. The killed task's waiter records the
    /// error through the normal exit path.
    pub async fn watchdog(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(WATCHDOG_TICK.min(self.hard_threshold));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancel.cancelled() => return,
            }
            let overdue: Vec<(PrId, u32, Duration)> = {
                let live = self.live.lock().unwrap();
                live.iter()
                    .filter(|(_, t)| t.started_at.elapsed() >= self.soft_threshold)
                    .map(|(id, t)| (id.clone(), t.pid, t.started_at.elapsed()))
                    .collect()
            };
            for (id, pid, elapsed) in overdue {
                if elapsed >= self.hard_threshold {
                    warn!(pr = %id, pid, elapsed_s = elapsed.as_secs(), "review task past hard threshold; killing");
                    kill(pid);
                } else {
                    warn!(pr = %id, pid, elapsed_s = elapsed.as_secs(), "review task running long");
                }
            }
        }
    }

    fn remove_live(&self, id: &PrId) {
        let mut live = self.live.lock().unwrap();
        live.remove(id);
    }
}

fn kill(pid: u32) {
    // SAFETY: sending SIGKILL to a pid we spawned (or already reaped, in
    // which case the call fails harmlessly with ESRCH).
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
    }
}
