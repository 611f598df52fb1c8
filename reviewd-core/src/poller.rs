//! The reconciler: a single long-running task that periodically drives the
//! reconciliation pass.
//!
//!   - `pass`    — the fixed per-tick pipeline (heal → sweep → refresh →
//!                 dispatch), every step isolated from the others' failures
//!   - `Poller`  — the ticker, the manual-trigger mailbox, and the
//!                 pass-exclusivity lock
//!
//! Exactly one pass runs at a time. The ticker, the manual trigger, and the
//! startup trigger all funnel through the same start routine, which skips
//! (and logs) when a pass is already in flight.

pub mod pass;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::executor::ReviewExecutor;
use crate::github::PrGateway;
use crate::state::SharedState;
use crate::store::Store;

use pass::{run_pass, PassDeps};

/// Handle for enqueuing a manual reconciliation tick.
///
/// The mailbox has capacity one: triggers arriving while one is already
/// pending collapse, because reconciliation is idempotent.
#[derive(Clone)]
pub struct TriggerHandle {
    tx: mpsc::Sender<()>,
}

impl TriggerHandle {
    /// Request a tick after the current one (if any) completes.
    pub fn request(&self) {
        let _ = self.tx.try_send(());
    }
}

pub struct Poller {
    store: Arc<Store>,
    gateway: Arc<dyn PrGateway>,
    executor: Arc<ReviewExecutor>,
    shared: Arc<SharedState>,
    username: String,
    reviews_dir: PathBuf,
    period: Duration,
    trigger_rx: mpsc::Receiver<()>,
    // Held so the trigger channel can never close under the loop.
    _trigger_tx: mpsc::Sender<()>,
}

enum Wake {
    Tick,
    Trigger,
    Shutdown,
}

impl Poller {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        gateway: Arc<dyn PrGateway>,
        executor: Arc<ReviewExecutor>,
        shared: Arc<SharedState>,
        username: String,
        reviews_dir: PathBuf,
        period: Duration,
    ) -> (Self, TriggerHandle) {
        let (tx, trigger_rx) = mpsc::channel(1);
        (
            Self {
                store,
                gateway,
                executor,
                shared,
                username,
                reviews_dir,
                period,
                trigger_rx,
                _trigger_tx: tx.clone(),
            },
            TriggerHandle { tx },
        )
    }

    /// Run until shutdown. An initial pass runs immediately; the ticker
    /// fires every `period` after its recorded epoch.
    pub async fn run(mut self, cancel: CancellationToken) {
        let epoch = Instant::now();
        self.shared.tick.lock().unwrap().start(epoch);

        let pass_lock = tokio::sync::Mutex::new(());

        self.start_pass(&pass_lock, &cancel, "startup").await;

        let mut ticker = tokio::time::interval_at((epoch + self.period).into(), self.period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let wake = tokio::select! {
                _ = ticker.tick() => Wake::Tick,
                received = self.trigger_rx.recv() => match received {
                    Some(()) => Wake::Trigger,
                    None => Wake::Shutdown,
                },
                _ = cancel.cancelled() => Wake::Shutdown,
            };
            match wake {
                Wake::Tick => self.start_pass(&pass_lock, &cancel, "ticker").await,
                Wake::Trigger => self.start_pass(&pass_lock, &cancel, "manual trigger").await,
                Wake::Shutdown => {
                    info!("reconciler shutting down");
                    self.executor.cancel_all();
                    return;
                }
            }
        }
    }

    async fn start_pass(
        &self,
        pass_lock: &tokio::sync::Mutex<()>,
        cancel: &CancellationToken,
        reason: &str,
    ) {
        let Ok(_guard) = pass_lock.try_lock() else {
            warn!(reason, "reconciliation pass already running; skipping");
            return;
        };
        let started = Instant::now();
        let report = run_pass(PassDeps {
            store: &self.store,
            gateway: self.gateway.as_ref(),
            executor: &self.executor,
            shared: &self.shared,
            username: &self.username,
            reviews_dir: &self.reviews_dir,
            cancel,
        })
        .await;
        info!(
            reason,
            elapsed_ms = started.elapsed().as_millis() as u64,
            healed = report.healed_stale,
            retried = report.retried_errors,
            removed = report.removed_closed,
            backfilled = report.backfilled,
            invalidated = report.invalidated,
            discovered = report.discovered,
            review_updates = report.review_updates,
            scheduled = report.scheduled,
            "reconciliation pass complete"
        );
    }
}
