//! Shared state between the reconciler, the prioritizer, and the HTTP
//! surface.
//!
//! Every field is either replaced wholesale under its own lock or is a
//! guarded scalar; nothing here is ever held across a remote call or a
//! subprocess wait.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::github::RateLimitInfo;
use crate::pr::PrSummary;
use crate::priority::PriorityReport;

/// Rate-limit info is refreshed at most this often by status requests.
pub const RATE_LIMIT_TTL: Duration = Duration::from_secs(30);

/// A rate-limit snapshot plus when it was fetched.
#[derive(Debug, Clone, Copy)]
pub struct CachedRateLimit {
    pub info: RateLimitInfo,
    pub fetched_at: Instant,
}

impl CachedRateLimit {
    pub fn is_fresh(&self) -> bool {
        self.fetched_at.elapsed() < RATE_LIMIT_TTL
    }
}

/// Ticker epoch and period, for deterministic seconds-until-next-tick.
#[derive(Debug, Clone, Copy)]
pub struct TickClock {
    epoch: Option<Instant>,
    period: Duration,
}

impl TickClock {
    pub fn new(period: Duration) -> Self {
        Self {
            epoch: None,
            period,
        }
    }

    /// Record the ticker's start. Called once when the reconciler begins.
    pub fn start(&mut self, epoch: Instant) {
        self.epoch = Some(epoch);
    }

    /// Seconds until the ticker's next fire: `ceil((now−T₀)/P)·P − (now−T₀)`,
    /// clamped at zero. `None` until the ticker has started.
    pub fn seconds_until_next_tick(&self, now: Instant) -> Option<u64> {
        let epoch = self.epoch?;
        let period_ms = self.period.as_millis().max(1);
        let elapsed_ms = now.saturating_duration_since(epoch).as_millis();
        let intervals = elapsed_ms.div_ceil(period_ms);
        let next_ms = intervals * period_ms;
        Some(((next_ms - elapsed_ms) / 1000) as u64)
    }
}

/// State shared across the daemon's tasks.
pub struct SharedState {
    pub started_at: Instant,
    /// Most recent remote summaries, replaced wholesale per pass.
    pub pr_cache: RwLock<Vec<PrSummary>>,
    /// Cached rate-limit info (30 s TTL).
    pub rate_limit: RwLock<Option<CachedRateLimit>>,
    /// Latest prioritizer output; `None` before the first run.
    pub priority: RwLock<Option<PriorityReport>>,
    /// Ticker epoch and period.
    pub tick: Mutex<TickClock>,
}

impl SharedState {
    pub fn new(period: Duration) -> Self {
        Self {
            started_at: Instant::now(),
            pr_cache: RwLock::new(Vec::new()),
            rate_limit: RwLock::new(None),
            priority: RwLock::new(None),
            tick: Mutex::new(TickClock::new(period)),
        }
    }

    pub fn seconds_until_next_tick(&self) -> Option<u64> {
        self.tick
            .lock()
            .unwrap()
            .seconds_until_next_tick(Instant::now())
    }
}
