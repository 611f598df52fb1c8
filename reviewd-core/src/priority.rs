//! Priority scoring over the tracked-PR snapshot.
//!
//! The score is a pure function of the cached rows; the exact weights are
//! tuning, not architecture. A background task recomputes the report every
//! 30 minutes and once at startup, replacing the shared snapshot wholesale.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::pr::TrackedPr;
use crate::state::SharedState;
use crate::status::CiState;
use crate::store::Store;

/// How often the report is recomputed.
pub const RECOMPUTE_PERIOD: Duration = Duration::from_secs(30 * 60);

const SCORE_NEEDS_MY_REVIEW: i32 = 50;
const SCORE_CI_FAILED: i32 = 40;
const SCORE_WAITING_LONG: i32 = 15;
const SCORE_ALREADY_REVIEWED: i32 = -20;
const SCORE_WELL_APPROVED: i32 = -15;
const SCORE_DRAFT: i32 = -30;

const WAITING_LONG: chrono::Duration = chrono::Duration::hours(24);

#[derive(Debug, Clone, Serialize)]
pub struct PriorityEntry {
    pub owner: String,
    pub repo: String,
    pub number: u64,
    pub title: String,
    pub author: String,
    pub score: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct PriorityReport {
    pub generated_at: DateTime<Utc>,
    pub entries: Vec<PriorityEntry>,
}

/// Score one row. Higher means "look at this sooner".
pub fn score(pr: &TrackedPr, now: DateTime<Utc>) -> i32 {
    let mut score = 0;
    if !pr.is_mine && pr.my_review_status.is_none() {
        score += SCORE_NEEDS_MY_REVIEW;
    }
    if pr.ci_state == CiState::Failure {
        score += SCORE_CI_FAILED;
    }
    if let Some(created) = pr.created_at {
        if !pr.is_mine && now - created > WAITING_LONG {
            score += SCORE_WAITING_LONG;
        }
    }
    if pr.my_review_status.is_some() {
        score += SCORE_ALREADY_REVIEWED;
    }
    if pr.approval_count >= 2 {
        score += SCORE_WELL_APPROVED;
    }
    if pr.draft {
        score += SCORE_DRAFT;
    }
    score
}

/// Score every row and sort highest first (ties by identity for a
/// deterministic report).
pub fn compute_report(rows: &[TrackedPr], now: DateTime<Utc>) -> PriorityReport {
    let mut entries: Vec<PriorityEntry> = rows
        .iter()
        .map(|pr| PriorityEntry {
            owner: pr.id.owner.clone(),
            repo: pr.id.repo.clone(),
            number: pr.id.number,
            title: pr.title.clone(),
            author: pr.author.clone(),
            score: score(pr, now),
        })
        .collect();
    entries.sort_by(|a, b| {
        b.score
            .cmp(&a.score)
            .then_with(|| a.owner.cmp(&b.owner))
            .then_with(|| a.repo.cmp(&b.repo))
            .then_with(|| a.number.cmp(&b.number))
    });
    PriorityReport {
        generated_at: now,
        entries,
    }
}

/// Background recompute loop: once immediately, then every
/// [`RECOMPUTE_PERIOD`] until shutdown.
pub async fn run_prioritizer(store: Arc<Store>, shared: Arc<SharedState>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(RECOMPUTE_PERIOD);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = cancel.cancelled() => return,
        }
        match store.list_all() {
            Ok(rows) => {
                let report = compute_report(&rows, Utc::now());
                debug!(entries = report.entries.len(), "priority report recomputed");
                *shared.priority.write().await = Some(report);
            }
            Err(e) => warn!(error = %e, "priority recompute failed"),
        }
    }
}
