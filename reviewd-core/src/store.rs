//! SQLite persistence for tracked pull requests.
//!
//! Sole owner of durability. The schema is evolved by forward-only additive
//! migrations executed in one transaction; a "duplicate column" failure from
//! SQLite marks an already-applied step and is skipped, anything else rolls
//! the transaction back and aborts startup.
//!
//! The invariant-carrying transitions (`set_generating`, `reset_to_outdated`,
//! `complete_if_current`, `error_unless_invalidated`) are single conditional
//! UPDATE statements, so the head-sha re-check happens inside SQLite's own
//! write lock.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::pr::{PrId, PrSummary, TrackedPr, NOTES_MAX_CHARS};
use crate::status::{CiState, PrStatus, ReviewState};

/// Base table plus every additive migration, in order. Never reordered,
/// never edited in place — only appended to.
const MIGRATIONS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS prs (
        owner    TEXT NOT NULL,
        repo     TEXT NOT NULL,
        number   INTEGER NOT NULL,
        head_sha TEXT NOT NULL DEFAULT '',
        title    TEXT NOT NULL DEFAULT '',
        author   TEXT NOT NULL DEFAULT '',
        status   TEXT NOT NULL DEFAULT 'pending',
        PRIMARY KEY (owner, repo, number)
    )",
    "ALTER TABLE prs ADD COLUMN created_at TEXT",
    "ALTER TABLE prs ADD COLUMN is_mine INTEGER NOT NULL DEFAULT 0",
    "ALTER TABLE prs ADD COLUMN draft INTEGER NOT NULL DEFAULT 0",
    "ALTER TABLE prs ADD COLUMN approval_count INTEGER NOT NULL DEFAULT 0",
    "ALTER TABLE prs ADD COLUMN my_review_status TEXT",
    "ALTER TABLE prs ADD COLUMN generating_since TEXT",
    "ALTER TABLE prs ADD COLUMN artifact_path TEXT",
    "ALTER TABLE prs ADD COLUMN last_reviewed_at TEXT",
    "ALTER TABLE prs ADD COLUMN notes TEXT NOT NULL DEFAULT ''",
    "ALTER TABLE prs ADD COLUMN ci_state TEXT NOT NULL DEFAULT 'unknown'",
    "ALTER TABLE prs ADD COLUMN ci_failed_checks TEXT NOT NULL DEFAULT '[]'",
];

/// Listing order: other people's PRs before mine, newest first with unknown
/// creation dates last, then in-flight work before pending before finished.
const LIST_ORDER: &str = "ORDER BY is_mine ASC,
    CASE WHEN created_at IS NULL THEN 1 ELSE 0 END ASC,
    created_at DESC,
    CASE status
        WHEN 'generating' THEN 0
        WHEN 'pending' THEN 1
        WHEN 'completed' THEN 2
        ELSE 3
    END ASC";

const ALL_COLUMNS: &str = "owner, repo, number, head_sha, title, author, created_at, is_mine,
    draft, approval_count, my_review_status, status, generating_since, artifact_path,
    last_reviewed_at, notes, ci_state, ci_failed_checks";

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (creating if necessary) the database at `path` and bring the
    /// schema up to date. Any non-"duplicate column" migration failure is
    /// returned, leaving the schema untouched.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("opening database {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        for stmt in MIGRATIONS {
            match tx.execute(stmt, []) {
                Ok(_) => {}
                Err(e) if is_duplicate_column(&e) => {}
                Err(e) => return Err(e).with_context(|| format!("migration failed: {stmt}")),
            }
        }
        tx.commit()?;
        Ok(())
    }

    // ── Row primitives ───────────────────────────────────────────────────────

    pub fn get(&self, id: &PrId) -> Result<Option<TrackedPr>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!("SELECT {ALL_COLUMNS} FROM prs WHERE owner = ?1 AND repo = ?2 AND number = ?3");
        let row = conn
            .query_row(&sql, params![id.owner, id.repo, id.number], row_to_pr)
            .optional()?;
        Ok(row)
    }

    /// All rows in the listing order.
    pub fn list_all(&self) -> Result<Vec<TrackedPr>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!("SELECT {ALL_COLUMNS} FROM prs {LIST_ORDER}");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], row_to_pr)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Full-row write. Creates or replaces every column from `pr`.
    pub fn upsert(&self, pr: &TrackedPr) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO prs (owner, repo, number, head_sha, title, author, created_at, is_mine,
                 draft, approval_count, my_review_status, status, generating_since, artifact_path,
                 last_reviewed_at, notes, ci_state, ci_failed_checks)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
             ON CONFLICT(owner, repo, number) DO UPDATE SET
                 head_sha = excluded.head_sha,
                 title = excluded.title,
                 author = excluded.author,
                 created_at = excluded.created_at,
                 is_mine = excluded.is_mine,
                 draft = excluded.draft,
                 approval_count = excluded.approval_count,
                 my_review_status = excluded.my_review_status,
                 status = excluded.status,
                 generating_since = excluded.generating_since,
                 artifact_path = excluded.artifact_path,
                 last_reviewed_at = excluded.last_reviewed_at,
                 notes = excluded.notes,
                 ci_state = excluded.ci_state,
                 ci_failed_checks = excluded.ci_failed_checks",
            params![
                pr.id.owner,
                pr.id.repo,
                pr.id.number,
                pr.head_sha,
                pr.title,
                pr.author,
                pr.created_at.map(ts),
                pr.is_mine,
                pr.draft,
                pr.approval_count,
                pr.my_review_status.map(ReviewState::as_str),
                pr.status.as_str(),
                pr.generating_since.map(ts),
                pr.artifact_path,
                pr.last_reviewed_at.map(ts),
                pr.notes,
                pr.ci_state.as_str(),
                serde_json::to_string(&pr.ci_failed_checks)?,
            ],
        )?;
        Ok(())
    }

    /// Create a row for a search summary, or refresh the remote-derived
    /// metadata of an existing one. Lifecycle columns are never touched, and
    /// `head_sha` only moves while the row is still pending — invalidation of
    /// in-flight or completed work is the reconciler's job.
    pub fn upsert_summary(&self, summary: &PrSummary, is_mine: bool) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO prs (owner, repo, number, head_sha, title, author, created_at, is_mine, draft)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(owner, repo, number) DO UPDATE SET
                 title = excluded.title,
                 author = excluded.author,
                 created_at = COALESCE(excluded.created_at, created_at),
                 is_mine = excluded.is_mine,
                 draft = excluded.draft,
                 head_sha = CASE WHEN status = 'pending' THEN excluded.head_sha ELSE head_sha END",
            params![
                summary.id.owner,
                summary.id.repo,
                summary.id.number,
                summary.head_sha,
                summary.title,
                summary.author,
                summary.created_at.map(ts),
                is_mine,
                summary.draft,
            ],
        )?;
        Ok(())
    }

    /// Remove a row. Returns whether one existed (deleting an absent identity
    /// is a successful no-op).
    pub fn delete(&self, id: &PrId) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "DELETE FROM prs WHERE owner = ?1 AND repo = ?2 AND number = ?3",
            params![id.owner, id.repo, id.number],
        )?;
        Ok(n > 0)
    }

    // ── Invariant-carrying transitions ───────────────────────────────────────

    /// Mark a row as generating: `status ← generating`,
    /// `generating_since ← now`, artifact cleared. Inserts the row if the
    /// store has never seen it.
    pub fn set_generating(&self, pr: &TrackedPr, now: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO prs (owner, repo, number, head_sha, title, author, created_at, is_mine,
                 draft, status, generating_since)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'generating', ?10)
             ON CONFLICT(owner, repo, number) DO UPDATE SET
                 status = 'generating',
                 head_sha = excluded.head_sha,
                 generating_since = excluded.generating_since,
                 artifact_path = NULL",
            params![
                pr.id.owner,
                pr.id.repo,
                pr.id.number,
                pr.head_sha,
                pr.title,
                pr.author,
                pr.created_at.map(ts),
                pr.is_mine,
                pr.draft,
                ts(now),
            ],
        )?;
        Ok(())
    }

    /// The head commit moved: back to pending with the new sha, artifact and
    /// review timestamps cleared.
    pub fn reset_to_outdated(&self, id: &PrId, new_head_sha: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE prs SET status = 'pending', head_sha = ?4, artifact_path = NULL,
                 last_reviewed_at = NULL, generating_since = NULL
             WHERE owner = ?1 AND repo = ?2 AND number = ?3",
            params![id.owner, id.repo, id.number, new_head_sha],
        )?;
        Ok(())
    }

    /// Accept a completed artifact only if the row's head sha still equals
    /// the sha the generator was spawned with. Returns whether the write was
    /// accepted; a rejected write means the caller's artifact is stale and
    /// must be discarded.
    pub fn complete_if_current(
        &self,
        id: &PrId,
        spawned_sha: &str,
        artifact_path: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE prs SET status = 'completed', artifact_path = ?5, last_reviewed_at = ?6,
                 generating_since = NULL
             WHERE owner = ?1 AND repo = ?2 AND number = ?3 AND head_sha = ?4",
            params![id.owner, id.repo, id.number, spawned_sha, artifact_path, ts(now)],
        )?;
        Ok(n > 0)
    }

    /// Record a generator failure, unless the reconciler already invalidated
    /// the work (row back to pending under a different sha). Returns whether
    /// the error was recorded.
    pub fn error_unless_invalidated(
        &self,
        id: &PrId,
        spawned_sha: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE prs SET status = 'error', generating_since = NULL, last_reviewed_at = ?5
             WHERE owner = ?1 AND repo = ?2 AND number = ?3
               AND NOT (status = 'pending' AND head_sha != ?4)",
            params![id.owner, id.repo, id.number, spawned_sha, ts(now)],
        )?;
        Ok(n > 0)
    }

    // ── Self-healing queries ─────────────────────────────────────────────────

    /// Rows stuck in `generating` past `timeout` (or with no timestamp at
    /// all, from a crash mid-transition) go back to pending. Returns the
    /// number healed.
    pub fn reset_stale_generating(&self, timeout: Duration, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now - chrono::Duration::from_std(timeout)?;
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE prs SET status = 'pending', generating_since = NULL
             WHERE status = 'generating'
               AND (generating_since IS NULL OR generating_since < ?1)",
            params![ts(cutoff)],
        )?;
        Ok(n)
    }

    /// Error rows older than `max_age` re-enter the pipeline. Returns the
    /// number reset.
    pub fn reset_error(&self, max_age: Duration, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now - chrono::Duration::from_std(max_age)?;
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE prs SET status = 'pending'
             WHERE status = 'error'
               AND (last_reviewed_at IS NULL OR last_reviewed_at < ?1)",
            params![ts(cutoff)],
        )?;
        Ok(n)
    }

    /// Identities whose title or author never made it in.
    pub fn missing_metadata(&self) -> Result<Vec<PrId>> {
        self.project_ids("SELECT owner, repo, number FROM prs WHERE title = '' OR author = ''")
    }

    /// Identities with no creation date.
    pub fn missing_created_at(&self) -> Result<Vec<PrId>> {
        self.project_ids("SELECT owner, repo, number FROM prs WHERE created_at IS NULL")
    }

    fn project_ids(&self, sql: &str) -> Result<Vec<PrId>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(sql)?;
        let ids = stmt
            .query_map([], |row| {
                Ok(PrId {
                    owner: row.get(0)?,
                    repo: row.get(1)?,
                    number: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    // ── Column updates ───────────────────────────────────────────────────────

    /// Backfill title and author, leaving every other column alone.
    pub fn update_metadata(&self, id: &PrId, title: &str, author: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE prs SET title = ?4, author = ?5
             WHERE owner = ?1 AND repo = ?2 AND number = ?3",
            params![id.owner, id.repo, id.number, title, author],
        )?;
        Ok(())
    }

    pub fn update_created_at(&self, id: &PrId, created_at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE prs SET created_at = ?4
             WHERE owner = ?1 AND repo = ?2 AND number = ?3",
            params![id.owner, id.repo, id.number, ts(created_at)],
        )?;
        Ok(())
    }

    /// Refresh the batched review data. Draft always tracks the remote.
    pub fn update_review_data(
        &self,
        id: &PrId,
        approval_count: u32,
        my_review_status: Option<ReviewState>,
        draft: bool,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE prs SET approval_count = ?4, my_review_status = ?5, draft = ?6
             WHERE owner = ?1 AND repo = ?2 AND number = ?3",
            params![
                id.owner,
                id.repo,
                id.number,
                approval_count,
                my_review_status.map(ReviewState::as_str),
                draft,
            ],
        )?;
        Ok(())
    }

    pub fn update_ci(&self, id: &PrId, state: CiState, failed_checks: &[String]) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE prs SET ci_state = ?4, ci_failed_checks = ?5
             WHERE owner = ?1 AND repo = ?2 AND number = ?3",
            params![
                id.owner,
                id.repo,
                id.number,
                state.as_str(),
                serde_json::to_string(failed_checks)?,
            ],
        )?;
        Ok(())
    }

    /// Update only the notes column. Rejects values longer than
    /// [`NOTES_MAX_CHARS`]. Returns whether a row existed.
    pub fn update_notes(&self, id: &PrId, notes: &str) -> Result<bool> {
        if notes.chars().count() > NOTES_MAX_CHARS {
            bail!("notes longer than {NOTES_MAX_CHARS} characters");
        }
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE prs SET notes = ?4 WHERE owner = ?1 AND repo = ?2 AND number = ?3",
            params![id.owner, id.repo, id.number, notes],
        )?;
        Ok(n > 0)
    }

    // ── Status-endpoint projections ──────────────────────────────────────────

    /// `(status, count)` pairs for every status present.
    pub fn counts_by_status(&self) -> Result<Vec<(PrStatus, u64)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM prs GROUP BY status")?;
        let mut counts = Vec::new();
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
        })?;
        for row in rows {
            let (s, n) = row?;
            if let Some(status) = PrStatus::parse(&s) {
                counts.push((status, n));
            }
        }
        Ok(counts)
    }

    /// Most recently completed rows, newest first.
    pub fn recent_completions(&self, limit: usize) -> Result<Vec<TrackedPr>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT {ALL_COLUMNS} FROM prs
             WHERE status = 'completed' AND last_reviewed_at IS NOT NULL
             ORDER BY last_reviewed_at DESC LIMIT ?1"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([limit as i64], row_to_pr)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

// ── Row mapping and helpers ───────────────────────────────────────────────────

/// Timestamps are stored as fixed-width UTC RFC 3339 text so that SQL string
/// comparison agrees with chronological order.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn row_to_pr(row: &Row<'_>) -> rusqlite::Result<TrackedPr> {
    let status_str: String = row.get(11)?;
    let my_review: Option<String> = row.get(10)?;
    let ci_state_str: String = row.get(16)?;
    let ci_failed_json: String = row.get(17)?;
    Ok(TrackedPr {
        id: PrId {
            owner: row.get(0)?,
            repo: row.get(1)?,
            number: row.get(2)?,
        },
        head_sha: row.get(3)?,
        title: row.get(4)?,
        author: row.get(5)?,
        created_at: parse_ts(row.get(6)?),
        is_mine: row.get(7)?,
        draft: row.get(8)?,
        approval_count: row.get(9)?,
        my_review_status: my_review.as_deref().and_then(ReviewState::parse),
        status: PrStatus::parse(&status_str).unwrap_or(PrStatus::Error),
        generating_since: parse_ts(row.get(12)?),
        artifact_path: row.get(13)?,
        last_reviewed_at: parse_ts(row.get(14)?),
        notes: row.get(15)?,
        ci_state: CiState::parse(&ci_state_str).unwrap_or_default(),
        ci_failed_checks: serde_json::from_str(&ci_failed_json).unwrap_or_default(),
    })
}

/// SQLite reports a re-run `ADD COLUMN` as a generic error whose message
/// names the duplicate column; that message is the structured indicator the
/// migration loop keys on.
fn is_duplicate_column(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(_, Some(msg)) if msg.contains("duplicate column name")
    )
}
