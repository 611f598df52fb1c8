use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::status::{CiState, PrStatus, ReviewState};

/// Maximum length (in characters) of the user-editable notes column.
pub const NOTES_MAX_CHARS: usize = 15;

/// Identity of a tracked pull request: `(owner, repo, number)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PrId {
    pub owner: String,
    pub repo: String,
    pub number: u64,
}

impl PrId {
    pub fn new(owner: impl Into<String>, repo: impl Into<String>, number: u64) -> Self {
        Self {
            owner: owner.into(),
            repo: repo.into(),
            number,
        }
    }

    /// `"owner/repo"`, the form the review generator and GitHub APIs take.
    pub fn repo_name(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }

    /// File name of the review artifact: `<owner>_<repo>_<number>.html`.
    pub fn artifact_file_name(&self) -> String {
        format!("{}_{}_{}.html", self.owner, self.repo, self.number)
    }

    /// The PR's page on GitHub.
    pub fn github_url(&self) -> String {
        format!(
            "https://github.com/{}/{}/pull/{}",
            self.owner, self.repo, self.number
        )
    }
}

impl fmt::Display for PrId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}#{}", self.owner, self.repo, self.number)
    }
}

/// A tracked pull request — the entity persisted in the store.
///
/// The single source of truth for a PR's lifecycle. Remote-derived columns
/// are refreshed by the poller; owned columns change only through the store's
/// transition methods.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackedPr {
    #[serde(flatten)]
    pub id: PrId,
    pub head_sha: String,
    pub title: String,
    pub author: String,
    pub created_at: Option<DateTime<Utc>>,
    pub is_mine: bool,
    pub draft: bool,
    pub approval_count: u32,
    pub my_review_status: Option<ReviewState>,
    pub status: PrStatus,
    pub generating_since: Option<DateTime<Utc>>,
    pub artifact_path: Option<String>,
    pub last_reviewed_at: Option<DateTime<Utc>>,
    pub notes: String,
    pub ci_state: CiState,
    pub ci_failed_checks: Vec<String>,
}

impl TrackedPr {
    /// A freshly discovered PR: pending, nothing generated yet.
    pub fn discovered(summary: &PrSummary, is_mine: bool) -> Self {
        Self {
            id: summary.id.clone(),
            head_sha: summary.head_sha.clone(),
            title: summary.title.clone(),
            author: summary.author.clone(),
            created_at: summary.created_at,
            is_mine,
            draft: summary.draft,
            approval_count: 0,
            my_review_status: None,
            status: PrStatus::Pending,
            generating_since: None,
            artifact_path: None,
            last_reviewed_at: None,
            notes: String::new(),
            ci_state: CiState::Unknown,
            ci_failed_checks: Vec::new(),
        }
    }
}

/// A PR as surfaced by a remote search: enough to create or refresh a row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PrSummary {
    pub id: PrId,
    pub head_sha: String,
    pub title: String,
    pub author: String,
    pub created_at: Option<DateTime<Utc>>,
    pub draft: bool,
}

/// The richer per-PR detail used by the metadata backfill and the priority
/// scorer.
#[derive(Debug, Clone, PartialEq)]
pub struct PrDetails {
    pub title: String,
    pub author: String,
    pub head_sha: String,
    pub additions: u64,
    pub deletions: u64,
    pub changed_files: u64,
    pub created_at: Option<DateTime<Utc>>,
    pub review_count: u64,
    pub requested_reviewers: u64,
    pub draft: bool,
}
