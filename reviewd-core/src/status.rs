use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a tracked pull request.
///
/// State machine:
///   Pending → Generating → Completed | Error
///   Completed → Pending (head commit changed, or artifact file lost)
///   Error → Pending (retry after the error-retry age)
///   Generating → Pending (stale heal, or head commit changed)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrStatus {
    Pending,
    Generating,
    Completed,
    Error,
}

impl PrStatus {
    /// Whether a generator run is currently accounted to this row.
    pub fn is_in_flight(self) -> bool {
        matches!(self, Self::Generating)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Generating => "generating",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "generating" => Some(Self::Generating),
            "completed" => Some(Self::Completed),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    /// Sort rank used by the listing order: in-flight work first, then work
    /// still to do, then finished rows.
    pub fn sort_rank(self) -> i64 {
        match self {
            Self::Generating => 0,
            Self::Pending => 1,
            Self::Completed => 2,
            Self::Error => 3,
        }
    }
}

impl fmt::Display for PrStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A reviewer's effective review state, as GitHub reports it.
///
/// DISMISSED and PENDING reviews never become an effective state; they are
/// filtered out before a reviewer's latest state is selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewState {
    Approved,
    ChangesRequested,
    Commented,
}

impl ReviewState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Approved => "APPROVED",
            Self::ChangesRequested => "CHANGES_REQUESTED",
            Self::Commented => "COMMENTED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "APPROVED" => Some(Self::Approved),
            "CHANGES_REQUESTED" => Some(Self::ChangesRequested),
            "COMMENTED" => Some(Self::Commented),
            _ => None,
        }
    }
}

impl fmt::Display for ReviewState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rolled-up CI state for a PR's head commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CiState {
    Success,
    Failure,
    Pending,
    Unknown,
}

impl CiState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Pending => "pending",
            Self::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(Self::Success),
            "failure" => Some(Self::Failure),
            "pending" => Some(Self::Pending),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }
}

impl Default for CiState {
    fn default() -> Self {
        Self::Unknown
    }
}
