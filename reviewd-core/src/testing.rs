//! In-crate test doubles.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::github::{PrGateway, RateLimitInfo, RemoteError, ReviewData};
use crate::pr::{PrDetails, PrId, PrSummary};

/// A scriptable [`PrGateway`]: seed the fields, then run the code under test.
///
/// Unknown PRs are open by default; details default to [`RemoteError::NotFound`];
/// repositories listed in `rate_limited_repos` answer every review query with
/// the rate-limited outcome.
#[derive(Default)]
pub struct MockGateway {
    pub review_requested: Mutex<Vec<PrSummary>>,
    pub mine: Mutex<Vec<PrSummary>>,
    pub search_fails: Mutex<bool>,
    pub open: Mutex<HashMap<PrId, bool>>,
    pub details: Mutex<HashMap<PrId, PrDetails>>,
    pub review_data: Mutex<HashMap<PrId, ReviewData>>,
    pub rate_limited_repos: Mutex<HashSet<String>>,
    pub rate_limit: Mutex<Option<RateLimitInfo>>,
    pub rate_limit_calls: Mutex<usize>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_open(&self, id: &PrId, open: bool) {
        self.open.lock().unwrap().insert(id.clone(), open);
    }

    pub fn set_details(&self, id: &PrId, details: PrDetails) {
        self.details.lock().unwrap().insert(id.clone(), details);
    }

    pub fn set_review_data(&self, id: &PrId, data: ReviewData) {
        self.review_data.lock().unwrap().insert(id.clone(), data);
    }

    pub fn rate_limit_repo(&self, owner: &str, repo: &str) {
        self.rate_limited_repos
            .lock()
            .unwrap()
            .insert(format!("{owner}/{repo}"));
    }
}

#[async_trait]
impl PrGateway for MockGateway {
    async fn search_review_requested(&self) -> Result<Vec<PrSummary>, RemoteError> {
        if *self.search_fails.lock().unwrap() {
            return Err(RemoteError::Status {
                code: 500,
                body: "search down".into(),
            });
        }
        Ok(self.review_requested.lock().unwrap().clone())
    }

    async fn search_mine(&self) -> Result<Vec<PrSummary>, RemoteError> {
        if *self.search_fails.lock().unwrap() {
            return Err(RemoteError::Status {
                code: 500,
                body: "search down".into(),
            });
        }
        Ok(self.mine.lock().unwrap().clone())
    }

    async fn is_open(&self, id: &PrId) -> Result<bool, RemoteError> {
        Ok(*self.open.lock().unwrap().get(id).unwrap_or(&true))
    }

    async fn get_details(&self, id: &PrId) -> Result<PrDetails, RemoteError> {
        match self.details.lock().unwrap().get(id) {
            Some(d) => Ok(d.clone()),
            None => Err(RemoteError::NotFound),
        }
    }

    async fn repo_review_data(
        &self,
        owner: &str,
        repo: &str,
        numbers: &[u64],
    ) -> Result<HashMap<u64, ReviewData>, RemoteError> {
        if self
            .rate_limited_repos
            .lock()
            .unwrap()
            .contains(&format!("{owner}/{repo}"))
        {
            return Err(RemoteError::RateLimited { reset: None });
        }
        let data = self.review_data.lock().unwrap();
        let mut out = HashMap::new();
        for number in numbers {
            let id = PrId::new(owner, repo, *number);
            if let Some(d) = data.get(&id) {
                out.insert(*number, d.clone());
            }
        }
        Ok(out)
    }

    async fn rate_limit(&self) -> Result<RateLimitInfo, RemoteError> {
        *self.rate_limit_calls.lock().unwrap() += 1;
        match *self.rate_limit.lock().unwrap() {
            Some(info) => Ok(info),
            None => Ok(RateLimitInfo {
                remaining: 5000,
                limit: 5000,
                reset: None,
            }),
        }
    }
}

/// A summary fixture with sensible defaults.
pub fn summary(owner: &str, repo: &str, number: u64, sha: &str) -> PrSummary {
    PrSummary {
        id: PrId::new(owner, repo, number),
        head_sha: sha.to_string(),
        title: format!("PR {number}"),
        author: "alice".to_string(),
        created_at: chrono::DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .ok()
            .map(|dt| dt.with_timezone(&chrono::Utc)),
        draft: false,
    }
}

/// Details matching a summary, with a chosen head sha.
pub fn details(sha: &str) -> PrDetails {
    PrDetails {
        title: "PR".to_string(),
        author: "alice".to_string(),
        head_sha: sha.to_string(),
        additions: 10,
        deletions: 2,
        changed_files: 3,
        created_at: chrono::DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .ok()
            .map(|dt| dt.with_timezone(&chrono::Utc)),
        review_count: 0,
        requested_reviewers: 1,
        draft: false,
    }
}
