//! GitHub gateway: the typed wrapper over the remote PR source.
//!
//! `PrGateway` is the port the reconciler talks to; `GitHubClient` is the
//! production implementation over the REST and GraphQL APIs. The review-state
//! derivation rules live here as pure functions so that test doubles derive
//! exactly what the live client does.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;

use crate::pr::{PrDetails, PrId, PrSummary};
use crate::status::{CiState, ReviewState};

const API_BASE: &str = "https://api.github.com";
const GRAPHQL_URL: &str = "https://api.github.com/graphql";

/// How many reviews the batched query retrieves per PR. An approval from a
/// reviewer whose most recent non-dismissed state lies beyond this window can
/// be missed; full pagination is deliberately out of scope.
pub const REVIEW_WINDOW: usize = 100;

/// Remote failure kinds the core distinguishes.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    /// The remote reports zero remaining API budget. Callers preserve
    /// existing store values when they see this.
    #[error("rate limited (resets {reset:?})")]
    RateLimited { reset: Option<DateTime<Utc>> },
    /// The PR (or endpoint) does not exist — treated as "PR gone".
    #[error("not found")]
    NotFound,
    #[error("http transport: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {code}: {body}")]
    Status { code: u16, body: String },
    #[error("malformed response: {0}")]
    Decode(String),
}

impl RemoteError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
}

/// Snapshot of the remote API budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct RateLimitInfo {
    pub remaining: u64,
    pub limit: u64,
    pub reset: Option<DateTime<Utc>>,
}

/// Per-PR result of the batched review query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReviewData {
    pub approval_count: u32,
    pub my_review_status: Option<ReviewState>,
    pub ci_state: CiState,
    pub ci_failed_checks: Vec<String>,
}

/// Port over the remote PR source.
#[async_trait]
pub trait PrGateway: Send + Sync {
    /// Open PRs where the configured user's review is requested.
    async fn search_review_requested(&self) -> Result<Vec<PrSummary>, RemoteError>;

    /// Open PRs authored by the configured user.
    async fn search_mine(&self) -> Result<Vec<PrSummary>, RemoteError>;

    /// Whether the PR is still open (closed and merged both count as gone).
    async fn is_open(&self, id: &PrId) -> Result<bool, RemoteError>;

    /// Rich per-PR detail for the metadata backfill and the priority scorer.
    async fn get_details(&self, id: &PrId) -> Result<PrDetails, RemoteError>;

    /// Review data for several PRs of one repository in a single round trip,
    /// retrieving at most [`REVIEW_WINDOW`] reviews per PR.
    async fn repo_review_data(
        &self,
        owner: &str,
        repo: &str,
        numbers: &[u64],
    ) -> Result<HashMap<u64, ReviewData>, RemoteError>;

    /// Current API budget.
    async fn rate_limit(&self) -> Result<RateLimitInfo, RemoteError>;
}

// ── Review-state derivation (shared by the live client and test doubles) ─────

/// One review as the remote reports it: submission order, author (absent for
/// deleted users and some bots), raw state string.
#[derive(Debug, Clone)]
pub struct ReviewRecord {
    pub author: Option<String>,
    pub state: String,
}

/// Each reviewer's latest effective state, in no particular order.
///
/// Reviews with a missing author are skipped; DISMISSED and PENDING states
/// never become effective.
pub fn effective_review_states(reviews: &[ReviewRecord]) -> HashMap<String, ReviewState> {
    let mut latest = HashMap::new();
    for review in reviews {
        let Some(author) = &review.author else {
            continue;
        };
        let Some(state) = ReviewState::parse(&review.state) else {
            continue;
        };
        latest.insert(author.clone(), state);
    }
    latest
}

/// Count of distinct reviewers whose latest effective state is APPROVED.
pub fn approval_count(reviews: &[ReviewRecord]) -> u32 {
    effective_review_states(reviews)
        .values()
        .filter(|s| **s == ReviewState::Approved)
        .count() as u32
}

/// The configured user's latest effective review state, if any.
pub fn my_review_state(reviews: &[ReviewRecord], username: &str) -> Option<ReviewState> {
    effective_review_states(reviews)
        .into_iter()
        .find(|(author, _)| author.eq_ignore_ascii_case(username))
        .map(|(_, state)| state)
}

/// Derive a [`ReviewData`] from raw review records and the head commit's
/// check rollup.
pub fn derive_review_data(
    reviews: &[ReviewRecord],
    username: &str,
    rollup_state: Option<&str>,
    ci_failed_checks: Vec<String>,
) -> ReviewData {
    ReviewData {
        approval_count: approval_count(reviews),
        my_review_status: my_review_state(reviews, username),
        ci_state: ci_from_rollup(rollup_state),
        ci_failed_checks,
    }
}

/// Map GitHub's `statusCheckRollup.state` onto [`CiState`].
pub fn ci_from_rollup(state: Option<&str>) -> CiState {
    match state {
        Some("SUCCESS") => CiState::Success,
        Some("FAILURE") | Some("ERROR") => CiState::Failure,
        Some("PENDING") | Some("EXPECTED") => CiState::Pending,
        _ => CiState::Unknown,
    }
}

/// Group identities by `owner/repo`, preserving first-seen repository order.
pub fn group_by_repo(ids: &[PrId]) -> Vec<((String, String), Vec<u64>)> {
    let mut groups: Vec<((String, String), Vec<u64>)> = Vec::new();
    for id in ids {
        let key = (id.owner.clone(), id.repo.clone());
        match groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, numbers)) => {
                if !numbers.contains(&id.number) {
                    numbers.push(id.number);
                }
            }
            None => groups.push((key, vec![id.number])),
        }
    }
    groups
}

// ── Production client ─────────────────────────────────────────────────────────

pub struct GitHubClient {
    http: reqwest::Client,
    token: String,
    username: String,
}

impl GitHubClient {
    pub fn new(token: impl Into<String>, username: impl Into<String>) -> Result<Self, RemoteError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("reviewd/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            token: token.into(),
            username: username.into(),
        })
    }

    async fn graphql(&self, query: &str) -> Result<serde_json::Value, RemoteError> {
        let resp = self
            .http
            .post(GRAPHQL_URL)
            .bearer_auth(&self.token)
            .json(&serde_json::json!({ "query": query }))
            .send()
            .await?;
        let resp = check_response(resp).await?;
        let body: serde_json::Value = resp.json().await?;
        if let Some(errors) = body.get("errors").and_then(|e| e.as_array()) {
            if !errors.is_empty() {
                return Err(RemoteError::Decode(format!("graphql errors: {errors:?}")));
            }
        }
        Ok(body)
    }

    async fn search(&self, search_query: &str) -> Result<Vec<PrSummary>, RemoteError> {
        let query = format!(
            r#"query {{
                search(query: "{search_query}", type: ISSUE, first: 100) {{
                    nodes {{
                        ... on PullRequest {{
                            number
                            title
                            createdAt
                            isDraft
                            headRefOid
                            author {{ login }}
                            repository {{ name owner {{ login }} }}
                        }}
                    }}
                }}
            }}"#
        );
        let body = self.graphql(&query).await?;
        let nodes = body
            .pointer("/data/search/nodes")
            .and_then(|n| n.as_array())
            .ok_or_else(|| RemoteError::Decode("search response missing nodes".into()))?;

        let mut summaries = Vec::new();
        for node in nodes {
            // Non-PR search hits deserialize as empty objects; skip them.
            let Ok(node) = serde_json::from_value::<SearchNode>(node.clone()) else {
                continue;
            };
            summaries.push(PrSummary {
                id: PrId::new(node.repository.owner.login, node.repository.name, node.number),
                head_sha: node.head_ref_oid.unwrap_or_default(),
                title: node.title,
                author: node.author.map(|a| a.login).unwrap_or_default(),
                created_at: node
                    .created_at
                    .as_deref()
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .map(|dt| dt.with_timezone(&Utc)),
                draft: node.is_draft,
            });
        }
        Ok(summaries)
    }

    async fn get_pull(&self, id: &PrId) -> Result<PullResponse, RemoteError> {
        let url = format!(
            "{API_BASE}/repos/{}/{}/pulls/{}",
            id.owner, id.repo, id.number
        );
        let resp = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .header("accept", "application/vnd.github+json")
            .send()
            .await?;
        let resp = check_response(resp).await?;
        Ok(resp.json().await?)
    }
}

#[async_trait]
impl PrGateway for GitHubClient {
    async fn search_review_requested(&self) -> Result<Vec<PrSummary>, RemoteError> {
        self.search(&format!(
            "is:pr is:open archived:false review-requested:{}",
            self.username
        ))
        .await
    }

    async fn search_mine(&self) -> Result<Vec<PrSummary>, RemoteError> {
        self.search(&format!(
            "is:pr is:open archived:false author:{}",
            self.username
        ))
        .await
    }

    async fn is_open(&self, id: &PrId) -> Result<bool, RemoteError> {
        let pull = self.get_pull(id).await?;
        Ok(pull.state == "open" && pull.merged_at.is_none())
    }

    async fn get_details(&self, id: &PrId) -> Result<PrDetails, RemoteError> {
        let pull = self.get_pull(id).await?;
        Ok(PrDetails {
            title: pull.title,
            author: pull.user.map(|u| u.login).unwrap_or_default(),
            head_sha: pull.head.sha,
            additions: pull.additions.unwrap_or(0),
            deletions: pull.deletions.unwrap_or(0),
            changed_files: pull.changed_files.unwrap_or(0),
            created_at: pull
                .created_at
                .as_deref()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&Utc)),
            review_count: pull.review_comments.unwrap_or(0),
            requested_reviewers: pull.requested_reviewers.len() as u64,
            draft: pull.draft,
        })
    }

    async fn repo_review_data(
        &self,
        owner: &str,
        repo: &str,
        numbers: &[u64],
    ) -> Result<HashMap<u64, ReviewData>, RemoteError> {
        if numbers.is_empty() {
            return Ok(HashMap::new());
        }

        let mut fields = String::new();
        for (i, number) in numbers.iter().enumerate() {
            fields.push_str(&format!(
                "pr{i}: pullRequest(number: {number}) {{
                    number
                    reviews(last: {REVIEW_WINDOW}) {{ nodes {{ state author {{ login }} }} }}
                    commits(last: 1) {{ nodes {{ commit {{ statusCheckRollup {{
                        state
                        contexts(last: 100) {{ nodes {{
                            __typename
                            ... on CheckRun {{ name conclusion }}
                            ... on StatusContext {{ context state }}
                        }} }}
                    }} }} }} }}
                }}\n"
            ));
        }
        let query =
            format!(r#"query {{ repository(owner: "{owner}", name: "{repo}") {{ {fields} }} }}"#);

        let body = self.graphql(&query).await?;
        let repository = body
            .pointer("/data/repository")
            .and_then(|r| r.as_object())
            .ok_or_else(|| RemoteError::Decode("review response missing repository".into()))?;

        let mut out = HashMap::new();
        for pull in repository.values() {
            let Some(number) = pull.pointer("/number").and_then(|n| n.as_u64()) else {
                continue;
            };
            let reviews: Vec<ReviewRecord> = pull
                .pointer("/reviews/nodes")
                .and_then(|n| n.as_array())
                .map(|nodes| {
                    nodes
                        .iter()
                        .map(|n| ReviewRecord {
                            author: n
                                .pointer("/author/login")
                                .and_then(|l| l.as_str())
                                .map(str::to_string),
                            state: n
                                .pointer("/state")
                                .and_then(|s| s.as_str())
                                .unwrap_or_default()
                                .to_string(),
                        })
                        .collect()
                })
                .unwrap_or_default();

            let rollup = pull.pointer("/commits/nodes/0/commit/statusCheckRollup");
            let rollup_state = rollup
                .and_then(|r| r.pointer("/state"))
                .and_then(|s| s.as_str());
            let failed_checks = rollup
                .and_then(|r| r.pointer("/contexts/nodes"))
                .and_then(|n| n.as_array())
                .map(|nodes| nodes.iter().filter_map(failed_check_name).collect())
                .unwrap_or_default();

            out.insert(
                number,
                derive_review_data(&reviews, &self.username, rollup_state, failed_checks),
            );
        }
        Ok(out)
    }

    async fn rate_limit(&self) -> Result<RateLimitInfo, RemoteError> {
        let resp = self
            .http
            .get(format!("{API_BASE}/rate_limit"))
            .bearer_auth(&self.token)
            .header("accept", "application/vnd.github+json")
            .send()
            .await?;
        let resp = check_response(resp).await?;
        let body: RateLimitResponse = resp.json().await?;
        Ok(RateLimitInfo {
            remaining: body.resources.core.remaining,
            limit: body.resources.core.limit,
            reset: Utc.timestamp_opt(body.resources.core.reset, 0).single(),
        })
    }
}

/// The name of a failed check from a `statusCheckRollup` context node, if
/// the node represents a failure. CheckRun nodes carry `name`/`conclusion`,
/// legacy StatusContext nodes carry `context`/`state`.
fn failed_check_name(node: &serde_json::Value) -> Option<String> {
    let typename = node.pointer("/__typename").and_then(|t| t.as_str());
    match typename {
        Some("CheckRun") => {
            let conclusion = node.pointer("/conclusion").and_then(|c| c.as_str());
            if matches!(conclusion, Some("FAILURE") | Some("TIMED_OUT") | Some("STARTUP_FAILURE")) {
                node.pointer("/name")
                    .and_then(|n| n.as_str())
                    .map(str::to_string)
            } else {
                None
            }
        }
        Some("StatusContext") => {
            let state = node.pointer("/state").and_then(|s| s.as_str());
            if matches!(state, Some("FAILURE") | Some("ERROR")) {
                node.pointer("/context")
                    .and_then(|c| c.as_str())
                    .map(str::to_string)
            } else {
                None
            }
        }
        _ => None,
    }
}

/// Map a failed response to the right [`RemoteError`]. A 403/429 whose
/// `x-ratelimit-remaining` header is zero is the distinguished rate-limited
/// outcome; a 404 is "PR gone".
async fn check_response(resp: reqwest::Response) -> Result<reqwest::Response, RemoteError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    if status.as_u16() == 404 {
        return Err(RemoteError::NotFound);
    }
    if status.as_u16() == 403 || status.as_u16() == 429 {
        let remaining = resp
            .headers()
            .get("x-ratelimit-remaining")
            .and_then(|v| v.to_str().ok());
        if remaining == Some("0") {
            let reset = resp
                .headers()
                .get("x-ratelimit-reset")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<i64>().ok())
                .and_then(|epoch| Utc.timestamp_opt(epoch, 0).single());
            return Err(RemoteError::RateLimited { reset });
        }
    }
    let body = resp.text().await.unwrap_or_default();
    Err(RemoteError::Status {
        code: status.as_u16(),
        body,
    })
}

// ── Wire types ────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct SearchNode {
    number: u64,
    title: String,
    #[serde(rename = "createdAt")]
    created_at: Option<String>,
    #[serde(rename = "isDraft", default)]
    is_draft: bool,
    #[serde(rename = "headRefOid")]
    head_ref_oid: Option<String>,
    author: Option<Login>,
    repository: SearchRepo,
}

#[derive(Debug, Deserialize)]
struct SearchRepo {
    name: String,
    owner: Login,
}

#[derive(Debug, Deserialize)]
struct Login {
    login: String,
}

#[derive(Debug, Deserialize)]
struct PullResponse {
    title: String,
    state: String,
    merged_at: Option<String>,
    user: Option<Login>,
    head: PullHead,
    #[serde(default)]
    draft: bool,
    additions: Option<u64>,
    deletions: Option<u64>,
    changed_files: Option<u64>,
    created_at: Option<String>,
    review_comments: Option<u64>,
    #[serde(default)]
    requested_reviewers: Vec<Login>,
}

#[derive(Debug, Deserialize)]
struct PullHead {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct RateLimitResponse {
    resources: RateLimitResources,
}

#[derive(Debug, Deserialize)]
struct RateLimitResources {
    core: RateLimitCore,
}

#[derive(Debug, Deserialize)]
struct RateLimitCore {
    limit: u64,
    remaining: u64,
    reset: i64,
}
