//! Runtime configuration for the reviewd daemon.
//!
//! Everything comes from the environment:
//!
//! ```text
//! Variable                    Required  Default
//! ──────────────────────────  ────────  ─────────────────────
//! GITHUB_TOKEN                yes       —
//! GITHUB_USERNAME             yes       —
//! POLLING_INTERVAL            no        1m
//! SERVER_PORT                 no        8080
//! DB_PATH                     no        ./data/pr-review.db
//! REVIEWS_DIR                 no        ./reviews
//! CBPR_PATH                   no        cbpr
//! DEV_MODE                    no        false
//! ENABLE_VOICE_NOTIFICATIONS  no        false
//! ```
//!
//! Missing credentials are a startup error; everything else falls back to
//! its default.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};

#[derive(Debug, Clone)]
pub struct Config {
    /// Bearer token for the GitHub API (`GITHUB_TOKEN`).
    pub github_token: String,
    /// Login that defines "mine" and "my review status" (`GITHUB_USERNAME`).
    pub github_username: String,
    /// Reconciler tick period (`POLLING_INTERVAL`; default 1 minute).
    pub polling_interval: Duration,
    /// TCP port for the HTTP surface (`SERVER_PORT`; default 8080).
    pub server_port: u16,
    /// SQLite database path (`DB_PATH`).
    pub db_path: PathBuf,
    /// Directory review artifacts are written to (`REVIEWS_DIR`).
    pub reviews_dir: PathBuf,
    /// Path to the review generator executable (`CBPR_PATH`; default `cbpr`).
    pub generator_path: PathBuf,
    /// When set, the HTTP surface omits the embedded static bundle (`DEV_MODE`).
    pub dev_mode: bool,
    /// Orthogonal voice notifier toggle (`ENABLE_VOICE_NOTIFICATIONS`).
    pub voice_notifications: bool,
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_env_with(|k| env::var(k).ok())
    }

    fn from_env_with(get_env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let github_token = match get_env("GITHUB_TOKEN").filter(|s| !s.is_empty()) {
            Some(t) => t,
            None => bail!("GITHUB_TOKEN is not set"),
        };
        let github_username = match get_env("GITHUB_USERNAME").filter(|s| !s.is_empty()) {
            Some(u) => u,
            None => bail!("GITHUB_USERNAME is not set"),
        };

        let polling_interval = match get_env("POLLING_INTERVAL") {
            Some(v) => parse_duration(&v)
                .ok_or_else(|| anyhow::anyhow!("POLLING_INTERVAL is not a duration: {v:?}"))?,
            None => Duration::from_secs(60),
        };

        let server_port = match get_env("SERVER_PORT") {
            Some(v) => v
                .parse::<u16>()
                .map_err(|_| anyhow::anyhow!("SERVER_PORT is not a port: {v:?}"))?,
            None => 8080,
        };

        let db_path = get_env("DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data/pr-review.db"));
        let reviews_dir = get_env("REVIEWS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./reviews"));
        let generator_path = get_env("CBPR_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("cbpr"));

        Ok(Self {
            github_token,
            github_username,
            polling_interval,
            server_port,
            db_path,
            reviews_dir,
            generator_path,
            dev_mode: parse_bool(get_env("DEV_MODE").as_deref()),
            voice_notifications: parse_bool(get_env("ENABLE_VOICE_NOTIFICATIONS").as_deref()),
        })
    }
}

/// Parse a duration string: `"90"` (seconds), `"90s"`, `"5m"`, `"2h"`.
fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    let (num, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => s.split_at(idx),
        None => (s, "s"),
    };
    let n: u64 = num.parse().ok()?;
    match unit.trim() {
        "s" => Some(Duration::from_secs(n)),
        "m" => Some(Duration::from_secs(n * 60)),
        "h" => Some(Duration::from_secs(n * 3600)),
        _ => None,
    }
}

fn parse_bool(v: Option<&str>) -> bool {
    matches!(v, Some("1") | Some("true") | Some("yes"))
}
