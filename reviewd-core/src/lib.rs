//! Core library for reviewd — a daemon that mirrors the GitHub pull requests
//! the configured user needs to care about, drives an external review
//! generator per (PR, head commit), and serves the results over HTTP.
//!
//! Domain model:
//!   - `status`    — lifecycle enums (`PrStatus`, `ReviewState`, `CiState`)
//!   - `pr`        — `PrId` identity and the `TrackedPr` entity
//!   - `config`    — environment-driven runtime configuration
//!
//! Components:
//!   - `store`     — SQLite persistence and invariant-carrying transitions
//!   - `github`    — remote gateway port + GitHub REST/GraphQL client
//!   - `executor`  — review-generator subprocess orchestration
//!   - `poller`    — the reconciliation loop and its per-tick pipeline
//!   - `priority`  — scoring over the tracked snapshot
//!   - `server`    — axum HTTP surface
//!   - `state`     — snapshots shared between the tasks above

pub mod assets;
pub mod config;
pub mod executor;
pub mod github;
pub mod poller;
pub mod pr;
pub mod priority;
pub mod server;
pub mod state;
pub mod status;
pub mod store;

#[cfg(test)]
pub mod testing;

pub use config::Config;
pub use pr::{PrId, PrSummary, TrackedPr};
pub use status::{CiState, PrStatus, ReviewState};
pub use store::Store;
