//! reviewd — GitHub PR review dashboard daemon.
//!
//! Startup order matters: configuration and the store must be good before
//! any background task spawns; a failure in either exits non-zero. After
//! that, the reconciler, the executor watchdog, the prioritizer, and the
//! HTTP surface run until ctrl-c, which cancels the root token; HTTP shuts
//! down last after in-flight generator tasks are terminated.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use reviewd_core::config::Config;
use reviewd_core::executor::ReviewExecutor;
use reviewd_core::github::GitHubClient;
use reviewd_core::poller::Poller;
use reviewd_core::priority;
use reviewd_core::server::{self, ApiState};
use reviewd_core::state::SharedState;
use reviewd_core::store::Store;

#[derive(Parser)]
#[command(
    name = "reviewd",
    version,
    about = "Keeps a local dashboard of GitHub PRs needing your review and generates review artifacts for them"
)]
struct Args {}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let Args {} = Args::parse();

    if let Err(e) = run().await {
        eprintln!("reviewd: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let config = Config::from_env().context("configuration")?;

    if !generator_available(&config.generator_path) {
        warn!(generator = %config.generator_path.display(), "review generator not found; generation will fail until it appears");
    }

    let store = Arc::new(Store::open(&config.db_path).context("opening store")?);
    let gateway = Arc::new(
        GitHubClient::new(config.github_token.clone(), config.github_username.clone())
            .context("building github client")?,
    );
    let executor = Arc::new(ReviewExecutor::new(
        config.generator_path.clone(),
        config.reviews_dir.clone(),
    ));
    let shared = Arc::new(SharedState::new(config.polling_interval));

    let (poller, trigger) = Poller::new(
        store.clone(),
        gateway.clone(),
        executor.clone(),
        shared.clone(),
        config.github_username.clone(),
        config.reviews_dir.clone(),
        config.polling_interval,
    );

    let cancel = CancellationToken::new();

    // Startup priority report, then the 30-minute recompute loop.
    match store.list_all() {
        Ok(rows) => {
            *shared.priority.write().await = Some(priority::compute_report(&rows, chrono::Utc::now()));
        }
        Err(e) => warn!(error = %e, "startup priority report failed"),
    }
    let prioritizer = tokio::spawn(priority::run_prioritizer(
        store.clone(),
        shared.clone(),
        cancel.clone(),
    ));

    let watchdog = tokio::spawn(executor.clone().watchdog(cancel.clone()));
    let reconciler = tokio::spawn(poller.run(cancel.clone()));

    let api_state = Arc::new(ApiState {
        store,
        shared,
        executor: executor.clone(),
        gateway,
        trigger,
        reviews_dir: config.reviews_dir.clone(),
        dev_mode: config.dev_mode,
    });
    if config.voice_notifications {
        info!("voice notifications enabled; notifier runs outside the core");
    }

    let http_cancel = cancel.clone();
    let http = tokio::spawn(server::serve(api_state, config.server_port, http_cancel));

    info!(
        interval_s = config.polling_interval.as_secs(),
        port = config.server_port,
        db = %config.db_path.display(),
        reviews = %config.reviews_dir.display(),
        "reviewd started"
    );

    tokio::signal::ctrl_c().await.context("signal handler")?;
    info!("shutdown signal received");
    cancel.cancel();

    // Reconciler terminates live generator tasks on its way out; HTTP drains
    // last.
    let _ = reconciler.await;
    let _ = watchdog.await;
    let _ = prioritizer.await;
    match http.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(e).context("http surface"),
        Err(e) => warn!(error = %e, "http task join failed"),
    }

    info!("reviewd stopped");
    Ok(())
}

/// Whether the generator is reachable: a path is checked directly, a bare
/// command name is looked up on PATH.
fn generator_available(generator: &Path) -> bool {
    if generator.components().count() > 1 || generator.is_absolute() {
        return generator.exists();
    }
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(generator).exists()))
        .unwrap_or(false)
}
