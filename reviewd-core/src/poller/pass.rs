//! One reconciliation pass: the fixed pipeline a tick executes.
//!
//! Ordering matters. Healing (stale in-flight rows, aged-out errors) and
//! invalidation (closed PRs, moved head commits) run before any remote
//! fan-out, so that even when the searches fail the already-tracked rows are
//! kept honest. Every step tolerates step-local failure without aborting the
//! rest of the pass.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};

use crate::executor::ReviewExecutor;
use crate::github::{group_by_repo, PrGateway, RemoteError};
use crate::pr::{PrId, PrSummary, TrackedPr};
use crate::state::SharedState;
use crate::status::PrStatus;
use crate::store::Store;
use tokio_util::sync::CancellationToken;

/// Rows generating longer than this are presumed orphaned by a crash. Well
/// above the generator's expected runtime, well under the executor's hard
/// watchdog.
pub const STALE_GENERATING: Duration = Duration::from_secs(2 * 60);
/// Error rows re-enter the pipeline this long after failing.
pub const ERROR_RETRY_AGE: Duration = Duration::from_secs(5 * 60);

pub struct PassDeps<'a> {
    pub store: &'a Store,
    pub gateway: &'a dyn PrGateway,
    pub executor: &'a ReviewExecutor,
    pub shared: &'a SharedState,
    pub username: &'a str,
    pub reviews_dir: &'a Path,
    pub cancel: &'a CancellationToken,
}

/// What one pass did, for the log line and for tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassReport {
    pub healed_stale: usize,
    pub retried_errors: usize,
    pub removed_closed: usize,
    pub backfilled: usize,
    pub invalidated: usize,
    pub discovered: usize,
    pub review_updates: usize,
    pub scheduled: usize,
}

pub async fn run_pass(deps: PassDeps<'_>) -> PassReport {
    let mut report = PassReport::default();
    let now = Utc::now();

    // 1. Heal stale in-flight rows.
    match deps.store.reset_stale_generating(STALE_GENERATING, now) {
        Ok(n) => report.healed_stale = n,
        Err(e) => warn!(error = %e, "stale-generating heal failed"),
    }

    // 2. Retry aged-out errors.
    match deps.store.reset_error(ERROR_RETRY_AGE, now) {
        Ok(n) => report.retried_errors = n,
        Err(e) => warn!(error = %e, "error retry reset failed"),
    }

    // Snapshot of the rows this pass will advance. Taken after healing so
    // freshly healed rows are scheduled this very tick; PRs discovered later
    // in the pass wait for the next one.
    let known = match deps.store.list_all() {
        Ok(rows) => rows,
        Err(e) => {
            warn!(error = %e, "could not list tracked PRs; aborting pass");
            return report;
        }
    };

    // 3. Remote closure sweep.
    for row in &known {
        if deps.cancel.is_cancelled() {
            return report;
        }
        match deps.gateway.is_open(&row.id).await {
            Ok(true) => {}
            Ok(false) | Err(RemoteError::NotFound) => {
                remove_artifact(deps.reviews_dir, row.artifact_path.as_deref());
                match deps.store.delete(&row.id) {
                    Ok(_) => {
                        debug!(pr = %row.id, "removed closed PR");
                        report.removed_closed += 1;
                    }
                    Err(e) => warn!(pr = %row.id, error = %e, "failed to remove closed PR"),
                }
            }
            Err(e) => warn!(pr = %row.id, error = %e, "open-check failed; keeping row"),
        }
    }

    // 4. Metadata backfill (title/author, plus missing creation dates).
    let meta_ids = deps.store.missing_metadata().unwrap_or_default();
    let created_ids = deps.store.missing_created_at().unwrap_or_default();
    let backfill: Vec<PrId> = {
        let mut seen = HashSet::new();
        meta_ids
            .iter()
            .chain(created_ids.iter())
            .filter(|id| seen.insert((*id).clone()))
            .cloned()
            .collect()
    };
    for id in &backfill {
        if deps.cancel.is_cancelled() {
            return report;
        }
        match deps.gateway.get_details(id).await {
            Ok(details) => {
                if meta_ids.contains(id) {
                    if let Err(e) = deps.store.update_metadata(id, &details.title, &details.author)
                    {
                        warn!(pr = %id, error = %e, "metadata backfill write failed");
                        continue;
                    }
                }
                if created_ids.contains(id) {
                    if let Some(created) = details.created_at {
                        if let Err(e) = deps.store.update_created_at(id, created) {
                            warn!(pr = %id, error = %e, "created-at backfill write failed");
                            continue;
                        }
                    }
                }
                report.backfilled += 1;
            }
            Err(e) => warn!(pr = %id, error = %e, "metadata backfill fetch failed"),
        }
    }

    // 5. Outdated-artifact detection. Runs before the searches so that even
    // when remote search fails, tracked PRs with new commits are invalidated.
    for row in &known {
        if deps.cancel.is_cancelled() {
            return report;
        }
        if !matches!(row.status, PrStatus::Completed | PrStatus::Generating) {
            continue;
        }
        let current = match deps.gateway.get_details(&row.id).await {
            Ok(details) => details.head_sha,
            Err(RemoteError::NotFound) => continue, // closure sweep's business
            Err(e) => {
                warn!(pr = %row.id, error = %e, "head-sha check failed");
                continue;
            }
        };
        if current.is_empty() || current == row.head_sha {
            continue;
        }
        if row.status == PrStatus::Generating {
            deps.executor.cancel(&row.id);
        }
        remove_artifact(deps.reviews_dir, row.artifact_path.as_deref());
        match deps.store.reset_to_outdated(&row.id, &current) {
            Ok(()) => {
                debug!(pr = %row.id, old = %row.head_sha, new = %current, "artifact invalidated");
                report.invalidated += 1;
            }
            Err(e) => warn!(pr = %row.id, error = %e, "outdated reset failed"),
        }
    }

    // A completed row whose artifact file vanished self-heals back to
    // pending, keeping its head sha. Re-read the row — the outdated check
    // above may have already reset it.
    for row in &known {
        if row.status != PrStatus::Completed {
            continue;
        }
        let Ok(Some(current)) = deps.store.get(&row.id) else {
            continue;
        };
        if current.status != PrStatus::Completed {
            continue;
        }
        let Some(artifact) = current.artifact_path.as_deref() else {
            continue;
        };
        if !deps.reviews_dir.join(artifact).exists() {
            warn!(pr = %current.id, artifact, "artifact file missing; re-queueing");
            if let Err(e) = deps.store.reset_to_outdated(&current.id, &current.head_sha) {
                warn!(pr = %current.id, error = %e, "missing-artifact reset failed");
            }
        }
    }

    // 6. Remote fan-out: both searches. Failures leave the pass operating on
    // the store's view.
    let mut summaries: Vec<PrSummary> = Vec::new();
    match deps.gateway.search_review_requested().await {
        Ok(mut found) => summaries.append(&mut found),
        Err(e) => warn!(error = %e, "review-requested search failed"),
    }
    match deps.gateway.search_mine().await {
        Ok(mut found) => summaries.append(&mut found),
        Err(e) => warn!(error = %e, "authored search failed"),
    }

    // 7. Upsert discovered PRs and refresh the cache snapshot.
    let mut summary_ids = HashSet::new();
    for summary in &summaries {
        if !summary_ids.insert(summary.id.clone()) {
            continue;
        }
        let is_mine = summary.author.eq_ignore_ascii_case(deps.username);
        match deps.store.upsert_summary(summary, is_mine) {
            Ok(()) => report.discovered += 1,
            Err(e) => warn!(pr = %summary.id, error = %e, "summary upsert failed"),
        }
    }
    {
        let mut cache = deps.shared.pr_cache.write().await;
        *cache = summaries.clone();
    }

    // Union: everything the searches surfaced plus everything already
    // tracked, so PRs the remote no longer surfaces are still refreshed.
    let union_ids: Vec<PrId> = {
        let mut ids: Vec<PrId> = known.iter().map(|r| r.id.clone()).collect();
        ids.retain(|id| !summary_ids.contains(id));
        ids.extend(summary_ids.iter().cloned());
        ids
    };

    // 8. Batched review data, one query per repository. A rate-limited
    // repository keeps its existing values.
    let fresh_draft: std::collections::HashMap<PrId, bool> = summaries
        .iter()
        .map(|s| (s.id.clone(), s.draft))
        .collect();
    for ((owner, repo), numbers) in group_by_repo(&union_ids) {
        if deps.cancel.is_cancelled() {
            return report;
        }
        match deps.gateway.repo_review_data(&owner, &repo, &numbers).await {
            Ok(data) => {
                for (number, review) in data {
                    let id = PrId::new(owner.clone(), repo.clone(), number);
                    let Ok(Some(row)) = deps.store.get(&id) else {
                        continue;
                    };
                    let draft = fresh_draft.get(&id).copied().unwrap_or(row.draft);
                    match deps.store.update_review_data(
                        &id,
                        review.approval_count,
                        review.my_review_status,
                        draft,
                    ) {
                        Ok(()) => report.review_updates += 1,
                        Err(e) => warn!(pr = %id, error = %e, "review-data write failed"),
                    }
                    if let Err(e) =
                        deps.store
                            .update_ci(&id, review.ci_state, &review.ci_failed_checks)
                    {
                        warn!(pr = %id, error = %e, "ci write failed");
                    }
                }
            }
            Err(e) if e.is_rate_limited() => {
                warn!(repo = %format!("{owner}/{repo}"), "review query rate limited; keeping cached values");
            }
            Err(e) => warn!(repo = %format!("{owner}/{repo}"), error = %e, "review query failed"),
        }
    }

    // 9. Task selection: rows that were pending in this pass's snapshot and
    // still are, grouped by repository, sub-batched by the executor. Rows
    // discovered or invalidated during this pass wait for the next tick.
    let mut to_generate: Vec<TrackedPr> = Vec::new();
    for row in &known {
        if row.status != PrStatus::Pending {
            continue;
        }
        match deps.store.get(&row.id) {
            Ok(Some(current)) if current.status == PrStatus::Pending => to_generate.push(current),
            _ => {}
        }
    }
    for ((owner, repo), numbers) in group_by_repo(
        &to_generate.iter().map(|r| r.id.clone()).collect::<Vec<_>>(),
    ) {
        let group: Vec<TrackedPr> = to_generate
            .iter()
            .filter(|r| {
                r.id.owner == owner && r.id.repo == repo && numbers.contains(&r.id.number)
            })
            .cloned()
            .collect();
        report.scheduled += group.len();
        if let Err(e) = deps.executor.run_batch(deps.store, &group, deps.cancel).await {
            warn!(error = %e, "review batch failed");
        }
        if deps.cancel.is_cancelled() {
            return report;
        }
    }

    report
}

fn remove_artifact(reviews_dir: &Path, artifact: Option<&str>) {
    if let Some(artifact) = artifact {
        let path = reviews_dir.join(artifact);
        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "artifact removal failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ReviewExecutor;
    use crate::state::SharedState;
    use crate::status::ReviewState;
    use crate::testing::{details, summary, MockGateway};
    use crate::github::ReviewData;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;
    use std::sync::Arc;
    use tempfile::TempDir;

    const OK_GENERATOR: &str = r#"#!/bin/sh
for a in "$@"; do
  case "$a" in
    --output=*) out="${a#--output=}" ;;
  esac
done
echo "<html>review</html>" > "$out"
"#;

    const SLOW_GENERATOR: &str = "#!/bin/sh\nsleep 5\n";

    struct Fixture {
        dir: TempDir,
        store: Arc<Store>,
        gateway: Arc<MockGateway>,
        executor: Arc<ReviewExecutor>,
        shared: Arc<SharedState>,
    }

    impl Fixture {
        fn new(script: &str) -> Self {
            let dir = TempDir::new().unwrap();
            let gen_path = dir.path().join("generator.sh");
            std::fs::write(&gen_path, script).unwrap();
            let mut perms = std::fs::metadata(&gen_path).unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&gen_path, perms).unwrap();

            Self {
                store: Arc::new(Store::open_in_memory().unwrap()),
                gateway: Arc::new(MockGateway::new()),
                executor: Arc::new(ReviewExecutor::new(gen_path, dir.path().join("reviews"))),
                shared: Arc::new(SharedState::new(Duration::from_secs(60))),
                dir,
            }
        }

        fn reviews_dir(&self) -> PathBuf {
            self.dir.path().join("reviews")
        }

        async fn pass(&self) -> PassReport {
            let cancel = CancellationToken::new();
            run_pass(PassDeps {
                store: &self.store,
                gateway: self.gateway.as_ref(),
                executor: &self.executor,
                shared: &self.shared,
                username: "me",
                reviews_dir: &self.reviews_dir(),
                cancel: &cancel,
            })
            .await
        }
    }

    fn id(number: u64) -> PrId {
        PrId::new("acme", "foo", number)
    }

    #[tokio::test]
    async fn new_pr_is_discovered_then_generated_on_the_next_tick() {
        let f = Fixture::new(OK_GENERATOR);
        f.gateway
            .review_requested
            .lock()
            .unwrap()
            .push(summary("acme", "foo", 7, "sha-a"));
        f.gateway.set_details(&id(7), details("sha-a"));

        // Tick one: discovery only.
        let report = f.pass().await;
        assert_eq!(report.discovered, 1);
        assert_eq!(report.scheduled, 0);
        let row = f.store.get(&id(7)).unwrap().unwrap();
        assert_eq!(row.status, PrStatus::Pending);
        assert_eq!(row.head_sha, "sha-a");
        assert!(!f.reviews_dir().join("acme_foo_7.html").exists());

        // Tick two: generation.
        let report = f.pass().await;
        assert_eq!(report.scheduled, 1);
        let row = f.store.get(&id(7)).unwrap().unwrap();
        assert_eq!(row.status, PrStatus::Completed);
        assert_eq!(row.artifact_path.as_deref(), Some("acme_foo_7.html"));
        assert!(row.last_reviewed_at.is_some());
        assert!(f.reviews_dir().join("acme_foo_7.html").exists());
    }

    #[tokio::test]
    async fn mid_flight_invalidation_cancels_and_resets() {
        let f = Fixture::new(SLOW_GENERATOR);
        f.store
            .upsert_summary(&summary("acme", "foo", 7, "sha-a"), false)
            .unwrap();
        let pr = f.store.get(&id(7)).unwrap().unwrap();

        // A generator task is live for sha-a.
        let handle = {
            let executor = f.executor.clone();
            let store = f.store.clone();
            let pr = pr.clone();
            tokio::spawn(async move {
                executor.run(&store, &pr, &CancellationToken::new()).await
            })
        };
        while !f.executor.is_running(&id(7)) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // The remote now reports a newer head commit.
        f.gateway.set_details(&id(7), details("sha-b"));

        let report = f.pass().await;
        assert_eq!(report.invalidated, 1);
        assert_eq!(report.scheduled, 0);

        let row = f.store.get(&id(7)).unwrap().unwrap();
        assert_eq!(row.status, PrStatus::Pending);
        assert_eq!(row.head_sha, "sha-b");
        assert!(row.artifact_path.is_none());
        assert!(!f.executor.is_running(&id(7)));

        let outcome = handle.await.unwrap().unwrap();
        assert!(
            matches!(
                outcome,
                crate::executor::RunOutcome::Invalidated | crate::executor::RunOutcome::Failed
            ),
            "unexpected outcome {outcome:?}"
        );
        // Regardless of how the kill raced the reset, no completed row for
        // sha-a can exist.
        let row = f.store.get(&id(7)).unwrap().unwrap();
        assert_ne!(row.status, PrStatus::Completed);
        assert_eq!(row.head_sha, "sha-b");
    }

    #[tokio::test]
    async fn stale_generating_row_is_healed_and_regenerated_same_tick() {
        let f = Fixture::new(OK_GENERATOR);
        f.store
            .upsert_summary(&summary("acme", "foo", 7, "sha-a"), false)
            .unwrap();
        let mut pr = f.store.get(&id(7)).unwrap().unwrap();
        pr.status = PrStatus::Generating;
        pr.generating_since = Some(Utc::now() - chrono::Duration::minutes(3));
        f.store.upsert(&pr).unwrap();
        f.gateway.set_details(&id(7), details("sha-a"));

        let report = f.pass().await;
        assert_eq!(report.healed_stale, 1);
        assert_eq!(report.scheduled, 1);
        let row = f.store.get(&id(7)).unwrap().unwrap();
        assert_eq!(row.status, PrStatus::Completed);
    }

    #[tokio::test]
    async fn closed_pr_is_removed_with_its_artifact() {
        let f = Fixture::new(OK_GENERATOR);
        f.store
            .upsert_summary(&summary("acme", "foo", 7, "sha-a"), false)
            .unwrap();
        let pr = f.store.get(&id(7)).unwrap().unwrap();
        f.store.set_generating(&pr, Utc::now()).unwrap();
        f.store
            .complete_if_current(&id(7), "sha-a", "acme_foo_7.html", Utc::now())
            .unwrap();
        std::fs::create_dir_all(f.reviews_dir()).unwrap();
        std::fs::write(f.reviews_dir().join("acme_foo_7.html"), "<html>").unwrap();

        f.gateway.set_open(&id(7), false);

        let report = f.pass().await;
        assert_eq!(report.removed_closed, 1);
        assert!(f.store.get(&id(7)).unwrap().is_none());
        assert!(!f.reviews_dir().join("acme_foo_7.html").exists());
    }

    #[tokio::test]
    async fn rate_limited_repo_keeps_cached_review_values() {
        let f = Fixture::new(OK_GENERATOR);
        let foo = PrId::new("acme", "foo", 1);
        let bar = PrId::new("acme", "bar", 2);
        f.store
            .upsert_summary(&summary("acme", "foo", 1, "a"), false)
            .unwrap();
        f.store
            .upsert_summary(&summary("acme", "bar", 2, "b"), false)
            .unwrap();
        f.store
            .update_review_data(&foo, 1, Some(ReviewState::Commented), false)
            .unwrap();
        f.store
            .update_review_data(&bar, 1, Some(ReviewState::Commented), false)
            .unwrap();

        f.gateway.set_details(&foo, details("a"));
        f.gateway.set_details(&bar, details("b"));
        f.gateway.set_review_data(
            &foo,
            ReviewData {
                approval_count: 5,
                my_review_status: Some(ReviewState::Approved),
                ..ReviewData::default()
            },
        );
        f.gateway.set_review_data(
            &bar,
            ReviewData {
                approval_count: 5,
                my_review_status: Some(ReviewState::Approved),
                ci_state: crate::status::CiState::Failure,
                ci_failed_checks: vec!["build".to_string()],
            },
        );
        f.gateway.rate_limit_repo("acme", "foo");

        f.pass().await;

        let foo_row = f.store.get(&foo).unwrap().unwrap();
        assert_eq!(foo_row.approval_count, 1);
        assert_eq!(foo_row.my_review_status, Some(ReviewState::Commented));

        let bar_row = f.store.get(&bar).unwrap().unwrap();
        assert_eq!(bar_row.approval_count, 5);
        assert_eq!(bar_row.my_review_status, Some(ReviewState::Approved));
        assert_eq!(bar_row.ci_state, crate::status::CiState::Failure);
        assert_eq!(bar_row.ci_failed_checks, vec!["build"]);
    }

    #[tokio::test]
    async fn search_failure_does_not_stop_invalidation() {
        let f = Fixture::new(OK_GENERATOR);
        f.store
            .upsert_summary(&summary("acme", "foo", 7, "sha-a"), false)
            .unwrap();
        let pr = f.store.get(&id(7)).unwrap().unwrap();
        f.store.set_generating(&pr, Utc::now()).unwrap();
        f.store
            .complete_if_current(&id(7), "sha-a", "acme_foo_7.html", Utc::now())
            .unwrap();
        std::fs::create_dir_all(f.reviews_dir()).unwrap();
        std::fs::write(f.reviews_dir().join("acme_foo_7.html"), "<html>").unwrap();

        *f.gateway.search_fails.lock().unwrap() = true;
        f.gateway.set_details(&id(7), details("sha-b"));

        let report = f.pass().await;
        assert_eq!(report.invalidated, 1);
        let row = f.store.get(&id(7)).unwrap().unwrap();
        assert_eq!(row.status, PrStatus::Pending);
        assert_eq!(row.head_sha, "sha-b");
    }

    #[tokio::test]
    async fn completed_row_with_missing_artifact_file_self_heals() {
        let f = Fixture::new(OK_GENERATOR);
        f.store
            .upsert_summary(&summary("acme", "foo", 7, "sha-a"), false)
            .unwrap();
        let pr = f.store.get(&id(7)).unwrap().unwrap();
        f.store.set_generating(&pr, Utc::now()).unwrap();
        f.store
            .complete_if_current(&id(7), "sha-a", "acme_foo_7.html", Utc::now())
            .unwrap();
        // No file on disk.
        f.gateway.set_details(&id(7), details("sha-a"));

        f.pass().await;
        let row = f.store.get(&id(7)).unwrap().unwrap();
        assert_eq!(row.status, PrStatus::Pending);
        assert_eq!(row.head_sha, "sha-a");
    }

    #[tokio::test]
    async fn quiescent_pass_changes_nothing() {
        let f = Fixture::new(OK_GENERATOR);
        f.gateway
            .review_requested
            .lock()
            .unwrap()
            .push(summary("acme", "foo", 7, "sha-a"));
        f.gateway.set_details(&id(7), details("sha-a"));

        f.pass().await;
        f.pass().await;
        let before = f.store.list_all().unwrap();

        let report = f.pass().await;
        assert_eq!(report.healed_stale, 0);
        assert_eq!(report.removed_closed, 0);
        assert_eq!(report.invalidated, 0);
        assert_eq!(report.scheduled, 0);
        assert_eq!(f.store.list_all().unwrap(), before);
    }

    #[tokio::test]
    async fn metadata_backfill_fills_blank_rows() {
        let f = Fixture::new(OK_GENERATOR);
        let mut blank = summary("acme", "foo", 7, "sha-a");
        blank.title = String::new();
        blank.author = String::new();
        blank.created_at = None;
        f.store.upsert_summary(&blank, false).unwrap();

        let mut d = details("sha-a");
        d.title = "Backfilled title".into();
        d.author = "bob".into();
        f.gateway.set_details(&id(7), d);

        let report = f.pass().await;
        assert_eq!(report.backfilled, 1);
        let row = f.store.get(&id(7)).unwrap().unwrap();
        assert_eq!(row.title, "Backfilled title");
        assert_eq!(row.author, "bob");
        assert!(row.created_at.is_some());
    }

    #[tokio::test]
    async fn authored_prs_are_marked_mine() {
        let f = Fixture::new(OK_GENERATOR);
        let mut s = summary("acme", "foo", 9, "sha-a");
        s.author = "me".into();
        f.gateway.mine.lock().unwrap().push(s);
        f.gateway.set_details(&id(9), details("sha-a"));

        f.pass().await;
        let row = f.store.get(&id(9)).unwrap().unwrap();
        assert!(row.is_mine);
    }

    #[tokio::test]
    async fn pr_cache_snapshot_replaced_per_pass() {
        let f = Fixture::new(OK_GENERATOR);
        f.gateway
            .review_requested
            .lock()
            .unwrap()
            .push(summary("acme", "foo", 7, "sha-a"));
        f.gateway.set_details(&id(7), details("sha-a"));

        f.pass().await;
        assert_eq!(f.shared.pr_cache.read().await.len(), 1);

        f.gateway.review_requested.lock().unwrap().clear();
        f.pass().await;
        assert!(f.shared.pr_cache.read().await.is_empty());
    }
}
