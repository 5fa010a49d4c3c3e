//! End-to-end runner scenarios against mocked ports.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use gh_publish_core::cancel::{cancel_pair, CancelSignal};
use gh_publish_core::config::{PipelineConfig, VerifyConfig};
use gh_publish_core::contract::{
    ChangeKind, ChangeSet, FileChange, MockMessageEnhancer, MockRemotePort, MockVcsPort,
    PushMode, PushResult, Selection, VcsPort,
};
use gh_publish_core::error::PublishError;
use gh_publish_core::events::{EventOutcome, ProgressEvent, ProgressSink};
use gh_publish_core::push::PushStage;
use gh_publish_core::retry::{RetryConfig, RetryPolicy};
use gh_publish_core::run::{PipelineRun, PublishRequest, RunOutcome, Stage};
use gh_publish_core::runner::PipelineRunner;
use gh_publish_core::store::{MemoryRunStore, RunStore};
use gh_publish_core::verify::VerifyStage;
use mockall::predicate::*;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Instant;

const REPO: &str = "/work/site";
const COMMIT: &str = "c0ffee0000000000000000000000000000000001";

/// Remote `refs/heads/main` as seen by the mocked host.
type RemoteRef = Arc<Mutex<Option<String>>>;

fn config() -> PipelineConfig {
    PipelineConfig {
        verify: VerifyConfig {
            poll_interval_ms: 1_000,
            timeout_ms: 5_000,
        },
        ..PipelineConfig::default()
    }
}

fn request() -> PublishRequest {
    PublishRequest::new(REPO, "octo/site").with_message("docs: update")
}

fn dirty_tree() -> ChangeSet {
    ChangeSet::new(vec![
        FileChange::new("index.md", ChangeKind::Modified),
        FileChange::new("about.md", ChangeKind::Added),
        FileChange::new("old.md", ChangeKind::Deleted),
    ])
}

/// VCS that scans `dirty_tree`, commits `COMMIT`, and reports it as the tip.
fn committing_vcs() -> MockVcsPort {
    let mut vcs = MockVcsPort::new();
    vcs.expect_status().returning(|_| Ok(dirty_tree()));
    vcs.expect_current_branch()
        .returning(|_| Ok("main".to_string()));
    vcs.expect_stage().returning(|_, _| Ok(()));
    vcs.expect_commit()
        .returning(|_, _, _, _| Ok(COMMIT.to_string()));
    vcs.expect_current_branch_tip()
        .returning(|_| Ok(COMMIT.to_string()));
    vcs
}

fn remote_reading(remote_ref: &RemoteRef) -> MockRemotePort {
    let mut remote = MockRemotePort::new();
    let state = remote_ref.clone();
    remote
        .expect_get_ref_hash()
        .with(eq("octo/site"), eq("main"))
        .returning(move |_, _| Ok(state.lock().unwrap().clone()));
    remote
}

fn landed(remote_ref: &RemoteRef, remote: &str, branch: &str) -> PushResult {
    *remote_ref.lock().unwrap() = Some(COMMIT.to_string());
    PushResult {
        local_commit_hash: COMMIT.to_string(),
        branch: branch.to_string(),
        remote_name: remote.to_string(),
        already_published: false,
    }
}

fn runner(
    vcs: MockVcsPort,
    remote: MockRemotePort,
    store: Arc<MemoryRunStore>,
) -> (PipelineRunner, UnboundedReceiver<ProgressEvent>) {
    let (sink, rx) = ProgressSink::channel();
    let runner = PipelineRunner::new(Arc::new(vcs), Arc::new(remote), store, config())
        .with_progress(sink)
        .with_retry_policy(RetryPolicy::with_fixed_jitter(RetryConfig::default(), 0.0));
    (runner, rx)
}

fn drain(rx: &mut UnboundedReceiver<ProgressEvent>) -> Vec<ProgressEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn attempts_at(events: &[ProgressEvent], stage: Stage) -> usize {
    events
        .iter()
        .filter(|e| e.stage == stage && e.outcome == EventOutcome::Attempt)
        .count()
}

#[tokio::test(start_paused = true)]
async fn clean_tree_reports_nothing_to_publish() {
    let mut vcs = MockVcsPort::new();
    vcs.expect_status().returning(|_| Ok(ChangeSet::default()));
    vcs.expect_current_branch()
        .returning(|_| Ok("main".to_string()));
    vcs.expect_stage().times(0);
    vcs.expect_commit().times(0);
    vcs.expect_push().times(0);
    let mut remote = MockRemotePort::new();
    remote.expect_get_ref_hash().times(0);

    let store = Arc::new(MemoryRunStore::new());
    let (runner, mut rx) = runner(vcs, remote, store.clone());
    let report = runner
        .publish(request(), &CancelSignal::never())
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::NothingToPublish);
    assert_eq!(report.commit_hash, None);
    let stored = store.load(report.run_id).await.unwrap();
    assert_eq!(stored.current_stage(), Stage::Done);

    let events = drain(&mut rx);
    assert_eq!(attempts_at(&events, Stage::Commit), 0);
    assert_eq!(attempts_at(&events, Stage::Push), 0);
    assert!(events
        .iter()
        .any(|e| matches!(e.outcome, EventOutcome::Skipped { .. })));
}

#[tokio::test(start_paused = true)]
async fn transient_push_failures_are_retried_until_success() {
    let remote_ref: RemoteRef = Arc::default();
    let mut vcs = committing_vcs();
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let pushed_ref = remote_ref.clone();
    vcs.expect_push().returning(move |_, remote, branch, _| {
        if counter.fetch_add(1, Ordering::SeqCst) < 3 {
            Err(PublishError::transient("connection reset by peer"))
        } else {
            Ok(landed(&pushed_ref, remote, branch))
        }
    });

    let store = Arc::new(MemoryRunStore::new());
    let (runner, mut rx) = runner(vcs, remote_reading(&remote_ref), store);
    let report = runner
        .publish(request(), &CancelSignal::never())
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Published);
    assert_eq!(report.observed_remote_hash.as_deref(), Some(COMMIT));
    assert_eq!(calls.load(Ordering::SeqCst), 4);

    let events = drain(&mut rx);
    assert_eq!(attempts_at(&events, Stage::Push), 4);
    let retries = events
        .iter()
        .filter(|e| matches!(e.outcome, EventOutcome::Retrying { .. }))
        .count();
    assert_eq!(retries, 3);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_report_last_error_and_progress() {
    let remote_ref: RemoteRef = Arc::default();
    let mut vcs = committing_vcs();
    vcs.expect_push()
        .times(5)
        .returning(|_, _, _, _| Err(PublishError::transient("502 Bad Gateway")));

    let store = Arc::new(MemoryRunStore::new());
    let (runner, _rx) = runner(vcs, remote_reading(&remote_ref), store.clone());
    let failure = runner
        .publish(request(), &CancelSignal::never())
        .await
        .unwrap_err();

    assert_eq!(failure.stage, Some(Stage::Push));
    assert_eq!(failure.last_completed_stage, Some(Stage::Commit));
    assert_eq!(failure.attempts, 5);
    assert!(failure
        .to_string()
        .starts_with("committed, push failed after 5 attempts"));
    let stored = store.load(failure.run_id).await.unwrap();
    assert_eq!(stored.current_stage(), Stage::Failed);
}

#[tokio::test(start_paused = true)]
async fn non_fast_forward_fails_immediately_with_remote_hash() {
    let mut vcs = committing_vcs();
    vcs.expect_push().times(1).returning(|_, _, _, _| {
        Err(PublishError::NonFastForward {
            branch: "main".into(),
            remote_hash: None,
            message: "! [rejected] main -> main (fetch first)".into(),
        })
    });
    let diverged: RemoteRef = Arc::new(Mutex::new(Some("deadbeef".to_string())));

    let store = Arc::new(MemoryRunStore::new());
    let (runner, mut rx) = runner(vcs, remote_reading(&diverged), store);
    let failure = runner
        .publish(request(), &CancelSignal::never())
        .await
        .unwrap_err();

    assert_eq!(failure.stage, Some(Stage::Push));
    assert_eq!(failure.attempts, 1);
    match &failure.error {
        PublishError::NonFastForward { remote_hash, .. } => {
            assert_eq!(remote_hash.as_deref(), Some("deadbeef"))
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(failure.to_string().contains("deadbeef"));
    assert!(!failure.is_uncertain());
    let events = drain(&mut rx);
    assert!(!events
        .iter()
        .any(|e| matches!(e.outcome, EventOutcome::Retrying { .. })));
}

#[tokio::test(start_paused = true)]
async fn unconfirmed_push_is_reported_as_uncertain() {
    let mut vcs = committing_vcs();
    vcs.expect_push().returning(|_, remote, branch, _| {
        Ok(PushResult {
            local_commit_hash: COMMIT.to_string(),
            branch: branch.to_string(),
            remote_name: remote.to_string(),
            already_published: false,
        })
    });
    let stale: RemoteRef = Arc::new(Mutex::new(Some("0ld".to_string())));

    let store = Arc::new(MemoryRunStore::new());
    let (runner, _rx) = runner(vcs, remote_reading(&stale), store);
    let failure = runner
        .publish(request(), &CancelSignal::never())
        .await
        .unwrap_err();

    assert_eq!(failure.stage, Some(Stage::Verify));
    assert_eq!(failure.last_completed_stage, Some(Stage::Push));
    assert!(failure.is_uncertain());
    assert!(matches!(
        failure.error,
        PublishError::VerificationTimeout { .. }
    ));
    assert!(failure.to_string().contains("uncertain"));
}

#[tokio::test(start_paused = true)]
async fn resume_mid_push_skips_push_when_commit_already_landed() {
    let store = Arc::new(MemoryRunStore::new());
    let mut run = PipelineRun::new(request().with_branch("main"));
    run.record_attempt();
    run.advance();
    run.record_attempt();
    run.commit_hash = Some(COMMIT.to_string());
    run.advance();
    run.record_attempt();
    assert_eq!(run.current_stage(), Stage::Push);
    store.save(&run).await.unwrap();

    let mut vcs = MockVcsPort::new();
    vcs.expect_status().times(0);
    vcs.expect_commit().times(0);
    vcs.expect_push().times(0);
    vcs.expect_current_branch_tip()
        .returning(|_| Ok(COMMIT.to_string()));
    let landed_ref: RemoteRef = Arc::new(Mutex::new(Some(COMMIT.to_string())));

    let (runner, mut rx) = runner(vcs, remote_reading(&landed_ref), store.clone());
    let report = runner
        .resume(run.run_id, &CancelSignal::never())
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::AlreadyPublished);
    let stored = store.load(run.run_id).await.unwrap();
    assert_eq!(stored.current_stage(), Stage::Done);
    assert_eq!(stored.attempts(Stage::Push), 2);

    let events = drain(&mut rx);
    assert_eq!(events[0].outcome, EventOutcome::Resumed);
    assert_eq!(events[0].stage, Stage::Push);
    assert!(events.iter().all(|e| e.stage != Stage::Scan));
}

#[tokio::test(start_paused = true)]
async fn resuming_a_finished_run_returns_the_recorded_result() {
    let store = Arc::new(MemoryRunStore::new());
    let mut run = PipelineRun::new(request());
    run.finish(RunOutcome::NothingToPublish);
    store.save(&run).await.unwrap();

    let mut vcs = MockVcsPort::new();
    vcs.expect_status().times(0);
    let (runner, _rx) = runner(vcs, MockRemotePort::new(), store);
    let report = runner
        .resume(run.run_id, &CancelSignal::never())
        .await
        .unwrap();
    assert_eq!(report.outcome, RunOutcome::NothingToPublish);
}

#[tokio::test(start_paused = true)]
async fn resume_at_commit_adopts_an_existing_commit() {
    let store = Arc::new(MemoryRunStore::new());
    let mut run = PipelineRun::new(request().with_branch("main"));
    run.advance();
    run.record_attempt();
    store.save(&run).await.unwrap();

    let remote_ref: RemoteRef = Arc::default();
    let mut vcs = MockVcsPort::new();
    vcs.expect_status().returning(|_| Ok(ChangeSet::default()));
    vcs.expect_commit().times(0);
    vcs.expect_current_branch_tip()
        .returning(|_| Ok(COMMIT.to_string()));
    let pushed_ref = remote_ref.clone();
    vcs.expect_push()
        .times(1)
        .returning(move |_, remote, branch, _| Ok(landed(&pushed_ref, remote, branch)));

    let (runner, _rx) = runner(vcs, remote_reading(&remote_ref), store);
    let report = runner
        .resume(run.run_id, &CancelSignal::never())
        .await
        .unwrap();
    assert_eq!(report.outcome, RunOutcome::Published);
    assert_eq!(report.commit_hash.as_deref(), Some(COMMIT));
}

#[tokio::test(start_paused = true)]
async fn cancellation_during_retry_wait_fails_the_run() {
    let remote_ref: RemoteRef = Arc::default();
    let mut vcs = committing_vcs();
    vcs.expect_push()
        .times(1)
        .returning(|_, _, _, _| Err(PublishError::locked("rate limited", Some(60))));

    let store = Arc::new(MemoryRunStore::new());
    let (runner, mut rx) = runner(vcs, remote_reading(&remote_ref), store.clone());
    let runner = Arc::new(runner);
    let (handle, signal) = cancel_pair();
    let task = runner.spawn(request(), signal);

    while let Some(event) = rx.recv().await {
        if matches!(event.outcome, EventOutcome::Retrying { .. }) {
            handle.cancel();
            break;
        }
    }
    let failure = task.await.unwrap().unwrap_err();

    assert_eq!(failure.error, PublishError::Cancelled);
    assert_eq!(failure.stage, Some(Stage::Push));
    let stored = store.load(failure.run_id).await.unwrap();
    assert_eq!(stored.current_stage(), Stage::Failed);
    assert_eq!(stored.failed_stage(), Some(Stage::Push));
}

#[tokio::test(start_paused = true)]
async fn cancelled_before_start_touches_nothing() {
    let mut vcs = MockVcsPort::new();
    vcs.expect_status().times(0);
    let (runner, _rx) = runner(vcs, MockRemotePort::new(), Arc::new(MemoryRunStore::new()));
    let (handle, signal) = cancel_pair();
    handle.cancel();
    let failure = runner.publish(request(), &signal).await.unwrap_err();
    assert_eq!(failure.error, PublishError::Cancelled);
    assert_eq!(failure.stage, Some(Stage::Scan));
    assert_eq!(failure.last_completed_stage, None);
}

#[tokio::test(start_paused = true)]
async fn amended_tip_stops_the_push() {
    let mut vcs = MockVcsPort::new();
    vcs.expect_status().returning(|_| Ok(dirty_tree()));
    vcs.expect_current_branch()
        .returning(|_| Ok("main".to_string()));
    vcs.expect_stage().returning(|_, _| Ok(()));
    vcs.expect_commit()
        .returning(|_, _, _, _| Ok(COMMIT.to_string()));
    vcs.expect_current_branch_tip()
        .returning(|_| Ok("amended".to_string()));
    vcs.expect_push().times(0);

    let (runner, _rx) = runner(vcs, MockRemotePort::new(), Arc::new(MemoryRunStore::new()));
    let failure = runner
        .publish(request(), &CancelSignal::never())
        .await
        .unwrap_err();
    assert!(matches!(
        failure.error,
        PublishError::BranchTipChanged { .. }
    ));
    assert_eq!(failure.attempts, 1);
}

#[tokio::test(start_paused = true)]
async fn commit_stages_exactly_the_selected_paths() {
    let remote_ref: RemoteRef = Arc::default();
    let mut vcs = MockVcsPort::new();
    vcs.expect_status().returning(|_| Ok(dirty_tree()));
    vcs.expect_current_branch()
        .returning(|_| Ok("main".to_string()));
    vcs.expect_stage()
        .withf(|repo, paths| repo == Path::new(REPO) && paths == ["index.md", "old.md"])
        .times(1)
        .returning(|_, _| Ok(()));
    vcs.expect_commit()
        .returning(|_, _, _, _| Ok(COMMIT.to_string()));
    vcs.expect_current_branch_tip()
        .returning(|_| Ok(COMMIT.to_string()));
    let pushed_ref = remote_ref.clone();
    vcs.expect_push()
        .returning(move |_, remote, branch, _| Ok(landed(&pushed_ref, remote, branch)));

    let (runner, _rx) = runner(vcs, remote_reading(&remote_ref), Arc::new(MemoryRunStore::new()));
    let request = request().with_selection(Selection::paths(["old.md", "index.md"]));
    let report = runner
        .publish(request, &CancelSignal::never())
        .await
        .unwrap();
    assert_eq!(report.outcome, RunOutcome::Published);
}

#[tokio::test(start_paused = true)]
async fn stale_selection_is_nothing_to_commit() {
    let mut vcs = MockVcsPort::new();
    vcs.expect_status().returning(|_| Ok(dirty_tree()));
    vcs.expect_current_branch()
        .returning(|_| Ok("main".to_string()));
    vcs.expect_stage().times(0);

    let (runner, _rx) = runner(vcs, MockRemotePort::new(), Arc::new(MemoryRunStore::new()));
    let request = request().with_selection(Selection::paths(["vanished.md"]));
    let failure = runner
        .publish(request, &CancelSignal::never())
        .await
        .unwrap_err();
    assert_eq!(failure.stage, Some(Stage::Commit));
    assert!(matches!(failure.error, PublishError::NothingToCommit { .. }));
}

#[tokio::test(start_paused = true)]
async fn failing_enhancer_falls_back_to_raw_message() {
    let remote_ref: RemoteRef = Arc::default();
    let mut vcs = MockVcsPort::new();
    vcs.expect_status().returning(|_| Ok(dirty_tree()));
    vcs.expect_current_branch()
        .returning(|_| Ok("main".to_string()));
    vcs.expect_stage().returning(|_, _| Ok(()));
    vcs.expect_commit()
        .with(always(), eq("docs: update"), always(), eq(None::<String>))
        .times(1)
        .returning(|_, _, _, _| Ok(COMMIT.to_string()));
    vcs.expect_current_branch_tip()
        .returning(|_| Ok(COMMIT.to_string()));
    let pushed_ref = remote_ref.clone();
    vcs.expect_push()
        .returning(move |_, remote, branch, _| Ok(landed(&pushed_ref, remote, branch)));

    let mut enhancer = MockMessageEnhancer::new();
    enhancer
        .expect_enhance()
        .returning(|_, _| Err("model unavailable".into()));

    let (runner, _rx) = runner(vcs, remote_reading(&remote_ref), Arc::new(MemoryRunStore::new()));
    let runner = runner.with_enhancer(Arc::new(enhancer));
    let report = runner
        .publish(request(), &CancelSignal::never())
        .await
        .unwrap();
    assert_eq!(report.outcome, RunOutcome::Published);
}

#[tokio::test(start_paused = true)]
async fn resume_incomplete_drives_every_open_run() {
    let store = Arc::new(MemoryRunStore::new());
    let mut ids = Vec::new();
    for repo in ["/work/a", "/work/b"] {
        let mut run = PipelineRun::new(
            PublishRequest::new(repo, "octo/site").with_branch("main"),
        );
        run.advance();
        run.commit_hash = Some(COMMIT.to_string());
        run.advance();
        store.save(&run).await.unwrap();
        ids.push(run.run_id);
    }
    let mut finished = PipelineRun::new(request());
    finished.finish(RunOutcome::NothingToPublish);
    store.save(&finished).await.unwrap();

    let mut vcs = MockVcsPort::new();
    vcs.expect_current_branch_tip()
        .returning(|_| Ok(COMMIT.to_string()));
    vcs.expect_push().times(0);
    let landed_ref: RemoteRef = Arc::new(Mutex::new(Some(COMMIT.to_string())));

    let (runner, _rx) = runner(vcs, remote_reading(&landed_ref), store.clone());
    let results = Arc::new(runner)
        .resume_incomplete(&CancelSignal::never())
        .await
        .unwrap();
    assert_eq!(results.len(), 2);
    for result in results {
        assert_eq!(result.unwrap().outcome, RunOutcome::AlreadyPublished);
    }
    assert!(store.list_incomplete().await.unwrap().is_empty());
}

#[tokio::test]
async fn repeated_push_of_landed_commit_does_not_touch_remote() {
    let remote_ref: RemoteRef = Arc::default();
    let pushes = Arc::new(AtomicU32::new(0));
    let mut vcs = MockVcsPort::new();
    vcs.expect_current_branch_tip()
        .returning(|_| Ok(COMMIT.to_string()));
    let counter = pushes.clone();
    let pushed_ref = remote_ref.clone();
    vcs.expect_push().returning(move |_, remote, branch, _| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(landed(&pushed_ref, remote, branch))
    });

    let stage = PushStage::new(
        Arc::new(vcs),
        VerifyStage::new(Arc::new(remote_reading(&remote_ref)), VerifyConfig::default()),
    );
    let repo = Path::new(REPO);
    let first = stage
        .attempt(repo, "origin", "main", "octo/site", COMMIT, false)
        .await
        .unwrap();
    let second = stage
        .attempt(repo, "origin", "main", "octo/site", COMMIT, false)
        .await
        .unwrap();

    assert!(!first.already_published);
    assert!(second.already_published);
    assert_eq!(second.local_commit_hash, COMMIT);
    assert_eq!(pushes.load(Ordering::SeqCst), 1);
    assert_eq!(remote_ref.lock().unwrap().as_deref(), Some(COMMIT));
}

#[tokio::test(start_paused = true)]
async fn timed_out_rescan_on_resume_is_retried() {
    let store = Arc::new(MemoryRunStore::new());
    let mut run = PipelineRun::new(request().with_branch("main"));
    run.advance();
    store.save(&run).await.unwrap();

    let remote_ref: RemoteRef = Arc::default();
    let mut vcs = MockVcsPort::new();
    let scans = Arc::new(AtomicU32::new(0));
    let counter = scans.clone();
    vcs.expect_status().returning(move |_| {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            Err(PublishError::ProcessTimeout {
                command: "git status".into(),
                timeout_ms: 120_000,
            })
        } else {
            Ok(dirty_tree())
        }
    });
    vcs.expect_stage().returning(|_, _| Ok(()));
    vcs.expect_commit()
        .times(1)
        .returning(|_, _, _, _| Ok(COMMIT.to_string()));
    vcs.expect_current_branch_tip()
        .returning(|_| Ok(COMMIT.to_string()));
    let pushed_ref = remote_ref.clone();
    vcs.expect_push()
        .returning(move |_, remote, branch, _| Ok(landed(&pushed_ref, remote, branch)));

    let (runner, mut rx) = runner(vcs, remote_reading(&remote_ref), store.clone());
    let report = runner
        .resume(run.run_id, &CancelSignal::never())
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Published);
    assert_eq!(scans.load(Ordering::SeqCst), 2);
    let events = drain(&mut rx);
    assert_eq!(attempts_at(&events, Stage::Commit), 2);
    assert!(events.iter().any(|e| e.stage == Stage::Commit
        && matches!(e.outcome, EventOutcome::Retrying { .. })));
}

#[tokio::test(start_paused = true)]
async fn forced_publish_overwrites_a_diverged_branch_under_lease() {
    let diverged: RemoteRef = Arc::new(Mutex::new(Some("deadbeef".to_string())));
    let mut vcs = committing_vcs();
    let pushed_ref = diverged.clone();
    vcs.expect_push()
        .withf(|_, _, _, mode| {
            *mode
                == PushMode::ForceWithLease {
                    expected: Some("deadbeef".into()),
                }
        })
        .times(1)
        .returning(move |_, remote, branch, _| Ok(landed(&pushed_ref, remote, branch)));

    let (runner, _rx) = runner(vcs, remote_reading(&diverged), Arc::new(MemoryRunStore::new()));
    let report = runner
        .publish(request().with_force_with_lease(true), &CancelSignal::never())
        .await
        .unwrap();
    assert_eq!(report.outcome, RunOutcome::Published);
    assert_eq!(report.observed_remote_hash.as_deref(), Some(COMMIT));
}

/// Clean-tree VCS that records when each `status` call starts and ends.
#[derive(Default)]
struct TimedVcs {
    scans: Mutex<Vec<(PathBuf, Instant, Instant)>>,
}

impl TimedVcs {
    fn scans(&self) -> Vec<(PathBuf, Instant, Instant)> {
        let mut scans = self.scans.lock().unwrap().clone();
        scans.sort_by_key(|(_, entered, _)| *entered);
        scans
    }
}

#[async_trait]
impl VcsPort for TimedVcs {
    async fn status(&self, repo: &Path) -> Result<ChangeSet, PublishError> {
        let entered = Instant::now();
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.scans
            .lock()
            .unwrap()
            .push((repo.to_path_buf(), entered, Instant::now()));
        Ok(ChangeSet::default())
    }

    async fn stage(&self, _repo: &Path, _paths: &[String]) -> Result<(), PublishError> {
        Err(PublishError::repository("clean tree has nothing to stage"))
    }

    async fn commit(
        &self,
        _repo: &Path,
        _message: &str,
        _paths: &[String],
        _author: Option<String>,
    ) -> Result<String, PublishError> {
        Err(PublishError::repository("clean tree has nothing to commit"))
    }

    async fn push(
        &self,
        _repo: &Path,
        _remote: &str,
        _branch: &str,
        _mode: PushMode,
    ) -> Result<PushResult, PublishError> {
        Err(PublishError::repository("clean tree has nothing to push"))
    }

    async fn current_branch_tip(&self, _repo: &Path) -> Result<String, PublishError> {
        Ok(COMMIT.to_string())
    }

    async fn current_branch(&self, _repo: &Path) -> Result<String, PublishError> {
        Ok("main".to_string())
    }
}

fn timed_runner(vcs: &Arc<TimedVcs>) -> Arc<PipelineRunner> {
    Arc::new(PipelineRunner::new(
        vcs.clone(),
        Arc::new(MockRemotePort::new()),
        Arc::new(MemoryRunStore::new()),
        config(),
    ))
}

#[tokio::test(start_paused = true)]
async fn runs_on_the_same_repository_never_overlap() {
    let vcs = Arc::new(TimedVcs::default());
    let runner = timed_runner(&vcs);
    let first = runner.spawn(request(), CancelSignal::never());
    let second = runner.spawn(request(), CancelSignal::never());
    for task in [first, second] {
        assert_eq!(
            task.await.unwrap().unwrap().outcome,
            RunOutcome::NothingToPublish
        );
    }

    let scans = vcs.scans();
    assert_eq!(scans.len(), 2);
    let (_, _, first_exit) = scans[0];
    let (_, second_entry, _) = scans[1];
    assert!(
        second_entry >= first_exit,
        "second run scanned before the first released the repository"
    );
}

#[tokio::test(start_paused = true)]
async fn runs_on_different_repositories_overlap() {
    let vcs = Arc::new(TimedVcs::default());
    let runner = timed_runner(&vcs);
    let first = runner.spawn(PublishRequest::new("/work/a", "octo/a"), CancelSignal::never());
    let second = runner.spawn(PublishRequest::new("/work/b", "octo/b"), CancelSignal::never());
    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();

    let scans = vcs.scans();
    assert_eq!(scans.len(), 2);
    let (_, _, first_exit) = scans[0];
    let (_, second_entry, _) = scans[1];
    assert!(second_entry < first_exit, "independent runs were serialised");
}

#[tokio::test(start_paused = true)]
async fn resumed_runs_on_different_repositories_overlap() {
    let store = Arc::new(MemoryRunStore::new());
    for repo in ["/work/a", "/work/b"] {
        let run = PipelineRun::new(PublishRequest::new(repo, "octo/site").with_branch("main"));
        store.save(&run).await.unwrap();
    }
    let vcs = Arc::new(TimedVcs::default());
    let runner = Arc::new(PipelineRunner::new(
        vcs.clone(),
        Arc::new(MockRemotePort::new()),
        store.clone(),
        config(),
    ));

    let results = runner
        .resume_incomplete(&CancelSignal::never())
        .await
        .unwrap();
    assert!(results.iter().all(Result::is_ok));

    let scans = vcs.scans();
    assert_eq!(scans.len(), 2);
    assert!(scans[1].1 < scans[0].2, "resumed runs were serialised");
    assert!(store.list_incomplete().await.unwrap().is_empty());
}
