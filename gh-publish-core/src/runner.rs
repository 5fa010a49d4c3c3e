//! # runner: the publish state machine
//!
//! [`PipelineRunner`] drives a [`PipelineRun`] through
//! `Scan → Commit → Push → Verify → Done`, persisting the run after every
//! attempt and every transition so an interrupted process can pick it up
//! again with [`PipelineRunner::resume`].
//!
//! ## Retries
//! Every stage runs in the same loop: record an attempt, run the stage once,
//! and on failure ask the [`RetryPolicy`] whether to wait and go again. Only
//! the final error of an exhausted (or non-retryable) stage reaches the
//! caller, wrapped in a [`RunFailure`] that names the failing stage and the
//! last stage that completed.
//!
//! ## Concurrency
//! Independent runs may execute concurrently (see [`PipelineRunner::spawn`]
//! and [`PipelineRunner::resume_incomplete`]). Runs against the same
//! repository path are serialised by a per-path async mutex.
//!
//! ## Cancellation
//! The [`CancelSignal`] is checked before each stage and raced against every
//! retry and verification wait. A stage operation already running is never
//! interrupted. A cancelled run ends `Failed` with [`PublishError::Cancelled`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::cancel::CancelSignal;
use crate::commit::{CommitOutcome, CommitStage};
use crate::config::PipelineConfig;
use crate::contract::{ChangeSet, MessageEnhancer, PushResult, RemotePort, VcsPort};
use crate::error::PublishError;
use crate::events::{EventOutcome, ProgressSink};
use crate::push::PushStage;
use crate::retry::{ReasonCode, RetryPolicy};
use crate::run::{PipelineRun, PublishRequest, RunOutcome, Stage};
use crate::scan::ScanStage;
use crate::store::RunStore;
use crate::verify::VerifyStage;

/// A run that reached `Done`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub outcome: RunOutcome,
    pub commit_hash: Option<String>,
    pub push_result: Option<PushResult>,
    pub observed_remote_hash: Option<String>,
}

impl RunReport {
    fn from_run(run: &PipelineRun) -> Self {
        RunReport {
            run_id: run.run_id,
            outcome: run.outcome().unwrap_or(RunOutcome::Published),
            commit_hash: run.commit_hash.clone(),
            push_result: run.push_result.clone(),
            observed_remote_hash: run.observed_remote_hash.clone(),
        }
    }
}

impl std::fmt::Display for RunReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "run {}: {}", self.run_id, self.outcome)?;
        if let Some(push) = &self.push_result {
            write!(
                f,
                " ({} on {}/{})",
                short_hash(&push.local_commit_hash),
                push.remote_name,
                push.branch
            )?;
        }
        Ok(())
    }
}

/// A run that ended `Failed`, or could not be loaded at all (`stage` is
/// `None`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunFailure {
    pub run_id: Uuid,
    /// Stage that was executing when the run failed.
    pub stage: Option<Stage>,
    pub last_completed_stage: Option<Stage>,
    /// Attempts made at the failing stage.
    pub attempts: u32,
    pub error: PublishError,
}

impl RunFailure {
    fn from_run(run: &PipelineRun) -> Self {
        let stage = run.failed_stage();
        RunFailure {
            run_id: run.run_id,
            stage,
            last_completed_stage: run.last_completed_stage(),
            attempts: stage.map(|s| run.attempts(s)).unwrap_or(0),
            error: run
                .last_error()
                .cloned()
                .unwrap_or_else(|| PublishError::repository("run failed without a recorded error")),
        }
    }

    fn unloaded(run_id: Uuid, error: PublishError) -> Self {
        RunFailure {
            run_id,
            stage: None,
            last_completed_stage: None,
            attempts: 0,
            error,
        }
    }

    /// The push may have landed even though it could not be confirmed.
    pub fn is_uncertain(&self) -> bool {
        self.error.is_uncertain()
    }
}

impl std::fmt::Display for RunFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let Some(stage) = self.stage else {
            return write!(f, "{}", self.error);
        };
        if let Some(done) = self.last_completed_stage {
            write!(f, "{}, ", done.completed_label())?;
        }
        let plural = if self.attempts == 1 { "" } else { "s" };
        if self.is_uncertain() {
            write!(f, "{stage} outcome uncertain: {}", self.error)
        } else if self.error == PublishError::Cancelled {
            write!(f, "{stage} cancelled")
        } else {
            write!(
                f,
                "{stage} failed after {} attempt{plural}: {}",
                self.attempts, self.error
            )
        }
    }
}

impl std::error::Error for RunFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Per-repository mutual exclusion. An entry lives only while some run holds
/// or waits for it.
#[derive(Debug, Default)]
struct RepoLocks {
    locks: Mutex<HashMap<PathBuf, Arc<AsyncMutex<()>>>>,
}

impl RepoLocks {
    async fn acquire(&self, repo: &Path) -> RepoGuard<'_> {
        let key = tokio::fs::canonicalize(repo)
            .await
            .unwrap_or_else(|_| repo.to_path_buf());
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.entry(key.clone()).or_default().clone()
        };
        let guard = match lock.clone().try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                info!(repo = %repo.display(), "Waiting for another run on the same repository");
                lock.lock_owned().await
            }
        };
        RepoGuard {
            locks: self,
            key,
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

struct RepoGuard<'a> {
    locks: &'a RepoLocks,
    key: PathBuf,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for RepoGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.locks.locks.lock().unwrap_or_else(|e| e.into_inner());
        // Only the map's own reference left: nobody holds or awaits the lock.
        if locks
            .get(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.key);
        }
    }
}

pub struct PipelineRunner {
    vcs: Arc<dyn VcsPort>,
    store: Arc<dyn RunStore>,
    scan: ScanStage,
    commit: CommitStage,
    push: PushStage,
    verify: VerifyStage,
    policy: RetryPolicy,
    config: PipelineConfig,
    progress: ProgressSink,
    repo_locks: RepoLocks,
}

impl PipelineRunner {
    pub fn new(
        vcs: Arc<dyn VcsPort>,
        remote: Arc<dyn RemotePort>,
        store: Arc<dyn RunStore>,
        config: PipelineConfig,
    ) -> Self {
        let verify = VerifyStage::new(remote, config.verify.clone());
        PipelineRunner {
            scan: ScanStage::new(vcs.clone()),
            commit: CommitStage::new(vcs.clone(), None, config.enhancer_timeout()),
            push: PushStage::new(vcs.clone(), verify.clone()),
            verify,
            policy: RetryPolicy::new(config.retry.clone()),
            progress: ProgressSink::disabled(),
            repo_locks: RepoLocks::default(),
            vcs,
            store,
            config,
        }
    }

    pub fn with_enhancer(mut self, enhancer: Arc<dyn MessageEnhancer>) -> Self {
        self.commit = CommitStage::new(
            self.vcs.clone(),
            Some(enhancer),
            self.config.enhancer_timeout(),
        );
        self
    }

    pub fn with_progress(mut self, progress: ProgressSink) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    /// Start a new run for `request` and drive it to completion.
    #[instrument(skip_all, fields(repo = %request.repo_path.display(), remote_repo = %request.remote_repo))]
    pub async fn publish(
        &self,
        request: PublishRequest,
        cancel: &CancelSignal,
    ) -> Result<RunReport, RunFailure> {
        let run = PipelineRun::new(request);
        info!(run_id = %run.run_id, "Starting publish run");
        self.drive(run, cancel, false).await
    }

    /// Run `publish` on its own task.
    pub fn spawn(
        self: &Arc<Self>,
        request: PublishRequest,
        cancel: CancelSignal,
    ) -> JoinHandle<Result<RunReport, RunFailure>> {
        let runner = Arc::clone(self);
        tokio::spawn(async move { runner.publish(request, &cancel).await })
    }

    /// Continue a stored run at the stage it was in. A run that already
    /// terminated returns its recorded result without doing any work.
    #[instrument(skip(self, cancel))]
    pub async fn resume(
        &self,
        run_id: Uuid,
        cancel: &CancelSignal,
    ) -> Result<RunReport, RunFailure> {
        let run = self.load(run_id).await?;
        match run.current_stage() {
            Stage::Done => Ok(RunReport::from_run(&run)),
            Stage::Failed => Err(RunFailure::from_run(&run)),
            stage => {
                info!(%run_id, %stage, "Resuming run");
                self.drive(run, cancel, true).await
            }
        }
    }

    /// Re-enter an earlier stage of a stored, unfinished run.
    #[instrument(skip(self, cancel))]
    pub async fn resume_from(
        &self,
        run_id: Uuid,
        stage: Stage,
        cancel: &CancelSignal,
    ) -> Result<RunReport, RunFailure> {
        let mut run = self.load(run_id).await?;
        run.resume_from(stage)
            .map_err(|e| RunFailure::unloaded(run_id, e))?;
        info!(%run_id, %stage, "Resuming run from requested stage");
        self.drive(run, cancel, true).await
    }

    /// Resume every unfinished run in the store, each on its own task.
    pub async fn resume_incomplete(
        self: &Arc<Self>,
        cancel: &CancelSignal,
    ) -> Result<Vec<Result<RunReport, RunFailure>>, PublishError> {
        let runs = self.store.list_incomplete().await?;
        info!(count = runs.len(), "Resuming incomplete runs");
        let tasks = runs.into_iter().map(|run| {
            let run_id = run.run_id;
            let runner = Arc::clone(self);
            let cancel = cancel.clone();
            let task = tokio::spawn(async move { runner.drive(run, &cancel, true).await });
            async move {
                task.await.unwrap_or_else(|e| {
                    error!(%run_id, error = %e, "Resumed run task aborted");
                    Err(RunFailure::unloaded(
                        run_id,
                        PublishError::repository(format!("run task aborted: {e}")),
                    ))
                })
            }
        });
        Ok(join_all(tasks).await)
    }

    async fn load(&self, run_id: Uuid) -> Result<PipelineRun, RunFailure> {
        self.store
            .load(run_id)
            .await
            .map_err(|e| RunFailure::unloaded(run_id, e.into()))
    }

    async fn drive(
        &self,
        mut run: PipelineRun,
        cancel: &CancelSignal,
        resumed: bool,
    ) -> Result<RunReport, RunFailure> {
        let _guard = self.repo_locks.acquire(&run.request.repo_path).await;

        if let Err(e) = self.persist(&run).await {
            return Err(self.fail(run, e).await);
        }
        if resumed {
            self.emit(&run, EventOutcome::Resumed, run.attempts(run.current_stage()));
        }

        // Scan output carried into the commit stage of the same invocation.
        let mut changes: Option<ChangeSet> = None;

        while !run.is_terminal() {
            if cancel.is_cancelled() {
                warn!(run_id = %run.run_id, stage = %run.current_stage(), "Run cancelled");
                return Err(self.fail(run, PublishError::Cancelled).await);
            }
            let stage = run.current_stage();
            self.emit(&run, EventOutcome::Started, run.attempts(stage));

            let step = match stage {
                Stage::Scan => self.scan_step(&mut run, &mut changes, cancel).await,
                Stage::Commit => self.commit_step(&mut run, &mut changes, cancel).await,
                Stage::Push => self.push_step(&mut run, cancel).await,
                Stage::Verify => self.verify_step(&mut run, cancel).await,
                Stage::Done | Stage::Failed => Ok(()),
            };
            if let Err(e) = step {
                return Err(self.fail(run, e).await);
            }
            if let Err(e) = self.persist(&run).await {
                return Err(self.fail(run, e).await);
            }
            self.progress.emit(
                run.run_id,
                stage,
                EventOutcome::Succeeded,
                run.attempts(stage),
            );
            debug!(run_id = %run.run_id, from = %stage, to = %run.current_stage(), "Stage transition");
        }

        let report = RunReport::from_run(&run);
        info!(run_id = %run.run_id, outcome = %report.outcome, "Run finished");
        Ok(report)
    }

    async fn scan_step(
        &self,
        run: &mut PipelineRun,
        changes: &mut Option<ChangeSet>,
        cancel: &CancelSignal,
    ) -> Result<(), PublishError> {
        let repo = run.request.repo_path.clone();
        let found = loop {
            let attempt = self.begin_attempt(run).await?;
            match self.scan_once(&repo, run.branch.is_none()).await {
                Ok(found) => break found,
                Err(e) => self.attempt_failed(run, attempt, e, cancel).await?,
            }
        };
        let (scanned, branch) = found;
        if let Some(branch) = branch {
            run.branch = Some(branch);
        }

        if scanned.is_empty() {
            self.nothing_to_publish(run);
        } else {
            *changes = Some(scanned);
            run.advance();
        }
        Ok(())
    }

    async fn scan_once(
        &self,
        repo: &Path,
        resolve_branch: bool,
    ) -> Result<(ChangeSet, Option<String>), PublishError> {
        let changes = self.scan.run(repo).await?;
        let branch = if resolve_branch {
            Some(self.vcs.current_branch(repo).await?)
        } else {
            None
        };
        Ok((changes, branch))
    }

    async fn commit_step(
        &self,
        run: &mut PipelineRun,
        changes: &mut Option<ChangeSet>,
        cancel: &CancelSignal,
    ) -> Result<(), PublishError> {
        let repo = run.request.repo_path.clone();
        let request = run.request.clone();
        let step = loop {
            let attempt = self.begin_attempt(run).await?;
            match self
                .commit_once(&repo, &request, changes.take(), attempt > 1)
                .await
            {
                Ok(step) => break step,
                Err(e) => self.attempt_failed(run, attempt, e, cancel).await?,
            }
        };

        match step {
            CommitStep::Committed(outcome) => {
                debug!(run_id = %run.run_id, paths = ?outcome.commit_spec.selected_paths, "Committed selected paths");
                run.commit_hash = Some(outcome.commit_hash);
                run.advance();
            }
            CommitStep::AdoptedTip(tip) => {
                info!(run_id = %run.run_id, commit = %tip, "Working tree clean after an earlier commit attempt; adopting branch tip");
                run.commit_hash = Some(tip);
                run.advance();
            }
            CommitStep::Clean => self.nothing_to_publish(run),
        }
        Ok(())
    }

    /// One commit attempt. Without scan output carried over from this
    /// invocation the tree is scanned again. A clean tree after an earlier
    /// attempt means that attempt committed, so its tip is adopted.
    async fn commit_once(
        &self,
        repo: &Path,
        request: &PublishRequest,
        carried: Option<ChangeSet>,
        attempted_before: bool,
    ) -> Result<CommitStep, PublishError> {
        let changes = match carried {
            Some(changes) => changes,
            None => self.scan.run(repo).await?,
        };
        if changes.is_empty() {
            return if attempted_before {
                Ok(CommitStep::AdoptedTip(
                    self.vcs.current_branch_tip(repo).await?,
                ))
            } else {
                Ok(CommitStep::Clean)
            };
        }
        let outcome = self
            .commit
            .run(
                repo,
                &changes,
                &request.selection,
                &request.message,
                request.author.clone(),
            )
            .await?;
        Ok(CommitStep::Committed(outcome))
    }

    async fn push_step(
        &self,
        run: &mut PipelineRun,
        cancel: &CancelSignal,
    ) -> Result<(), PublishError> {
        let repo = run.request.repo_path.clone();
        let branch = run
            .branch
            .clone()
            .ok_or_else(|| PublishError::repository("no branch resolved for push"))?;
        let expected = match run.commit_hash.clone() {
            Some(hash) => hash,
            None => {
                let tip = self.vcs.current_branch_tip(&repo).await?;
                run.commit_hash = Some(tip.clone());
                tip
            }
        };
        let remote_name = run.request.remote_name.clone();
        let remote_repo = run.request.remote_repo.clone();
        let force_with_lease = run.request.force_with_lease;

        let result = loop {
            let attempt = self.begin_attempt(run).await?;
            match self
                .push
                .attempt(
                    &repo,
                    &remote_name,
                    &branch,
                    &remote_repo,
                    &expected,
                    force_with_lease,
                )
                .await
            {
                Ok(result) => break result,
                Err(e) => self.attempt_failed(run, attempt, e, cancel).await?,
            }
        };

        if result.already_published {
            run.observed_remote_hash = Some(result.local_commit_hash.clone());
            run.push_result = Some(result);
            run.finish(RunOutcome::AlreadyPublished);
        } else {
            run.push_result = Some(result);
            run.advance();
        }
        Ok(())
    }

    async fn verify_step(
        &self,
        run: &mut PipelineRun,
        cancel: &CancelSignal,
    ) -> Result<(), PublishError> {
        let pushed = run
            .push_result
            .clone()
            .ok_or_else(|| PublishError::repository("no push recorded to verify"))?;
        let remote_repo = run.request.remote_repo.clone();

        let verification = loop {
            let attempt = self.begin_attempt(run).await?;
            match self.verify.run(&remote_repo, &pushed, cancel).await {
                Ok(verification) => break verification,
                Err(e) => self.attempt_failed(run, attempt, e, cancel).await?,
            }
        };
        run.observed_remote_hash = verification.observed_hash;
        run.finish(RunOutcome::Published);
        Ok(())
    }

    fn nothing_to_publish(&self, run: &mut PipelineRun) {
        info!(run_id = %run.run_id, "Working tree is clean; nothing to publish");
        self.progress.emit(
            run.run_id,
            Stage::Commit,
            EventOutcome::Skipped {
                reason: RunOutcome::NothingToPublish.to_string(),
            },
            0,
        );
        run.finish(RunOutcome::NothingToPublish);
    }

    async fn begin_attempt(&self, run: &mut PipelineRun) -> Result<u32, PublishError> {
        let attempt = run.record_attempt();
        self.persist(run).await?;
        self.emit(run, EventOutcome::Attempt, attempt);
        Ok(attempt)
    }

    /// Decide what follows a failed attempt. Returns `Ok` once the retry
    /// delay has elapsed, or the error that ends the stage.
    async fn attempt_failed(
        &self,
        run: &mut PipelineRun,
        attempt: u32,
        error: PublishError,
        cancel: &CancelSignal,
    ) -> Result<(), PublishError> {
        let decision = self.policy.decide_for(&error, attempt);
        if !decision.should_retry {
            if decision.reason == ReasonCode::AttemptsExhausted {
                warn!(run_id = %run.run_id, stage = %run.current_stage(), attempt, error = %error, "Retries exhausted");
            }
            return Err(error);
        }

        warn!(
            run_id = %run.run_id,
            stage = %run.current_stage(),
            attempt,
            delay_ms = decision.delay.as_millis() as u64,
            error = %error,
            "Attempt failed; retrying"
        );
        let message = error.to_string();
        run.record_error(error);
        self.persist(run).await?;
        self.emit(
            run,
            EventOutcome::Retrying {
                delay_ms: decision.delay.as_millis() as u64,
                reason: decision.reason,
                error: message,
            },
            attempt,
        );
        cancel.sleep(decision.delay).await
    }

    async fn fail(&self, mut run: PipelineRun, error: PublishError) -> RunFailure {
        error!(run_id = %run.run_id, stage = %run.current_stage(), error = %error, "Run failed");
        let stage = run.current_stage();
        let attempts = run.attempts(stage);
        run.fail(error.clone());
        if let Err(e) = self.store.save(&run).await {
            error!(run_id = %run.run_id, error = %e, "Could not persist failed run");
        }
        self.progress.emit(
            run.run_id,
            stage,
            EventOutcome::Failed {
                error: error.to_string(),
            },
            attempts,
        );
        RunFailure::from_run(&run)
    }

    async fn persist(&self, run: &PipelineRun) -> Result<(), PublishError> {
        self.store.save(run).await.map_err(PublishError::from)
    }

    fn emit(&self, run: &PipelineRun, outcome: EventOutcome, attempt: u32) {
        self.progress
            .emit(run.run_id, run.current_stage(), outcome, attempt);
    }
}

enum CommitStep {
    Committed(CommitOutcome),
    AdoptedTip(String),
    Clean,
}

fn short_hash(hash: &str) -> &str {
    hash.get(..8).unwrap_or(hash)
}
