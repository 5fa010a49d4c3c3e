//! The persisted unit of work: [`PipelineRun`] and its stage machine.
//!
//! A run only moves forward through [`Stage`] (or into `Failed`). The one
//! exception is [`PipelineRun::resume_from`], an explicit request to re-enter
//! an earlier stage of a run that has not terminated.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::contract::{PushResult, Selection};
use crate::error::PublishError;

pub const DEFAULT_REMOTE: &str = "origin";
pub const DEFAULT_COMMIT_MESSAGE: &str = "Update via gh-publish";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Scan,
    Commit,
    Push,
    Verify,
    Done,
    Failed,
}

impl Stage {
    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Scan => Some(Stage::Commit),
            Stage::Commit => Some(Stage::Push),
            Stage::Push => Some(Stage::Verify),
            Stage::Verify => Some(Stage::Done),
            Stage::Done | Stage::Failed => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Done | Stage::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Scan => "scan",
            Stage::Commit => "commit",
            Stage::Push => "push",
            Stage::Verify => "verify",
            Stage::Done => "done",
            Stage::Failed => "failed",
        }
    }

    /// Past-tense label used when explaining how far a run got.
    pub fn completed_label(self) -> &'static str {
        match self {
            Stage::Scan => "scanned",
            Stage::Commit => "committed",
            Stage::Push => "pushed",
            Stage::Verify => "verified",
            Stage::Done => "done",
            Stage::Failed => "failed",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the caller asked to publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishRequest {
    pub repo_path: PathBuf,
    /// Remote repository as `owner/name`, used for verification.
    pub remote_repo: String,
    pub remote_name: String,
    /// Branch to push; the checked-out branch when `None`.
    pub branch: Option<String>,
    pub message: String,
    pub selection: Selection,
    pub author: Option<String>,
    /// Overwrite a diverged remote branch, guarded by a lease on the hash
    /// the remote was last observed at.
    #[serde(default)]
    pub force_with_lease: bool,
}

impl PublishRequest {
    pub fn new(repo_path: impl Into<PathBuf>, remote_repo: impl Into<String>) -> Self {
        PublishRequest {
            repo_path: repo_path.into(),
            remote_repo: remote_repo.into(),
            remote_name: DEFAULT_REMOTE.to_string(),
            branch: None,
            message: DEFAULT_COMMIT_MESSAGE.to_string(),
            selection: Selection::All,
            author: None,
            force_with_lease: false,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    pub fn with_remote_name(mut self, remote_name: impl Into<String>) -> Self {
        self.remote_name = remote_name.into();
        self
    }

    pub fn with_selection(mut self, selection: Selection) -> Self {
        self.selection = selection;
        self
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    pub fn with_force_with_lease(mut self, force: bool) -> Self {
        self.force_with_lease = force;
        self
    }
}

/// How a successful run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Pushed and confirmed on the remote.
    Published,
    /// The remote already held the commit; nothing was pushed.
    AlreadyPublished,
    /// The working tree had no changes.
    NothingToPublish,
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            RunOutcome::Published => "published",
            RunOutcome::AlreadyPublished => "already published",
            RunOutcome::NothingToPublish => "nothing to publish",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub run_id: Uuid,
    pub request: PublishRequest,
    /// Branch resolved during the scan.
    pub branch: Option<String>,
    current_stage: Stage,
    last_completed_stage: Option<Stage>,
    failed_stage: Option<Stage>,
    attempt_counts: BTreeMap<Stage, u32>,
    last_error: Option<PublishError>,
    pub commit_hash: Option<String>,
    pub push_result: Option<PushResult>,
    pub observed_remote_hash: Option<String>,
    outcome: Option<RunOutcome>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PipelineRun {
    pub fn new(request: PublishRequest) -> Self {
        let now = Utc::now();
        PipelineRun {
            run_id: Uuid::new_v4(),
            branch: request.branch.clone(),
            request,
            current_stage: Stage::Scan,
            last_completed_stage: None,
            failed_stage: None,
            attempt_counts: BTreeMap::new(),
            last_error: None,
            commit_hash: None,
            push_result: None,
            observed_remote_hash: None,
            outcome: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn current_stage(&self) -> Stage {
        self.current_stage
    }

    pub fn last_completed_stage(&self) -> Option<Stage> {
        self.last_completed_stage
    }

    /// Stage that was executing when the run failed.
    pub fn failed_stage(&self) -> Option<Stage> {
        self.failed_stage
    }

    pub fn last_error(&self) -> Option<&PublishError> {
        self.last_error.as_ref()
    }

    pub fn outcome(&self) -> Option<RunOutcome> {
        self.outcome
    }

    pub fn is_terminal(&self) -> bool {
        self.current_stage.is_terminal()
    }

    pub fn attempts(&self, stage: Stage) -> u32 {
        self.attempt_counts.get(&stage).copied().unwrap_or(0)
    }

    /// Count a new attempt at the current stage and return its number.
    pub fn record_attempt(&mut self) -> u32 {
        let counter = self.attempt_counts.entry(self.current_stage).or_insert(0);
        *counter += 1;
        let attempt = *counter;
        self.touch();
        attempt
    }

    pub fn record_error(&mut self, error: PublishError) {
        self.last_error = Some(error);
        self.touch();
    }

    /// Mark the current stage complete and move to the next one.
    pub fn advance(&mut self) -> Stage {
        if let Some(next) = self.current_stage.next() {
            self.last_completed_stage = Some(self.current_stage);
            self.current_stage = next;
            self.touch();
        }
        self.current_stage
    }

    /// Mark the current stage complete and end the run successfully.
    pub fn finish(&mut self, outcome: RunOutcome) {
        if self.is_terminal() {
            return;
        }
        self.last_completed_stage = Some(self.current_stage);
        self.current_stage = Stage::Done;
        self.outcome = Some(outcome);
        self.touch();
    }

    pub fn fail(&mut self, error: PublishError) {
        if self.is_terminal() {
            return;
        }
        self.failed_stage = Some(self.current_stage);
        self.current_stage = Stage::Failed;
        self.last_error = Some(error);
        self.touch();
    }

    /// Explicitly re-enter `stage`. Only allowed for non-terminal runs and
    /// only for a stage at or before the current one.
    pub fn resume_from(&mut self, stage: Stage) -> Result<(), PublishError> {
        if self.is_terminal() {
            return Err(PublishError::repository(format!(
                "run {} is {} and cannot be resumed",
                self.run_id, self.current_stage
            )));
        }
        if stage.is_terminal() || stage > self.current_stage {
            return Err(PublishError::repository(format!(
                "cannot resume run {} at {stage} from {}",
                self.run_id, self.current_stage
            )));
        }
        self.current_stage = stage;
        self.last_completed_stage = match stage {
            Stage::Scan => None,
            Stage::Commit => Some(Stage::Scan),
            Stage::Push => Some(Stage::Commit),
            _ => Some(Stage::Push),
        };
        if stage <= Stage::Commit {
            self.commit_hash = None;
        }
        if stage <= Stage::Push {
            self.push_result = None;
        }
        self.touch();
        Ok(())
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
