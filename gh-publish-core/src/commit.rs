//! Commit stage: stage exactly the selected paths and create one commit.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::contract::{ChangeSet, CommitSpec, MessageEnhancer, Selection, VcsPort};
use crate::error::PublishError;
use crate::run::DEFAULT_COMMIT_MESSAGE;

/// Result of a successful commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitOutcome {
    pub commit_spec: CommitSpec,
    pub commit_hash: String,
}

#[derive(Clone)]
pub struct CommitStage {
    vcs: Arc<dyn VcsPort>,
    enhancer: Option<Arc<dyn MessageEnhancer>>,
    enhancer_timeout: Duration,
}

impl CommitStage {
    pub fn new(
        vcs: Arc<dyn VcsPort>,
        enhancer: Option<Arc<dyn MessageEnhancer>>,
        enhancer_timeout: Duration,
    ) -> Self {
        CommitStage {
            vcs,
            enhancer,
            enhancer_timeout,
        }
    }

    pub async fn run(
        &self,
        repo: &Path,
        changes: &ChangeSet,
        selection: &Selection,
        raw_message: &str,
        author: Option<String>,
    ) -> Result<CommitOutcome, PublishError> {
        let selected = changes.select(selection);
        if selected.is_empty() {
            return Err(PublishError::nothing_to_commit(
                "none of the selected paths have changes; rescan and select again",
            ));
        }

        let paths = paths_to_stage(&selected);
        let message = self.resolve_message(raw_message, &selected).await;

        debug!(repo = %repo.display(), paths = paths.len(), "Staging selected paths");
        self.vcs.stage(repo, &paths).await?;
        let commit_hash = self
            .vcs
            .commit(repo, &message, &paths, author.clone())
            .await?;
        info!(repo = %repo.display(), commit = %commit_hash, files = selected.len(), "Commit stage complete");

        Ok(CommitOutcome {
            commit_spec: CommitSpec {
                message,
                selected_paths: selected.paths().map(str::to_string).collect(),
                author_override: author,
            },
            commit_hash,
        })
    }

    async fn resolve_message(&self, raw_message: &str, selected: &ChangeSet) -> String {
        let raw = if raw_message.trim().is_empty() {
            DEFAULT_COMMIT_MESSAGE.to_string()
        } else {
            raw_message.to_string()
        };
        let Some(enhancer) = &self.enhancer else {
            return raw;
        };
        match tokio::time::timeout(self.enhancer_timeout, enhancer.enhance(&raw, selected)).await
        {
            Ok(Ok(message)) if !message.trim().is_empty() => {
                debug!("Commit message enhanced");
                message
            }
            Ok(Ok(_)) => {
                warn!("Message enhancer returned an empty message; using the raw message");
                raw
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Message enhancer failed; using the raw message");
                raw
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.enhancer_timeout.as_millis() as u64,
                    "Message enhancer timed out; using the raw message"
                );
                raw
            }
        }
    }
}

/// Paths handed to `stage`: every selected path plus the source side of
/// renames, so the deletion half of a rename is staged too.
fn paths_to_stage(selected: &ChangeSet) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut paths = Vec::new();
    for change in selected {
        for path in std::iter::once(&change.path).chain(change.original_path.as_ref()) {
            if seen.insert(path.clone()) {
                paths.push(path.clone());
            }
        }
    }
    paths
}
