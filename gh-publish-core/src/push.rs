//! Push stage. One call is one attempt; the runner owns the retry loop.

use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use crate::contract::{PushMode, PushResult, VcsPort};
use crate::error::PublishError;
use crate::verify::{Probe, VerifyStage};

#[derive(Clone)]
pub struct PushStage {
    vcs: Arc<dyn VcsPort>,
    verifier: VerifyStage,
}

impl PushStage {
    pub fn new(vcs: Arc<dyn VcsPort>, verifier: VerifyStage) -> Self {
        PushStage { vcs, verifier }
    }

    /// Push `expected_hash` to `remote_name/branch`.
    ///
    /// Before touching the network the local tip is checked against
    /// `expected_hash`, and the remote is probed: if the commit is already
    /// there the push is skipped and the result is marked
    /// `already_published`. Repeating a successful attempt therefore never
    /// mutates the remote twice.
    ///
    /// With `force_with_lease` the remote ref must be readable: its hash
    /// becomes the lease, so the overwrite only happens if nobody pushed
    /// between the read and the push.
    pub async fn attempt(
        &self,
        repo: &Path,
        remote_name: &str,
        branch: &str,
        remote_repo: &str,
        expected_hash: &str,
        force_with_lease: bool,
    ) -> Result<PushResult, PublishError> {
        let tip = self.vcs.current_branch_tip(repo).await?;
        if tip != expected_hash {
            warn!(expected = expected_hash, actual = %tip, "Local branch tip moved; refusing to push");
            return Err(PublishError::BranchTipChanged {
                expected: expected_hash.to_string(),
                actual: tip,
            });
        }

        let mode = if force_with_lease {
            let observed = self
                .verifier
                .remote()
                .get_ref_hash(remote_repo, branch)
                .await?;
            if observed.as_deref() == Some(expected_hash) {
                return Ok(self.already_published(remote_name, branch, expected_hash));
            }
            info!(remote_repo, branch, observed = ?observed, "Forcing push with lease");
            PushMode::ForceWithLease { expected: observed }
        } else {
            if self.verifier.probe(remote_repo, branch, expected_hash).await == Probe::Landed {
                return Ok(self.already_published(remote_name, branch, expected_hash));
            }
            PushMode::FastForward
        };

        match self.vcs.push(repo, remote_name, branch, mode).await {
            Ok(result) => Ok(result),
            Err(PublishError::NonFastForward {
                branch: rejected_branch,
                remote_hash: None,
                message,
            }) => {
                let remote_hash = self
                    .verifier
                    .remote()
                    .get_ref_hash(remote_repo, branch)
                    .await
                    .ok()
                    .flatten();
                Err(PublishError::NonFastForward {
                    branch: if rejected_branch.is_empty() {
                        branch.to_string()
                    } else {
                        rejected_branch
                    },
                    remote_hash,
                    message,
                })
            }
            Err(e) => Err(e),
        }
    }

    fn already_published(&self, remote_name: &str, branch: &str, hash: &str) -> PushResult {
        info!(branch, commit = hash, "Commit already on remote; skipping push");
        PushResult {
            local_commit_hash: hash.to_string(),
            branch: branch.to_string(),
            remote_name: remote_name.to_string(),
            already_published: true,
        }
    }
}
