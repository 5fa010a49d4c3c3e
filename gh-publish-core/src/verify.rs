//! Post-push verification against the remote host.
//!
//! The remote ref checked is `refs/heads/<branch>` of the repository named in
//! the request. Propagation can lag the push acknowledgement, so the stage
//! polls with a bounded interval and deadline from [`VerifyConfig`].

use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cancel::CancelSignal;
use crate::config::VerifyConfig;
use crate::contract::{PushResult, RemotePort};
use crate::error::PublishError;

/// Outcome of a single look at the remote ref.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe {
    /// The ref points at the expected commit.
    Landed,
    /// The ref is missing (`None`) or points elsewhere.
    NotLanded { observed: Option<String> },
    /// The remote could not be asked.
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verification {
    pub confirmed: bool,
    pub observed_hash: Option<String>,
}

#[derive(Clone)]
pub struct VerifyStage {
    remote: Arc<dyn RemotePort>,
    config: VerifyConfig,
}

impl VerifyStage {
    pub fn new(remote: Arc<dyn RemotePort>, config: VerifyConfig) -> Self {
        VerifyStage { remote, config }
    }

    pub fn remote(&self) -> &Arc<dyn RemotePort> {
        &self.remote
    }

    /// Single non-blocking check, used before a push to detect that an
    /// earlier attempt already landed.
    pub async fn probe(&self, remote_repo: &str, branch: &str, expected: &str) -> Probe {
        match self.remote.get_ref_hash(remote_repo, branch).await {
            Ok(Some(hash)) if hash == expected => Probe::Landed,
            Ok(observed) => Probe::NotLanded { observed },
            Err(e) => {
                warn!(error = %e, remote_repo, branch, "Could not read remote ref");
                Probe::Unknown
            }
        }
    }

    /// Poll until the remote ref equals the pushed commit or the deadline
    /// passes. Retryable remote errors count as "not yet"; anything else ends
    /// verification immediately.
    pub async fn run(
        &self,
        remote_repo: &str,
        pushed: &PushResult,
        cancel: &CancelSignal,
    ) -> Result<Verification, PublishError> {
        let expected = pushed.local_commit_hash.as_str();
        let started = Instant::now();
        let deadline = started + self.config.timeout();
        let mut observed = None;
        let mut polls = 0u32;

        loop {
            polls += 1;
            match self.remote.get_ref_hash(remote_repo, &pushed.branch).await {
                Ok(Some(hash)) if hash == expected => {
                    info!(remote_repo, branch = %pushed.branch, commit = expected, polls, "Push verified on remote");
                    return Ok(Verification {
                        confirmed: true,
                        observed_hash: Some(hash),
                    });
                }
                Ok(hash) => {
                    debug!(remote_repo, observed = ?hash, expected, polls, "Remote ref not updated yet");
                    observed = hash;
                }
                Err(e) if e.is_retryable() => {
                    warn!(error = %e, remote_repo, polls, "Remote ref lookup failed; will poll again");
                }
                Err(e) => return Err(e),
            }

            let now = Instant::now();
            if now >= deadline {
                let waited_ms = now.duration_since(started).as_millis() as u64;
                warn!(remote_repo, expected, observed = ?observed, waited_ms, "Verification timed out");
                return Err(PublishError::VerificationTimeout {
                    expected: expected.to_string(),
                    observed,
                    waited_ms,
                });
            }
            let wait = self.config.poll_interval().min(deadline - now);
            cancel.sleep(wait).await?;
        }
    }
}
