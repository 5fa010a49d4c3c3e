//! Error taxonomy for the publish pipeline.
//!
//! Adapters (the `git` driver, the remote host client) classify every failure
//! into a [`PublishError`] variant, so the runner never has to look at exit
//! codes or raw process output. [`ErrorClass`] is the flattened view consumed
//! by [`crate::retry::RetryPolicy`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classified failure raised by a port or a stage.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "class", rename_all = "snake_case")]
pub enum PublishError {
    /// Not a repository, conflicted working tree, or an unexpected VCS failure.
    #[error("repository error: {message}")]
    Repository { message: String },

    /// The selected paths produced no staged diff.
    #[error("nothing to commit: {message}")]
    NothingToCommit { message: String },

    /// Connection reset, DNS failure, 5xx and similar.
    #[error("transient network error: {message}")]
    TransientNetwork { message: String },

    /// Remote-side lock, local ref lock or rate limiting.
    #[error("remote is locked or rate limited: {message}")]
    RemoteLock {
        message: String,
        retry_after_secs: Option<u64>,
    },

    /// A blocking process call exceeded its timeout.
    #[error("`{command}` timed out after {timeout_ms}ms")]
    ProcessTimeout { command: String, timeout_ms: u64 },

    /// Expired or invalid credential.
    #[error("authentication failed: {message}")]
    Auth { message: String },

    /// The remote branch has diverged from the local one.
    #[error(
        "push to `{branch}` rejected as non-fast-forward (remote at {}): {message}",
        .remote_hash.as_deref().unwrap_or("unknown")
    )]
    NonFastForward {
        branch: String,
        remote_hash: Option<String>,
        message: String,
    },

    /// The pushed commit was not observed on the remote before the deadline.
    /// The push itself may still have succeeded.
    #[error(
        "verification timed out after {waited_ms}ms: expected {expected}, remote at {}",
        .observed.as_deref().unwrap_or("nothing")
    )]
    VerificationTimeout {
        expected: String,
        observed: Option<String>,
        waited_ms: u64,
    },

    /// The local branch tip is no longer the commit this run produced.
    #[error("local branch tip moved from {expected} to {actual}")]
    BranchTipChanged { expected: String, actual: String },

    #[error("run cancelled")]
    Cancelled,

    #[error("run store error: {message}")]
    Store { message: String },
}

/// Coarse error class used by the retry policy and in progress events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Repository,
    NothingToCommit,
    TransientNetwork,
    RemoteLock,
    ProcessTimeout,
    Auth,
    NonFastForward,
    VerificationTimeout,
    BranchTipChanged,
    Cancelled,
    Store,
}

impl ErrorClass {
    pub const ALL: [ErrorClass; 11] = [
        ErrorClass::Repository,
        ErrorClass::NothingToCommit,
        ErrorClass::TransientNetwork,
        ErrorClass::RemoteLock,
        ErrorClass::ProcessTimeout,
        ErrorClass::Auth,
        ErrorClass::NonFastForward,
        ErrorClass::VerificationTimeout,
        ErrorClass::BranchTipChanged,
        ErrorClass::Cancelled,
        ErrorClass::Store,
    ];

    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorClass::TransientNetwork | ErrorClass::RemoteLock | ErrorClass::ProcessTimeout
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::Repository => "repository",
            ErrorClass::NothingToCommit => "nothing_to_commit",
            ErrorClass::TransientNetwork => "transient_network",
            ErrorClass::RemoteLock => "remote_lock",
            ErrorClass::ProcessTimeout => "process_timeout",
            ErrorClass::Auth => "auth",
            ErrorClass::NonFastForward => "non_fast_forward",
            ErrorClass::VerificationTimeout => "verification_timeout",
            ErrorClass::BranchTipChanged => "branch_tip_changed",
            ErrorClass::Cancelled => "cancelled",
            ErrorClass::Store => "store",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl PublishError {
    pub fn repository(message: impl Into<String>) -> Self {
        PublishError::Repository {
            message: message.into(),
        }
    }

    pub fn nothing_to_commit(message: impl Into<String>) -> Self {
        PublishError::NothingToCommit {
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        PublishError::TransientNetwork {
            message: message.into(),
        }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        PublishError::Auth {
            message: message.into(),
        }
    }

    pub fn locked(message: impl Into<String>, retry_after_secs: Option<u64>) -> Self {
        PublishError::RemoteLock {
            message: message.into(),
            retry_after_secs,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            PublishError::Repository { .. } => ErrorClass::Repository,
            PublishError::NothingToCommit { .. } => ErrorClass::NothingToCommit,
            PublishError::TransientNetwork { .. } => ErrorClass::TransientNetwork,
            PublishError::RemoteLock { .. } => ErrorClass::RemoteLock,
            PublishError::ProcessTimeout { .. } => ErrorClass::ProcessTimeout,
            PublishError::Auth { .. } => ErrorClass::Auth,
            PublishError::NonFastForward { .. } => ErrorClass::NonFastForward,
            PublishError::VerificationTimeout { .. } => ErrorClass::VerificationTimeout,
            PublishError::BranchTipChanged { .. } => ErrorClass::BranchTipChanged,
            PublishError::Cancelled => ErrorClass::Cancelled,
            PublishError::Store { .. } => ErrorClass::Store,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class().is_retryable()
    }

    /// True when the failure leaves the publish outcome unknown rather than
    /// confirmed failed.
    pub fn is_uncertain(&self) -> bool {
        matches!(self, PublishError::VerificationTimeout { .. })
    }

    /// Server-provided hint for how long to back off, if any.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            PublishError::RemoteLock {
                retry_after_secs, ..
            } => *retry_after_secs,
            _ => None,
        }
    }
}
