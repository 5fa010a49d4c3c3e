#![allow(unused)]

//! # contract: ports and data model for the publish pipeline
//!
//! This module defines the traits the pipeline consumes ([`VcsPort`],
//! [`RemotePort`], [`MessageEnhancer`]) and the plain data types that flow
//! between the stages ([`ChangeSet`], [`CommitSpec`], [`PushResult`]).
//!
//! ## Interface & Extensibility
//! - Implement [`VcsPort`] to drive a different version-control front end; the
//!   bundled implementation is [`crate::git::GitCli`].
//! - Implement [`RemotePort`] for a repository host; the CLI crate ships a
//!   GitHub client.
//! - All methods are async and return a classified [`PublishError`], never raw
//!   exit codes or process output.
//!
//! ## Mocking & Testing
//! - The traits are annotated for `mockall`, so tests can script every port
//!   without a live repository or network.

use std::collections::BTreeSet;
use std::path::Path;

use async_trait::async_trait;
use mockall::{automock, predicate::*};
use serde::{Deserialize, Serialize};

use crate::error::PublishError;

/// Kind of change observed in the working tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
    Renamed,
}

/// One changed path. `original_path` is set for renames only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub kind: ChangeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_path: Option<String>,
}

impl FileChange {
    pub fn new(path: impl Into<String>, kind: ChangeKind) -> Self {
        FileChange {
            path: path.into(),
            kind,
            original_path: None,
        }
    }

    pub fn renamed(from: impl Into<String>, to: impl Into<String>) -> Self {
        FileChange {
            path: to.into(),
            kind: ChangeKind::Renamed,
            original_path: Some(from.into()),
        }
    }
}

/// Ordered set of changes produced by one scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    changes: Vec<FileChange>,
}

impl ChangeSet {
    pub fn new(changes: Vec<FileChange>) -> Self {
        ChangeSet { changes }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FileChange> {
        self.changes.iter()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.changes.iter().map(|c| c.path.as_str())
    }

    /// Changes matched by `selection`, in scan order.
    pub fn select(&self, selection: &Selection) -> ChangeSet {
        let changes = match selection {
            Selection::All => self.changes.clone(),
            Selection::Paths(paths) => self
                .changes
                .iter()
                .filter(|c| paths.contains(&c.path))
                .cloned()
                .collect(),
        };
        ChangeSet { changes }
    }
}

impl<'a> IntoIterator for &'a ChangeSet {
    type Item = &'a FileChange;
    type IntoIter = std::slice::Iter<'a, FileChange>;

    fn into_iter(self) -> Self::IntoIter {
        self.changes.iter()
    }
}

/// Which scanned paths a publish should include. `All` is expanded into the
/// concrete scanned paths; nothing is ever staged wholesale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "paths", rename_all = "snake_case")]
pub enum Selection {
    All,
    Paths(BTreeSet<String>),
}

impl Selection {
    pub fn paths<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Selection::Paths(paths.into_iter().map(Into::into).collect())
    }
}

/// What a commit was built from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitSpec {
    pub message: String,
    pub selected_paths: BTreeSet<String>,
    pub author_override: Option<String>,
}

/// Outcome of a push attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushResult {
    pub local_commit_hash: String,
    pub branch: String,
    pub remote_name: String,
    /// The remote already held the commit, so nothing was pushed.
    #[serde(default)]
    pub already_published: bool,
}

/// How a push treats a remote branch the local tip does not descend from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum PushMode {
    /// Fast-forward only; divergence fails with `NonFastForward`.
    #[default]
    FastForward,
    /// Overwrite the remote branch, but only while it still points at
    /// `expected`. `None` means the branch must not exist yet.
    ForceWithLease { expected: Option<String> },
}

/// A repository on the remote host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoRef {
    /// `owner/name`.
    pub full_name: String,
    pub default_branch: Option<String>,
    pub private: bool,
    pub clone_url: Option<String>,
    pub html_url: Option<String>,
}

/// Error type for the message enhancer hook (simple boxed error).
pub type EnhanceError = Box<dyn std::error::Error + Send + Sync>;

/// Typed surface over version-control primitives.
///
/// Implementors classify failures into [`PublishError`] at this boundary.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait VcsPort: Send + Sync {
    /// Current working-tree changes. Never cached.
    async fn status(&self, repo: &Path) -> Result<ChangeSet, PublishError>;

    /// Stage exactly `paths` (additions, modifications and deletions).
    async fn stage(&self, repo: &Path, paths: &[String]) -> Result<(), PublishError>;

    /// Commit exactly `paths` and return the new commit hash. Index entries
    /// outside `paths` stay staged and are not part of the commit.
    async fn commit(
        &self,
        repo: &Path,
        message: &str,
        paths: &[String],
        author: Option<String>,
    ) -> Result<String, PublishError>;

    async fn push(
        &self,
        repo: &Path,
        remote: &str,
        branch: &str,
        mode: PushMode,
    ) -> Result<PushResult, PublishError>;

    async fn current_branch_tip(&self, repo: &Path) -> Result<String, PublishError>;

    async fn current_branch(&self, repo: &Path) -> Result<String, PublishError>;
}

/// Typed surface over the repository host.
///
/// Rate limiting must surface as [`PublishError::RemoteLock`].
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait RemotePort: Send + Sync {
    async fn list_repositories(&self, account: &str) -> Result<Vec<RepoRef>, PublishError>;

    /// Create `name` under the authenticated account.
    async fn create_repository(
        &self,
        name: &str,
        private: bool,
        description: Option<String>,
    ) -> Result<RepoRef, PublishError>;

    /// Commit hash at `refs/heads/<branch>`, or `None` if the ref does not exist.
    async fn get_ref_hash(&self, repo: &str, branch: &str)
        -> Result<Option<String>, PublishError>;
}

/// Optional commit-message transform (for example an LLM summariser).
/// Failures are never fatal: the raw message is used instead.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait MessageEnhancer: Send + Sync {
    async fn enhance(&self, raw_message: &str, changes: &ChangeSet)
        -> Result<String, EnhanceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ChangeSet {
        ChangeSet::new(vec![
            FileChange::new("a.txt", ChangeKind::Added),
            FileChange::new("b.txt", ChangeKind::Modified),
            FileChange::renamed("old.txt", "new.txt"),
            FileChange::new("gone.txt", ChangeKind::Deleted),
        ])
    }

    #[test]
    fn select_keeps_scan_order_and_ignores_unknown_paths() {
        let selected = sample().select(&Selection::paths(["gone.txt", "a.txt", "missing.txt"]));
        let paths: Vec<_> = selected.paths().collect();
        assert_eq!(paths, vec!["a.txt", "gone.txt"]);
    }

    #[test]
    fn select_all_is_the_whole_change_set() {
        assert_eq!(sample().select(&Selection::All), sample());
    }

    #[test]
    fn selection_serialises_with_mode_tag() {
        let json = serde_json::to_string(&Selection::paths(["x"])).unwrap();
        assert_eq!(json, r#"{"mode":"paths","paths":["x"]}"#);
        let all: Selection = serde_json::from_str(r#"{"mode":"all"}"#).unwrap();
        assert_eq!(all, Selection::All);
    }
}
