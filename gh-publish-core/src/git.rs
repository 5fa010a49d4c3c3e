//! [`VcsPort`] implementation that drives the system `git` binary.
//!
//! Every invocation runs through [`tokio::process::Command`] with a timeout,
//! terminal prompts disabled, and stdin closed. Failures are classified into
//! [`PublishError`] here, so nothing above this module ever inspects exit
//! codes or stderr text. Credentials embedded in remote URLs are masked
//! before anything is logged.

use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use crate::contract::{ChangeKind, ChangeSet, FileChange, PushMode, PushResult, VcsPort};
use crate::error::PublishError;

/// Captured result of one `git` invocation.
#[derive(Debug, Clone)]
pub struct GitOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    fn combined(&self) -> String {
        format!("{}\n{}", self.stderr.trim(), self.stdout.trim())
            .trim()
            .to_string()
    }
}

#[derive(Debug, Clone)]
pub struct GitCli {
    program: PathBuf,
    timeout: Duration,
    env_vars: Vec<(String, String)>,
}

impl GitCli {
    pub fn new(timeout: Duration) -> Self {
        GitCli {
            program: PathBuf::from("git"),
            timeout,
            env_vars: Vec::new(),
        }
    }

    /// Extra environment for every invocation (`GIT_SSH_COMMAND`, askpass
    /// helpers, ...). Values are never logged.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.push((key.into(), value.into()));
        self
    }

    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    #[instrument(skip(self, args), fields(repo = %repo.display()))]
    pub async fn run_git(&self, repo: &Path, args: &[&str]) -> Result<GitOutput, PublishError> {
        let command_line = redact(&format!("git {}", args.join(" "))).into_owned();
        let mut cmd = Command::new(&self.program);
        cmd.arg("-C").arg(repo).args(args);
        cmd.env("GIT_TERMINAL_PROMPT", "0");
        cmd.env("GCM_INTERACTIVE", "never");
        for (k, v) in &self.env_vars {
            cmd.env(k, v);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        debug!(command = %command_line, "spawning git");
        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                warn!(error = ?e, command = %command_line, "Failed to launch git process");
                return Err(PublishError::repository(format!(
                    "failed to launch git: {e}"
                )));
            }
            Err(_) => {
                warn!(command = %command_line, timeout_ms = self.timeout.as_millis() as u64, "git timed out");
                return Err(PublishError::ProcessTimeout {
                    command: command_line,
                    timeout_ms: self.timeout.as_millis() as u64,
                });
            }
        };

        let result = GitOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        if !result.success {
            debug!(
                command = %command_line,
                status = ?output.status,
                stderr = %redact(result.stderr.trim()),
                "git exited with non-zero status"
            );
        }
        Ok(result)
    }

    /// Run `args` and classify any failure.
    async fn run_checked(
        &self,
        repo: &Path,
        args: &[&str],
        branch: Option<&str>,
    ) -> Result<GitOutput, PublishError> {
        let output = self.run_git(repo, args).await?;
        if output.success {
            Ok(output)
        } else {
            Err(classify_failure(&output.combined(), branch))
        }
    }

    pub async fn is_repository(&self, repo: &Path) -> Result<bool, PublishError> {
        let output = self
            .run_git(repo, &["rev-parse", "--is-inside-work-tree"])
            .await?;
        Ok(output.success && output.stdout.trim() == "true")
    }

    /// `git init -b <branch>`.
    pub async fn init(&self, repo: &Path, branch: &str) -> Result<(), PublishError> {
        self.run_checked(repo, &["init", "-b", branch], None).await?;
        info!(repo = %repo.display(), branch, "Initialised git repository");
        Ok(())
    }

    pub async fn remote_url(&self, repo: &Path, name: &str) -> Result<Option<String>, PublishError> {
        let output = self.run_git(repo, &["remote", "get-url", name]).await?;
        if output.success {
            Ok(Some(output.stdout.trim().to_string()))
        } else {
            Ok(None)
        }
    }

    /// Point remote `name` at `url`, adding it if missing.
    pub async fn ensure_remote(&self, repo: &Path, name: &str, url: &str) -> Result<(), PublishError> {
        match self.remote_url(repo, name).await? {
            Some(existing) if existing == url => {}
            Some(_) => {
                self.run_checked(repo, &["remote", "set-url", name, url], None)
                    .await?;
            }
            None => {
                self.run_checked(repo, &["remote", "add", name, url], None)
                    .await?;
            }
        }
        info!(repo = %repo.display(), remote = name, url = %redact(url), "Remote configured");
        Ok(())
    }

    /// Refuse to scan a tree with an operation in progress.
    async fn ensure_not_mid_operation(&self, repo: &Path) -> Result<(), PublishError> {
        let output = self.run_git(repo, &["rev-parse", "--git-dir"]).await?;
        if !output.success {
            return Err(PublishError::repository(format!(
                "{} is not a git repository",
                repo.display()
            )));
        }
        let git_dir = PathBuf::from(output.stdout.trim());
        let git_dir = if git_dir.is_absolute() {
            git_dir
        } else {
            repo.join(git_dir)
        };
        for (marker, operation) in [
            ("MERGE_HEAD", "merge"),
            ("rebase-merge", "rebase"),
            ("rebase-apply", "rebase"),
            ("CHERRY_PICK_HEAD", "cherry-pick"),
            ("REVERT_HEAD", "revert"),
        ] {
            if tokio::fs::try_exists(git_dir.join(marker))
                .await
                .unwrap_or(false)
            {
                return Err(PublishError::repository(format!(
                    "{} has a {operation} in progress; finish or abort it first",
                    repo.display()
                )));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl VcsPort for GitCli {
    async fn status(&self, repo: &Path) -> Result<ChangeSet, PublishError> {
        self.ensure_not_mid_operation(repo).await?;
        let output = self
            .run_checked(
                repo,
                &["status", "--porcelain=v1", "-z", "--untracked-files=all"],
                None,
            )
            .await?;
        let changes = parse_porcelain_z(&output.stdout)?;
        debug!(repo = %repo.display(), changes = changes.len(), "git status parsed");
        Ok(changes)
    }

    async fn stage(&self, repo: &Path, paths: &[String]) -> Result<(), PublishError> {
        if paths.is_empty() {
            return Ok(());
        }
        let mut args = vec!["--literal-pathspecs", "add", "-A", "--"];
        args.extend(paths.iter().map(String::as_str));
        self.run_checked(repo, &args, None).await?;
        debug!(repo = %repo.display(), paths = paths.len(), "Staged paths");
        Ok(())
    }

    async fn commit(
        &self,
        repo: &Path,
        message: &str,
        paths: &[String],
        author: Option<String>,
    ) -> Result<String, PublishError> {
        if paths.is_empty() {
            return Err(PublishError::nothing_to_commit("no paths given to commit"));
        }
        let mut args = vec!["--literal-pathspecs", "commit", "-m", message];
        if let Some(author) = author.as_deref() {
            args.push("--author");
            args.push(author);
        }
        args.extend(["--only", "--"]);
        args.extend(paths.iter().map(String::as_str));
        let output = self.run_git(repo, &args).await?;
        if !output.success {
            let text = output.combined();
            let lower = text.to_lowercase();
            if lower.contains("nothing to commit")
                || lower.contains("no changes added to commit")
                || lower.contains("nothing added to commit")
            {
                return Err(PublishError::nothing_to_commit(text));
            }
            return Err(classify_failure(&text, None));
        }
        let hash = self.current_branch_tip(repo).await?;
        info!(repo = %repo.display(), commit = %hash, "Created commit");
        Ok(hash)
    }

    async fn push(
        &self,
        repo: &Path,
        remote: &str,
        branch: &str,
        mode: PushMode,
    ) -> Result<PushResult, PublishError> {
        let tip = self.current_branch_tip(repo).await?;
        let refspec = format!("HEAD:refs/heads/{branch}");
        let mut args = vec!["push".to_string(), "--set-upstream".to_string()];
        if let PushMode::ForceWithLease { expected } = &mode {
            args.push(lease_arg(branch, expected.as_deref()));
        }
        args.push(remote.to_string());
        args.push(refspec);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run_checked(repo, &args, Some(branch)).await?;
        info!(repo = %repo.display(), remote, branch, commit = %tip, ?mode, "Pushed branch");
        Ok(PushResult {
            local_commit_hash: tip,
            branch: branch.to_string(),
            remote_name: remote.to_string(),
            already_published: false,
        })
    }

    async fn current_branch_tip(&self, repo: &Path) -> Result<String, PublishError> {
        let output = self
            .run_git(repo, &["rev-parse", "--verify", "HEAD^{commit}"])
            .await?;
        if !output.success {
            let text = output.combined();
            if text.to_lowercase().contains("not a git repository") {
                return Err(classify_failure(&text, None));
            }
            return Err(PublishError::repository(format!(
                "branch has no commits yet: {text}"
            )));
        }
        Ok(output.stdout.trim().to_string())
    }

    async fn current_branch(&self, repo: &Path) -> Result<String, PublishError> {
        let output = self
            .run_git(repo, &["symbolic-ref", "--short", "-q", "HEAD"])
            .await?;
        let name = output.stdout.trim();
        if !output.success || name.is_empty() {
            let text = output.combined();
            if text.to_lowercase().contains("not a git repository") {
                return Err(classify_failure(&text, None));
            }
            return Err(PublishError::repository(
                "HEAD is detached; check out a branch or name one explicitly",
            ));
        }
        Ok(name.to_string())
    }
}

/// `--force-with-lease` pinned to the hash the remote branch was last seen at.
/// An empty expectation makes git require that the branch does not exist.
fn lease_arg(branch: &str, expected: Option<&str>) -> String {
    format!(
        "--force-with-lease=refs/heads/{branch}:{}",
        expected.unwrap_or_default()
    )
}

/// Parse `git status --porcelain=v1 -z` output.
///
/// Unmerged entries make the whole tree unpublishable and yield
/// [`PublishError::Repository`].
pub fn parse_porcelain_z(output: &str) -> Result<ChangeSet, PublishError> {
    let mut changes = Vec::new();
    let mut entries = output.split('\0').filter(|e| !e.is_empty());
    while let Some(entry) = entries.next() {
        if entry.len() < 4 {
            continue;
        }
        let (code, path) = entry.split_at(3);
        let mut chars = code.chars();
        let x = chars.next().unwrap_or(' ');
        let y = chars.next().unwrap_or(' ');

        if is_unmerged(x, y) {
            return Err(PublishError::repository(format!(
                "unresolved merge conflict in {path}"
            )));
        }
        match (x, y) {
            ('!', '!') => continue,
            ('?', '?') => changes.push(FileChange::new(path, ChangeKind::Added)),
            _ if x == 'R' || y == 'R' => {
                let original = entries.next().unwrap_or_default();
                changes.push(FileChange::renamed(original, path));
            }
            _ if x == 'C' || y == 'C' => {
                // Copy source is reported like a rename source; the copy
                // itself is a new file.
                let _source = entries.next();
                changes.push(FileChange::new(path, ChangeKind::Added));
            }
            _ if x == 'D' || y == 'D' => changes.push(FileChange::new(path, ChangeKind::Deleted)),
            _ if x == 'A' => changes.push(FileChange::new(path, ChangeKind::Added)),
            _ => changes.push(FileChange::new(path, ChangeKind::Modified)),
        }
    }
    Ok(ChangeSet::new(changes))
}

fn is_unmerged(x: char, y: char) -> bool {
    matches!(
        (x, y),
        ('D', 'D') | ('A', 'U') | ('U', 'D') | ('U', 'A') | ('D', 'U') | ('A', 'A') | ('U', 'U')
    )
}

/// Map `git` failure output to the error taxonomy. `branch` is the branch
/// being pushed, if any, and is carried into non-fast-forward errors.
pub fn classify_failure(output: &str, branch: Option<&str>) -> PublishError {
    let message = redact(output.trim()).into_owned();
    let lower = message.to_lowercase();
    let any = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

    if any(&["not a git repository"]) {
        return PublishError::repository(message);
    }
    if any(&["index.lock", "cannot lock ref", "unable to lock", "is locked"]) {
        return PublishError::locked(message, None);
    }
    if any(&["rate limit", "too many requests", "error: 429", " 429 "]) {
        return PublishError::locked(message, None);
    }
    if any(&[
        "non-fast-forward",
        "fetch first",
        "updates were rejected",
        "[rejected]",
    ]) {
        return PublishError::NonFastForward {
            branch: branch.unwrap_or_default().to_string(),
            remote_hash: None,
            message,
        };
    }
    if any(&[
        "authentication failed",
        "could not read username",
        "could not read password",
        "invalid username or password",
        "permission denied",
        "terminal prompts disabled",
        "returned error: 401",
        "returned error: 403",
        "repository not found",
    ]) {
        return PublishError::auth(message);
    }
    if any(&[
        "could not resolve host",
        "connection reset",
        "connection refused",
        "connection timed out",
        "operation timed out",
        "early eof",
        "rpc failed",
        "remote end hung up",
        "returned error: 5",
        "failed to connect",
        "network is unreachable",
        "tls connection",
        "ssl_error",
        "unable to access",
    ]) {
        return PublishError::transient(message);
    }
    PublishError::repository(message)
}

fn credential_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)(https?://)([^:/@\s]+):([^@\s]+)@").expect("credential pattern is valid")
    })
}

/// Mask `user:secret@` segments in URLs, e.g. `x-access-token:…@github.com`.
pub fn redact(text: &str) -> Cow<'_, str> {
    credential_pattern().replace_all(text, "${1}${2}:******@")
}
