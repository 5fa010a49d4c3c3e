///
/// This module implements the CLI interface for gh-publish: command parsing,
/// wiring the core pipeline to git, GitHub and the on-disk run store, and
/// rendering progress for the terminal.
///
/// All pipeline logic (stages, retries, resumption) lives in the
/// [`gh-publish-core`] crate. This module is CLI glue only.
///
/// ## How To Use
/// - From a shell: `gh-publish --help`.
/// - Programmatically or in tests: call [`run`] with a constructed [`Cli`].
///
/// [`gh-publish-core`]: ../../gh-publish-core/
use crate::github::{parse_github_slug, GitHubClient};
use crate::load_config::{load_config, CliConfig};
use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use gh_publish_core::cancel::{cancel_pair, CancelHandle};
use gh_publish_core::contract::{RemotePort, Selection};
use gh_publish_core::events::{EventOutcome, ProgressEvent, ProgressSink};
use gh_publish_core::git::GitCli;
use gh_publish_core::run::{PublishRequest, DEFAULT_COMMIT_MESSAGE, DEFAULT_REMOTE};
use gh_publish_core::runner::{PipelineRunner, RunFailure, RunReport};
use gh_publish_core::store::{FileRunStore, RunStore};
use gh_publish_core::Uuid;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

/// Credential helper handed to git through `GIT_CONFIG_*`. It reads the token
/// from the child's environment at auth time, so the token is never written
/// to any git config file.
const TOKEN_CREDENTIAL_HELPER: &str =
    "!f() { echo username=x-access-token; echo \"password=${GITHUB_TOKEN:-$GH_TOKEN}\"; }; f";

/// CLI for gh-publish: commit local changes and publish them to GitHub.
#[derive(Parser)]
#[clap(
    name = "gh-publish",
    version,
    about = "Scan, commit, push and verify local changes against a GitHub repository"
)]
pub struct Cli {
    /// Path to an optional YAML config file
    #[clap(long, global = true)]
    pub config: Option<PathBuf>,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Publish the working-tree changes of a repository
    Publish {
        /// Repository directory
        #[clap(default_value = ".")]
        path: PathBuf,
        /// Remote repository as owner/name (defaults to the remote's URL)
        #[clap(long)]
        repo: Option<String>,
        /// Branch to push (defaults to the checked-out branch)
        #[clap(long)]
        branch: Option<String>,
        /// Git remote name
        #[clap(long, default_value = DEFAULT_REMOTE)]
        remote: String,
        /// Commit message
        #[clap(short, long, default_value = DEFAULT_COMMIT_MESSAGE)]
        message: String,
        /// Only publish these paths (relative to the repository root)
        #[clap(long, num_args = 1..)]
        paths: Vec<String>,
        /// Commit author, e.g. "Name <email>"
        #[clap(long)]
        author: Option<String>,
        /// Run `git init` first if the directory is not a repository
        #[clap(long)]
        init: bool,
        /// Overwrite a diverged remote branch, but only if it still points
        /// at the commit read just before pushing
        #[clap(long)]
        force_with_lease: bool,
    },
    /// Resume an interrupted run, or every unfinished run when no id is given
    Resume {
        run_id: Option<Uuid>,
    },
    /// List recorded runs
    Runs,
    /// List or create GitHub repositories
    Repos {
        #[clap(subcommand)]
        command: ReposCommand,
    },
}

#[derive(Subcommand)]
pub enum ReposCommand {
    /// List repositories of a GitHub account
    List { account: String },
    /// Create a repository owned by the token's user
    Create {
        name: String,
        /// Make the repository private
        #[clap(long)]
        private: bool,
        #[clap(long)]
        description: Option<String>,
    },
}

/// Extracted async CLI logic entrypoint for integration tests and main()
pub async fn run(cli: Cli) -> Result<()> {
    // Emit a top-level 'trace_initialised' event at the very start
    tracing::info!("trace_initialised");

    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Publish {
            path,
            repo,
            branch,
            remote,
            message,
            paths,
            author,
            init,
            force_with_lease,
        } => {
            tracing::info!(command = "publish", path = %path.display(), "Starting publish");
            let git = git_cli(&config);
            let target = RepositoryTarget {
                remote: &remote,
                repo: repo.as_deref(),
                branch: branch.as_deref(),
                init,
            };
            prepare_repository(&git, &config, &path, target).await?;
            let remote_repo = match repo {
                Some(repo) => repo,
                None => resolve_slug(&git, &path, &remote).await?,
            };

            let mut request = PublishRequest::new(&path, remote_repo)
                .with_remote_name(remote)
                .with_message(message)
                .with_force_with_lease(force_with_lease);
            if let Some(branch) = branch {
                request = request.with_branch(branch);
            }
            if let Some(author) = author {
                request = request.with_author(author);
            }
            if !paths.is_empty() {
                request = request.with_selection(Selection::paths(paths));
            }

            let (runner, events) = build_runner(&config, git)?;
            let (cancel, signal) = cancel_pair();
            let printer = tokio::spawn(print_events(events));
            let ctrl_c = spawn_ctrl_c(cancel);

            let result = runner.publish(request, &signal).await;
            ctrl_c.abort();
            drop(runner);
            let _ = printer.await;
            report(result)
        }
        Commands::Resume { run_id } => {
            tracing::info!(command = "resume", run_id = ?run_id, "Resuming");
            let git = git_cli(&config);
            let (runner, events) = build_runner(&config, git)?;
            let runner = Arc::new(runner);
            let (cancel, signal) = cancel_pair();
            let printer = tokio::spawn(print_events(events));
            let ctrl_c = spawn_ctrl_c(cancel);

            let outcome = match run_id {
                Some(run_id) => report(runner.resume(run_id, &signal).await),
                None => {
                    let results = runner
                        .resume_incomplete(&signal)
                        .await
                        .context("Could not list unfinished runs")?;
                    if results.is_empty() {
                        println!("No unfinished runs.");
                    }
                    let failed = results
                        .into_iter()
                        .map(report)
                        .filter(Result::is_err)
                        .count();
                    if failed > 0 {
                        Err(anyhow!("{failed} run(s) did not complete"))
                    } else {
                        Ok(())
                    }
                }
            };
            ctrl_c.abort();
            drop(runner);
            let _ = printer.await;
            outcome
        }
        Commands::Runs => {
            tracing::info!(command = "runs", state_dir = %config.state_dir.display(), "Listing runs");
            let store = FileRunStore::new(&config.state_dir);
            let runs = store.list().await.context("Could not read run store")?;
            if runs.is_empty() {
                println!("No runs recorded in {}", config.state_dir.display());
            }
            for run in runs {
                let detail = match (run.outcome(), run.last_error()) {
                    (Some(outcome), _) => outcome.to_string(),
                    (None, Some(error)) => error.to_string(),
                    (None, None) => String::new(),
                };
                println!(
                    "{}  {:<8} {}  {}  {}",
                    run.run_id,
                    run.current_stage().as_str(),
                    run.updated_at.format("%Y-%m-%d %H:%M:%S"),
                    run.request.repo_path.display(),
                    detail
                );
            }
            Ok(())
        }
        Commands::Repos {
            command: ReposCommand::List { account },
        } => {
            tracing::info!(command = "repos list", %account, "Listing repositories");
            let client =
                GitHubClient::new_from_env(&config.github.api_url, config.github.timeout())?;
            let repos = client
                .list_repositories(&account)
                .await
                .map_err(|e| anyhow!("Could not list repositories for {account}: {e}"))?;
            for repo in repos {
                println!(
                    "{}{}",
                    repo.full_name,
                    if repo.private { " (private)" } else { "" }
                );
            }
            Ok(())
        }
        Commands::Repos {
            command:
                ReposCommand::Create {
                    name,
                    private,
                    description,
                },
        } => {
            tracing::info!(command = "repos create", %name, private, "Creating repository");
            let client =
                GitHubClient::new_from_env(&config.github.api_url, config.github.timeout())?;
            let repo = client
                .create_repository(&name, private, description)
                .await
                .map_err(|e| anyhow!("Could not create repository {name}: {e}"))?;
            println!(
                "Created {}{}",
                repo.full_name,
                repo.html_url
                    .map(|url| format!(" ({url})"))
                    .unwrap_or_default()
            );
            Ok(())
        }
    }
}

fn git_cli(config: &CliConfig) -> GitCli {
    let git = GitCli::new(config.pipeline.process_timeout());
    if crate::github::AccessToken::from_env().is_some() {
        git.with_env("GIT_CONFIG_COUNT", "1")
            .with_env("GIT_CONFIG_KEY_0", "credential.helper")
            .with_env("GIT_CONFIG_VALUE_0", TOKEN_CREDENTIAL_HELPER)
    } else {
        git
    }
}

fn build_runner(
    config: &CliConfig,
    git: GitCli,
) -> Result<(PipelineRunner, UnboundedReceiver<ProgressEvent>)> {
    let remote = GitHubClient::new_from_env(&config.github.api_url, config.github.timeout())?;
    let store: Arc<dyn RunStore> = Arc::new(FileRunStore::new(&config.state_dir));
    let (sink, events) = ProgressSink::channel();
    let runner = PipelineRunner::new(
        Arc::new(git),
        Arc::new(remote),
        store,
        config.pipeline.clone(),
    )
    .with_progress(sink);
    Ok((runner, events))
}

/// Where `publish` is pointed, as given on the command line.
struct RepositoryTarget<'a> {
    remote: &'a str,
    repo: Option<&'a str>,
    branch: Option<&'a str>,
    init: bool,
}

/// Initialise the repository and its remote when asked to.
async fn prepare_repository(
    git: &GitCli,
    config: &CliConfig,
    path: &Path,
    target: RepositoryTarget<'_>,
) -> Result<()> {
    if !git.is_repository(path).await? {
        if !target.init {
            bail!(
                "{} is not a git repository (pass --init to create one)",
                path.display()
            );
        }
        git.init(path, target.branch.unwrap_or("main")).await?;
    }
    if let Some(slug) = target.repo {
        if git.remote_url(path, target.remote).await?.is_none() {
            git.ensure_remote(path, target.remote, &config.github.clone_url(slug))
                .await?;
        }
    }
    Ok(())
}

async fn resolve_slug(git: &GitCli, path: &Path, remote: &str) -> Result<String> {
    let url = git
        .remote_url(path, remote)
        .await?
        .ok_or_else(|| anyhow!("remote `{remote}` is not configured; pass --repo owner/name"))?;
    parse_github_slug(&url)
        .ok_or_else(|| anyhow!("cannot derive owner/name from remote `{remote}`; pass --repo"))
}

fn spawn_ctrl_c(cancel: CancelHandle) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Cancelling after the current step...");
            tracing::warn!("Interrupt received; cancelling run");
            cancel.cancel();
        }
    })
}

async fn print_events(mut events: UnboundedReceiver<ProgressEvent>) {
    while let Some(event) = events.recv().await {
        if let Some(line) = render_event(&event) {
            eprintln!("{line}");
        }
    }
}

/// One terminal line per interesting event.
pub fn render_event(event: &ProgressEvent) -> Option<String> {
    let stage = event.stage;
    match &event.outcome {
        EventOutcome::Started => Some(format!("[{stage}] starting")),
        EventOutcome::Attempt if event.attempt > 1 => {
            Some(format!("[{stage}] attempt {}", event.attempt))
        }
        EventOutcome::Attempt => None,
        EventOutcome::Retrying {
            delay_ms, error, ..
        } => Some(format!(
            "[{stage}] attempt {} failed: {error}; retrying in {:.1}s",
            event.attempt,
            *delay_ms as f64 / 1000.0
        )),
        EventOutcome::Succeeded => Some(format!("[{stage}] done")),
        EventOutcome::Failed { error } => Some(format!("[{stage}] failed: {error}")),
        EventOutcome::Skipped { reason } => Some(format!("[{stage}] skipped: {reason}")),
        EventOutcome::Resumed => Some(format!("[{stage}] resuming")),
    }
}

fn report(result: Result<RunReport, RunFailure>) -> Result<()> {
    match result {
        Ok(report) => {
            tracing::info!(run_id = %report.run_id, outcome = %report.outcome, "Run complete");
            println!("{report}");
            Ok(())
        }
        Err(failure) if failure.is_uncertain() => {
            tracing::warn!(run_id = %failure.run_id, error = %failure.error, "Publish outcome uncertain");
            println!(
                "run {}: {failure}\nThe push may still have landed; run `gh-publish resume {}` or check the remote.",
                failure.run_id, failure.run_id
            );
            Err(anyhow::Error::new(failure))
        }
        Err(failure) => {
            tracing::error!(run_id = %failure.run_id, error = %failure.error, "Run failed");
            println!("run {}: {failure}", failure.run_id);
            Err(anyhow::Error::new(failure))
        }
    }
}
