#![doc = "GitHub REST client: the CLI's implementation of the core `RemotePort`."]
//
//! # GitHub integration (CLI <-> Core)
//!
//! [`GitHubClient`] answers the questions the pipeline asks of the host:
//! which repositories an account has, and which commit a branch ref points
//! at. It can also create a repository for the authenticated user. Every
//! HTTP failure is classified into a
//! [`PublishError`](gh_publish_core::error::PublishError) here:
//!
//! - 401 and non-rate-limit 403 become `Auth`.
//! - 429, or 403 with `X-RateLimit-Remaining: 0`, become `RemoteLock` with
//!   the server's `Retry-After` / `X-RateLimit-Reset` hint attached.
//! - 5xx, timeouts and connection failures become `TransientNetwork`.
//!
//! The access token is read from `GITHUB_TOKEN` (or `GH_TOKEN`). It is only
//! ever placed in the `Authorization` header and never appears in logs.

use std::env;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use gh_publish_core::contract::{RemotePort, RepoRef};
use gh_publish_core::error::PublishError;
use reqwest::header::{HeaderMap, ACCEPT, AUTHORIZATION, USER_AGENT};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

const PER_PAGE: usize = 100;

/// Credential for the GitHub API. `Debug` and `Display` never show the value.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new(value: impl Into<String>) -> Self {
        AccessToken(value.into())
    }

    /// Read `GITHUB_TOKEN`, falling back to `GH_TOKEN`.
    pub fn from_env() -> Option<Self> {
        ["GITHUB_TOKEN", "GH_TOKEN"]
            .iter()
            .filter_map(|key| env::var(key).ok())
            .find(|v| !v.trim().is_empty())
            .map(AccessToken)
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken(******)")
    }
}

impl fmt::Display for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("******")
    }
}

#[derive(Debug, Deserialize)]
struct AuthenticatedUser {
    login: String,
}

#[derive(Debug, Serialize)]
struct NewRepo<'a> {
    name: &'a str,
    private: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GitRef {
    object: GitObject,
}

#[derive(Debug, Deserialize)]
struct GitObject {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct RepoJson {
    full_name: String,
    default_branch: Option<String>,
    #[serde(default)]
    private: bool,
    clone_url: Option<String>,
    html_url: Option<String>,
}

impl From<RepoJson> for RepoRef {
    fn from(r: RepoJson) -> Self {
        RepoRef {
            full_name: r.full_name,
            default_branch: r.default_branch,
            private: r.private,
            clone_url: r.clone_url,
            html_url: r.html_url,
        }
    }
}

pub struct GitHubClient {
    http: reqwest::Client,
    api_url: String,
    token: Option<AccessToken>,
}

impl GitHubClient {
    pub fn new(
        api_url: impl Into<String>,
        token: Option<AccessToken>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(GitHubClient {
            http,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    /// Build a client using the token from the environment (loading `.env`
    /// first). Without a token only public repositories are visible.
    pub fn new_from_env(api_url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        let token = AccessToken::from_env();
        let api_url = api_url.into();
        if token.is_none() {
            tracing::warn!(
                api_url = %api_url,
                "No GITHUB_TOKEN in environment; using unauthenticated GitHub API access"
            );
        }
        tracing::info!(api_url = %api_url, token_set = token.is_some(), "Initialised GitHubClient");
        Self::new(api_url, token, timeout)
    }

    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response, PublishError> {
        self.send(self.http.get(url)).await
    }

    async fn send(
        &self,
        req: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, PublishError> {
        let mut req = req
            .header(ACCEPT, "application/vnd.github+json")
            .header(USER_AGENT, concat!("gh-publish/", env!("CARGO_PKG_VERSION")))
            .header("X-GitHub-Api-Version", "2022-11-28");
        if let Some(token) = &self.token {
            req = req.header(AUTHORIZATION, format!("Bearer {}", token.expose()));
        }
        req.send().await.map_err(transport_error)
    }

    /// Login of the token's owner, or `None` without a token.
    pub async fn authenticated_login(&self) -> Result<Option<String>, PublishError> {
        if self.token.is_none() {
            return Ok(None);
        }
        let resp = self.get(&format!("{}/user", self.api_url)).await?;
        let status = resp.status();
        if !status.is_success() {
            let headers = resp.headers().clone();
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, &headers, &body));
        }
        let user: AuthenticatedUser = resp.json().await.map_err(transport_error)?;
        Ok(Some(user.login))
    }
}

/// Path of one page of `account`'s repositories. The public `/users/...`
/// listing omits private repositories, so the token owner's own account is
/// listed through `/user/repos` instead.
pub fn repos_path(account: &str, viewer: Option<&str>, page: usize) -> String {
    match viewer {
        Some(login) if login.eq_ignore_ascii_case(account) => format!(
            "/user/repos?affiliation=owner&sort=updated&per_page={PER_PAGE}&page={page}"
        ),
        _ => format!("/users/{account}/repos?sort=updated&per_page={PER_PAGE}&page={page}"),
    }
}

#[async_trait]
impl RemotePort for GitHubClient {
    async fn list_repositories(&self, account: &str) -> Result<Vec<RepoRef>, PublishError> {
        let viewer = match self.authenticated_login().await {
            Ok(viewer) => viewer,
            Err(e) if e.is_retryable() => return Err(e),
            Err(e) => {
                tracing::warn!(error = %e, "Could not identify the token owner; listing public repositories");
                None
            }
        };
        let mut repos = Vec::new();
        let mut page = 1;
        loop {
            let url = format!("{}{}", self.api_url, repos_path(account, viewer.as_deref(), page));
            let resp = self.get(&url).await?;
            let status = resp.status();
            if !status.is_success() {
                let headers = resp.headers().clone();
                let body = resp.text().await.unwrap_or_default();
                tracing::warn!(account, %status, "GitHub API rejected repository listing");
                return Err(classify_status(status, &headers, &body));
            }
            let batch: Vec<RepoJson> = resp.json().await.map_err(transport_error)?;
            let fetched = batch.len();
            repos.extend(batch.into_iter().map(RepoRef::from));
            tracing::debug!(account, page, fetched, "Fetched repository page");
            if fetched < PER_PAGE {
                break;
            }
            page += 1;
        }
        tracing::info!(account, count = repos.len(), "Listed repositories");
        Ok(repos)
    }

    async fn create_repository(
        &self,
        name: &str,
        private: bool,
        description: Option<String>,
    ) -> Result<RepoRef, PublishError> {
        if self.token.is_none() {
            return Err(PublishError::auth(
                "creating a repository needs GITHUB_TOKEN or GH_TOKEN",
            ));
        }
        let url = format!("{}/user/repos", self.api_url);
        let body = NewRepo {
            name,
            private,
            description,
        };
        let resp = self.send(self.http.post(&url).json(&body)).await?;
        let status = resp.status();
        if !status.is_success() {
            let headers = resp.headers().clone();
            let body = resp.text().await.unwrap_or_default();
            tracing::warn!(name, %status, "GitHub API rejected repository creation");
            return Err(classify_status(status, &headers, &body));
        }
        let repo: RepoJson = resp.json().await.map_err(transport_error)?;
        tracing::info!(full_name = %repo.full_name, private, "Created repository");
        Ok(repo.into())
    }

    async fn get_ref_hash(
        &self,
        repo: &str,
        branch: &str,
    ) -> Result<Option<String>, PublishError> {
        let url = format!("{}/repos/{repo}/git/ref/heads/{branch}", self.api_url);
        let resp = self.get(&url).await?;
        let status = resp.status();
        // 409 is GitHub's answer for an empty repository.
        if status == StatusCode::NOT_FOUND || status == StatusCode::CONFLICT {
            tracing::debug!(repo, branch, %status, "Remote ref not found");
            return Ok(None);
        }
        if !status.is_success() {
            let headers = resp.headers().clone();
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, &headers, &body));
        }
        let git_ref: GitRef = resp.json().await.map_err(transport_error)?;
        tracing::debug!(repo, branch, sha = %git_ref.object.sha, "Read remote ref");
        Ok(Some(git_ref.object.sha))
    }
}

fn transport_error(e: reqwest::Error) -> PublishError {
    if e.is_decode() {
        PublishError::repository(format!("unexpected GitHub API response: {e}"))
    } else {
        PublishError::transient(format!("GitHub API request failed: {e}"))
    }
}

/// Map a non-success GitHub API response to the error taxonomy.
pub fn classify_status(status: StatusCode, headers: &HeaderMap, body: &str) -> PublishError {
    let message = format!("GitHub API returned {status}: {}", body_message(body));
    let remaining = header_u64(headers, "x-ratelimit-remaining");

    if status == StatusCode::TOO_MANY_REQUESTS
        || (status == StatusCode::FORBIDDEN && remaining == Some(0))
        || (status == StatusCode::FORBIDDEN && body.to_lowercase().contains("rate limit"))
    {
        return PublishError::locked(message, retry_after_secs(headers));
    }
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return PublishError::auth(message);
    }
    if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        return PublishError::transient(message);
    }
    PublishError::repository(message)
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
}

/// Seconds to wait, from `Retry-After` or the `X-RateLimit-Reset` epoch.
fn retry_after_secs(headers: &HeaderMap) -> Option<u64> {
    if let Some(secs) = header_u64(headers, "retry-after") {
        return Some(secs);
    }
    let reset = header_u64(headers, "x-ratelimit-reset")?;
    let now = chrono::Utc::now().timestamp().max(0) as u64;
    Some(reset.saturating_sub(now))
}

fn body_message(body: &str) -> String {
    #[derive(Deserialize)]
    struct ApiMessage {
        message: String,
    }
    match serde_json::from_str::<ApiMessage>(body) {
        Ok(m) => m.message,
        Err(_) => body.chars().take(200).collect(),
    }
}

/// Extract `owner/name` from a GitHub remote URL (https, ssh or scp-like).
pub fn parse_github_slug(url: &str) -> Option<String> {
    let trimmed = url.trim().trim_end_matches('/');
    let trimmed = trimmed.strip_suffix(".git").unwrap_or(trimmed);
    let path = match trimmed.split_once("://") {
        Some((_, rest)) => rest.split_once('/')?.1,
        None => trimmed.split_once(':')?.1,
    };
    let mut segments = path.rsplit('/').filter(|s| !s.is_empty());
    let name = segments.next()?;
    let owner = segments.next()?;
    Some(format!("{owner}/{name}"))
}
