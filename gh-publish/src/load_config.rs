/// `load_config` module: loads the optional YAML config file for the CLI.
///
/// The file holds no secrets. The GitHub token always comes from the
/// environment (`GITHUB_TOKEN` / `GH_TOKEN`, optionally via `.env`).
///
/// # Accepted YAML
/// ```yaml
/// state_dir: .gh-publish/runs
/// github:
///   api_url: https://api.github.com
///   web_url: https://github.com
///   timeout_ms: 30000
/// pipeline:
///   process_timeout_ms: 120000
///   retry:
///     max_attempts: 5
///   verify:
///     poll_interval_ms: 2000
///     timeout_ms: 60000
/// ```
/// Every key is optional; omitted keys take the defaults shown.
use anyhow::Result;
use gh_publish_core::config::PipelineConfig;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Directory holding one JSON record per run.
    pub state_dir: PathBuf,
    pub github: GitHubSection,
    pub pipeline: PipelineConfig,
}

impl Default for CliConfig {
    fn default() -> Self {
        CliConfig {
            state_dir: PathBuf::from(".gh-publish/runs"),
            github: GitHubSection::default(),
            pipeline: PipelineConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct GitHubSection {
    pub api_url: String,
    /// Base for the `https://<host>/<owner>/<name>.git` remote added by
    /// `publish --repo` when the remote is missing.
    pub web_url: String,
    pub timeout_ms: u64,
}

impl Default for GitHubSection {
    fn default() -> Self {
        GitHubSection {
            api_url: "https://api.github.com".to_string(),
            web_url: "https://github.com".to_string(),
            timeout_ms: 30_000,
        }
    }
}

impl GitHubSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn clone_url(&self, slug: &str) -> String {
        format!("{}/{slug}.git", self.web_url.trim_end_matches('/'))
    }
}

/// Loads a YAML config file. Returns the defaults when `path` is `None`.
pub fn load_config<P: AsRef<Path>>(path: Option<P>) -> Result<CliConfig> {
    let Some(path) = path else {
        info!("No config file given; using defaults");
        return Ok(CliConfig::default());
    };
    let path_ref = path.as_ref();
    info!(config_path = ?path_ref, "Loading configuration from file");

    let config_content = match fs::read_to_string(path_ref) {
        Ok(content) => {
            info!(config_path = ?path_ref, "Config file read successfully");
            content
        }
        Err(e) => {
            error!(error = ?e, config_path = ?path_ref, "Failed to read config file");
            return Err(anyhow::anyhow!(
                "Failed to read config file {:?}: {}",
                path_ref,
                e
            ));
        }
    };

    if config_content.trim().is_empty() {
        return Ok(CliConfig::default());
    }

    let config: CliConfig = match serde_yaml::from_str(&config_content) {
        Ok(conf) => {
            info!(config_path = ?path_ref, "Parsed config YAML successfully");
            conf
        }
        Err(e) => {
            error!(error = ?e, config_path = ?path_ref, "Failed to parse config YAML");
            return Err(anyhow::anyhow!("Failed to parse config YAML: {e}"));
        }
    };
    config.pipeline.trace_loaded();
    Ok(config)
}
