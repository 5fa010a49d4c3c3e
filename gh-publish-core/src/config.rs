use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use crate::retry::RetryConfig;

/// Explicit per-runner configuration. There is no process-wide state; every
/// runner is handed one of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub retry: RetryConfig,
    pub verify: VerifyConfig,
    /// Upper bound for a single `git` invocation.
    pub process_timeout_ms: u64,
    /// Upper bound for the optional commit-message enhancer.
    pub enhancer_timeout_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            retry: RetryConfig::default(),
            verify: VerifyConfig::default(),
            process_timeout_ms: 120_000,
            enhancer_timeout_ms: 10_000,
        }
    }
}

/// How long to wait for the remote ref to reflect a push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifyConfig {
    pub poll_interval_ms: u64,
    pub timeout_ms: u64,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        VerifyConfig {
            poll_interval_ms: 2_000,
            timeout_ms: 60_000,
        }
    }
}

impl VerifyConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl PipelineConfig {
    pub fn process_timeout(&self) -> Duration {
        Duration::from_millis(self.process_timeout_ms)
    }

    pub fn enhancer_timeout(&self) -> Duration {
        Duration::from_millis(self.enhancer_timeout_ms)
    }

    pub fn trace_loaded(&self) {
        info!(
            max_attempts = self.retry.max_attempts,
            verify_timeout_ms = self.verify.timeout_ms,
            process_timeout_ms = self.process_timeout_ms,
            "Loaded PipelineConfig"
        );
        debug!(?self, "PipelineConfig loaded (full debug)");
    }
}
