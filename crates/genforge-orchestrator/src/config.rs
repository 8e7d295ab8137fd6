use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Runtime settings for [`crate::OrchestratorService`].
///
/// Every field has a default so a partial `[orchestrator]` table is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Retry budget applied to planned tasks.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub retry_backoff: RetryBackoff,
    /// How long a terminal session stays queryable before eviction.
    #[serde(default = "default_cleanup_grace_secs")]
    pub cleanup_grace_secs: u64,
    /// Period of the eviction sweep.
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    /// Capacity of the bounded notification channel.
    #[serde(default = "default_notification_buffer")]
    pub notification_buffer: usize,
    #[serde(default)]
    pub artifacts: ArtifactConfig,
}

fn default_max_retries() -> u32 {
    3
}

fn default_cleanup_grace_secs() -> u64 {
    2 * 60 * 60
}

fn default_cleanup_interval_secs() -> u64 {
    60 * 60
}

fn default_notification_buffer() -> usize {
    256
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_backoff: RetryBackoff::default(),
            cleanup_grace_secs: default_cleanup_grace_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            notification_buffer: default_notification_buffer(),
            artifacts: ArtifactConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn cleanup_grace(&self) -> Duration {
        Duration::from_secs(self.cleanup_grace_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }
}

/// How long a failed task waits before it becomes eligible again.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    Fixed,
    #[default]
    Exponential,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryBackoff {
    #[serde(default)]
    pub strategy: BackoffStrategy,
    #[serde(default = "default_base_ms")]
    pub base_ms: u64,
    #[serde(default = "default_max_ms")]
    pub max_ms: u64,
}

fn default_base_ms() -> u64 {
    500
}

fn default_max_ms() -> u64 {
    30_000
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::default(),
            base_ms: default_base_ms(),
            max_ms: default_max_ms(),
        }
    }
}

impl RetryBackoff {
    /// No waiting between attempts.
    pub fn none() -> Self {
        Self {
            strategy: BackoffStrategy::Fixed,
            base_ms: 0,
            max_ms: 0,
        }
    }

    /// Delay before attempt number `retry_count` (1 for the first retry).
    /// Exponential delays double per attempt and are capped at `max_ms`.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let ms = match self.strategy {
            BackoffStrategy::Fixed => self.base_ms,
            BackoffStrategy::Exponential => {
                let shift = retry_count.saturating_sub(1).min(31);
                self.base_ms.saturating_mul(1u64 << shift)
            }
        };
        Duration::from_millis(ms.min(self.max_ms))
    }
}

/// Limits applied by the artifact post-processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactConfig {
    /// Artifacts larger than this are rejected.
    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,
    /// Case-insensitive literal substrings that cause rejection.
    #[serde(default = "default_deny_patterns")]
    pub deny_patterns: Vec<String>,
}

fn default_max_bytes() -> usize {
    5 * 1024 * 1024
}

fn default_deny_patterns() -> Vec<String> {
    ["<script>", "eval(", "exec(", "system("]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            max_bytes: default_max_bytes(),
            deny_patterns: default_deny_patterns(),
        }
    }
}
