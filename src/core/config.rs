use anyhow::Result;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Engine tuning knobs. Every field has a default so a partial `engine.toml`
/// (or none at all) is valid.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Attempts per model call before giving up.
    #[serde(default = "default_max_call_retries")]
    pub max_call_retries: usize,

    /// Fixed wait between failed model calls.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Attempts per tool call, including argument repairs.
    #[serde(default = "default_max_tool_retries")]
    pub max_tool_retries: usize,

    #[serde(default = "default_max_reflector_calls")]
    pub max_reflector_calls: usize,

    /// Identical consecutive tool calls tolerated before the detector fires.
    #[serde(default = "default_repeating_threshold")]
    pub repeating_threshold: usize,

    /// Hard cap on loop iterations; 0 disables it.
    #[serde(default)]
    pub max_iterations: usize,

    #[serde(default = "default_true")]
    pub ask_user_enabled: bool,

    #[serde(default)]
    pub summarizer: SummarizerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SummarizerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Chains longer than this are compressed.
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,

    /// Most recent messages kept verbatim.
    #[serde(default = "default_keep_last")]
    pub keep_last: usize,
}

fn default_max_call_retries() -> usize {
    3
}
fn default_retry_delay_ms() -> u64 {
    5_000
}
fn default_max_tool_retries() -> usize {
    3
}
fn default_max_reflector_calls() -> usize {
    3
}
fn default_repeating_threshold() -> usize {
    3
}
fn default_true() -> bool {
    true
}
fn default_max_messages() -> usize {
    64
}
fn default_keep_last() -> usize {
    16
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_call_retries: default_max_call_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            max_tool_retries: default_max_tool_retries(),
            max_reflector_calls: default_max_reflector_calls(),
            repeating_threshold: default_repeating_threshold(),
            max_iterations: 0,
            ask_user_enabled: true,
            summarizer: SummarizerConfig::default(),
        }
    }
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_messages: default_max_messages(),
            keep_last: default_keep_last(),
        }
    }
}

impl EngineConfig {
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!("No {} found, using default engine config.", path.display());
            return Ok(Self::default());
        }
        let content = tokio::fs::read_to_string(path).await?;
        let mut config: EngineConfig = toml::from_str(&content)?;

        // A zero ceiling would make every call fail before it is attempted.
        config.max_call_retries = config.max_call_retries.max(1);
        config.max_tool_retries = config.max_tool_retries.max(1);
        config.repeating_threshold = config.repeating_threshold.max(2);

        info!(
            "Loaded engine config: call_retries={}, retry_delay={}ms, tool_retries={}, reflector_calls={}",
            config.max_call_retries,
            config.retry_delay_ms,
            config.max_tool_retries,
            config.max_reflector_calls
        );
        Ok(config)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}
