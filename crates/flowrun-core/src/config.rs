use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};

/// Top-level flowrun configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub executor: Option<ExecutorConfig>,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// Coordinator defaults. Each execution may override these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Nodes dispatched concurrently per execution (1 = sequential).
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// Keep running independent branches after a node fails.
    #[serde(default)]
    pub continue_on_error: bool,
    /// A node timeout fails the whole flow even with `continue_on_error`.
    #[serde(default = "default_timeouts_always_fatal")]
    pub timeouts_always_fatal: bool,
    /// Guardrail retries per node when the node sets none.
    #[serde(default = "default_max_retry_limit")]
    pub default_max_retry_limit: u32,
    /// Node timeout in seconds when the node sets none (0 = no limit).
    #[serde(default = "default_max_execution_time")]
    pub default_max_execution_time_secs: u64,
    /// Accept cycles made only of nodes tagged as loop constructs.
    #[serde(default)]
    pub allow_tagged_loops: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            continue_on_error: false,
            timeouts_always_fatal: default_timeouts_always_fatal(),
            default_max_retry_limit: default_max_retry_limit(),
            default_max_execution_time_secs: default_max_execution_time(),
            allow_tagged_loops: false,
        }
    }
}

fn default_max_parallel() -> usize { 1 }
fn default_timeouts_always_fatal() -> bool { true }
fn default_max_retry_limit() -> u32 { 2 }
fn default_max_execution_time() -> u64 { 600 }

/// Event bus sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Live buffer per job; slow subscribers lose the oldest events.
    #[serde(default = "default_live_capacity")]
    pub live_capacity: usize,
    /// Pending persistence queue; on overflow the oldest entry is dropped.
    #[serde(default = "default_persist_capacity")]
    pub persist_capacity: usize,
    #[serde(default = "default_persist_batch_size")]
    pub persist_batch_size: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            live_capacity: default_live_capacity(),
            persist_capacity: default_persist_capacity(),
            persist_batch_size: default_persist_batch_size(),
        }
    }
}

fn default_live_capacity() -> usize { 256 }
fn default_persist_capacity() -> usize { 10_000 }
fn default_persist_batch_size() -> usize { 10 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_database")]
    pub database: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
        }
    }
}

fn default_database() -> String { "~/.flowrun/flowrun.db".to_string() }

/// Remote agent runtime that executes agent/task/listener nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    pub endpoint: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout() -> u64 { 900 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String { "127.0.0.1:18790".to_string() }

/// JSONL run log and node output files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    #[serde(default = "default_log_dir")]
    pub dir: String,
    /// Store each node's final output under `{output_dir}/{job_id}/`.
    #[serde(default)]
    pub output_dir: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            dir: default_log_dir(),
            output_dir: None,
        }
    }
}

fn default_log_enabled() -> bool { true }
fn default_log_dir() -> String { "~/.flowrun/logs".to_string() }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| FlowError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        let config: AppConfig =
            toml::from_str(&expanded).map_err(|e| FlowError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.engine.max_parallel == 0 {
            return Err(FlowError::Configuration(
                "engine.max_parallel must be at least 1".to_string(),
            ));
        }
        if self.events.live_capacity == 0 || self.events.persist_capacity == 0 {
            return Err(FlowError::Configuration(
                "event capacities must be at least 1".to_string(),
            ));
        }
        if self.events.persist_batch_size == 0 {
            return Err(FlowError::Configuration(
                "events.persist_batch_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        expand_home(&self.storage.database)
    }

    pub fn log_dir(&self) -> PathBuf {
        expand_home(&self.log.dir)
    }

    pub fn output_dir(&self) -> Option<PathBuf> {
        self.log.output_dir.as_deref().map(expand_home)
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Keep original if env var not set
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}
