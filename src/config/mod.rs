//! Configuration loading and management.
//!
//! Loads from `./millwright.toml` (or `$MILLWRIGHT_CONFIG_PATH`).
//! Environment variables override file values; file values override
//! defaults. Everything is constructed once at startup and carried through
//! the application context -- no process-wide config singletons.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub paths: PathsConfig,
    pub pipeline: PipelineConfig,
    pub sandbox: SandboxConfig,
    pub credentials: CredentialsConfig,
    pub llm: LlmConfig,
    pub cost: CostConfig,
    pub learning: LearningConfig,
}

impl AppConfig {
    /// Load configuration with precedence: env vars > TOML file > defaults.
    ///
    /// Config file path: `$MILLWRIGHT_CONFIG_PATH` or `./millwright.toml`.
    /// A missing file is not an error; defaults apply.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file()?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn load_from_file() -> Result<Self> {
        let path = Self::config_path_with(|key| std::env::var(key).ok());
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading config from file");
                let config: AppConfig =
                    toml::from_str(&contents).context("failed to parse config TOML")?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("no config file found, using defaults");
                Ok(AppConfig::default())
            }
            Err(e) => Err(anyhow::anyhow!("failed to read config file: {e}")),
        }
    }

    /// Resolve config path using a custom env resolver (for testing).
    fn config_path_with(env: impl Fn(&str) -> Option<String>) -> PathBuf {
        if let Some(p) = env("MILLWRIGHT_CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("millwright.toml")
    }

    /// Apply environment variable overrides (env > config > defaults).
    ///
    /// Takes a resolver function for testability.
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        fn parse_override<T: std::str::FromStr>(var: &str, value: &str, slot: &mut T) {
            match value.parse() {
                Ok(parsed) => *slot = parsed,
                Err(_) => {
                    tracing::warn!(var, value, "ignoring invalid env override");
                }
            }
        }

        if let Some(v) = env("MILLWRIGHT_BIND") {
            self.server.bind = v;
        }
        if let Some(v) = env("MILLWRIGHT_DB_PATH") {
            self.paths.database = v;
        }
        if let Some(v) = env("MILLWRIGHT_WORKSPACE_ROOT") {
            self.paths.workspace_root = v;
        }
        if let Some(v) = env("MILLWRIGHT_RULES_DIR") {
            self.paths.rules_dir = v;
        }
        if let Some(v) = env("MILLWRIGHT_STEP_TIMEOUT_SECS") {
            parse_override(
                "MILLWRIGHT_STEP_TIMEOUT_SECS",
                &v,
                &mut self.pipeline.code_stage_timeout_seconds,
            );
        }
        if let Some(v) = env("MILLWRIGHT_TOTAL_TIMEOUT_SECS") {
            parse_override(
                "MILLWRIGHT_TOTAL_TIMEOUT_SECS",
                &v,
                &mut self.pipeline.run_timeout_seconds,
            );
        }
        if let Some(v) = env("MILLWRIGHT_TOKEN_ENCRYPTION_KEY") {
            self.credentials.encryption_key = Some(v);
        }
        if let Some(v) = env("MILLWRIGHT_REFRESH_INTERVAL_SECS") {
            parse_override(
                "MILLWRIGHT_REFRESH_INTERVAL_SECS",
                &v,
                &mut self.credentials.refresh_interval_seconds,
            );
        }

        // LLM -- env var presence creates the provider entry.
        if let Some(key) = env("MILLWRIGHT_ANTHROPIC_API_KEY") {
            let model = env("MILLWRIGHT_ANTHROPIC_MODEL").unwrap_or_else(|| {
                self.llm
                    .anthropic
                    .as_ref()
                    .map(|c| c.model.clone())
                    .unwrap_or_else(default_anthropic_model)
            });
            self.llm.anthropic = Some(LlmCloudConfig { api_key: key, model });
        }
        if let Some(url) = env("MILLWRIGHT_OLLAMA_URL") {
            self.llm.local.base_url = url;
        }
        if let Some(model) = env("MILLWRIGHT_LOCAL_MODEL") {
            self.llm.local.model = model;
        }
    }

    /// Parse a TOML string into config (for testing).
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("failed to parse config TOML")?;
        Ok(config)
    }
}

// ── Server ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address for the ingress/control API.
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8470".to_string(),
        }
    }
}

// ── Paths ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// SQLite database file.
    pub database: String,
    /// Root under which per-run output directories are created.
    pub workspace_root: String,
    /// Rule documents directory (genre/spec/coder/fix/saas rules).
    pub rules_dir: String,
    /// Directory for rotated JSON log files.
    pub logs_dir: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            database: "millwright.db".to_string(),
            workspace_root: ".".to_string(),
            rules_dir: "rules".to_string(),
            logs_dir: "logs".to_string(),
        }
    }
}

// ── Pipeline ────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Per-stage deadline for the code track.
    pub code_stage_timeout_seconds: u64,
    /// Per-stage deadline for the SaaS track.
    pub saas_stage_timeout_seconds: u64,
    /// Whole-run deadline, both tracks.
    pub run_timeout_seconds: u64,
    /// Fix-loop cap: how many times review may fail before the run ends.
    pub max_retry: u32,
    /// Cap on planned operations per SaaS task.
    pub max_operations_per_task: usize,
    /// Change-size guardrail: total generated lines per run.
    pub max_lines_per_change: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            code_stage_timeout_seconds: 180,
            saas_stage_timeout_seconds: 300,
            run_timeout_seconds: 600,
            max_retry: 3,
            max_operations_per_task: 10,
            max_lines_per_change: 200,
        }
    }
}

impl PipelineConfig {
    pub fn code_stage_timeout(&self) -> Duration {
        Duration::from_secs(self.code_stage_timeout_seconds)
    }

    pub fn saas_stage_timeout(&self) -> Duration {
        Duration::from_secs(self.saas_stage_timeout_seconds)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_seconds)
    }
}

// ── Sandbox ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Base image with the trusted toolchain preinstalled.
    pub image: String,
    pub memory_mb: u32,
    pub cpu_cores: f64,
    pub pids_limit: i64,
    /// Unit-test command deadline inside the sandbox.
    pub unit_test_timeout_seconds: u64,
    /// End-to-end test command deadline inside the sandbox.
    pub e2e_test_timeout_seconds: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: "millwright-sandbox:latest".to_string(),
            memory_mb: 512,
            cpu_cores: 1.0,
            pids_limit: 256,
            unit_test_timeout_seconds: 120,
            e2e_test_timeout_seconds: 300,
        }
    }
}

// ── Credentials ─────────────────────────────────────────────────

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    /// Base64 AES-256 key for credential encryption at rest. When absent,
    /// tokens are stored in plaintext and a warning is logged (local
    /// development fallback).
    pub encryption_key: Option<String>,
    /// How often the background refresher scans active connections.
    pub refresh_interval_seconds: u64,
    /// Refresh a token this long before its expiry.
    pub refresh_buffer_seconds: u64,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            encryption_key: None,
            refresh_interval_seconds: 900,
            refresh_buffer_seconds: 300,
        }
    }
}

impl CredentialsConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_seconds)
    }

    pub fn refresh_buffer(&self) -> Duration {
        Duration::from_secs(self.refresh_buffer_seconds)
    }
}

impl std::fmt::Debug for CredentialsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialsConfig")
            .field(
                "encryption_key",
                &self.encryption_key.as_ref().map(|_| "__REDACTED__"),
            )
            .field("refresh_interval_seconds", &self.refresh_interval_seconds)
            .field("refresh_buffer_seconds", &self.refresh_buffer_seconds)
            .finish()
    }
}

// ── LLM ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Local Ollama provider -- always available as a fallback.
    pub local: LlmLocalConfig,
    /// Anthropic provider; used for the quality profile when configured.
    pub anthropic: Option<LlmCloudConfig>,
    /// Model name override for the quality profile.
    pub quality_model: Option<String>,
    /// Model name override for the cost profile.
    pub cost_model: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmLocalConfig {
    pub base_url: String,
    pub model: String,
}

impl Default for LlmLocalConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            model: "llama3".to_string(),
        }
    }
}

#[derive(Clone, Deserialize)]
pub struct LlmCloudConfig {
    pub api_key: String,
    #[serde(default = "default_anthropic_model")]
    pub model: String,
}

impl std::fmt::Debug for LlmCloudConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmCloudConfig")
            .field("api_key", &"__REDACTED__")
            .field("model", &self.model)
            .finish()
    }
}

fn default_anthropic_model() -> String {
    "claude-sonnet-4-20250514".to_string()
}

// ── Cost ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CostConfig {
    pub input_usd_per_million: f64,
    pub output_usd_per_million: f64,
    /// Budget ceiling per run in USD; exceeding it is flagged, not fatal.
    pub max_usd_per_run: f64,
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            input_usd_per_million: 1.25,
            output_usd_per_million: 10.0,
            max_usd_per_run: 0.5,
        }
    }
}

// ── Learning ────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LearningConfig {
    /// A normalized failure pattern must recur this many times before a
    /// rule candidate is drafted.
    pub rule_threshold: i64,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self { rule_threshold: 3 }
    }
}

// ── Tests ───────────────────────────────────────────────────────
