//! Pipeline configuration.
//!
//! Every knob is read from the environment with a production default, so a
//! deployment can retune the pipeline (model, timeouts, retry budget,
//! stuck-run TTL) without a rebuild.

use std::path::PathBuf;

use serde::Serialize;

/// Application-level constants
pub const APP_NAME: &str = "dxcore";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default tracing filter when RUST_LOG is not set.
pub fn default_log_filter() -> String {
    "info,dxcore=debug".to_string()
}

/// Runtime configuration for the diagnosis pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// Address the trigger API binds to.
    pub bind_addr: String,
    /// Path to the SQLite database file.
    pub database_path: PathBuf,
    /// Base URL of the Ollama-compatible LLM service.
    pub llm_base_url: String,
    /// Model used for both diagnosis drafting and the safety check.
    pub llm_model: String,
    /// Per-request LLM timeout. Timeouts are terminal failures, never hangs.
    pub llm_timeout_secs: u64,
    /// `num_predict` cap sent with every generation request.
    pub llm_max_tokens: u32,
    /// Default `max_retries` stamped on newly enqueued runs.
    pub default_max_retries: u32,
    /// Default batch size for a reconciliation sweep.
    pub reconcile_limit: u32,
    /// Cap on per-action id lists in reconciliation summaries.
    pub reconcile_max_ids: usize,
    /// Minutes a run may sit in `running` before reconciliation treats it
    /// as abandoned. The worker never self-reclaims; only reconciliation
    /// repairs stuck runs, and only when explicitly asked to.
    pub stuck_ttl_minutes: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8710".to_string(),
            database_path: PathBuf::from("dxcore.db"),
            llm_base_url: "http://localhost:11434".to_string(),
            llm_model: "medgemma:4b".to_string(),
            llm_timeout_secs: 120,
            llm_max_tokens: 1024,
            default_max_retries: 2,
            reconcile_limit: 100,
            reconcile_max_ids: 50,
            stuck_ttl_minutes: 30,
        }
    }
}

impl Config {
    /// Build a config from `DXCORE_*` environment variables, falling back to
    /// defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: env_string("DXCORE_BIND_ADDR", defaults.bind_addr),
            database_path: PathBuf::from(env_string(
                "DXCORE_DB_PATH",
                defaults.database_path.display().to_string(),
            )),
            llm_base_url: env_string("DXCORE_LLM_URL", defaults.llm_base_url),
            llm_model: env_string("DXCORE_LLM_MODEL", defaults.llm_model),
            llm_timeout_secs: env_parsed("DXCORE_LLM_TIMEOUT_SECS", defaults.llm_timeout_secs),
            llm_max_tokens: env_parsed("DXCORE_LLM_MAX_TOKENS", defaults.llm_max_tokens),
            default_max_retries: env_parsed("DXCORE_MAX_RETRIES", defaults.default_max_retries),
            reconcile_limit: env_parsed("DXCORE_RECONCILE_LIMIT", defaults.reconcile_limit),
            reconcile_max_ids: env_parsed("DXCORE_RECONCILE_MAX_IDS", defaults.reconcile_max_ids),
            stuck_ttl_minutes: env_parsed("DXCORE_STUCK_TTL_MINUTES", defaults.stuck_ttl_minutes),
        }
    }
}

fn env_string(key: &str, default: String) -> String {
    std::env::var(key).unwrap_or(default)
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
