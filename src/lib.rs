//! dxcore — clinical diagnosis run pipeline.
//!
//! Core pieces: a run state machine with optimistic claims over SQLite, an
//! LLM drafting worker with structural validation, a deterministic versioned
//! rule engine, a fail-closed safety evaluator, and an idempotent
//! reconciliation sweep. A thin axum API triggers all of it.

pub mod api;
pub mod config;
pub mod context;
pub mod db;
pub mod llm;
pub mod reconcile;
pub mod rules;
pub mod safety;
pub mod worker;

/// Initialize tracing from `RUST_LOG`, falling back to the app default.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
