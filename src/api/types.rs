//! Shared API state and request payloads.

use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use serde::Deserialize;

use crate::config::Config;
use crate::worker::RunWorker;

/// State shared by every handler: one SQLite connection behind a mutex, the
/// run worker, and the runtime config.
#[derive(Clone)]
pub struct ApiContext {
    pub db: Arc<Mutex<Connection>>,
    pub worker: Arc<RunWorker>,
    pub config: Arc<Config>,
}

impl ApiContext {
    pub fn new(db: Connection, worker: RunWorker, config: Config) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
            worker: Arc::new(worker),
            config: Arc::new(config),
        }
    }
}

/// Body for `POST /api/runs`.
#[derive(Debug, Deserialize)]
pub struct EnqueueRunRequest {
    pub patient_id: String,
    pub organization_id: String,
    #[serde(default)]
    pub input_config: Option<serde_json::Value>,
    /// Overrides the configured default retry budget.
    #[serde(default)]
    pub max_retries: Option<u32>,
}
