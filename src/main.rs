use std::sync::Arc;

use dxcore::api::{api_router, ApiContext};
use dxcore::config::{Config, APP_NAME, APP_VERSION};
use dxcore::context::SqliteContextProvider;
use dxcore::llm::OllamaClient;
use dxcore::rules::default_registry;
use dxcore::worker::RunWorker;

#[tokio::main]
async fn main() {
    dxcore::init_tracing();

    let config = Config::from_env();
    tracing::info!(
        app = APP_NAME,
        version = APP_VERSION,
        model = %config.llm_model,
        db = %config.database_path.display(),
        "Starting diagnosis pipeline"
    );

    let conn = match dxcore::db::open_database(&config.database_path) {
        Ok(conn) => conn,
        Err(e) => {
            tracing::error!(error = %e, "Failed to open database");
            std::process::exit(1);
        }
    };

    let llm = Arc::new(OllamaClient::new(&config.llm_base_url, config.llm_timeout_secs));
    let worker = RunWorker::new(
        llm,
        Arc::new(SqliteContextProvider::new()),
        default_registry(),
        &config.llm_model,
        config.llm_max_tokens,
    );

    tracing::info!(
        ruleset_hash = default_registry().ruleset_hash(),
        active_rules = default_registry().list_active_rules().len(),
        "Rule registry loaded"
    );

    let bind_addr = config.bind_addr.clone();
    let router = api_router(ApiContext::new(conn, worker, config));

    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(error = %e, addr = %bind_addr, "Failed to bind");
            std::process::exit(1);
        }
    };
    tracing::info!(addr = %bind_addr, "Trigger API listening");

    if let Err(e) = axum::serve(listener, router).await {
        tracing::error!(error = %e, "Server error");
        std::process::exit(1);
    }
}
