//! `serve` subcommand: the reporting HTTP API daemon. The one async
//! corner of this crate; everything else runs on plain OS threads.

use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::api::http::{self, AppState};
use crate::config::Configuration;
use crate::db::Database;

pub async fn execute(config: Configuration) -> Result<()> {
    let db_path = config.system.data_directory.join("benchyard.db");
    let db = Arc::new(Database::open(&db_path)?);

    let state = AppState { db };
    let app = http::build_router(state);

    let bind_addr = format!("{}:{}", config.api.host, config.api.port);
    info!(%bind_addr, "starting reporting API");

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("received shutdown signal, stopping reporting API");
            signal_token.cancel();
        }
    });

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("reporting API stopped");
    Ok(())
}
