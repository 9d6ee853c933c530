// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! crconfig-core server
//!
//! Serves CRConfig previews, snapshot commits and snapshot reads over HTTP.

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info};

use crconfig_core::config::Config;
use crconfig_core::http::{self, AppState};
use crconfig_core::migrations;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("crconfig_core=info".parse()?),
        )
        .init();

    info!("Starting crconfig-core");

    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        http_addr = %config.http_addr,
        max_connections = config.max_connections,
        request_timeout_secs = config.request_timeout.as_secs(),
        "Configuration loaded"
    );

    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.database_url)
        .await?;

    let row: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&pool).await?;
    info!(result = row.0, "Database health check passed");

    info!("Running database migrations...");
    migrations::run_postgres(&pool).await?;
    info!("Migrations completed");

    let app = http::build_router(AppState::new(pool.clone(), &config));
    let listener = tokio::net::TcpListener::bind(config.http_addr).await?;
    info!(addr = %config.http_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutting down...");
        })
        .await?;

    pool.close().await;
    info!("Shutdown complete");

    Ok(())
}
