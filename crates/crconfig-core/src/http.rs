// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP surface.
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | GET | `/api/cdns/{cdn}/configs/routing` | Live preview, never reads snapshot tables |
//! | PUT | `/api/cdns/{cdn}/snapshot` | Commit a snapshot |
//! | PUT | `/api/deliveryservices/{xml_id}/snapshot` | Commit after a single delivery service change |
//! | GET | `/api/cdns/{cdn}/snapshot` | Committed CRConfig, honours `If-None-Match` / `If-Modified-Since` |
//! | GET | `/api/cdns/{cdn}/configs/monitoring` | Stored monitoring document |
//!
//! Payloads are wrapped as `{"response": ...}`; failures as
//! `{"alerts": [{"level": "error", "text": ...}]}`.
//!
//! The live preview is for debugging. CDN components must read the
//! committed snapshot.

use std::future::Future;
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::extract::{Path, State};
use axum::http::header::{ETAG, LAST_MODIFIED};
use axum::http::{HeaderMap, HeaderName, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::cache_control;
use crate::config::Config;
use crate::crconfig::{self, MakeOptions, Source};
use crate::error::{Error, ErrorKind, Result, ResultExt};
use crate::store;

/// Body of a successful commit.
pub const SUCCESS: &str = "SUCCESS";

/// Shared state for handlers.
#[derive(Clone)]
pub struct AppState {
    /// Connection pool; every request runs in its own transaction.
    pub pool: PgPool,
    /// Recorded as `stats.tm_host`.
    pub tm_host: String,
    /// Recorded as `stats.tm_user`.
    pub tm_user: String,
    /// Upper bound for one request's database work.
    pub request_timeout: Duration,
}

impl AppState {
    /// State from loaded configuration.
    pub fn new(pool: PgPool, config: &Config) -> Self {
        Self {
            pool,
            tm_host: config.tm_host.clone(),
            tm_user: config.tm_user.clone(),
            request_timeout: config.request_timeout,
        }
    }

    fn make_options(&self) -> MakeOptions {
        MakeOptions::new(self.tm_user.clone(), self.tm_host.clone())
    }

    /// Run `work` under the request timeout. A transaction held by `work` is
    /// rolled back when it is dropped on timeout.
    async fn timed<T>(&self, work: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.request_timeout, work)
            .await
            .map_err(|_| {
                Error::internal(format!(
                    "request timed out after {}s",
                    self.request_timeout.as_secs()
                ))
            })?
    }
}

#[derive(Serialize)]
struct Envelope<T: Serialize> {
    response: T,
}

fn ok<T: Serialize>(response: T) -> Json<Envelope<T>> {
    Json(Envelope { response })
}

#[derive(Serialize)]
struct Alert {
    level: &'static str,
    text: String,
}

#[derive(Serialize)]
struct Alerts {
    alerts: Vec<Alert>,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match self.kind() {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::Invalid => StatusCode::BAD_REQUEST,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        // Internal details stay in the log.
        let text = if status.is_server_error() {
            error!(error = %self, "Request failed");
            "Internal Server Error".to_string()
        } else {
            self.to_string()
        };
        let body = Alerts {
            alerts: vec![Alert {
                level: "error",
                text,
            }],
        };
        (status, Json(body)).into_response()
    }
}

fn cache_headers(time: DateTime<Utc>) -> [(HeaderName, String); 2] {
    [
        (ETAG, cache_control::etag(time)),
        (LAST_MODIFIED, cache_control::last_modified(time)),
    ]
}

/// Build the router with the `/api` prefix and request tracing.
pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/cdns/{cdn}/configs/routing", get(get_routing))
        .route("/cdns/{cdn}/configs/monitoring", get(get_monitoring))
        .route("/cdns/{cdn}/snapshot", get(get_snapshot).put(put_snapshot))
        .route("/deliveryservices/{xml_id}/snapshot", put(put_ds_snapshot))
        .with_state(state);

    Router::new()
        .nest("/api", api)
        .layer(TraceLayer::new_for_http())
}

/// GET /api/cdns/{cdn}/configs/routing
async fn get_routing(
    State(state): State<AppState>,
    Path(cdn): Path<String>,
) -> Result<Response> {
    let opts = state.make_options();
    state
        .timed(async {
            let mut tx = state.pool.begin().await.context("beginning transaction")?;
            let doc = crconfig::make(&mut *tx, &cdn, Source::Live, &opts).await?;
            Ok(ok(doc).into_response())
        })
        .await
}

/// PUT /api/cdns/{cdn}/snapshot
async fn put_snapshot(
    State(state): State<AppState>,
    Path(cdn): Path<String>,
) -> Result<Response> {
    let opts = state.make_options();
    state
        .timed(async {
            let mut tx = state.pool.begin().await.context("beginning transaction")?;
            let Some((_, time)) = store::commit_snapshot(&mut *tx, &cdn, &opts).await? else {
                return Err(Error::not_found(format!("cdn '{}' not found", cdn)));
            };
            tx.commit().await.context("committing snapshot")?;
            info!(cdn = %cdn, time = %time, "Snapshot published");
            Ok((cache_headers(time), ok(SUCCESS)).into_response())
        })
        .await
}

/// PUT /api/deliveryservices/{xml_id}/snapshot
async fn put_ds_snapshot(
    State(state): State<AppState>,
    Path(xml_id): Path<String>,
) -> Result<Response> {
    state
        .timed(async {
            let mut tx = state.pool.begin().await.context("beginning transaction")?;
            let Some(time) = store::snapshot_ds(&mut *tx, &xml_id).await? else {
                return Err(Error::not_found(format!(
                    "deliveryservice '{}' not found",
                    xml_id
                )));
            };
            tx.commit().await.context("committing snapshot")?;
            Ok((cache_headers(time), ok(SUCCESS)).into_response())
        })
        .await
}

/// GET /api/cdns/{cdn}/snapshot
async fn get_snapshot(
    State(state): State<AppState>,
    Path(cdn): Path<String>,
    headers: HeaderMap,
) -> Result<Response> {
    let opts = state.make_options();
    state
        .timed(async {
            let mut tx = state.pool.begin().await.context("beginning transaction")?;
            let not_found = || Error::not_found(format!("no snapshot found for cdn '{}'", cdn));

            let freshness = cache_control::check_snapshot(&mut *tx, &headers, &cdn)
                .await?
                .ok_or_else(not_found)?;
            if freshness.not_modified {
                return Ok((StatusCode::NOT_MODIFIED, cache_headers(freshness.snapshot_time))
                    .into_response());
            }

            let (doc, time) = store::get_snapshot(&mut *tx, &cdn, &opts)
                .await?
                .ok_or_else(not_found)?;
            Ok((cache_headers(time), ok(doc)).into_response())
        })
        .await
}

/// GET /api/cdns/{cdn}/configs/monitoring
async fn get_monitoring(
    State(state): State<AppState>,
    Path(cdn): Path<String>,
) -> Result<Response> {
    state
        .timed(async {
            let mut tx = state.pool.begin().await.context("beginning transaction")?;
            let blob = store::get_snapshot_monitoring(&mut *tx, &cdn)
                .await?
                .ok_or_else(|| Error::not_found(format!("cdn '{}' not found", cdn)))?;
            let monitoring: serde_json::Value =
                serde_json::from_str(&blob).context("parsing stored monitoring config")?;
            Ok(ok(monitoring).into_response())
        })
        .await
}
