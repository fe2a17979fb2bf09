//! Axum HTTP surface for RCW: on-demand catalog checks and snapshot reads.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use rcw_core::CatalogStats;
use rcw_sync::{PreviewOutcome, WatchPipeline};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::error;

pub const CRATE_NAME: &str = "rcw-web";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<WatchPipeline>,
}

impl AppState {
    pub fn new(pipeline: Arc<WatchPipeline>) -> Self {
        Self { pipeline }
    }
}

#[derive(Debug, Deserialize, Default)]
struct CheckQuery {
    #[serde(rename = "minPoints")]
    min_points: Option<u64>,
}

#[derive(Debug, Serialize)]
struct CheckResponse {
    #[serde(flatten)]
    statistics: CatalogStats,
    digest_html: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/check-new-products", get(check_new_products_handler))
        .route("/fetch-current-data", get(fetch_current_data_handler))
        .fallback(not_found_handler)
        .with_state(Arc::new(state))
}

/// Bind and serve until the shutdown future resolves.
pub async fn serve(
    state: AppState,
    port: u16,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Live fetch + diff + statistics, no persistence, no delivery. The digest
/// is returned to the caller instead of being dispatched.
async fn check_new_products_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CheckQuery>,
) -> Response {
    let min_points = query.min_points.unwrap_or(0);
    match state.pipeline.preview(min_points).await {
        Ok(PreviewOutcome::NoNewProducts) => {
            (StatusCode::OK, "No new products").into_response()
        }
        Ok(PreviewOutcome::NothingAboveThreshold { min_points }) => (
            StatusCode::OK,
            format!("No new products above {min_points} points"),
        )
            .into_response(),
        Ok(PreviewOutcome::Report { stats, digest_html }) => Json(CheckResponse {
            statistics: stats,
            digest_html,
        })
        .into_response(),
        Err(err) => {
            error!(error = %err, "on-demand catalog check failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Error fetching or comparing data",
            )
                .into_response()
        }
    }
}

/// Last-persisted snapshot as JSON; empty array when nothing is stored.
async fn fetch_current_data_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.pipeline.stored_snapshot().await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(err) => {
            error!(error = %err, "snapshot read failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Error reading stored snapshot",
            )
                .into_response()
        }
    }
}

async fn not_found_handler() -> Response {
    (StatusCode::NOT_FOUND, "Not found").into_response()
}
