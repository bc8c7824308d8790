//! HTTP frontend.
//!
//! Serves the query surface (`/query` as CSV), the Prometheus exposition
//! (`/metrics`), and the small JSON endpoints (`/varz`, `/protocols`,
//! `/routers`). Query execution blocks on the database's worker pool, so
//! handlers push it onto the blocking thread pool.

pub mod prometheus;

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Query as Params, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tracing::info;

use crate::database::{translate_query, FlowDatabase, QueryExt};
use crate::error::QueryError;

#[derive(Clone)]
pub struct AppState {
    pub fdb: Arc<FlowDatabase>,
}

pub fn router(fdb: Arc<FlowDatabase>) -> Router {
    Router::new()
        .route("/query", get(query_handler))
        .route("/metrics", get(prometheus::metrics_handler))
        .route("/varz", get(varz_handler))
        .route("/protocols", get(protocols_handler))
        .route("/routers", get(routers_handler))
        .with_state(AppState { fdb })
}

/// Bind and serve until the process exits.
pub async fn serve(listen: String, fdb: Arc<FlowDatabase>) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(&listen).await?;
    info!(%listen, "frontend listening");
    axum::serve(listener, router(fdb)).await
}

async fn query_handler(
    State(state): State<AppState>,
    Params(params): Params<HashMap<String, String>>,
) -> Response {
    let Some(raw) = params.get("q") else {
        return (StatusCode::UNPROCESSABLE_ENTITY, "q parameter missing\n").into_response();
    };

    let ext: QueryExt = match serde_json::from_str(raw) {
        Ok(ext) => ext,
        Err(err) => return (StatusCode::UNPROCESSABLE_ENTITY, format!("{err}\n")).into_response(),
    };
    let query = match translate_query(&ext) {
        Ok(q) => q,
        Err(err) => {
            return (
                StatusCode::UNPROCESSABLE_ENTITY,
                format!("Unable to translate query: {err}\n"),
            )
                .into_response()
        }
    };

    let fdb = Arc::clone(&state.fdb);
    let result = tokio::task::spawn_blocking(move || fdb.run_query(&query)).await;

    let result = match result {
        Ok(Ok(result)) => result,
        Ok(Err(err @ QueryError::AgentCriteriaNotFound)) => {
            return (StatusCode::UNPROCESSABLE_ENTITY, format!("{err}\n")).into_response()
        }
        Ok(Err(err)) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Query failed: {err}\n"),
            )
                .into_response()
        }
        Err(err) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Query failed: {err}\n"),
            )
                .into_response()
        }
    };

    if result.is_empty() {
        return StatusCode::NO_CONTENT.into_response();
    }

    let mut body = Vec::new();
    if let Err(err) = result.write_csv(&mut body) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Unable to render result: {err}\n"),
        )
            .into_response();
    }

    ([(header::CONTENT_TYPE, "text/csv")], body).into_response()
}

async fn varz_handler(State(state): State<AppState>) -> Response {
    Json(state.fdb.stats().snapshot()).into_response()
}

async fn protocols_handler(State(state): State<AppState>) -> Response {
    Json(state.fdb.protocols().all()).into_response()
}

#[derive(Serialize)]
struct RouterInfo {
    name: String,
    ip_address: String,
}

async fn routers_handler(State(state): State<AppState>) -> Response {
    let routers: Vec<RouterInfo> = state
        .fdb
        .agents()
        .iter()
        .map(|a| RouterInfo {
            name: a.name.clone(),
            ip_address: a.ip_address.to_string(),
        })
        .collect();
    Json(routers).into_response()
}
