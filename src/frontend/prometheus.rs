//! Prometheus exposition of breakdown gauges.
//!
//! `/metrics?router=<ip>&breakdown=<csv>[&ts=<unix>]` runs an equality
//! query for one timeslot (the most recent closed one unless `ts` is
//! given) and renders each breakdown key as a `tflow_bytes` gauge with the
//! requested labels.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use axum::extract::{Query as Params, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};

use super::AppState;
use crate::database::{breakdown_labels, translate_query, ConditionExt, QueryExt};

const PREFIX: &str = "tflow_";

pub async fn metrics_handler(
    State(state): State<AppState>,
    Params(params): Params<HashMap<String, String>>,
) -> Response {
    let mut errs: Vec<String> = Vec::new();

    let labels: Vec<String> = params
        .get("breakdown")
        .map(|b| b.split(',').map(str::to_string).collect())
        .unwrap_or_default();
    if labels.is_empty() || labels.iter().all(|l| l.is_empty()) {
        let mut msg = String::from(
            "breakdown parameter missing\nplease pass a comma separated list of:\n",
        );
        for label in breakdown_labels() {
            let _ = writeln!(msg, "- {label}");
        }
        errs.push(msg);
    }

    let router = params.get("router").cloned().unwrap_or_default();
    if router.is_empty() {
        errs.push("router parameter missing".to_string());
    }

    let ts = match params.get("ts") {
        Some(raw) => match raw.parse::<i64>() {
            Ok(ts) => ts,
            Err(err) => {
                errs.push(format!("unable to parse ts: {err}"));
                0
            }
        },
        None => state.fdb.current_timeslot() - state.fdb.aggregation_period(),
    };

    let ext = QueryExt {
        cond: vec![
            ConditionExt {
                field: "Agent".to_string(),
                operator: 0,
                operand: router,
            },
            ConditionExt {
                field: "Timestamp".to_string(),
                operator: 0,
                operand: ts.to_string(),
            },
        ],
        breakdown: labels.clone(),
        top_n: 0,
    };

    let query = match translate_query(&ext) {
        Ok(q) if errs.is_empty() => q,
        Ok(_) => return invalid_parameters(errs),
        Err(err) => {
            errs.push(format!("breakdown parameter invalid: {err}"));
            return invalid_parameters(errs);
        }
    };

    let fdb = Arc::clone(&state.fdb);
    let result = match tokio::task::spawn_blocking(move || fdb.run_query(&query)).await {
        Ok(Ok(result)) => result,
        Ok(Err(err)) => {
            return (StatusCode::BAD_GATEWAY, format!("Query failed: {err}\n")).into_response()
        }
        Err(err) => {
            return (StatusCode::BAD_GATEWAY, format!("Query failed: {err}\n")).into_response()
        }
    };

    let mut body = String::new();
    let _ = writeln!(body, "# HELP {PREFIX}bytes Bytes transmitted");
    let _ = writeln!(body, "# TYPE {PREFIX}bytes gauge");

    if let Some(ts) = result.timestamps.first() {
        if let Some(data) = result.data.get(ts) {
            for (key, value) in data {
                let mut rendered = String::new();
                for label in &labels {
                    if !rendered.is_empty() {
                        rendered.push(',');
                    }
                    let _ = write!(rendered, "{label}=\"{}\"", escape_label(key.get(label)));
                }
                let _ = writeln!(body, "{PREFIX}bytes{{{rendered}}} {value}");
            }
        }
    }

    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response()
}

fn invalid_parameters(errs: Vec<String>) -> Response {
    let mut body = String::from("Invalid parameters\n");
    for err in errs {
        let _ = writeln!(body, "{err}");
    }
    (StatusCode::UNPROCESSABLE_ENTITY, body).into_response()
}

fn escape_label(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
