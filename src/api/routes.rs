//! API route definitions.

use super::state::AppState;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::info;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/trigger-check", post(trigger_check))
        .route("/trigger-ip-check", post(trigger_ip_check))
        .route("/force-close", post(force_close))
        .route("/results/speed", get(speed_results))
        .route("/results/ip-quality", get(quality_results))
        .route("/dashboard", get(dashboard))
        .route("/config", get(get_config))
        .route("/config", put(put_config))
}

fn meta() -> Value {
    json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    })
}

fn db_error(e: anyhow::Error) -> (StatusCode, Json<Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": format!("{e:#}") })),
    )
}

async fn health() -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION")
        },
        "meta": meta()
    }))
}

async fn status(State(state): State<AppState>) -> Json<Value> {
    let sched = state.scheduler.status();
    let progress = state.progress.snapshot();
    Json(json!({
        "data": {
            "speed_check_in_progress": sched.speed_check_in_progress,
            "ip_quality_in_progress": sched.ip_quality_in_progress,
            "mode": sched.mode,
            "next_check": sched.next_check,
            "proxy_count": progress.proxy_count,
            "progress": progress.progress,
            "available": progress.available,
        },
        "meta": meta()
    }))
}

async fn trigger_check(State(state): State<AppState>) -> Json<Value> {
    let accepted = state.trigger.signal();
    let message = if accepted {
        "check triggered"
    } else {
        "check already pending"
    };
    Json(json!({ "data": { "accepted": accepted, "message": message }, "meta": meta() }))
}

async fn trigger_ip_check(State(state): State<AppState>) -> Json<Value> {
    let scheduler = Arc::clone(&state.scheduler);
    tokio::spawn(async move { scheduler.run_quality_check().await });
    Json(json!({ "data": { "message": "ip quality check triggered" }, "meta": meta() }))
}

async fn force_close(State(state): State<AppState>) -> Json<Value> {
    state.force_close.store(true, Ordering::Relaxed);
    info!("force close requested");
    Json(json!({ "data": { "message": "force close flag set" }, "meta": meta() }))
}

#[derive(Debug, Deserialize)]
struct SpeedQuery {
    page: Option<u32>,
    page_size: Option<u32>,
    node: Option<String>,
}

async fn speed_results(
    State(state): State<AppState>,
    Query(q): Query<SpeedQuery>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let (rows, total) = crate::storage::query_speed_results(
        &state.db,
        q.page.unwrap_or(1),
        q.page_size.unwrap_or(20),
        q.node.as_deref(),
    )
    .map_err(db_error)?;
    Ok(Json(json!({ "data": rows, "meta": { "total": total } })))
}

#[derive(Debug, Deserialize)]
struct QualityQuery {
    page: Option<u32>,
    page_size: Option<u32>,
    risk: Option<String>,
}

async fn quality_results(
    State(state): State<AppState>,
    Query(q): Query<QualityQuery>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let (rows, total) = crate::storage::query_quality_results(
        &state.db,
        q.page.unwrap_or(1),
        q.page_size.unwrap_or(20),
        q.risk.as_deref(),
    )
    .map_err(db_error)?;
    Ok(Json(json!({ "data": rows, "meta": { "total": total } })))
}

async fn dashboard(
    State(state): State<AppState>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let d = crate::storage::dashboard(&state.db).map_err(db_error)?;
    Ok(Json(json!({ "data": d, "meta": meta() })))
}

async fn get_config(State(state): State<AppState>) -> Json<Value> {
    let cfg = state.config.read().expect("config lock poisoned").clone();
    Json(json!({ "data": cfg, "meta": meta() }))
}

/// Replace the config file and re-arm the scheduler live. A job already
/// dispatched keeps running under the old snapshot.
async fn put_config(
    State(state): State<AppState>,
    body: String,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let new_config = crate::config::Config::parse(&body).map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": format!("{e:#}") })),
        )
    })?;

    std::fs::write(&state.config_path, &body).map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": format!("failed to persist config: {e}") })),
        )
    })?;

    let mode = crate::scheduler::ScheduleMode::from_check_config(&new_config.check);
    *state.config.write().expect("config lock poisoned") = new_config;
    state.scheduler.arm(mode);
    state.scheduler.arm_quality();
    info!("configuration reloaded, scheduler re-armed");

    Ok(Json(
        json!({ "data": { "message": "config updated" }, "meta": meta() }),
    ))
}
