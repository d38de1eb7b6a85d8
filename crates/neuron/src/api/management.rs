// SPDX-License-Identifier: PolyForm-Shield-1.0

use std::collections::BTreeMap;

use axum::extract::{Path, Query, State};
use axum::Json;
use protocol::{
    BackendInfo, CleanupRequest, CleanupResponse, HealthReport, LoadRequest, LoadResponse,
    LogsResponse, ResourceKey, SlotStatus, SwitchResponse, UnloadResponse,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use super::ApiResult;
use crate::gpu::GpuDeviceStatus;
use crate::lifecycle::LifecycleManager;
use crate::registry::RegistryEntry;
use crate::runtime::SharedContext;

const DEFAULT_LOG_LINES: usize = 100;

#[derive(Debug, Deserialize)]
pub(super) struct LogsQuery {
    lines: Option<usize>,
}

fn key(raw: &str) -> ApiResult<ResourceKey> {
    Ok(LifecycleManager::parse_key(raw)?)
}

pub(super) async fn health(State(ctx): State<SharedContext>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "running": ctx.lifecycle.running().len(),
    }))
}

pub(super) async fn models(State(ctx): State<SharedContext>) -> Json<Vec<BackendInfo>> {
    Json(ctx.lifecycle.list_backends())
}

pub(super) async fn gpus(State(ctx): State<SharedContext>) -> Json<Vec<GpuDeviceStatus>> {
    Json(ctx.lifecycle.gpu_statuses().await)
}

pub(super) async fn slots(State(ctx): State<SharedContext>) -> Json<Vec<SlotStatus>> {
    Json(ctx.lifecycle.all_statuses())
}

pub(super) async fn slot(
    State(ctx): State<SharedContext>,
    Path(raw): Path<String>,
) -> ApiResult<Json<SlotStatus>> {
    Ok(Json(ctx.lifecycle.status(&key(&raw)?)))
}

pub(super) async fn load(
    State(ctx): State<SharedContext>,
    Path(raw): Path<String>,
    Json(req): Json<LoadRequest>,
) -> ApiResult<Json<LoadResponse>> {
    let key = key(&raw)?;
    Ok(Json(ctx.lifecycle.load(&req.model_id, &key).await?))
}

pub(super) async fn unload(
    State(ctx): State<SharedContext>,
    Path(raw): Path<String>,
) -> ApiResult<Json<UnloadResponse>> {
    let key = key(&raw)?;
    Ok(Json(ctx.lifecycle.unload(&key).await?))
}

pub(super) async fn switch(
    State(ctx): State<SharedContext>,
    Path(raw): Path<String>,
    Json(req): Json<LoadRequest>,
) -> ApiResult<Json<SwitchResponse>> {
    let key = key(&raw)?;
    Ok(Json(ctx.lifecycle.switch(&req.model_id, &key).await?))
}

pub(super) async fn slot_health(
    State(ctx): State<SharedContext>,
    Path(raw): Path<String>,
) -> ApiResult<Json<HealthReport>> {
    let key = key(&raw)?;
    Ok(Json(ctx.lifecycle.healthcheck(&key).await))
}

pub(super) async fn logs(
    State(ctx): State<SharedContext>,
    Path(raw): Path<String>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<Json<LogsResponse>> {
    let key = key(&raw)?;
    let lines = query.lines.unwrap_or(DEFAULT_LOG_LINES);
    Ok(Json(ctx.lifecycle.logs(&key, lines)?))
}

pub(super) async fn clear_logs(
    State(ctx): State<SharedContext>,
    Path(raw): Path<String>,
) -> ApiResult<Json<Value>> {
    let key = key(&raw)?;
    ctx.lifecycle.clear_logs(&key)?;
    Ok(Json(json!({ "success": true, "resource_key": key })))
}

pub(super) async fn registry(State(ctx): State<SharedContext>) -> Json<Vec<RegistryEntry>> {
    Json(ctx.registry.entries())
}

pub(super) async fn verify(State(ctx): State<SharedContext>) -> Json<BTreeMap<ResourceKey, bool>> {
    Json(ctx.registry.verify_all())
}

pub(super) async fn cleanup(
    State(ctx): State<SharedContext>,
    Json(req): Json<CleanupRequest>,
) -> Json<CleanupResponse> {
    let orphans = ctx.registry.find_orphans(ctx.registry.executable_name());
    info!("orphan cleanup requested force={} found={}", req.force, orphans.len());
    let terminated = ctx.registry.cleanup_orphans(req.force).await;
    Json(CleanupResponse {
        terminated,
        orphans,
    })
}
