// SPDX-License-Identifier: PolyForm-Shield-1.0

use std::convert::Infallible;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use model_runtime::ollama::{
    ChatRequest, DeleteRequest, GenerateRequest, ProcessResponse, ShowRequest, ShowResponse,
    TagsResponse, VersionResponse,
};
use serde::Serialize;

use super::ApiResult;
use crate::proxy::Reply;
use crate::runtime::SharedContext;

fn respond<T: Serialize>(reply: Reply<T>) -> Response {
    match reply {
        Reply::Full(body) => Json(body).into_response(),
        Reply::Stream(lines) => (
            [(header::CONTENT_TYPE, "application/x-ndjson")],
            Body::from_stream(lines.map(Ok::<_, Infallible>)),
        )
            .into_response(),
    }
}

pub(super) async fn generate(
    State(ctx): State<SharedContext>,
    Json(req): Json<GenerateRequest>,
) -> ApiResult<Response> {
    Ok(respond(ctx.proxy.generate(req).await?))
}

pub(super) async fn chat(
    State(ctx): State<SharedContext>,
    Json(req): Json<ChatRequest>,
) -> ApiResult<Response> {
    Ok(respond(ctx.proxy.chat(req).await?))
}

pub(super) async fn tags(State(ctx): State<SharedContext>) -> Json<TagsResponse> {
    Json(ctx.proxy.tags())
}

pub(super) async fn show(
    State(ctx): State<SharedContext>,
    Json(req): Json<ShowRequest>,
) -> ApiResult<Json<ShowResponse>> {
    Ok(Json(ctx.proxy.show(&req)?))
}

pub(super) async fn ps(State(ctx): State<SharedContext>) -> Json<ProcessResponse> {
    Json(ctx.proxy.ps())
}

/// Always 501. The body is read leniently so a malformed one still gets
/// the same answer.
pub(super) async fn delete(State(ctx): State<SharedContext>, body: Bytes) -> ApiResult<Response> {
    let name = serde_json::from_slice::<DeleteRequest>(&body)
        .map(|r| r.name)
        .unwrap_or_default();
    ctx.proxy.delete(&name)?;
    Ok(().into_response())
}

pub(super) async fn version(State(ctx): State<SharedContext>) -> Json<VersionResponse> {
    Json(ctx.proxy.version())
}
