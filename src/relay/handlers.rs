//! 生成接口处理器

use std::convert::Infallible;

use axum::{
    body::{Body, Bytes},
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use futures::StreamExt;
use http::header::{self, HeaderName, HeaderValue};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tracing::Instrument;
use uuid::Uuid;

use crate::common::tokens_per_second;
use crate::usage::{UsageEvent, UsageKind};

use super::middleware::AppState;
use super::session::{ClientSink, RelaySession};
use super::types::{
    BlockingResponse, ErrorResponse, GenerationMode, GenerationRequest, Timings,
};
use super::upstream::UpstreamError;

const X_ACCEL_BUFFERING: HeaderName = HeaderName::from_static("x-accel-buffering");

/// POST /stream
///
/// 高产出流式生成，未指定的参数使用 Expert 默认值
pub async fn stream_generation(
    State(state): State<AppState>,
    payload: Result<Json<GenerationRequest>, JsonRejection>,
) -> Response {
    match parse_request(payload) {
        Ok(request) => handle_streaming_generation(state, request, GenerationMode::Expert),
        Err(response) => response,
    }
}

/// POST /completion
///
/// 默认阻塞返回完整结果；`stream: true` 时以 Standard 默认值流式返回
pub async fn completion(
    State(state): State<AppState>,
    payload: Result<Json<GenerationRequest>, JsonRejection>,
) -> Response {
    let request = match parse_request(payload) {
        Ok(request) => request,
        Err(response) => return response,
    };
    if request.stream {
        return handle_streaming_generation(state, request, GenerationMode::Standard);
    }
    handle_blocking_generation(&state, request).await
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let reachable = state.upstream.check_health().await;
    Json(json!({
        "status": "ok",
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "upstream": state.upstream.base_url(),
        "upstreamReachable": reachable,
    }))
}

/// 流式生成
///
/// 校验通过后立即返回响应头，会话在后台任务中运行并通过通道写入响应体。
/// 客户端断开时响应体被 drop，通道关闭，会话随之取消上游请求。
pub fn handle_streaming_generation(
    state: AppState,
    request: GenerationRequest,
    mode: GenerationMode,
) -> Response {
    if let Err(message) = request.validate() {
        return invalid_request(message);
    }

    let request_id = Uuid::new_v4().to_string();
    let span = tracing::info_span!("relay", request_id = %request_id, mode = ?mode);
    span.in_scope(|| {
        tracing::info!(
            prompt_length = request.prompt_len(),
            max_tokens = request.max_tokens(mode),
            "收到流式生成请求"
        );
    });

    let (sink, rx) = ClientSink::channel(state.settings.flush_interval);
    let session = RelaySession::new(request, mode, sink);
    tokio::spawn(
        async move {
            let outcome = session
                .run(&state.upstream, &state.usage, &state.settings)
                .await;
            tracing::debug!(?outcome, "会话结束");
        }
        .instrument(span),
    );

    sse_response(rx)
}

/// 以通道为响应体的 SSE 响应
fn sse_response(rx: mpsc::Receiver<Bytes>) -> Response {
    let body = Body::from_stream(ReceiverStream::new(rx).map(Ok::<_, Infallible>));

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream")),
            (header::CACHE_CONTROL, HeaderValue::from_static("no-cache, no-transform")),
            (header::CONNECTION, HeaderValue::from_static("keep-alive")),
            (X_ACCEL_BUFFERING, HeaderValue::from_static("no")),
        ],
        body,
    )
        .into_response()
}

/// 阻塞式生成
///
/// 等待上游完整结果；上游不可用返回 503，超时返回 504。
pub async fn handle_blocking_generation(state: &AppState, request: GenerationRequest) -> Response {
    if let Err(message) = request.validate() {
        return invalid_request(message);
    }

    let mode = GenerationMode::Standard;
    let started = Instant::now();
    let body = request.to_upstream_body(mode, false);

    #[cfg(feature = "sensitive-logs")]
    tracing::debug!(prompt = %request.prompt, "上游请求 prompt");

    let completion = match state.upstream.complete(&body).await {
        Ok(completion) => completion,
        Err(e) => return upstream_error_response(e, state.upstream.base_url()),
    };

    let duration_ms = started.elapsed().as_millis() as u64;
    let speed = tokens_per_second(completion.tokens, duration_ms);
    tracing::info!(
        tokens = completion.tokens,
        duration_ms,
        tokens_per_second = speed,
        "补全完成"
    );

    state
        .usage
        .append(&UsageEvent {
            timestamp: chrono::Utc::now(),
            kind: UsageKind::Completion,
            prompt_length: request.prompt_len() as u64,
            response_length: completion.content.chars().count() as u64,
            tokens: completion.tokens,
            duration: duration_ms,
            tokens_per_second: speed,
            max_tokens: Some(request.max_tokens(mode)),
        })
        .await;

    Json(BlockingResponse {
        content: completion.content,
        tokens_predicted: completion.tokens,
        timings: Timings {
            predicted_per_second: speed,
        },
    })
    .into_response()
}

/// 请求体无法解析（缺少 Content-Type、JSON 损坏、字段类型错误）同样返回 400
fn parse_request(
    payload: Result<Json<GenerationRequest>, JsonRejection>,
) -> Result<GenerationRequest, Response> {
    match payload {
        Ok(Json(request)) => Ok(request),
        Err(rejection) => Err(invalid_request(&rejection.body_text())),
    }
}

fn invalid_request(message: &str) -> Response {
    tracing::warn!("请求校验失败: {}", message);
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse::invalid_request(message)),
    )
        .into_response()
}

fn upstream_error_response(err: UpstreamError, base_url: &str) -> Response {
    tracing::error!("补全失败: {}", err);
    let (status, error) = match err {
        UpstreamError::Unavailable(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            ErrorResponse::upstream_unavailable(format!(
                "Cannot connect to inference server at {}. Please make sure it is running.",
                base_url
            )),
        ),
        UpstreamError::Timeout => (
            StatusCode::GATEWAY_TIMEOUT,
            ErrorResponse::upstream_timeout("Generation took too long. Try a simpler request."),
        ),
        other => (
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorResponse::api_error(other.to_string()),
        ),
    };
    (status, Json(error)).into_response()
}
