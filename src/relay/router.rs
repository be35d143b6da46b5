//! 中继路由配置

use axum::{
    Router,
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
};

use super::handlers::{completion, health, stream_generation};
use super::middleware::{AppState, auth_middleware};

/// 创建中继路由
///
/// # 端点
/// - `POST /stream` - 高产出流式生成
/// - `POST /completion` - 补全（阻塞，或 `stream: true` 时流式）
/// - `GET /health` - 健康检查（不需要认证）
pub fn create_relay_router(state: AppState, max_body_bytes: usize) -> Router {
    let protected = Router::new()
        .route("/stream", post(stream_generation))
        .route("/completion", post(completion))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new()
        .route("/health", get(health))
        .merge(protected)
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .with_state(state)
}
