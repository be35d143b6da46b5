//! 用量统计 API 路由

use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    extract::State,
    http::Request,
    middleware::{self, Next},
    response::Response,
    routing::get,
};

use crate::common::auth;

use super::handlers::get_stats;
use super::store::UsageLog;

/// 用量统计 API 状态
#[derive(Clone)]
pub struct UsageState {
    pub api_key: Option<String>,
    pub log: Arc<UsageLog>,
}

/// 用量统计认证中间件（未配置密钥时放行）
async fn usage_auth_middleware(
    State(state): State<UsageState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if let Err(response) = auth::authorize(state.api_key.as_deref(), &request) {
        return response;
    }
    next.run(request).await
}

/// 创建用量统计路由
///
/// # 端点
/// - `GET /stats` - 汇总所有分区的用量统计
pub fn create_usage_router(api_key: Option<String>, log: Arc<UsageLog>) -> Router {
    let state = UsageState { api_key, log };

    Router::new()
        .route("/stats", get(get_stats))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            usage_auth_middleware,
        ))
        .with_state(state)
}
