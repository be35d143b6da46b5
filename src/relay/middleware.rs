//! 中继共享状态与中间件

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::Response,
};

use crate::common::auth;
use crate::usage::UsageLog;

use super::session::RelaySettings;
use super::upstream::UpstreamClient;

/// 应用共享状态
#[derive(Clone)]
pub struct AppState {
    /// 共享密钥，None 表示不启用认证
    pub api_key: Option<String>,
    /// 推理服务客户端
    pub upstream: Arc<UpstreamClient>,
    /// 用量日志
    pub usage: Arc<UsageLog>,
    pub settings: Arc<RelaySettings>,
}

impl AppState {
    /// 创建新的应用状态
    pub fn new(upstream: UpstreamClient, usage: Arc<UsageLog>, settings: RelaySettings) -> Self {
        Self {
            api_key: None,
            upstream: Arc::new(upstream),
            usage,
            settings: Arc::new(settings),
        }
    }

    /// 设置共享密钥
    pub fn with_api_key(mut self, key: Option<impl Into<String>>) -> Self {
        self.api_key = key.map(Into::into);
        self
    }
}

/// 共享密钥认证中间件（未配置密钥时放行）
pub async fn auth_middleware(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if let Err(response) = auth::authorize(state.api_key.as_deref(), &request) {
        return response;
    }
    next.run(request).await
}

/// CORS 中间件层
///
/// 中继通常被本机的编辑器前端直接调用，允许所有来源。
pub fn cors_layer() -> tower_http::cors::CorsLayer {
    use tower_http::cors::{Any, CorsLayer};

    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}
