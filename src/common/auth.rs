//! 共享密钥提取与比较

use axum::{
    body::Body,
    http::{Request, StatusCode},
    response::{IntoResponse, Json, Response},
};
use subtle::ConstantTimeEq;

use crate::relay::types::ErrorResponse;

/// 从请求中提取共享密钥
///
/// 支持：
/// - `x-api-key` header
/// - `x-admin-token` header
/// - `Authorization: Bearer <token>` header
pub fn extract_api_key(request: &Request<Body>) -> Option<String> {
    let headers = request.headers();

    for name in ["x-api-key", "x-admin-token"] {
        if let Some(key) = headers.get(name).and_then(|v| v.to_str().ok()) {
            return Some(key.to_string());
        }
    }

    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|v| v.to_string())
}

/// 常量时间比较，避免时序攻击
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// 校验共享密钥
///
/// 未配置密钥时放行；密钥缺失或不匹配时返回 401 响应。
pub fn authorize(expected: Option<&str>, request: &Request<Body>) -> Result<(), Response> {
    let Some(expected) = expected else {
        return Ok(());
    };

    match extract_api_key(request) {
        Some(key) if constant_time_eq(&key, expected) => Ok(()),
        _ => {
            tracing::warn!(path = %request.uri().path(), "认证失败");
            let error = ErrorResponse::authentication_error();
            Err((StatusCode::UNAUTHORIZED, Json(error)).into_response())
        }
    }
}
