//! 用量统计 API 处理器

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
};

use super::router::UsageState;
use crate::relay::types::ErrorResponse;

/// GET /stats
pub async fn get_stats(State(state): State<UsageState>) -> impl IntoResponse {
    match state.log.summarize().await {
        Ok(summary) => Json(summary).into_response(),
        Err(e) => {
            tracing::error!("统计用量失败: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::api_error(format!("Failed to fetch stats: {}", e))),
            )
                .into_response()
        }
    }
}
