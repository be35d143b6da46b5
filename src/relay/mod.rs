//! 流式推理中继模块
//!
//! 把客户端的生成请求转发给本地推理服务，并把上游的 SSE 行流
//! 逐帧转码为客户端事件流。
//!
//! # 支持的端点
//!
//! - `POST /stream` - 高产出流式生成
//! - `POST /completion` - 补全（阻塞或流式）
//! - `GET /health` - 健康检查

pub mod handlers;
pub mod middleware;
pub mod reassembler;
pub mod router;
pub mod session;
pub mod types;
pub mod upstream;

#[cfg(test)]
pub(crate) mod test_support;

pub use middleware::{AppState, cors_layer};
pub use router::create_relay_router;
pub use session::RelaySettings;
pub use upstream::UpstreamClient;
