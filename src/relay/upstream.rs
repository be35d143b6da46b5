//! 推理服务客户端
//!
//! 向上游 `/completion` 发起流式或非流式生成，并把失败归类为
//! 不可用 / 超时 / 状态码错误 / 传输错误。

use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;

use crate::http_client::build_client;
use crate::model::config::Config;

/// 上游原始字节流
pub type ChunkStream = BoxStream<'static, reqwest::Result<Bytes>>;

/// 上游错误
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    /// 连接失败（服务未启动、端口不可达、连接超时）
    #[error("无法连接推理服务: {0}")]
    Unavailable(String),
    /// 生成超过总超时
    #[error("推理服务响应超时")]
    Timeout,
    /// 上游返回非成功状态码
    #[error("推理服务返回状态码 {status}: {body}")]
    Status { status: u16, body: String },
    /// 其他传输/解析错误
    #[error("推理服务请求失败: {0}")]
    Transport(String),
}

impl UpstreamError {
    /// 按 reqwest 错误类型归类
    ///
    /// 连接阶段的超时也归为不可用，这样可以快速降级。
    /// 连接建立后被上游重置（推理服务卡死后被看门狗重启等）按超时处理。
    pub fn classify(err: reqwest::Error) -> Self {
        if err.is_connect() {
            Self::Unavailable(err.to_string())
        } else if err.is_timeout() || is_connection_reset(&err) {
            Self::Timeout
        } else {
            Self::Transport(err.to_string())
        }
    }
}

/// 错误链中是否有连接被重置的 I/O 错误
fn is_connection_reset(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            if matches!(
                io.kind(),
                std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::ConnectionAborted
            ) {
                return true;
            }
        }
        current = e.source();
    }
    false
}

/// 非流式补全的上游响应
#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    completion: Option<String>,
    #[serde(default)]
    tokens_predicted: Option<u64>,
    #[serde(default)]
    tokens_evaluated: Option<u64>,
}

/// 非流式补全结果
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub content: String,
    pub tokens: u64,
}

/// 推理服务客户端
pub struct UpstreamClient {
    client: Client,
    base_url: String,
    generation_timeout: Duration,
    health_timeout: Duration,
}

impl UpstreamClient {
    pub fn new(
        client: Client,
        base_url: impl Into<String>,
        generation_timeout: Duration,
        health_timeout: Duration,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            generation_timeout,
            health_timeout,
        }
    }

    /// 按配置构建
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let client = build_client(config.proxy_url.as_deref(), config.connect_timeout())?;
        Ok(Self::new(
            client,
            config.upstream_base(),
            config.generation_timeout(),
            config.health_timeout(),
        ))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn completion_url(&self) -> String {
        format!("{}/completion", self.base_url)
    }

    /// 打开流式生成连接
    ///
    /// 不设置读超时。返回的字节流被 drop 时连接随之关闭，上游停止生成。
    pub async fn open_stream(&self, body: &Value) -> Result<ChunkStream, UpstreamError> {
        let response = self
            .client
            .post(self.completion_url())
            .header("Accept", "text/event-stream")
            .json(body)
            .send()
            .await
            .map_err(UpstreamError::classify)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.bytes_stream().boxed())
    }

    /// 非流式生成，受总超时限制
    pub async fn complete(&self, body: &Value) -> Result<Completion, UpstreamError> {
        let response = self
            .client
            .post(self.completion_url())
            .timeout(self.generation_timeout)
            .json(body)
            .send()
            .await
            .map_err(UpstreamError::classify)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: CompletionResponse = response.json().await.map_err(UpstreamError::classify)?;
        Ok(Completion {
            content: parsed.content.or(parsed.completion).unwrap_or_default(),
            tokens: parsed
                .tokens_predicted
                .filter(|t| *t > 0)
                .or(parsed.tokens_evaluated)
                .unwrap_or(0),
        })
    }

    /// 检查推理服务 /health 是否返回 200
    pub async fn check_health(&self) -> bool {
        let result = self
            .client
            .get(format!("{}/health", self.base_url))
            .timeout(self.health_timeout)
            .send()
            .await;

        match result {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                tracing::debug!("推理服务健康检查失败: {}", e);
                false
            }
        }
    }
}
