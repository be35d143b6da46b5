//! 中继会话
//!
//! 一个会话对应一个客户端流式请求：打开上游连接，逐帧转码写给客户端，
//! 客户端断开时立即释放上游连接，上游不可用时降级为提示消息。

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::reassembler::{FrameReassembler, ProtocolFrame};
use super::types::{ClientEvent, GenerationMode, GenerationRequest};
use super::upstream::{ChunkStream, UpstreamClient, UpstreamError};
use crate::common::{tokens_per_second, truncate_with_ellipsis};
use crate::usage::{UsageEvent, UsageKind, UsageLog};

/// 客户端输出通道容量
pub const CLIENT_BUFFER_CAPACITY: usize = 32;

/// 转发给客户端的上游错误信息最大长度
const MAX_ERROR_MESSAGE_BYTES: usize = 512;

/// 中继参数
#[derive(Debug, Clone)]
pub struct RelaySettings {
    /// 两次刷新之间的最小间隔
    pub flush_interval: Duration,
    /// 上游空闲超时，None 表示不限制
    pub idle_timeout: Option<Duration>,
    /// 上游不可用时的降级提示
    pub fallback_message: String,
}

/// 会话结束方式
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// 正常完成
    Completed { tokens: u64 },
    /// 上游不可用，已返回降级提示
    Fallback,
    /// 客户端提前断开
    ClientDisconnected,
    /// 上游报错或连接中断
    UpstreamFailed(String),
    /// 上游空闲超时
    TimedOut,
}

/// 客户端已断开
#[derive(Debug)]
pub struct ClientGone;

/// 客户端输出端
///
/// 事件先写入待发送缓冲，距上次刷新超过 `flush_interval` 才交给传输层，
/// 高 token 速率下合并小块写入。
pub struct ClientSink {
    tx: mpsc::Sender<Bytes>,
    pending: BytesMut,
    last_flush: Option<Instant>,
    flush_interval: Duration,
}

impl ClientSink {
    /// 创建输出端与对应的接收端（接收端作为响应体）
    pub fn channel(flush_interval: Duration) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(CLIENT_BUFFER_CAPACITY);
        let sink = Self {
            tx,
            pending: BytesMut::new(),
            last_flush: None,
            flush_interval,
        };
        (sink, rx)
    }

    /// 等待客户端断开
    pub async fn closed(&self) {
        self.tx.closed().await
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// 待发送数据最晚的刷新时间
    pub fn flush_deadline(&self) -> Option<Instant> {
        if self.pending.is_empty() {
            return None;
        }
        Some(match self.last_flush {
            Some(last) => last + self.flush_interval,
            None => Instant::now(),
        })
    }

    fn flush_due(&self, now: Instant) -> bool {
        match self.last_flush {
            Some(last) => now.duration_since(last) >= self.flush_interval,
            None => true,
        }
    }

    /// 写入一个事件，到达刷新间隔时立即发送
    pub async fn write(&mut self, event: &ClientEvent) -> Result<(), ClientGone> {
        if self.tx.is_closed() {
            return Err(ClientGone);
        }
        self.pending.extend_from_slice(&event.encode());
        if self.flush_due(Instant::now()) {
            self.flush().await?;
        }
        Ok(())
    }

    /// 发送所有待发送数据
    pub async fn flush(&mut self) -> Result<(), ClientGone> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let chunk = self.pending.split().freeze();
        self.tx.send(chunk).await.map_err(|_| ClientGone)?;
        self.last_flush = Some(Instant::now());
        Ok(())
    }

    /// 发送剩余数据并关闭输出
    pub async fn close(mut self) -> Result<(), ClientGone> {
        self.flush().await
    }
}

/// 上游读取循环的结束原因
enum PumpEnd {
    Finished,
    Disconnected,
    UpstreamError(String),
    IdleTimeout,
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// 中继会话
pub struct RelaySession {
    request: GenerationRequest,
    mode: GenerationMode,
    sink: ClientSink,
    tokens: u64,
    response_chars: u64,
    started: Instant,
}

impl RelaySession {
    pub fn new(request: GenerationRequest, mode: GenerationMode, sink: ClientSink) -> Self {
        Self {
            request,
            mode,
            sink,
            tokens: 0,
            response_chars: 0,
            started: Instant::now(),
        }
    }

    /// 运行会话直到结束
    pub async fn run(
        mut self,
        upstream: &UpstreamClient,
        usage: &UsageLog,
        settings: &RelaySettings,
    ) -> SessionOutcome {
        let body = self.request.to_upstream_body(self.mode, true);

        #[cfg(feature = "sensitive-logs")]
        tracing::debug!(prompt = %self.request.prompt, "上游请求 prompt");

        let opened = tokio::select! {
            _ = self.sink.closed() => {
                tracing::info!("客户端在连接上游前断开");
                return SessionOutcome::ClientDisconnected;
            }
            result = upstream.open_stream(&body) => result,
        };

        let stream = match opened {
            Ok(stream) => stream,
            Err(UpstreamError::Unavailable(reason)) => {
                tracing::warn!("推理服务不可用，返回降级提示: {}", reason);
                return self.fallback(&settings.fallback_message).await;
            }
            Err(e) => return self.fail(e.to_string()).await,
        };

        tracing::debug!("上游流已建立");

        match self.pump(stream, settings.idle_timeout).await {
            PumpEnd::Finished => self.complete(usage).await,
            PumpEnd::Disconnected => {
                tracing::info!(tokens = self.tokens, "客户端断开，已取消上游生成");
                SessionOutcome::ClientDisconnected
            }
            PumpEnd::UpstreamError(message) => self.fail(message).await,
            PumpEnd::IdleTimeout => {
                tracing::warn!(tokens = self.tokens, "上游空闲超时，结束流");
                let _ = self.sink.close().await;
                SessionOutcome::TimedOut
            }
        }
    }

    /// 读取上游直到结束；返回时上游连接随 `stream` 一起释放
    async fn pump(&mut self, mut stream: ChunkStream, idle_timeout: Option<Duration>) -> PumpEnd {
        let mut reassembler = FrameReassembler::new();
        let mut last_activity = Instant::now();

        loop {
            let flush_at = self.sink.flush_deadline();
            let idle_at = idle_timeout.map(|timeout| last_activity + timeout);

            tokio::select! {
                biased;

                _ = self.sink.closed() => return PumpEnd::Disconnected,
                _ = sleep_until_opt(flush_at), if flush_at.is_some() => {
                    if self.sink.flush().await.is_err() {
                        return PumpEnd::Disconnected;
                    }
                }
                _ = sleep_until_opt(idle_at), if idle_at.is_some() => return PumpEnd::IdleTimeout,
                chunk = stream.next() => {
                    let chunk = match chunk {
                        Some(Ok(chunk)) => chunk,
                        Some(Err(e)) => return PumpEnd::UpstreamError(e.to_string()),
                        None => {
                            reassembler.finish();
                            return PumpEnd::Finished;
                        }
                    };
                    last_activity = Instant::now();

                    for frame in reassembler.feed(&chunk) {
                        match frame {
                            ProtocolFrame::Content(content) => {
                                self.tokens += 1;
                                self.response_chars += content.chars().count() as u64;
                                if self.sink.write(&ClientEvent::Content(content)).await.is_err() {
                                    return PumpEnd::Disconnected;
                                }
                            }
                            ProtocolFrame::Error(message) => return PumpEnd::UpstreamError(message),
                            ProtocolFrame::Done => return PumpEnd::Finished,
                        }
                    }
                }
            }
        }
    }

    /// 正常结束：写结束标记、关闭输出、记录用量
    async fn complete(mut self, usage: &UsageLog) -> SessionOutcome {
        if self.sink.write(&ClientEvent::Done).await.is_err() || self.sink.close().await.is_err() {
            tracing::info!(tokens = self.tokens, "客户端在结束前断开");
            return SessionOutcome::ClientDisconnected;
        }

        let duration_ms = self.started.elapsed().as_millis() as u64;
        let speed = tokens_per_second(self.tokens, duration_ms);
        tracing::info!(
            tokens = self.tokens,
            duration_ms,
            tokens_per_second = speed,
            "流式生成完成"
        );

        let kind = match self.mode {
            GenerationMode::Expert => UsageKind::ExpertStream,
            GenerationMode::Standard => UsageKind::Completion,
        };
        usage
            .append(&UsageEvent {
                timestamp: chrono::Utc::now(),
                kind,
                prompt_length: self.request.prompt_len() as u64,
                response_length: self.response_chars,
                tokens: self.tokens,
                duration: duration_ms,
                tokens_per_second: speed,
                max_tokens: Some(self.request.max_tokens(self.mode)),
            })
            .await;

        SessionOutcome::Completed {
            tokens: self.tokens,
        }
    }

    /// 降级：一条提示内容加结束标记
    async fn fallback(mut self, message: &str) -> SessionOutcome {
        let content = ClientEvent::Content(message.to_string());
        if self.sink.write(&content).await.is_err()
            || self.sink.write(&ClientEvent::Done).await.is_err()
            || self.sink.close().await.is_err()
        {
            return SessionOutcome::ClientDisconnected;
        }
        SessionOutcome::Fallback
    }

    /// 上游失败：尽力发送错误事件后关闭，不重试
    async fn fail(mut self, message: String) -> SessionOutcome {
        tracing::error!(tokens = self.tokens, "上游生成失败: {}", message);
        let message = truncate_with_ellipsis(&message, MAX_ERROR_MESSAGE_BYTES);
        if self.sink.write(&ClientEvent::Error(message.clone())).await.is_ok() {
            let _ = self.sink.close().await;
        }
        SessionOutcome::UpstreamFailed(message)
    }
}
