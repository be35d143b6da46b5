//! 测试用的本地假推理服务

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::{Value, json};
use tokio::task::JoinHandle;

/// 流被释放时置位
struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

struct FakeConfig {
    status: u16,
    completion: Value,
    completion_delay: Duration,
    chunks: Vec<&'static str>,
    chunk_interval: Duration,
    endless: bool,
    fail_after_chunks: bool,
}

#[derive(Clone)]
struct FakeState {
    config: Arc<FakeConfig>,
    hits: Arc<AtomicUsize>,
    last_body: Arc<Mutex<Option<Value>>>,
    stream_closed: Arc<AtomicBool>,
}

pub struct FakeUpstreamBuilder {
    config: FakeConfig,
}

impl FakeUpstreamBuilder {
    /// 非流式请求的响应体
    pub fn completion(mut self, body: Value) -> Self {
        self.config.completion = body;
        self
    }

    pub fn completion_delay(mut self, delay: Duration) -> Self {
        self.config.completion_delay = delay;
        self
    }

    /// 所有 /completion 请求返回该状态码
    pub fn status(mut self, status: u16) -> Self {
        self.config.status = status;
        self
    }

    /// 流式请求按顺序输出的原始 chunk
    pub fn stream_chunks(mut self, chunks: Vec<&'static str>) -> Self {
        self.config.chunks = chunks;
        self
    }

    pub fn chunk_interval(mut self, interval: Duration) -> Self {
        self.config.chunk_interval = interval;
        self
    }

    /// 流式请求无限输出 token，直到连接被关闭
    pub fn endless(mut self) -> Self {
        self.config.endless = true;
        self
    }

    /// 输出完 chunk 后以 I/O 错误中断连接
    pub fn fail_after_chunks(mut self) -> Self {
        self.config.fail_after_chunks = true;
        self
    }

    pub async fn spawn(self) -> FakeUpstream {
        let state = FakeState {
            config: Arc::new(self.config),
            hits: Arc::new(AtomicUsize::new(0)),
            last_body: Arc::new(Mutex::new(None)),
            stream_closed: Arc::new(AtomicBool::new(false)),
        };

        let app = Router::new()
            .route("/completion", post(completion))
            .route("/health", get(|| async { Json(json!({"status": "ok"})) }))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        FakeUpstream {
            url: format!("http://{}", addr),
            state,
            task,
        }
    }
}

/// 运行中的假推理服务，drop 时停止
pub struct FakeUpstream {
    pub url: String,
    state: FakeState,
    task: JoinHandle<()>,
}

impl FakeUpstream {
    pub fn builder() -> FakeUpstreamBuilder {
        FakeUpstreamBuilder {
            config: FakeConfig {
                status: 200,
                completion: json!({"content": "", "tokens_predicted": 0}),
                completion_delay: Duration::ZERO,
                chunks: Vec::new(),
                chunk_interval: Duration::from_millis(20),
                endless: false,
                fail_after_chunks: false,
            },
        }
    }

    /// /completion 被调用的次数
    pub fn hits(&self) -> usize {
        self.state.hits.load(Ordering::SeqCst)
    }

    pub fn last_body(&self) -> Option<Value> {
        self.state.last_body.lock().unwrap().clone()
    }

    /// 流式响应体是否已被释放（正常结束或客户端断开）
    pub fn stream_closed(&self) -> bool {
        self.state.stream_closed.load(Ordering::SeqCst)
    }
}

impl Drop for FakeUpstream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn completion(State(state): State<FakeState>, Json(body): Json<Value>) -> Response {
    state.hits.fetch_add(1, Ordering::SeqCst);
    *state.last_body.lock().unwrap() = Some(body.clone());
    let config = state.config.clone();

    if config.status != 200 {
        let status = StatusCode::from_u16(config.status).unwrap();
        return (status, "upstream failure").into_response();
    }

    if body["stream"] != true {
        tokio::time::sleep(config.completion_delay).await;
        return Json(config.completion.clone()).into_response();
    }

    let guard = DropFlag(state.stream_closed.clone());
    let stream = futures::stream::unfold((0usize, guard), move |(index, guard)| {
        let config = config.clone();
        async move {
            if index > 0 {
                tokio::time::sleep(config.chunk_interval).await;
            }
            if config.endless {
                let chunk = Bytes::from_static(b"data: {\"content\":\"tok\"}\n");
                return Some((Ok(chunk), (index + 1, guard)));
            }
            if index < config.chunks.len() {
                let chunk = Bytes::from_static(config.chunks[index].as_bytes());
                return Some((Ok(chunk), (index + 1, guard)));
            }
            if config.fail_after_chunks && index == config.chunks.len() {
                let err = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "boom");
                return Some((Err(err), (index + 1, guard)));
            }
            None
        }
    });

    Response::builder()
        .header("content-type", "text/event-stream")
        .body(Body::from_stream(stream))
        .unwrap()
}

/// 一个确定无法连接的地址
pub async fn unreachable_url() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}", addr)
}
