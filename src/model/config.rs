use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 上游不可用时返回给客户端的默认提示
pub const DEFAULT_FALLBACK_MESSAGE: &str = "The editor is ready for editing and file management. \
AI features require the local inference server, which is not reachable right now. \
You can keep creating, editing and saving files in the meantime.";

/// llama-relay 应用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// 推理服务地址（提供 /completion 与 /health）
    #[serde(default = "default_upstream_url")]
    pub upstream_url: String,

    /// 共享密钥（可选，配置后除 /health 外的接口都需要认证）
    #[serde(default)]
    pub api_key: Option<String>,

    /// HTTP 代理地址（可选）
    /// 支持格式: http://host:port, https://host:port, socks5://host:port
    #[serde(default)]
    pub proxy_url: Option<String>,

    /// 用量日志目录，每个 UTC 日期一个 .jsonl 文件
    #[serde(default = "default_usage_log_dir")]
    pub usage_log_dir: PathBuf,

    /// 连接上游的超时（秒），用于快速判定上游不可用
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// 非流式生成的总超时（秒）
    #[serde(default = "default_generation_timeout_secs")]
    pub generation_timeout_secs: u64,

    /// 健康检查超时（秒）
    #[serde(default = "default_health_timeout_secs")]
    pub health_timeout_secs: u64,

    /// 流式生成的空闲超时（秒），未配置时不限制
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_idle_timeout_secs: Option<u64>,

    /// 两次向客户端刷新之间的最小间隔（毫秒）
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// 上游不可用时的降级提示
    #[serde(default = "default_fallback_message")]
    pub fallback_message: String,

    /// 请求体大小上限（字节）
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    /// 配置文件路径（运行时元数据，不写入 JSON）
    #[serde(skip)]
    config_path: Option<PathBuf>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    5050
}

fn default_upstream_url() -> String {
    "http://127.0.0.1:8000".to_string()
}

fn default_usage_log_dir() -> PathBuf {
    PathBuf::from("chat_logs")
}

fn default_connect_timeout_secs() -> u64 {
    3
}

fn default_generation_timeout_secs() -> u64 {
    600
}

fn default_health_timeout_secs() -> u64 {
    5
}

fn default_flush_interval_ms() -> u64 {
    10
}

fn default_fallback_message() -> String {
    DEFAULT_FALLBACK_MESSAGE.to_string()
}

fn default_max_body_bytes() -> usize {
    50 * 1024 * 1024
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            upstream_url: default_upstream_url(),
            api_key: None,
            proxy_url: None,
            usage_log_dir: default_usage_log_dir(),
            connect_timeout_secs: default_connect_timeout_secs(),
            generation_timeout_secs: default_generation_timeout_secs(),
            health_timeout_secs: default_health_timeout_secs(),
            stream_idle_timeout_secs: None,
            flush_interval_ms: default_flush_interval_ms(),
            fallback_message: default_fallback_message(),
            max_body_bytes: default_max_body_bytes(),
            config_path: None,
        }
    }
}

impl Config {
    /// 获取默认配置文件路径
    pub fn default_config_path() -> &'static str {
        "config.json"
    }

    /// 从文件加载配置
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            // 配置文件不存在，返回默认配置
            let mut config = Self::default();
            config.config_path = Some(path.to_path_buf());
            return Ok(config);
        }

        let content = fs::read_to_string(path)?;
        let mut config: Config = serde_json::from_str(&content)?;
        config.config_path = Some(path.to_path_buf());
        Ok(config)
    }

    /// 获取配置文件路径（如果有）
    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// 上游地址（去掉末尾的 `/`）
    pub fn upstream_base(&self) -> &str {
        self.upstream_url.trim_end_matches('/')
    }

    /// 共享密钥（空字符串视为未配置）
    pub fn effective_api_key(&self) -> Option<&str> {
        self.api_key.as_deref().filter(|k| !k.is_empty())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn generation_timeout(&self) -> Duration {
        Duration::from_secs(self.generation_timeout_secs)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs)
    }

    pub fn stream_idle_timeout(&self) -> Option<Duration> {
        self.stream_idle_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}
