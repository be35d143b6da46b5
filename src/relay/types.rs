//! 生成请求/响应类型定义

use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value, json};

// === 错误响应 ===

/// API 错误响应
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

/// 错误详情
#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
}

impl ErrorResponse {
    /// 创建新的错误响应
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetail {
                error_type: error_type.into(),
                message: message.into(),
            },
        }
    }

    /// 创建认证错误响应
    pub fn authentication_error() -> Self {
        Self::new("authentication_error", "Invalid API key")
    }

    /// 请求参数错误
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new("invalid_request_error", message)
    }

    pub fn upstream_unavailable(message: impl Into<String>) -> Self {
        Self::new("upstream_unavailable", message)
    }

    pub fn upstream_timeout(message: impl Into<String>) -> Self {
        Self::new("upstream_timeout", message)
    }

    pub fn api_error(message: impl Into<String>) -> Self {
        Self::new("api_error", message)
    }
}

// === 生成模式 ===

/// 生成模式，决定未指定的采样参数取什么默认值
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationMode {
    /// 高产出流式模式（/stream）
    Expert,
    /// 兼容旧版的补全模式（/completion）
    Standard,
}

/// 采样参数默认值
#[derive(Debug)]
pub struct SamplingDefaults {
    pub n_predict: i64,
    pub temperature: f64,
    pub top_p: f64,
    pub top_k: i64,
    pub repeat_penalty: f64,
    pub min_p: f64,
    pub typical_p: f64,
    pub tfs_z: f64,
    pub stop: &'static [&'static str],
}

const EXPERT_DEFAULTS: SamplingDefaults = SamplingDefaults {
    n_predict: 24000,
    temperature: 0.3,
    top_p: 0.95,
    top_k: 50,
    repeat_penalty: 1.2,
    min_p: 0.05,
    typical_p: 1.0,
    tfs_z: 1.0,
    stop: &["\nUSER:", "\nUser:", "USER REQUEST:", "\n\nUSER REQUEST:"],
};

const STANDARD_DEFAULTS: SamplingDefaults = SamplingDefaults {
    n_predict: 8000,
    temperature: 0.75,
    top_p: 0.95,
    top_k: 60,
    repeat_penalty: 1.18,
    min_p: 0.06,
    typical_p: 1.0,
    tfs_z: 1.0,
    stop: &["\nUSER:", "USER:", "\n\nUSER:"],
};

impl GenerationMode {
    pub fn defaults(&self) -> &'static SamplingDefaults {
        match self {
            Self::Expert => &EXPERT_DEFAULTS,
            Self::Standard => &STANDARD_DEFAULTS,
        }
    }
}

// === 生成请求 ===

/// 客户端生成请求
///
/// 识别的采样参数在转发前按模式补全默认值，其余字段原样转发给上游。
#[derive(Debug, Clone, Deserialize)]
pub struct GenerationRequest {
    #[serde(default, deserialize_with = "deserialize_null_as_empty")]
    pub prompt: String,
    #[serde(default)]
    pub stream: bool,
    pub n_predict: Option<i64>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub top_k: Option<i64>,
    pub repeat_penalty: Option<f64>,
    pub min_p: Option<f64>,
    pub typical_p: Option<f64>,
    pub tfs_z: Option<f64>,
    pub stop: Option<Vec<String>>,
    /// 未识别的选项
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `"prompt": null` 与缺省等价
fn deserialize_null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

impl GenerationRequest {
    /// 校验请求，返回错误信息
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.prompt.is_empty() {
            return Err("Prompt required");
        }
        Ok(())
    }

    /// prompt 长度（字符数）
    pub fn prompt_len(&self) -> usize {
        self.prompt.chars().count()
    }

    /// 生效的最大输出长度
    pub fn max_tokens(&self, mode: GenerationMode) -> i64 {
        self.n_predict.unwrap_or(mode.defaults().n_predict)
    }

    /// 构建发往上游 /completion 的请求体
    pub fn to_upstream_body(&self, mode: GenerationMode, stream: bool) -> Value {
        let defaults = mode.defaults();
        let mut body = self.extra.clone();

        body.insert("prompt".to_string(), json!(self.prompt));
        body.insert("n_predict".to_string(), json!(self.max_tokens(mode)));
        body.insert(
            "temperature".to_string(),
            json!(self.temperature.unwrap_or(defaults.temperature)),
        );
        body.insert("top_p".to_string(), json!(self.top_p.unwrap_or(defaults.top_p)));
        body.insert("top_k".to_string(), json!(self.top_k.unwrap_or(defaults.top_k)));
        body.insert(
            "repeat_penalty".to_string(),
            json!(self.repeat_penalty.unwrap_or(defaults.repeat_penalty)),
        );
        body.insert("min_p".to_string(), json!(self.min_p.unwrap_or(defaults.min_p)));
        body.insert(
            "typical_p".to_string(),
            json!(self.typical_p.unwrap_or(defaults.typical_p)),
        );
        body.insert("tfs_z".to_string(), json!(self.tfs_z.unwrap_or(defaults.tfs_z)));
        let stop = match &self.stop {
            Some(stop) => json!(stop),
            None => json!(defaults.stop),
        };
        body.insert("stop".to_string(), stop);

        // 固定的 slot/缓存参数，客户端显式传入时保留
        body.entry("cache_prompt").or_insert(json!(true));
        body.entry("slot_id").or_insert(json!(0));
        body.entry("n_keep").or_insert(json!(-1));

        if mode == GenerationMode::Expert {
            body.entry("mirostat").or_insert(json!(0));
            body.entry("mirostat_tau").or_insert(json!(5.0));
            body.entry("mirostat_eta").or_insert(json!(0.1));
        }

        body.insert("stream".to_string(), json!(stream));
        Value::Object(body)
    }
}

// === 非流式响应 ===

/// 非流式生成响应
#[derive(Debug, Serialize, Deserialize)]
pub struct BlockingResponse {
    pub content: String,
    pub tokens_predicted: u64,
    pub timings: Timings,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Timings {
    pub predicted_per_second: f64,
}

// === 客户端事件 ===

/// 发往客户端的 SSE 事件
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Content(String),
    Error(String),
    Done,
}

impl ClientEvent {
    /// 编码为一行 `data: ...` 事件
    pub fn encode(&self) -> Bytes {
        let line = match self {
            Self::Content(content) => format!("data: {}\n\n", json!({ "content": content })),
            Self::Error(message) => format!("data: {}\n\n", json!({ "error": message })),
            Self::Done => "data: [DONE]\n\n".to_string(),
        };
        Bytes::from(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> GenerationRequest {
        serde_json::from_str(json).unwrap()
    }

    /// 测试 Expert 模式的默认参数
    #[test]
    fn test_expert_defaults() {
        let req = parse(r#"{"prompt": "write a parser"}"#);
        let body = req.to_upstream_body(GenerationMode::Expert, true);

        assert_eq!(body["prompt"], "write a parser");
        assert_eq!(body["n_predict"], 24000);
        assert_eq!(body["temperature"], 0.3);
        assert_eq!(body["top_k"], 50);
        assert_eq!(body["repeat_penalty"], 1.2);
        assert_eq!(body["stop"].as_array().unwrap().len(), 4);
        assert_eq!(body["mirostat_tau"], 5.0);
        assert_eq!(body["cache_prompt"], true);
        assert_eq!(body["n_keep"], -1);
        assert_eq!(body["stream"], true);
    }

    /// 测试 Standard 模式的默认参数
    #[test]
    fn test_standard_defaults() {
        let req = parse(r#"{"prompt": "hi"}"#);
        let body = req.to_upstream_body(GenerationMode::Standard, false);

        assert_eq!(body["n_predict"], 8000);
        assert_eq!(body["temperature"], 0.75);
        assert_eq!(body["top_k"], 60);
        assert_eq!(body["min_p"], 0.06);
        assert_eq!(body["stop"], json!(["\nUSER:", "USER:", "\n\nUSER:"]));
        assert!(body.get("mirostat").is_none());
        assert_eq!(body["stream"], false);
    }

    /// 测试显式参数覆盖默认值，未识别参数原样转发
    #[test]
    fn test_explicit_options_and_passthrough() {
        let req = parse(
            r#"{
                "prompt": "hi",
                "n_predict": 128,
                "temperature": null,
                "stop": ["END"],
                "seed": 42,
                "grammar": "root ::= \"a\"",
                "cache_prompt": false,
                "stream": true
            }"#,
        );
        assert!(req.stream);

        let body = req.to_upstream_body(GenerationMode::Expert, false);
        assert_eq!(body["n_predict"], 128);
        // null 视为未设置
        assert_eq!(body["temperature"], 0.3);
        assert_eq!(body["stop"], json!(["END"]));
        assert_eq!(body["seed"], 42);
        assert_eq!(body["grammar"], "root ::= \"a\"");
        assert_eq!(body["cache_prompt"], false);
        // 是否流式由端点决定
        assert_eq!(body["stream"], false);
    }

    #[test]
    fn test_validate_empty_prompt() {
        assert!(parse(r#"{}"#).validate().is_err());
        assert!(parse(r#"{"prompt": ""}"#).validate().is_err());
        assert!(parse(r#"{"prompt": null}"#).validate().is_err());
        assert!(parse(r#"{"prompt": " "}"#).validate().is_ok());
    }

    #[test]
    fn test_prompt_len_counts_chars() {
        assert_eq!(parse(r#"{"prompt": "你好"}"#).prompt_len(), 2);
    }

    #[test]
    fn test_client_event_encoding() {
        assert_eq!(
            ClientEvent::Content("a\"b".to_string()).encode(),
            Bytes::from_static(b"data: {\"content\":\"a\\\"b\"}\n\n")
        );
        assert_eq!(
            ClientEvent::Error("boom".to_string()).encode(),
            Bytes::from_static(b"data: {\"error\":\"boom\"}\n\n")
        );
        assert_eq!(ClientEvent::Done.encode(), Bytes::from_static(b"data: [DONE]\n\n"));
    }

    /// 测试错误响应格式
    #[test]
    fn test_error_response_shape() {
        let json = serde_json::to_value(ErrorResponse::invalid_request("Prompt required")).unwrap();
        assert_eq!(json["error"]["type"], "invalid_request_error");
        assert_eq!(json["error"]["message"], "Prompt required");
    }
}
