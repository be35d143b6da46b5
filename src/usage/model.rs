//! 用量记录数据模型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// 请求类型
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageKind {
    /// 非流式补全（或以补全默认参数发起的流式请求）
    Completion,
    /// 高产出流式生成
    ExpertStream,
    /// 未来新增的类型，读取时保留计数
    #[default]
    #[serde(other)]
    Other,
}

/// 一条用量记录，写入后不再修改
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageEvent {
    #[serde(default)]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type", default)]
    pub kind: UsageKind,
    #[serde(default)]
    pub prompt_length: u64,
    #[serde(default)]
    pub response_length: u64,
    #[serde(default)]
    pub tokens: u64,
    /// 耗时（毫秒）
    #[serde(default)]
    pub duration: u64,
    #[serde(default, deserialize_with = "deserialize_lenient_f64")]
    pub tokens_per_second: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<i64>,
}

impl UsageEvent {
    /// 分区名（UTC 日期）
    pub fn partition(&self) -> String {
        self.timestamp.format("%Y-%m-%d").to_string()
    }
}

/// 旧日志里 tokensPerSecond 是字符串（如 "12.34"），兼容两种格式
fn deserialize_lenient_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrString {
        Number(f64),
        String(String),
    }

    Ok(match Option::<NumberOrString>::deserialize(deserializer)? {
        Some(NumberOrString::Number(n)) => n,
        Some(NumberOrString::String(s)) => s.trim().parse().unwrap_or(0.0),
        None => 0.0,
    })
}

/// 用量统计（每次请求重新计算，不持久化）
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSummary {
    pub total_requests: u64,
    pub expert_requests: u64,
    pub completion_requests: u64,
    pub total_tokens: u64,
    /// 总耗时（秒，四舍五入）
    pub total_duration: u64,
    pub average_tokens_per_request: u64,
    /// 平均耗时（秒，四舍五入）
    pub average_duration: u64,
    /// 平均吞吐（tokens/s，两位小数）
    pub average_speed: f64,
    /// 读取的分区（天）数
    pub partitions: usize,
}
