//! 用量日志存储与统计
//!
//! 按 UTC 日期分区的 JSONL 追加日志，统计时全量扫描所有分区。

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Result;

use super::model::{UsageEvent, UsageKind, UsageSummary};
use crate::common::round2;

/// 分区文件扩展名
const PARTITION_EXT: &str = "jsonl";

/// 用量日志
#[derive(Debug, Clone)]
pub struct UsageLog {
    dir: PathBuf,
}

impl UsageLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// 分区文件路径
    fn partition_path(&self, event: &UsageEvent) -> PathBuf {
        self.dir.join(format!("{}.{}", event.partition(), PARTITION_EXT))
    }

    /// 追加一条记录（失败只记日志，不返回错误）
    pub async fn append(&self, event: &UsageEvent) {
        let path = self.partition_path(event);
        let mut line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!("序列化用量记录失败: {}", e);
                return;
            }
        };
        line.push('\n');

        let result = tokio::task::spawn_blocking(move || append_line(&path, &line)).await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("写入用量日志失败: {:#}", e),
            Err(e) => tracing::warn!("写入用量日志任务失败: {}", e),
        }
    }

    /// 扫描所有分区并计算统计
    pub async fn summarize(&self) -> Result<UsageSummary> {
        let mut files = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            // 还没有任何记录
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(UsageSummary::default());
            }
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some(PARTITION_EXT) {
                files.push(path);
            }
        }
        files.sort();

        let mut totals = UsageTotals::default();
        for path in files {
            match tokio::fs::read_to_string(&path).await {
                Ok(content) => {
                    totals.partitions += 1;
                    for line in content.lines().filter(|l| !l.trim().is_empty()) {
                        // 损坏的行直接跳过
                        if let Ok(event) = serde_json::from_str::<UsageEvent>(line) {
                            totals.add(&event);
                        }
                    }
                }
                Err(e) => tracing::warn!("读取用量日志 {} 失败: {}", path.display(), e),
            }
        }

        Ok(totals.into_summary())
    }
}

fn append_line(path: &Path, line: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    file.write_all(line.as_bytes())?;
    Ok(())
}

/// 累加器
#[derive(Debug, Default)]
struct UsageTotals {
    requests: u64,
    expert: u64,
    completion: u64,
    tokens: u64,
    duration_ms: u64,
    partitions: usize,
}

impl UsageTotals {
    fn add(&mut self, event: &UsageEvent) {
        self.requests += 1;
        match event.kind {
            UsageKind::ExpertStream => self.expert += 1,
            UsageKind::Completion => self.completion += 1,
            UsageKind::Other => {}
        }
        self.tokens = self.tokens.saturating_add(event.tokens);
        self.duration_ms = self.duration_ms.saturating_add(event.duration);
    }

    fn into_summary(self) -> UsageSummary {
        let (average_tokens_per_request, average_duration) = if self.requests > 0 {
            (
                (self.tokens as f64 / self.requests as f64).round() as u64,
                (self.duration_ms as f64 / self.requests as f64 / 1000.0).round() as u64,
            )
        } else {
            (0, 0)
        };
        let average_speed = if self.duration_ms > 0 {
            round2(self.tokens as f64 / (self.duration_ms as f64 / 1000.0))
        } else {
            0.0
        };

        UsageSummary {
            total_requests: self.requests,
            expert_requests: self.expert,
            completion_requests: self.completion,
            total_tokens: self.tokens,
            total_duration: (self.duration_ms as f64 / 1000.0).round() as u64,
            average_tokens_per_request,
            average_duration,
            average_speed,
            partitions: self.partitions,
        }
    }
}
