//! 上游事件流重组
//!
//! 上游以 `data: <json>` 行输出事件，但网络分块与行边界无关：
//! 一行可能被拆到多个 chunk，一个 chunk 也可能包含多行。
//! `FrameReassembler` 缓存未结束的尾部，只解析完整的行。

use bytes::{Buf, BytesMut};
use serde::Deserialize;
use serde_json::Value;

/// 数据行前缀
const DATA_PREFIX: &[u8] = b"data:";
/// 流结束标记
const DONE_SENTINEL: &str = "[DONE]";

/// 上游协议帧
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolFrame {
    /// 文本增量
    Content(String),
    /// 上游报告的错误
    Error(String),
    /// 流结束
    Done,
}

/// 单行解码失败
#[derive(Debug)]
pub enum FrameError {
    InvalidUtf8,
    InvalidJson(serde_json::Error),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidUtf8 => write!(f, "行不是有效的 UTF-8"),
            Self::InvalidJson(e) => write!(f, "JSON 解析失败: {}", e),
        }
    }
}

impl std::error::Error for FrameError {}

/// 上游单行 payload
#[derive(Debug, Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    error: Option<Value>,
}

/// 解码一行完整的上游数据
///
/// - `Ok(None)`：空行、非数据行，或没有内容的 payload
/// - `Err(_)`：数据行本身损坏
pub fn decode_line(line: &[u8]) -> Result<Option<ProtocolFrame>, FrameError> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
        return Ok(None);
    };

    let payload = std::str::from_utf8(payload)
        .map_err(|_| FrameError::InvalidUtf8)?
        .trim();
    if payload.is_empty() {
        return Ok(None);
    }
    if payload == DONE_SENTINEL {
        return Ok(Some(ProtocolFrame::Done));
    }

    let chunk: CompletionChunk = serde_json::from_str(payload).map_err(FrameError::InvalidJson)?;

    if let Some(error) = chunk.error {
        return Ok(Some(ProtocolFrame::Error(error_message(&error))));
    }

    Ok(chunk
        .content
        .filter(|c| !c.is_empty())
        .map(ProtocolFrame::Content))
}

/// 提取上游错误信息，兼容字符串与 `{"message": ...}` 两种格式
fn error_message(error: &Value) -> String {
    match error {
        Value::String(s) => s.clone(),
        Value::Object(map) => map
            .get("message")
            .and_then(|m| m.as_str())
            .map(|m| m.to_string())
            .unwrap_or_else(|| error.to_string()),
        other => other.to_string(),
    }
}

/// 帧重组器
///
/// 生命周期与一条上游连接相同，不在请求之间复用。
#[derive(Debug, Default)]
pub struct FrameReassembler {
    buffer: BytesMut,
    finished: bool,
    skipped: usize,
}

impl FrameReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// 是否已收到结束标记
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// 被跳过的损坏行数量
    pub fn skipped_lines(&self) -> usize {
        self.skipped
    }

    /// 输入一个 chunk，返回其中所有完整行解出的帧（按顺序）
    ///
    /// 收到结束标记后，结束帧是最后一个输出，之后的输入全部忽略。
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<ProtocolFrame> {
        let mut frames = Vec::new();
        if self.finished || chunk.is_empty() {
            return frames;
        }

        self.buffer.extend_from_slice(chunk);

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line = self.buffer.split_to(pos);
            self.buffer.advance(1);

            match decode_line(&line) {
                Ok(Some(ProtocolFrame::Done)) => {
                    self.finished = true;
                    self.buffer.clear();
                    frames.push(ProtocolFrame::Done);
                    break;
                }
                Ok(Some(frame)) => frames.push(frame),
                Ok(None) => {}
                Err(e) => {
                    // 个别损坏的行直接跳过，不影响整条流
                    self.skipped += 1;
                    tracing::debug!("跳过无法解析的上游数据行: {}", e);
                }
            }
        }

        frames
    }

    /// 连接结束，丢弃未以换行结尾的残留数据，返回丢弃的字节数
    pub fn finish(self) -> usize {
        let remainder = self.buffer.len();
        if remainder > 0 {
            tracing::debug!("上游流结束时丢弃 {} 字节未完成的数据", remainder);
        }
        remainder
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STREAM: &str = concat!(
        "data: {\"content\":\"fn \",\"stop\":false}\n",
        "\n",
        ": keep-alive comment\n",
        "data: {\"content\":\"main() {\\n\"}\r\n",
        "data: {\"content\":\"\"}\n",
        "data: {\"content\":\"    println!(\\\"你好\\\");\\n}\"}\n",
        "data: {\"content\":\"\",\"stop\":true,\"tokens_predicted\":3}\n",
    );

    fn expected() -> Vec<ProtocolFrame> {
        vec![
            ProtocolFrame::Content("fn ".to_string()),
            ProtocolFrame::Content("main() {\n".to_string()),
            ProtocolFrame::Content("    println!(\"你好\");\n}".to_string()),
        ]
    }

    fn feed_all(chunks: &[&[u8]]) -> Vec<ProtocolFrame> {
        let mut reassembler = FrameReassembler::new();
        chunks.iter().flat_map(|c| reassembler.feed(c)).collect()
    }

    #[test]
    fn test_single_chunk() {
        assert_eq!(feed_all(&[STREAM.as_bytes()]), expected());
    }

    /// 测试在任意位置切分都得到相同的帧序列（包括切在多字节字符中间）
    #[test]
    fn test_chunk_boundary_invariance() {
        let bytes = STREAM.as_bytes();
        for split in 0..=bytes.len() {
            let (a, b) = bytes.split_at(split);
            assert_eq!(feed_all(&[a, b]), expected(), "split at {}", split);
        }
        for first in (0..bytes.len()).step_by(7) {
            for second in (first..=bytes.len()).step_by(5) {
                let chunks = [&bytes[..first], &bytes[first..second], &bytes[second..]];
                assert_eq!(feed_all(&chunks), expected(), "splits {} {}", first, second);
            }
        }
    }

    #[test]
    fn test_byte_by_byte() {
        let chunks: Vec<&[u8]> = STREAM.as_bytes().chunks(1).collect();
        assert_eq!(feed_all(&chunks), expected());
    }

    /// 测试损坏的行只影响自身
    #[test]
    fn test_malformed_lines_are_skipped() {
        let input = concat!(
            "data: {\"content\":\"a\"}\n",
            "data: {\"content\":\n",
            "data: not json at all\n",
            "data: {\"content\":\"b\"}\n",
            "data: \u{0}\u{1}\n",
            "data: {\"content\":\"c\"}\n",
        );
        let mut reassembler = FrameReassembler::new();
        let frames = reassembler.feed(input.as_bytes());
        assert_eq!(
            frames,
            vec![
                ProtocolFrame::Content("a".to_string()),
                ProtocolFrame::Content("b".to_string()),
                ProtocolFrame::Content("c".to_string()),
            ]
        );
        assert_eq!(reassembler.skipped_lines(), 3);
    }

    #[test]
    fn test_invalid_utf8_line_is_skipped() {
        let mut reassembler = FrameReassembler::new();
        let mut input = b"data: {\"content\":\"\xff\xfe\"}\n".to_vec();
        input.extend_from_slice(b"data: {\"content\":\"ok\"}\n");
        assert_eq!(
            reassembler.feed(&input),
            vec![ProtocolFrame::Content("ok".to_string())]
        );
        assert_eq!(reassembler.skipped_lines(), 1);
    }

    /// 测试结束标记之后的数据被忽略
    #[test]
    fn test_done_sentinel_ends_stream() {
        let mut reassembler = FrameReassembler::new();
        let frames = reassembler.feed(b"data: {\"content\":\"x\"}\ndata: [DONE]\ndata: {\"content\":\"late\"}\n");
        assert_eq!(
            frames,
            vec![ProtocolFrame::Content("x".to_string()), ProtocolFrame::Done]
        );
        assert!(reassembler.is_finished());
        assert!(reassembler.feed(b"data: {\"content\":\"later\"}\n").is_empty());
    }

    #[test]
    fn test_error_payloads() {
        let mut reassembler = FrameReassembler::new();
        let frames = reassembler.feed(
            b"data: {\"error\":{\"code\":500,\"message\":\"slot unavailable\"}}\ndata: {\"error\":\"oom\"}\n",
        );
        assert_eq!(
            frames,
            vec![
                ProtocolFrame::Error("slot unavailable".to_string()),
                ProtocolFrame::Error("oom".to_string()),
            ]
        );
    }

    /// 测试 `data:` 后没有空格也能识别
    #[test]
    fn test_prefix_without_space() {
        assert_eq!(
            decode_line(b"data:{\"content\":\"x\"}").unwrap(),
            Some(ProtocolFrame::Content("x".to_string()))
        );
        assert_eq!(decode_line(b"event: message").unwrap(), None);
        assert_eq!(decode_line(b"data: ").unwrap(), None);
    }

    #[test]
    fn test_empty_chunk_is_noop() {
        let mut reassembler = FrameReassembler::new();
        assert!(reassembler.feed(b"data: {\"content\":").is_empty());
        assert!(reassembler.feed(b"").is_empty());
        assert_eq!(
            reassembler.feed(b"\"y\"}\n"),
            vec![ProtocolFrame::Content("y".to_string())]
        );
    }

    /// 测试未以换行结尾的残留数据在结束时被丢弃
    #[test]
    fn test_trailing_remainder_is_discarded() {
        let mut reassembler = FrameReassembler::new();
        let frames = reassembler.feed(b"data: {\"content\":\"a\"}\ndata: {\"content\":\"b\"}");
        assert_eq!(frames, vec![ProtocolFrame::Content("a".to_string())]);
        assert_eq!(reassembler.finish(), "data: {\"content\":\"b\"}".len());
    }
}
