//! 公共工具模块

pub mod auth;

/// 安全地截断 UTF-8 字符串，确保不会在多字节字符中间截断
///
/// 返回不超过 `max_bytes` 字节的最长有效 UTF-8 子串
pub fn truncate_str_safe(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }

    // 从 max_bytes 位置向前查找有效的字符边界
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }

    &s[..end]
}

/// 安全地截断字符串并添加省略号后缀
pub fn truncate_with_ellipsis(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }

    // 为省略号预留空间
    let truncate_at = if max_bytes > 3 { max_bytes - 3 } else { max_bytes };
    let truncated = truncate_str_safe(s, truncate_at);
    format!("{}...", truncated)
}

/// 保留两位小数
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// 根据 token 数与耗时计算吞吐（tokens/s，两位小数）
pub fn tokens_per_second(tokens: u64, duration_ms: u64) -> f64 {
    if tokens == 0 || duration_ms == 0 {
        return 0.0;
    }
    round2(tokens as f64 / (duration_ms as f64 / 1000.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_str_safe_respects_char_boundary() {
        // "你" 占 3 字节
        assert_eq!(truncate_str_safe("你好", 4), "你");
        assert_eq!(truncate_str_safe("abc", 10), "abc");
    }

    #[test]
    fn test_truncate_with_ellipsis() {
        assert_eq!(truncate_with_ellipsis("hello world", 8), "hello...");
        assert_eq!(truncate_with_ellipsis("short", 8), "short");
    }

    #[test]
    fn test_tokens_per_second() {
        assert_eq!(tokens_per_second(30, 2000), 15.0);
        assert_eq!(tokens_per_second(10, 3000), 3.33);
        assert_eq!(tokens_per_second(0, 1000), 0.0);
        assert_eq!(tokens_per_second(10, 0), 0.0);
    }
}
