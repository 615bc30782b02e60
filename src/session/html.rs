//! # 控制台 HTML 基础路径改写
//!
//! 控制台页面中的基础路径占位符替换为 `/s/<sessionKey>`，
//! 使页面内的相对资源与 WebSocket 地址都落在会话作用域下。

use bytes::{Bytes, BytesMut};
use memchr::memmem;

/// 是否是 HTML 响应
#[must_use]
pub fn is_html(content_type: Option<&str>) -> bool {
    content_type.is_some_and(|ct| {
        ct.split(';')
            .next()
            .is_some_and(|mime| mime.trim().eq_ignore_ascii_case("text/html"))
    })
}

/// 替换所有出现的占位符
#[must_use]
pub fn replace_all(haystack: &[u8], needle: &[u8], replacement: &[u8]) -> Vec<u8> {
    if needle.is_empty() {
        return haystack.to_vec();
    }
    let mut out = Vec::with_capacity(haystack.len());
    let mut last = 0;
    for start in memmem::find_iter(haystack, needle) {
        out.extend_from_slice(&haystack[last..start]);
        out.extend_from_slice(replacement);
        last = start + needle.len();
    }
    out.extend_from_slice(&haystack[last..]);
    out
}

/// 缓冲整个响应体，结束时统一替换
#[derive(Debug, Clone)]
pub struct HtmlRewriter {
    placeholder: String,
    base_path: String,
    buffer: BytesMut,
}

impl HtmlRewriter {
    #[must_use]
    pub fn new(placeholder: impl Into<String>, base_path: impl Into<String>) -> Self {
        Self {
            placeholder: placeholder.into(),
            base_path: base_path.into(),
            buffer: BytesMut::new(),
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// 取出改写后的完整响应体
    pub fn finish(&mut self) -> Bytes {
        let body = self.buffer.split();
        Bytes::from(replace_all(
            &body,
            self.placeholder.as_bytes(),
            self.base_path.as_bytes(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLACEHOLDER: &str = "__OPENCLAW_CONTROL_UI_BASE_PATH__";

    #[test]
    fn test_is_html() {
        assert!(is_html(Some("text/html")));
        assert!(is_html(Some("text/html; charset=utf-8")));
        assert!(is_html(Some("TEXT/HTML")));
        assert!(!is_html(Some("application/json")));
        assert!(!is_html(None));
    }

    #[test]
    fn test_replaces_every_occurrence_across_chunks() {
        let mut rewriter = HtmlRewriter::new(PLACEHOLDER, "/s/proxy:1");
        rewriter.push(b"<base href=\"__OPENCLAW_CONTROL");
        rewriter.push(b"_UI_BASE_PATH__/\"><script>window.base='__OPENCLAW_CONTROL_UI_BASE_PATH__'</script>");
        let out = rewriter.finish();
        assert_eq!(
            std::str::from_utf8(&out).unwrap(),
            "<base href=\"/s/proxy:1/\"><script>window.base='/s/proxy:1'</script>"
        );
        assert_eq!(rewriter.buffered_len(), 0);
    }

    #[test]
    fn test_no_placeholder_is_identity() {
        assert_eq!(replace_all(b"<html></html>", b"X_Y", b"z"), b"<html></html>");
        assert_eq!(replace_all(b"abc", b"", b"z"), b"abc");
    }

    #[test]
    fn test_adjacent_and_non_utf8_occurrences() {
        assert_eq!(replace_all(b"XYXY", b"XY", b"-"), b"--");
        assert_eq!(
            replace_all(b"\xff__P__\xfe", b"__P__", b"/s/k"),
            b"\xff/s/k\xfe".to_vec()
        );
    }
}
