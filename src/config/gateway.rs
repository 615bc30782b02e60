//! # 网关访问令牌
//!
//! 令牌优先取环境变量，其次读取 openclaw.json 中的 `gateway.auth.token`

use std::path::Path;

/// 从 openclaw.json 读取网关令牌
#[must_use]
pub fn load_gateway_token_from_file(path: &Path) -> Option<String> {
    let raw = std::fs::read_to_string(path).ok()?;
    let parsed: serde_json::Value = serde_json::from_str(&raw).ok()?;
    parsed
        .pointer("/gateway/auth/token")
        .and_then(serde_json::Value::as_str)
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(ToString::to_string)
}

/// 解析最终使用的网关令牌
#[must_use]
pub fn resolve_gateway_token(explicit: Option<&str>, config_path: &Path) -> Option<String> {
    explicit
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(ToString::to_string)
        .or_else(|| load_gateway_token_from_file(config_path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_token_from_config_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"gateway": {{"auth": {{"token": "  abc123 "}}}}}}"#).unwrap();

        assert_eq!(resolve_gateway_token(None, file.path()).as_deref(), Some("abc123"));
    }

    #[test]
    fn test_explicit_token_wins() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"gateway": {{"auth": {{"token": "from-file"}}}}}}"#).unwrap();

        assert_eq!(
            resolve_gateway_token(Some("from-env"), file.path()).as_deref(),
            Some("from-env")
        );
        assert_eq!(
            resolve_gateway_token(Some("   "), file.path()).as_deref(),
            Some("from-file")
        );
    }

    #[test]
    fn test_missing_file_yields_none() {
        assert!(resolve_gateway_token(None, Path::new("/nonexistent/openclaw.json")).is_none());
    }
}
