//! # 会话身份解析
//!
//! 会话键按以下顺序确定：
//! 1. 路径前缀 `/s/<sessionKey>/...`（转发前去掉前缀）
//! 2. 查询参数 `session`
//! 3. Cookie（默认 `openclaw_session`）
//!
//! `/new` 生成新的会话键并重定向到该会话的路径作用域。

use url::form_urlencoded;

/// 会话路径前缀
pub const SESSION_PATH_PREFIX: &str = "/s/";
/// 查询参数名
pub const SESSION_QUERY_PARAM: &str = "session";

/// 会话键来源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionSource {
    Path,
    Query,
    Cookie,
    None,
}

impl SessionSource {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Path => "path",
            Self::Query => "query",
            Self::Cookie => "cookie",
            Self::None => "none",
        }
    }
}

/// 解析结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSession {
    pub session_key: Option<String>,
    pub source: SessionSource,
    /// 转发给网关的路径（含查询串）
    pub forward_path: String,
    /// 路径作用域会话的基础路径 `/s/<key>`
    pub base_path: Option<String>,
    /// 需要回写给浏览器的 `Set-Cookie`
    pub set_cookie: Option<String>,
}

impl ResolvedSession {
    #[must_use]
    pub const fn is_path_scoped(&self) -> bool {
        matches!(self.source, SessionSource::Path)
    }
}

/// `/new` 的重定向信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSessionRedirect {
    pub session_key: String,
    pub location: String,
    pub set_cookie: String,
}

/// 会话身份解析器
#[derive(Debug, Clone)]
pub struct SessionResolver {
    prefix: String,
    cookie_name: String,
}

impl SessionResolver {
    #[must_use]
    pub fn new(prefix: impl Into<String>, cookie_name: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            cookie_name: cookie_name.into(),
        }
    }

    #[must_use]
    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    /// 生成新的会话键 `<prefix><uuid-v4>`
    #[must_use]
    pub fn generate(&self) -> String {
        format!("{}{}", self.prefix, uuid::Uuid::new_v4())
    }

    /// `/new` 与 `/new/`
    #[must_use]
    pub fn is_new_session_path(path: &str) -> bool {
        path == "/new" || path == "/new/"
    }

    /// 创建新会话并构造重定向
    #[must_use]
    pub fn new_session_redirect(&self, gateway_token: Option<&str>) -> NewSessionRedirect {
        let session_key = self.generate();
        let base_path = scoped_base_path(&session_key);
        let mut location = format!("{base_path}/");
        if let Some(token) = gateway_token.filter(|t| !t.is_empty()) {
            let query = form_urlencoded::Serializer::new(String::new())
                .append_pair("token", token)
                .finish();
            location.push('?');
            location.push_str(&query);
        }
        NewSessionRedirect {
            set_cookie: build_cookie(&self.cookie_name, &session_key, &base_path),
            location,
            session_key,
        }
    }

    /// 解析请求的会话身份
    #[must_use]
    pub fn resolve(&self, path: &str, query: Option<&str>, cookie_header: Option<&str>) -> ResolvedSession {
        let with_query = |p: &str| match query {
            Some(q) if !q.is_empty() => format!("{p}?{q}"),
            _ => p.to_string(),
        };

        if let Some((raw_key, rest)) = split_scoped_path(path) {
            let session_key = urlencoding::decode(raw_key)
                .map_or_else(|_| raw_key.to_string(), std::borrow::Cow::into_owned);
            return ResolvedSession {
                session_key: Some(session_key),
                source: SessionSource::Path,
                forward_path: with_query(rest),
                base_path: Some(format!("{SESSION_PATH_PREFIX}{raw_key}")),
                set_cookie: None,
            };
        }

        let from_cookie = cookie_header.and_then(|h| parse_cookie(h, &self.cookie_name));

        if let Some(from_query) = query.and_then(query_session) {
            let set_cookie = from_cookie
                .is_none()
                .then(|| build_cookie(&self.cookie_name, &from_query, "/"));
            return ResolvedSession {
                session_key: Some(from_query),
                source: SessionSource::Query,
                forward_path: with_query(path),
                base_path: None,
                set_cookie,
            };
        }

        match from_cookie {
            Some(key) => ResolvedSession {
                session_key: Some(key),
                source: SessionSource::Cookie,
                forward_path: with_query(path),
                base_path: None,
                set_cookie: None,
            },
            None => ResolvedSession {
                session_key: None,
                source: SessionSource::None,
                forward_path: with_query(path),
                base_path: None,
                set_cookie: None,
            },
        }
    }
}

/// `/s/<key>/<rest>` → (`key`, `/<rest>`)
fn split_scoped_path(path: &str) -> Option<(&str, &str)> {
    let after = path.strip_prefix(SESSION_PATH_PREFIX)?;
    let (key, rest) = match after.find('/') {
        Some(idx) => (&after[..idx], &after[idx..]),
        None => (after, "/"),
    };
    (!key.is_empty()).then_some((key, rest))
}

fn query_session(query: &str) -> Option<String> {
    form_urlencoded::parse(query.as_bytes())
        .find(|(k, v)| k == SESSION_QUERY_PARAM && !v.is_empty())
        .map(|(_, v)| v.into_owned())
}

/// 路径作用域会话的基础路径
#[must_use]
pub fn scoped_base_path(session_key: &str) -> String {
    format!("{SESSION_PATH_PREFIX}{session_key}")
}

/// 从 `Cookie` 头中取出指定 cookie（已解码）
#[must_use]
pub fn parse_cookie(header: &str, name: &str) -> Option<String> {
    header
        .split(';')
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, v)| k.trim() == name && !v.is_empty())
        .map(|(_, v)| {
            urlencoding::decode(v.trim())
                .map_or_else(|_| v.trim().to_string(), std::borrow::Cow::into_owned)
        })
}

/// 构造会话 cookie
#[must_use]
pub fn build_cookie(name: &str, value: &str, path: &str) -> String {
    format!(
        "{name}={}; Path={path}; SameSite=Lax",
        urlencoding::encode(value)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn resolver() -> SessionResolver {
        SessionResolver::new("proxy:", "openclaw_session")
    }

    #[test]
    fn test_generate_uses_prefix() {
        let key = resolver().generate();
        assert!(key.starts_with("proxy:"));
        assert_eq!(key.len(), "proxy:".len() + 36);
    }

    #[test]
    fn test_path_scoped_session() {
        let resolved = resolver().resolve("/s/proxy:abc/api/chat", Some("x=1"), None);
        assert_eq!(resolved.session_key.as_deref(), Some("proxy:abc"));
        assert_eq!(resolved.source, SessionSource::Path);
        assert_eq!(resolved.forward_path, "/api/chat?x=1");
        assert_eq!(resolved.base_path.as_deref(), Some("/s/proxy:abc"));
        assert!(resolved.set_cookie.is_none());
    }

    #[test]
    fn test_path_scoped_root() {
        let resolved = resolver().resolve("/s/proxy:abc", None, None);
        assert_eq!(resolved.forward_path, "/");
        let resolved = resolver().resolve("/s/proxy%3Aabc/", None, None);
        assert_eq!(resolved.session_key.as_deref(), Some("proxy:abc"));
        assert_eq!(resolved.forward_path, "/");
    }

    #[test]
    fn test_path_wins_over_query_and_cookie() {
        let resolved = resolver().resolve(
            "/s/p1/",
            Some("session=q1"),
            Some("openclaw_session=c1"),
        );
        assert_eq!(resolved.session_key.as_deref(), Some("p1"));
    }

    #[test]
    fn test_query_session_sets_cookie_when_missing() {
        let resolved = resolver().resolve("/", Some("session=proxy%3Aq1"), None);
        assert_eq!(resolved.session_key.as_deref(), Some("proxy:q1"));
        assert_eq!(resolved.source, SessionSource::Query);
        assert_eq!(
            resolved.set_cookie.as_deref(),
            Some("openclaw_session=proxy%3Aq1; Path=/; SameSite=Lax")
        );

        let with_cookie = resolver().resolve("/", Some("session=q1"), Some("openclaw_session=c1"));
        assert_eq!(with_cookie.session_key.as_deref(), Some("q1"));
        assert!(with_cookie.set_cookie.is_none());
    }

    #[test]
    fn test_cookie_session() {
        let resolved = resolver().resolve(
            "/api",
            None,
            Some("theme=dark; openclaw_session=proxy%3Ac1; other=1"),
        );
        assert_eq!(resolved.session_key.as_deref(), Some("proxy:c1"));
        assert_eq!(resolved.source, SessionSource::Cookie);
    }

    #[test]
    fn test_no_session() {
        let resolved = resolver().resolve("/assets/app.js", None, Some("xopenclaw_session=nope"));
        assert!(resolved.session_key.is_none());
        assert_eq!(resolved.source, SessionSource::None);
        assert_eq!(resolved.forward_path, "/assets/app.js");
    }

    #[test]
    fn test_new_session_redirect() {
        let redirect = resolver().new_session_redirect(None);
        let key = &redirect.session_key;
        assert_eq!(redirect.location, format!("/s/{key}/"));
        assert_eq!(
            redirect.set_cookie,
            format!(
                "openclaw_session={}; Path=/s/{key}; SameSite=Lax",
                urlencoding::encode(key)
            )
        );
    }

    #[test]
    fn test_new_session_redirect_with_token() {
        let redirect = resolver().new_session_redirect(Some("t k"));
        assert!(redirect.location.ends_with("/?token=t+k"));
    }

    #[test]
    fn test_new_session_path() {
        assert!(SessionResolver::is_new_session_path("/new"));
        assert!(SessionResolver::is_new_session_path("/new/"));
        assert!(!SessionResolver::is_new_session_path("/newer"));
    }
}
