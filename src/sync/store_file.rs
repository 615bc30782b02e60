//! # 网关会话存储文件
//!
//! 网关以 JSON 对象持久化会话：`{ "<sessionKey>": { sessionId, modelOverride?, providerOverride?, updatedAt, ... } }`。
//! 读改写只触碰本模块关心的字段，其余字段原样保留。

use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Context, ProxyError, Result};
use crate::session_store_error;

/// 条目中的模型覆盖字段
pub const MODEL_OVERRIDE_FIELD: &str = "modelOverride";
/// 条目中的提供商覆盖字段
pub const PROVIDER_OVERRIDE_FIELD: &str = "providerOverride";
/// 条目更新时间（毫秒时间戳）
pub const UPDATED_AT_FIELD: &str = "updatedAt";
/// 条目中的会话 ID
pub const SESSION_ID_FIELD: &str = "sessionId";

/// 模型 ID 拆分结果：`openrouter/foo/bar-1` → 提供商 `openrouter`，模型 `bar-1`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelOverride {
    pub provider: Option<String>,
    pub model: String,
}

impl ModelOverride {
    #[must_use]
    pub fn from_model_id(model_id: &str) -> Self {
        match model_id.split_once('/') {
            Some((provider, rest)) if !provider.is_empty() => {
                let model = rest.rsplit('/').next().unwrap_or(rest);
                Self {
                    provider: Some(provider.to_string()),
                    model: model.to_string(),
                }
            }
            _ => Self {
                provider: None,
                model: model_id.to_string(),
            },
        }
    }

    /// 条目是否已经是该覆盖值
    #[must_use]
    pub fn matches(&self, entry: &Value) -> bool {
        let model = entry.get(MODEL_OVERRIDE_FIELD).and_then(Value::as_str);
        let provider = entry.get(PROVIDER_OVERRIDE_FIELD).and_then(Value::as_str);
        model == Some(self.model.as_str())
            && self.provider.as_deref().is_none_or(|p| provider == Some(p))
    }

    /// 写入条目，保留其他字段
    pub fn write_into(&self, entry: &mut Map<String, Value>, updated_at: i64) {
        entry.insert(
            MODEL_OVERRIDE_FIELD.to_string(),
            Value::String(self.model.clone()),
        );
        if let Some(provider) = &self.provider {
            entry.insert(
                PROVIDER_OVERRIDE_FIELD.to_string(),
                Value::String(provider.clone()),
            );
        }
        entry.insert(UPDATED_AT_FIELD.to_string(), Value::from(updated_at));
        entry
            .entry(SESSION_ID_FIELD.to_string())
            .or_insert_with(|| Value::String(uuid::Uuid::new_v4().to_string()));
    }
}

/// 条目中记录的模型覆盖值
#[must_use]
pub fn entry_model_override(entry: &Value) -> Option<&str> {
    entry.get(MODEL_OVERRIDE_FIELD).and_then(Value::as_str)
}

/// 条目的更新时间
#[must_use]
pub fn entry_updated_at(entry: &Value) -> Option<i64> {
    entry.get(UPDATED_AT_FIELD).and_then(Value::as_i64)
}

/// 会话存储文件，带单写入者标志
#[derive(Debug)]
pub struct SessionStoreFile {
    path: PathBuf,
    writing: AtomicBool,
}

/// 写入标志持有期间，其它写入直接放弃
#[derive(Debug)]
pub struct WriteGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

impl SessionStoreFile {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writing: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 尝试获取写入标志
    #[must_use]
    pub fn try_begin_write(&self) -> Option<WriteGuard<'_>> {
        self.writing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| WriteGuard {
                flag: &self.writing,
            })
    }

    /// 是否有写入正在进行
    #[must_use]
    pub fn is_writing(&self) -> bool {
        self.writing.load(Ordering::Acquire)
    }

    /// 读取整个存储；文件不存在视为空
    pub fn read(&self) -> Result<Map<String, Value>> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
            Err(e) => {
                return Err(ProxyError::session_store_with_source(
                    format!("读取会话存储失败: {}", self.path.display()),
                    e,
                ));
            }
        };
        if raw.trim().is_empty() {
            return Ok(Map::new());
        }
        match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(session_store_error!(
                "会话存储不是 JSON 对象: {}",
                self.path.display()
            )),
            Err(e) => Err(ProxyError::session_store_with_source(
                format!("会话存储 JSON 无效: {}", self.path.display()),
                e,
            )),
        }
    }

    /// 通过临时文件 + 重命名写入
    pub fn write(&self, map: &Map<String, Value>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("创建目录失败: {}", parent.display()))?;
            }
        }
        let encoded = serde_json::to_vec_pretty(map)?;
        let tmp = self.tmp_path();
        fs::write(&tmp, encoded).with_context(|| format!("写入临时文件失败: {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("替换会话存储失败: {}", self.path.display()))?;
        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(std::ffi::OsStr::to_os_string)
            .unwrap_or_default();
        name.push(format!(".{}.tmp", std::process::id()));
        self.path.with_file_name(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_split_model_id() {
        assert_eq!(
            ModelOverride::from_model_id("openrouter/foo/bar-1"),
            ModelOverride {
                provider: Some("openrouter".to_string()),
                model: "bar-1".to_string(),
            }
        );
        assert_eq!(
            ModelOverride::from_model_id("anthropic/claude"),
            ModelOverride {
                provider: Some("anthropic".to_string()),
                model: "claude".to_string(),
            }
        );
        assert_eq!(
            ModelOverride::from_model_id("local-model"),
            ModelOverride {
                provider: None,
                model: "local-model".to_string(),
            }
        );
    }

    #[test]
    fn test_write_into_preserves_unknown_fields() {
        let mut entry = json!({"sessionId": "abc", "label": "tab"})
            .as_object()
            .cloned()
            .unwrap();
        ModelOverride::from_model_id("openrouter/foo/bar-1").write_into(&mut entry, 42);

        let entry = Value::Object(entry);
        assert_eq!(entry["sessionId"], "abc");
        assert_eq!(entry["label"], "tab");
        assert_eq!(entry["modelOverride"], "bar-1");
        assert_eq!(entry["providerOverride"], "openrouter");
        assert_eq!(entry_updated_at(&entry), Some(42));
        assert!(ModelOverride::from_model_id("openrouter/foo/bar-1").matches(&entry));
        assert!(!ModelOverride::from_model_id("other/bar-1").matches(&entry));
    }

    #[test]
    fn test_missing_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStoreFile::new(dir.path().join("sessions.json"));
        assert!(store.read().unwrap().is_empty());
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStoreFile::new(dir.path().join("nested").join("sessions.json"));
        let map = json!({"s1": {"sessionId": "x"}}).as_object().cloned().unwrap();
        store.write(&map).unwrap();
        assert_eq!(store.read().unwrap(), map);
        // 临时文件已被重命名
        assert_eq!(std::fs::read_dir(dir.path().join("nested")).unwrap().count(), 1);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        std::fs::write(&path, "{not json").unwrap();
        let store = SessionStoreFile::new(&path);
        assert!(store.read().is_err());
    }

    #[test]
    fn test_write_guard_is_exclusive() {
        let store = SessionStoreFile::new("unused.json");
        let guard = store.try_begin_write();
        assert!(guard.is_some());
        assert!(store.try_begin_write().is_none());
        drop(guard);
        assert!(!store.is_writing());
        assert!(store.try_begin_write().is_some());
    }
}
