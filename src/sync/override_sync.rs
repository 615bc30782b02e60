//! # 模型覆盖同步
//!
//! 把每个会话下一轮的轮换模型写入网关会话存储，使网关侧的 WebSocket 聊天也使用轮换模型。
//! 用户通过 `/model` 手动固定的覆盖值不会被改写。

use chrono::Utc;
use dashmap::DashMap;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::Arc;

use super::store_file::{ModelOverride, SessionStoreFile, entry_model_override, entry_updated_at};
use crate::error::Result;
use crate::logging::{LogComponent, LogStage};
use crate::rotation::{DEFAULT_ROTATION_KEY, RotationEngine};
use crate::{ldebug, linfo};

/// 一次同步的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// 写入了新的覆盖值
    Applied { model: String, updated_at: i64 },
    /// 存储中已经是该值
    Unchanged,
    /// 用户手动固定了其它模型
    ManualPin,
    /// 该会话未启用轮换
    RotationDisabled,
    /// 另一个写入正在进行，本次放弃
    Busy,
    /// 共用轮换键，网关中没有对应会话
    SharedKey,
}

impl ApplyOutcome {
    /// 实际写入的模型
    #[must_use]
    pub fn applied_model(&self) -> Option<&str> {
        match self {
            Self::Applied { model, .. } => Some(model),
            _ => None,
        }
    }
}

/// 覆盖同步器
#[derive(Debug)]
pub struct OverrideSync {
    engine: RotationEngine,
    store: Arc<SessionStoreFile>,
    /// 每个会话最后一次看到的 `updatedAt`
    last_seen: DashMap<String, Option<i64>>,
}

impl OverrideSync {
    #[must_use]
    pub fn new(engine: RotationEngine, store: Arc<SessionStoreFile>) -> Self {
        Self {
            engine,
            store,
            last_seen: DashMap::new(),
        }
    }

    #[must_use]
    pub fn store(&self) -> &SessionStoreFile {
        &self.store
    }

    /// 把会话下一轮的模型写入存储；返回写入的模型（存储中的覆盖值）
    pub fn apply_override(&self, session_key: &str) -> Result<Option<String>> {
        Ok(self
            .apply_override_outcome(session_key)?
            .applied_model()
            .map(ToString::to_string))
    }

    /// 同 [`Self::apply_override`]，返回详细结果
    pub fn apply_override_outcome(&self, session_key: &str) -> Result<ApplyOutcome> {
        if session_key == DEFAULT_ROTATION_KEY {
            return Ok(ApplyOutcome::SharedKey);
        }
        let Some(model_id) = self.engine.current_model(session_key) else {
            return Ok(ApplyOutcome::RotationDisabled);
        };
        let target = ModelOverride::from_model_id(&model_id);

        let Some(_guard) = self.store.try_begin_write() else {
            ldebug!(
                session_key,
                LogStage::BackgroundTask,
                LogComponent::OverrideSync,
                "write_dropped",
                "另一个写入正在进行，放弃本次同步"
            );
            return Ok(ApplyOutcome::Busy);
        };

        let mut sessions = self.store.read()?;
        let entry = sessions.get(session_key);

        if let Some(entry) = entry {
            if target.matches(entry) {
                self.engine.record_applied(session_key, &target.model);
                self.last_seen
                    .insert(session_key.to_string(), entry_updated_at(entry));
                return Ok(ApplyOutcome::Unchanged);
            }

            let last_applied = self.engine.state(session_key).last_applied_model;
            if let Some(current) = entry_model_override(entry) {
                if last_applied.as_deref() != Some(current) {
                    ldebug!(
                        session_key,
                        LogStage::BackgroundTask,
                        LogComponent::OverrideSync,
                        "manual_pin",
                        "会话已手动固定模型，跳过",
                        pinned = current
                    );
                    self.last_seen
                        .insert(session_key.to_string(), entry_updated_at(entry));
                    return Ok(ApplyOutcome::ManualPin);
                }
            }
        }

        let updated_at = Utc::now().timestamp_millis();
        let mut new_entry = match sessions.remove(session_key) {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        target.write_into(&mut new_entry, updated_at);
        sessions.insert(session_key.to_string(), Value::Object(new_entry));
        self.store.write(&sessions)?;

        self.engine.record_applied(session_key, &target.model);
        self.last_seen
            .insert(session_key.to_string(), Some(updated_at));

        linfo!(
            session_key,
            LogStage::BackgroundTask,
            LogComponent::OverrideSync,
            "applied",
            "已同步模型覆盖",
            model = target.model,
            provider = target.provider.as_deref().unwrap_or("-")
        );

        Ok(ApplyOutcome::Applied {
            model: target.model,
            updated_at,
        })
    }

    /// 重新扫描存储文件，对 `updatedAt` 与最后所见不一致的会话重新应用覆盖
    ///
    /// 返回重新应用的会话数量。
    pub fn rescan(&self) -> Result<usize> {
        if self.store.is_writing() {
            return Ok(0);
        }
        self.prune_forgotten();
        let sessions = self.store.read()?;
        let mut reapplied = 0;

        for key in self.engine.known_sessions() {
            let current = sessions.get(&key).and_then(entry_updated_at);
            let stale = self
                .last_seen
                .get(&key)
                .is_none_or(|seen| *seen != current);
            if !stale {
                continue;
            }
            if self.apply_override_outcome(&key)?.applied_model().is_some() {
                reapplied += 1;
            }
        }

        if reapplied > 0 {
            linfo!(
                "-",
                LogStage::BackgroundTask,
                LogComponent::OverrideSync,
                "rescan",
                "会话存储外部变更后重新同步",
                reapplied = reapplied
            );
        }
        Ok(reapplied)
    }

    /// 清理轮换状态已被淘汰的会话的最后所见记录，返回清理数量
    pub fn prune_forgotten(&self) -> usize {
        let known: HashSet<String> = self.engine.known_sessions().into_iter().collect();
        let before = self.last_seen.len();
        self.last_seen.retain(|key, _| known.contains(key));
        before.saturating_sub(self.last_seen.len())
    }

    /// 正在跟踪最后所见时间的会话数量
    #[must_use]
    pub fn tracked_sessions(&self) -> usize {
        self.last_seen.len()
    }
}
