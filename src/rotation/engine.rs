//! # 模型轮换引擎
//!
//! 每个会话键独立轮换：同一模型连续使用 `TURNS_PER_MODEL` 轮后切换到下一个。
//! `/model` 关闭轮换，`/round-robin` 重新开启。
//!
//! 状态变更会把会话键推送到通知通道，由覆盖同步任务异步消费。

use bytes::Bytes;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::commands::{
    RotationCommand, detect_command, extract_command, last_user_message_index, last_user_text,
};
use super::store::{RotationState, RotationStore};
use crate::logging::{LogComponent, LogStage};
use crate::{ldebug, linfo};

/// 每个模型连续使用的轮次
pub const TURNS_PER_MODEL: u32 = 2;

/// 追加到最后一条用户消息的固定提示
pub const PROMPT_POSTFIX: &str = "\n\nDon't make assumptions. Always take into consideration what you already know. Don't fix code that is not broken.";

/// 没有会话键的请求共用的轮换键
pub const DEFAULT_ROTATION_KEY: &str = "default";

/// 状态推进：返回本轮选用的下标
///
/// `index` 总是对 `len` 取模，保证即便模型列表变短也不会越界。
#[must_use]
pub fn advance(state: &mut RotationState, len: usize) -> usize {
    if len == 0 {
        return 0;
    }
    let selected = state.index % len;
    if state.turns_used + 1 >= TURNS_PER_MODEL {
        state.index = (selected + 1) % len;
        state.turns_used = 0;
    } else {
        state.index = selected;
        state.turns_used += 1;
    }
    selected
}

/// 聊天请求体变换结果
#[derive(Debug, Clone)]
pub struct ChatTransform {
    /// 转发给后端的请求体
    pub body: Bytes,
    /// 变换后的 JSON（请求体无法解析时为 `None`）
    pub json: Option<Value>,
    /// 客户端原本请求的模型
    pub requested_model: Option<String>,
    /// 轮换选中的模型
    pub selected_model: Option<String>,
    /// 识别到的命令
    pub command: Option<RotationCommand>,
    /// 最后一条用户消息，去除命令之后、追加提示之前
    pub prompt_text: String,
}

impl ChatTransform {
    fn passthrough(raw: &[u8]) -> Self {
        let json: Option<Value> = serde_json::from_slice(raw).ok();
        Self {
            body: Bytes::copy_from_slice(raw),
            requested_model: json
                .as_ref()
                .and_then(|v| v.get("model"))
                .and_then(Value::as_str)
                .map(ToString::to_string),
            prompt_text: json.as_ref().map(last_user_text).unwrap_or_default(),
            json,
            selected_model: None,
            command: None,
        }
    }

    /// 实际发送的模型
    #[must_use]
    pub fn effective_model(&self) -> Option<&str> {
        self.selected_model
            .as_deref()
            .or(self.requested_model.as_deref())
    }
}

/// 模型轮换引擎
#[derive(Clone)]
pub struct RotationEngine {
    models: Arc<[String]>,
    store: Arc<dyn RotationStore>,
    changes: Option<mpsc::UnboundedSender<String>>,
}

impl std::fmt::Debug for RotationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RotationEngine")
            .field("models", &self.models)
            .field("notifier", &self.changes.is_some())
            .finish_non_exhaustive()
    }
}

impl RotationEngine {
    #[must_use]
    pub fn new(models: Vec<String>, store: Arc<dyn RotationStore>) -> Self {
        Self {
            models: models.into(),
            store,
            changes: None,
        }
    }

    /// 状态变更时把会话键发送到 `tx`
    #[must_use]
    pub fn with_change_notifier(mut self, tx: mpsc::UnboundedSender<String>) -> Self {
        self.changes = Some(tx);
        self
    }

    #[must_use]
    pub fn models(&self) -> &[String] {
        &self.models
    }

    /// 模型列表为空时整体关闭
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.models.is_empty()
    }

    /// 读取状态，不存在时返回默认值（不写入）
    #[must_use]
    pub fn state(&self, key: &str) -> RotationState {
        self.store.get(key).unwrap_or_default()
    }

    /// 所有已知会话键
    #[must_use]
    pub fn known_sessions(&self) -> Vec<String> {
        self.store.keys()
    }

    /// 下一轮将使用的模型；轮换关闭时为 `None`
    #[must_use]
    pub fn current_model(&self, key: &str) -> Option<String> {
        if !self.is_active() {
            return None;
        }
        let state = self.state(key);
        state
            .round_robin_enabled
            .then(|| self.models[state.index % self.models.len()].clone())
    }

    /// 确保会话存在状态，新建时发出通知
    pub fn ensure_session(&self, key: &str) -> RotationState {
        if let Some(state) = self.store.get(key) {
            return state;
        }
        let state = RotationState::default();
        self.store.set(key, state.clone());
        self.notify(key);
        state
    }

    /// 开关轮换，返回状态是否改变
    pub fn set_enabled(&self, key: &str, enabled: bool) -> bool {
        let existed = self.store.get(key).is_some();
        let mut changed = !existed;
        self.store.update(key, &mut |state| {
            if state.round_robin_enabled != enabled {
                state.round_robin_enabled = enabled;
                changed = true;
            }
        });
        if !changed {
            return false;
        }
        linfo!(
            key,
            LogStage::RequestModify,
            LogComponent::Rotation,
            "toggle",
            if enabled { "轮换已开启" } else { "轮换已关闭" }
        );
        self.notify(key);
        true
    }

    /// 轮换开启时选出本轮模型并推进状态
    pub fn select_and_advance(&self, key: &str) -> Option<String> {
        if !self.is_active() {
            return None;
        }
        let len = self.models.len();
        let mut selected = None;
        let state = self.store.update(key, &mut |state| {
            if state.round_robin_enabled {
                selected = Some(advance(state, len));
            }
        });
        let model = self.models[selected?].clone();
        ldebug!(
            key,
            LogStage::RequestModify,
            LogComponent::Rotation,
            "advance",
            "选中轮换模型",
            model = model,
            next_index = state.index,
            turns_used = state.turns_used
        );
        self.notify(key);
        Some(model)
    }

    /// 记录已写入会话存储的覆盖值，不触发通知
    pub fn record_applied(&self, key: &str, model: &str) {
        self.store.update(key, &mut |state| {
            state.last_applied_model = Some(model.to_string());
        });
    }

    /// 应用命令引起的状态切换
    fn apply_command(&self, key: &str, command: Option<RotationCommand>) {
        match command {
            Some(RotationCommand::ResumeRotation) => {
                self.set_enabled(key, true);
            }
            Some(RotationCommand::ExplicitModel) => {
                self.set_enabled(key, false);
            }
            None => {}
        }
    }

    /// 变换聊天补全请求体
    ///
    /// 模型列表为空或请求体不是 JSON 对象时原样返回。
    pub fn transform_chat_body(&self, key: &str, raw: &[u8]) -> ChatTransform {
        if !self.is_active() {
            return ChatTransform::passthrough(raw);
        }
        let Ok(mut body) = serde_json::from_slice::<Value>(raw) else {
            return ChatTransform::passthrough(raw);
        };
        if !body.is_object() {
            return ChatTransform::passthrough(raw);
        }

        let requested_model = body
            .get("model")
            .and_then(Value::as_str)
            .map(ToString::to_string);

        let command = extract_command(&mut body);
        self.apply_command(key, command);
        let prompt_text = last_user_text(&body);

        let selected_model = self.select_and_advance(key);
        append_postfix(&mut body);

        if let (Some(model), Some(obj)) = (&selected_model, body.as_object_mut()) {
            obj.insert("model".to_string(), Value::String(model.clone()));
        }

        let encoded = match serde_json::to_vec(&body) {
            Ok(encoded) => Bytes::from(encoded),
            Err(_) => return ChatTransform::passthrough(raw),
        };

        ChatTransform {
            body: encoded,
            json: Some(body),
            requested_model,
            selected_model,
            command,
            prompt_text,
        }
    }

    /// WebSocket 上观察到的一次 `chat.send`：处理命令并推进轮换
    ///
    /// 线上字节不可修改，因此命令不会被去除。
    pub fn observe_chat_turn(&self, key: &str, text: &str) -> Option<String> {
        if !self.is_active() {
            return None;
        }
        self.ensure_session(key);
        self.apply_command(key, detect_command(text));
        self.select_and_advance(key)
    }

    /// 淘汰空闲会话
    pub fn evict_idle(&self) -> usize {
        self.store.evict_idle()
    }

    /// 共用键不对应网关中的任何会话，不通知
    fn notify(&self, key: &str) {
        if key == DEFAULT_ROTATION_KEY {
            return;
        }
        if let Some(tx) = &self.changes {
            // 接收端关闭说明同步任务已退出，忽略即可
            let _ = tx.send(key.to_string());
        }
    }
}

/// 在最后一条用户消息末尾追加固定提示
fn append_postfix(body: &mut Value) {
    let Some(messages) = body.get_mut("messages").and_then(Value::as_array_mut) else {
        return;
    };
    let Some(idx) = last_user_message_index(messages) else {
        return;
    };
    match messages[idx].get_mut("content") {
        Some(Value::String(text)) => text.push_str(PROMPT_POSTFIX),
        Some(Value::Array(parts)) => parts.push(serde_json::json!({
            "type": "text",
            "text": PROMPT_POSTFIX,
        })),
        _ => {}
    }
}
