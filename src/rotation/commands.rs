//! # 聊天命令解析
//!
//! 只检查对话记录中最后一条用户消息：`/round-robin` 恢复轮换，`/model` 表示显式指定模型。

use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

static ROUND_ROBIN_CMD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)/round-robin\b").unwrap_or_else(|e| panic!("invalid round-robin pattern: {e}"))
});
static MODEL_CMD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)/model\b").unwrap_or_else(|e| panic!("invalid model pattern: {e}"))
});
static BLANK_LINES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\n{2,}").unwrap_or_else(|e| panic!("invalid blank-line pattern: {e}"))
});

/// 轮换命令
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationCommand {
    /// `/round-robin`
    ResumeRotation,
    /// `/model`
    ExplicitModel,
}

/// 识别文本中的命令，`/round-robin` 优先
#[must_use]
pub fn detect_command(text: &str) -> Option<RotationCommand> {
    if ROUND_ROBIN_CMD.is_match(text) {
        Some(RotationCommand::ResumeRotation)
    } else if MODEL_CMD.is_match(text) {
        Some(RotationCommand::ExplicitModel)
    } else {
        None
    }
}

/// 去掉 `/round-robin` 命令并合并空行；结果为空时返回单个空格（部分后端拒绝空消息）
#[must_use]
pub fn strip_resume_command(text: &str) -> String {
    let without_cmd = ROUND_ROBIN_CMD.replace(text, "");
    let collapsed = BLANK_LINES.replace_all(&without_cmd, "\n");
    let trimmed = collapsed.trim();
    if trimmed.is_empty() {
        " ".to_string()
    } else {
        trimmed.to_string()
    }
}

/// 消息文本：字符串内容，或数组内容中所有 `text` 片段的拼接
#[must_use]
pub fn message_text(message: &Value) -> String {
    match message.get("content") {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter(|p| p.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect(),
        _ => String::new(),
    }
}

/// 最后一条用户消息的下标
#[must_use]
pub fn last_user_message_index(messages: &[Value]) -> Option<usize> {
    messages
        .iter()
        .rposition(|m| m.get("role").and_then(Value::as_str) == Some("user"))
}

/// 请求体中最后一条用户消息的文本，没有时为空串
#[must_use]
pub fn last_user_text(body: &Value) -> String {
    body.get("messages")
        .and_then(Value::as_array)
        .and_then(|messages| {
            last_user_message_index(messages).map(|idx| message_text(&messages[idx]))
        })
        .unwrap_or_default()
}

/// 检查请求体中最后一条用户消息的命令；`/round-robin` 会从消息中去除
pub fn extract_command(body: &mut Value) -> Option<RotationCommand> {
    let messages = body.get_mut("messages")?.as_array_mut()?;
    let idx = last_user_message_index(messages)?;
    let text = message_text(&messages[idx]);
    let command = detect_command(&text)?;

    if command == RotationCommand::ResumeRotation {
        if let Some(obj) = messages[idx].as_object_mut() {
            obj.insert(
                "content".to_string(),
                Value::String(strip_resume_command(&text)),
            );
        }
    }
    Some(command)
}
