//! # 路由决策日志
//!
//! 每个聊天补全请求追加一行 JSON 到 `router-decisions-YYYY-MM-DD.jsonl`（UTC 日期），
//! 供离线分析模型选择、工具闸门与延迟。写入失败只记日志，不影响请求。

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

use crate::error::{Context, Result};
use crate::gate::ToolGateOutcome;
use crate::logging::{LogComponent, LogStage};
use crate::lwarn;
use crate::rotation::ChatTransform;

/// 决策记录的事件名
pub const CHAT_COMPLETION_EVENT: &str = "chat_completion";

/// 任务类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Debugging,
    Coding,
    Research,
    Writing,
    Chat,
}

const DEBUGGING_KEYWORDS: [&str; 8] = [
    "error", "bug", "debug", "stack trace", "traceback", "exception", "crash", "fix",
];
const CODING_KEYWORDS: [&str; 9] = [
    "code", "function", "implement", "refactor", "compile", "script", "class ", "```", "api",
];
const RESEARCH_KEYWORDS: [&str; 7] = [
    "research", "search", "find", "compare", "sources", "look up", "investigate",
];
const WRITING_KEYWORDS: [&str; 7] = [
    "write", "draft", "essay", "email", "article", "poem", "rewrite",
];

/// 按关键字对最后一条用户消息分类，依次匹配 debugging、coding、research、writing
#[must_use]
pub fn classify_task(text: &str) -> TaskType {
    let lower = text.to_lowercase();
    let hit = |keywords: &[&str]| keywords.iter().any(|k| lower.contains(k));
    if hit(&DEBUGGING_KEYWORDS) {
        TaskType::Debugging
    } else if hit(&CODING_KEYWORDS) {
        TaskType::Coding
    } else if hit(&RESEARCH_KEYWORDS) {
        TaskType::Research
    } else if hit(&WRITING_KEYWORDS) {
        TaskType::Writing
    } else {
        TaskType::Chat
    }
}

/// 按 4 字符一个 token 粗略估算
#[must_use]
pub const fn estimate_tokens(chars: usize) -> usize {
    chars.div_ceil(4)
}

/// 模型来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelSource {
    RoundRobin,
    Request,
    Escalation,
}

/// 一条决策记录
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionRecord {
    pub ts: DateTime<Utc>,
    pub event: &'static str,
    pub session_key: Option<String>,
    pub stream: bool,
    pub task_type: TaskType,
    pub message_chars: usize,
    pub estimated_tokens: usize,
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub requested_model: Option<String>,
    pub selected_model: Option<String>,
    pub final_model: Option<String>,
    pub model_source: ModelSource,
    pub tool_gate_active: bool,
    pub tool_gate_retry_count: u32,
    pub tool_gate_escalated: bool,
    pub tool_gate_escalate_model: Option<String>,
    /// 闸门未生效时为 `null`
    pub tool_gate_had_valid_tool_calls: Option<bool>,
    pub status: u16,
    pub response_time_ms: u64,
}

impl DecisionRecord {
    /// 空记录，模型与闸门字段待填
    #[must_use]
    pub fn new(session_key: Option<&str>) -> Self {
        Self {
            ts: Utc::now(),
            event: CHAT_COMPLETION_EVENT,
            session_key: session_key.map(ToString::to_string),
            stream: false,
            task_type: TaskType::Chat,
            message_chars: 0,
            estimated_tokens: 0,
            prompt_tokens: None,
            completion_tokens: None,
            requested_model: None,
            selected_model: None,
            final_model: None,
            model_source: ModelSource::Request,
            tool_gate_active: false,
            tool_gate_retry_count: 0,
            tool_gate_escalated: false,
            tool_gate_escalate_model: None,
            tool_gate_had_valid_tool_calls: None,
            status: 0,
            response_time_ms: 0,
        }
    }

    /// 根据轮换变换结果开始一条记录
    ///
    /// 分类与字数只看用户原本的消息，不含追加的提示。
    #[must_use]
    pub fn from_transform(session_key: Option<&str>, transform: &ChatTransform) -> Self {
        let mut record = Self::new(session_key);
        record.stream = transform
            .json
            .as_ref()
            .and_then(|b| b.get("stream"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        record.task_type = classify_task(&transform.prompt_text);
        record.message_chars = transform.prompt_text.chars().count();
        record.estimated_tokens = estimate_tokens(record.message_chars);
        record.requested_model.clone_from(&transform.requested_model);
        record.selected_model.clone_from(&transform.selected_model);
        record.final_model = transform.effective_model().map(ToString::to_string);
        if transform.selected_model.is_some() {
            record.model_source = ModelSource::RoundRobin;
        }
        record
    }

    /// 闸门结果
    pub fn with_gate(&mut self, outcome: &ToolGateOutcome, final_model: Option<String>) {
        self.tool_gate_active = outcome.active;
        self.tool_gate_retry_count = outcome.retry_count;
        self.tool_gate_escalated = outcome.escalated;
        self.tool_gate_escalate_model.clone_from(&outcome.escalate_model);
        self.tool_gate_had_valid_tool_calls = outcome.had_valid_tool_calls;
        if outcome.escalated && final_model.is_some() && final_model == outcome.escalate_model {
            self.model_source = ModelSource::Escalation;
        }
        if final_model.is_some() {
            self.final_model = final_model;
        }
    }

    /// 回复中的 `usage`
    pub fn with_usage(&mut self, reply: &Value) {
        self.prompt_tokens = reply.pointer("/usage/prompt_tokens").and_then(Value::as_u64);
        self.completion_tokens = reply
            .pointer("/usage/completion_tokens")
            .and_then(Value::as_u64);
    }

    pub fn finish(&mut self, status: u16, elapsed_ms: u64) {
        self.status = status;
        self.response_time_ms = elapsed_ms;
    }
}

/// JSONL 决策日志
#[derive(Debug, Clone)]
pub struct DecisionLog {
    dir: PathBuf,
    enabled: bool,
}

impl DecisionLog {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, enabled: bool) -> Self {
        Self {
            dir: dir.into(),
            enabled,
        }
    }

    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            dir: PathBuf::new(),
            enabled: false,
        }
    }

    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// 某天的日志文件
    #[must_use]
    pub fn file_for(&self, ts: DateTime<Utc>) -> PathBuf {
        self.dir
            .join(format!("router-decisions-{}.jsonl", ts.format("%Y-%m-%d")))
    }

    /// 追加一条记录
    pub async fn append(&self, record: &DecisionRecord) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("创建决策日志目录失败: {}", self.dir.display()))?;

        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let path = self.file_for(record.ts);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("打开决策日志失败: {}", path.display()))?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    /// 追加记录，失败时只记录告警
    pub async fn record(&self, request_id: &str, record: &DecisionRecord) {
        if let Err(e) = self.append(record).await {
            lwarn!(
                request_id,
                LogStage::Response,
                LogComponent::DecisionLog,
                "append_failed",
                "写入决策日志失败",
                error = e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rotation::{MemoryRotationStore, PROMPT_POSTFIX, RotationEngine};
    use rstest::rstest;
    use serde_json::json;
    use std::sync::Arc;

    #[rstest]
    #[case("I get a stack trace when I run it", TaskType::Debugging)]
    #[case("Please implement a function that sorts", TaskType::Coding)]
    #[case("Compare these two laptops", TaskType::Research)]
    #[case("Draft an email to my landlord", TaskType::Writing)]
    #[case("hello there", TaskType::Chat)]
    fn test_classify_task(#[case] text: &str, #[case] expected: TaskType) {
        assert_eq!(classify_task(text), expected);
    }

    #[test]
    fn test_estimate_tokens_rounds_up() {
        assert_eq!(estimate_tokens(0), 0);
        assert_eq!(estimate_tokens(1), 1);
        assert_eq!(estimate_tokens(8), 2);
        assert_eq!(estimate_tokens(9), 3);
    }

    fn rotated(text: &str, stream: bool) -> ChatTransform {
        let engine = RotationEngine::new(
            vec!["a/b/c".to_string()],
            Arc::new(MemoryRotationStore::new()),
        );
        let body = json!({
            "model": "client/model",
            "stream": stream,
            "messages": [{"role": "user", "content": text}]
        });
        engine.transform_chat_body("proxy:1", &serde_json::to_vec(&body).unwrap())
    }

    #[test]
    fn test_record_fields_are_camel_case() {
        let mut record = DecisionRecord::from_transform(Some("proxy:1"), &rotated("hello there", true));
        record.finish(200, 12);

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["event"], "chat_completion");
        assert_eq!(value["sessionKey"], "proxy:1");
        assert_eq!(value["stream"], true);
        assert_eq!(value["taskType"], "chat");
        assert_eq!(value["messageChars"], 11);
        assert_eq!(value["estimatedTokens"], 3);
        assert_eq!(value["selectedModel"], "a/b/c");
        assert_eq!(value["finalModel"], "a/b/c");
        assert_eq!(value["modelSource"], "round_robin");
        assert_eq!(value["requestedModel"], "client/model");
        assert_eq!(value["toolGateActive"], false);
        assert_eq!(value["toolGateHadValidToolCalls"], Value::Null);
        assert_eq!(value["responseTimeMs"], 12);
    }

    #[test]
    fn test_appended_prompt_does_not_skew_classification() {
        let transform = rotated("hello there", false);
        assert!(transform.json.as_ref().unwrap()["messages"][0]["content"]
            .as_str()
            .unwrap()
            .ends_with(PROMPT_POSTFIX));

        let record = DecisionRecord::from_transform(None, &transform);
        assert_eq!(record.task_type, TaskType::Chat);
        assert_eq!(record.message_chars, 11);
        assert_eq!(record.estimated_tokens, 3);
    }

    #[test]
    fn test_escalation_marks_source() {
        let mut record = DecisionRecord::new(None);
        let outcome = ToolGateOutcome {
            active: true,
            retry_count: 1,
            escalated: true,
            escalate_model: Some("big/model".to_string()),
            had_valid_tool_calls: Some(true),
        };
        record.with_gate(&outcome, Some("big/model".to_string()));
        assert_eq!(record.model_source, ModelSource::Escalation);
        assert_eq!(record.tool_gate_had_valid_tool_calls, Some(true));
        assert_eq!(record.final_model.as_deref(), Some("big/model"));
    }

    #[tokio::test]
    async fn test_append_writes_dated_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let log = DecisionLog::new(dir.path().join("logs"), true);
        let record = DecisionRecord::new(Some("s1"));

        log.append(&record).await.unwrap();
        log.append(&record).await.unwrap();

        let content = std::fs::read_to_string(log.file_for(record.ts)).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed["sessionKey"], "s1");
    }

    #[tokio::test]
    async fn test_disabled_log_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let log = DecisionLog::new(dir.path().join("logs"), false);
        log.append(&DecisionRecord::new(None))
            .await
            .unwrap();
        assert!(!dir.path().join("logs").exists());
    }
}
