//! # 轮换模型列表解析
//!
//! 优先级：JSON 配置文件 > 环境变量 > 内置默认列表

use serde::Deserialize;
use std::path::Path;

use crate::logging::{LogComponent, LogStage};
use crate::{ldebug, lwarn};

/// 内置默认模型列表
pub const DEFAULT_MODELS: [&str; 5] = [
    "openrouter/qwen/qwen3-coder-plus",
    "openrouter/moonshotai/kimi-k2.5",
    "openrouter/google/gemini-2.5-flash",
    "openrouter/anthropic/claude-haiku-4.5",
    "openrouter/openai/gpt-5.2-codex",
];

/// 模型列表来源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelSource {
    File,
    Env,
    Defaults,
    /// `ROUND_ROBIN_MODELS=off`
    Disabled,
}

impl ModelSource {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Env => "env",
            Self::Defaults => "defaults",
            Self::Disabled => "disabled",
        }
    }
}

/// 解析后的模型列表
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedModels {
    pub models: Vec<String>,
    pub source: ModelSource,
}

#[derive(Debug, Deserialize)]
struct ModelsFile {
    #[serde(default)]
    models: Vec<serde_json::Value>,
}

/// 从 JSON 文件加载模型列表，文件缺失或无效时返回 `None`
#[must_use]
pub fn load_models_from_file(path: &Path) -> Option<Vec<String>> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) => {
            ldebug!(
                "system",
                LogStage::Configuration,
                LogComponent::Config,
                "models_file_unavailable",
                "轮换模型文件不可读",
                path = path.display(),
                error = e
            );
            return None;
        }
    };

    let parsed: ModelsFile = match serde_json::from_str(&raw) {
        Ok(parsed) => parsed,
        Err(e) => {
            lwarn!(
                "system",
                LogStage::Configuration,
                LogComponent::Config,
                "models_file_invalid",
                "轮换模型文件不是有效 JSON，忽略",
                path = path.display(),
                error = e
            );
            return None;
        }
    };

    let models: Vec<String> = parsed
        .models
        .iter()
        .filter_map(serde_json::Value::as_str)
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(ToString::to_string)
        .collect();

    if models.is_empty() { None } else { Some(models) }
}

/// 解析逗号分隔的模型列表
#[must_use]
pub fn parse_models_env(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(ToString::to_string)
        .collect()
}

/// 按优先级解析模型列表
#[must_use]
pub fn resolve_models(env_value: Option<&str>, config_path: &Path) -> ResolvedModels {
    if env_value.is_some_and(|v| v.trim().eq_ignore_ascii_case("off")) {
        return ResolvedModels {
            models: Vec::new(),
            source: ModelSource::Disabled,
        };
    }

    if let Some(models) = load_models_from_file(config_path) {
        return ResolvedModels {
            models,
            source: ModelSource::File,
        };
    }

    if let Some(raw) = env_value {
        let models = parse_models_env(raw);
        if !models.is_empty() {
            return ResolvedModels {
                models,
                source: ModelSource::Env,
            };
        }
    }

    ResolvedModels {
        models: DEFAULT_MODELS.iter().map(ToString::to_string).collect(),
        source: ModelSource::Defaults,
    }
}
