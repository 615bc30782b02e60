//! # 模型轮换模块
//!
//! 命令解析、每会话轮换状态与轮换引擎

pub mod commands;
pub mod engine;
pub mod store;

pub use commands::{RotationCommand, detect_command, strip_resume_command};
pub use engine::{
    ChatTransform, DEFAULT_ROTATION_KEY, PROMPT_POSTFIX, RotationEngine, TURNS_PER_MODEL,
};
pub use store::{MemoryRotationStore, RotationState, RotationStore};
