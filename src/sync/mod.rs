//! # 模型覆盖同步模块
//!
//! 把轮换选出的模型持久化到网关会话存储，并在存储被外部修改时重新同步

pub mod override_sync;
pub mod store_file;
pub mod watcher;

pub use override_sync::{ApplyOutcome, OverrideSync};
pub use store_file::{ModelOverride, SessionStoreFile};
pub use watcher::{OverrideSyncWorker, watch_store_file};
