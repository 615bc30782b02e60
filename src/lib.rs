//! # Session Proxy
//!
//! 聊天网关前的会话作用域反向代理：为浏览器标签页分配独立会话，
//! 按会话轮换模型，并对工具调用回复做校验重试。

pub mod app;
pub mod config;
pub mod error;
pub mod gate;
pub mod logging;
pub mod observe;
pub mod proxy;
pub mod rotation;
pub mod session;
pub mod sync;
pub mod ws;

// Re-export commonly used types
pub use config::ProxyConfig;
pub use error::{ProxyError, Result};
