//! # Pingora 代理服务模块
//!
//! 会话作用域的反向代理：会话解析、聊天补全接管、HTML 改写与 WebSocket 观察

pub mod chat;
pub mod context;
pub mod response;
pub mod server;
pub mod service;
pub mod state;
pub mod upstream;

pub use chat::ChatPlan;
pub use context::ProxyContext;
pub use server::PingoraProxyServer;
pub use service::ProxyService;
pub use state::ProxyState;
pub use upstream::GatewayTarget;
