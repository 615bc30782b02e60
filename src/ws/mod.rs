//! # WebSocket 模块
//!
//! 帧编解码、网关消息解析与连接级流量观察

pub mod frame;
pub mod message;
pub mod observer;

pub use frame::{Frame, FrameCodec, MAX_FRAME_PAYLOAD, OpCode, apply_mask, decode_frames};
pub use message::{ChatEvent, ChatSend, GatewayMessage};
pub use observer::{Direction, ObservedEvent, WsObserver};
