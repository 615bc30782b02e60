//! # WebSocket 流量观察
//!
//! 升级后的连接由代理原样双向转发，这里只是把两个方向的字节副本喂给帧解码器：
//! 客户端的 `chat.send` 驱动轮换，服务端的最终聊天事件记录日志。
//! 解码出错后本连接停止观察，转发不受影响。

use bytes::BytesMut;

use super::frame::decode_frames;
use super::message::GatewayMessage;
use crate::logging::{LogComponent, LogStage};
use crate::rotation::{DEFAULT_ROTATION_KEY, RotationEngine};
use crate::{ldebug, linfo, lwarn};

/// 数据方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

impl Direction {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ClientToServer => "client",
            Self::ServerToClient => "server",
        }
    }
}

/// 观察到的事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObservedEvent {
    /// 客户端发起了一轮聊天，`model` 为轮换选中的模型
    ChatSend {
        session_key: String,
        model: Option<String>,
    },
    /// 服务端完成了一轮回复
    ChatFinal { session_key: Option<String> },
}

/// 单个连接的观察器
#[derive(Debug)]
pub struct WsObserver {
    request_id: String,
    session_key: Option<String>,
    engine: Option<RotationEngine>,
    client_buf: BytesMut,
    server_buf: BytesMut,
    disabled: bool,
    frames: u64,
    bytes: u64,
}

impl WsObserver {
    #[must_use]
    pub fn new(
        request_id: impl Into<String>,
        session_key: Option<String>,
        engine: Option<RotationEngine>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            session_key,
            engine,
            client_buf: BytesMut::new(),
            server_buf: BytesMut::new(),
            disabled: false,
            frames: 0,
            bytes: 0,
        }
    }

    #[must_use]
    pub const fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// 已解码的完整帧数
    #[must_use]
    pub const fn frames_seen(&self) -> u64 {
        self.frames
    }

    /// 已解码帧占用的线上字节数
    #[must_use]
    pub const fn bytes_seen(&self) -> u64 {
        self.bytes
    }

    /// 喂入一个方向上的数据块副本
    pub fn observe(&mut self, direction: Direction, chunk: &[u8]) -> Vec<ObservedEvent> {
        if self.disabled || chunk.is_empty() {
            return Vec::new();
        }

        let buffer = match direction {
            Direction::ClientToServer => &mut self.client_buf,
            Direction::ServerToClient => &mut self.server_buf,
        };
        buffer.extend_from_slice(chunk);

        let frames = match decode_frames(buffer) {
            Ok(frames) => frames,
            Err(e) => {
                lwarn!(
                    self.request_id,
                    LogStage::Internal,
                    LogComponent::WebSocket,
                    "decode_failed",
                    "帧解码失败，停止观察该连接",
                    direction = direction.as_str(),
                    error = e
                );
                self.disabled = true;
                self.client_buf.clear();
                self.server_buf.clear();
                return Vec::new();
            }
        };

        let mut events = Vec::new();
        for frame in frames {
            self.frames += 1;
            self.bytes += frame.wire_len as u64;
            let Some(message) = frame.text_message().and_then(GatewayMessage::parse) else {
                continue;
            };
            if let Some(event) = self.handle_message(direction, &message) {
                events.push(event);
            }
        }
        events
    }

    fn handle_message(&self, direction: Direction, message: &GatewayMessage) -> Option<ObservedEvent> {
        match direction {
            Direction::ClientToServer => {
                let send = message.as_chat_send()?;
                let session_key = send
                    .session_key
                    .or_else(|| self.session_key.clone())
                    .unwrap_or_else(|| DEFAULT_ROTATION_KEY.to_string());
                let model = self
                    .engine
                    .as_ref()
                    .and_then(|engine| engine.observe_chat_turn(&session_key, &send.message));
                ldebug!(
                    self.request_id,
                    LogStage::RequestModify,
                    LogComponent::WebSocket,
                    "chat_send",
                    "观察到 chat.send",
                    session_key = session_key,
                    model = model.as_deref().unwrap_or("-")
                );
                Some(ObservedEvent::ChatSend { session_key, model })
            }
            Direction::ServerToClient => {
                let event = message.as_chat_event()?;
                if !event.is_final() {
                    return None;
                }
                linfo!(
                    self.request_id,
                    LogStage::Response,
                    LogComponent::WebSocket,
                    "chat_final",
                    "聊天回复完成",
                    session_key = event.session_key.as_deref().unwrap_or("-")
                );
                Some(ObservedEvent::ChatFinal {
                    session_key: event.session_key,
                })
            }
        }
    }
}
