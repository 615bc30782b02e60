//! # WebSocket 帧编解码
//!
//! 只用于旁路观察：解码得到的是线上字节的副本，转发的原始字节不做任何修改。
//! 不完整的帧留在缓冲区中，等待下一个数据块。

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

/// 单帧声明的负载上限
pub const MAX_FRAME_PAYLOAD: u64 = 16 * 1024 * 1024;

/// 帧操作码
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
    Reserved(u8),
}

impl OpCode {
    #[must_use]
    pub const fn from_u8(value: u8) -> Self {
        match value {
            0x0 => Self::Continuation,
            0x1 => Self::Text,
            0x2 => Self::Binary,
            0x8 => Self::Close,
            0x9 => Self::Ping,
            0xA => Self::Pong,
            other => Self::Reserved(other),
        }
    }

    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Continuation => 0x0,
            Self::Text => 0x1,
            Self::Binary => 0x2,
            Self::Close => 0x8,
            Self::Ping => 0x9,
            Self::Pong => 0xA,
            Self::Reserved(other) => other & 0x0F,
        }
    }
}

/// 解析后的帧
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: OpCode,
    /// 客户端帧的掩码键
    pub mask: Option<[u8; 4]>,
    /// 已去掩码的负载
    pub payload: Bytes,
    /// 该帧在线上占用的总字节数（头部 + 负载）
    pub wire_len: usize,
}

impl Frame {
    /// 构造一个文本帧
    #[must_use]
    pub fn text(payload: impl Into<Bytes>, mask: Option<[u8; 4]>) -> Self {
        let payload = payload.into();
        Self {
            fin: true,
            opcode: OpCode::Text,
            mask,
            wire_len: header_len(payload.len() as u64, mask.is_some()) + payload.len(),
            payload,
        }
    }

    /// 构造任意帧
    #[must_use]
    pub fn new(fin: bool, opcode: OpCode, payload: impl Into<Bytes>, mask: Option<[u8; 4]>) -> Self {
        let payload = payload.into();
        Self {
            fin,
            opcode,
            mask,
            wire_len: header_len(payload.len() as u64, mask.is_some()) + payload.len(),
            payload,
        }
    }

    #[must_use]
    pub const fn masked(&self) -> bool {
        self.mask.is_some()
    }

    /// 完整的文本帧才被当作逻辑消息
    #[must_use]
    pub fn text_message(&self) -> Option<&str> {
        if self.fin && self.opcode == OpCode::Text {
            std::str::from_utf8(&self.payload).ok()
        } else {
            None
        }
    }
}

/// 用 4 字节滚动异或键处理负载（掩码/去掩码是同一操作）
pub fn apply_mask(payload: &mut [u8], key: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

const fn header_len(payload_len: u64, masked: bool) -> usize {
    let base = if payload_len < 126 {
        2
    } else if payload_len <= 0xFFFF {
        4
    } else {
        10
    };
    if masked { base + 4 } else { base }
}

/// 帧头信息，`None` 表示缓冲区中的字节还不足以读出完整帧头
#[derive(Debug, Clone, Copy)]
struct FrameHeader {
    fin: bool,
    opcode: OpCode,
    mask: Option<[u8; 4]>,
    header_len: usize,
    payload_len: u64,
}

impl FrameHeader {
    fn parse(src: &[u8]) -> Option<Self> {
        if src.len() < 2 {
            return None;
        }
        let fin = src[0] & 0x80 != 0;
        let opcode = OpCode::from_u8(src[0] & 0x0F);
        let masked = src[1] & 0x80 != 0;
        let len7 = src[1] & 0x7F;

        let (payload_len, mut offset) = match len7 {
            126 => {
                if src.len() < 4 {
                    return None;
                }
                (u64::from(u16::from_be_bytes([src[2], src[3]])), 4)
            }
            127 => {
                if src.len() < 10 {
                    return None;
                }
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&src[2..10]);
                (u64::from_be_bytes(raw), 10)
            }
            n => (u64::from(n), 2),
        };

        let mask = if masked {
            if src.len() < offset + 4 {
                return None;
            }
            let key = [src[offset], src[offset + 1], src[offset + 2], src[offset + 3]];
            offset += 4;
            Some(key)
        } else {
            None
        };

        Some(Self {
            fin,
            opcode,
            mask,
            header_len: offset,
            payload_len,
        })
    }
}

/// WebSocket 帧编解码器
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl FrameCodec {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Frame>> {
        let Some(header) = FrameHeader::parse(src) else {
            return Ok(None);
        };

        if header.payload_len > MAX_FRAME_PAYLOAD {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame payload too large: {} bytes", header.payload_len),
            ));
        }

        // 上面已限制长度，转换不会截断
        let payload_len = usize::try_from(header.payload_len)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let total = header.header_len + payload_len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let mut raw = src.split_to(total);
        raw.advance(header.header_len);
        if let Some(key) = header.mask {
            apply_mask(&mut raw, key);
        }

        Ok(Some(Frame {
            fin: header.fin,
            opcode: header.opcode,
            mask: header.mask,
            payload: raw.freeze(),
            wire_len: total,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> io::Result<()> {
        let len = frame.payload.len();
        dst.reserve(header_len(len as u64, frame.masked()) + len);

        let first = (if frame.fin { 0x80 } else { 0x00 }) | frame.opcode.as_u8();
        dst.put_u8(first);

        let mask_bit = if frame.masked() { 0x80 } else { 0x00 };
        if len < 126 {
            // len < 126 保证能放进 7 位
            dst.put_u8(mask_bit | u8::try_from(len).unwrap_or(0));
        } else if let Ok(len16) = u16::try_from(len) {
            dst.put_u8(mask_bit | 126);
            dst.put_u16(len16);
        } else {
            dst.put_u8(mask_bit | 127);
            dst.put_u64(len as u64);
        }

        match frame.mask {
            Some(key) => {
                dst.put_slice(&key);
                let mut masked = frame.payload.to_vec();
                apply_mask(&mut masked, key);
                dst.put_slice(&masked);
            }
            None => dst.put_slice(&frame.payload),
        }
        Ok(())
    }
}

/// 从滚动缓冲区中取出所有完整帧，剩余的不完整字节保留在 `buffer` 中
pub fn decode_frames(buffer: &mut BytesMut) -> io::Result<Vec<Frame>> {
    let mut codec = FrameCodec::new();
    let mut frames = Vec::new();
    while let Some(frame) = codec.decode(buffer)? {
        frames.push(frame);
    }
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(frame: Frame) -> BytesMut {
        let mut buf = BytesMut::new();
        FrameCodec::new().encode(frame, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_small_unmasked_text_frame() {
        let mut buf = encode(Frame::text("hello", None));
        assert_eq!(&buf[..2], &[0x81, 0x05]);

        let frames = decode_frames(&mut buf).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].text_message(), Some("hello"));
        assert_eq!(frames[0].wire_len, 7);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_masked_payload_is_unmasked() {
        let key = [0x37, 0xfa, 0x21, 0x3d];
        let buf = encode(Frame::text("Hello", Some(key)));
        // RFC 6455 5.7 中的示例帧
        assert_eq!(
            &buf[..],
            &[0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58]
        );

        let mut buf = buf;
        let frame = FrameCodec::new().decode(&mut buf).unwrap().unwrap();
        assert!(frame.masked());
        assert_eq!(frame.text_message(), Some("Hello"));
    }

    #[test]
    fn test_incomplete_header_waits() {
        let mut buf = BytesMut::from(&[0x81u8][..]);
        assert!(FrameCodec::new().decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn test_64bit_length_path() {
        let payload = vec![b'a'; 70_000];
        let mut buf = encode(Frame::new(true, OpCode::Binary, payload.clone(), None));
        assert_eq!(buf[1], 127);

        let frame = FrameCodec::new().decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.opcode, OpCode::Binary);
        assert_eq!(frame.payload.len(), payload.len());
        assert!(frame.text_message().is_none());
    }

    #[test]
    fn test_oversized_frame_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(0x82);
        buf.put_u8(127);
        buf.put_u64(MAX_FRAME_PAYLOAD + 1);
        let err = FrameCodec::new().decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_non_final_text_frame_is_not_a_message() {
        let mut buf = encode(Frame::new(false, OpCode::Text, "part", None));
        let frame = FrameCodec::new().decode(&mut buf).unwrap().unwrap();
        assert!(frame.text_message().is_none());
    }
}
