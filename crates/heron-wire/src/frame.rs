// Inbound frames: [u32 size][u32 frame type][data], size counting type + data.
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

use crate::{CLOSE_WAIT, DEFAULT_MAX_FRAME_BYTES, Error, HEARTBEAT, MessageId, OK, Result};

const SIZE_LEN: usize = 4;
const TYPE_LEN: usize = 4;
// timestamp + attempts + id
const MESSAGE_HEADER_LEN: usize = 8 + 2 + MessageId::LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Response,
    Error,
    Message,
}

impl FrameType {
    pub fn as_u32(self) -> u32 {
        match self {
            FrameType::Response => 0,
            FrameType::Error => 1,
            FrameType::Message => 2,
        }
    }

    pub fn from_u32(value: u32) -> Result<Self> {
        match value {
            0 => Ok(FrameType::Response),
            1 => Ok(FrameType::Error),
            2 => Ok(FrameType::Message),
            other => Err(Error::UnknownFrameType(other)),
        }
    }
}

/// Error codes a peer reports in error frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorCode {
    Invalid,
    BadBody,
    BadTopic,
    BadChannel,
    BadMessage,
    PutFailed,
    PubFailed,
    MpubFailed,
    AuthDisabled,
    AuthFailed,
    Unauthorized,
    FinFailed,
    ReqFailed,
    TouchFailed,
    Other(String),
}

impl ErrorCode {
    pub fn parse(code: &str) -> Self {
        match code {
            "E_INVALID" => ErrorCode::Invalid,
            "E_BAD_BODY" => ErrorCode::BadBody,
            "E_BAD_TOPIC" => ErrorCode::BadTopic,
            "E_BAD_CHANNEL" => ErrorCode::BadChannel,
            "E_BAD_MESSAGE" => ErrorCode::BadMessage,
            "E_PUT_FAILED" => ErrorCode::PutFailed,
            "E_PUB_FAILED" => ErrorCode::PubFailed,
            "E_MPUB_FAILED" => ErrorCode::MpubFailed,
            "E_AUTH_DISABLED" => ErrorCode::AuthDisabled,
            "E_AUTH_FAILED" => ErrorCode::AuthFailed,
            "E_UNAUTHORIZED" => ErrorCode::Unauthorized,
            "E_FIN_FAILED" | "E_FINISH_FAILED" => ErrorCode::FinFailed,
            "E_REQ_FAILED" | "E_REQUEUE_FAILED" => ErrorCode::ReqFailed,
            "E_TOUCH_FAILED" => ErrorCode::TouchFailed,
            other => ErrorCode::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ErrorCode::Invalid => "E_INVALID",
            ErrorCode::BadBody => "E_BAD_BODY",
            ErrorCode::BadTopic => "E_BAD_TOPIC",
            ErrorCode::BadChannel => "E_BAD_CHANNEL",
            ErrorCode::BadMessage => "E_BAD_MESSAGE",
            ErrorCode::PutFailed => "E_PUT_FAILED",
            ErrorCode::PubFailed => "E_PUB_FAILED",
            ErrorCode::MpubFailed => "E_MPUB_FAILED",
            ErrorCode::AuthDisabled => "E_AUTH_DISABLED",
            ErrorCode::AuthFailed => "E_AUTH_FAILED",
            ErrorCode::Unauthorized => "E_UNAUTHORIZED",
            ErrorCode::FinFailed => "E_FIN_FAILED",
            ErrorCode::ReqFailed => "E_REQ_FAILED",
            ErrorCode::TouchFailed => "E_TOUCH_FAILED",
            ErrorCode::Other(code) => code,
        }
    }

    /// Fatal errors end the session; the peer closes the socket after sending them.
    /// Only rejections of a single FIN/REQ/TOUCH are recoverable. Unknown codes are fatal.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            ErrorCode::FinFailed | ErrorCode::ReqFailed | ErrorCode::TouchFailed
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error reported by the peer in an error frame (`"E_CODE description"`).
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{code} {message}")]
pub struct PeerError {
    pub code: ErrorCode,
    pub message: String,
}

impl PeerError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn parse(payload: &[u8]) -> Self {
        let text = String::from_utf8_lossy(payload);
        let text = text.trim();
        match text.split_once(' ') {
            Some((code, message)) => Self::new(ErrorCode::parse(code), message.trim()),
            None => Self::new(ErrorCode::parse(text), ""),
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.code.is_fatal()
    }

    fn encode_payload(&self) -> Vec<u8> {
        if self.message.is_empty() {
            self.code.as_str().as_bytes().to_vec()
        } else {
            format!("{} {}", self.code, self.message).into_bytes()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageFrame {
    /// Nanoseconds since the epoch at which the peer accepted the message.
    pub timestamp: i64,
    /// Delivery attempts so far, including this one. Maintained by the peer.
    pub attempts: u16,
    pub id: MessageId,
    pub body: Bytes,
}

/// Decoded inbound frame.
///
/// ```
/// use bytes::{Bytes, BytesMut};
/// use heron_wire::{Frame, FrameDecoder};
///
/// let mut buf = BytesMut::new();
/// Frame::Response(Bytes::from_static(b"OK")).encode(&mut buf);
/// let frame = FrameDecoder::default().decode(&mut buf).expect("decode");
/// assert!(frame.expect("complete").is_ok());
/// assert!(buf.is_empty());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Response(Bytes),
    Error(PeerError),
    Message(MessageFrame),
}

impl Frame {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Response(_) => FrameType::Response,
            Frame::Error(_) => FrameType::Error,
            Frame::Message(_) => FrameType::Message,
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        matches!(self, Frame::Response(payload) if payload.as_ref() == HEARTBEAT)
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Frame::Response(payload) if payload.as_ref() == OK)
    }

    pub fn is_close_wait(&self) -> bool {
        matches!(self, Frame::Response(payload) if payload.as_ref() == CLOSE_WAIT)
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Frame::Response(payload) => {
                put_frame(buf, FrameType::Response, &[payload.as_ref()]);
            }
            Frame::Error(err) => {
                let payload = err.encode_payload();
                put_frame(buf, FrameType::Error, &[payload.as_slice()]);
            }
            Frame::Message(message) => {
                let mut header = [0u8; MESSAGE_HEADER_LEN];
                header[..8].copy_from_slice(&message.timestamp.to_be_bytes());
                header[8..10].copy_from_slice(&message.attempts.to_be_bytes());
                header[10..].copy_from_slice(message.id.as_bytes());
                put_frame(buf, FrameType::Message, &[&header[..], message.body.as_ref()]);
            }
        }
    }
}

fn put_frame(buf: &mut BytesMut, frame_type: FrameType, parts: &[&[u8]]) {
    let data_len: usize = parts.iter().map(|part| part.len()).sum();
    buf.reserve(SIZE_LEN + TYPE_LEN + data_len);
    buf.put_u32((TYPE_LEN + data_len) as u32);
    buf.put_u32(frame_type.as_u32());
    for part in parts {
        buf.extend_from_slice(part);
    }
}

/// Resumable frame decoder.
///
/// `decode` consumes exactly one frame from the front of the buffer when a whole
/// frame is present and leaves the buffer untouched otherwise, so it can be fed
/// straight from partial socket reads.
#[derive(Debug, Clone, Copy)]
pub struct FrameDecoder {
    max_frame_bytes: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl FrameDecoder {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }

    pub fn decode(&self, buf: &mut BytesMut) -> Result<Option<Frame>> {
        if buf.len() < SIZE_LEN {
            return Ok(None);
        }
        let size = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        // Validate the declared size before we wait on (or allocate for) it.
        if (size as usize) < TYPE_LEN {
            return Err(Error::InvalidFrameSize(size));
        }
        if size as usize > self.max_frame_bytes {
            return Err(Error::FrameTooLarge {
                size: size as usize,
                max: self.max_frame_bytes,
            });
        }
        let total = SIZE_LEN + size as usize;
        if buf.len() < total {
            buf.reserve(total - buf.len());
            return Ok(None);
        }
        buf.advance(SIZE_LEN);
        let mut data = buf.split_to(size as usize).freeze();
        let frame_type = FrameType::from_u32(data.get_u32())?;
        let frame = match frame_type {
            FrameType::Response => Frame::Response(data),
            FrameType::Error => Frame::Error(PeerError::parse(&data)),
            FrameType::Message => Frame::Message(decode_message(data)?),
        };
        Ok(Some(frame))
    }
}

fn decode_message(mut data: Bytes) -> Result<MessageFrame> {
    if data.len() < MESSAGE_HEADER_LEN {
        return Err(Error::ShortMessage(data.len()));
    }
    let timestamp = data.get_i64();
    let attempts = data.get_u16();
    let id = MessageId::from_slice(&data[..MessageId::LEN])?;
    data.advance(MessageId::LEN);
    Ok(MessageFrame {
        timestamp,
        attempts,
        id,
        body: data,
    })
}
