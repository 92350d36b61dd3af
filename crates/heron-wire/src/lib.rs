// Codec for the NSQ V2 TCP protocol: line commands out, length-prefixed frames in.
use std::fmt;

mod command;
mod frame;
mod identify;

pub use command::{Command, CommandDecoder};
pub use frame::{ErrorCode, Frame, FrameDecoder, FrameType, MessageFrame, PeerError};
pub use identify::{AuthResponse, DEFAULT_MAX_RDY_COUNT, IdentifyRequest, IdentifyResponse};

/// Protocol magic written once, right after the TCP connection opens.
pub const MAGIC_V2: &[u8; 4] = b"  V2";
/// Response payload the peer sends as a liveness probe; answer with `NOP`.
pub const HEARTBEAT: &[u8] = b"_heartbeat_";
/// Generic success response.
pub const OK: &[u8] = b"OK";
/// Response to `CLS`: the peer stops sending and waits for in-flight messages.
pub const CLOSE_WAIT: &[u8] = b"CLOSE_WAIT";

/// Hard cap on a single inbound frame, including the 4-byte frame type.
///
/// The decoder buffers a whole frame before interpreting it, so a peer that
/// advertises an enormous size must be rejected rather than waited on.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024; // 16 MiB

const MAX_NAME_LEN: usize = 64;
const EPHEMERAL_SUFFIX: &str = "#ephemeral";

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("frame too large ({size} bytes, max {max})")]
    FrameTooLarge { size: usize, max: usize },
    #[error("malformed frame size {0}")]
    InvalidFrameSize(u32),
    #[error("unknown frame type {0}")]
    UnknownFrameType(u32),
    #[error("message frame too short ({0} bytes)")]
    ShortMessage(usize),
    #[error("invalid topic name {0:?}")]
    InvalidTopic(String),
    #[error("invalid channel name {0:?}")]
    InvalidChannel(String),
    #[error("body too large ({0} bytes)")]
    BodyTooLarge(usize),
    #[error("malformed command: {0}")]
    MalformedCommand(String),
    #[error("invalid message id")]
    InvalidMessageId,
    #[error("failed to serialize message")]
    Serialize(#[source] serde_json::Error),
    #[error("failed to deserialize message")]
    Deserialize(#[source] serde_json::Error),
}

/// Opaque 16-byte message identifier assigned by the peer.
///
/// ```
/// use heron_wire::MessageId;
///
/// let id = MessageId::from_slice(b"0123456789abcdef").expect("id");
/// assert_eq!(id.to_string(), "0123456789abcdef");
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub [u8; 16]);

impl MessageId {
    pub const LEN: usize = 16;

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let raw: [u8; 16] = bytes.try_into().map_err(|_| Error::InvalidMessageId)?;
        Ok(Self(raw))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Peers hand out printable ids; fall back to hex for anything else.
        match std::str::from_utf8(&self.0) {
            Ok(text) if text.bytes().all(|b| b.is_ascii_graphic()) => f.write_str(text),
            _ => self.0.iter().try_for_each(|b| write!(f, "{b:02x}")),
        }
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({self})")
    }
}

/// Returns true when `name` is a legal topic name.
///
/// Names are 1..=64 characters of `[.a-zA-Z0-9_-]`, optionally ending in `#ephemeral`.
///
/// ```
/// assert!(heron_wire::valid_topic_name("events.v1"));
/// assert!(heron_wire::valid_topic_name("scratch#ephemeral"));
/// assert!(!heron_wire::valid_topic_name("has space"));
/// ```
pub fn valid_topic_name(name: &str) -> bool {
    valid_name(name)
}

/// Returns true when `name` is a legal channel name. Same rules as topics.
pub fn valid_channel_name(name: &str) -> bool {
    valid_name(name)
}

fn valid_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return false;
    }
    let base = name.strip_suffix(EPHEMERAL_SUFFIX).unwrap_or(name);
    !base.is_empty()
        && base
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
}

pub(crate) fn check_topic(topic: &str) -> Result<()> {
    if valid_topic_name(topic) {
        Ok(())
    } else {
        Err(Error::InvalidTopic(topic.to_string()))
    }
}

pub(crate) fn check_channel(channel: &str) -> Result<()> {
    if valid_channel_name(channel) {
        Ok(())
    } else {
        Err(Error::InvalidChannel(channel.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_rules() {
        assert!(valid_topic_name("a"));
        assert!(valid_topic_name("Topic_name-1.2"));
        assert!(valid_channel_name("archive#ephemeral"));
        assert!(valid_topic_name(&"x".repeat(64)));
        assert!(!valid_topic_name(&"x".repeat(65)));
        assert!(!valid_topic_name(""));
        assert!(!valid_topic_name("#ephemeral"));
        assert!(!valid_channel_name("bad/char"));
        assert!(!valid_channel_name("eph#emeral"));
    }

    #[test]
    fn message_id_display_falls_back_to_hex() {
        let printable = MessageId(*b"06f5ad4a0c1e4000");
        assert_eq!(printable.to_string(), "06f5ad4a0c1e4000");
        let binary = MessageId([0u8; 16]);
        assert_eq!(binary.to_string(), "0".repeat(32));
    }

    #[test]
    fn message_id_from_slice_checks_length() {
        let err = MessageId::from_slice(b"short").expect_err("short id");
        assert!(matches!(err, Error::InvalidMessageId));
    }
}
