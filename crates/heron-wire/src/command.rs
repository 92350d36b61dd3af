// Outbound commands: `NAME[ param]*\n`, optionally followed by `[u32 size][body]`.
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{Error, IdentifyRequest, MessageId, Result, check_channel, check_topic};

// Longest command line the decoder will buffer while waiting for a newline.
const MAX_LINE_BYTES: usize = 1024;

/// Protocol commands a client sends.
///
/// ```
/// use bytes::BytesMut;
/// use heron_wire::Command;
///
/// let mut buf = BytesMut::new();
/// Command::Rdy(25).encode(&mut buf).expect("encode");
/// assert_eq!(&buf[..], b"RDY 25\n");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Identify(IdentifyRequest),
    Auth(Bytes),
    Sub { topic: String, channel: String },
    Rdy(u32),
    Fin(MessageId),
    Req { id: MessageId, delay_ms: u64 },
    Touch(MessageId),
    Nop,
    Cls,
    Pub { topic: String, body: Bytes },
    Mpub { topic: String, bodies: Vec<Bytes> },
    Dpub { topic: String, delay_ms: u64, body: Bytes },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Identify(_) => "IDENTIFY",
            Command::Auth(_) => "AUTH",
            Command::Sub { .. } => "SUB",
            Command::Rdy(_) => "RDY",
            Command::Fin(_) => "FIN",
            Command::Req { .. } => "REQ",
            Command::Touch(_) => "TOUCH",
            Command::Nop => "NOP",
            Command::Cls => "CLS",
            Command::Pub { .. } => "PUB",
            Command::Mpub { .. } => "MPUB",
            Command::Dpub { .. } => "DPUB",
        }
    }

    /// FIN, REQ and TOUCH get no response on success; the peer only answers
    /// them with an error frame.
    pub fn expects_response(&self) -> bool {
        !matches!(
            self,
            Command::Rdy(_)
                | Command::Fin(_)
                | Command::Req { .. }
                | Command::Touch(_)
                | Command::Nop
        )
    }

    /// Appends the wire form of the command to `buf`.
    ///
    /// Topic and channel names are validated here so an invalid name never
    /// reaches the peer. On error nothing is appended.
    pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        match self {
            Command::Identify(request) => {
                let body = serde_json::to_vec(request).map_err(Error::Serialize)?;
                put_command(buf, "IDENTIFY", &[], Some(body.as_slice()))
            }
            Command::Auth(secret) => put_command(buf, "AUTH", &[], Some(secret.as_ref())),
            Command::Sub { topic, channel } => {
                check_topic(topic)?;
                check_channel(channel)?;
                put_command(buf, "SUB", &[topic.as_bytes(), channel.as_bytes()], None)
            }
            Command::Rdy(count) => {
                put_command(buf, "RDY", &[count.to_string().as_bytes()], None)
            }
            Command::Fin(id) => put_command(buf, "FIN", &[id.as_bytes()], None),
            Command::Req { id, delay_ms } => put_command(
                buf,
                "REQ",
                &[id.as_bytes(), delay_ms.to_string().as_bytes()],
                None,
            ),
            Command::Touch(id) => put_command(buf, "TOUCH", &[id.as_bytes()], None),
            Command::Nop => put_command(buf, "NOP", &[], None),
            Command::Cls => put_command(buf, "CLS", &[], None),
            Command::Pub { topic, body } => {
                check_topic(topic)?;
                put_command(buf, "PUB", &[topic.as_bytes()], Some(body.as_ref()))
            }
            Command::Mpub { topic, bodies } => {
                check_topic(topic)?;
                let payload = encode_mpub_body(bodies)?;
                put_command(buf, "MPUB", &[topic.as_bytes()], Some(payload.as_slice()))
            }
            Command::Dpub {
                topic,
                delay_ms,
                body,
            } => {
                check_topic(topic)?;
                put_command(
                    buf,
                    "DPUB",
                    &[topic.as_bytes(), delay_ms.to_string().as_bytes()],
                    Some(body.as_ref()),
                )
            }
        }
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }
}

fn body_len(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| Error::BodyTooLarge(len))
}

fn put_command(
    buf: &mut BytesMut,
    name: &str,
    params: &[&[u8]],
    body: Option<&[u8]>,
) -> Result<()> {
    let size = match body {
        Some(body) => Some(body_len(body.len())?),
        None => None,
    };
    buf.extend_from_slice(name.as_bytes());
    for param in params {
        buf.put_u8(b' ');
        buf.extend_from_slice(param);
    }
    buf.put_u8(b'\n');
    if let (Some(size), Some(body)) = (size, body) {
        buf.put_u32(size);
        buf.extend_from_slice(body);
    }
    Ok(())
}

fn encode_mpub_body(bodies: &[Bytes]) -> Result<Vec<u8>> {
    let count = body_len(bodies.len())?;
    let total: usize = bodies.iter().map(|body| 4 + body.len()).sum();
    let mut payload = Vec::with_capacity(4 + total);
    payload.put_u32(count);
    for body in bodies {
        payload.put_u32(body_len(body.len())?);
        payload.extend_from_slice(body);
    }
    Ok(payload)
}

/// Parses commands from a byte stream. Peers and test servers use this; it is
/// resumable in the same way as [`crate::FrameDecoder`].
#[derive(Debug, Clone, Copy)]
pub struct CommandDecoder {
    max_body_bytes: usize,
}

impl Default for CommandDecoder {
    fn default() -> Self {
        Self::new(crate::DEFAULT_MAX_FRAME_BYTES)
    }
}

impl CommandDecoder {
    pub fn new(max_body_bytes: usize) -> Self {
        Self { max_body_bytes }
    }

    pub fn decode(&self, buf: &mut BytesMut) -> Result<Option<Command>> {
        let Some(newline) = buf.iter().position(|b| *b == b'\n') else {
            if buf.len() > MAX_LINE_BYTES {
                return Err(Error::MalformedCommand("command line too long".to_string()));
            }
            return Ok(None);
        };
        let line = String::from_utf8_lossy(&buf[..newline]).into_owned();
        let mut parts = line.split(' ');
        let name = parts.next().unwrap_or_default().to_string();
        let params: Vec<&str> = parts.collect();

        let body = if has_body(&name) {
            let header_end = newline + 1;
            if buf.len() < header_end + 4 {
                return Ok(None);
            }
            let size = u32::from_be_bytes([
                buf[header_end],
                buf[header_end + 1],
                buf[header_end + 2],
                buf[header_end + 3],
            ]) as usize;
            if size > self.max_body_bytes {
                return Err(Error::BodyTooLarge(size));
            }
            if buf.len() < header_end + 4 + size {
                return Ok(None);
            }
            buf.advance(header_end + 4);
            Some(buf.split_to(size).freeze())
        } else {
            buf.advance(newline + 1);
            None
        };
        parse_command(&name, &params, body).map(Some)
    }
}

fn has_body(name: &str) -> bool {
    matches!(name, "IDENTIFY" | "AUTH" | "PUB" | "MPUB" | "DPUB")
}

fn parse_command(name: &str, params: &[&str], body: Option<Bytes>) -> Result<Command> {
    let malformed = || Error::MalformedCommand(format!("{name} {}", params.join(" ")));
    let param = |idx: usize| params.get(idx).copied().ok_or_else(malformed);
    let id = |idx: usize| -> Result<MessageId> { MessageId::from_slice(param(idx)?.as_bytes()) };
    let number = |idx: usize| -> Result<u64> { param(idx)?.parse().map_err(|_| malformed()) };
    let body = body.unwrap_or_default();

    let command = match name {
        "IDENTIFY" => {
            Command::Identify(serde_json::from_slice(&body).map_err(Error::Deserialize)?)
        }
        "AUTH" => Command::Auth(body),
        "SUB" => Command::Sub {
            topic: param(0)?.to_string(),
            channel: param(1)?.to_string(),
        },
        "RDY" => Command::Rdy(param(0)?.parse().map_err(|_| malformed())?),
        "FIN" => Command::Fin(id(0)?),
        "REQ" => Command::Req {
            id: id(0)?,
            delay_ms: number(1)?,
        },
        "TOUCH" => Command::Touch(id(0)?),
        "NOP" => Command::Nop,
        "CLS" => Command::Cls,
        "PUB" => Command::Pub {
            topic: param(0)?.to_string(),
            body,
        },
        "MPUB" => Command::Mpub {
            topic: param(0)?.to_string(),
            bodies: decode_mpub_body(body)?,
        },
        "DPUB" => Command::Dpub {
            topic: param(0)?.to_string(),
            delay_ms: number(1)?,
            body,
        },
        _ => return Err(malformed()),
    };
    Ok(command)
}

fn decode_mpub_body(mut payload: Bytes) -> Result<Vec<Bytes>> {
    let truncated = || Error::MalformedCommand("truncated MPUB body".to_string());
    if payload.remaining() < 4 {
        return Err(truncated());
    }
    let count = payload.get_u32() as usize;
    let mut bodies = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        if payload.remaining() < 4 {
            return Err(truncated());
        }
        let len = payload.get_u32() as usize;
        if payload.remaining() < len {
            return Err(truncated());
        }
        bodies.push(payload.split_to(len));
    }
    Ok(bodies)
}
