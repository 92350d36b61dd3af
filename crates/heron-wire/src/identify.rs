// IDENTIFY negotiation and AUTH payloads (JSON bodies).
use serde::{Deserialize, Serialize};

use crate::{Error, OK, Result};

/// Credit ceiling assumed when the peer does not advertise one.
pub const DEFAULT_MAX_RDY_COUNT: u32 = 2500;

/// Client capabilities sent in the IDENTIFY body.
///
/// Intervals are milliseconds; `-1` disables heartbeats or output buffering
/// on the peer side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentifyRequest {
    pub client_id: String,
    pub hostname: String,
    pub user_agent: String,
    pub feature_negotiation: bool,
    pub heartbeat_interval: i64,
    pub output_buffer_size: i64,
    pub output_buffer_timeout: i64,
    pub tls_v1: bool,
    pub snappy: bool,
    pub deflate: bool,
    pub deflate_level: u32,
    pub sample_rate: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg_timeout: Option<u64>,
}

impl Default for IdentifyRequest {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            hostname: String::new(),
            user_agent: concat!("heron/", env!("CARGO_PKG_VERSION")).to_string(),
            feature_negotiation: true,
            heartbeat_interval: 30_000,
            output_buffer_size: 16 * 1024,
            output_buffer_timeout: 250,
            tls_v1: false,
            snappy: false,
            deflate: false,
            deflate_level: 6,
            sample_rate: 0,
            msg_timeout: None,
        }
    }
}

/// Negotiated settings returned by the peer when feature negotiation is on.
///
/// ```
/// use heron_wire::IdentifyResponse;
///
/// let parsed = IdentifyResponse::parse(br#"{"max_rdy_count": 100, "snappy": true}"#)
///     .expect("parse")
///     .expect("negotiated");
/// assert_eq!(parsed.max_rdy_count, 100);
/// assert!(parsed.snappy);
/// assert!(IdentifyResponse::parse(b"OK").expect("parse").is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentifyResponse {
    pub version: String,
    pub max_rdy_count: u32,
    pub max_msg_timeout: u64,
    pub msg_timeout: u64,
    pub tls_v1: bool,
    pub deflate: bool,
    pub deflate_level: u32,
    pub max_deflate_level: u32,
    pub snappy: bool,
    pub sample_rate: u32,
    pub auth_required: bool,
    pub output_buffer_size: i64,
    pub output_buffer_timeout: i64,
}

impl Default for IdentifyResponse {
    fn default() -> Self {
        Self {
            version: String::new(),
            max_rdy_count: DEFAULT_MAX_RDY_COUNT,
            max_msg_timeout: 0,
            msg_timeout: 0,
            tls_v1: false,
            deflate: false,
            deflate_level: 0,
            max_deflate_level: 0,
            snappy: false,
            sample_rate: 0,
            auth_required: false,
            output_buffer_size: 0,
            output_buffer_timeout: 0,
        }
    }
}

impl IdentifyResponse {
    /// A plain `OK` means the peer did not negotiate anything.
    pub fn parse(payload: &[u8]) -> Result<Option<Self>> {
        if payload == OK {
            return Ok(None);
        }
        serde_json::from_slice(payload)
            .map(Some)
            .map_err(Error::Deserialize)
    }
}

/// Result of a successful AUTH.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthResponse {
    pub identity: String,
    pub identity_url: Option<String>,
    pub permission_count: u32,
}

impl AuthResponse {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload).map_err(Error::Deserialize)
    }
}
