// Consumer, connection and backoff configuration with env and YAML overrides.
use anyhow::{Context, Result};
use heron_transport::{Compression, TransportConfig};
use heron_wire::{IdentifyRequest, valid_channel_name, valid_topic_name};
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::Error;

pub(crate) const ENGINE_QUEUE_DEPTH: usize = 1024;
pub(crate) const CONNECTION_EVENT_QUEUE_DEPTH: usize = 1024;
pub(crate) const ENGINE_COMMAND_QUEUE_DEPTH: usize = 64;

pub const DEFAULT_MAX_IN_FLIGHT: u32 = 1;
pub const DEFAULT_MAX_ATTEMPTS: u16 = 5;
pub const DEFAULT_REQUEUE_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_REQUEUE_DELAY: Duration = Duration::from_secs(60);
pub const DEFAULT_LOOKUPD_POLL_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_LOOKUPD_POLL_JITTER: f64 = 0.3;
pub const DEFAULT_LOW_READY_IDLE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_REDISTRIBUTE_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_BACKOFF_DURATION: Duration = Duration::from_secs(128);
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_DEFLATE_LEVEL: u32 = 6;

/// Hard safety cap for any single inbound frame.
///
/// The decoder holds a whole frame in memory before interpreting it; without a
/// cap a misbehaving peer can advertise an enormous size and exhaust memory.
/// Override with `HERON_MAX_FRAME_BYTES`.
pub const DEFAULT_MAX_FRAME_BYTES: usize = heron_wire::DEFAULT_MAX_FRAME_BYTES;

/// Exponential backoff policy.
///
/// The interval at level `n` is `base * (multiplier^n - 1)`, capped at `max`,
/// then reduced by a random fraction of up to `jitter` and raised to `min`.
/// A zero `max` disables backoff entirely.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    pub base: Duration,
    pub multiplier: f64,
    pub jitter: f64,
    pub min: Duration,
    pub max: Duration,
    pub max_level: u32,
}

impl BackoffConfig {
    /// Policy for throttling message throughput after processing failures.
    pub fn throughput_defaults() -> Self {
        Self {
            base: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: 0.5,
            min: Duration::ZERO,
            max: DEFAULT_MAX_BACKOFF_DURATION,
            max_level: 8,
        }
    }

    /// Policy for redialling a peer after its connection failed.
    pub fn reconnect_defaults() -> Self {
        Self {
            base: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: 0.5,
            min: Duration::from_millis(100),
            max: Duration::from_secs(60),
            max_level: 10,
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.max.is_zero()
    }

    fn validate(&self, what: &str) -> crate::Result<()> {
        if self.multiplier < 1.0 || !self.multiplier.is_finite() {
            return Err(Error::Config(format!("{what} multiplier must be >= 1")));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(Error::Config(format!("{what} jitter must be within 0..=1")));
        }
        if self.is_enabled() && self.min > self.max {
            return Err(Error::Config(format!("{what} min exceeds max")));
        }
        Ok(())
    }
}

/// Settings for one session: identity, negotiated features, timeouts.
#[derive(Clone)]
pub struct ConnectionConfig {
    pub client_id: String,
    pub hostname: String,
    pub user_agent: String,
    pub heartbeat_interval: Duration,
    pub output_buffer_size: i64,
    pub output_buffer_timeout: Duration,
    pub sample_rate: u32,
    pub msg_timeout: Option<Duration>,
    pub tls_v1: bool,
    /// Fail the handshake when the peer does not offer TLS.
    pub tls_required: bool,
    pub tls_ca_file: Option<PathBuf>,
    pub tls_insecure_skip_verify: bool,
    /// Overrides `tls_ca_file`/`tls_insecure_skip_verify` when set.
    pub tls_client_config: Option<Arc<rustls::ClientConfig>>,
    pub snappy: bool,
    pub deflate: bool,
    pub deflate_level: u32,
    pub auth_secret: Option<String>,
    pub transport: TransportConfig,
    pub handshake_timeout: Duration,
    pub response_timeout: Duration,
    pub max_frame_bytes: usize,
    pub reconnect_backoff: BackoffConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        let client_id = hostname.split('.').next().unwrap_or(&hostname).to_string();
        Self {
            client_id,
            hostname,
            user_agent: concat!("heron/", env!("CARGO_PKG_VERSION")).to_string(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            output_buffer_size: 16 * 1024,
            output_buffer_timeout: Duration::from_millis(250),
            sample_rate: 0,
            msg_timeout: None,
            tls_v1: false,
            tls_required: false,
            tls_ca_file: None,
            tls_insecure_skip_verify: false,
            tls_client_config: None,
            snappy: false,
            deflate: false,
            deflate_level: DEFAULT_DEFLATE_LEVEL,
            auth_secret: None,
            transport: TransportConfig::default(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            reconnect_backoff: BackoffConfig::reconnect_defaults(),
        }
    }
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("client_id", &self.client_id)
            .field("hostname", &self.hostname)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("tls_v1", &self.tls_v1)
            .field("tls_required", &self.tls_required)
            .field("snappy", &self.snappy)
            .field("deflate", &self.deflate)
            .field("deflate_level", &self.deflate_level)
            .field("auth_secret", &self.auth_secret.as_ref().map(|_| "<redacted>"))
            .finish_non_exhaustive()
    }
}

impl ConnectionConfig {
    pub fn validate(&self) -> crate::Result<()> {
        if self.snappy && self.deflate {
            return Err(Error::Config(
                "snappy and deflate cannot both be requested".to_string(),
            ));
        }
        if self.deflate && !(1..=9).contains(&self.deflate_level) {
            return Err(Error::Config(format!(
                "deflate level {} outside 1..=9",
                self.deflate_level
            )));
        }
        if self.tls_required && !self.tls_v1 {
            return Err(Error::Config("tls_required needs tls_v1".to_string()));
        }
        if self.tls_insecure_skip_verify && self.tls_ca_file.is_some() {
            return Err(Error::Config(
                "tls_ca_file and tls_insecure_skip_verify are mutually exclusive".to_string(),
            ));
        }
        if self.sample_rate > 99 {
            return Err(Error::Config(format!(
                "sample rate {} outside 0..=99",
                self.sample_rate
            )));
        }
        if self.max_frame_bytes < 64 {
            return Err(Error::Config("max_frame_bytes too small".to_string()));
        }
        self.reconnect_backoff.validate("reconnect backoff")
    }

    /// Compression this side asks for; the peer has the final word.
    pub fn requested_compression(&self) -> Compression {
        if self.snappy {
            Compression::Snappy
        } else if self.deflate {
            Compression::Deflate {
                level: self.deflate_level,
            }
        } else {
            Compression::None
        }
    }

    pub(crate) fn identify_request(&self) -> IdentifyRequest {
        IdentifyRequest {
            client_id: self.client_id.clone(),
            hostname: self.hostname.clone(),
            user_agent: self.user_agent.clone(),
            feature_negotiation: true,
            heartbeat_interval: millis_or_disabled(self.heartbeat_interval),
            output_buffer_size: self.output_buffer_size,
            output_buffer_timeout: millis_or_disabled(self.output_buffer_timeout),
            tls_v1: self.tls_v1,
            snappy: self.snappy,
            deflate: self.deflate,
            deflate_level: self.deflate_level,
            sample_rate: self.sample_rate,
            msg_timeout: self.msg_timeout.map(|value| value.as_millis() as u64),
        }
    }

    pub(crate) fn tls_client_config(&self) -> crate::Result<Arc<rustls::ClientConfig>> {
        if let Some(config) = &self.tls_client_config {
            return Ok(config.clone());
        }
        Ok(heron_transport::tls::client_config(
            self.tls_ca_file.as_deref(),
            self.tls_insecure_skip_verify,
        )?)
    }
}

// Zero asks the peer to disable the feature, which the protocol spells -1.
fn millis_or_disabled(value: Duration) -> i64 {
    if value.is_zero() {
        -1
    } else {
        value.as_millis() as i64
    }
}

/// Everything a consumer needs: what to subscribe to, where to find peers,
/// how much to have in flight, and how to react to failures.
///
/// ```
/// use heron_client::ConsumerConfig;
///
/// let mut config = ConsumerConfig::new("events", "archive");
/// config.nsqd_tcp_addresses = vec!["127.0.0.1:4150".to_string()];
/// config.max_in_flight = 10;
/// config.validate().expect("valid");
/// ```
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub topic: String,
    pub channel: String,
    pub nsqd_tcp_addresses: Vec<String>,
    pub lookupd_http_addresses: Vec<String>,
    pub max_in_flight: u32,
    /// Deliveries after which a message is given up on. Zero means never.
    pub max_attempts: u16,
    pub requeue_delay: Duration,
    pub max_requeue_delay: Duration,
    pub backoff_on_requeue: bool,
    pub lookupd_poll_interval: Duration,
    pub lookupd_poll_jitter: f64,
    pub low_ready_idle_timeout: Duration,
    pub redistribute_interval: Duration,
    pub shutdown_timeout: Duration,
    pub backoff: BackoffConfig,
    pub connection: ConnectionConfig,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
struct ConsumerConfigOverride {
    nsqd_tcp_addresses: Option<Vec<String>>,
    lookupd_http_addresses: Option<Vec<String>>,
    max_in_flight: Option<u32>,
    max_attempts: Option<u16>,
    requeue_delay_ms: Option<u64>,
    max_requeue_delay_ms: Option<u64>,
    backoff_on_requeue: Option<bool>,
    lookupd_poll_interval_ms: Option<u64>,
    lookupd_poll_jitter: Option<f64>,
    low_ready_idle_timeout_ms: Option<u64>,
    redistribute_interval_ms: Option<u64>,
    shutdown_timeout_ms: Option<u64>,
    max_backoff_duration_ms: Option<u64>,
    backoff_multiplier: Option<f64>,
    backoff_jitter: Option<f64>,
    connection: Option<ConnectionConfigOverride>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
struct ConnectionConfigOverride {
    client_id: Option<String>,
    hostname: Option<String>,
    user_agent: Option<String>,
    heartbeat_interval_ms: Option<u64>,
    output_buffer_size: Option<i64>,
    output_buffer_timeout_ms: Option<u64>,
    sample_rate: Option<u32>,
    msg_timeout_ms: Option<u64>,
    tls_v1: Option<bool>,
    tls_required: Option<bool>,
    tls_ca_file: Option<PathBuf>,
    tls_insecure_skip_verify: Option<bool>,
    snappy: Option<bool>,
    deflate: Option<bool>,
    deflate_level: Option<u32>,
    auth_secret: Option<String>,
    connect_timeout_ms: Option<u64>,
    handshake_timeout_ms: Option<u64>,
    response_timeout_ms: Option<u64>,
    max_frame_bytes: Option<usize>,
}

impl ConsumerConfig {
    pub fn new(topic: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            channel: channel.into(),
            nsqd_tcp_addresses: Vec::new(),
            lookupd_http_addresses: Vec::new(),
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            requeue_delay: DEFAULT_REQUEUE_DELAY,
            max_requeue_delay: DEFAULT_MAX_REQUEUE_DELAY,
            backoff_on_requeue: true,
            lookupd_poll_interval: DEFAULT_LOOKUPD_POLL_INTERVAL,
            lookupd_poll_jitter: DEFAULT_LOOKUPD_POLL_JITTER,
            low_ready_idle_timeout: DEFAULT_LOW_READY_IDLE_TIMEOUT,
            redistribute_interval: DEFAULT_REDISTRIBUTE_INTERVAL,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            backoff: BackoffConfig::throughput_defaults(),
            connection: ConnectionConfig::default(),
        }
    }

    /// Defaults, then `HERON_*` environment variables, then the YAML file at
    /// `config_path` (or `HERON_CLIENT_CONFIG`).
    pub fn from_env_or_yaml(
        topic: impl Into<String>,
        channel: impl Into<String>,
        config_path: Option<&str>,
    ) -> Result<Self> {
        let mut config = Self::from_env(topic, channel);
        let override_path = config_path
            .map(|value| value.to_string())
            .or_else(|| std::env::var("HERON_CLIENT_CONFIG").ok());
        let contents = match override_path.as_deref() {
            Some(path) => match fs::read_to_string(path) {
                Ok(contents) => Some(contents),
                Err(err) => {
                    return Err(err).with_context(|| format!("read client config: {path}"));
                }
            },
            None => None,
        };
        if let Some(contents) = contents {
            let override_cfg: ConsumerConfigOverride =
                serde_yaml::from_str(&contents).context("parse client config yaml")?;
            override_cfg.apply(&mut config);
        }
        Ok(config)
    }

    fn from_env(topic: impl Into<String>, channel: impl Into<String>) -> Self {
        let mut config = Self::new(topic, channel);
        if let Some(value) = read_list_env("HERON_NSQD_TCP_ADDRESSES") {
            config.nsqd_tcp_addresses = value;
        }
        if let Some(value) = read_list_env("HERON_LOOKUPD_HTTP_ADDRESSES") {
            config.lookupd_http_addresses = value;
        }
        if let Some(value) = read_u64_env("HERON_MAX_IN_FLIGHT") {
            config.max_in_flight = value.min(u32::MAX as u64) as u32;
        }
        if let Some(value) = read_u64_env("HERON_MAX_ATTEMPTS") {
            config.max_attempts = value.min(u16::MAX as u64) as u16;
        }
        if let Some(value) = read_u64_env("HERON_MAX_BACKOFF_DURATION_MS") {
            config.backoff.max = Duration::from_millis(value);
        }
        if let Some(value) = read_u64_env("HERON_HEARTBEAT_INTERVAL_MS") {
            config.connection.heartbeat_interval = Duration::from_millis(value);
        }
        if let Some(value) = read_usize_env("HERON_MAX_FRAME_BYTES") {
            config.connection.max_frame_bytes = value;
        }
        if let Some(value) = read_bool_env("HERON_TLS") {
            config.connection.tls_v1 = value;
        }
        if let Ok(value) = std::env::var("HERON_AUTH_SECRET")
            && !value.is_empty()
        {
            config.connection.auth_secret = Some(value);
        }
        config
    }

    /// Fails fast on anything that would only surface as a peer error later.
    pub fn validate(&self) -> crate::Result<()> {
        self.validate_settings()?;
        if self.nsqd_tcp_addresses.is_empty() && self.lookupd_http_addresses.is_empty() {
            return Err(Error::Config(
                "no nsqd or lookupd addresses configured".to_string(),
            ));
        }
        Ok(())
    }

    /// Everything `validate` checks except that an address source exists;
    /// a consumer given its own discovery needs no configured addresses.
    pub(crate) fn validate_settings(&self) -> crate::Result<()> {
        if !valid_topic_name(&self.topic) {
            return Err(Error::Config(format!("invalid topic name {:?}", self.topic)));
        }
        if !valid_channel_name(&self.channel) {
            return Err(Error::Config(format!(
                "invalid channel name {:?}",
                self.channel
            )));
        }
        if self.max_in_flight == 0 {
            return Err(Error::Config("max_in_flight must be at least 1".to_string()));
        }
        for addr in &self.nsqd_tcp_addresses {
            addr.parse::<crate::PeerAddress>()
                .map_err(|err| Error::Config(format!("nsqd address {addr:?}: {err}")))?;
        }
        if !(0.0..=1.0).contains(&self.lookupd_poll_jitter) {
            return Err(Error::Config(
                "lookupd_poll_jitter must be within 0..=1".to_string(),
            ));
        }
        if self.lookupd_poll_interval.is_zero() || self.redistribute_interval.is_zero() {
            return Err(Error::Config("poll intervals must be non-zero".to_string()));
        }
        self.backoff.validate("backoff")?;
        self.connection.validate()
    }

    pub fn add_nsqd_address(mut self, addr: impl Into<String>) -> Self {
        self.nsqd_tcp_addresses.push(addr.into());
        self
    }

    pub fn add_lookupd_address(mut self, addr: impl Into<String>) -> Self {
        self.lookupd_http_addresses.push(addr.into());
        self
    }
}

impl ConsumerConfigOverride {
    fn apply(&self, config: &mut ConsumerConfig) {
        if let Some(value) = &self.nsqd_tcp_addresses {
            config.nsqd_tcp_addresses = value.clone();
        }
        if let Some(value) = &self.lookupd_http_addresses {
            config.lookupd_http_addresses = value.clone();
        }
        if let Some(value) = self.max_in_flight
            && value > 0
        {
            config.max_in_flight = value;
        }
        if let Some(value) = self.max_attempts {
            config.max_attempts = value;
        }
        if let Some(value) = self.requeue_delay_ms {
            config.requeue_delay = Duration::from_millis(value);
        }
        if let Some(value) = self.max_requeue_delay_ms {
            config.max_requeue_delay = Duration::from_millis(value);
        }
        if let Some(value) = self.backoff_on_requeue {
            config.backoff_on_requeue = value;
        }
        if let Some(value) = self.lookupd_poll_interval_ms
            && value > 0
        {
            config.lookupd_poll_interval = Duration::from_millis(value);
        }
        if let Some(value) = self.lookupd_poll_jitter
            && (0.0..=1.0).contains(&value)
        {
            config.lookupd_poll_jitter = value;
        }
        if let Some(value) = self.low_ready_idle_timeout_ms
            && value > 0
        {
            config.low_ready_idle_timeout = Duration::from_millis(value);
        }
        if let Some(value) = self.redistribute_interval_ms
            && value > 0
        {
            config.redistribute_interval = Duration::from_millis(value);
        }
        if let Some(value) = self.shutdown_timeout_ms {
            config.shutdown_timeout = Duration::from_millis(value);
        }
        if let Some(value) = self.max_backoff_duration_ms {
            config.backoff.max = Duration::from_millis(value);
        }
        if let Some(value) = self.backoff_multiplier
            && value >= 1.0
        {
            config.backoff.multiplier = value;
        }
        if let Some(value) = self.backoff_jitter
            && (0.0..=1.0).contains(&value)
        {
            config.backoff.jitter = value;
        }
        if let Some(connection) = &self.connection {
            connection.apply(&mut config.connection);
        }
    }
}

impl ConnectionConfigOverride {
    fn apply(&self, config: &mut ConnectionConfig) {
        if let Some(value) = &self.client_id {
            config.client_id = value.clone();
        }
        if let Some(value) = &self.hostname {
            config.hostname = value.clone();
        }
        if let Some(value) = &self.user_agent {
            config.user_agent = value.clone();
        }
        if let Some(value) = self.heartbeat_interval_ms {
            config.heartbeat_interval = Duration::from_millis(value);
        }
        if let Some(value) = self.output_buffer_size {
            config.output_buffer_size = value;
        }
        if let Some(value) = self.output_buffer_timeout_ms {
            config.output_buffer_timeout = Duration::from_millis(value);
        }
        if let Some(value) = self.sample_rate {
            config.sample_rate = value;
        }
        if let Some(value) = self.msg_timeout_ms
            && value > 0
        {
            config.msg_timeout = Some(Duration::from_millis(value));
        }
        if let Some(value) = self.tls_v1 {
            config.tls_v1 = value;
        }
        if let Some(value) = self.tls_required {
            config.tls_required = value;
        }
        if let Some(value) = &self.tls_ca_file {
            config.tls_ca_file = Some(value.clone());
        }
        if let Some(value) = self.tls_insecure_skip_verify {
            config.tls_insecure_skip_verify = value;
        }
        if let Some(value) = self.snappy {
            config.snappy = value;
        }
        if let Some(value) = self.deflate {
            config.deflate = value;
        }
        // Out-of-range levels are kept so validate() reports them.
        if let Some(value) = self.deflate_level {
            config.deflate_level = value;
        }
        if let Some(value) = &self.auth_secret {
            config.auth_secret = Some(value.clone());
        }
        if let Some(value) = self.connect_timeout_ms
            && value > 0
        {
            config.transport.connect_timeout = Duration::from_millis(value);
        }
        if let Some(value) = self.handshake_timeout_ms
            && value > 0
        {
            config.handshake_timeout = Duration::from_millis(value);
        }
        if let Some(value) = self.response_timeout_ms
            && value > 0
        {
            config.response_timeout = Duration::from_millis(value);
        }
        if let Some(value) = self.max_frame_bytes
            && value > 0
        {
            config.max_frame_bytes = value;
        }
    }
}

fn read_u64_env(key: &str) -> Option<u64> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
}

fn read_usize_env(key: &str) -> Option<usize> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
}

fn read_bool_env(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
}

fn read_list_env(key: &str) -> Option<Vec<String>> {
    let value = std::env::var(key).ok()?;
    let items: Vec<String> = value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect();
    (!items.is_empty()).then_some(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    struct EnvGuard(&'static [&'static str]);

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for key in self.0 {
                unsafe {
                    std::env::remove_var(key);
                }
            }
        }
    }

    fn valid() -> ConsumerConfig {
        ConsumerConfig::new("events", "archive").add_nsqd_address("127.0.0.1:4150")
    }

    #[test]
    fn defaults_validate() {
        valid().validate().expect("valid");
    }

    #[test]
    fn invalid_names_fail_fast() {
        let mut config = valid();
        config.topic = "bad topic".to_string();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
        let mut config = valid();
        config.channel = "x".repeat(65);
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn conflicting_transport_requests_fail_fast() {
        let mut config = valid();
        config.connection.snappy = true;
        config.connection.deflate = true;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = valid();
        config.connection.deflate = true;
        config.connection.deflate_level = 12;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = valid();
        config.connection.tls_required = true;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn zero_budget_and_missing_peers_are_rejected() {
        let mut config = valid();
        config.max_in_flight = 0;
        assert!(config.validate().is_err());
        let config = ConsumerConfig::new("events", "archive");
        assert!(config.validate().is_err());
        let config = ConsumerConfig::new("events", "archive").add_nsqd_address("no-port");
        assert!(config.validate().is_err());
    }

    #[test]
    fn identify_request_reflects_connection_settings() {
        let mut connection = ConnectionConfig::default();
        connection.heartbeat_interval = Duration::ZERO;
        connection.deflate = true;
        connection.deflate_level = 3;
        connection.msg_timeout = Some(Duration::from_secs(90));
        let request = connection.identify_request();
        assert_eq!(request.heartbeat_interval, -1);
        assert!(request.deflate);
        assert_eq!(request.deflate_level, 3);
        assert_eq!(request.msg_timeout, Some(90_000));
        assert!(request.feature_negotiation);
    }

    #[test]
    #[serial_test::serial]
    fn env_then_yaml_overrides() {
        let _guard = EnvGuard(&["HERON_MAX_IN_FLIGHT", "HERON_NSQD_TCP_ADDRESSES"]);
        unsafe {
            std::env::set_var("HERON_MAX_IN_FLIGHT", "7");
            std::env::set_var("HERON_NSQD_TCP_ADDRESSES", "a:1, b:2");
        }
        let path = std::env::temp_dir()
            .join(format!("heron-config-{}.yaml", std::process::id()));
        let mut file = fs::File::create(&path).expect("create yaml");
        writeln!(
            file,
            "max_attempts: 9\nbackoff_jitter: 0.0\nconnection:\n  snappy: true\n  heartbeat_interval_ms: 5000"
        )
        .expect("write yaml");

        let config = ConsumerConfig::from_env_or_yaml("t", "c", path.to_str()).expect("config");
        let _ = fs::remove_file(&path);
        assert_eq!(config.max_in_flight, 7);
        assert_eq!(config.nsqd_tcp_addresses, vec!["a:1", "b:2"]);
        assert_eq!(config.max_attempts, 9);
        assert_eq!(config.backoff.jitter, 0.0);
        assert!(config.connection.snappy);
        assert_eq!(
            config.connection.heartbeat_interval,
            Duration::from_millis(5000)
        );
    }

    #[test]
    fn missing_yaml_is_an_error() {
        let err = ConsumerConfig::from_env_or_yaml("t", "c", Some("/nonexistent/heron.yaml"))
            .expect_err("missing file");
        assert!(err.to_string().contains("read client config"));
    }
}
