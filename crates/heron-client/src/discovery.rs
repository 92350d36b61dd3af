// Peer discovery: static address lists and nsqlookupd polling.
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Host and TCP port of one broker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerAddress {
    pub host: String,
    pub port: u16,
}

impl PeerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for PeerAddress {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        let (host, port) = value
            .rsplit_once(':')
            .ok_or_else(|| anyhow!("missing port in {value:?}"))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(anyhow!("missing host in {value:?}"));
        }
        let port = port
            .parse::<u16>()
            .with_context(|| format!("invalid port in {value:?}"))?;
        Ok(Self::new(host, port))
    }
}

/// Source of broker addresses for a topic.
///
/// Failures are logged by the consumer, which keeps the previous list.
#[async_trait]
pub trait Discovery: Send + Sync + 'static {
    async fn lookup(&self, topic: &str) -> Result<Vec<PeerAddress>>;
}

/// Always returns the same addresses.
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    peers: Vec<PeerAddress>,
}

impl StaticDiscovery {
    pub fn new(peers: Vec<PeerAddress>) -> Self {
        Self { peers }
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn lookup(&self, _topic: &str) -> Result<Vec<PeerAddress>> {
        Ok(self.peers.clone())
    }
}

#[derive(Debug, Deserialize)]
struct LookupResponse {
    #[serde(default)]
    producers: Option<Vec<Producer>>,
    // Pre-1.0 lookupd wraps the payload.
    #[serde(default)]
    data: Option<LookupData>,
}

#[derive(Debug, Deserialize)]
struct LookupData {
    #[serde(default)]
    producers: Vec<Producer>,
}

#[derive(Debug, Deserialize)]
struct Producer {
    broadcast_address: String,
    tcp_port: u16,
}

/// Queries nsqlookupd `/lookup` endpoints, one per call, round-robin.
pub struct LookupdDiscovery {
    endpoints: Vec<String>,
    next: AtomicUsize,
    client: reqwest::Client,
}

impl LookupdDiscovery {
    pub fn new<I, S>(addresses: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let endpoints: Vec<String> = addresses
            .into_iter()
            .map(|addr| lookup_url(addr.as_ref()))
            .collect();
        if endpoints.is_empty() {
            return Err(anyhow!("no lookupd addresses"));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent(concat!("heron/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("build lookupd http client")?;
        Ok(Self {
            endpoints,
            next: AtomicUsize::new(0),
            client,
        })
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }
}

impl fmt::Debug for LookupdDiscovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LookupdDiscovery")
            .field("endpoints", &self.endpoints)
            .finish()
    }
}

#[async_trait]
impl Discovery for LookupdDiscovery {
    async fn lookup(&self, topic: &str) -> Result<Vec<PeerAddress>> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.endpoints.len();
        let url = &self.endpoints[index];
        let response = self
            .client
            .get(url)
            .query(&[("topic", topic)])
            .header("Accept", "application/vnd.nsq; version=1.0")
            .send()
            .await
            .with_context(|| format!("lookup request to {url}"))?
            .error_for_status()
            .with_context(|| format!("lookup status from {url}"))?;
        let body = response
            .bytes()
            .await
            .with_context(|| format!("lookup body from {url}"))?;
        let peers = parse_producers(&body)?;
        tracing::debug!(endpoint = %url, topic, peers = peers.len(), "lookup complete");
        Ok(peers)
    }
}

fn lookup_url(address: &str) -> String {
    let base = if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else {
        format!("http://{address}")
    };
    let trimmed = base.trim_end_matches('/');
    if trimmed.ends_with("/lookup") {
        trimmed.to_string()
    } else {
        format!("{trimmed}/lookup")
    }
}

fn parse_producers(body: &[u8]) -> Result<Vec<PeerAddress>> {
    let response: LookupResponse = serde_json::from_slice(body).context("decode lookup body")?;
    let producers = match (response.producers, response.data) {
        (Some(producers), _) => producers,
        (None, Some(data)) => data.producers,
        (None, None) => return Err(anyhow!("lookup body has no producers")),
    };
    let mut peers: Vec<PeerAddress> = producers
        .into_iter()
        .map(|producer| PeerAddress::new(producer.broadcast_address, producer.tcp_port))
        .collect();
    peers.sort();
    peers.dedup();
    Ok(peers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn peer_address_parsing() {
        let addr: PeerAddress = "127.0.0.1:4150".parse().expect("addr");
        assert_eq!(addr, PeerAddress::new("127.0.0.1", 4150));
        assert_eq!(addr.to_string(), "127.0.0.1:4150");
        let addr: PeerAddress = "[::1]:4150".parse().expect("v6");
        assert_eq!(addr.host, "::1");
        assert_eq!(addr.to_string(), "[::1]:4150");
        assert!("localhost".parse::<PeerAddress>().is_err());
        assert!(":4150".parse::<PeerAddress>().is_err());
        assert!("host:99999".parse::<PeerAddress>().is_err());
    }

    #[test]
    fn lookup_urls_are_normalized() {
        assert_eq!(lookup_url("127.0.0.1:4161"), "http://127.0.0.1:4161/lookup");
        assert_eq!(lookup_url("https://lookupd/"), "https://lookupd/lookup");
        assert_eq!(lookup_url("http://h:1/lookup"), "http://h:1/lookup");
    }

    #[test]
    fn both_payload_shapes_parse() {
        let bare = br#"{"channels":[],"producers":[
            {"broadcast_address":"b","tcp_port":4150},
            {"broadcast_address":"a","tcp_port":4150},
            {"broadcast_address":"a","tcp_port":4150}]}"#;
        let peers = parse_producers(bare).expect("bare");
        assert_eq!(
            peers,
            vec![PeerAddress::new("a", 4150), PeerAddress::new("b", 4150)]
        );

        let wrapped = br#"{"status_code":200,"data":{"producers":[
            {"broadcast_address":"c","tcp_port":4152,"http_port":4153}]}}"#;
        let peers = parse_producers(wrapped).expect("wrapped");
        assert_eq!(peers, vec![PeerAddress::new("c", 4152)]);

        assert!(parse_producers(b"{}").is_err());
        assert!(parse_producers(b"not json").is_err());
    }

    #[tokio::test]
    async fn lookupd_round_trip_over_http() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            let mut request = vec![0u8; 4096];
            let read = stream.read(&mut request).await.expect("read");
            let request = String::from_utf8_lossy(&request[..read]).to_string();
            let body = r#"{"producers":[{"broadcast_address":"10.0.0.1","tcp_port":4150}]}"#;
            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            stream
                .write_all(response.as_bytes())
                .await
                .expect("write");
            request
        });

        let discovery = LookupdDiscovery::new([addr.to_string()]).expect("discovery");
        let peers = discovery.lookup("events").await.expect("lookup");
        assert_eq!(peers, vec![PeerAddress::new("10.0.0.1", 4150)]);
        let request = server.await.expect("server");
        assert!(request.starts_with("GET /lookup?topic=events "));
    }

    #[tokio::test]
    async fn static_discovery_returns_its_list() {
        let discovery = StaticDiscovery::new(vec![PeerAddress::new("h", 1)]);
        assert_eq!(
            discovery.lookup("t").await.expect("lookup"),
            vec![PeerAddress::new("h", 1)]
        );
    }
}
