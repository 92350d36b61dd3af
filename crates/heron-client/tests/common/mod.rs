// In-process nsqd stand-in: accepts sessions, negotiates upgrades, records
// commands and lets the test push frames.
#![allow(dead_code)]

use bytes::{Bytes, BytesMut};
use heron_client::{ConnectionConfig, ConsumerConfig, PeerAddress, TransportMode};
use heron_transport::{Compression, Transport, TransportConfig};
use heron_wire::{
    AuthResponse, Command, CommandDecoder, Frame, IdentifyResponse, MAGIC_V2, MessageFrame,
    MessageId, PeerError,
};
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

pub const WAIT: Duration = Duration::from_secs(5);

/// Topic the mock rejects publishes to.
pub const REJECTED_TOPIC: &str = "rejected";

/// Topic whose publishes the mock reads and then hangs up on without replying.
pub const UNANSWERED_TOPIC: &str = "unanswered";

#[derive(Debug, Clone)]
pub struct MockOptions {
    pub max_rdy_count: u32,
    pub tls: bool,
    pub snappy: bool,
    pub deflate: bool,
    pub auth: bool,
}

impl Default for MockOptions {
    fn default() -> Self {
        Self {
            max_rdy_count: 2500,
            tls: false,
            snappy: false,
            deflate: false,
            auth: false,
        }
    }
}

pub struct MockNsqd {
    pub addr: PeerAddress,
    sessions: mpsc::UnboundedReceiver<Session>,
    task: JoinHandle<()>,
}

impl MockNsqd {
    pub async fn start() -> Self {
        Self::start_with(MockOptions::default()).await
    }

    pub async fn start_with(options: MockOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let acceptor = options.tls.then(tls_acceptor);
        let (sessions_tx, sessions) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let transport =
                    Transport::from_tcp(stream, &TransportConfig::default()).expect("transport");
                let options = options.clone();
                let acceptor = acceptor.clone();
                let sessions_tx = sessions_tx.clone();
                tokio::spawn(async move {
                    if let Some(session) = serve(transport, options, acceptor).await {
                        let _ = sessions_tx.send(session);
                    }
                });
            }
        });
        Self {
            addr: PeerAddress::new("127.0.0.1", port),
            sessions,
            task,
        }
    }

    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    /// Next session that completed its handshake.
    pub async fn next_session(&mut self) -> Session {
        tokio::time::timeout(WAIT, self.sessions.recv())
            .await
            .expect("session timeout")
            .expect("listener stopped")
    }

    /// True if no new session arrives within `wait`.
    pub async fn no_session_within(&mut self, wait: Duration) -> bool {
        tokio::time::timeout(wait, self.sessions.recv()).await.is_err()
    }
}

impl Drop for MockNsqd {
    fn drop(&mut self) {
        self.task.abort();
    }
}

enum Outgoing {
    Frame(Frame),
    HangUp,
}

/// Server side of one client session.
pub struct Session {
    pub mode: TransportMode,
    pub auth_secret: Option<Bytes>,
    commands: mpsc::UnboundedReceiver<Command>,
    outgoing: mpsc::UnboundedSender<Outgoing>,
}

impl Session {
    pub async fn next_command(&mut self) -> Command {
        tokio::time::timeout(WAIT, self.commands.recv())
            .await
            .expect("command timeout")
            .expect("session ended")
    }

    /// Skips commands until one matches.
    pub async fn wait_for<F>(&mut self, matches: F) -> Command
    where
        F: Fn(&Command) -> bool,
    {
        loop {
            let command = self.next_command().await;
            if matches(&command) {
                return command;
            }
        }
    }

    pub async fn wait_for_rdy(&mut self, count: u32) {
        self.wait_for(|command| *command == Command::Rdy(count))
            .await;
    }

    /// Commands received within `wait`, until the session goes quiet.
    pub async fn drain_for(&mut self, wait: Duration) -> Vec<Command> {
        let mut commands = Vec::new();
        while let Ok(Some(command)) = tokio::time::timeout(wait, self.commands.recv()).await {
            commands.push(command);
        }
        commands
    }

    /// Resolves once the client closed the socket.
    pub async fn closed(&mut self) {
        tokio::time::timeout(WAIT, async {
            while self.commands.recv().await.is_some() {}
        })
        .await
        .expect("client did not close");
    }

    pub fn send_message(&self, id: MessageId, attempts: u16, body: &'static [u8]) {
        self.send_frame(Frame::Message(MessageFrame {
            timestamp: 1_700_000_000_000_000_000,
            attempts,
            id,
            body: Bytes::from_static(body),
        }));
    }

    pub fn heartbeat(&self) {
        self.send_frame(Frame::Response(Bytes::from_static(heron_wire::HEARTBEAT)));
    }

    pub fn send_error(&self, error: PeerError) {
        self.send_frame(Frame::Error(error));
    }

    pub fn send_frame(&self, frame: Frame) {
        let _ = self.outgoing.send(Outgoing::Frame(frame));
    }

    /// Closes the socket from the server side.
    pub fn hang_up(&self) {
        let _ = self.outgoing.send(Outgoing::HangUp);
    }
}

pub fn message_id(n: u8) -> MessageId {
    let mut raw = *b"0000000000000000";
    raw[15] = b'0' + n;
    MessageId(raw)
}

pub fn consumer_config(peers: &[&MockNsqd]) -> ConsumerConfig {
    let mut config = ConsumerConfig::new("events", "archive");
    for peer in peers {
        config = config.add_nsqd_address(peer.address());
    }
    config.connection = connection_config();
    config.connection.reconnect_backoff.base = Duration::from_millis(50);
    config.connection.reconnect_backoff.min = Duration::from_millis(20);
    config.connection.reconnect_backoff.max = Duration::from_millis(200);
    config.shutdown_timeout = Duration::from_secs(2);
    config
}

pub fn connection_config() -> ConnectionConfig {
    let mut config = ConnectionConfig::default();
    config.handshake_timeout = WAIT;
    config.response_timeout = WAIT;
    config
}

async fn serve(
    mut transport: Transport,
    options: MockOptions,
    acceptor: Option<TlsAcceptor>,
) -> Option<Session> {
    let decoder = CommandDecoder::default();
    let mut buffer = BytesMut::new();
    while buffer.len() < MAGIC_V2.len() {
        if transport.read_buf(&mut buffer).await.ok()? == 0 {
            return None;
        }
    }
    let magic = buffer.split_to(MAGIC_V2.len());
    assert_eq!(&magic[..], MAGIC_V2);

    let Command::Identify(request) = read_command(&mut transport, &mut buffer, &decoder).await?
    else {
        panic!("expected IDENTIFY first");
    };
    let tls = options.tls && request.tls_v1;
    let snappy = options.snappy && request.snappy;
    let deflate = !snappy && options.deflate && request.deflate;
    let identify = IdentifyResponse {
        version: "1.3.0".to_string(),
        max_rdy_count: options.max_rdy_count,
        tls_v1: tls,
        snappy,
        deflate,
        deflate_level: if deflate { request.deflate_level } else { 0 },
        max_deflate_level: 6,
        auth_required: options.auth,
        ..IdentifyResponse::default()
    };
    let body = serde_json::to_vec(&identify).expect("identify json");
    write_frame(&mut transport, Frame::Response(body.into())).await?;

    if tls {
        let acceptor = acceptor.expect("tls acceptor");
        transport = transport.accept_tls(&acceptor, &buffer).await.ok()?;
        write_frame(&mut transport, ok()).await?;
    }
    let compression = if snappy {
        Compression::Snappy
    } else if deflate {
        Compression::Deflate {
            level: request.deflate_level.clamp(1, 9),
        }
    } else {
        Compression::None
    };
    if compression != Compression::None {
        transport.upgrade_compression(compression, &mut buffer).ok()?;
        write_frame(&mut transport, ok()).await?;
    }

    let mut auth_secret = None;
    if options.auth {
        let Command::Auth(secret) = read_command(&mut transport, &mut buffer, &decoder).await?
        else {
            panic!("expected AUTH");
        };
        auth_secret = Some(secret);
        let response = AuthResponse {
            identity: "tester".to_string(),
            identity_url: None,
            permission_count: 1,
        };
        let body = serde_json::to_vec(&response).expect("auth json");
        write_frame(&mut transport, Frame::Response(body.into())).await?;
    }

    let mode = transport.mode();
    let (mut reader, mut writer) = transport.into_split();
    let (commands_tx, commands) = mpsc::unbounded_channel();
    let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Some(item) = outgoing_rx.recv().await {
            match item {
                Outgoing::Frame(frame) => {
                    let mut out = BytesMut::new();
                    frame.encode(&mut out);
                    if writer.write_all(&out).await.is_err() {
                        return;
                    }
                }
                Outgoing::HangUp => {
                    let _ = writer.shutdown().await;
                    return;
                }
            }
        }
    });

    let replies = outgoing.clone();
    tokio::spawn(async move {
        loop {
            let command = loop {
                match decoder.decode(&mut buffer) {
                    Ok(Some(command)) => break Some(command),
                    Ok(None) => match reader.read_buf(&mut buffer).await {
                        Ok(0) | Err(_) => break None,
                        Ok(_) => {}
                    },
                    Err(_) => break None,
                }
            };
            let Some(command) = command else {
                return;
            };
            if publish_topic(&command) == Some(UNANSWERED_TOPIC) {
                let _ = replies.send(Outgoing::HangUp);
            } else if let Some(reply) = auto_reply(&command) {
                let hang_up = matches!(&reply, Frame::Error(err) if err.is_fatal());
                let _ = replies.send(Outgoing::Frame(reply));
                if hang_up {
                    let _ = replies.send(Outgoing::HangUp);
                }
            }
            if commands_tx.send(command).is_err() {
                return;
            }
        }
    });

    Some(Session {
        mode,
        auth_secret,
        commands,
        outgoing,
    })
}

fn publish_topic(command: &Command) -> Option<&str> {
    match command {
        Command::Pub { topic, .. } | Command::Mpub { topic, .. } | Command::Dpub { topic, .. } => {
            Some(topic.as_str())
        }
        _ => None,
    }
}

fn auto_reply(command: &Command) -> Option<Frame> {
    match command {
        Command::Sub { .. } => Some(ok()),
        Command::Cls => Some(Frame::Response(Bytes::from_static(heron_wire::CLOSE_WAIT))),
        Command::Pub { topic, .. } | Command::Mpub { topic, .. } | Command::Dpub { topic, .. }
            if topic == REJECTED_TOPIC =>
        {
            Some(Frame::Error(PeerError::new(
                heron_wire::ErrorCode::PubFailed,
                "PUB failed",
            )))
        }
        Command::Pub { .. } | Command::Mpub { .. } | Command::Dpub { .. } => Some(ok()),
        _ => None,
    }
}

fn ok() -> Frame {
    Frame::Response(Bytes::from_static(heron_wire::OK))
}

async fn read_command(
    transport: &mut Transport,
    buffer: &mut BytesMut,
    decoder: &CommandDecoder,
) -> Option<Command> {
    loop {
        if let Some(command) = decoder.decode(buffer).expect("decode command") {
            return Some(command);
        }
        if transport.read_buf(buffer).await.ok()? == 0 {
            return None;
        }
    }
}

async fn write_frame(transport: &mut Transport, frame: Frame) -> Option<()> {
    let mut out = BytesMut::new();
    frame.encode(&mut out);
    transport.write_all(&out).await.ok()
}

fn tls_acceptor() -> TlsAcceptor {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()]).expect("cert");
    let cert_der = CertificateDer::from(cert.serialize_der().expect("cert der"));
    let key_der = PrivatePkcs8KeyDer::from(cert.serialize_private_key_der());
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .expect("protocol versions")
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der.into())
        .expect("server config");
    TlsAcceptor::from(Arc::new(config))
}
