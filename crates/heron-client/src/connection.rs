// One session to one broker: handshake, then a reader task and a single writer task.
//
// Handshake runs inline on the caller's task with exclusive use of the
// transport. Once Ready the transport is split: the reader decodes frames and
// turns them into `ConnectionEvent`s, the writer is the only place bytes are
// written. Heartbeat answers go through a control queue the writer drains
// before ordinary commands.
use bytes::{Bytes, BytesMut};
use heron_transport::{Compression, Transport, TransportMode, TransportReader, TransportWriter};
use heron_wire::{
    AuthResponse, Command, DEFAULT_MAX_RDY_COUNT, ErrorCode, Frame, FrameDecoder,
    IdentifyResponse, MAGIC_V2, MessageFrame, PeerError,
};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use crate::config::ConnectionConfig;
use crate::{Error, PeerAddress, Result};

/// Engine-assigned connection identity; increasing in creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Handshaking = 1,
    UpgradingTls = 2,
    UpgradingCompression = 3,
    Authenticating = 4,
    Ready = 5,
    Closing = 6,
    Closed = 7,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Handshaking,
            2 => ConnectionState::UpgradingTls,
            3 => ConnectionState::UpgradingCompression,
            4 => ConnectionState::Authenticating,
            5 => ConnectionState::Ready,
            6 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// What a running connection reports to its owner.
#[derive(Debug)]
pub enum ConnectionEvent {
    Message {
        conn: ConnectionId,
        frame: MessageFrame,
    },
    Response {
        conn: ConnectionId,
        payload: Bytes,
    },
    /// A heartbeat arrived and its `NOP` was queued.
    Heartbeat { conn: ConnectionId },
    Error {
        conn: ConnectionId,
        error: PeerError,
    },
    /// Last event of every connection. `None` for a local close.
    Closed {
        conn: ConnectionId,
        error: Option<Error>,
    },
}

impl ConnectionEvent {
    pub fn connection(&self) -> ConnectionId {
        match self {
            ConnectionEvent::Message { conn, .. }
            | ConnectionEvent::Response { conn, .. }
            | ConnectionEvent::Heartbeat { conn }
            | ConnectionEvent::Error { conn, .. }
            | ConnectionEvent::Closed { conn, .. } => *conn,
        }
    }
}

type Ack = oneshot::Sender<Result<Bytes>>;

enum Outbound {
    Command { command: Command, ack: Option<Ack> },
    Close,
}

/// A session that completed its handshake but is not yet running.
///
/// ```no_run
/// use heron_client::{Connection, ConnectionConfig, ConnectionId, PeerAddress};
/// use tokio::sync::mpsc;
///
/// # async fn run() -> heron_client::Result<()> {
/// let addr = PeerAddress::new("127.0.0.1", 4150);
/// let conn = Connection::connect(ConnectionId(1), addr, &ConnectionConfig::default()).await?;
/// let (events_tx, mut events_rx) = mpsc::channel(64);
/// let handle = conn.start(events_tx);
/// handle.close();
/// while let Some(event) = events_rx.recv().await {
///     println!("{event:?}");
/// }
/// # Ok(())
/// # }
/// ```
pub struct Connection {
    id: ConnectionId,
    addr: PeerAddress,
    transport: Transport,
    buffer: BytesMut,
    decoder: FrameDecoder,
    identify: Option<IdentifyResponse>,
    auth: Option<AuthResponse>,
    state: Arc<AtomicU8>,
    response_timeout: Duration,
}

impl Connection {
    /// Dials `addr` and runs the whole handshake under `handshake_timeout`.
    pub async fn connect(
        id: ConnectionId,
        addr: PeerAddress,
        config: &ConnectionConfig,
    ) -> Result<Self> {
        let state = Arc::new(AtomicU8::new(ConnectionState::Connecting as u8));
        let transport = Transport::connect(&addr.to_string(), &config.transport).await?;
        let handshake = handshake(id, &addr, transport, config, &state);
        let connected = tokio::time::timeout(config.handshake_timeout, handshake)
            .await
            .map_err(|_| Error::Timeout("handshake"))?;
        match connected {
            Ok(Handshake {
                transport,
                buffer,
                decoder,
                identify,
                auth,
            }) => {
                state.store(ConnectionState::Ready as u8, Ordering::Release);
                metrics::counter!("heron_client_connections_opened_total").increment(1);
                tracing::debug!(
                    conn = %id,
                    addr = %addr,
                    mode = %transport.mode(),
                    "connection ready"
                );
                Ok(Self {
                    id,
                    addr,
                    transport,
                    buffer,
                    decoder,
                    identify,
                    auth,
                    state,
                    response_timeout: config.response_timeout,
                })
            }
            Err(err) => {
                state.store(ConnectionState::Closed as u8, Ordering::Release);
                metrics::counter!("heron_client_handshake_failures_total").increment(1);
                Err(err)
            }
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn mode(&self) -> TransportMode {
        self.transport.mode()
    }

    pub fn identify(&self) -> Option<&IdentifyResponse> {
        self.identify.as_ref()
    }

    pub fn auth(&self) -> Option<&AuthResponse> {
        self.auth.as_ref()
    }

    /// Splits the session into its reader and writer tasks.
    pub fn start(self, events: mpsc::Sender<ConnectionEvent>) -> ConnectionHandle {
        let mode = self.transport.mode();
        let (reader, writer) = self.transport.into_split();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (writer_done_tx, writer_done_rx) = oneshot::channel();
        let pending: Arc<Mutex<VecDeque<Option<Ack>>>> = Arc::new(Mutex::new(VecDeque::new()));

        tokio::spawn(run_writer(
            self.id,
            writer,
            commands_rx,
            control_rx,
            pending.clone(),
            writer_done_tx,
        ));
        tokio::spawn(run_reader(ReaderTask {
            id: self.id,
            reader,
            buffer: self.buffer,
            decoder: self.decoder,
            events,
            control: control_tx,
            commands: commands_tx.clone(),
            pending,
            writer_done: writer_done_rx,
            state: self.state.clone(),
        }));

        ConnectionHandle {
            inner: Arc::new(HandleInner {
                id: self.id,
                addr: self.addr,
                mode,
                identify: self.identify,
                auth: self.auth,
                commands: commands_tx,
                state: self.state,
                response_timeout: self.response_timeout,
            }),
        }
    }
}

/// Cloneable sending side of a running connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    id: ConnectionId,
    addr: PeerAddress,
    mode: TransportMode,
    identify: Option<IdentifyResponse>,
    auth: Option<AuthResponse>,
    commands: mpsc::UnboundedSender<Outbound>,
    state: Arc<AtomicU8>,
    response_timeout: Duration,
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn addr(&self) -> &PeerAddress {
        &self.inner.addr
    }

    pub fn mode(&self) -> TransportMode {
        self.inner.mode
    }

    pub fn identify(&self) -> Option<&IdentifyResponse> {
        self.inner.identify.as_ref()
    }

    pub fn auth(&self) -> Option<&AuthResponse> {
        self.inner.auth.as_ref()
    }

    /// Per-connection RDY ceiling advertised by the peer.
    pub fn max_rdy_count(&self) -> u32 {
        self.inner
            .identify
            .as_ref()
            .map(|identify| identify.max_rdy_count)
            .unwrap_or(DEFAULT_MAX_RDY_COUNT)
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Queues a command; does not wait for it to be written.
    pub fn send(&self, command: Command) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        self.inner
            .commands
            .send(Outbound::Command { command, ack: None })
            .map_err(|_| Error::Closed)
    }

    /// Sends a command and waits for the response frame it produces.
    pub async fn request(&self, command: Command) -> Result<Bytes> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let (ack_tx, ack_rx) = oneshot::channel();
        self.inner
            .commands
            .send(Outbound::Command {
                command,
                ack: Some(ack_tx),
            })
            .map_err(|_| Error::Closed)?;
        match tokio::time::timeout(self.inner.response_timeout, ack_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Closed),
            Err(_) => Err(Error::Timeout("response")),
        }
    }

    /// Flushes everything queued so far, then shuts the socket down.
    pub fn close(&self) {
        let _ = self.inner.state.compare_exchange(
            ConnectionState::Ready as u8,
            ConnectionState::Closing as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        let _ = self.inner.commands.send(Outbound::Close);
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.inner.id)
            .field("addr", &self.inner.addr)
            .field("mode", &self.inner.mode)
            .field("state", &self.state())
            .finish()
    }
}

struct Handshake {
    transport: Transport,
    buffer: BytesMut,
    decoder: FrameDecoder,
    identify: Option<IdentifyResponse>,
    auth: Option<AuthResponse>,
}

async fn handshake(
    id: ConnectionId,
    addr: &PeerAddress,
    mut transport: Transport,
    config: &ConnectionConfig,
    state: &AtomicU8,
) -> Result<Handshake> {
    let decoder = FrameDecoder::new(config.max_frame_bytes);
    let mut buffer = BytesMut::with_capacity(config.transport.read_buffer_bytes);
    state.store(ConnectionState::Handshaking as u8, Ordering::Release);

    let mut out = BytesMut::with_capacity(512);
    out.extend_from_slice(MAGIC_V2);
    Command::Identify(config.identify_request()).encode(&mut out)?;
    transport.write_all(&out).await?;
    let payload = read_response(&mut transport, &mut buffer, &decoder).await?;
    let identify = IdentifyResponse::parse(&payload)?;

    let Some(negotiated) = identify.as_ref() else {
        if config.tls_required {
            return Err(Error::Handshake(
                "peer does not support feature negotiation; TLS required".to_string(),
            ));
        }
        return Ok(Handshake {
            transport,
            buffer,
            decoder,
            identify,
            auth: None,
        });
    };

    if config.tls_v1 && negotiated.tls_v1 {
        state.store(ConnectionState::UpgradingTls as u8, Ordering::Release);
        let tls = config.tls_client_config()?;
        transport = transport.upgrade_tls(tls, &addr.host, &buffer).await?;
        expect_ok(&mut transport, &mut buffer, &decoder, "tls").await?;
    } else if config.tls_required {
        return Err(Error::Handshake("peer did not offer TLS".to_string()));
    }

    let compression = if config.snappy && negotiated.snappy {
        Compression::Snappy
    } else if config.deflate && negotiated.deflate {
        let level = if negotiated.deflate_level == 0 {
            config.deflate_level
        } else {
            negotiated.deflate_level
        };
        Compression::Deflate {
            level: level.clamp(1, 9),
        }
    } else {
        Compression::None
    };
    if compression != Compression::None {
        state.store(ConnectionState::UpgradingCompression as u8, Ordering::Release);
        transport.upgrade_compression(compression, &mut buffer)?;
        expect_ok(&mut transport, &mut buffer, &decoder, compression.name()).await?;
    }

    let mut auth = None;
    if negotiated.auth_required {
        state.store(ConnectionState::Authenticating as u8, Ordering::Release);
        let secret = config.auth_secret.as_ref().ok_or_else(|| {
            Error::Handshake("peer requires AUTH but no secret is set".to_string())
        })?;
        let command = Command::Auth(Bytes::copy_from_slice(secret.as_bytes()));
        transport.write_all(&command.to_bytes()?).await?;
        let payload = read_response(&mut transport, &mut buffer, &decoder).await?;
        let response = AuthResponse::parse(&payload)?;
        tracing::info!(
            conn = %id,
            addr = %addr,
            identity = %response.identity,
            permissions = response.permission_count,
            "authenticated"
        );
        auth = Some(response);
    }

    Ok(Handshake {
        transport,
        buffer,
        decoder,
        identify,
        auth,
    })
}

async fn expect_ok(
    transport: &mut Transport,
    buffer: &mut BytesMut,
    decoder: &FrameDecoder,
    step: &str,
) -> Result<()> {
    let payload = read_response(transport, buffer, decoder).await?;
    if payload.as_ref() != heron_wire::OK {
        return Err(Error::Handshake(format!(
            "expected OK after {step} upgrade, got {:?}",
            String::from_utf8_lossy(&payload)
        )));
    }
    Ok(())
}

// Next non-heartbeat response; heartbeats are answered inline.
async fn read_response(
    transport: &mut Transport,
    buffer: &mut BytesMut,
    decoder: &FrameDecoder,
) -> Result<Bytes> {
    loop {
        let frame = match decoder.decode(buffer)? {
            Some(frame) => frame,
            None => {
                if transport.read_buf(buffer).await? == 0 {
                    return Err(Error::Closed);
                }
                continue;
            }
        };
        match frame {
            Frame::Response(payload) if payload.as_ref() == heron_wire::HEARTBEAT => {
                transport.write_all(&Command::Nop.to_bytes()?).await?;
            }
            Frame::Response(payload) => return Ok(payload),
            Frame::Error(err) => return Err(Error::Peer(err)),
            Frame::Message(message) => {
                return Err(Error::Handshake(format!(
                    "unexpected message {} during handshake",
                    message.id
                )));
            }
        }
    }
}

async fn run_writer(
    id: ConnectionId,
    mut writer: TransportWriter,
    mut commands: mpsc::UnboundedReceiver<Outbound>,
    mut control: mpsc::UnboundedReceiver<Command>,
    pending: Arc<Mutex<VecDeque<Option<Ack>>>>,
    done: oneshot::Sender<Option<Error>>,
) {
    let result = write_loop(id, &mut writer, &mut commands, &mut control, &pending).await;
    let error = match result {
        Ok(()) => None,
        Err(err) => {
            tracing::debug!(conn = %id, error = %err, "writer failed");
            Some(err)
        }
    };
    let _ = done.send(error);
}

async fn write_loop(
    id: ConnectionId,
    writer: &mut TransportWriter,
    commands: &mut mpsc::UnboundedReceiver<Outbound>,
    control: &mut mpsc::UnboundedReceiver<Command>,
    pending: &Mutex<VecDeque<Option<Ack>>>,
) -> Result<()> {
    // Single writer: the only task that touches the write half.
    let mut out = BytesMut::with_capacity(4096);
    loop {
        tokio::select! {
            biased;
            Some(command) = control.recv() => {
                out.clear();
                command.encode(&mut out)?;
                writer.write_all(&out).await?;
                metrics::counter!("heron_client_heartbeats_answered_total").increment(1);
            }
            outbound = commands.recv() => {
                let Some(Outbound::Command { command, ack }) = outbound else {
                    break;
                };
                out.clear();
                if let Err(err) = command.encode(&mut out) {
                    match ack {
                        Some(ack) => {
                            let _ = ack.send(Err(err.into()));
                        }
                        None => {
                            tracing::warn!(conn = %id, error = %err, "dropping invalid command");
                        }
                    }
                    continue;
                }
                if command.expects_response() {
                    pending
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .push_back(ack);
                } else if let Some(ack) = ack {
                    let _ = ack.send(Ok(Bytes::new()));
                }
                writer.write_all(&out).await?;
            }
        }
    }
    // Anything the reader queued for the control path before the close.
    while let Ok(command) = control.try_recv() {
        out.clear();
        command.encode(&mut out)?;
        writer.write_all(&out).await?;
    }
    writer.shutdown().await?;
    Ok(())
}

struct ReaderTask {
    id: ConnectionId,
    reader: TransportReader,
    buffer: BytesMut,
    decoder: FrameDecoder,
    events: mpsc::Sender<ConnectionEvent>,
    control: mpsc::UnboundedSender<Command>,
    commands: mpsc::UnboundedSender<Outbound>,
    pending: Arc<Mutex<VecDeque<Option<Ack>>>>,
    writer_done: oneshot::Receiver<Option<Error>>,
    state: Arc<AtomicU8>,
}

enum Dispatch {
    Continue,
    Stop(Option<Error>),
}

async fn run_reader(mut task: ReaderTask) {
    let error = read_loop(&mut task).await;
    task.state
        .store(ConnectionState::Closed as u8, Ordering::Release);
    // Stop the writer if it is still running; a no-op after a local close.
    let _ = task.commands.send(Outbound::Close);
    let waiting: Vec<Option<Ack>> = task
        .pending
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .drain(..)
        .collect();
    for ack in waiting.into_iter().flatten() {
        let _ = ack.send(Err(Error::Unacknowledged));
    }
    match &error {
        Some(err) => tracing::debug!(conn = %task.id, error = %err, "connection closed"),
        None => tracing::debug!(conn = %task.id, "connection closed"),
    }
    metrics::counter!("heron_client_connections_closed_total").increment(1);
    let _ = task
        .events
        .send(ConnectionEvent::Closed {
            conn: task.id,
            error,
        })
        .await;
}

async fn read_loop(task: &mut ReaderTask) -> Option<Error> {
    loop {
        loop {
            let frame = match task.decoder.decode(&mut task.buffer) {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(err) => return Some(err.into()),
            };
            if let Dispatch::Stop(error) = dispatch(task, frame).await {
                return error;
            }
        }
        tokio::select! {
            read = task.reader.read_buf(&mut task.buffer) => match read {
                Ok(0) => {
                    let state = task.state.load(Ordering::Acquire);
                    let closing = state == ConnectionState::Closing as u8;
                    return (!closing).then_some(Error::Closed);
                }
                Ok(_) => {}
                Err(err) => return Some(err.into()),
            },
            done = &mut task.writer_done => {
                return done.unwrap_or(None);
            }
        }
    }
}

async fn dispatch(task: &mut ReaderTask, frame: Frame) -> Dispatch {
    let conn = task.id;
    let event = match frame {
        Frame::Response(payload) if payload.as_ref() == heron_wire::HEARTBEAT => {
            // Answer before anything else can be queued behind us.
            let _ = task.control.send(Command::Nop);
            ConnectionEvent::Heartbeat { conn }
        }
        Frame::Response(payload) => {
            let ack = task
                .pending
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .pop_front()
                .flatten();
            if let Some(ack) = ack {
                let _ = ack.send(Ok(payload.clone()));
            }
            ConnectionEvent::Response { conn, payload }
        }
        Frame::Error(error) => {
            metrics::counter!("heron_client_peer_errors_total").increment(1);
            let answers_command = !matches!(
                error.code,
                ErrorCode::FinFailed | ErrorCode::ReqFailed | ErrorCode::TouchFailed
            );
            if answers_command {
                let ack = task
                    .pending
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .pop_front()
                    .flatten();
                if let Some(ack) = ack {
                    let _ = ack.send(Err(Error::Peer(error.clone())));
                }
            }
            let fatal = error.is_fatal();
            tracing::debug!(conn = %conn, error = %error, fatal, "peer error");
            if task
                .events
                .send(ConnectionEvent::Error {
                    conn,
                    error: error.clone(),
                })
                .await
                .is_err()
            {
                return Dispatch::Stop(None);
            }
            return if fatal {
                Dispatch::Stop(Some(Error::Peer(error)))
            } else {
                Dispatch::Continue
            };
        }
        Frame::Message(frame) => {
            metrics::counter!("heron_client_messages_received_total").increment(1);
            ConnectionEvent::Message { conn, frame }
        }
    };
    if task.events.send(event).await.is_err() {
        return Dispatch::Stop(None);
    }
    Dispatch::Continue
}
