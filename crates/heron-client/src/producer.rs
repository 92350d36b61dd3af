// Publishing side: PUB, MPUB and DPUB over handshaken connections, round-robin.
use bytes::Bytes;
use heron_wire::Command;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;

use crate::backoff::BackoffTimer;
use crate::config::CONNECTION_EVENT_QUEUE_DEPTH;
use crate::{
    Connection, ConnectionConfig, ConnectionEvent, ConnectionHandle, ConnectionId, Error,
    PeerAddress, Result,
};

/// Publishes to one or more peers.
///
/// ```no_run
/// use heron_client::{ConnectionConfig, Producer};
///
/// # async fn run() -> heron_client::Result<()> {
/// let producer = Producer::connect(["127.0.0.1:4150"], ConnectionConfig::default()).await?;
/// producer.publish("events", "hello").await?;
/// producer.close().await;
/// # Ok(())
/// # }
/// ```
pub struct Producer {
    config: ConnectionConfig,
    slots: Vec<Slot>,
    next: AtomicUsize,
    next_id: AtomicU64,
}

struct Slot {
    addr: PeerAddress,
    state: Mutex<SlotState>,
}

struct SlotState {
    handle: Option<ConnectionHandle>,
    reconnect: BackoffTimer,
    retry_at: Option<Instant>,
}

impl Producer {
    /// Handshakes with every address. Fails only when none of them connect.
    pub async fn connect<I, S>(addresses: I, config: ConnectionConfig) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        config.validate()?;
        let addrs = addresses
            .into_iter()
            .map(|addr| {
                let addr = addr.as_ref();
                addr.parse::<PeerAddress>()
                    .map_err(|err| Error::Config(format!("nsqd address {addr:?}: {err}")))
            })
            .collect::<Result<Vec<_>>>()?;
        if addrs.is_empty() {
            return Err(Error::Config("no nsqd addresses".to_string()));
        }

        let producer = Self {
            slots: addrs
                .into_iter()
                .map(|addr| Slot {
                    addr,
                    state: Mutex::new(SlotState {
                        handle: None,
                        reconnect: BackoffTimer::new(config.reconnect_backoff.clone()),
                        retry_at: None,
                    }),
                })
                .collect(),
            config,
            next: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
        };

        let mut connected = 0;
        let mut last_error = None;
        for slot in &producer.slots {
            let mut state = slot.state.lock().await;
            match producer.dial(slot, &mut state).await {
                Ok(()) => connected += 1,
                Err(err) => last_error = Some(err),
            }
        }
        if connected == 0 {
            return Err(last_error.unwrap_or(Error::NoConnections));
        }
        tracing::info!(
            connected,
            peers = producer.slots.len(),
            "producer connected"
        );
        Ok(producer)
    }

    pub async fn publish(&self, topic: &str, body: impl Into<Bytes>) -> Result<()> {
        self.send(Command::Pub {
            topic: topic.to_string(),
            body: body.into(),
        })
        .await
    }

    pub async fn multi_publish(&self, topic: &str, bodies: Vec<Bytes>) -> Result<()> {
        self.send(Command::Mpub {
            topic: topic.to_string(),
            bodies,
        })
        .await
    }

    /// Publishes a message the peer holds back for `delay`.
    pub async fn deferred_publish(
        &self,
        topic: &str,
        body: impl Into<Bytes>,
        delay: Duration,
    ) -> Result<()> {
        self.send(Command::Dpub {
            topic: topic.to_string(),
            delay_ms: delay.as_millis() as u64,
            body: body.into(),
        })
        .await
    }

    /// Addresses that currently have a live connection.
    pub async fn connected_peers(&self) -> Vec<PeerAddress> {
        let mut peers = Vec::new();
        for slot in &self.slots {
            let state = slot.state.lock().await;
            if state.handle.as_ref().is_some_and(|handle| !handle.is_closed()) {
                peers.push(slot.addr.clone());
            }
        }
        peers
    }

    pub async fn close(&self) {
        for slot in &self.slots {
            let mut state = slot.state.lock().await;
            if let Some(handle) = state.handle.take() {
                handle.close();
            }
        }
        tracing::debug!("producer closed");
    }

    async fn send(&self, command: Command) -> Result<()> {
        let name = command.name();
        let mut last_error = None;
        for _ in 0..self.slots.len() {
            let index = self.next.fetch_add(1, Ordering::Relaxed) % self.slots.len();
            let slot = &self.slots[index];
            let Some(handle) = self.usable(slot).await else {
                continue;
            };
            match handle.request(command.clone()).await {
                Ok(_) => {
                    metrics::counter!("heron_client_published_total", "command" => name)
                        .increment(1);
                    return Ok(());
                }
                // Never written; another connection may take it. A reply
                // lost after the write surfaces as `Unacknowledged` instead.
                Err(Error::Closed) => {
                    tracing::debug!(addr = %slot.addr, command = name, "connection closed");
                    last_error = Some(Error::Closed);
                }
                Err(err) => {
                    metrics::counter!("heron_client_publish_errors_total").increment(1);
                    return Err(err);
                }
            }
        }
        Err(last_error.unwrap_or(Error::NoConnections))
    }

    // Live handle for the slot, redialling when the reconnect window allows.
    async fn usable(&self, slot: &Slot) -> Option<ConnectionHandle> {
        let mut state = slot.state.lock().await;
        if let Some(handle) = &state.handle
            && !handle.is_closed()
        {
            return Some(handle.clone());
        }
        state.handle = None;
        if let Some(retry_at) = state.retry_at
            && Instant::now() < retry_at
        {
            return None;
        }
        match self.dial(slot, &mut state).await {
            Ok(()) => state.handle.clone(),
            Err(_) => None,
        }
    }

    async fn dial(&self, slot: &Slot, state: &mut SlotState) -> Result<()> {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        match Connection::connect(id, slot.addr.clone(), &self.config).await {
            Ok(conn) => {
                let (events_tx, events_rx) = mpsc::channel(CONNECTION_EVENT_QUEUE_DEPTH);
                tokio::spawn(drain_events(slot.addr.clone(), events_rx));
                state.handle = Some(conn.start(events_tx));
                state.reconnect.reset();
                state.retry_at = None;
                tracing::debug!(addr = %slot.addr, conn = %id, "producer connection ready");
                Ok(())
            }
            Err(err) => {
                state.reconnect.failure();
                let delay = state.reconnect.interval();
                state.retry_at = Some(Instant::now() + delay);
                tracing::warn!(
                    addr = %slot.addr,
                    error = %err,
                    retry_ms = delay.as_millis() as u64,
                    "producer connect failed"
                );
                Err(err)
            }
        }
    }
}

// Publish acks are routed by the connection itself; only failures matter here.
async fn drain_events(addr: PeerAddress, mut events: mpsc::Receiver<ConnectionEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            ConnectionEvent::Error { conn, error } => {
                tracing::warn!(addr = %addr, conn = %conn, error = %error, "peer error");
            }
            ConnectionEvent::Closed {
                conn,
                error: Some(error),
            } => {
                tracing::warn!(addr = %addr, conn = %conn, error = %error, "connection lost");
            }
            ConnectionEvent::Closed { conn, error: None } => {
                tracing::debug!(addr = %addr, conn = %conn, "connection closed");
            }
            ConnectionEvent::Message { conn, frame } => {
                tracing::warn!(conn = %conn, id = %frame.id, "unexpected message on producer");
            }
            ConnectionEvent::Response { .. } | ConnectionEvent::Heartbeat { .. } => {}
        }
    }
}
