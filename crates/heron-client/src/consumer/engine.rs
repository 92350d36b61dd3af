// The consumer engine: the one task that owns connections, credit and backoff.
//
// Everything else (connection readers, dial tasks, handler tasks, lookups,
// reconnect timers) only sends events here. State changes happen in the
// `on_*` methods below and nowhere else.
use heron_wire::{Command, MessageFrame, MessageId};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use super::{ConnectionStats, ConsumerStats, subscription};
use crate::backoff::{BackoffMode, BackoffTimer, ThroughputBackoff, Transition};
use crate::config::{ConnectionConfig, ConsumerConfig};
use crate::message::ReplyAction;
use crate::observer::{
    AuthEvent, BackoffEvent, ErrorEvent, ExceptionEvent, RequeueEvent, ResponseEvent,
};
use crate::ready::{self, ConnectionCredit};
use crate::{
    Connection, ConnectionEvent, ConnectionHandle, ConnectionId, Discovery, Error, Message,
    MessageHandler, Observers, Outcome, PeerAddress, Result,
};

// Extra time after the shutdown timeout for closing connections to flush.
const CLOSE_GRACE: Duration = Duration::from_secs(5);
const STARVED_RATIO: f64 = 0.85;

/// Work reported to the engine by the tasks it spawned.
#[derive(Debug)]
pub(crate) enum EngineEvent {
    Connected {
        peer: PeerAddress,
        conn: ConnectionHandle,
    },
    ConnectFailed {
        peer: PeerAddress,
        conn: ConnectionId,
        error: Error,
    },
    Reply {
        conn: ConnectionId,
        id: MessageId,
        action: ReplyAction,
    },
    HandlerDone {
        message: Message,
        result: anyhow::Result<Outcome>,
    },
    Lookup(anyhow::Result<Vec<PeerAddress>>),
    Reconnect(PeerAddress),
}

pub(super) enum EngineCommand {
    Stop(oneshot::Sender<()>),
    Stats(oneshot::Sender<ConsumerStats>),
    IsStarved(oneshot::Sender<bool>),
}

struct Entry {
    handle: ConnectionHandle,
    peer: PeerAddress,
    /// Last RDY count sent.
    granted: u32,
    /// Deliveries still allowed by `granted`.
    remaining: u32,
    outstanding: HashMap<MessageId, Message>,
    last_message: Instant,
    received: u64,
    draining: bool,
}

impl Entry {
    fn in_flight(&self) -> u32 {
        self.outstanding.len() as u32
    }
}

struct PeerState {
    conn: Option<ConnectionId>,
    dialing: bool,
    reconnect_pending: bool,
    reconnect: BackoffTimer,
}

struct Stopping {
    deadline: Instant,
    forced: bool,
    waiters: Vec<oneshot::Sender<()>>,
}

#[derive(Default)]
struct Counters {
    received: u64,
    finished: u64,
    requeued: u64,
    given_up: u64,
}

pub(super) struct Engine {
    config: ConsumerConfig,
    handler: Arc<dyn MessageHandler>,
    discovery: Option<Arc<dyn Discovery>>,
    observers: Arc<Observers>,
    engine_tx: mpsc::Sender<EngineEvent>,
    conn_tx: mpsc::Sender<ConnectionEvent>,
    // Ordered by id, which is insertion order.
    connections: BTreeMap<ConnectionId, Entry>,
    peers: HashMap<PeerAddress, PeerState>,
    static_peers: HashSet<PeerAddress>,
    discovered: HashSet<PeerAddress>,
    backoff: ThroughputBackoff,
    backoff_timer: Option<(Instant, u64)>,
    probe: Option<ConnectionId>,
    next_lookup: Option<Instant>,
    lookup_in_flight: bool,
    next_id: u64,
    rng: StdRng,
    stopping: Option<Stopping>,
    counters: Counters,
}

impl Engine {
    pub(super) fn new(
        config: ConsumerConfig,
        handler: Arc<dyn MessageHandler>,
        discovery: Option<Arc<dyn Discovery>>,
        observers: Arc<Observers>,
        static_peers: Vec<PeerAddress>,
        engine_tx: mpsc::Sender<EngineEvent>,
        conn_tx: mpsc::Sender<ConnectionEvent>,
    ) -> Self {
        let backoff = ThroughputBackoff::new(config.backoff.clone());
        Self {
            config,
            handler,
            discovery,
            observers,
            engine_tx,
            conn_tx,
            connections: BTreeMap::new(),
            peers: HashMap::new(),
            static_peers: static_peers.into_iter().collect(),
            discovered: HashSet::new(),
            backoff,
            backoff_timer: None,
            probe: None,
            next_lookup: None,
            lookup_in_flight: false,
            next_id: 1,
            rng: StdRng::from_entropy(),
            stopping: None,
            counters: Counters::default(),
        }
    }

    pub(super) async fn run(
        mut self,
        mut events: mpsc::Receiver<EngineEvent>,
        mut conn_events: mpsc::Receiver<ConnectionEvent>,
        mut commands: mpsc::Receiver<EngineCommand>,
    ) {
        let mut statics: Vec<PeerAddress> = self.static_peers.iter().cloned().collect();
        statics.sort();
        for peer in statics {
            self.dial(peer);
        }
        if self.discovery.is_some() {
            self.spawn_lookup();
            let jitter = self.config.lookupd_poll_interval.as_secs_f64()
                * self.config.lookupd_poll_jitter
                * self.rng.gen_range(0.0..1.0);
            self.next_lookup = Some(Instant::now() + Duration::from_secs_f64(jitter));
        }

        let mut redistribute = tokio::time::interval(self.config.redistribute_interval);
        redistribute.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut commands_open = true;

        loop {
            let backoff_deadline = self.backoff_timer.map(|(deadline, _)| deadline);
            let lookup_deadline = match (&self.stopping, self.lookup_in_flight) {
                (None, false) => self.next_lookup,
                _ => None,
            };
            let stop_deadline = self.stopping.as_ref().map(|stopping| stopping.deadline);

            tokio::select! {
                Some(event) = conn_events.recv() => self.on_connection_event(event),
                Some(event) = events.recv() => self.on_engine_event(event),
                command = commands.recv(), if commands_open => match command {
                    Some(EngineCommand::Stop(done)) => self.begin_stop(Some(done)),
                    Some(EngineCommand::Stats(reply)) => {
                        let _ = reply.send(self.stats());
                    }
                    Some(EngineCommand::IsStarved(reply)) => {
                        let _ = reply.send(self.is_starved());
                    }
                    None => {
                        commands_open = false;
                        self.begin_stop(None);
                    }
                },
                _ = redistribute.tick() => self.redistribute(),
                _ = sleep_until(backoff_deadline) => self.on_backoff_timer(),
                _ = sleep_until(lookup_deadline) => {
                    self.spawn_lookup();
                    self.next_lookup = Some(Instant::now() + self.config.lookupd_poll_interval);
                }
                _ = sleep_until(stop_deadline) => {
                    if self.on_stop_deadline() {
                        break;
                    }
                }
            }

            if self.stopping.is_some() && self.connections.is_empty() {
                break;
            }
        }
        self.finish_stop();
    }

    fn on_engine_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Connected { peer, conn } => self.on_connected(peer, conn),
            EngineEvent::ConnectFailed { peer, conn, error } => {
                tracing::warn!(addr = %peer, conn = %conn, error = %error, "connect failed");
                self.observers.error.emit(&ErrorEvent {
                    addr: peer.clone(),
                    error,
                });
                self.on_peer_failed(peer);
            }
            EngineEvent::Reply { conn, id, action } => self.respond_claimed(conn, id, action),
            EngineEvent::HandlerDone { message, result } => self.on_handler_done(message, result),
            EngineEvent::Lookup(result) => self.on_lookup(result),
            EngineEvent::Reconnect(peer) => {
                if let Some(state) = self.peers.get_mut(&peer) {
                    state.reconnect_pending = false;
                }
                if self.stopping.is_none() && self.is_desired(&peer) {
                    self.dial(peer);
                }
            }
        }
    }

    fn on_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Message { conn, frame } => self.on_message(conn, frame),
            ConnectionEvent::Response { conn, payload } => {
                if let Some(entry) = self.connections.get(&conn) {
                    self.observers.response.emit(&ResponseEvent {
                        addr: entry.peer.clone(),
                        payload,
                    });
                }
            }
            ConnectionEvent::Heartbeat { conn } => {
                tracing::trace!(conn = %conn, "heartbeat answered");
            }
            ConnectionEvent::Error { conn, error } => {
                let Some(entry) = self.connections.get(&conn) else {
                    return;
                };
                tracing::warn!(conn = %conn, addr = %entry.peer, error = %error, "peer error");
                self.observers.error.emit(&ErrorEvent {
                    addr: entry.peer.clone(),
                    error: Error::Peer(error),
                });
            }
            ConnectionEvent::Closed { conn, error } => self.on_closed(conn, error),
        }
    }

    fn dial(&mut self, peer: PeerAddress) {
        let reconnect = self.config.connection.reconnect_backoff.clone();
        let state = self.peers.entry(peer.clone()).or_insert_with(|| PeerState {
            conn: None,
            dialing: false,
            reconnect_pending: false,
            reconnect: BackoffTimer::new(reconnect),
        });
        if state.conn.is_some() || state.dialing {
            return;
        }
        state.dialing = true;
        let id = ConnectionId(self.next_id);
        self.next_id += 1;
        tracing::debug!(addr = %peer, conn = %id, "dialing");

        let config = self.config.connection.clone();
        let sub = Command::Sub {
            topic: self.config.topic.clone(),
            channel: self.config.channel.clone(),
        };
        let conn_tx = self.conn_tx.clone();
        let engine_tx = self.engine_tx.clone();
        tokio::spawn(async move {
            let event = match connect_and_subscribe(id, peer.clone(), &config, sub, conn_tx).await
            {
                Ok(conn) => EngineEvent::Connected { peer, conn },
                Err(error) => EngineEvent::ConnectFailed {
                    peer,
                    conn: id,
                    error,
                },
            };
            if let Err(mpsc::error::SendError(EngineEvent::Connected { conn, .. })) =
                engine_tx.send(event).await
            {
                // Engine already gone.
                conn.close();
            }
        });
    }

    fn on_connected(&mut self, peer: PeerAddress, conn: ConnectionHandle) {
        if self.stopping.is_some() || !self.is_desired(&peer) {
            conn.close();
            self.on_peer_released(&peer);
            return;
        }
        if conn.is_closed() {
            tracing::warn!(addr = %peer, conn = %conn.id(), "connection closed during subscribe");
            self.on_peer_failed(peer);
            return;
        }
        let id = conn.id();
        if let Some(state) = self.peers.get_mut(&peer) {
            state.dialing = false;
            state.conn = Some(id);
            state.reconnect.success();
        }
        tracing::info!(addr = %peer, conn = %id, mode = %conn.mode(), "subscribed");
        if let Some(auth) = conn.auth() {
            self.observers.auth.emit(&AuthEvent {
                addr: peer.clone(),
                response: auth.clone(),
            });
        }
        self.connections.insert(
            id,
            Entry {
                handle: conn,
                peer,
                granted: 0,
                remaining: 0,
                outstanding: HashMap::new(),
                last_message: Instant::now(),
                received: 0,
                draining: false,
            },
        );
        metrics::gauge!("heron_client_connections").set(self.connections.len() as f64);
        self.redistribute();
    }

    // Dial or subscribe failed, or a live connection died: back off and retry.
    fn on_peer_failed(&mut self, peer: PeerAddress) {
        let Some(state) = self.peers.get_mut(&peer) else {
            return;
        };
        state.dialing = false;
        state.conn = None;
        if self.stopping.is_some() || !self.is_desired(&peer) {
            self.peers.remove(&peer);
            return;
        }
        let Some(state) = self.peers.get_mut(&peer) else {
            return;
        };
        state.reconnect.failure();
        if state.reconnect_pending {
            return;
        }
        state.reconnect_pending = true;
        let delay = state.reconnect.interval();
        tracing::info!(addr = %peer, delay_ms = delay.as_millis() as u64, "scheduling reconnect");
        let engine_tx = self.engine_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = engine_tx.send(EngineEvent::Reconnect(peer)).await;
        });
    }

    // The peer's connection went away on purpose.
    fn on_peer_released(&mut self, peer: &PeerAddress) {
        if let Some(state) = self.peers.get_mut(peer) {
            state.dialing = false;
            state.conn = None;
        }
        if !self.is_desired(peer) || self.stopping.is_some() {
            self.peers.remove(peer);
        }
    }

    fn is_desired(&self, peer: &PeerAddress) -> bool {
        self.static_peers.contains(peer) || self.discovered.contains(peer)
    }

    fn on_message(&mut self, conn: ConnectionId, frame: MessageFrame) {
        let Some(entry) = self.connections.get_mut(&conn) else {
            tracing::debug!(conn = %conn, id = %frame.id, "message for unknown connection");
            return;
        };
        entry.remaining = entry.remaining.saturating_sub(1);
        entry.last_message = Instant::now();
        entry.received += 1;
        self.counters.received += 1;
        let message = Message::new(frame, conn, entry.peer.clone(), self.engine_tx.clone());
        entry.outstanding.insert(message.id(), message.clone());

        if self.stopping.is_some() {
            // Nothing new is processed once stop was requested.
            message.claim();
            self.respond_claimed(
                conn,
                message.id(),
                ReplyAction::Requeue {
                    delay: Some(Duration::ZERO),
                    backoff: Some(false),
                },
            );
            return;
        }

        let max_attempts = self.config.max_attempts;
        if max_attempts > 0 && message.attempts() > max_attempts {
            tracing::warn!(
                id = %message.id(),
                attempts = message.attempts(),
                max_attempts,
                "giving up on message"
            );
            self.counters.given_up += 1;
            metrics::counter!("heron_client_messages_given_up_total").increment(1);
            self.observers.giving_up.emit(&message);
            if message.claim() {
                self.respond_claimed(conn, message.id(), ReplyAction::Finish);
            }
            return;
        }

        self.observers.message.emit(&message);
        let handler = self.handler.clone();
        let engine_tx = self.engine_tx.clone();
        tokio::spawn(async move {
            let work = message.clone();
            let result = match tokio::spawn(async move { handler.handle(work).await }).await {
                Ok(result) => result,
                Err(err) => Err(anyhow::anyhow!("handler panicked: {err}")),
            };
            let _ = engine_tx
                .send(EngineEvent::HandlerDone { message, result })
                .await;
        });

        if self.backoff.mode() == BackoffMode::Normal {
            if let Some(entry) = self.connections.get(&conn)
                && ready::needs_refresh(entry.granted, entry.remaining)
            {
                let granted = entry.granted;
                self.send_rdy(conn, granted);
            }
        } else {
            // The probe is in flight: take the credit back.
            self.redistribute();
        }
    }

    fn on_handler_done(&mut self, message: Message, result: anyhow::Result<Outcome>) {
        let action = match result {
            Ok(Outcome::Defer) => return,
            Ok(Outcome::Finish) => ReplyAction::Finish,
            Ok(Outcome::Requeue { delay, backoff }) => ReplyAction::Requeue { delay, backoff },
            Err(error) => {
                tracing::warn!(id = %message.id(), error = %format!("{error:#}"), "handler failed");
                self.observers.exception.emit(&ExceptionEvent {
                    message: message.clone(),
                    error,
                });
                ReplyAction::Requeue {
                    delay: None,
                    backoff: Some(true),
                }
            }
        };
        // The handler may have responded through the message already.
        if message.claim() {
            self.respond_claimed(message.connection(), message.id(), action);
        }
    }

    // Sends the wire command for a response whose message is already
    // marked responded, and feeds the backoff machine.
    fn respond_claimed(&mut self, conn: ConnectionId, id: MessageId, action: ReplyAction) {
        let requeue_delay = self
            .backoff
            .requeue_delay(self.config.requeue_delay, self.config.max_requeue_delay);
        let Some(entry) = self.connections.get_mut(&conn) else {
            tracing::debug!(conn = %conn, id = %id, "connection gone; response dropped");
            return;
        };
        let transition = match action {
            ReplyAction::Touch => {
                if entry.outstanding.contains_key(&id) {
                    let _ = entry.handle.send(Command::Touch(id));
                }
                return;
            }
            ReplyAction::Finish => {
                if entry.outstanding.remove(&id).is_none() {
                    return;
                }
                let _ = entry.handle.send(Command::Fin(id));
                self.counters.finished += 1;
                metrics::counter!("heron_client_messages_finished_total").increment(1);
                self.observers.finish.emit(&id);
                self.backoff.on_success()
            }
            ReplyAction::Requeue { delay, backoff } => {
                if entry.outstanding.remove(&id).is_none() {
                    return;
                }
                let delay = delay.unwrap_or(requeue_delay);
                let backoff = backoff.unwrap_or(self.config.backoff_on_requeue);
                let _ = entry.handle.send(Command::Req {
                    id,
                    delay_ms: delay.as_millis() as u64,
                });
                self.counters.requeued += 1;
                metrics::counter!("heron_client_messages_requeued_total").increment(1);
                self.observers.requeue.emit(&RequeueEvent { id, delay, backoff });
                if self.stopping.is_some() {
                    Transition::Unchanged
                } else if backoff {
                    self.backoff.on_failure()
                } else {
                    self.backoff.on_success()
                }
            }
        };
        if let Some(entry) = self.connections.get(&conn)
            && (entry.draining || self.stopping.is_some())
            && entry.outstanding.is_empty()
        {
            entry.handle.close();
        }
        if self.stopping.is_none() {
            self.apply(transition);
        }
    }

    fn apply(&mut self, transition: Transition) {
        match transition {
            Transition::Unchanged => return,
            Transition::Backoff(window) => {
                self.backoff_timer = Some((Instant::now() + window.interval, window.generation));
                tracing::info!(
                    level = self.backoff.level(),
                    interval_ms = window.interval.as_millis() as u64,
                    "backing off"
                );
            }
            Transition::Resumed => {
                self.backoff_timer = None;
                tracing::info!("backoff complete; resuming normal throughput");
            }
        }
        self.emit_backoff();
        self.redistribute();
    }

    fn on_backoff_timer(&mut self) {
        let Some((_, generation)) = self.backoff_timer.take() else {
            return;
        };
        if self.backoff.on_timer(generation) {
            tracing::debug!(level = self.backoff.level(), "testing throughput");
            self.emit_backoff();
            self.redistribute();
        }
    }

    fn emit_backoff(&self) {
        metrics::gauge!("heron_client_backoff_level").set(self.backoff.level() as f64);
        self.observers.backoff.emit(&BackoffEvent {
            mode: self.backoff.mode(),
            level: self.backoff.level(),
        });
    }

    fn on_closed(&mut self, conn: ConnectionId, error: Option<Error>) {
        let Some(entry) = self.connections.remove(&conn) else {
            return;
        };
        metrics::gauge!("heron_client_connections").set(self.connections.len() as f64);
        let expected = entry.draining || self.stopping.is_some();
        match error {
            Some(error) if !expected => {
                tracing::warn!(conn = %conn, addr = %entry.peer, error = %error, "connection lost");
                self.observers.error.emit(&ErrorEvent {
                    addr: entry.peer.clone(),
                    error,
                });
            }
            _ => tracing::info!(conn = %conn, addr = %entry.peer, "connection closed"),
        }
        // The peer redelivers whatever was outstanding; late responses for
        // those messages find no connection and are dropped.
        if self.probe == Some(conn) {
            self.probe = None;
        }
        if self.stopping.is_some() {
            self.on_peer_released(&entry.peer);
            return;
        }
        let transition = self
            .backoff
            .on_connection_failure(!expected && !entry.outstanding.is_empty());
        if transition == Transition::Unchanged {
            self.redistribute();
        } else {
            self.apply(transition);
        }
        if self.is_desired(&entry.peer) {
            self.on_peer_failed(entry.peer);
        } else {
            self.on_peer_released(&entry.peer);
        }
    }

    fn redistribute(&mut self) {
        if self.stopping.is_some() || self.connections.is_empty() {
            return;
        }
        let now = Instant::now();
        let idle_after = self.config.low_ready_idle_timeout;
        let credits: Vec<ConnectionCredit> = self
            .connections
            .iter()
            .filter(|(_, entry)| !entry.draining)
            .map(|(id, entry)| ConnectionCredit {
                id: *id,
                max_rdy: entry.handle.max_rdy_count(),
                granted: entry.granted,
                in_flight: entry.in_flight(),
                idle: now.duration_since(entry.last_message) > idle_after,
            })
            .collect();
        let plan = ready::distribute(
            self.config.max_in_flight,
            self.backoff.mode(),
            &credits,
            self.probe,
            &mut self.rng,
        );
        self.probe = plan.probe;
        // Lower first so the peers never see more than the budget in total.
        let (lower, raise): (Vec<_>, Vec<_>) = plan
            .targets
            .into_iter()
            .filter(|(id, target)| {
                self.connections
                    .get(id)
                    .is_some_and(|entry| entry.granted != *target)
            })
            .partition(|(id, target)| {
                self.connections
                    .get(id)
                    .is_some_and(|entry| *target < entry.granted)
            });
        for (id, target) in lower.into_iter().chain(raise) {
            self.send_rdy(id, target);
        }
    }

    fn send_rdy(&mut self, conn: ConnectionId, count: u32) {
        let Some(entry) = self.connections.get_mut(&conn) else {
            return;
        };
        entry.granted = count;
        entry.remaining = count;
        if entry.handle.send(Command::Rdy(count)).is_ok() {
            metrics::counter!("heron_client_rdy_sent_total").increment(1);
            tracing::trace!(conn = %conn, count, "RDY");
        }
    }

    fn spawn_lookup(&mut self) {
        let Some(discovery) = self.discovery.clone() else {
            return;
        };
        self.lookup_in_flight = true;
        let topic = self.config.topic.clone();
        let engine_tx = self.engine_tx.clone();
        tokio::spawn(async move {
            let result = discovery.lookup(&topic).await;
            let _ = engine_tx.send(EngineEvent::Lookup(result)).await;
        });
    }

    fn on_lookup(&mut self, result: anyhow::Result<Vec<PeerAddress>>) {
        self.lookup_in_flight = false;
        let peers = match result {
            Ok(peers) => peers,
            Err(err) => {
                tracing::warn!(
                    error = %format!("{err:#}"),
                    "lookup failed; keeping previous peers"
                );
                return;
            }
        };
        if self.stopping.is_some() {
            return;
        }
        let found: HashSet<PeerAddress> = peers.into_iter().collect();
        let mut removed: Vec<PeerAddress> = self
            .discovered
            .difference(&found)
            .filter(|peer| !self.static_peers.contains(*peer))
            .cloned()
            .collect();
        removed.sort();
        let mut added: Vec<PeerAddress> = found.difference(&self.discovered).cloned().collect();
        added.sort();
        self.discovered = found;

        for peer in removed {
            tracing::info!(addr = %peer, "peer no longer listed; draining");
            let conn = self.peers.get(&peer).and_then(|state| state.conn);
            match conn {
                Some(conn) => self.drain(conn),
                None => {
                    self.peers.remove(&peer);
                }
            }
        }
        for peer in added {
            let busy = self.peers.get(&peer).is_some_and(|state| {
                state.conn.is_some() || state.dialing || state.reconnect_pending
            });
            if !busy {
                self.dial(peer);
            }
        }
        self.redistribute();
    }

    fn drain(&mut self, conn: ConnectionId) {
        let Some(entry) = self.connections.get_mut(&conn) else {
            return;
        };
        entry.draining = true;
        entry.granted = 0;
        entry.remaining = 0;
        let _ = entry.handle.send(Command::Rdy(0));
        let _ = entry.handle.send(Command::Cls);
        if entry.outstanding.is_empty() {
            entry.handle.close();
        }
        if self.probe == Some(conn) {
            self.probe = None;
        }
    }

    fn begin_stop(&mut self, waiter: Option<oneshot::Sender<()>>) {
        if let Some(stopping) = &mut self.stopping {
            stopping.waiters.extend(waiter);
            return;
        }
        tracing::info!(
            connections = self.connections.len(),
            timeout_ms = self.config.shutdown_timeout.as_millis() as u64,
            "stopping consumer"
        );
        self.stopping = Some(Stopping {
            deadline: Instant::now() + self.config.shutdown_timeout,
            forced: false,
            waiters: waiter.into_iter().collect(),
        });
        self.backoff_timer = None;
        self.probe = None;
        for entry in self.connections.values_mut() {
            entry.granted = 0;
            entry.remaining = 0;
            let _ = entry.handle.send(Command::Rdy(0));
            let _ = entry.handle.send(Command::Cls);
            if entry.outstanding.is_empty() {
                entry.handle.close();
            }
        }
    }

    // Returns true once there is nothing left to wait for.
    fn on_stop_deadline(&mut self) -> bool {
        let Some(stopping) = &mut self.stopping else {
            return false;
        };
        if stopping.forced {
            tracing::warn!(
                connections = self.connections.len(),
                "connections did not close in time"
            );
            return true;
        }
        stopping.forced = true;
        stopping.deadline = Instant::now() + CLOSE_GRACE;

        let mut abandoned: Vec<(ConnectionId, MessageId)> = Vec::new();
        for (conn, entry) in &self.connections {
            for message in entry.outstanding.values() {
                if message.claim() {
                    abandoned.push((*conn, message.id()));
                }
            }
        }
        if !abandoned.is_empty() {
            tracing::warn!(
                count = abandoned.len(),
                "requeueing messages still in flight at shutdown"
            );
        }
        for (conn, id) in abandoned {
            self.respond_claimed(
                conn,
                id,
                ReplyAction::Requeue {
                    delay: Some(Duration::ZERO),
                    backoff: Some(false),
                },
            );
        }
        // Deferred messages that were already answered but never removed.
        for entry in self.connections.values_mut() {
            entry.outstanding.clear();
            entry.handle.close();
        }
        false
    }

    fn finish_stop(&mut self) {
        for entry in self.connections.values() {
            entry.handle.close();
        }
        self.connections.clear();
        metrics::gauge!("heron_client_connections").set(0.0);
        tracing::info!(
            received = self.counters.received,
            finished = self.counters.finished,
            requeued = self.counters.requeued,
            "consumer stopped"
        );
        self.observers.close.emit(&());
        if let Some(stopping) = self.stopping.take() {
            for waiter in stopping.waiters {
                let _ = waiter.send(());
            }
        }
    }

    fn stats(&self) -> ConsumerStats {
        let connections: Vec<ConnectionStats> = self
            .connections
            .iter()
            .map(|(id, entry)| ConnectionStats {
                id: *id,
                addr: entry.peer.clone(),
                ready: entry.granted,
                in_flight: entry.in_flight(),
                messages_received: entry.received,
                draining: entry.draining,
            })
            .collect();
        ConsumerStats {
            subscription: subscription(&self.config),
            backoff_mode: self.backoff.mode(),
            backoff_level: self.backoff.level(),
            total_ready: connections.iter().map(|conn| conn.ready as u64).sum(),
            in_flight: connections.iter().map(|conn| conn.in_flight as u64).sum(),
            messages_received: self.counters.received,
            messages_finished: self.counters.finished,
            messages_requeued: self.counters.requeued,
            messages_given_up: self.counters.given_up,
            stopping: self.stopping.is_some(),
            connections,
        }
    }

    fn is_starved(&self) -> bool {
        self.connections.values().any(|entry| {
            let threshold = (entry.granted as f64 * STARVED_RATIO).max(1.0);
            entry.in_flight() as f64 >= threshold
        })
    }
}

async fn connect_and_subscribe(
    id: ConnectionId,
    peer: PeerAddress,
    config: &ConnectionConfig,
    sub: Command,
    events: mpsc::Sender<ConnectionEvent>,
) -> Result<ConnectionHandle> {
    let conn = Connection::connect(id, peer, config).await?;
    let handle = conn.start(events);
    match handle.request(sub).await {
        Ok(_) => Ok(handle),
        Err(err) => {
            handle.close();
            Err(err)
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
