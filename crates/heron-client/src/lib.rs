// Consumer and producer engine for NSQ-style brokers.
// Discovers peers, keeps one TCP session per peer, and spreads a single
// in-flight budget across all of them.
//
// CLIENT-SIDE DESIGN INTENT
// -------------------------
// Everything that is shared between connections (the in-flight budget, the
// backoff level, the probe holder during a throughput test) lives in exactly
// one place: the consumer engine task. Nothing else mutates it.
//
// - Each connection is a reader task and a single writer task. The reader only
//   produces events into the engine's queue; it never touches engine state.
// - The writer is the only task that writes to the socket. Heartbeat answers go
//   through a separate control queue the writer always drains first, so a `NOP`
//   never waits behind finish/requeue traffic or a slow handler.
// - Handlers run on their own tasks and report back through the same queue.
//
// If we want more throughput, we add connections (peers) or raise
// `max_in_flight`; we do not add locks around shared state.
pub mod backoff;
pub mod config;
mod connection;
mod consumer;
pub mod discovery;
mod error;
mod handler;
mod message;
pub mod observer;
mod producer;
pub mod ready;

pub use config::{BackoffConfig, ConnectionConfig, ConsumerConfig};
pub use connection::{
    Connection, ConnectionEvent, ConnectionHandle, ConnectionId, ConnectionState,
};
pub use consumer::{ConnectionStats, Consumer, ConsumerHandle, ConsumerStats, Subscription};
pub use discovery::{Discovery, LookupdDiscovery, PeerAddress, StaticDiscovery};
pub use error::{Error, Result};
pub use handler::{HandlerFn, MessageHandler, Outcome, handler_fn};
pub use heron_transport::{Compression, TransportMode};
pub use heron_wire::{AuthResponse, IdentifyResponse, MessageId, PeerError};
pub use message::Message;
pub use observer::{Observers, Signal};
pub use producer::Producer;
