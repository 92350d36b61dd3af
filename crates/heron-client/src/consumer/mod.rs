// Consumer: subscription settings, handler and discovery; `start` spawns the engine.
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::backoff::BackoffMode;
use crate::config::{
    CONNECTION_EVENT_QUEUE_DEPTH, ConsumerConfig, ENGINE_COMMAND_QUEUE_DEPTH, ENGINE_QUEUE_DEPTH,
};
use crate::{
    ConnectionId, Discovery, Error, LookupdDiscovery, MessageHandler, Observers, PeerAddress,
    Result,
};

mod engine;

pub(crate) use engine::EngineEvent;
use engine::{Engine, EngineCommand};

/// What a consumer reads: one channel of one topic, with an in-flight budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub topic: String,
    pub channel: String,
    pub max_in_flight: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStats {
    pub id: ConnectionId,
    pub addr: PeerAddress,
    /// Last RDY count sent.
    pub ready: u32,
    pub in_flight: u32,
    pub messages_received: u64,
    pub draining: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerStats {
    pub subscription: Subscription,
    pub backoff_mode: BackoffMode,
    pub backoff_level: u32,
    pub total_ready: u64,
    pub in_flight: u64,
    pub messages_received: u64,
    pub messages_finished: u64,
    pub messages_requeued: u64,
    pub messages_given_up: u64,
    pub stopping: bool,
    pub connections: Vec<ConnectionStats>,
}

/// A configured, not yet running consumer.
///
/// ```no_run
/// use heron_client::{Consumer, ConsumerConfig, Outcome, handler_fn};
///
/// # async fn run() -> anyhow::Result<()> {
/// let config = ConsumerConfig::new("events", "archive").add_nsqd_address("127.0.0.1:4150");
/// let consumer = Consumer::new(
///     config,
///     handler_fn(|message: heron_client::Message| async move {
///         println!("{:?}", message.body());
///         Ok(Outcome::Finish)
///     }),
/// )?;
/// consumer.observers().giving_up.connect(|message| {
///     eprintln!("giving up on {}", message.id());
/// });
/// let handle = consumer.start()?;
/// tokio::signal::ctrl_c().await?;
/// handle.stop().await;
/// # Ok(())
/// # }
/// ```
pub struct Consumer {
    config: ConsumerConfig,
    handler: Arc<dyn MessageHandler>,
    discovery: Option<Arc<dyn Discovery>>,
    observers: Arc<Observers>,
}

impl Consumer {
    pub fn new<H: MessageHandler>(config: ConsumerConfig, handler: H) -> Result<Self> {
        Self::with_shared_handler(config, Arc::new(handler))
    }

    pub fn with_shared_handler(
        config: ConsumerConfig,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Self> {
        config.validate_settings()?;
        let discovery: Option<Arc<dyn Discovery>> = if config.lookupd_http_addresses.is_empty() {
            None
        } else {
            let lookupd = LookupdDiscovery::new(&config.lookupd_http_addresses)
                .map_err(|err| Error::Config(format!("lookupd discovery: {err:#}")))?;
            Some(Arc::new(lookupd))
        };
        Ok(Self {
            config,
            handler,
            discovery,
            observers: Arc::new(Observers::default()),
        })
    }

    /// Replaces the lookupd discovery built from the configuration.
    pub fn with_discovery(mut self, discovery: Arc<dyn Discovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    pub fn observers(&self) -> &Observers {
        &self.observers
    }

    pub fn subscription(&self) -> Subscription {
        subscription(&self.config)
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Spawns the engine onto the current tokio runtime.
    pub fn start(self) -> Result<ConsumerHandle> {
        if self.config.nsqd_tcp_addresses.is_empty() && self.discovery.is_none() {
            return Err(Error::Config(
                "no nsqd addresses and no discovery configured".to_string(),
            ));
        }
        let static_peers = self
            .config
            .nsqd_tcp_addresses
            .iter()
            .map(|addr| {
                addr.parse::<PeerAddress>()
                    .map_err(|err| Error::Config(format!("nsqd address {addr:?}: {err}")))
            })
            .collect::<Result<Vec<_>>>()?;

        let (engine_tx, engine_rx) = mpsc::channel(ENGINE_QUEUE_DEPTH);
        let (conn_tx, conn_rx) = mpsc::channel(CONNECTION_EVENT_QUEUE_DEPTH);
        let (command_tx, command_rx) = mpsc::channel(ENGINE_COMMAND_QUEUE_DEPTH);
        tracing::info!(
            topic = %self.config.topic,
            channel = %self.config.channel,
            max_in_flight = self.config.max_in_flight,
            peers = static_peers.len(),
            discovery = self.discovery.is_some(),
            "starting consumer"
        );
        let engine = Engine::new(
            self.config,
            self.handler,
            self.discovery,
            self.observers.clone(),
            static_peers,
            engine_tx,
            conn_tx,
        );
        let task = tokio::spawn(engine.run(engine_rx, conn_rx, command_rx));
        Ok(ConsumerHandle {
            commands: command_tx,
            observers: self.observers,
            task,
        })
    }
}

fn subscription(config: &ConsumerConfig) -> Subscription {
    Subscription {
        topic: config.topic.clone(),
        channel: config.channel.clone(),
        max_in_flight: config.max_in_flight,
    }
}

/// Control side of a running consumer.
pub struct ConsumerHandle {
    commands: mpsc::Sender<EngineCommand>,
    observers: Arc<Observers>,
    task: JoinHandle<()>,
}

impl ConsumerHandle {
    pub fn observers(&self) -> &Observers {
        &self.observers
    }

    /// Stops fetching, waits for in-flight messages up to the shutdown
    /// timeout, requeues whatever is left, and closes every connection.
    /// Safe to call more than once.
    pub async fn stop(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.commands.send(EngineCommand::Stop(done_tx)).await.is_err() {
            return;
        }
        let _ = done_rx.await;
    }

    /// Waits for the engine task to exit.
    pub async fn join(self) {
        if let Err(err) = self.task.await {
            tracing::error!(error = %err, "consumer engine task failed");
        }
    }

    pub async fn stats(&self) -> Result<ConsumerStats> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(EngineCommand::Stats(tx))
            .await
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)
    }

    /// True when any connection is close to its RDY count; batch handlers
    /// use this to flush early.
    pub async fn is_starved(&self) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(EngineCommand::IsStarved(tx))
            .await
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
