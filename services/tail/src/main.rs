// heron-tail: consume a topic/channel and print message bodies to stdout.
use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use heron_client::{Consumer, ConsumerConfig, Message, MessageHandler, Outcome};
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Notify;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "heron-tail")]
#[command(about = "Print messages consumed from a topic")]
struct Args {
    /// Topic to consume
    #[arg(long)]
    topic: String,

    /// Channel to consume on (defaults to an ephemeral tail channel)
    #[arg(long, default_value = "tail#ephemeral")]
    channel: String,

    /// nsqd TCP address (host:port), repeatable
    #[arg(long = "nsqd-tcp-address")]
    nsqd_tcp_addresses: Vec<String>,

    /// nsqlookupd HTTP address, repeatable
    #[arg(long = "lookupd-http-address")]
    lookupd_http_addresses: Vec<String>,

    /// Messages allowed in flight across all connections
    #[arg(long)]
    max_in_flight: Option<u32>,

    /// Exit after this many messages (0 = run until interrupted)
    #[arg(long, short = 'n', default_value = "0")]
    total_messages: u64,

    /// Print the message timestamp and attempts before the body
    #[arg(long)]
    print_details: bool,

    /// YAML config file (overrides HERON_CLIENT_CONFIG)
    #[arg(long, env = "HERON_CLIENT_CONFIG")]
    config: Option<String>,
}

struct Printer {
    details: bool,
    limit: u64,
    printed: AtomicU64,
    done: Arc<Notify>,
}

#[async_trait]
impl MessageHandler for Printer {
    async fn handle(&self, message: Message) -> anyhow::Result<Outcome> {
        let count = self.printed.fetch_add(1, Ordering::Relaxed) + 1;
        if self.limit > 0 && count > self.limit {
            // Over the limit while stopping; leave it for the next consumer.
            return Ok(Outcome::requeue_after(std::time::Duration::ZERO));
        }
        let mut out = std::io::stdout().lock();
        if self.details {
            write!(
                out,
                "{} {} {}: ",
                message.timestamp(),
                message.attempts(),
                message.id()
            )
            .context("write stdout")?;
        }
        out.write_all(message.body()).context("write stdout")?;
        out.write_all(b"\n").context("write stdout")?;
        out.flush().context("flush stdout")?;
        if self.limit > 0 && count == self.limit {
            self.done.notify_one();
        }
        Ok(Outcome::Finish)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config =
        ConsumerConfig::from_env_or_yaml(&args.topic, &args.channel, args.config.as_deref())
            .context("load consumer config")?;
    if !args.nsqd_tcp_addresses.is_empty() {
        config.nsqd_tcp_addresses = args.nsqd_tcp_addresses.clone();
    }
    if !args.lookupd_http_addresses.is_empty() {
        config.lookupd_http_addresses = args.lookupd_http_addresses.clone();
    }
    if let Some(max_in_flight) = args.max_in_flight {
        config.max_in_flight = max_in_flight;
    }
    config.validate().context("invalid consumer config")?;

    let done = Arc::new(Notify::new());
    let printer = Printer {
        details: args.print_details,
        limit: args.total_messages,
        printed: AtomicU64::new(0),
        done: done.clone(),
    };
    info!(
        topic = %config.topic,
        channel = %config.channel,
        nsqd = ?config.nsqd_tcp_addresses,
        lookupd = ?config.lookupd_http_addresses,
        "starting tail"
    );
    let consumer = Consumer::new(config, printer).context("build consumer")?;
    consumer.observers().error.connect(|event| {
        warn!(addr = %event.addr, error = %event.error, "consumer error");
    });
    let handle = consumer.start().context("start consumer")?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("listen for ctrl-c")?;
            info!("interrupted; stopping");
        }
        _ = done.notified() => info!(total = args.total_messages, "message limit reached"),
    }
    handle.stop().await;
    handle.join().await;
    Ok(())
}
