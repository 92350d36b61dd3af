// Consumer engine against in-process nsqd sessions: delivery, credit,
// backoff, discovery and shutdown.
mod common;

use async_trait::async_trait;
use common::{MockNsqd, MockOptions, consumer_config, message_id};
use heron_client::{
    BackoffConfig, Compression, Consumer, ConsumerConfig, ConsumerHandle, Discovery, Error,
    Message, Outcome, PeerAddress, StaticDiscovery, backoff::BackoffMode, handler_fn,
};
use heron_wire::Command;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};

const QUIET: Duration = Duration::from_millis(300);

// Handler that reports every message and answers with `outcome`.
fn recording(
    outcome: Outcome,
) -> (
    impl heron_client::MessageHandler,
    mpsc::UnboundedReceiver<Message>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = handler_fn(move |message: Message| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(message);
            Ok(outcome)
        }
    });
    (handler, rx)
}

async fn next_message(rx: &mut mpsc::UnboundedReceiver<Message>) -> Message {
    tokio::time::timeout(common::WAIT, rx.recv())
        .await
        .expect("handler timeout")
        .expect("handler dropped")
}

fn start<H: heron_client::MessageHandler>(config: ConsumerConfig, handler: H) -> ConsumerHandle {
    Consumer::new(config, handler)
        .expect("consumer")
        .start()
        .expect("start")
}

fn fast_backoff() -> BackoffConfig {
    BackoffConfig {
        base: Duration::from_millis(20),
        multiplier: 2.0,
        jitter: 0.0,
        min: Duration::ZERO,
        max: Duration::from_secs(1),
        max_level: 8,
    }
}

#[tokio::test]
async fn delivers_and_finishes() {
    let mut nsqd = MockNsqd::start().await;
    let (handler, mut delivered) = recording(Outcome::Finish);
    let consumer = Consumer::new(consumer_config(&[&nsqd]), handler).expect("consumer");
    let (finished_tx, mut finished) = mpsc::unbounded_channel();
    consumer.observers().finish.connect(move |id| {
        let _ = finished_tx.send(*id);
    });
    let handle = consumer.start().expect("start");

    let mut session = nsqd.next_session().await;
    assert_eq!(
        session.next_command().await,
        Command::Sub {
            topic: "events".to_string(),
            channel: "archive".to_string(),
        }
    );
    session.wait_for_rdy(1).await;
    session.send_message(message_id(1), 1, b"hello");

    let message = next_message(&mut delivered).await;
    assert_eq!(message.id(), message_id(1));
    assert_eq!(message.body().as_ref(), b"hello");
    assert_eq!(message.addr(), &nsqd.addr);
    session
        .wait_for(|command| *command == Command::Fin(message_id(1)))
        .await;
    assert_eq!(finished.recv().await, Some(message_id(1)));

    let stats = handle.stats().await.expect("stats");
    assert_eq!(stats.messages_received, 1);
    assert_eq!(stats.messages_finished, 1);
    assert_eq!(stats.connections.len(), 1);
    handle.stop().await;
}

#[tokio::test]
async fn heartbeat_is_answered_while_handler_is_busy() {
    let mut nsqd = MockNsqd::start().await;
    let release = Arc::new(Notify::new());
    let gate = release.clone();
    let handler = handler_fn(move |_message: Message| {
        let gate = gate.clone();
        async move {
            gate.notified().await;
            Ok(Outcome::Finish)
        }
    });
    let handle = start(consumer_config(&[&nsqd]), handler);

    let mut session = nsqd.next_session().await;
    session.wait_for_rdy(1).await;
    session.send_message(message_id(1), 1, b"slow");
    session.heartbeat();
    session.wait_for(|command| *command == Command::Nop).await;

    release.notify_one();
    session
        .wait_for(|command| *command == Command::Fin(message_id(1)))
        .await;
    handle.stop().await;
}

#[tokio::test]
async fn handler_failures_throttle_and_successes_recover() {
    let mut nsqd = MockNsqd::start().await;
    let handler = handler_fn(|message: Message| async move {
        if message.body().as_ref() == b"fail" {
            Err(anyhow::anyhow!("cannot process"))
        } else {
            Ok(Outcome::Finish)
        }
    });
    let mut config = consumer_config(&[&nsqd]);
    config.backoff = fast_backoff();
    let consumer = Consumer::new(config, handler).expect("consumer");
    let (exceptions_tx, mut exceptions) = mpsc::unbounded_channel();
    consumer.observers().exception.connect(move |event| {
        let _ = exceptions_tx.send(event.message.id());
    });
    let handle = consumer.start().expect("start");

    let mut session = nsqd.next_session().await;
    session.wait_for_rdy(1).await;
    for n in 1..=3 {
        session.send_message(message_id(n), 1, b"fail");
        session
            .wait_for(|command| matches!(command, Command::Req { id, .. } if *id == message_id(n)))
            .await;
        // Credit is withdrawn for the window, then one probe message is allowed.
        session.wait_for_rdy(0).await;
        session.wait_for_rdy(1).await;
        assert_eq!(exceptions.recv().await, Some(message_id(n)));
    }
    let stats = handle.stats().await.expect("stats");
    assert_eq!(stats.backoff_level, 3);
    assert_eq!(stats.backoff_mode, BackoffMode::ThroughputTest);
    assert_eq!(stats.total_ready, 1);
    assert_eq!(stats.messages_requeued, 3);

    for n in 4..=6 {
        session.send_message(message_id(n), 1, b"ok");
        session
            .wait_for(|command| *command == Command::Fin(message_id(n)))
            .await;
        session.wait_for_rdy(1).await;
    }
    let stats = handle.stats().await.expect("stats");
    assert_eq!(stats.backoff_level, 0);
    assert_eq!(stats.backoff_mode, BackoffMode::Normal);
    assert_eq!(stats.total_ready, 1);
    handle.stop().await;
}

#[tokio::test]
async fn requeue_without_backoff_keeps_credit() {
    let mut nsqd = MockNsqd::start().await;
    let (handler, mut delivered) = recording(Outcome::Requeue {
        delay: Some(Duration::from_millis(1500)),
        backoff: Some(false),
    });
    let handle = start(consumer_config(&[&nsqd]), handler);

    let mut session = nsqd.next_session().await;
    session.wait_for_rdy(1).await;
    session.send_message(message_id(1), 1, b"later");
    next_message(&mut delivered).await;
    let command = session
        .wait_for(|command| matches!(command, Command::Req { .. }))
        .await;
    assert_eq!(
        command,
        Command::Req {
            id: message_id(1),
            delay_ms: 1500,
        }
    );
    let stats = handle.stats().await.expect("stats");
    assert_eq!(stats.backoff_mode, BackoffMode::Normal);
    assert_eq!(stats.backoff_level, 0);
    assert!(!session.drain_for(QUIET).await.contains(&Command::Rdy(0)));
    handle.stop().await;
}

#[tokio::test]
async fn probe_moves_when_its_connection_dies() {
    let mut first = MockNsqd::start().await;
    let mut second = MockNsqd::start().await;
    let handler = handler_fn(|_message: Message| async move {
        Err::<Outcome, _>(anyhow::anyhow!("always fails"))
    });
    let mut config = consumer_config(&[&first, &second]);
    config.max_in_flight = 2;
    config.backoff = fast_backoff();
    config.backoff.base = Duration::from_millis(200);
    let handle = start(config, handler);

    let mut a = first.next_session().await;
    let mut b = second.next_session().await;
    a.wait_for_rdy(1).await;
    b.wait_for_rdy(1).await;

    a.send_message(message_id(1), 1, b"boom");
    a.wait_for(|command| matches!(command, Command::Req { .. }))
        .await;
    a.wait_for_rdy(0).await;
    b.wait_for_rdy(0).await;

    let a_holds_probe = tokio::select! {
        _ = a.wait_for_rdy(1) => true,
        _ = b.wait_for_rdy(1) => false,
    };
    let (holder, other) = if a_holds_probe {
        (&mut a, &mut b)
    } else {
        (&mut b, &mut a)
    };
    holder.hang_up();
    other.wait_for_rdy(1).await;

    let stats = handle.stats().await.expect("stats");
    assert_eq!(stats.backoff_mode, BackoffMode::ThroughputTest);
    assert_eq!(stats.total_ready, 1);
    handle.stop().await;
}

#[tokio::test]
async fn probe_leaves_a_quiet_peer_and_recovers_elsewhere() {
    let mut first = MockNsqd::start().await;
    let mut second = MockNsqd::start().await;
    let handler = handler_fn(|message: Message| async move {
        if message.body().as_ref() == b"boom" {
            Err(anyhow::anyhow!("cannot process"))
        } else {
            Ok(Outcome::Finish)
        }
    });
    let mut config = consumer_config(&[&first, &second]);
    config.max_in_flight = 2;
    config.backoff = fast_backoff();
    config.low_ready_idle_timeout = Duration::from_millis(150);
    config.redistribute_interval = Duration::from_millis(50);
    let handle = start(config, handler);

    let mut a = first.next_session().await;
    let mut b = second.next_session().await;
    a.wait_for_rdy(1).await;
    b.wait_for_rdy(1).await;

    a.send_message(message_id(1), 1, b"boom");
    a.wait_for(|command| matches!(command, Command::Req { .. }))
        .await;

    // Whoever gets the probe first never delivers; the credit has to move.
    let a_holds_probe = tokio::select! {
        _ = a.wait_for_rdy(1) => true,
        _ = b.wait_for_rdy(1) => false,
    };
    let other = if a_holds_probe { &mut b } else { &mut a };
    tokio::time::timeout(common::WAIT, other.wait_for_rdy(1))
        .await
        .expect("probe stayed on the quiet peer");

    other.send_message(message_id(2), 1, b"ok");
    other
        .wait_for(|command| *command == Command::Fin(message_id(2)))
        .await;
    let stats = handle.stats().await.expect("stats");
    assert_eq!(stats.backoff_level, 0);
    assert_eq!(stats.backoff_mode, BackoffMode::Normal);
    handle.stop().await;
}

#[tokio::test]
async fn budget_is_split_across_connections() {
    let mut first = MockNsqd::start().await;
    let mut second = MockNsqd::start().await;
    let (handler, _delivered) = recording(Outcome::Finish);
    let mut config = consumer_config(&[&first, &second]);
    config.max_in_flight = 10;
    let handle = start(config, handler);

    let mut a = first.next_session().await;
    let mut b = second.next_session().await;
    a.wait_for_rdy(5).await;
    b.wait_for_rdy(5).await;

    let stats = handle.stats().await.expect("stats");
    assert_eq!(stats.total_ready, 10);
    assert!(stats.connections.iter().all(|conn| conn.ready == 5));
    handle.stop().await;
}

#[tokio::test]
async fn credit_is_capped_by_peer_max_rdy_count() {
    let mut nsqd = MockNsqd::start_with(MockOptions {
        max_rdy_count: 3,
        ..MockOptions::default()
    })
    .await;
    let (handler, _delivered) = recording(Outcome::Finish);
    let mut config = consumer_config(&[&nsqd]);
    config.max_in_flight = 10;
    let handle = start(config, handler);

    let mut session = nsqd.next_session().await;
    session.wait_for_rdy(3).await;
    assert_eq!(handle.stats().await.expect("stats").total_ready, 3);
    handle.stop().await;
}

#[tokio::test]
async fn stop_requeues_messages_still_in_flight() {
    let mut nsqd = MockNsqd::start().await;
    let (handler, mut delivered) = recording(Outcome::Defer);
    let mut config = consumer_config(&[&nsqd]);
    config.shutdown_timeout = Duration::from_millis(300);
    let consumer = Consumer::new(config, handler).expect("consumer");
    let (closed_tx, mut closed) = mpsc::unbounded_channel();
    consumer.observers().close.connect(move |_| {
        let _ = closed_tx.send(());
    });
    let handle = consumer.start().expect("start");

    let mut session = nsqd.next_session().await;
    session.wait_for_rdy(1).await;
    session.send_message(message_id(7), 1, b"held");
    let message = next_message(&mut delivered).await;
    assert!(handle.is_starved().await.expect("starved"));

    let handle = Arc::new(handle);
    let stopper = {
        let handle = handle.clone();
        tokio::spawn(async move { handle.stop().await })
    };
    session.wait_for_rdy(0).await;
    session.wait_for(|command| *command == Command::Cls).await;
    session
        .wait_for(|command| {
            *command
                == Command::Req {
                    id: message_id(7),
                    delay_ms: 0,
                }
        })
        .await;
    session.closed().await;
    tokio::time::timeout(common::WAIT, stopper)
        .await
        .expect("stop timeout")
        .expect("stop task");

    assert_eq!(closed.recv().await, Some(()));
    assert!(matches!(
        message.finish().await,
        Err(Error::AlreadyResponded(_))
    ));
    // Stopping twice is harmless.
    handle.stop().await;
}

#[tokio::test]
async fn stop_waits_for_handlers_to_finish() {
    let mut nsqd = MockNsqd::start().await;
    let release = Arc::new(Notify::new());
    let gate = release.clone();
    let handler = handler_fn(move |_message: Message| {
        let gate = gate.clone();
        async move {
            gate.notified().await;
            Ok(Outcome::Finish)
        }
    });
    let handle = Arc::new(start(consumer_config(&[&nsqd]), handler));

    let mut session = nsqd.next_session().await;
    session.wait_for_rdy(1).await;
    session.send_message(message_id(2), 1, b"work");
    // Let the handler pick it up before stopping.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let stopper = {
        let handle = handle.clone();
        tokio::spawn(async move { handle.stop().await })
    };
    session.wait_for(|command| *command == Command::Cls).await;
    release.notify_one();
    let fin = session
        .wait_for(|command| matches!(command, Command::Fin(_) | Command::Req { .. }))
        .await;
    assert_eq!(fin, Command::Fin(message_id(2)));
    session.closed().await;
    stopper.await.expect("stop task");
}

#[tokio::test]
async fn responding_after_the_connection_died_is_a_no_op() {
    let mut nsqd = MockNsqd::start().await;
    let (handler, mut delivered) = recording(Outcome::Defer);
    let handle = start(consumer_config(&[&nsqd]), handler);

    let mut session = nsqd.next_session().await;
    session.wait_for_rdy(1).await;
    session.send_message(message_id(3), 1, b"orphan");
    let message = next_message(&mut delivered).await;
    session.hang_up();
    session.closed().await;

    // The static peer is redialled.
    let mut replacement = nsqd.next_session().await;
    replacement.wait_for_rdy(1).await;
    message.finish().await.expect("finish is not an error");
    assert!(
        !replacement
            .drain_for(QUIET)
            .await
            .contains(&Command::Fin(message_id(3)))
    );
    let stats = handle.stats().await.expect("stats");
    assert_eq!(stats.messages_finished, 0);
    handle.stop().await;
}

#[tokio::test]
async fn attempts_are_reported_and_exhausted_messages_given_up() {
    let mut nsqd = MockNsqd::start().await;
    let (handler, mut delivered) = recording(Outcome::Finish);
    let mut config = consumer_config(&[&nsqd]);
    config.max_attempts = 2;
    let consumer = Consumer::new(config, handler).expect("consumer");
    let (given_up_tx, mut given_up) = mpsc::unbounded_channel();
    consumer.observers().giving_up.connect(move |message| {
        let _ = given_up_tx.send((message.id(), message.attempts()));
    });
    let handle = consumer.start().expect("start");

    let mut session = nsqd.next_session().await;
    session.wait_for_rdy(1).await;
    session.send_message(message_id(1), 3, b"poison");
    session
        .wait_for(|command| *command == Command::Fin(message_id(1)))
        .await;
    assert_eq!(given_up.recv().await, Some((message_id(1), 3)));

    session.send_message(message_id(2), 2, b"retry");
    let message = next_message(&mut delivered).await;
    assert_eq!(message.id(), message_id(2));
    assert_eq!(message.attempts(), 2);

    let stats = handle.stats().await.expect("stats");
    assert_eq!(stats.messages_given_up, 1);
    handle.stop().await;
}

#[tokio::test]
async fn tls_and_snappy_are_negotiated() {
    let mut nsqd = MockNsqd::start_with(MockOptions {
        tls: true,
        snappy: true,
        ..MockOptions::default()
    })
    .await;
    let (handler, mut delivered) = recording(Outcome::Finish);
    let mut config = consumer_config(&[&nsqd]);
    config.connection.tls_v1 = true;
    config.connection.tls_insecure_skip_verify = true;
    config.connection.snappy = true;
    let handle = start(config, handler);

    let mut session = nsqd.next_session().await;
    assert!(session.mode.tls);
    assert_eq!(session.mode.compression, Compression::Snappy);
    session.wait_for_rdy(1).await;
    session.send_message(message_id(4), 1, b"secret");
    assert_eq!(next_message(&mut delivered).await.body().as_ref(), b"secret");
    session
        .wait_for(|command| *command == Command::Fin(message_id(4)))
        .await;
    handle.stop().await;
}

#[tokio::test]
async fn deflate_and_auth_are_negotiated() {
    let mut nsqd = MockNsqd::start_with(MockOptions {
        deflate: true,
        auth: true,
        ..MockOptions::default()
    })
    .await;
    let (handler, _delivered) = recording(Outcome::Finish);
    let mut config = consumer_config(&[&nsqd]);
    config.connection.deflate = true;
    config.connection.deflate_level = 3;
    config.connection.auth_secret = Some("s3cret".to_string());
    let consumer = Consumer::new(config, handler).expect("consumer");
    let (auth_tx, mut auth) = mpsc::unbounded_channel();
    consumer.observers().auth.connect(move |event| {
        let _ = auth_tx.send(event.response.identity.clone());
    });
    let handle = consumer.start().expect("start");

    let mut session = nsqd.next_session().await;
    assert_eq!(session.mode.compression, Compression::Deflate { level: 3 });
    assert_eq!(session.auth_secret.as_deref(), Some(&b"s3cret"[..]));
    session.wait_for_rdy(1).await;
    assert_eq!(auth.recv().await.as_deref(), Some("tester"));
    handle.stop().await;
}

#[tokio::test]
async fn custom_discovery_supplies_peers() {
    let mut nsqd = MockNsqd::start().await;
    let (handler, _delivered) = recording(Outcome::Finish);
    let config = consumer_config(&[]);
    let discovery = Arc::new(StaticDiscovery::new(vec![nsqd.addr.clone()]));
    let handle = Consumer::new(config, handler)
        .expect("consumer")
        .with_discovery(discovery)
        .start()
        .expect("start");

    let mut session = nsqd.next_session().await;
    session.wait_for_rdy(1).await;
    handle.stop().await;
}

struct SwitchableDiscovery {
    peers: Mutex<Vec<PeerAddress>>,
}

#[async_trait]
impl Discovery for SwitchableDiscovery {
    async fn lookup(&self, _topic: &str) -> anyhow::Result<Vec<PeerAddress>> {
        Ok(self.peers.lock().expect("peers").clone())
    }
}

#[tokio::test]
async fn peers_dropped_from_discovery_are_drained() {
    let mut nsqd = MockNsqd::start().await;
    let (handler, _delivered) = recording(Outcome::Finish);
    let mut config = consumer_config(&[]);
    config.lookupd_poll_interval = Duration::from_millis(100);
    config.lookupd_poll_jitter = 0.0;
    let discovery = Arc::new(SwitchableDiscovery {
        peers: Mutex::new(vec![nsqd.addr.clone()]),
    });
    let handle = Consumer::new(config, handler)
        .expect("consumer")
        .with_discovery(discovery.clone())
        .start()
        .expect("start");

    let mut session = nsqd.next_session().await;
    session.wait_for_rdy(1).await;
    discovery.peers.lock().expect("peers").clear();
    session.wait_for_rdy(0).await;
    session.wait_for(|command| *command == Command::Cls).await;
    session.closed().await;
    assert!(nsqd.no_session_within(QUIET).await);

    let stats = handle.stats().await.expect("stats");
    assert!(stats.connections.is_empty());
    handle.stop().await;
}

#[tokio::test]
async fn start_without_any_peer_source_is_rejected() {
    let (handler, _delivered) = recording(Outcome::Finish);
    let consumer = Consumer::new(ConsumerConfig::new("events", "archive"), handler)
        .expect("consumer");
    assert!(matches!(consumer.start(), Err(Error::Config(_))));
}
