// Delivered messages and the responses the application sends back for them.
use bytes::Bytes;
use heron_wire::{MessageFrame, MessageId};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::consumer::EngineEvent;
use crate::{ConnectionId, Error, PeerAddress, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReplyAction {
    Finish,
    Requeue {
        delay: Option<Duration>,
        backoff: Option<bool>,
    },
    Touch,
}

/// A message delivered by one connection.
///
/// Clones share the responded flag: once any clone finishes or requeues the
/// message, every other clone sees it as responded. Responding after the
/// owning connection died is a no-op; the peer has already forgotten the
/// session and will redeliver.
#[derive(Clone)]
pub struct Message {
    inner: Arc<Inner>,
}

struct Inner {
    frame: MessageFrame,
    conn: ConnectionId,
    addr: PeerAddress,
    responded: AtomicBool,
    engine: mpsc::Sender<EngineEvent>,
}

impl Message {
    pub(crate) fn new(
        frame: MessageFrame,
        conn: ConnectionId,
        addr: PeerAddress,
        engine: mpsc::Sender<EngineEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                frame,
                conn,
                addr,
                responded: AtomicBool::new(false),
                engine,
            }),
        }
    }

    pub fn id(&self) -> MessageId {
        self.inner.frame.id
    }

    pub fn body(&self) -> &Bytes {
        &self.inner.frame.body
    }

    /// Delivery attempts, as counted by the peer. Starts at 1.
    pub fn attempts(&self) -> u16 {
        self.inner.frame.attempts
    }

    /// Nanoseconds since the Unix epoch at which the peer received it.
    pub fn timestamp(&self) -> i64 {
        self.inner.frame.timestamp
    }

    pub fn connection(&self) -> ConnectionId {
        self.inner.conn
    }

    pub fn addr(&self) -> &PeerAddress {
        &self.inner.addr
    }

    pub fn has_responded(&self) -> bool {
        self.inner.responded.load(Ordering::Acquire)
    }

    /// Marks the message responded; false if it already was.
    pub(crate) fn claim(&self) -> bool {
        !self.inner.responded.swap(true, Ordering::AcqRel)
    }

    pub async fn finish(&self) -> Result<()> {
        if !self.claim() {
            return Err(Error::AlreadyResponded(self.id()));
        }
        self.reply(ReplyAction::Finish).await;
        Ok(())
    }

    /// Puts the message back for redelivery. Without a delay one is derived
    /// from the consumer's backoff level. `backoff` counts it as a failure.
    pub async fn requeue(&self, delay: Option<Duration>, backoff: bool) -> Result<()> {
        if !self.claim() {
            return Err(Error::AlreadyResponded(self.id()));
        }
        self.reply(ReplyAction::Requeue {
            delay,
            backoff: Some(backoff),
        })
        .await;
        Ok(())
    }

    /// Resets the peer's timeout for this message.
    pub async fn touch(&self) -> Result<()> {
        if self.has_responded() {
            return Err(Error::AlreadyResponded(self.id()));
        }
        self.reply(ReplyAction::Touch).await;
        Ok(())
    }

    async fn reply(&self, action: ReplyAction) {
        let event = EngineEvent::Reply {
            conn: self.inner.conn,
            id: self.id(),
            action,
        };
        // A stopped consumer has already requeued or abandoned the message.
        if self.inner.engine.send(event).await.is_err() {
            tracing::debug!(id = %self.id(), "consumer stopped; response dropped");
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.id())
            .field("attempts", &self.attempts())
            .field("timestamp", &self.timestamp())
            .field("body_len", &self.body().len())
            .field("conn", &self.inner.conn)
            .field("addr", &self.inner.addr)
            .field("responded", &self.has_responded())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(engine: mpsc::Sender<EngineEvent>) -> Message {
        let frame = MessageFrame {
            timestamp: 1_700_000_000_000_000_000,
            attempts: 2,
            id: MessageId(*b"0123456789abcdef"),
            body: Bytes::from_static(b"payload"),
        };
        Message::new(
            frame,
            ConnectionId(3),
            PeerAddress::new("127.0.0.1", 4150),
            engine,
        )
    }

    #[tokio::test]
    async fn responding_twice_is_an_error() {
        let (tx, mut rx) = mpsc::channel(4);
        let msg = message(tx);
        let clone = msg.clone();
        msg.finish().await.expect("finish");
        assert!(clone.has_responded());
        assert!(matches!(
            clone.requeue(None, false).await,
            Err(Error::AlreadyResponded(_))
        ));
        assert!(matches!(msg.touch().await, Err(Error::AlreadyResponded(_))));
        match rx.recv().await {
            Some(EngineEvent::Reply { conn, action, .. }) => {
                assert_eq!(conn, ConnectionId(3));
                assert_eq!(action, ReplyAction::Finish);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn touch_keeps_the_message_open() {
        let (tx, mut rx) = mpsc::channel(4);
        let msg = message(tx);
        msg.touch().await.expect("touch");
        msg.requeue(Some(Duration::from_secs(2)), true)
            .await
            .expect("requeue");
        assert!(matches!(
            rx.recv().await,
            Some(EngineEvent::Reply {
                action: ReplyAction::Touch,
                ..
            })
        ));
        assert!(matches!(
            rx.recv().await,
            Some(EngineEvent::Reply {
                action: ReplyAction::Requeue {
                    delay: Some(_),
                    backoff: Some(true)
                },
                ..
            })
        ));
    }

    #[tokio::test]
    async fn stopped_consumer_makes_responses_no_ops() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let msg = message(tx);
        msg.finish().await.expect("finish after stop is not an error");
        assert_eq!(msg.attempts(), 2);
        assert_eq!(msg.body().as_ref(), b"payload");
    }
}
