// Application handler contract.
use async_trait::async_trait;
use std::future::Future;
use std::marker::PhantomData;
use std::time::Duration;

use crate::Message;

/// What the consumer should do with a message once the handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Outcome {
    /// Send `FIN`.
    #[default]
    Finish,
    /// Send `REQ`. Without a delay the consumer derives one from the backoff
    /// level; without a `backoff` flag the consumer's `backoff_on_requeue`
    /// setting decides whether this counts as a failure.
    Requeue {
        delay: Option<Duration>,
        backoff: Option<bool>,
    },
    /// The application keeps the message and responds later through it.
    Defer,
}

impl Outcome {
    pub fn requeue() -> Self {
        Outcome::Requeue {
            delay: None,
            backoff: None,
        }
    }

    pub fn requeue_after(delay: Duration) -> Self {
        Outcome::Requeue {
            delay: Some(delay),
            backoff: None,
        }
    }
}

/// Processes delivered messages. Called concurrently from many tasks.
///
/// Returning `Err` requeues the message with backoff and reports the error to
/// the exception observers.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, message: Message) -> anyhow::Result<Outcome>;
}

/// Adapter turning an async closure into a [`MessageHandler`].
pub struct HandlerFn<F, Fut> {
    func: F,
    _marker: PhantomData<fn() -> Fut>,
}

/// ```
/// use heron_client::{Outcome, handler_fn};
///
/// let handler = handler_fn(|message: heron_client::Message| async move {
///     println!("{} bytes", message.body().len());
///     Ok(Outcome::Finish)
/// });
/// # let _ = handler;
/// ```
pub fn handler_fn<F, Fut>(func: F) -> HandlerFn<F, Fut>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Outcome>> + Send + 'static,
{
    HandlerFn {
        func,
        _marker: PhantomData,
    }
}

#[async_trait]
impl<F, Fut> MessageHandler for HandlerFn<F, Fut>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Outcome>> + Send + 'static,
{
    async fn handle(&self, message: Message) -> anyhow::Result<Outcome> {
        (self.func)(message).await
    }
}
