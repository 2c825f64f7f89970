// src/domain/contract.rs

//! Consumer, publisher and handler contracts.
//!
//! These traits are the whole surface callers program against. Every backend
//! provides its own implementation, composed from a native fetcher,
//! dispatcher or sender plus the shared lifecycle scaffolding; nothing here
//! refers to a concrete broker or client library.
//!
//! # Notes
//!
//! The traits use `async_trait`; rendered documentation shows explicit
//! lifetimes and a boxed `Future`. Treat the methods as plain `async fn`s.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use bytes::Bytes;

use crate::{BusError, CancellationScope, Result};

/// Lifecycle state of a consumer.
///
/// Transitions: `Stopped → Running → Stopping → Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    // ---
    /// No delivery loop or callback registration is active.
    Stopped,

    /// Deliveries are being fetched (pull) or dispatched (push).
    Running,

    /// `stop()` has triggered the scope and is waiting for in-flight work.
    Stopping,
}

/// Per-message processing function supplied at start time.
///
/// The handler receives the consumer's cancellation scope. Returning
/// `Ok(())` acknowledges the delivery. Returning [`BusError::Cancelled`]
/// ends a pull loop gracefully; any other error is a handler failure and
/// leaves the delivery to the backend's native redelivery.
///
/// Push backends may invoke the handler concurrently.
#[async_trait::async_trait]
pub trait MessageHandler<T: Send + 'static>: Send + Sync {
    async fn handle(&self, message: T, cancel: CancellationScope) -> Result<()>;
}

/// Shared handler pointer, stored once per start/stop cycle.
pub type HandlerPtr<T> = Arc<dyn MessageHandler<T>>;

// Adapter from async closures to `MessageHandler`
struct FnHandler<F, Fut, T> {
    func: F,
    _phantom: PhantomData<fn(T) -> Fut>,
}

#[async_trait::async_trait]
impl<F, Fut, T> MessageHandler<T> for FnHandler<F, Fut, T>
where
    F: Fn(T, CancellationScope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
    T: Send + 'static,
{
    async fn handle(&self, message: T, cancel: CancellationScope) -> Result<()> {
        (self.func)(message, cancel).await
    }
}

/// Wrap an async closure as a [`HandlerPtr`].
///
/// ```
/// use mom_bus::{handler_fn, BusError, CancellationScope};
///
/// let handler = handler_fn(|order_id: u64, _cancel: CancellationScope| async move {
///     if order_id == 0 {
///         return Err(BusError::handler("order id 0 is reserved"));
///     }
///     Ok(())
/// });
/// # let _ = handler;
/// ```
pub fn handler_fn<T, F, Fut>(func: F) -> HandlerPtr<T>
where
    F: Fn(T, CancellationScope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
    T: Send + 'static,
{
    Arc::new(FnHandler {
        func,
        _phantom: PhantomData,
    })
}

/// A consumer bound to one backend connection and one destination.
///
/// At most one delivery loop (or callback registration) is active per
/// consumer at any time. A consumer can be restarted after a clean stop.
#[async_trait::async_trait]
pub trait Consumer<T: Send + 'static>: Send + Sync {
    // ---
    /// Queue, topic, subject or stream this consumer reads from.
    fn destination(&self) -> &str;

    fn state(&self) -> ConsumerState;

    /// Store `handler`, derive a child scope from `cancel` and begin
    /// delivering.
    ///
    /// # Errors
    ///
    /// - [`BusError::InvalidState`] if the consumer is not stopped or was closed
    /// - [`BusError::Configuration`] / [`BusError::Transport`] if the backend
    ///   rejects the subscription; the consumer stays stopped
    async fn start(&self, handler: HandlerPtr<T>, cancel: &CancellationScope) -> Result<()>;

    /// Trigger the consumer's scope and wait until in-flight work quiesces.
    ///
    /// A no-op on a stopped consumer. The wait is bounded by `cancel` and by
    /// the configured shutdown timeout; if either fires first the error is
    /// returned and the consumer stays `Stopping` until a later `stop()`
    /// completes the wait. No handler invocation starts after a successful
    /// return.
    async fn stop(&self, cancel: &CancellationScope) -> Result<()>;

    /// Stop and release the backend connection. Further starts fail.
    async fn close(&self) -> Result<()>;
}

/// Shared consumer pointer.
pub type ConsumerPtr<T> = Arc<dyn Consumer<T>>;

/// A publisher bound to one backend connection and one destination.
///
/// Publishers hold no message history; encoding and validation happen
/// before any backend call, and there is no retry at this layer.
#[async_trait::async_trait]
pub trait Publisher<T: Send + Sync + 'static>: Send + Sync {
    // ---
    fn destination(&self) -> &str;

    /// Encode and send one message.
    ///
    /// # Errors
    ///
    /// - [`BusError::Validation`] for an absent message; nothing is sent
    /// - [`BusError::Transport`] when the backend send fails
    /// - [`BusError::Cancelled`] when `cancel` fires first
    async fn publish(&self, message: &T, cancel: &CancellationScope) -> Result<()>;

    /// Encode every message, then send them in order.
    ///
    /// Validation covers the whole batch before anything is sent. On a
    /// backend failure the error is [`BusError::PartialBatch`] and its
    /// `published` count says how many leading messages were accepted.
    async fn publish_batch(&self, messages: &[T], cancel: &CancellationScope) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Shared publisher pointer.
pub type PublisherPtr<T> = Arc<dyn Publisher<T>>;

/// Native send side of a backend, wrapped by [`BusPublisher`](crate::BusPublisher).
#[async_trait::async_trait]
pub trait PayloadSender: Send + Sync + 'static {
    // ---
    async fn send(&self, payload: Bytes) -> Result<()>;

    /// Send an already validated batch.
    ///
    /// The default issues one `send` per payload and stops at the first
    /// failure, reporting how many went out. Backends with a native batch
    /// primitive override this.
    async fn send_batch(&self, payloads: Vec<Bytes>, cancel: &CancellationScope) -> Result<()> {
        // ---
        let total = payloads.len();
        for (published, payload) in payloads.into_iter().enumerate() {
            let sent = match cancel.run(self.send(payload)).await {
                Ok(result) => result,
                Err(err) => Err(err),
            };
            if let Err(err) = sent {
                return Err(BusError::PartialBatch {
                    published,
                    total,
                    source: Box::new(err),
                });
            }
        }
        Ok(())
    }

    /// Release the backend connection.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
