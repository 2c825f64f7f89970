// src/domain/pull.rs

//! Pull adapter: one spawned delivery loop per started consumer.
//!
//! A backend implements [`Fetcher`] (fetch a batch, acknowledge one
//! delivery) and gets the full consume contract from [`PullConsumer`]:
//! start/stop guards, poison handling, failure isolation and a loop that
//! exits promptly once the consumer's scope fires.
//!
//! The loop task owns the fetcher while it runs and hands it back when it
//! exits, which is what lets a stopped consumer be started again.

use std::panic::AssertUnwindSafe;
use std::time::Duration;

use bytes::Bytes;
use futures_util::FutureExt;
use tokio::task::JoinHandle;

use crate::domain::lifecycle::{Lifecycle, Quiesce};
use crate::{
    // ---
    log_debug,
    log_error,
    log_warn,
    BusError,
    CancellationScope,
    CodecPtr,
    Consumer,
    ConsumerOptions,
    ConsumerState,
    HandlerPtr,
    PoisonPolicy,
    Result,
};

/// One fetched payload plus the backend token needed to settle it.
#[derive(Debug)]
pub struct Delivery<H> {
    pub payload: Bytes,
    pub handle: H,
}

impl<H> Delivery<H> {
    pub fn new(payload: impl Into<Bytes>, handle: H) -> Self {
        Self {
            payload: payload.into(),
            handle,
        }
    }
}

/// Native fetch side of a pull backend.
///
/// All methods take `&mut self`: the fetcher is owned by exactly one loop
/// at a time. `fetch` may be dropped mid-wait when the consumer's scope
/// fires, so it must leave the fetcher usable.
#[async_trait::async_trait]
pub trait Fetcher: Send + 'static {
    // ---
    /// Backend token identifying one delivery (stream entry id, packet, ...).
    type Handle: Send + 'static;

    fn destination(&self) -> &str;

    /// Prepare to receive: create the consumer group, subscribe, etc.
    ///
    /// Called on every start; must tolerate an earlier successful call.
    async fn open(&mut self) -> Result<()> {
        Ok(())
    }

    /// Fetch up to `max` deliveries, waiting at most about `wait` for the
    /// first one. An empty vector means nothing was pending.
    async fn fetch(&mut self, max: usize, wait: Duration) -> Result<Vec<Delivery<Self::Handle>>>;

    /// Remove the delivery from future redelivery.
    async fn ack(&mut self, handle: Self::Handle) -> Result<()>;

    /// Settle a delivery whose handler failed (or a poison message under
    /// [`PoisonPolicy::Reject`]).
    ///
    /// The default leaves it outstanding for the backend's own redelivery.
    async fn reject(&mut self, handle: Self::Handle) -> Result<()> {
        drop(handle);
        Ok(())
    }

    /// Hand back a delivery that was fetched but never processed because
    /// the consumer is stopping.
    async fn release(&mut self, handle: Self::Handle) -> Result<()> {
        self.reject(handle).await
    }

    /// Release the backend connection.
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

// Join handle of a running loop; quiescing yields the fetcher back.
//
// Handler and fetch panics are caught inside the loop. A panic anywhere
// else (ack, reject, release) aborts the task and the fetcher goes with
// it: `quiesce` then reports `Transport`, the consumer ends `Stopped` and
// a later `start` fails with `InvalidState` because no connection is left.
struct LoopHandle<F>(JoinHandle<F>);

#[async_trait::async_trait]
impl<F: Fetcher> Quiesce for LoopHandle<F> {
    type Output = F;

    async fn quiesce(&mut self) -> Result<F> {
        // ---
        (&mut self.0)
            .await
            .map_err(|err| BusError::Transport(format!("delivery loop aborted: {err}")))
    }
}

/// [`Consumer`] built from a [`Fetcher`].
pub struct PullConsumer<T, F: Fetcher> {
    // ---
    destination: String,
    codec: CodecPtr<T>,
    options: ConsumerOptions,

    /// The fetcher while no loop is running.
    idle: tokio::sync::Mutex<Option<F>>,

    lifecycle: Lifecycle<LoopHandle<F>>,
}

impl<T, F> PullConsumer<T, F>
where
    T: Send + 'static,
    F: Fetcher,
{
    pub fn new(fetcher: F, codec: CodecPtr<T>, options: ConsumerOptions) -> Self {
        // ---
        let destination = fetcher.destination().to_string();
        Self {
            lifecycle: Lifecycle::new(destination.clone(), options.shutdown_timeout),
            destination,
            codec,
            options,
            idle: tokio::sync::Mutex::new(Some(fetcher)),
        }
    }
}

#[async_trait::async_trait]
impl<T, F> Consumer<T> for PullConsumer<T, F>
where
    T: Send + 'static,
    F: Fetcher,
{
    fn destination(&self) -> &str {
        &self.destination
    }

    fn state(&self) -> ConsumerState {
        self.lifecycle.state()
    }

    async fn start(&self, handler: HandlerPtr<T>, cancel: &CancellationScope) -> Result<()> {
        // ---
        let idle = &self.idle;
        let codec = self.codec.clone();
        let options = self.options.clone();
        let destination = self.destination.clone();

        self.lifecycle
            .start(cancel, |scope| async move {
                let mut fetcher = idle.lock().await.take().ok_or_else(|| {
                    BusError::InvalidState(format!("{destination}: connection already released"))
                })?;

                if let Err(err) = fetcher.open().await {
                    *idle.lock().await = Some(fetcher);
                    return Err(err);
                }

                let pull_loop = PullLoop {
                    destination,
                    fetcher,
                    codec,
                    handler,
                    options,
                    scope,
                };
                Ok(LoopHandle(tokio::spawn(pull_loop.run())))
            })
            .await
    }

    async fn stop(&self, cancel: &CancellationScope) -> Result<()> {
        // ---
        if let Some(fetcher) = self.lifecycle.stop(cancel).await? {
            *self.idle.lock().await = Some(fetcher);
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // ---
        let fetcher = match self.lifecycle.close().await? {
            Some(fetcher) => Some(fetcher),
            None => self.idle.lock().await.take(),
        };

        if let Some(mut fetcher) = fetcher {
            fetcher.close().await?;
            log_debug!("{}: connection released", self.destination);
        }
        Ok(())
    }
}

enum Flow {
    Continue,
    Stop,
}

// State owned by the spawned delivery task.
struct PullLoop<T, F: Fetcher> {
    destination: String,
    fetcher: F,
    codec: CodecPtr<T>,
    handler: HandlerPtr<T>,
    options: ConsumerOptions,
    scope: CancellationScope,
}

impl<T, F> PullLoop<T, F>
where
    T: Send + 'static,
    F: Fetcher,
{
    async fn run(mut self) -> F {
        // ---
        log_debug!("{}: delivery loop running", self.destination);

        while !self.scope.is_cancelled() {
            let fetch = AssertUnwindSafe(
                self.fetcher
                    .fetch(self.options.batch_size, self.options.wait_time),
            )
            .catch_unwind();

            let fetched = match self.scope.run(fetch).await {
                Err(_cancelled) => break,
                Ok(Ok(fetched)) => fetched,
                Ok(Err(_panic)) => Err(BusError::Transport("fetch panicked".into())),
            };

            let deliveries = match fetched {
                Err(err) => {
                    log_error!("{}: fetch failed: {}", self.destination, err);
                    if self.scope.sleep(self.options.error_delay).await.is_err() {
                        break;
                    }
                    continue;
                }
                Ok(deliveries) => deliveries,
            };

            if deliveries.is_empty() {
                if self.scope.sleep(self.options.idle_delay).await.is_err() {
                    break;
                }
                continue;
            }

            let mut pending = deliveries.into_iter();
            for delivery in pending.by_ref() {
                if self.scope.is_cancelled() {
                    self.release(delivery.handle).await;
                    break;
                }
                if let Flow::Stop = self.process(delivery).await {
                    break;
                }
            }
            for delivery in pending {
                self.release(delivery.handle).await;
            }
        }

        log_debug!("{}: delivery loop exited", self.destination);
        self.fetcher
    }

    async fn process(&mut self, delivery: Delivery<F::Handle>) -> Flow {
        // ---
        let Delivery { payload, handle } = delivery;

        let message = match self.codec.decode(&payload) {
            Ok(message) => message,
            Err(err) => {
                log_warn!("{}: dropping poison message: {}", self.destination, err);
                self.settle_poison(handle).await;
                return Flow::Continue;
            }
        };

        let outcome = AssertUnwindSafe(self.handler.handle(message, self.scope.clone()))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(())) => {
                match self.fetcher.ack(handle).await {
                    Ok(()) => {
                        log_debug!("{}: delivery acknowledged", self.destination);
                    }
                    Err(err) => {
                        log_error!("{}: acknowledge failed: {}", self.destination, err);
                    }
                }
                Flow::Continue
            }
            Ok(Err(BusError::Cancelled)) if self.scope.is_cancelled() => {
                self.release(handle).await;
                Flow::Stop
            }
            Ok(Err(err)) => {
                log_warn!("{}: handler failed, leaving for redelivery: {}", self.destination, err);
                self.reject(handle).await;
                Flow::Continue
            }
            Err(_panic) => {
                log_error!("{}: handler panicked, leaving for redelivery", self.destination);
                self.reject(handle).await;
                Flow::Continue
            }
        }
    }

    async fn settle_poison(&mut self, handle: F::Handle) {
        // ---
        match self.options.poison_policy {
            PoisonPolicy::Discard => {
                if let Err(err) = self.fetcher.ack(handle).await {
                    log_error!("{}: acknowledge of poison message failed: {}", self.destination, err);
                }
            }
            PoisonPolicy::Reject => self.reject(handle).await,
        }
    }

    async fn reject(&mut self, handle: F::Handle) {
        if let Err(err) = self.fetcher.reject(handle).await {
            log_error!("{}: reject failed: {}", self.destination, err);
        }
    }

    async fn release(&mut self, handle: F::Handle) {
        if let Err(err) = self.fetcher.release(handle).await {
            log_error!("{}: release failed: {}", self.destination, err);
        }
    }
}
