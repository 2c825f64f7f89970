// src/domain/push.rs

//! Push adapter: the backend client owns dispatch and calls back per message.
//!
//! A backend implements [`Dispatcher`] (register callbacks, stop
//! dispatching) and hands each arrival to the message callback as a
//! [`PushDelivery`] carrying its own [`Acker`]. [`PushConsumer`] supplies
//! the decode → handle → ack/reject callback and the drain on stop.
//!
//! Callbacks may run concurrently; the only state they share is the
//! in-flight counter.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::sync::Notify;
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

/// Settles one pushed delivery with the backend.
#[async_trait::async_trait]
pub trait Acker: Send + Sync + 'static {
    // ---
    async fn ack(&self) -> Result<()>;

    /// Negative-acknowledge. `requeue = false` hands the delivery to the
    /// backend's dead-letter routing, if any.
    async fn reject(&self, requeue: bool) -> Result<()>;
}

/// One arrival handed to the message callback.
pub struct PushDelivery {
    pub payload: Bytes,
    pub acker: Box<dyn Acker>,
}

impl PushDelivery {
    pub fn new(payload: impl Into<Bytes>, acker: Box<dyn Acker>) -> Self {
        Self {
            payload: payload.into(),
            acker,
        }
    }
}

/// Per-message callback registered with the backend client.
pub type MessageCallback = Arc<dyn Fn(PushDelivery) -> BoxFuture<'static, ()> + Send + Sync>;

/// Callback for failures of the backend's dispatcher itself.
pub type ErrorCallback = Arc<dyn Fn(BusError) + Send + Sync>;

/// Native dispatch side of a push backend.
#[async_trait::async_trait]
pub trait Dispatcher: Send + Sync + 'static {
    // ---
    fn destination(&self) -> &str;

    /// Register both callbacks and ask the backend to begin dispatching.
    async fn begin(&self, on_message: MessageCallback, on_error: ErrorCallback) -> Result<()>;

    /// Ask the backend to stop dispatching new arrivals.
    ///
    /// Callbacks already running are drained by the caller.
    async fn end(&self) -> Result<()>;

    /// Release the backend connection.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Count of callbacks currently running, with a wake-up at zero.
#[derive(Default)]
pub(crate) struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

pub(crate) struct InFlightGuard(Arc<InFlight>);

impl InFlight {
    // ---
    pub(crate) fn enter(in_flight: &Arc<InFlight>) -> InFlightGuard {
        in_flight.count.fetch_add(1, Ordering::SeqCst);
        InFlightGuard(in_flight.clone())
    }

    pub(crate) fn current(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Resolves once no callback is running.
    pub(crate) async fn drained(&self) {
        // ---
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.current() == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

// Shared by every callback invocation of one start/stop cycle.
struct PushContext<T> {
    destination: String,
    codec: CodecPtr<T>,
    handler: HandlerPtr<T>,
    scope: CancellationScope,
    poison_policy: PoisonPolicy,
    in_flight: Arc<InFlight>,
}

impl<T: Send + 'static> PushContext<T> {
    // ---
    async fn dispatch(self: Arc<Self>, delivery: PushDelivery) {
        // ---
        let _guard = InFlight::enter(&self.in_flight);
        let PushDelivery { payload, acker } = delivery;

        if self.scope.is_cancelled() {
            log_debug!("{}: consumer stopping, requeueing arrival", self.destination);
            self.settle(acker.reject(true), "requeue").await;
            return;
        }

        let message = match self.codec.decode(&payload) {
            Ok(message) => message,
            Err(err) => {
                log_warn!("{}: dropping poison message: {}", self.destination, err);
                match self.poison_policy {
                    PoisonPolicy::Discard => self.settle(acker.ack(), "acknowledge").await,
                    PoisonPolicy::Reject => self.settle(acker.reject(false), "reject").await,
                }
                return;
            }
        };

        let outcome = AssertUnwindSafe(self.handler.handle(message, self.scope.clone()))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(())) => {
                self.settle(acker.ack(), "acknowledge").await;
            }
            Ok(Err(BusError::Cancelled)) => {
                log_debug!("{}: handler cancelled, requeueing", self.destination);
                self.settle(acker.reject(true), "requeue").await;
            }
            Ok(Err(err)) => {
                log_warn!("{}: handler failed, requeueing: {}", self.destination, err);
                self.settle(acker.reject(true), "requeue").await;
            }
            Err(_panic) => {
                log_error!("{}: handler panicked, requeueing", self.destination);
                self.settle(acker.reject(true), "requeue").await;
            }
        }
    }

    async fn settle(&self, op: BoxFuture<'_, Result<()>>, what: &str) {
        if let Err(err) = op.await {
            log_error!("{}: {} failed: {}", self.destination, what, err);
        }
    }
}

// Active callback registration. The watcher ends dispatch as soon as the
// derived scope fires, whether from `stop` or from a parent scope;
// quiescing waits for it and drains.
struct Registration {
    destination: String,
    in_flight: Arc<InFlight>,
    watcher: Option<JoinHandle<()>>,
}

impl Registration {
    // ---
    fn watch<D: Dispatcher>(
        destination: String,
        dispatcher: Arc<D>,
        scope: CancellationScope,
        in_flight: Arc<InFlight>,
    ) -> Self {
        // ---
        let watch_destination = destination.clone();
        let watcher = tokio::spawn(async move {
            scope.cancelled().await;
            log_debug!("{}: scope cancelled, ending dispatch", watch_destination);
            if let Err(err) = dispatcher.end().await {
                log_warn!("{}: ending dispatch failed: {}", watch_destination, err);
            }
        });

        Self {
            destination,
            in_flight,
            watcher: Some(watcher),
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}

#[async_trait::async_trait]
impl Quiesce for Registration {
    type Output = ();

    async fn quiesce(&mut self) -> Result<()> {
        // ---
        if let Some(watcher) = self.watcher.as_mut() {
            if let Err(err) = watcher.await {
                log_warn!("{}: dispatch watcher aborted: {}", self.destination, err);
            }
            self.watcher = None;
        }

        log_debug!(
            "{}: waiting for {} in-flight callbacks",
            self.destination,
            self.in_flight.current()
        );
        self.in_flight.drained().await;
        Ok(())
    }
}

/// [`Consumer`] built from a [`Dispatcher`].
pub struct PushConsumer<T, D: Dispatcher> {
    // ---
    destination: String,
    codec: CodecPtr<T>,
    options: ConsumerOptions,
    dispatcher: Arc<D>,
    lifecycle: Lifecycle<Registration>,
    released: AtomicBool,
}

impl<T, D> PushConsumer<T, D>
where
    T: Send + 'static,
    D: Dispatcher,
{
    pub fn new(dispatcher: D, codec: CodecPtr<T>, options: ConsumerOptions) -> Self {
        // ---
        let destination = dispatcher.destination().to_string();
        Self {
            lifecycle: Lifecycle::new(destination.clone(), options.shutdown_timeout),
            destination,
            codec,
            options,
            dispatcher: Arc::new(dispatcher),
            released: AtomicBool::new(false),
        }
    }
}

#[async_trait::async_trait]
impl<T, D> Consumer<T> for PushConsumer<T, D>
where
    T: Send + 'static,
    D: Dispatcher,
{
    fn destination(&self) -> &str {
        &self.destination
    }

    fn state(&self) -> ConsumerState {
        self.lifecycle.state()
    }

    async fn start(&self, handler: HandlerPtr<T>, cancel: &CancellationScope) -> Result<()> {
        // ---
        let dispatcher = self.dispatcher.clone();
        let destination = self.destination.clone();
        let codec = self.codec.clone();
        let poison_policy = self.options.poison_policy;

        self.lifecycle
            .start(cancel, |scope| async move {
                let in_flight = Arc::new(InFlight::default());

                let context = Arc::new(PushContext {
                    destination: destination.clone(),
                    codec,
                    handler,
                    scope: scope.clone(),
                    poison_policy,
                    in_flight: in_flight.clone(),
                });

                let on_message: MessageCallback =
                    Arc::new(move |delivery: PushDelivery| context.clone().dispatch(delivery).boxed());

                let error_destination = destination.clone();
                let on_error: ErrorCallback = Arc::new(move |err: BusError| {
                    log_error!("{}: dispatcher error: {}", error_destination, err);
                });

                dispatcher.begin(on_message, on_error).await?;

                Ok(Registration::watch(destination, dispatcher, scope, in_flight))
            })
            .await
    }

    async fn stop(&self, cancel: &CancellationScope) -> Result<()> {
        self.lifecycle.stop(cancel).await.map(|_| ())
    }

    async fn close(&self) -> Result<()> {
        // ---
        self.lifecycle.close().await?;

        if !self.released.swap(true, Ordering::AcqRel) {
            self.dispatcher.close().await?;
            log_debug!("{}: connection released", self.destination);
        }
        Ok(())
    }
}
