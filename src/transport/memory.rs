//! In-process backend.
//!
//! A pure in-process pull backend: one bounded tokio channel per
//! destination, held by a [`MemoryHub`]. It is intended primarily for
//! testing, local execution, and as the reference for consume/publish
//! semantics.
//!
//! ## Reference Semantics
//!
//! - A message published to a destination is delivered to exactly one of
//!   the consumers started on that destination (competing consumers).
//! - Delivery order per destination is publish order.
//! - Publishing waits while the destination's buffer is full.
//! - There is no native redelivery: a delivery whose handler failed is
//!   gone. Deliveries fetched but not processed because the consumer is
//!   stopping are put back.
//!
//! ## Non-Goals
//!
//! This backend does not emulate persistence, consumer groups or the
//! failure modes of any broker.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex, RwLock};

use crate::{
    // ---
    log_debug,
    log_warn,
    BusConfig,
    BusError,
    BusPublisher,
    CodecPtr,
    ConsumerOptions,
    ConsumerPtr,
    Delivery,
    Fetcher,
    PayloadSender,
    PublisherPtr,
    PullConsumer,
    Result,
};

struct MemoryQueue {
    tx: mpsc::Sender<Bytes>,

    /// Shared by competing consumers; held only for the duration of a fetch.
    rx: Mutex<mpsc::Receiver<Bytes>>,
}

/// Shared message bus for the in-process backend.
///
/// Simulates a broker within a single process. Consumers and publishers
/// created against the same hub exchange messages per destination name.
///
/// The factory functions without a hub argument use a process-global hub.
/// Tests that run in parallel construct their own:
///
/// ```
/// # use mom_bus::{BusBuilder, CancellationScope, MemoryHub};
/// # async fn example() -> mom_bus::Result<()> {
/// let hub = MemoryHub::new();
///
/// let publisher = BusBuilder::<u32>::new()
///     .destination("jobs")
///     .memory_hub(hub.clone())
///     .build_publisher()
///     .await?;
///
/// publisher.publish(&7, &CancellationScope::new()).await?;
/// # Ok(())
/// # }
/// ```
pub struct MemoryHub {
    // ---
    queues: RwLock<HashMap<String, Arc<MemoryQueue>>>,
}

impl MemoryHub {
    /// Create a new, empty hub.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The queue for `destination`, created on first use.
    ///
    /// Consumers pass their `channel_capacity`; publishers pass `None` and
    /// never decide the size of a queue a consumer has already created. A
    /// queue's capacity is fixed at creation, so a later consumer asking for
    /// a different size gets the existing queue and a warning.
    async fn queue(&self, destination: &str, capacity: Option<usize>) -> Arc<MemoryQueue> {
        // ---
        let existing = self.queues.read().await.get(destination).cloned();
        let queue = match existing {
            Some(queue) => queue,
            None => {
                let mut queues = self.queues.write().await;
                queues
                    .entry(destination.to_string())
                    .or_insert_with(|| {
                        let slots = capacity.unwrap_or_else(default_capacity);
                        log_debug!("{}: creating in-memory queue ({} slots)", destination, slots);
                        let (tx, rx) = mpsc::channel(slots);
                        Arc::new(MemoryQueue {
                            tx,
                            rx: Mutex::new(rx),
                        })
                    })
                    .clone()
            }
        };

        if let Some(wanted) = capacity {
            let actual = queue.tx.max_capacity();
            if wanted != actual {
                log_warn!(
                    "{}: queue already exists with {} slots, ignoring requested {}",
                    destination,
                    actual,
                    wanted
                );
            }
        }
        queue
    }

    /// Number of messages waiting on `destination`.
    pub async fn pending(&self, destination: &str) -> usize {
        // ---
        match self.queues.read().await.get(destination) {
            Some(queue) => queue.tx.max_capacity() - queue.tx.capacity(),
            None => 0,
        }
    }

    /// Buffer size of `destination`, if its queue exists.
    pub async fn capacity(&self, destination: &str) -> Option<usize> {
        self.queues
            .read()
            .await
            .get(destination)
            .map(|queue| queue.tx.max_capacity())
    }
}

fn default_capacity() -> usize {
    ConsumerOptions::default().channel_capacity
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self {
            queues: RwLock::new(HashMap::new()),
        }
    }
}

/// Process-global hub used by [`create_memory_consumer`] and
/// [`create_memory_publisher`].
static GLOBAL_HUB: OnceLock<Arc<MemoryHub>> = OnceLock::new();

fn global_hub() -> Arc<MemoryHub> {
    GLOBAL_HUB.get_or_init(MemoryHub::new).clone()
}

struct MemoryFetcher {
    destination: String,
    queue: Arc<MemoryQueue>,
}

#[async_trait::async_trait]
impl Fetcher for MemoryFetcher {
    // ---
    type Handle = Bytes;

    fn destination(&self) -> &str {
        &self.destination
    }

    async fn fetch(&mut self, max: usize, wait: Duration) -> Result<Vec<Delivery<Bytes>>> {
        // ---
        let mut batch = Vec::with_capacity(max);

        let received = tokio::time::timeout(wait, async {
            let mut rx = self.queue.rx.lock().await;
            rx.recv_many(&mut batch, max).await
        })
        .await;

        if let Ok(0) = received {
            return Err(BusError::Transport(format!(
                "{}: in-memory queue closed",
                self.destination
            )));
        }

        Ok(batch
            .into_iter()
            .map(|payload| Delivery::new(payload.clone(), payload))
            .collect())
    }

    async fn ack(&mut self, _handle: Bytes) -> Result<()> {
        Ok(())
    }

    async fn reject(&mut self, _handle: Bytes) -> Result<()> {
        // ---
        log_debug!("{}: no redelivery in memory, delivery dropped", self.destination);
        Ok(())
    }

    async fn release(&mut self, handle: Bytes) -> Result<()> {
        // ---
        if self.queue.tx.try_send(handle).is_err() {
            log_warn!("{}: queue full, unprocessed delivery dropped on stop", self.destination);
        }
        Ok(())
    }
}

struct MemorySender {
    destination: String,
    queue: Arc<MemoryQueue>,
}

#[async_trait::async_trait]
impl PayloadSender for MemorySender {
    async fn send(&self, payload: Bytes) -> Result<()> {
        // ---
        self.queue.tx.send(payload).await.map_err(|_| {
            BusError::Transport(format!("{}: in-memory queue closed", self.destination))
        })
    }
}

fn ensure_destination(config: &BusConfig) -> Result<()> {
    // ---
    if config.destination.is_empty() {
        return Err(BusError::Configuration("destination must not be empty".into()));
    }
    if config.group.is_some() {
        return Err(BusError::Configuration(
            "the in-memory backend has no consumer groups".into(),
        ));
    }
    Ok(())
}

/// Create an in-process consumer on the process-global hub.
pub async fn create_memory_consumer<T>(
    config: &BusConfig,
    codec: CodecPtr<T>,
    options: ConsumerOptions,
) -> Result<ConsumerPtr<T>>
where
    T: Send + 'static,
{
    create_memory_consumer_with_hub(config, codec, options, global_hub()).await
}

/// Create an in-process consumer on `hub`.
pub async fn create_memory_consumer_with_hub<T>(
    config: &BusConfig,
    codec: CodecPtr<T>,
    options: ConsumerOptions,
    hub: Arc<MemoryHub>,
) -> Result<ConsumerPtr<T>>
where
    T: Send + 'static,
{
    // ---
    ensure_destination(config)?;
    options.validate()?;
    log_debug!("{}: create memory consumer", config.destination);

    let queue = hub
        .queue(&config.destination, Some(options.channel_capacity))
        .await;
    let fetcher = MemoryFetcher {
        destination: config.destination.clone(),
        queue,
    };
    Ok(Arc::new(PullConsumer::new(fetcher, codec, options)))
}

/// Create an in-process publisher on the process-global hub.
pub async fn create_memory_publisher<T>(
    config: &BusConfig,
    codec: CodecPtr<T>,
) -> Result<PublisherPtr<T>>
where
    T: Send + Sync + 'static,
{
    create_memory_publisher_with_hub(config, codec, global_hub()).await
}

/// Create an in-process publisher on `hub`.
pub async fn create_memory_publisher_with_hub<T>(
    config: &BusConfig,
    codec: CodecPtr<T>,
    hub: Arc<MemoryHub>,
) -> Result<PublisherPtr<T>>
where
    T: Send + Sync + 'static,
{
    // ---
    ensure_destination(config)?;
    log_debug!("{}: create memory publisher", config.destination);

    let queue = hub.queue(&config.destination, None).await;
    let sender = MemorySender {
        destination: config.destination.clone(),
        queue,
    };
    Ok(Arc::new(BusPublisher::new(
        config.destination.clone(),
        codec,
        sender,
    )))
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    async fn fetcher(hub: &MemoryHub, destination: &str) -> MemoryFetcher {
        MemoryFetcher {
            destination: destination.into(),
            queue: hub.queue(destination, Some(8)).await,
        }
    }

    #[tokio::test]
    async fn empty_fetch_returns_after_wait() {
        // ---
        let hub = MemoryHub::new();
        let mut fetcher = fetcher(&hub, "idle").await;

        let batch = fetcher.fetch(10, Duration::from_millis(20)).await.unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn fetch_respects_batch_size_and_order() {
        // ---
        let hub = MemoryHub::new();
        let queue = hub.queue("ordered", Some(8)).await;
        for n in 0..5u8 {
            queue.tx.send(Bytes::from(vec![n])).await.unwrap();
        }

        let mut fetcher = fetcher(&hub, "ordered").await;
        let first = fetcher.fetch(3, Duration::from_millis(20)).await.unwrap();
        let rest = fetcher.fetch(10, Duration::from_millis(20)).await.unwrap();

        let ids: Vec<u8> = first.iter().chain(&rest).map(|d| d.payload[0]).collect();
        assert_eq!(first.len(), 3);
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn release_puts_delivery_back() {
        // ---
        let hub = MemoryHub::new();
        hub.queue("returns", Some(8))
            .await
            .tx
            .send(Bytes::from_static(b"1"))
            .await
            .unwrap();

        let mut fetcher = fetcher(&hub, "returns").await;
        let mut batch = fetcher.fetch(1, Duration::from_millis(20)).await.unwrap();
        assert_eq!(hub.pending("returns").await, 0);

        let delivery = batch.pop().unwrap();
        fetcher.release(delivery.handle).await.unwrap();
        assert_eq!(hub.pending("returns").await, 1);
    }

    #[tokio::test]
    async fn hubs_are_isolated() {
        // ---
        let a = MemoryHub::new();
        let b = MemoryHub::new();
        a.queue("shared-name", Some(8))
            .await
            .tx
            .send(Bytes::from_static(b"x"))
            .await
            .unwrap();

        assert_eq!(a.pending("shared-name").await, 1);
        assert_eq!(b.pending("shared-name").await, 0);
    }

    #[tokio::test]
    async fn publisher_keeps_consumer_capacity() {
        // ---
        let hub = MemoryHub::new();
        let config = BusConfig::memory("sized");
        let codec = crate::json_codec::<u32>();

        create_memory_consumer_with_hub(
            &config,
            codec.clone(),
            ConsumerOptions::default().with_channel_capacity(4),
            hub.clone(),
        )
        .await
        .unwrap();
        create_memory_publisher_with_hub(&config, codec, hub.clone())
            .await
            .unwrap();

        assert_eq!(hub.capacity("sized").await, Some(4));
    }

    #[tokio::test]
    async fn publisher_first_uses_default_capacity() {
        // ---
        let hub = MemoryHub::new();
        let config = BusConfig::memory("unsized");
        let codec = crate::json_codec::<u32>();

        assert_eq!(hub.capacity("unsized").await, None);
        create_memory_publisher_with_hub(&config, codec.clone(), hub.clone())
            .await
            .unwrap();
        create_memory_consumer_with_hub(
            &config,
            codec,
            ConsumerOptions::default().with_channel_capacity(4),
            hub.clone(),
        )
        .await
        .unwrap();

        assert_eq!(hub.capacity("unsized").await, Some(default_capacity()));
    }

    #[tokio::test]
    async fn group_is_rejected() {
        // ---
        let mut config = BusConfig::memory("orders");
        config.group = Some("billing".into());

        let res = create_memory_consumer_with_hub(
            &config,
            crate::json_codec::<u32>(),
            ConsumerOptions::default(),
            MemoryHub::new(),
        )
        .await;
        assert!(matches!(res, Err(BusError::Configuration(_))));
    }
}
