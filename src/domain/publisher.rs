// src/domain/publisher.rs

use std::sync::atomic::{AtomicBool, Ordering};

use crate::codec::{encode_batch, encode_for_publish};
use crate::{
    // ---
    log_debug,
    BusError,
    CancellationScope,
    CodecPtr,
    PayloadSender,
    Publisher,
    Result,
};

/// [`Publisher`] built from a backend [`PayloadSender`].
///
/// Encoding and validation happen here, before the sender is touched.
pub struct BusPublisher<T, S> {
    // ---
    destination: String,
    codec: CodecPtr<T>,
    sender: S,
    closed: AtomicBool,
}

impl<T, S> BusPublisher<T, S>
where
    T: Send + Sync + 'static,
    S: PayloadSender,
{
    pub fn new(destination: impl Into<String>, codec: CodecPtr<T>, sender: S) -> Self {
        Self {
            destination: destination.into(),
            codec,
            sender,
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_usable(&self, cancel: &CancellationScope) -> Result<()> {
        // ---
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::InvalidState(format!(
                "{}: publisher is closed",
                self.destination
            )));
        }
        if cancel.is_cancelled() {
            return Err(BusError::Cancelled);
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl<T, S> Publisher<T> for BusPublisher<T, S>
where
    T: Send + Sync + 'static,
    S: PayloadSender,
{
    fn destination(&self) -> &str {
        &self.destination
    }

    async fn publish(&self, message: &T, cancel: &CancellationScope) -> Result<()> {
        // ---
        self.ensure_usable(cancel)?;
        let payload = encode_for_publish(self.codec.as_ref(), message)?;

        cancel.run(self.sender.send(payload)).await??;
        log_debug!("{}: published 1 message", self.destination);
        Ok(())
    }

    async fn publish_batch(&self, messages: &[T], cancel: &CancellationScope) -> Result<()> {
        // ---
        self.ensure_usable(cancel)?;
        let payloads = encode_batch(self.codec.as_ref(), messages)?;
        if payloads.is_empty() {
            return Ok(());
        }

        let count = payloads.len();
        self.sender.send_batch(payloads, cancel).await?;
        log_debug!("{}: published {} messages", self.destination, count);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // ---
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.sender.close().await
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::json_codec;
    use bytes::Bytes;
    use std::sync::{Arc, Mutex};

    // Sender that accepts `capacity` payloads, then fails.
    #[derive(Clone)]
    struct CountingSender {
        sent: Arc<Mutex<Vec<Bytes>>>,
        capacity: usize,
    }

    impl CountingSender {
        fn new(capacity: usize) -> Self {
            Self {
                sent: Arc::new(Mutex::new(Vec::new())),
                capacity,
            }
        }
    }

    #[async_trait::async_trait]
    impl PayloadSender for CountingSender {
        async fn send(&self, payload: Bytes) -> Result<()> {
            let mut sent = self.sent.lock().unwrap();
            if sent.len() >= self.capacity {
                return Err(BusError::Transport("broker unavailable".into()));
            }
            sent.push(payload);
            Ok(())
        }
    }

    #[tokio::test]
    async fn absent_message_is_rejected_before_send() {
        // ---
        let sender = CountingSender::new(10);
        let publisher = BusPublisher::new("orders", json_codec::<Option<u32>>(), sender.clone());

        let err = publisher
            .publish(&None, &CancellationScope::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Validation(_)), "got {err:?}");
        assert!(sender.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalid_batch_item_sends_nothing() {
        // ---
        let sender = CountingSender::new(10);
        let publisher = BusPublisher::new("orders", json_codec::<Option<u32>>(), sender.clone());

        let err = publisher
            .publish_batch(&[Some(1), None], &CancellationScope::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Validation(_)));
        assert!(sender.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn batch_failure_reports_prefix() {
        // ---
        let sender = CountingSender::new(2);
        let publisher = BusPublisher::new("orders", json_codec::<u32>(), sender.clone());

        let err = publisher
            .publish_batch(&[1, 2, 3, 4], &CancellationScope::new())
            .await
            .unwrap_err();
        match err {
            BusError::PartialBatch {
                published, total, ..
            } => {
                assert_eq!(published, 2);
                assert_eq!(total, 4);
            }
            other => panic!("expected partial batch, got {other:?}"),
        }
        assert_eq!(sender.sent.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn transport_failure_reaches_caller() {
        // ---
        let publisher = BusPublisher::new("orders", json_codec::<u32>(), CountingSender::new(0));
        let err = publisher
            .publish(&1, &CancellationScope::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Transport(_)));
    }

    #[tokio::test]
    async fn cancelled_scope_and_closed_publisher_are_refused() {
        // ---
        let sender = CountingSender::new(10);
        let publisher = BusPublisher::new("orders", json_codec::<u32>(), sender.clone());

        let cancelled = CancellationScope::new();
        cancelled.cancel();
        let err = publisher.publish(&1, &cancelled).await.unwrap_err();
        assert!(err.is_cancelled());

        publisher.close().await.unwrap();
        let err = publisher
            .publish(&1, &CancellationScope::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::InvalidState(_)));
        assert!(sender.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_batch_is_a_noop() {
        // ---
        let sender = CountingSender::new(0);
        let publisher = BusPublisher::new("orders", json_codec::<u32>(), sender);
        publisher
            .publish_batch(&[], &CancellationScope::new())
            .await
            .unwrap();
    }
}
