// tests/transport_memory.rs

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

use mom_bus::{
    // ---
    handler_fn,
    BusBuilder,
    BusError,
    CancellationScope,
    ConsumerOptions,
    ConsumerPtr,
    ConsumerState,
    HandlerPtr,
    MemoryHub,
    PublisherPtr,
};

const WAIT: Duration = Duration::from_secs(2);

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn fast_options() -> ConsumerOptions {
    ConsumerOptions::default()
        .with_wait_time(Duration::from_millis(50))
        .with_idle_delay(Duration::from_millis(5))
}

async fn consumer(hub: &Arc<MemoryHub>, destination: &str) -> ConsumerPtr<u32> {
    BusBuilder::<u32>::new()
        .destination(destination)
        .memory_hub(hub.clone())
        .options(fast_options())
        .build_consumer()
        .await
        .expect("failed to build consumer")
}

async fn publisher(hub: &Arc<MemoryHub>, destination: &str) -> PublisherPtr<u32> {
    BusBuilder::<u32>::new()
        .destination(destination)
        .memory_hub(hub.clone())
        .build_publisher()
        .await
        .expect("failed to build publisher")
}

/// Handler forwarding every message to a channel, failing on `fail_on`.
fn forwarding(fail_on: Option<u32>) -> (HandlerPtr<u32>, mpsc::UnboundedReceiver<u32>) {
    // ---
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = handler_fn(move |msg: u32, _cancel: CancellationScope| {
        let tx = tx.clone();
        async move {
            if Some(msg) == fail_on {
                return Err(BusError::handler(format!("refusing {msg}")));
            }
            tx.send(msg).map_err(BusError::handler)?;
            Ok(())
        }
    });
    (handler, rx)
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<u32>) -> u32 {
    timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for message")
        .expect("handler channel closed unexpectedly")
}

#[tokio::test]
async fn memory_publish_then_consume_delivers() {
    // ---
    // Arrange
    // ---
    init_logging();
    let hub = MemoryHub::new();
    let consumer = consumer(&hub, "orders").await;
    let publisher = publisher(&hub, "orders").await;
    let (handler, mut rx) = forwarding(None);
    let scope = CancellationScope::new();

    consumer.start(handler, &scope).await.expect("start failed");
    assert_eq!(consumer.state(), ConsumerState::Running);

    // ---
    // Act
    // ---
    publisher.publish(&42, &scope).await.expect("publish failed");

    // ---
    // Assert
    // ---
    assert_eq!(recv(&mut rx).await, 42);

    consumer.stop(&scope).await.expect("stop failed");
    assert_eq!(consumer.state(), ConsumerState::Stopped);
}

#[tokio::test]
async fn memory_batch_is_delivered_in_order() {
    // ---
    let hub = MemoryHub::new();
    let consumer = consumer(&hub, "batch").await;
    let publisher = publisher(&hub, "batch").await;
    let (handler, mut rx) = forwarding(None);
    let scope = CancellationScope::new();

    publisher
        .publish_batch(&[1, 2, 3, 4, 5], &scope)
        .await
        .expect("batch publish failed");
    consumer.start(handler, &scope).await.expect("start failed");

    let mut received = Vec::new();
    for _ in 0..5 {
        received.push(recv(&mut rx).await);
    }
    assert_eq!(received, vec![1, 2, 3, 4, 5]);

    consumer.close().await.expect("close failed");
}

#[tokio::test]
async fn memory_handler_failure_does_not_stop_consumer() {
    // ---
    let hub = MemoryHub::new();
    let consumer = consumer(&hub, "isolation").await;
    let publisher = publisher(&hub, "isolation").await;
    let (handler, mut rx) = forwarding(Some(2));
    let scope = CancellationScope::new();

    consumer.start(handler, &scope).await.expect("start failed");
    publisher
        .publish_batch(&[1, 2, 3], &scope)
        .await
        .expect("batch publish failed");

    assert_eq!(recv(&mut rx).await, 1);
    assert_eq!(recv(&mut rx).await, 3);
    assert_eq!(consumer.state(), ConsumerState::Running);

    consumer.stop(&scope).await.expect("stop failed");
}

#[tokio::test]
async fn memory_stop_waits_for_in_flight_handler() {
    // ---
    let hub = MemoryHub::new();
    let consumer = consumer(&hub, "shutdown").await;
    let publisher = publisher(&hub, "shutdown").await;
    let scope = CancellationScope::new();

    let (started_tx, mut started_rx) = mpsc::unbounded_channel();
    let finished = Arc::new(AtomicBool::new(false));
    let done = finished.clone();
    let handler = handler_fn(move |_msg: u32, _cancel: CancellationScope| {
        let started_tx = started_tx.clone();
        let done = done.clone();
        async move {
            let _ = started_tx.send(());
            tokio::time::sleep(Duration::from_millis(100)).await;
            done.store(true, Ordering::SeqCst);
            Ok(())
        }
    });

    consumer.start(handler, &scope).await.expect("start failed");
    publisher.publish(&1, &scope).await.expect("publish failed");
    timeout(WAIT, started_rx.recv())
        .await
        .expect("handler never started");

    timeout(WAIT, consumer.stop(&scope))
        .await
        .expect("stop hung")
        .expect("stop failed");

    assert!(finished.load(Ordering::SeqCst));
    assert_eq!(consumer.state(), ConsumerState::Stopped);
}

#[tokio::test]
async fn memory_absent_message_is_rejected() {
    // ---
    let hub = MemoryHub::new();
    let publisher = BusBuilder::<Option<u32>>::new()
        .destination("validation")
        .memory_hub(hub.clone())
        .build_publisher()
        .await
        .expect("failed to build publisher");
    let scope = CancellationScope::new();

    let err = publisher.publish(&None, &scope).await.unwrap_err();
    assert!(matches!(err, BusError::Validation(_)));

    let err = publisher
        .publish_batch(&[Some(1), None], &scope)
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::Validation(_)));

    assert_eq!(hub.pending("validation").await, 0);
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Heartbeat;

#[tokio::test]
async fn memory_unit_struct_message_is_delivered() {
    // ---
    let hub = MemoryHub::new();
    let consumer = BusBuilder::<Heartbeat>::new()
        .destination("heartbeats")
        .memory_hub(hub.clone())
        .options(fast_options())
        .build_consumer()
        .await
        .expect("failed to build consumer");
    let publisher = BusBuilder::<Heartbeat>::new()
        .destination("heartbeats")
        .memory_hub(hub.clone())
        .build_publisher()
        .await
        .expect("failed to build publisher");
    let scope = CancellationScope::new();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handler = handler_fn(move |beat: Heartbeat, _cancel: CancellationScope| {
        let tx = tx.clone();
        async move { tx.send(beat).map_err(BusError::handler) }
    });
    consumer.start(handler, &scope).await.expect("start failed");

    publisher
        .publish(&Heartbeat, &scope)
        .await
        .expect("unit struct must not count as absent");
    publisher
        .publish_batch(&[Heartbeat, Heartbeat], &scope)
        .await
        .expect("batch of unit structs rejected");

    for _ in 0..3 {
        let beat = timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for heartbeat")
            .expect("handler channel closed unexpectedly");
        assert_eq!(beat, Heartbeat);
    }

    consumer.stop(&scope).await.expect("stop failed");
}

#[tokio::test]
async fn memory_poison_message_is_skipped() {
    // ---
    let hub = MemoryHub::new();
    let consumer = consumer(&hub, "mixed").await;
    let numbers = publisher(&hub, "mixed").await;
    let text = BusBuilder::<String>::new()
        .destination("mixed")
        .memory_hub(hub.clone())
        .build_publisher()
        .await
        .expect("failed to build publisher");
    let (handler, mut rx) = forwarding(None);
    let scope = CancellationScope::new();

    text.publish(&"not a number".to_string(), &scope)
        .await
        .expect("publish failed");
    numbers.publish(&5, &scope).await.expect("publish failed");
    consumer.start(handler, &scope).await.expect("start failed");

    assert_eq!(recv(&mut rx).await, 5);
    assert_eq!(consumer.state(), ConsumerState::Running);

    consumer.stop(&scope).await.expect("stop failed");
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn memory_consumer_restarts_after_stop() {
    // ---
    let hub = MemoryHub::new();
    let consumer = consumer(&hub, "restart").await;
    let publisher = publisher(&hub, "restart").await;
    let scope = CancellationScope::new();

    let (handler, mut rx) = forwarding(None);
    consumer.start(handler, &scope).await.expect("start failed");
    consumer.stop(&scope).await.expect("stop failed");

    publisher.publish(&9, &scope).await.expect("publish failed");
    assert_eq!(hub.pending("restart").await, 1);

    let (handler, mut rx2) = forwarding(None);
    consumer.start(handler, &scope).await.expect("restart failed");
    assert_eq!(recv(&mut rx2).await, 9);
    assert!(rx.try_recv().is_err());

    consumer.close().await.expect("close failed");
}

#[tokio::test]
async fn memory_second_start_is_rejected() {
    // ---
    let hub = MemoryHub::new();
    let consumer = consumer(&hub, "reentrant").await;
    let scope = CancellationScope::new();

    let (first, _rx1) = forwarding(None);
    let (second, _rx2) = forwarding(None);
    consumer.start(first, &scope).await.expect("start failed");

    let err = consumer.start(second, &scope).await.unwrap_err();
    assert!(matches!(err, BusError::InvalidState(_)));
    assert_eq!(consumer.state(), ConsumerState::Running);

    consumer.stop(&scope).await.expect("stop failed");
}

#[tokio::test]
async fn memory_cancelling_parent_scope_stops_delivery() {
    // ---
    let hub = MemoryHub::new();
    let consumer = consumer(&hub, "parent").await;
    let publisher = publisher(&hub, "parent").await;
    let parent = CancellationScope::new();
    let (handler, mut rx) = forwarding(None);

    consumer.start(handler, &parent).await.expect("start failed");
    publisher
        .publish(&1, &CancellationScope::new())
        .await
        .expect("publish failed");
    assert_eq!(recv(&mut rx).await, 1);

    parent.cancel();
    assert_eq!(consumer.state(), ConsumerState::Stopping);

    let err = consumer
        .start(forwarding(None).0, &CancellationScope::new())
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::InvalidState(_)), "got {err:?}");

    // Published after the cancel: stays queued for the next consumer.
    publisher
        .publish(&2, &CancellationScope::new())
        .await
        .expect("publish failed");

    timeout(WAIT, consumer.stop(&CancellationScope::new()))
        .await
        .expect("stop hung")
        .expect("stop failed");
    assert_eq!(consumer.state(), ConsumerState::Stopped);
    assert_eq!(hub.pending("parent").await, 1);
}

#[tokio::test]
async fn memory_closed_consumer_cannot_start() {
    // ---
    let hub = MemoryHub::new();
    let consumer = consumer(&hub, "closed").await;
    let (handler, _rx) = forwarding(None);

    consumer.close().await.expect("close failed");
    consumer.close().await.expect("second close failed");

    let err = consumer
        .start(handler, &CancellationScope::new())
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::InvalidState(_)));
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Note {
    id: u32,
    content: String,
}

#[tokio::test]
async fn memory_struct_message_arrives_unchanged() {
    // ---
    let hub = MemoryHub::new();
    let scope = CancellationScope::new();
    let consumer = BusBuilder::<Note>::new()
        .destination("notes")
        .memory_hub(hub.clone())
        .options(fast_options())
        .build_consumer()
        .await
        .expect("failed to build consumer");
    let publisher = BusBuilder::<Note>::new()
        .destination("notes")
        .memory_hub(hub.clone())
        .build_publisher()
        .await
        .expect("failed to build publisher");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handler = handler_fn(move |note: Note, _cancel: CancellationScope| {
        let tx = tx.clone();
        async move {
            tx.send(note).map_err(BusError::handler)?;
            Ok(())
        }
    });
    consumer.start(handler, &scope).await.expect("start failed");

    let sent = Note {
        id: 1,
        content: "x".into(),
    };
    publisher.publish(&sent, &scope).await.expect("publish failed");

    let received = timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for message")
        .expect("handler channel closed unexpectedly");
    assert_eq!(received, sent);

    consumer.stop(&scope).await.expect("stop failed");
    assert!(rx.try_recv().is_err(), "handler invoked more than once");
}

#[tokio::test]
async fn memory_stop_while_fetching_is_prompt_and_final() {
    // ---
    let hub = MemoryHub::new();
    let consumer = BusBuilder::<u32>::new()
        .destination("idle")
        .memory_hub(hub.clone())
        .options(ConsumerOptions::default().with_wait_time(Duration::from_millis(500)))
        .build_consumer()
        .await
        .expect("failed to build consumer");
    let publisher = publisher(&hub, "idle").await;
    let (handler, mut rx) = forwarding(None);
    let scope = CancellationScope::new();

    consumer.start(handler, &scope).await.expect("start failed");
    tokio::time::sleep(Duration::from_millis(20)).await;

    timeout(Duration::from_millis(500), consumer.stop(&scope))
        .await
        .expect("stop exceeded the fetch wait bound")
        .expect("stop failed");

    publisher.publish(&3, &scope).await.expect("publish failed");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err(), "handler invoked after stop returned");
    assert_eq!(hub.pending("idle").await, 1);
}
