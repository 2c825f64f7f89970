//! In-process consume/publish example
//!
//! Publishes a batch of orders to an in-process destination, consumes them
//! with a handler that rejects one order, then stops the consumer cleanly.
//!
//! Run with: RUST_LOG=mom_bus=debug cargo run --example memory_roundtrip

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::time::Duration;
use tracing_subscriber::{fmt as tracing_format, EnvFilter};

use mom_bus::{handler_fn, BusBuilder, BusError, CancellationScope, MemoryHub};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Order {
    id: u32,
    amount_cents: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    tracing_format()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let hub = MemoryHub::new();
    let scope = CancellationScope::new();

    let publisher = BusBuilder::<Order>::new()
        .destination("orders")
        .memory_hub(hub.clone())
        .build_publisher()
        .await?;

    let consumer = BusBuilder::<Order>::new()
        .destination("orders")
        .memory_hub(hub.clone())
        .build_consumer()
        .await?;

    // ---
    // Handler: order 3 is refused, everything else is "charged"
    let handler = handler_fn(|order: Order, _cancel: CancellationScope| async move {
        if order.id == 3 {
            return Err(BusError::handler(format!("order {} refused", order.id)));
        }
        println!("charged order {} ({} cents)", order.id, order.amount_cents);
        Ok(())
    });

    consumer.start(handler, &scope).await?;

    let orders: Vec<Order> = (1..=5)
        .map(|id| Order {
            id,
            amount_cents: u64::from(id) * 250,
        })
        .collect();
    publisher.publish_batch(&orders, &scope).await?;

    tokio::time::sleep(Duration::from_millis(500)).await;

    consumer.stop(&scope).await?;
    println!("consumer state after stop: {:?}", consumer.state());

    consumer.close().await?;
    publisher.close().await?;
    Ok(())
}
