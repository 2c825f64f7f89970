//! Redis Streams consumer-group example
//!
//! Two members of the `billing` group share the `orders` stream; each entry
//! is handled by exactly one of them.
//!
//! Run with: cargo run --example redis_stream --features transport_redis
//!
//! Requires: redis running on localhost:6379

use anyhow::Result;
use tokio::time::Duration;
use tracing_subscriber::{fmt as tracing_format, EnvFilter};

use mom_bus::{handler_fn, BusBuilder, CancellationScope, ConsumerPtr};

const REDIS_URI: &str = "redis://localhost:6379";

async fn member(name: &'static str) -> Result<ConsumerPtr<String>> {
    // ---
    let consumer = BusBuilder::<String>::new()
        .uri(REDIS_URI)
        .destination("orders")
        .group("billing")
        .consumer_name(name)
        .build_consumer()
        .await?;
    Ok(consumer)
}

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    tracing_format()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let scope = CancellationScope::new();
    let members = [member("billing-1").await?, member("billing-2").await?];

    for (idx, consumer) in members.iter().enumerate() {
        let handler = handler_fn(move |order: String, _cancel: CancellationScope| async move {
            println!("member {} handled {order}", idx + 1);
            Ok(())
        });
        consumer.start(handler, &scope).await?;
    }

    let publisher = BusBuilder::<String>::new()
        .uri(REDIS_URI)
        .destination("orders")
        .build_publisher()
        .await?;

    let batch: Vec<String> = (1..=6).map(|n| format!("order-{n}")).collect();
    publisher.publish_batch(&batch, &scope).await?;

    tokio::time::sleep(Duration::from_secs(2)).await;

    // Stopping the parent scope stops both members
    scope.cancel();
    for consumer in &members {
        consumer.close().await?;
    }
    publisher.close().await?;
    Ok(())
}
