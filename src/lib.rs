//! Broker-agnostic consume/publish lifecycle over message-oriented middleware
//!
//! This library gives every backend the same consumer and publisher
//! contract: start a handler on a destination, stop it with a bounded
//! quiescence wait, publish single messages or batches. Deliveries are
//! acknowledged only after the handler succeeds (at-least-once); handler
//! failures and undecodable payloads never stop the consumer.
//!
//! Backends are selected at build time through cargo features and at run
//! time through [`BusBuilder`]. The in-process backend is always available.

// Import all sub modules once...
mod builder;
mod cancel;
mod codec;
mod config;
mod domain;
mod error;
mod macros;
mod transport;

pub(crate) use macros::{
    //
    log_debug,
    log_error,
    log_info,
    log_warn,
};

// --- public re-exports
pub use builder::BusBuilder;
pub use cancel::CancellationScope;
pub use codec::{json_codec, Codec, CodecPtr, JsonCodec};
pub use error::{BusError, Result};

pub use config::{
    //
    BusConfig,
    ConsumerOptions,
    PoisonPolicy,
    TransportKind,
};

pub use domain::{
    //
    handler_fn,
    Acker,
    BusPublisher,
    Consumer,
    ConsumerPtr,
    ConsumerState,
    Delivery,
    Dispatcher,
    ErrorCallback,
    Fetcher,
    HandlerPtr,
    MessageCallback,
    MessageHandler,
    PayloadSender,
    Publisher,
    PublisherPtr,
    PullConsumer,
    PushConsumer,
    PushDelivery,
};

pub use transport::{
    //
    create_amqp_consumer,
    create_amqp_publisher,
    create_memory_consumer,
    create_memory_consumer_with_hub,
    create_memory_publisher,
    create_memory_publisher_with_hub,
    create_mqtt_consumer,
    create_mqtt_publisher,
    create_redis_consumer,
    create_redis_publisher,
    MemoryHub,
};
