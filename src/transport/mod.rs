//! Backend implementations.
//!
//! Each backend supplies the native half of one adapter pattern (a
//! `Fetcher`, a `Dispatcher`, a `PayloadSender`) and is exposed only through
//! constructor functions. Broker-backed modules sit behind cargo features;
//! with a feature off, its constructors return a configuration error.
//!
//! Domain code must not depend on backend-specific types.

mod amqp;
mod memory;
mod mqtt;
mod redis;

pub use memory::{
    //
    create_memory_consumer,
    create_memory_consumer_with_hub,
    create_memory_publisher,
    create_memory_publisher_with_hub,
    MemoryHub,
};

pub use self::redis::{
    //
    create_redis_consumer,
    create_redis_publisher,
};

pub use mqtt::{
    //
    create_mqtt_consumer,
    create_mqtt_publisher,
};

pub use amqp::{
    //
    create_amqp_consumer,
    create_amqp_publisher,
};
