//! Redis backends.
//!
//! Currently supports:
//! - stream - Redis Streams consumer groups via the `redis` crate (stream.rs)

#[cfg(feature = "transport_redis")]
mod stream;

#[cfg(feature = "transport_redis")]
pub use stream::{
    //
    create_consumer as create_redis_consumer,
    create_publisher as create_redis_publisher,
};

#[cfg(not(feature = "transport_redis"))]
pub async fn create_redis_consumer<T>(
    _config: &crate::BusConfig,
    _codec: crate::CodecPtr<T>,
    _options: crate::ConsumerOptions,
) -> crate::Result<crate::ConsumerPtr<T>>
where
    T: Send + 'static,
{
    Err(crate::BusError::Configuration(
        "transport_redis feature is not enabled".into(),
    ))
}

#[cfg(not(feature = "transport_redis"))]
pub async fn create_redis_publisher<T>(
    _config: &crate::BusConfig,
    _codec: crate::CodecPtr<T>,
) -> crate::Result<crate::PublisherPtr<T>>
where
    T: Send + Sync + 'static,
{
    Err(crate::BusError::Configuration(
        "transport_redis feature is not enabled".into(),
    ))
}
