//! AMQP backends.
//!
//! Currently supports:
//! - lapin - AMQP 0-9-1 (RabbitMQ) via the `lapin` crate (lapin.rs)

#[cfg(feature = "transport_lapin")]
mod lapin;

#[cfg(feature = "transport_lapin")]
pub use self::lapin::{
    //
    create_consumer as create_amqp_consumer,
    create_publisher as create_amqp_publisher,
};

#[cfg(not(feature = "transport_lapin"))]
pub async fn create_amqp_consumer<T>(
    _config: &crate::BusConfig,
    _codec: crate::CodecPtr<T>,
    _options: crate::ConsumerOptions,
) -> crate::Result<crate::ConsumerPtr<T>>
where
    T: Send + 'static,
{
    Err(crate::BusError::Configuration(
        "transport_lapin feature is not enabled".into(),
    ))
}

#[cfg(not(feature = "transport_lapin"))]
pub async fn create_amqp_publisher<T>(
    _config: &crate::BusConfig,
    _codec: crate::CodecPtr<T>,
) -> crate::Result<crate::PublisherPtr<T>>
where
    T: Send + Sync + 'static,
{
    Err(crate::BusError::Configuration(
        "transport_lapin feature is not enabled".into(),
    ))
}
