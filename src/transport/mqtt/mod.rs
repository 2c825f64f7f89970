//! MQTT backends.
//!
//! Currently supports:
//! - rumqttc - MQTT 3.1.1 via the `rumqttc` crate (rumqttc.rs)

#[cfg(feature = "transport_rumqttc")]
mod rumqttc;

#[cfg(feature = "transport_rumqttc")]
pub use self::rumqttc::{
    //
    create_consumer as create_mqtt_consumer,
    create_publisher as create_mqtt_publisher,
};

#[cfg(not(feature = "transport_rumqttc"))]
pub async fn create_mqtt_consumer<T>(
    _config: &crate::BusConfig,
    _codec: crate::CodecPtr<T>,
    _options: crate::ConsumerOptions,
) -> crate::Result<crate::ConsumerPtr<T>>
where
    T: Send + 'static,
{
    Err(crate::BusError::Configuration(
        "transport_rumqttc feature is not enabled".into(),
    ))
}

#[cfg(not(feature = "transport_rumqttc"))]
pub async fn create_mqtt_publisher<T>(
    _config: &crate::BusConfig,
    _codec: crate::CodecPtr<T>,
) -> crate::Result<crate::PublisherPtr<T>>
where
    T: Send + Sync + 'static,
{
    Err(crate::BusError::Configuration(
        "transport_rumqttc feature is not enabled".into(),
    ))
}
