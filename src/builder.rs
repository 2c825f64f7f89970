//! Consumer and publisher builder.
//!
//! Provides a fluent builder API for constructing consumers and publishers
//! with clear separation between required and optional configuration.

use std::sync::Arc;

use serde::{de::DeserializeOwned, Serialize};

use crate::{
    //
    json_codec,
    BusConfig,
    BusError,
    CodecPtr,
    ConsumerOptions,
    ConsumerPtr,
    MemoryHub,
    PublisherPtr,
    Result,
    TransportKind,
};

/// Builder for consumers and publishers of messages of type `T`.
///
/// Only the destination is required. The backend is taken from
/// [`transport_type()`](Self::transport_type) when given, otherwise it is
/// inferred from the URI scheme; no URI at all selects the in-process
/// backend.
///
/// # Examples
///
/// ## In-process publisher on an explicit hub
/// ```no_run
/// use mom_bus::{BusBuilder, CancellationScope, MemoryHub};
///
/// # async fn example() -> mom_bus::Result<()> {
/// let hub = MemoryHub::new();
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
///
/// ## Redis Streams consumer in a group
/// ```no_run
/// use mom_bus::{handler_fn, BusBuilder, CancellationScope};
///
/// # async fn example() -> mom_bus::Result<()> {
/// let consumer = BusBuilder::<String>::new()
///     .uri("redis://localhost:6379")
///     .destination("orders")
///     .group("billing")
///     .consumer_name("billing-1")
///     .build_consumer()
///     .await?;
///
/// let handler = handler_fn(|order: String, _scope| async move {
///     println!("{order}");
///     Ok(())
/// });
/// consumer.start(handler, &CancellationScope::new()).await?;
/// # Ok(())
/// # }
/// ```
pub struct BusBuilder<T> {
    // ---
    uri: Option<String>,
    destination: Option<String>,
    group: Option<String>,
    consumer_name: Option<String>,
    transport_type: Option<String>,
    keep_alive_secs: Option<u16>,
    options: ConsumerOptions,
    codec: Option<CodecPtr<T>>,
    hub: Option<Arc<MemoryHub>>,
}

impl<T> BusBuilder<T> {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            uri: None,
            destination: None,
            group: None,
            consumer_name: None,
            transport_type: None,
            keep_alive_secs: None,
            options: ConsumerOptions::default(),
            codec: None,
            hub: None,
        }
    }

    /// Set the broker URI.
    ///
    /// Examples:
    /// - `"redis://localhost:6379"`
    /// - `"mqtt://localhost:1883"`
    /// - `"amqp://localhost:5672/%2f"`
    pub fn uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }

    /// Set the queue, topic or stream name (required).
    pub fn destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    /// Set the consumer group.
    ///
    /// Only valid for backends that track per-group read positions.
    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Set this consumer's member name within its group.
    ///
    /// A unique name is generated when none is set.
    pub fn consumer_name(mut self, name: impl Into<String>) -> Self {
        self.consumer_name = Some(name.into());
        self
    }

    /// Set explicit transport type.
    ///
    /// Valid values: `"memory"`, `"redis"`, `"mqtt"` (`"rumqttc"`),
    /// `"amqp"` (`"lapin"`).
    pub fn transport_type(mut self, flag: impl Into<String>) -> Self {
        self.transport_type = Some(flag.into());
        self
    }

    /// Set broker keep-alive interval in seconds.
    ///
    /// If not specified, uses transport default.
    pub fn keep_alive_secs(mut self, secs: u16) -> Self {
        self.keep_alive_secs = Some(secs);
        self
    }

    /// Replace the consumer tuning options.
    pub fn options(mut self, options: ConsumerOptions) -> Self {
        self.options = options;
        self
    }

    /// Use `codec` instead of JSON.
    pub fn codec(mut self, codec: CodecPtr<T>) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Use `hub` instead of the process-global one (in-process backend only).
    pub fn memory_hub(mut self, hub: Arc<MemoryHub>) -> Self {
        self.hub = Some(hub);
        self
    }

    fn resolve_config(&self) -> Result<BusConfig> {
        // ---
        let destination = non_empty("destination", self.destination.as_deref())?
            .ok_or_else(|| BusError::Configuration("destination is required".into()))?;
        let group = non_empty("group", self.group.as_deref())?;
        let consumer_name = non_empty("consumer_name", self.consumer_name.as_deref())?;
        let uri = self.uri.clone().unwrap_or_default();

        let transport = match self.transport_type.as_deref() {
            Some(flag) => flag.parse::<TransportKind>()?,
            None => TransportKind::from_uri(&uri)?,
        };

        if group.is_some() && !transport.supports_groups() {
            return Err(BusError::Configuration(format!(
                "the {transport} backend has no consumer groups"
            )));
        }
        if self.hub.is_some() && transport != TransportKind::Memory {
            return Err(BusError::Configuration(format!(
                "memory_hub only applies to the memory backend, not {transport}"
            )));
        }

        Ok(BusConfig {
            uri,
            destination,
            group,
            consumer_name,
            transport,
            keep_alive_secs: self.keep_alive_secs,
        })
    }
}

impl<T> BusBuilder<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Build a consumer (consumes self).
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Configuration`] if:
    /// - the destination is missing or a name is empty
    /// - the transport type is unknown or cannot be inferred from the URI
    /// - a group is set for a backend without consumer groups
    /// - the options are invalid
    /// - the selected backend's feature is not enabled
    ///
    /// Backend connection failures are returned as [`BusError::Transport`].
    pub async fn build_consumer(self) -> Result<ConsumerPtr<T>> {
        // ---
        let config = self.resolve_config()?;
        self.options.validate()?;
        let codec = self.codec.unwrap_or_else(json_codec::<T>);

        match config.transport {
            TransportKind::Memory => match self.hub {
                Some(hub) => {
                    crate::create_memory_consumer_with_hub(&config, codec, self.options, hub).await
                }
                None => crate::create_memory_consumer(&config, codec, self.options).await,
            },
            TransportKind::Redis => crate::create_redis_consumer(&config, codec, self.options).await,
            TransportKind::Mqtt => crate::create_mqtt_consumer(&config, codec, self.options).await,
            TransportKind::Amqp => crate::create_amqp_consumer(&config, codec, self.options).await,
        }
    }

    /// Build a publisher (consumes self).
    ///
    /// # Errors
    ///
    /// Same configuration errors as [`build_consumer()`](Self::build_consumer).
    pub async fn build_publisher(self) -> Result<PublisherPtr<T>> {
        // ---
        let config = self.resolve_config()?;
        let codec = self.codec.unwrap_or_else(json_codec::<T>);

        match config.transport {
            TransportKind::Memory => match self.hub {
                Some(hub) => crate::create_memory_publisher_with_hub(&config, codec, hub).await,
                None => crate::create_memory_publisher(&config, codec).await,
            },
            TransportKind::Redis => crate::create_redis_publisher(&config, codec).await,
            TransportKind::Mqtt => crate::create_mqtt_publisher(&config, codec).await,
            TransportKind::Amqp => crate::create_amqp_publisher(&config, codec).await,
        }
    }
}

impl<T> Default for BusBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn non_empty(field: &str, value: Option<&str>) -> Result<Option<String>> {
    // ---
    match value {
        Some(v) if v.trim().is_empty() => Err(BusError::Configuration(format!(
            "{field} must not be empty"
        ))),
        other => Ok(other.map(str::to_string)),
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::{handler_fn, CancellationScope, ConsumerState};

    fn is_config_err<R>(res: Result<R>) -> bool {
        matches!(res, Err(BusError::Configuration(_)))
    }

    #[tokio::test]
    async fn missing_destination_is_rejected() {
        // ---
        let res = BusBuilder::<u32>::new().build_publisher().await;
        assert!(is_config_err(res));
    }

    #[tokio::test]
    async fn empty_names_are_rejected() {
        // ---
        let res = BusBuilder::<u32>::new().destination("  ").build_publisher().await;
        assert!(is_config_err(res));

        let res = BusBuilder::<u32>::new()
            .uri("redis://localhost:6379")
            .destination("orders")
            .group("")
            .build_consumer()
            .await;
        assert!(is_config_err(res));

        let res = BusBuilder::<u32>::new()
            .destination("orders")
            .consumer_name("")
            .build_consumer()
            .await;
        assert!(is_config_err(res));
    }

    #[tokio::test]
    async fn unknown_transport_type_is_rejected() {
        // ---
        let res = BusBuilder::<u32>::new()
            .destination("orders")
            .transport_type("kafka")
            .build_consumer()
            .await;
        assert!(is_config_err(res));

        let res = BusBuilder::<u32>::new()
            .uri("nats://localhost:4222")
            .destination("orders")
            .build_consumer()
            .await;
        assert!(is_config_err(res));
    }

    #[tokio::test]
    async fn group_requires_group_capable_backend() {
        // ---
        let res = BusBuilder::<u32>::new()
            .destination("orders")
            .group("billing")
            .build_consumer()
            .await;
        assert!(is_config_err(res));

        let res = BusBuilder::<u32>::new()
            .uri("amqp://localhost:5672/%2f")
            .destination("orders")
            .group("billing")
            .build_consumer()
            .await;
        assert!(is_config_err(res));
    }

    #[tokio::test]
    async fn invalid_options_are_rejected() {
        // ---
        let res = BusBuilder::<u32>::new()
            .destination("orders")
            .options(ConsumerOptions::default().with_prefetch(0))
            .build_consumer()
            .await;
        assert!(is_config_err(res));
    }

    #[tokio::test]
    async fn hub_with_broker_backend_is_rejected() {
        // ---
        let res = BusBuilder::<u32>::new()
            .uri("redis://localhost:6379")
            .destination("orders")
            .memory_hub(MemoryHub::new())
            .build_publisher()
            .await;
        assert!(is_config_err(res));
    }

    #[cfg(not(feature = "transport_lapin"))]
    #[tokio::test]
    async fn disabled_backend_is_configuration_error() {
        // ---
        let res = BusBuilder::<u32>::new()
            .uri("amqp://localhost:5672/%2f")
            .destination("orders")
            .build_publisher()
            .await;
        assert!(is_config_err(res));
    }

    #[tokio::test]
    async fn memory_is_the_default_backend() {
        // ---
        let hub = MemoryHub::new();
        let consumer = BusBuilder::<u32>::new()
            .destination("orders")
            .memory_hub(hub.clone())
            .build_consumer()
            .await
            .unwrap();
        let publisher = BusBuilder::<u32>::new()
            .destination("orders")
            .memory_hub(hub.clone())
            .build_publisher()
            .await
            .unwrap();

        assert_eq!(consumer.destination(), "orders");
        assert_eq!(consumer.state(), ConsumerState::Stopped);

        publisher.publish(&1, &CancellationScope::new()).await.unwrap();
        assert_eq!(hub.pending("orders").await, 1);

        let handler = handler_fn(|_msg: u32, _scope| async { Ok(()) });
        consumer.start(handler, &CancellationScope::new()).await.unwrap();
        consumer.close().await.unwrap();
    }
}
