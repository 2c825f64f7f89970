//! AMQP 0-9-1 backend using `lapin`.
//!
//! ## Delivery model
//!
//! Push. `begin` declares the destination queue, sets the channel prefetch
//! and registers a consumer delegate; lapin invokes the delegate per
//! delivery. Each delivery is handed to the message callback on the tokio
//! runtime the consumer was created on, and the delegate waits for it, so
//! the in-flight count seen by `stop` covers every running handler.
//!
//! ## Acknowledgment
//!
//! `basic.ack` after the handler succeeds; `basic.nack` with requeue when
//! it fails. Deliveries that arrive after stop was requested are nacked
//! with requeue without reaching the handler.
//!
//! ## Queue semantics
//!
//! Queues are declared durable, non-exclusive and not auto-deleted, and
//! messages are published persistent (delivery mode 2) through the default
//! exchange with the queue name as routing key.
//!
//! ## Publishing
//!
//! The publish channel runs in confirm mode; a publish succeeds once the
//! broker confirmed it.

use lapin::{
    //
    acker::Acker as LapinAcker,
    message::DeliveryResult,
    options::{
        //
        BasicAckOptions,
        BasicCancelOptions,
        BasicConsumeOptions,
        BasicNackOptions,
        BasicPublishOptions,
        BasicQosOptions,
        ConfirmSelectOptions,
        QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties,
    Channel,
    Connection,
    ConnectionProperties,
};

use std::sync::Arc;

use bytes::Bytes;
use tokio::runtime::Handle;

use crate::{
    //
    log_debug,
    log_error,
    log_info,
    Acker,
    BusConfig,
    BusError,
    BusPublisher,
    CodecPtr,
    ConsumerOptions,
    ConsumerPtr,
    Dispatcher,
    ErrorCallback,
    MessageCallback,
    PayloadSender,
    PublisherPtr,
    PushConsumer,
    PushDelivery,
    Result,
};

/// Persistent delivery mode.
const PERSISTENT: u8 = 2;

const REPLY_SUCCESS: u16 = 200;

fn queue_options() -> QueueDeclareOptions {
    QueueDeclareOptions {
        passive: false,
        durable: true,
        exclusive: false,
        auto_delete: false,
        nowait: false,
    }
}

fn consumer_tag(queue: &str, consumer_name: &str) -> String {
    format!("{queue}-{consumer_name}")
}

fn amqp_err(context: String, err: lapin::Error) -> BusError {
    // ---
    let msg = format!("{context}: {err}");
    log_error!("{}", msg);
    BusError::Transport(msg)
}

/// Creates an AMQP connection and channel from the given configuration.
async fn create_amqp_connection(config: &BusConfig) -> Result<(Connection, Channel)> {
    // ---
    let uri = config.uri.as_str();
    if uri.is_empty() {
        return Err(BusError::Configuration(
            "AMQP transport requires URI".to_string(),
        ));
    }

    log_info!("Connecting to AMQP broker: {}", uri);
    let connection = Connection::connect(uri, ConnectionProperties::default())
        .await
        .map_err(|err| amqp_err("amqp: connection failed".into(), err))?;

    let channel = connection
        .create_channel()
        .await
        .map_err(|err| amqp_err("amqp: channel creation failed".into(), err))?;

    log_info!("Connected to AMQP broker, channel {}", channel.id());
    Ok((connection, channel))
}

async fn declare_queue(channel: &Channel, queue: &str) -> Result<()> {
    // ---
    channel
        .queue_declare(queue, queue_options(), FieldTable::default())
        .await
        .map_err(|err| amqp_err(format!("{queue}: queue declare failed"), err))?;
    log_debug!("{}: declared durable queue", queue);
    Ok(())
}

async fn close_connection(queue: &str, connection: &Connection, channel: &Channel) {
    // ---
    if let Err(_err) = channel.close(REPLY_SUCCESS, "Normal shutdown").await {
        log_debug!("{}: channel close failed: {}", queue, _err);
    }
    if let Err(_err) = connection.close(REPLY_SUCCESS, "Normal shutdown").await {
        log_debug!("{}: connection close failed: {}", queue, _err);
    }
}

struct AmqpAcker(LapinAcker);

#[async_trait::async_trait]
impl Acker for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        // ---
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map_err(|err| BusError::Transport(format!("amqp: ack failed: {err}")))
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        // ---
        let opts = BasicNackOptions {
            multiple: false,
            requeue,
        };
        self.0
            .nack(opts)
            .await
            .map_err(|err| BusError::Transport(format!("amqp: nack failed: {err}")))
    }
}

struct AmqpDispatcher {
    // ---
    queue: String,
    tag: String,
    prefetch: u16,
    connection: Connection,
    channel: Channel,

    /// Runtime the message callbacks run on.
    runtime: Handle,
}

#[async_trait::async_trait]
impl Dispatcher for AmqpDispatcher {
    // ---
    fn destination(&self) -> &str {
        &self.queue
    }

    async fn begin(&self, on_message: MessageCallback, on_error: ErrorCallback) -> Result<()> {
        // ---
        self.channel
            .basic_qos(self.prefetch, BasicQosOptions::default())
            .await
            .map_err(|err| amqp_err(format!("{}: basic.qos failed", self.queue), err))?;

        declare_queue(&self.channel, &self.queue).await?;

        let consumer = self
            .channel
            .basic_consume(
                &self.queue,
                &self.tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|err| amqp_err(format!("{}: basic.consume failed", self.queue), err))?;

        let runtime = self.runtime.clone();
        let queue = self.queue.clone();

        consumer.set_delegate(move |delivery: DeliveryResult| {
            let on_message = on_message.clone();
            let on_error = on_error.clone();
            let runtime = runtime.clone();
            let queue = queue.clone();

            async move {
                match delivery {
                    Ok(Some(delivery)) => {
                        let push = PushDelivery::new(delivery.data, Box::new(AmqpAcker(delivery.acker)));
                        if let Err(err) = runtime.spawn(on_message(push)).await {
                            on_error(BusError::Transport(format!(
                                "{queue}: message callback aborted: {err}"
                            )));
                        }
                    }
                    Ok(None) => {
                        log_debug!("{}: consumer cancelled", queue);
                    }
                    Err(err) => {
                        on_error(BusError::Transport(format!("{queue}: consumer error: {err}")));
                    }
                }
            }
        });

        log_info!("{}: consuming as {}", self.queue, self.tag);
        Ok(())
    }

    async fn end(&self) -> Result<()> {
        // ---
        self.channel
            .basic_cancel(&self.tag, BasicCancelOptions::default())
            .await
            .map_err(|err| amqp_err(format!("{}: basic.cancel failed", self.queue), err))
    }

    async fn close(&self) -> Result<()> {
        close_connection(&self.queue, &self.connection, &self.channel).await;
        Ok(())
    }
}

struct AmqpSender {
    // ---
    queue: String,
    content_type: &'static str,
    connection: Connection,
    channel: Channel,
}

#[async_trait::async_trait]
impl PayloadSender for AmqpSender {
    async fn send(&self, payload: Bytes) -> Result<()> {
        // ---
        let properties = BasicProperties::default()
            .with_delivery_mode(PERSISTENT)
            .with_content_type(self.content_type.into());

        let confirm = self
            .channel
            .basic_publish(
                "",          // default exchange
                &self.queue, // routing key = queue name
                BasicPublishOptions::default(),
                &payload,
                properties,
            )
            .await
            .map_err(|err| amqp_err(format!("{}: publish failed", self.queue), err))?;

        let confirmation = confirm
            .await
            .map_err(|err| amqp_err(format!("{}: publish confirm failed", self.queue), err))?;

        if confirmation.is_nack() {
            return Err(BusError::Transport(format!(
                "{}: broker rejected the message",
                self.queue
            )));
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        close_connection(&self.queue, &self.connection, &self.channel).await;
        Ok(())
    }
}

/// Creates an AMQP consumer for the queue `config.destination`.
///
/// # Errors
///
/// - [`BusError::Configuration`] if the URI is missing or no tokio runtime
///   is running
/// - [`BusError::Transport`] if the connection fails
pub async fn create_consumer<T>(
    config: &BusConfig,
    codec: CodecPtr<T>,
    options: ConsumerOptions,
) -> Result<ConsumerPtr<T>>
where
    T: Send + 'static,
{
    // ---
    options.validate()?;
    let runtime = Handle::try_current()
        .map_err(|err| BusError::Configuration(format!("amqp: no tokio runtime: {err}")))?;

    let (connection, channel) = create_amqp_connection(config).await?;
    let dispatcher = AmqpDispatcher {
        queue: config.destination.clone(),
        tag: consumer_tag(&config.destination, &config.consumer_name_or_generate()),
        prefetch: options.prefetch,
        connection,
        channel,
        runtime,
    };

    Ok(Arc::new(PushConsumer::new(dispatcher, codec, options)))
}

/// Creates an AMQP publisher for the queue `config.destination`.
pub async fn create_publisher<T>(config: &BusConfig, codec: CodecPtr<T>) -> Result<PublisherPtr<T>>
where
    T: Send + Sync + 'static,
{
    // ---
    let (connection, channel) = create_amqp_connection(config).await?;

    channel
        .confirm_select(ConfirmSelectOptions::default())
        .await
        .map_err(|err| amqp_err("amqp: confirm.select failed".into(), err))?;
    declare_queue(&channel, &config.destination).await?;

    let sender = AmqpSender {
        queue: config.destination.clone(),
        content_type: codec.content_type(),
        connection,
        channel,
    };

    Ok(Arc::new(BusPublisher::new(
        config.destination.clone(),
        codec,
        sender,
    )))
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn queues_survive_broker_restart() {
        // ---
        let opts = queue_options();
        assert!(opts.durable);
        assert!(!opts.auto_delete);
        assert!(!opts.exclusive);
    }

    #[test]
    fn consumer_tag_names_queue_and_member() {
        // ---
        assert_eq!(consumer_tag("orders", "worker-1"), "orders-worker-1");
    }

    #[tokio::test]
    async fn missing_uri_is_configuration_error() {
        // ---
        let config = BusConfig::memory("orders");
        let res = create_publisher(&config, crate::json_codec::<u32>()).await;
        assert!(matches!(res, Err(BusError::Configuration(_))));
    }
}
