//! MQTT backend using `rumqttc`.
//!
//! ## Delivery model
//!
//! Pull. The consumer's fetcher owns the MQTT `EventLoop` and polls it from
//! inside `fetch`, so the crate's delivery loop is the only task that ever
//! touches the connection. Connection is lazy: the first poll connects.
//!
//! ## Acknowledgment
//!
//! Subscriptions use QoS 1 with manual acknowledgment: the `PUBACK` for a
//! publish is queued only after the handler succeeds. A publish whose
//! handler failed is never acknowledged; the broker redelivers it when the
//! session reconnects, which requires a persistent session (set a consumer
//! name).
//!
//! ## Consumer groups
//!
//! A configured group turns the subscription into a shared subscription
//! (`$share/{group}/{topic}`), so members of one group compete for
//! messages.
//!
//! ## Publishing
//!
//! QoS 1 publishes through an `AsyncClient` whose event loop is driven by a
//! background task. A publish succeeds once the client accepted it.

use rumqttc::{
    //
    AsyncClient,
    ConnectReturnCode,
    Event,
    EventLoop,
    MqttOptions,
    Outgoing,
    Packet,
    Publish,
    QoS,
    SubscribeReasonCode,
};

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::domain::lifecycle::lock_ignore_poison;
use crate::{
    // ---
    log_debug,
    log_error,
    log_info,
    BusConfig,
    BusError,
    BusPublisher,
    CodecPtr,
    ConsumerOptions,
    ConsumerPtr,
    Delivery,
    Fetcher,
    PayloadSender,
    PublisherPtr,
    PullConsumer,
    Result,
};

const DEFAULT_PORT: u16 = 1883;
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Upper bound for the broker to confirm a subscription.
const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(10);

/// After the first publish of a fetch, how long to keep collecting.
const BATCH_LINGER: Duration = Duration::from_millis(5);

/// Upper bound for flushing the disconnect on close.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Split an `mqtt://host:port` URI into host and port.
fn parse_uri(uri: &str) -> Result<(String, u16)> {
    // ---
    if uri.is_empty() {
        return Err(BusError::Configuration("MQTT transport requires URI".into()));
    }

    let addr = uri
        .strip_prefix("mqtt://")
        .or_else(|| uri.strip_prefix("tcp://"))
        .ok_or_else(|| {
            BusError::Configuration(format!("unsupported MQTT URI (expected mqtt://host:port): {uri}"))
        })?;

    let addr = addr.trim_end_matches('/');
    let (host, port) = match addr.split_once(':') {
        Some((host, port)) => {
            let port = port.parse::<u16>().map_err(|err| {
                BusError::Configuration(format!("invalid MQTT port in {uri}: {err}"))
            })?;
            (host, port)
        }
        None => (addr, DEFAULT_PORT),
    };

    if host.is_empty() {
        return Err(BusError::Configuration(format!("missing MQTT host in {uri}")));
    }
    Ok((host.to_string(), port))
}

/// The subscription filter for `topic`, shared between group members.
fn topic_filter(topic: &str, group: Option<&str>) -> String {
    match group {
        Some(group) => format!("$share/{group}/{topic}"),
        None => topic.to_string(),
    }
}

fn mqtt_options(config: &BusConfig, client_id: &str, persistent: bool) -> Result<MqttOptions> {
    // ---
    let (host, port) = parse_uri(&config.uri)?;

    let mut opts = MqttOptions::new(client_id, host, port);
    if let Some(secs) = config.keep_alive_secs {
        opts.set_keep_alive(Duration::from_secs(secs.into()));
    }
    opts.set_clean_session(!persistent);
    Ok(opts)
}

fn connection_err(topic: &str, err: rumqttc::ConnectionError) -> BusError {
    // ---
    let msg = format!("{topic}: mqtt connection error: {err}");
    log_error!("{}", msg);
    BusError::Transport(msg)
}

struct MqttFetcher {
    // ---
    topic: String,
    filter: String,
    client: AsyncClient,
    event_loop: EventLoop,
}

impl MqttFetcher {
    // ---
    async fn subscribe(&self) -> Result<()> {
        // ---
        self.client
            .subscribe(&self.filter, QoS::AtLeastOnce)
            .await
            .map_err(|err| {
                BusError::Transport(format!("{}: subscribe request failed: {err}", self.topic))
            })
    }

    /// Poll until the broker answers the pending subscribe.
    async fn await_suback(&mut self) -> Result<()> {
        // ---
        let deadline = Instant::now() + SUBSCRIBE_TIMEOUT;
        loop {
            let event = tokio::time::timeout_at(deadline, self.event_loop.poll())
                .await
                .map_err(|_| {
                    BusError::Transport(format!(
                        "{}: no SUBACK within {:?}",
                        self.topic, SUBSCRIBE_TIMEOUT
                    ))
                })?;

            match event {
                Ok(Event::Incoming(Packet::SubAck(suback))) => {
                    let refused = suback
                        .return_codes
                        .iter()
                        .any(|code| matches!(code, SubscribeReasonCode::Failure));
                    if refused {
                        return Err(BusError::Configuration(format!(
                            "{}: broker refused subscription to {}",
                            self.topic, self.filter
                        )));
                    }
                    log_info!("{}: subscribed to {}", self.topic, self.filter);
                    return Ok(());
                }
                Ok(Event::Incoming(Packet::ConnAck(connack))) => {
                    if connack.code != ConnectReturnCode::Success {
                        return Err(BusError::Configuration(format!(
                            "{}: connection refused: {:?}",
                            self.topic, connack.code
                        )));
                    }
                    log_info!("{}: connected to broker", self.topic);
                }
                Ok(_event) => {}
                Err(err) => return Err(connection_err(&self.topic, err)),
            }
        }
    }
}

#[async_trait::async_trait]
impl Fetcher for MqttFetcher {
    // ---
    type Handle = Publish;

    fn destination(&self) -> &str {
        &self.topic
    }

    async fn open(&mut self) -> Result<()> {
        // ---
        self.subscribe().await?;
        self.await_suback().await
    }

    async fn fetch(&mut self, max: usize, wait: Duration) -> Result<Vec<Delivery<Publish>>> {
        // ---
        let mut deadline = Instant::now() + wait;
        let mut batch = Vec::new();

        while batch.len() < max {
            let event = match tokio::time::timeout_at(deadline, self.event_loop.poll()).await {
                Ok(event) => event,
                Err(_elapsed) => break,
            };

            match event {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    if batch.is_empty() {
                        deadline = deadline.min(Instant::now() + BATCH_LINGER);
                    }
                    batch.push(Delivery::new(publish.payload.clone(), publish));
                }
                Ok(Event::Incoming(Packet::ConnAck(connack))) => {
                    if connack.code != ConnectReturnCode::Success {
                        log_error!("{}: connection refused: {:?}", self.topic, connack.code);
                        continue;
                    }
                    log_info!("{}: reconnected to broker", self.topic);
                    if !connack.session_present {
                        self.subscribe().await?;
                    }
                }
                Ok(_event) => {}
                Err(err) => {
                    if batch.is_empty() {
                        return Err(connection_err(&self.topic, err));
                    }
                    log_error!("{}: mqtt connection error: {}", self.topic, err);
                    break;
                }
            }
        }

        Ok(batch)
    }

    async fn ack(&mut self, handle: Publish) -> Result<()> {
        // ---
        self.client
            .ack(&handle)
            .await
            .map_err(|err| BusError::Transport(format!("{}: PUBACK failed: {err}", self.topic)))
    }

    async fn close(&mut self) -> Result<()> {
        // ---
        log_debug!("{}: disconnecting mqtt client", self.topic);
        if let Err(err) = self.client.disconnect().await {
            log_debug!("{}: mqtt disconnect failed: {}", self.topic, err);
            return Ok(());
        }

        // Drive the loop until the queued acks and the disconnect go out.
        let deadline = Instant::now() + CLOSE_GRACE;
        while let Ok(event) = tokio::time::timeout_at(deadline, self.event_loop.poll()).await {
            match event {
                Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                Ok(_event) => {}
            }
        }
        Ok(())
    }
}

struct MqttSender {
    // ---
    topic: String,
    client: AsyncClient,
    shutdown: Arc<Notify>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl MqttSender {
    // ---
    fn spawn_driver(topic: String, mut event_loop: EventLoop, shutdown: Arc<Notify>) -> JoinHandle<()> {
        // ---
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.notified() => break,
                    event = event_loop.poll() => match event {
                        Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
                        Ok(Event::Incoming(Packet::ConnAck(_connack))) => {
                            log_info!("{}: publisher connected: {:?}", topic, _connack.code);
                        }
                        Ok(_event) => {}
                        Err(_err) => {
                            log_error!("{}: publisher connection error: {}", topic, _err);
                            tokio::time::sleep(RECONNECT_DELAY).await;
                        }
                    },
                }
            }
            log_debug!("{}: publisher event loop stopped", topic);
        })
    }
}

#[async_trait::async_trait]
impl PayloadSender for MqttSender {
    async fn send(&self, payload: Bytes) -> Result<()> {
        // ---
        self.client
            .publish(&self.topic, QoS::AtLeastOnce, false, payload.to_vec())
            .await
            .map_err(|err| {
                let msg = format!("{}: publish failed: {err}", self.topic);
                log_error!("{}", msg);
                BusError::Transport(msg)
            })
    }

    async fn close(&self) -> Result<()> {
        // ---
        let _ = self.client.disconnect().await;

        let driver = lock_ignore_poison(&self.driver).take();
        if let Some(mut driver) = driver {
            if tokio::time::timeout(CLOSE_GRACE, &mut driver).await.is_err() {
                self.shutdown.notify_one();
                let _ = driver.await;
            }
        }
        Ok(())
    }
}

/// Creates an MQTT consumer subscribed to `config.destination`.
///
/// # Errors
///
/// - [`BusError::Configuration`] if the URI cannot be parsed
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

    let client_id = config.consumer_name_or_generate();
    let mut opts = mqtt_options(config, &client_id, config.consumer_name.is_some())?;
    opts.set_manual_acks(true);

    // Room for a full batch of PUBACKs between two polls.
    let (client, event_loop) = AsyncClient::new(opts, options.batch_size.max(10) * 2);

    let fetcher = MqttFetcher {
        topic: config.destination.clone(),
        filter: topic_filter(&config.destination, config.group.as_deref()),
        client,
        event_loop,
    };

    log_debug!("{}: created mqtt consumer {}", config.destination, client_id);
    Ok(Arc::new(PullConsumer::new(fetcher, codec, options)))
}

/// Creates an MQTT publisher for `config.destination`.
pub async fn create_publisher<T>(config: &BusConfig, codec: CodecPtr<T>) -> Result<PublisherPtr<T>>
where
    T: Send + Sync + 'static,
{
    // ---
    let client_id = format!("{}-pub-{}", config.destination, uuid::Uuid::new_v4());
    let opts = mqtt_options(config, &client_id, false)?;
    let (client, event_loop) = AsyncClient::new(opts, 10);

    let shutdown = Arc::new(Notify::new());
    let driver = MqttSender::spawn_driver(config.destination.clone(), event_loop, shutdown.clone());

    let sender = MqttSender {
        topic: config.destination.clone(),
        client,
        shutdown,
        driver: Mutex::new(Some(driver)),
    };

    Ok(Arc::new(BusPublisher::new(
        config.destination.clone(),
        codec,
        sender,
    )))
}
