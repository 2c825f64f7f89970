//! Redis Streams consumer-group backend using `redis`.
//!
//! ## Delivery model
//!
//! Pull. Each consumer owns one multiplexed connection and reads its
//! destination stream through `XREADGROUP` as a named member of a consumer
//! group. The group is created on start (`XGROUP CREATE ... MKSTREAM`); a
//! `BUSYGROUP` reply means it already exists.
//!
//! ## Acknowledgment
//!
//! An entry is `XACK`ed only after the handler succeeds. Entries whose
//! handler failed stay in the group's pending list. On every start the
//! consumer first replays its own pending backlog (reading from id `0`)
//! before switching to new entries (`>`), so failed entries, and entries
//! read by a fetch that was cut short by stop, are delivered again.
//!
//! ## Publishing
//!
//! `XADD key * data <payload>`. Batches go out in one `MULTI`/`EXEC`
//! transaction: either every entry is appended or none is.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, RedisResult};

use crate::{
    // ---
    log_debug,
    log_error,
    log_info,
    BusConfig,
    BusError,
    BusPublisher,
    CancellationScope,
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

/// Stream entry field carrying the encoded message.
const PAYLOAD_FIELD: &str = "data";

/// Read position for new entries of a consumer group.
const NEW_ENTRIES: &str = ">";

/// Read position for this consumer's pending backlog.
const BACKLOG_START: &str = "0";

/// Where the next `XREADGROUP` of a consumer reads from.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ReadCursor {
    /// Replaying this consumer's pending entries after the given id.
    Backlog(String),
    /// Reading entries never delivered to the group.
    New,
}

impl ReadCursor {
    // ---
    fn backlog_start() -> Self {
        ReadCursor::Backlog(BACKLOG_START.to_string())
    }

    fn position(&self) -> &str {
        match self {
            ReadCursor::Backlog(id) => id,
            ReadCursor::New => NEW_ENTRIES,
        }
    }

    /// Cursor after a read whose last entry was `last_id`. An empty backlog
    /// read ends the replay for good.
    fn advance(self, last_id: Option<String>) -> Self {
        match (self, last_id) {
            (ReadCursor::Backlog(_), Some(id)) => ReadCursor::Backlog(id),
            (ReadCursor::Backlog(_), None) => ReadCursor::New,
            (ReadCursor::New, _) => ReadCursor::New,
        }
    }
}

/// `BLOCK` argument for a fetch wait, at least one millisecond.
fn block_millis(wait: Duration) -> usize {
    usize::try_from(wait.as_millis().max(1)).unwrap_or(usize::MAX)
}

fn transport_err(context: &str, err: redis::RedisError) -> BusError {
    // ---
    let msg = format!("{context}: {err}");
    log_error!("{}", msg);
    BusError::Transport(msg)
}

async fn connect(uri: &str) -> Result<MultiplexedConnection> {
    // ---
    if uri.is_empty() {
        return Err(BusError::Configuration(
            "Redis transport requires URI".to_string(),
        ));
    }

    let client = redis::Client::open(uri).map_err(|err| {
        BusError::Configuration(format!("redis: failed to open client for URI {uri}: {err}"))
    })?;

    let conn = client
        .get_multiplexed_async_connection()
        .await
        .map_err(|err| transport_err(&format!("redis: failed to connect to {uri}"), err))?;

    log_info!("connected to Redis broker at {}", uri);
    Ok(conn)
}

/// Split a group read into deliveries, returning the last entry id seen.
fn deliveries_from_reply(reply: StreamReadReply) -> (Vec<Delivery<String>>, Option<String>) {
    // ---
    let mut last_id = None;
    let mut deliveries = Vec::new();

    for key in reply.keys {
        for entry in key.ids {
            let payload: Vec<u8> = entry.get(PAYLOAD_FIELD).unwrap_or_default();
            last_id = Some(entry.id.clone());
            deliveries.push(Delivery::new(payload, entry.id));
        }
    }

    (deliveries, last_id)
}

struct StreamFetcher {
    // ---
    conn: MultiplexedConnection,
    key: String,
    group: String,
    consumer: String,

    cursor: ReadCursor,
}

impl StreamFetcher {
    // ---
    async fn read(
        &mut self,
        cursor: &str,
        max: usize,
        block: Option<Duration>,
    ) -> Result<Option<StreamReadReply>> {
        // ---
        let mut opts = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(max);
        if let Some(wait) = block {
            opts = opts.block(block_millis(wait));
        }

        let reply: RedisResult<Option<StreamReadReply>> = self
            .conn
            .xread_options(&[&self.key], &[cursor], &opts)
            .await;

        reply.map_err(|err| transport_err(&format!("{}: XREADGROUP failed", self.key), err))
    }
}

#[async_trait::async_trait]
impl Fetcher for StreamFetcher {
    // ---
    type Handle = String;

    fn destination(&self) -> &str {
        &self.key
    }

    async fn open(&mut self) -> Result<()> {
        // ---
        let created: RedisResult<()> = self
            .conn
            .xgroup_create_mkstream(&self.key, &self.group, "$")
            .await;

        match created {
            Ok(()) => {
                log_info!("{}: created consumer group {}", self.key, self.group);
            }
            Err(err) if err.code() == Some("BUSYGROUP") => {
                log_debug!("{}: consumer group {} already exists", self.key, self.group);
            }
            Err(err) => {
                return Err(transport_err(
                    &format!("{}: XGROUP CREATE {} failed", self.key, self.group),
                    err,
                ));
            }
        }

        self.cursor = ReadCursor::backlog_start();
        Ok(())
    }

    async fn fetch(&mut self, max: usize, wait: Duration) -> Result<Vec<Delivery<String>>> {
        // ---
        if let ReadCursor::Backlog(_) = &self.cursor {
            let cursor = self.cursor.clone();
            let reply = self.read(cursor.position(), max, None).await?;
            let (deliveries, last_id) = reply.map(deliveries_from_reply).unwrap_or_default();
            self.cursor = cursor.advance(last_id);

            if !deliveries.is_empty() {
                log_debug!(
                    "{}: replaying {} pending entries for {}",
                    self.key,
                    deliveries.len(),
                    self.consumer
                );
                return Ok(deliveries);
            }
        }

        let reply = self.read(NEW_ENTRIES, max, Some(wait)).await?;
        Ok(reply
            .map(deliveries_from_reply)
            .map(|(deliveries, _)| deliveries)
            .unwrap_or_default())
    }

    async fn ack(&mut self, handle: String) -> Result<()> {
        // ---
        let acked: RedisResult<i64> = self.conn.xack(&self.key, &self.group, &[&handle]).await;
        acked
            .map(|_| ())
            .map_err(|err| transport_err(&format!("{}: XACK {handle} failed", self.key), err))
    }
}

struct StreamSender {
    conn: MultiplexedConnection,
    key: String,
}

#[async_trait::async_trait]
impl PayloadSender for StreamSender {
    async fn send(&self, payload: Bytes) -> Result<()> {
        // ---
        let mut conn = self.conn.clone();
        let added: RedisResult<String> = conn
            .xadd(&self.key, "*", &[(PAYLOAD_FIELD, payload.as_ref())])
            .await;

        added
            .map(|_id| ())
            .map_err(|err| transport_err(&format!("{}: XADD failed", self.key), err))
    }

    /// Appends the whole batch in a single transaction.
    async fn send_batch(&self, payloads: Vec<Bytes>, cancel: &CancellationScope) -> Result<()> {
        // ---
        let total = payloads.len();

        let mut pipe = redis::pipe();
        pipe.atomic();
        for payload in &payloads {
            pipe.xadd(&self.key, "*", &[(PAYLOAD_FIELD, payload.as_ref())])
                .ignore();
        }

        let mut conn = self.conn.clone();
        let executed = cancel
            .run(async {
                let res: RedisResult<()> = pipe.query_async(&mut conn).await;
                res
            })
            .await
            .and_then(|res| {
                res.map_err(|err| transport_err(&format!("{}: MULTI/EXEC failed", self.key), err))
            });

        executed.map_err(|err| BusError::PartialBatch {
            published: 0,
            total,
            source: Box::new(err),
        })
    }
}

/// Creates a Redis Streams consumer for `config.destination`.
///
/// # Errors
///
/// - [`BusError::Configuration`] if no consumer group is configured or the
///   URI cannot be parsed
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
    let group = config.group.clone().ok_or_else(|| {
        BusError::Configuration(format!(
            "{}: Redis Streams consumers require a consumer group",
            config.destination
        ))
    })?;
    options.validate()?;

    let conn = connect(&config.uri).await?;
    let fetcher = StreamFetcher {
        conn,
        key: config.destination.clone(),
        group,
        consumer: config.consumer_name_or_generate(),
        cursor: ReadCursor::New,
    };

    Ok(Arc::new(PullConsumer::new(fetcher, codec, options)))
}

/// Creates a Redis Streams publisher appending to `config.destination`.
pub async fn create_publisher<T>(config: &BusConfig, codec: CodecPtr<T>) -> Result<PublisherPtr<T>>
where
    T: Send + Sync + 'static,
{
    // ---
    let conn = connect(&config.uri).await?;
    let sender = StreamSender {
        conn,
        key: config.destination.clone(),
    };

    Ok(Arc::new(BusPublisher::new(
        config.destination.clone(),
        codec,
        sender,
    )))
}
