//! Message codec boundary.
//!
//! Every adapter moves opaque payload bytes; the codec turns a typed message
//! into those bytes on the publish path and back on the consume path.
//!
//! The contract is `decode(encode(v)) == v`. Encode failures are returned to
//! the publishing caller. Decode failures are reported as
//! [`BusError::Poison`] and never leave the consume path.

use std::marker::PhantomData;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::{BusError, Result};

mod absence;

/// Converts message values to and from backend payloads.
pub trait Codec<T>: Send + Sync {
    // ---
    /// Encode a message into the payload carried by the backend envelope.
    fn encode(&self, message: &T) -> Result<Bytes>;

    /// Decode a payload. Failures must be [`BusError::Poison`].
    fn decode(&self, payload: &[u8]) -> Result<T>;

    /// Whether `message` is an absent value.
    ///
    /// Publishers reject absent messages with [`BusError::Validation`]
    /// before encoding or making any backend call. Decided on the value,
    /// not the payload: several values may share one encoding.
    fn is_absent(&self, _message: &T) -> bool {
        false
    }

    /// Content type advertised by backends that carry one (AMQP).
    fn content_type(&self) -> &'static str {
        "application/octet-stream"
    }
}

/// Shared codec pointer.
pub type CodecPtr<T> = Arc<dyn Codec<T>>;

/// JSON text codec backed by `serde_json`.
///
/// A top-level `None` is an absent message, so publishing `None` through a
/// `Publisher<Option<M>>` is a validation error. Other values that encode
/// as `null` (unit structs, `()`, `Value::Null`) are published normally.
pub struct JsonCodec<T> {
    _phantom: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            _phantom: PhantomData,
        }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Codec<T> for JsonCodec<T>
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self, message: &T) -> Result<Bytes> {
        // ---
        let json = serde_json::to_vec(message)?;
        Ok(Bytes::from(json))
    }

    fn decode(&self, payload: &[u8]) -> Result<T> {
        // ---
        serde_json::from_slice(payload).map_err(|err| BusError::Poison(err.to_string()))
    }

    fn is_absent(&self, message: &T) -> bool {
        absence::is_none(message)
    }

    fn content_type(&self) -> &'static str {
        "application/json"
    }
}

/// The default codec for `T`.
pub fn json_codec<T>() -> CodecPtr<T>
where
    T: Serialize + DeserializeOwned + 'static,
{
    Arc::new(JsonCodec::<T>::new())
}

/// Encode and validate a message for publishing.
pub(crate) fn encode_for_publish<T>(codec: &dyn Codec<T>, message: &T) -> Result<Bytes> {
    // ---
    if codec.is_absent(message) {
        return Err(BusError::Validation("message is absent".into()));
    }
    codec.encode(message)
}

/// Encode and validate a whole batch before anything is sent.
pub(crate) fn encode_batch<T>(codec: &dyn Codec<T>, messages: &[T]) -> Result<Vec<Bytes>> {
    // ---
    messages
        .iter()
        .enumerate()
        .map(|(idx, message)| {
            encode_for_publish(codec, message).map_err(|err| match err {
                BusError::Validation(reason) => {
                    BusError::Validation(format!("batch item {idx}: {reason}"))
                }
                other => other,
            })
        })
        .collect()
}
