use thiserror::Error;

/// Errors surfaced by consumers, publishers and their backends.
///
/// The variants follow the failure taxonomy of the consume/publish contract:
/// some are always surfaced to the caller (`Configuration`, `Validation`,
/// publish-side `Transport`), others are contained inside the adapters and
/// only ever appear in logs (`Poison`, `Handler`, `Cancelled`).
#[derive(Error, Debug)]
pub enum BusError {
    /// Invalid construction parameters or adapter setup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Absent message (or an absent item in a batch) passed to a publisher.
    #[error("validation error: {0}")]
    Validation(String),

    /// Payload could not be decoded into the expected message type.
    #[error("poison message: {0}")]
    Poison(String),

    /// Failure reported by a message handler.
    #[error("handler failed: {0}")]
    Handler(String),

    /// Backend fetch, acknowledge or send failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// The cancellation scope was triggered.
    #[error("operation cancelled")]
    Cancelled,

    /// Operation not valid in the consumer's or publisher's current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A bounded wait elapsed before the awaited work finished.
    #[error("timed out: {0}")]
    Timeout(String),

    /// A batch publish failed part-way.
    ///
    /// The first `published` messages were accepted by the backend; the
    /// remaining `total - published` were not sent.
    #[error("batch publish failed after {published}/{total} messages: {source}")]
    PartialBatch {
        published: usize,
        total: usize,
        #[source]
        source: Box<BusError>,
    },

    /// JSON serialization failed while encoding a message.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BusError {
    // ---

    /// True when this error is the expected outcome of a triggered scope.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, BusError::Cancelled)
    }

    /// Shorthand used by handlers to report a processing failure.
    pub fn handler(reason: impl std::fmt::Display) -> Self {
        BusError::Handler(reason.to_string())
    }
}

/// Result type alias for bus operations
pub type Result<T> = std::result::Result<T, BusError>;
