use crate::sparkplug::{CodecError, MessageType, TransportError};
use crate::state::EntityKey;
use crate::store::StoreError;
use thiserror::Error;

/// Errors surfaced by the protocol state core.
///
/// None of these are fatal to the host process; the broker decides whether a
/// variant becomes a log line, a metric or an operator alert.
#[derive(Debug, Error)]
pub enum SparkplugError {
    #[error("sequence violation on {entity}: expected seq {expected}, received {received}")]
    SequenceViolation {
        entity: EntityKey,
        expected: u8,
        received: u8,
    },
    #[error(
        "birth correlation failure on {entity}: birth announced bdSeq {announced}, last will carried {last_will}"
    )]
    BirthCorrelationFailure {
        entity: EntityKey,
        announced: u8,
        last_will: u8,
    },
    #[error("{0} has no birth on record")]
    UnknownEntity(EntityKey),
    #[error("{0} is offline; data requires a fresh birth")]
    EntityOffline(EntityKey),
    #[error("topic {0} is not a valid sparkplug topic")]
    InvalidTopic(String),
    #[error("{kind} payload on {topic} is missing {field}")]
    MissingField {
        kind: MessageType,
        topic: String,
        field: &'static str,
    },
    #[error("transmission failed: {0}")]
    Transmission(#[from] TransportError),
    #[error("persistence failed: {0}")]
    Persistence(#[from] StoreError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl SparkplugError {
    /// Errors that indicate a conflicting live session and warrant operator attention.
    pub fn requires_alert(&self) -> bool {
        matches!(self, SparkplugError::BirthCorrelationFailure { .. })
    }
}

pub type Result<T, E = SparkplugError> = std::result::Result<T, E>;
