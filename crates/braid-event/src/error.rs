//! Error types for the event model.

/// Errors that can occur while decoding, hashing or signing events.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    /// JSON serialization or deserialization failed.
    #[error("event serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The input was valid JSON but not a JSON object.
    #[error("event must be a JSON object")]
    NotAnObject,

    /// A signature block could not be decoded.
    #[error("malformed signature from {origin} ({key_id}): {reason}")]
    MalformedSignature {
        origin: String,
        key_id: String,
        reason: String,
    },
}
