use thiserror::Error;
use uuid::Uuid;

/// Why a single publish attempt failed. Every variant counts as a failed
/// attempt for the record being published.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("broker error: {0}")]
    Broker(#[from] lapin::Error),

    #[error("broker channel is not open")]
    ChannelClosed,

    #[error("broker did not acknowledge message {0}")]
    Nacked(Uuid),

    #[error("cannot derive a routing key from event type `{0}`")]
    InvalidEventType(String),

    #[error("publish cancelled")]
    Cancelled,
}

/// Errors that end a dispatch tick early. Per-record publish failures are
/// not among them; those are stored on the record.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("outbox store error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("dispatch cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error("failed to serialize domain event `{event_type}`: {source}")]
    Serialization {
        event_type: &'static str,
        #[source]
        source: serde_json::Error,
    },
}
