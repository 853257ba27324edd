use fieldsync_common::ConfigError;
use fieldsync_cursor::CursorError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, MoverError>;

#[derive(Error, Debug)]
pub enum MoverError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Cursor(#[from] CursorError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },

    #[error("sink unavailable: {0}")]
    SinkUnavailable(String),

    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("malformed row in {name}: {reason}")]
    MalformedRow { name: String, reason: String },

    #[error("cursor for {name} would move backwards from {from} to {to}")]
    CursorRegression {
        name: String,
        from: String,
        to: String,
    },

    #[error("invalid source descriptor {name}: {reason}")]
    InvalidDescriptor { name: String, reason: String },

    #[error("source {name} cannot be delivered by the {sink} sink")]
    DestinationMismatch { name: String, sink: &'static str },

    #[error("unknown source: {0}")]
    UnknownSource(String),

    #[error("duplicate source: {0}")]
    DuplicateSource(String),

    #[error("a run is already in progress")]
    AlreadyRunning,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl MoverError {
    pub(crate) fn malformed(source: &str, reason: impl Into<String>) -> Self {
        MoverError::MalformedRow {
            name: source.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid(source: &str, reason: impl Into<String>) -> Self {
        MoverError::InvalidDescriptor {
            name: source.to_string(),
            reason: reason.into(),
        }
    }
}
