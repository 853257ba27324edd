use fieldsync_mover::MoverError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AssociatorError>;

#[derive(Error, Debug)]
pub enum AssociatorError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("probe not found: {0}")]
    ProbeNotFound(String),

    #[error("media reference required: media_id or bucket + object_key")]
    EmptyProbeRef,

    #[error("window_ms must be between 100 and 60000, got {0}")]
    InvalidWindow(i64),

    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("unknown match method: {0}")]
    UnknownMethod(String),

    #[error("notification failed: {0}")]
    Notify(#[from] MoverError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
