use thiserror::Error;

pub type Result<T> = std::result::Result<T, CursorError>;

#[derive(Error, Debug)]
pub enum CursorError {
    #[error("cursor store unavailable: {0}")]
    Database(#[from] sqlx::Error),

    #[error("schema migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("cursor store unavailable: {0}")]
    Unavailable(String),
}
