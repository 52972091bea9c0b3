use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Broker error: {0}")]
    Broker(#[from] broker::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Sensor serial number not found: {0}")]
    UnknownSensor(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
