use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Broker error: {0}")]
    Broker(#[from] broker::Error),

    #[error("Validation error: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, Error>;
