use rabbitmq_stream_client::error::{
    ClientError, ConsumerCloseError, ConsumerCreateError, ConsumerDeliveryError,
    ConsumerStoreOffsetError,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    #[error("Stream client error: {0}")]
    StreamClient(#[from] ClientError),

    #[error("Stream consumer creation error: {0}")]
    StreamConsumerCreate(#[from] ConsumerCreateError),

    #[error("Stream delivery error: {0}")]
    StreamDelivery(#[from] ConsumerDeliveryError),

    #[error("Stream offset store error: {0}")]
    StreamStoreOffset(#[from] ConsumerStoreOffsetError),

    #[error("Stream consumer close error: {0}")]
    StreamClose(#[from] ConsumerCloseError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("MessagePack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    #[error("MessagePack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    #[error("Invalid serial number: {0}")]
    InvalidSerialNumber(String),

    #[error("Topology error: {0}")]
    Topology(String),
}

pub type Result<T> = std::result::Result<T, Error>;
