use crate::codec::Encoding;
use crate::errors::{Error, Result};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How a handler resolved a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckType {
    /// Processed, remove from the queue.
    Ack,
    /// Invalid, drop without redelivery.
    NackDiscard,
    /// Transient failure, deliver again.
    NackRequeue,
}

/// A broker delivery that can be settled exactly once.
#[async_trait]
pub trait Delivery: Send + Sized {
    fn payload(&self) -> &[u8];

    async fn settle(self, outcome: AckType) -> Result<()>;
}

/// Decodes a payload and hands the value to `handler`.
///
/// Returns `None` when the payload cannot be decoded; the caller drops such
/// messages instead of redelivering them.
pub async fn dispatch<T, H, F>(payload: &[u8], encoding: Encoding, handler: &mut H) -> Option<AckType>
where
    T: DeserializeOwned,
    H: FnMut(T) -> F,
    F: Future<Output = AckType>,
{
    match encoding.decode::<T>(payload) {
        Ok(value) => Some(handler(value).await),
        Err(e) => {
            warn!(
                "Could not decode {} byte message as {:?}: {}",
                payload.len(),
                encoding,
                e
            );
            None
        }
    }
}

/// Drains `deliveries` one at a time, in arrival order, until the stream ends,
/// a transport fault occurs or `shutdown` fires.
pub async fn run_consumer<S, D, E, T, H, F>(
    queue: &str,
    deliveries: S,
    encoding: Encoding,
    mut handler: H,
    shutdown: CancellationToken,
) -> Result<()>
where
    S: Stream<Item = std::result::Result<D, E>>,
    D: Delivery,
    E: Into<Error>,
    T: DeserializeOwned,
    H: FnMut(T) -> F,
    F: Future<Output = AckType>,
{
    let mut deliveries = std::pin::pin!(deliveries);

    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => {
                info!(queue, "Consumer cancelled");
                return Ok(());
            }
            next = deliveries.next() => next,
        };

        let delivery = match next {
            Some(Ok(delivery)) => delivery,
            Some(Err(e)) => return Err(e.into()),
            None => {
                warn!(queue, "Delivery stream closed by broker");
                return Ok(());
            }
        };

        // Undecodable payloads are acknowledged so they leave the queue for good.
        let outcome = dispatch(delivery.payload(), encoding, &mut handler)
            .await
            .unwrap_or(AckType::Ack);

        debug!(queue, ?outcome, "Settling delivery");
        delivery.settle(outcome).await?;
    }
}
