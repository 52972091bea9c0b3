//! Append-only stream consumption with single active consumer failover.
//!
//! Several processes may subscribe with the same consumer name; the broker
//! keeps exactly one of them active. On promotion the new instance looks up
//! the last offset committed under that name and resumes right after it.

use crate::codec::Encoding;
use crate::consume::AckType;
use crate::errors::Result;
use async_trait::async_trait;
use futures::StreamExt;
use rabbitmq_stream_client::types::OffsetSpecification;
use rabbitmq_stream_client::{Consumer, Environment};
use serde::de::DeserializeOwned;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const INITIAL_BACKOFF_MS: u64 = 100;
const MAX_BACKOFF_MS: u64 = 2000;

/// Default time an entry may keep asking for redelivery before it is dropped.
pub const DEFAULT_REDELIVERY_BUDGET: Duration = Duration::from_secs(150);

#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub virtual_host: String,
}

pub async fn connect(settings: &StreamSettings) -> Result<Environment> {
    info!(
        "Connecting to stream endpoint at {}:{}",
        settings.host, settings.port
    );
    let environment = Environment::builder()
        .host(&settings.host)
        .port(settings.port)
        .username(&settings.username)
        .password(&settings.password)
        .virtual_host(&settings.virtual_host)
        .build()
        .await?;
    Ok(environment)
}

/// Where a consumer starts reading after it becomes the active one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumePoint {
    /// Nothing committed yet under this consumer name.
    First,
    /// Continue after this committed offset.
    After(u64),
}

impl ResumePoint {
    pub fn from_stored<E>(stored: std::result::Result<u64, E>) -> Self {
        match stored {
            Ok(offset) => ResumePoint::After(offset),
            Err(_) => ResumePoint::First,
        }
    }

    pub fn offset_specification(self) -> OffsetSpecification {
        match self {
            ResumePoint::First => OffsetSpecification::First,
            ResumePoint::After(offset) => OffsetSpecification::Offset(offset.saturating_add(1)),
        }
    }
}

/// How long an entry is retried in place, and what to do once it is given up.
#[derive(Debug, Clone, Copy)]
pub struct RedeliveryPolicy {
    pub budget: Duration,
    /// Called with the offset of every entry dropped after the budget ran out.
    pub on_exhausted: fn(u64),
}

impl RedeliveryPolicy {
    pub fn new(budget: Duration) -> Self {
        Self {
            budget,
            on_exhausted: |_| {},
        }
    }

    pub fn on_exhausted(mut self, callback: fn(u64)) -> Self {
        self.on_exhausted = callback;
        self
    }
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_REDELIVERY_BUDGET)
    }
}

/// Result of retrying an entry in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Redelivery {
    Settled(AckType),
    /// Still asking for redelivery when the budget ran out.
    Exhausted,
    Cancelled,
}

/// One stream entry as seen by the consume loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub offset: u64,
    pub payload: Vec<u8>,
}

/// A positioned reader over a stream that can commit how far it got.
#[async_trait]
pub trait EntrySource: Send + Sized {
    async fn next_entry(&mut self) -> Option<Result<StreamEntry>>;

    async fn store_offset(&mut self, offset: u64) -> Result<()>;

    async fn close(self) -> Result<()>;
}

#[async_trait]
impl EntrySource for Consumer {
    async fn next_entry(&mut self) -> Option<Result<StreamEntry>> {
        let delivery = match self.next().await? {
            Ok(delivery) => delivery,
            Err(e) => return Some(Err(e.into())),
        };
        Some(Ok(StreamEntry {
            offset: delivery.offset(),
            payload: delivery.message().data().map(<[u8]>::to_vec).unwrap_or_default(),
        }))
    }

    async fn store_offset(&mut self, offset: u64) -> Result<()> {
        Consumer::store_offset(self, offset).await?;
        Ok(())
    }

    async fn close(self) -> Result<()> {
        self.handle().close().await?;
        Ok(())
    }
}

/// Subscribes to `stream` as `consumer_name` with single active consumer
/// semantics and consumes it on a dedicated task.
///
/// A stream cannot redeliver, so a `NackRequeue` from the handler runs the
/// handler again on the same entry with backoff, for at most the policy's
/// budget. Offsets are committed after `Ack`, `NackDiscard` and exhaustion.
pub async fn subscribe_stream<T, H, F>(
    environment: &Environment,
    stream: &str,
    consumer_name: &str,
    encoding: Encoding,
    policy: RedeliveryPolicy,
    handler: H,
    shutdown: CancellationToken,
) -> Result<JoinHandle<()>>
where
    T: DeserializeOwned + Clone + Send + 'static,
    H: FnMut(T) -> F + Send + 'static,
    F: Future<Output = AckType> + Send + 'static,
{
    let consumer = environment
        .consumer()
        .name(consumer_name)
        .offset(OffsetSpecification::First)
        .enable_single_active_consumer(true)
        .consumer_update(move |active, context| async move {
            let name = context.name();
            let stream = context.stream();
            let stored = context.client().query_offset(name.clone(), stream.as_str()).await;
            let resume = ResumePoint::from_stored(stored);
            info!(
                "Consumer {} promoted on {} (active={}), resuming at {:?}",
                name, stream, active, resume
            );
            resume.offset_specification()
        })
        .build(stream)
        .await?;

    info!(
        "Subscribed to stream {} as single active consumer {}",
        stream, consumer_name
    );

    let stream = stream.to_string();
    Ok(tokio::spawn(async move {
        if let Err(e) =
            run_stream_consumer(&stream, consumer, encoding, policy, handler, shutdown).await
        {
            error!("Stream consumer on {} stopped: {}", stream, e);
        }
    }))
}

/// Reads `source` in offset order until it ends, a transport fault occurs
/// or `shutdown` fires, then closes it.
pub async fn run_stream_consumer<S, T, H, F>(
    stream: &str,
    mut source: S,
    encoding: Encoding,
    policy: RedeliveryPolicy,
    mut handler: H,
    shutdown: CancellationToken,
) -> Result<()>
where
    S: EntrySource,
    T: DeserializeOwned + Clone,
    H: FnMut(T) -> F,
    F: Future<Output = AckType>,
{
    let result = consume_entries(stream, &mut source, encoding, policy, &mut handler, &shutdown).await;
    source.close().await?;
    result
}

async fn consume_entries<S, T, H, F>(
    stream: &str,
    source: &mut S,
    encoding: Encoding,
    policy: RedeliveryPolicy,
    handler: &mut H,
    shutdown: &CancellationToken,
) -> Result<()>
where
    S: EntrySource,
    T: DeserializeOwned + Clone,
    H: FnMut(T) -> F,
    F: Future<Output = AckType>,
{
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => {
                info!(stream, "Stream consumer cancelled");
                return Ok(());
            }
            next = source.next_entry() => next,
        };

        let entry = match next {
            Some(Ok(entry)) => entry,
            Some(Err(e)) => return Err(e),
            None => {
                warn!(stream, "Stream closed by broker");
                return Ok(());
            }
        };
        let offset = entry.offset;

        let value: T = match encoding.decode(&entry.payload) {
            Ok(value) => value,
            Err(e) => {
                // Undecodable entries are skipped for good.
                warn!(stream, offset, "Could not decode stream entry: {}", e);
                source.store_offset(offset).await?;
                continue;
            }
        };

        let settled = match handler(value.clone()).await {
            AckType::NackRequeue => redeliver_until_settled(value, handler, &policy, shutdown).await,
            outcome => Redelivery::Settled(outcome),
        };

        match settled {
            Redelivery::Settled(outcome) => {
                debug!(stream, offset, ?outcome, "Committing offset");
            }
            Redelivery::Exhausted => {
                error!(
                    stream,
                    offset,
                    "Dropping entry still requesting redelivery after {:?}",
                    policy.budget
                );
                (policy.on_exhausted)(offset);
            }
            Redelivery::Cancelled => return Ok(()),
        }
        source.store_offset(offset).await?;
    }
}

/// Reruns `handler` on `value` with exponential backoff until it stops asking
/// for redelivery, the policy's budget runs out or `shutdown` fires.
pub async fn redeliver_until_settled<T, H, F>(
    value: T,
    handler: &mut H,
    policy: &RedeliveryPolicy,
    shutdown: &CancellationToken,
) -> Redelivery
where
    T: Clone,
    H: FnMut(T) -> F,
    F: Future<Output = AckType>,
{
    let started = Instant::now();
    let mut backoff_ms = INITIAL_BACKOFF_MS;

    loop {
        if started.elapsed() >= policy.budget {
            return Redelivery::Exhausted;
        }

        warn!("Handler requested redelivery, retrying in {}ms", backoff_ms);
        tokio::select! {
            _ = shutdown.cancelled() => return Redelivery::Cancelled,
            _ = tokio::time::sleep(Duration::from_millis(backoff_ms)) => {}
        }

        match handler(value.clone()).await {
            AckType::NackRequeue => backoff_ms = (backoff_ms * 2).min(MAX_BACKOFF_MS),
            outcome => return Redelivery::Settled(outcome),
        }
    }
}
