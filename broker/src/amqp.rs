use crate::codec::Encoding;
use crate::consume::{run_consumer, AckType, Delivery};
use crate::errors::Result;
use crate::topology::QueueTopology;
use async_trait::async_trait;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ExchangeDeclareOptions, QueueBindOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Unacknowledged deliveries a consumer holds before the broker stops pushing.
pub const DEFAULT_PREFETCH: u16 = 10;

/// One AMQP connection shared by the publishers and consumers of a process.
pub struct Broker {
    connection: Connection,
    prefetch: u16,
}

impl Broker {
    pub async fn connect(uri: &str, connection_name: &str, prefetch: u16) -> Result<Self> {
        info!("Connecting to AMQP broker as {}...", connection_name);
        let properties = ConnectionProperties::default().with_connection_name(connection_name.into());
        let connection = Connection::connect(uri, properties).await?;
        info!("AMQP connection established (prefetch={})", prefetch);

        Ok(Self {
            connection,
            prefetch,
        })
    }

    /// Declares the durable topic exchange every queue binds to.
    pub async fn declare_exchange(&self, exchange: &str) -> Result<()> {
        let channel = self.connection.create_channel().await?;
        channel
            .exchange_declare(
                exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        channel.close(200, "exchange declared").await?;
        Ok(())
    }

    /// Opens a dedicated channel for publishing.
    pub async fn publisher(&self) -> Result<Publisher> {
        let channel = self.connection.create_channel().await?;
        Ok(Publisher { channel })
    }

    /// Creates the queue if missing and binds it. Safe to repeat.
    pub async fn declare_topology(&self, topology: &QueueTopology) -> Result<()> {
        let channel = self.declare_and_bind(topology).await?;
        channel.close(200, "topology declared").await?;
        Ok(())
    }

    async fn declare_and_bind(&self, topology: &QueueTopology) -> Result<Channel> {
        topology.validate()?;

        let channel = self.connection.create_channel().await?;
        channel
            .queue_declare(
                &topology.queue,
                topology.declare_options(),
                topology.arguments(),
            )
            .await?;
        channel
            .queue_bind(
                &topology.queue,
                &topology.exchange,
                &topology.binding_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        info!(
            "Declared {} queue {} bound to {} with {}",
            topology.kind, topology.queue, topology.exchange, topology.binding_key
        );
        Ok(channel)
    }

    /// Declares `topology`, then consumes it on a dedicated task.
    ///
    /// Topology and consumer setup errors are returned to the caller; faults
    /// after that end the task and are only logged.
    pub async fn subscribe<T, H, F>(
        &self,
        topology: &QueueTopology,
        encoding: Encoding,
        handler: H,
        shutdown: CancellationToken,
    ) -> Result<JoinHandle<()>>
    where
        T: DeserializeOwned + Send + 'static,
        H: FnMut(T) -> F + Send + 'static,
        F: Future<Output = AckType> + Send + 'static,
    {
        let channel = self.declare_and_bind(topology).await?;
        channel
            .basic_qos(self.prefetch, BasicQosOptions::default())
            .await?;

        let consumer = channel
            .basic_consume(
                &topology.queue,
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let queue = topology.queue.clone();
        info!("Subscribed to {}", queue);

        Ok(tokio::spawn(async move {
            if let Err(e) = run_consumer(&queue, consumer, encoding, handler, shutdown).await {
                error!("Consumer on {} stopped: {}", queue, e);
            }
            if let Err(e) = channel.close(200, "consumer stopped").await {
                warn!("Could not close channel for {}: {}", queue, e);
            }
        }))
    }

    pub async fn close(&self) -> Result<()> {
        self.connection.close(200, "shutting down").await?;
        Ok(())
    }
}

#[async_trait]
impl Delivery for lapin::message::Delivery {
    fn payload(&self) -> &[u8] {
        &self.data
    }

    async fn settle(self, outcome: AckType) -> Result<()> {
        match outcome {
            AckType::Ack => {
                self.acker.ack(BasicAckOptions::default()).await?;
            }
            AckType::NackDiscard => {
                self.acker
                    .nack(BasicNackOptions {
                        requeue: false,
                        ..BasicNackOptions::default()
                    })
                    .await?;
            }
            AckType::NackRequeue => {
                self.acker
                    .nack(BasicNackOptions {
                        requeue: true,
                        ..BasicNackOptions::default()
                    })
                    .await?;
            }
        }
        Ok(())
    }
}

/// Fire-and-forget publisher over its own channel.
#[derive(Clone)]
pub struct Publisher {
    channel: Channel,
}

impl Publisher {
    pub fn is_connected(&self) -> bool {
        self.channel.status().connected()
    }

    /// Encodes and sends `value`. The broker confirm is not awaited and failed
    /// sends are not retried.
    pub async fn publish<T: Serialize + Sync>(
        &self,
        exchange: &str,
        routing_key: &str,
        encoding: Encoding,
        value: &T,
    ) -> Result<()> {
        let payload = encoding.encode(value)?;
        let properties =
            BasicProperties::default().with_content_type(encoding.content_type().into());

        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &payload,
                properties,
            )
            .await?;

        debug!("Published {} bytes to {}", payload.len(), routing_key);
        Ok(())
    }
}
