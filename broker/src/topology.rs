use lapin::options::QueueDeclareOptions;
use lapin::types::{AMQPValue, FieldTable};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueDurability {
    Durable,
    /// Non-durable, exclusive to the declaring connection and deleted when unused.
    Transient,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Classic,
    Quorum,
    Stream,
}

impl QueueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueKind::Classic => "classic",
            QueueKind::Quorum => "quorum",
            QueueKind::Stream => "stream",
        }
    }
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declarative binding of one queue to an exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueTopology {
    pub exchange: String,
    pub queue: String,
    pub binding_key: String,
    pub durability: QueueDurability,
    pub kind: QueueKind,
    pub max_length_bytes: Option<u64>,
}

impl QueueTopology {
    pub fn new(
        exchange: &str,
        queue: &str,
        binding_key: &str,
        durability: QueueDurability,
        kind: QueueKind,
    ) -> Self {
        Self {
            exchange: exchange.to_string(),
            queue: queue.to_string(),
            binding_key: binding_key.to_string(),
            durability,
            kind,
            max_length_bytes: None,
        }
    }

    /// Caps a stream queue by size on disk.
    pub fn with_max_length_bytes(mut self, bytes: u64) -> Self {
        self.max_length_bytes = Some(bytes);
        self
    }

    pub fn declare_options(&self) -> QueueDeclareOptions {
        let durable = self.durability == QueueDurability::Durable;
        QueueDeclareOptions {
            durable,
            auto_delete: !durable,
            exclusive: !durable,
            ..QueueDeclareOptions::default()
        }
    }

    pub fn arguments(&self) -> FieldTable {
        let mut args = FieldTable::default();
        args.insert(
            "x-queue-type".into(),
            AMQPValue::LongString(self.kind.as_str().into()),
        );
        if let Some(bytes) = self.max_length_bytes {
            args.insert(
                "x-max-length-bytes".into(),
                AMQPValue::LongLongInt(bytes.min(i64::MAX as u64) as i64),
            );
        }
        args
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.kind == QueueKind::Stream && self.durability == QueueDurability::Transient {
            return Err(crate::Error::Topology(format!(
                "stream queue {} must be durable",
                self.queue
            )));
        }
        if self.max_length_bytes.is_some() && self.kind != QueueKind::Stream {
            return Err(crate::Error::Topology(format!(
                "byte cap only applies to stream queues, not {} queue {}",
                self.kind, self.queue
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::{sensor_binding, KeyKind, ANY_SENSOR, EXCHANGE_IOT};
    use lapin::types::ShortString;

    #[test]
    fn test_queue_kind_names() {
        assert_eq!(QueueKind::Classic.to_string(), "classic");
        assert_eq!(QueueKind::Quorum.to_string(), "quorum");
        assert_eq!(QueueKind::Stream.to_string(), "stream");
    }

    #[test]
    fn test_durable_declare_flags() {
        let topology = QueueTopology::new(
            EXCHANGE_IOT,
            "sensor.all.registry",
            &sensor_binding(ANY_SENSOR, KeyKind::Registry),
            QueueDurability::Durable,
            QueueKind::Classic,
        );
        let options = topology.declare_options();
        assert!(options.durable);
        assert!(!options.auto_delete);
        assert!(!options.exclusive);
    }

    #[test]
    fn test_transient_declare_flags() {
        let topology = QueueTopology::new(
            EXCHANGE_IOT,
            "scratch",
            "sensor.#",
            QueueDurability::Transient,
            QueueKind::Classic,
        );
        let options = topology.declare_options();
        assert!(!options.durable);
        assert!(options.auto_delete);
        assert!(options.exclusive);
    }

    #[test]
    fn test_stream_arguments() {
        let topology = QueueTopology::new(
            EXCHANGE_IOT,
            "sensor.all.measurements.db_writer",
            "sensor.*.measurements.#",
            QueueDurability::Durable,
            QueueKind::Stream,
        )
        .with_max_length_bytes(2_000_000_000);

        let args = topology.arguments();
        let inner = args.inner();
        assert_eq!(
            inner.get(&ShortString::from("x-queue-type")),
            Some(&AMQPValue::LongString("stream".into()))
        );
        assert_eq!(
            inner.get(&ShortString::from("x-max-length-bytes")),
            Some(&AMQPValue::LongLongInt(2_000_000_000))
        );
        assert!(topology.validate().is_ok());
    }

    #[test]
    fn test_invalid_topologies() {
        let transient_stream = QueueTopology::new(
            EXCHANGE_IOT,
            "s",
            "#",
            QueueDurability::Transient,
            QueueKind::Stream,
        );
        assert!(transient_stream.validate().is_err());

        let capped_classic =
            QueueTopology::new(EXCHANGE_IOT, "c", "#", QueueDurability::Durable, QueueKind::Classic)
                .with_max_length_bytes(10);
        assert!(capped_classic.validate().is_err());
    }
}
