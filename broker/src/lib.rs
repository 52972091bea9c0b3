//! Typed publish/subscribe over a topic-routed AMQP broker.
//!
//! Classic and quorum queues are consumed through [`amqp::Broker`], append-only
//! streams through [`stream::subscribe_stream`]. Both hand decoded values to a
//! handler that answers with an [`AckType`].

pub mod amqp;
pub mod codec;
pub mod consume;
pub mod errors;
pub mod routing;
pub mod stream;
pub mod topology;

pub use codec::Encoding;
pub use consume::AckType;
pub use errors::{Error, Result};
pub use topology::{QueueDurability, QueueKind, QueueTopology};
