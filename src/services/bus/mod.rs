//! Stream message bus contract.
//!
//! The bus is a durable append-only log per topic with consumer groups:
//! delivery is at-least-once, every delivered entry stays pending for its
//! group until acked and can be read again by the consumer it went to. [`RedisStreamBus`] is the production implementation,
//! [`InMemoryBus`] an in-process one with the same semantics.

mod memory;
mod redis_stream;
pub mod schema;

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

pub use memory::InMemoryBus;
pub use redis_stream::RedisStreamBus;
pub use schema::StreamMessage;

pub const JOBS_TOPIC: &str = "vehicle_jobs";
pub const RESULTS_TOPIC: &str = "vehicle_results";
pub const ACK_TOPIC: &str = "vehicle_ack";

pub const AGGREGATOR_GROUP: &str = "aggregator";
pub const INGEST_GROUP: &str = "ingest";

/// Messages per aggregator read.
pub const BATCH_SIZE: usize = 10;
/// Longest a group read may block when nothing is pending.
pub const BLOCK_TIME: Duration = Duration::from_millis(1000);

/// One delivered entry.
#[derive(Debug, Clone, PartialEq)]
pub struct BusMessage {
    pub id: String,
    pub fields: HashMap<String, String>,
}

/// Where a newly created consumer group starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStart {
    Beginning,
    Now,
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Append an entry, returning its id.
    async fn publish(&self, topic: &str, fields: &[(String, String)]) -> Result<String, BusError>;

    /// Deliver up to `max_count` entries never delivered to `group`,
    /// waiting at most `block` when there are none.
    async fn read_group(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        max_count: usize,
        block: Duration,
    ) -> Result<Vec<BusMessage>, BusError>;

    /// Entries already delivered to `consumer` and not yet acked, oldest
    /// first. Never blocks. A consumer drains these after a restart or a
    /// failed batch before reading new entries.
    async fn read_pending(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        max_count: usize,
    ) -> Result<Vec<BusMessage>, BusError>;

    async fn ack(&self, topic: &str, group: &str, id: &str) -> Result<(), BusError>;

    /// Create a consumer group. Creating one that already exists succeeds.
    async fn create_group(
        &self,
        topic: &str,
        group: &str,
        start: GroupStart,
        create_topic: bool,
    ) -> Result<(), BusError>;

    async fn delete_topic(&self, topic: &str) -> Result<(), BusError>;

    /// Connectivity check.
    async fn ping(&self) -> Result<(), BusError>;
}

/// Encode and publish a typed message on its topic.
pub async fn publish_message<B, M>(bus: &B, message: &M) -> Result<String, BusError>
where
    B: MessageBus + ?Sized,
    M: StreamMessage,
{
    let fields = message.to_fields()?;
    bus.publish(M::TOPIC, &fields).await
}

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Message is not a flat field map")]
    NotAFieldMap,

    #[error("Topic {0} does not exist")]
    NoSuchTopic(String),

    #[error("Consumer group {group} does not exist on {topic}")]
    NoSuchGroup { topic: String, group: String },
}
