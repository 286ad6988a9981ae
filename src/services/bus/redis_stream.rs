use async_trait::async_trait;
use redis::streams::{StreamPendingReply, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use std::collections::HashMap;
use std::time::Duration;

use super::{BusError, BusMessage, GroupStart, MessageBus};

/// Redis streams backed bus.
///
/// Each call takes its own multiplexed connection so a blocking group read
/// never holds up publishes or acks issued concurrently.
pub struct RedisStreamBus {
    client: redis::Client,
}

impl RedisStreamBus {
    pub fn new(redis_url: &str) -> Result<Self, BusError> {
        let client = redis::Client::open(redis_url).map_err(BusError::Redis)?;
        Ok(Self { client })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, BusError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(BusError::Redis)
    }

    /// Number of entries currently retained on a topic.
    pub async fn stream_len(&self, topic: &str) -> Result<u64, BusError> {
        let mut conn = self.connection().await?;
        let len: u64 = conn.xlen(topic).await.map_err(BusError::Redis)?;
        Ok(len)
    }

    /// Entries delivered to `group` but not yet acked.
    pub async fn pending_count(&self, topic: &str, group: &str) -> Result<u64, BusError> {
        let mut conn = self.connection().await?;
        let reply: StreamPendingReply = conn.xpending(topic, group).await.map_err(BusError::Redis)?;
        Ok(reply.count() as u64)
    }
}

#[async_trait]
impl MessageBus for RedisStreamBus {
    async fn publish(&self, topic: &str, fields: &[(String, String)]) -> Result<String, BusError> {
        let mut conn = self.connection().await?;
        let id: String = conn.xadd(topic, "*", fields).await.map_err(BusError::Redis)?;
        Ok(id)
    }

    async fn read_group(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        max_count: usize,
        block: Duration,
    ) -> Result<Vec<BusMessage>, BusError> {
        let mut conn = self.connection().await?;
        let opts = StreamReadOptions::default()
            .group(group, consumer)
            .count(max_count)
            .block(block.as_millis() as usize);

        let reply: Option<StreamReadReply> = conn
            .xread_options(&[topic], &[">"], &opts)
            .await
            .map_err(BusError::Redis)?;
        decode_reply(reply)
    }

    async fn read_pending(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        max_count: usize,
    ) -> Result<Vec<BusMessage>, BusError> {
        let mut conn = self.connection().await?;
        let opts = StreamReadOptions::default()
            .group(group, consumer)
            .count(max_count);

        // Id 0 reads this consumer's own pending entries instead of new ones.
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[topic], &["0"], &opts)
            .await
            .map_err(BusError::Redis)?;
        decode_reply(reply)
    }

    async fn ack(&self, topic: &str, group: &str, id: &str) -> Result<(), BusError> {
        let mut conn = self.connection().await?;
        conn.xack::<_, _, _, ()>(topic, group, &[id])
            .await
            .map_err(BusError::Redis)?;
        Ok(())
    }

    async fn create_group(
        &self,
        topic: &str,
        group: &str,
        start: GroupStart,
        create_topic: bool,
    ) -> Result<(), BusError> {
        let mut conn = self.connection().await?;
        let start_id = match start {
            GroupStart::Beginning => "0",
            GroupStart::Now => "$",
        };

        let created: redis::RedisResult<()> = if create_topic {
            conn.xgroup_create_mkstream(topic, group, start_id).await
        } else {
            conn.xgroup_create(topic, group, start_id).await
        };

        match created {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => {
                tracing::debug!(topic, group, "Consumer group already exists");
                Ok(())
            }
            Err(e) => Err(BusError::Redis(e)),
        }
    }

    async fn delete_topic(&self, topic: &str) -> Result<(), BusError> {
        let mut conn = self.connection().await?;
        conn.del::<_, ()>(topic).await.map_err(BusError::Redis)?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), BusError> {
        let mut conn = self.connection().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(BusError::Redis)?;
        Ok(())
    }
}

fn decode_reply(reply: Option<StreamReadReply>) -> Result<Vec<BusMessage>, BusError> {
    let Some(reply) = reply else {
        return Ok(Vec::new());
    };

    let mut messages = Vec::new();
    for key in reply.keys {
        for entry in key.ids {
            let mut fields = HashMap::with_capacity(entry.map.len());
            for (name, value) in &entry.map {
                let value: String = redis::from_redis_value(value).map_err(BusError::Redis)?;
                fields.insert(name.clone(), value);
            }
            messages.push(BusMessage {
                id: entry.id,
                fields,
            });
        }
    }
    Ok(messages)
}
