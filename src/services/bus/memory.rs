use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{BusError, BusMessage, GroupStart, MessageBus};

#[derive(Default)]
struct Group {
    /// Index of the next entry never delivered to this group.
    cursor: usize,
    /// Delivered, unacked entry ids with the consumer they went to, in
    /// delivery order.
    pending: Vec<(String, String)>,
}

#[derive(Default)]
struct Topic {
    entries: Vec<BusMessage>,
    groups: HashMap<String, Group>,
}

/// In-process bus with the same group semantics as the Redis one.
#[derive(Default)]
pub struct InMemoryBus {
    topics: Mutex<HashMap<String, Topic>>,
    published: Notify,
    next_seq: Mutex<u64>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn topics(&self) -> MutexGuard<'_, HashMap<String, Topic>> {
        self.topics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// All entries retained on a topic, oldest first.
    pub fn entries(&self, topic: &str) -> Vec<BusMessage> {
        self.topics()
            .get(topic)
            .map(|t| t.entries.clone())
            .unwrap_or_default()
    }

    pub fn has_group(&self, topic: &str, group: &str) -> bool {
        self.topics()
            .get(topic)
            .is_some_and(|t| t.groups.contains_key(group))
    }

    pub fn pending_count(&self, topic: &str, group: &str) -> usize {
        self.topics()
            .get(topic)
            .and_then(|t| t.groups.get(group))
            .map_or(0, |g| g.pending.len())
    }

    fn take_undelivered(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        max_count: usize,
    ) -> Result<Vec<BusMessage>, BusError> {
        let mut topics = self.topics();
        let no_group = || BusError::NoSuchGroup {
            topic: topic.to_string(),
            group: group.to_string(),
        };
        let t = topics.get_mut(topic).ok_or_else(no_group)?;
        let g = t.groups.get_mut(group).ok_or_else(no_group)?;

        let end = (g.cursor + max_count).min(t.entries.len());
        let batch: Vec<BusMessage> = t.entries[g.cursor..end].to_vec();
        g.cursor = end;
        g.pending
            .extend(batch.iter().map(|m| (m.id.clone(), consumer.to_string())));
        Ok(batch)
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, topic: &str, fields: &[(String, String)]) -> Result<String, BusError> {
        let id = {
            let mut seq = self.next_seq.lock().unwrap_or_else(PoisonError::into_inner);
            *seq += 1;
            format!("0-{}", *seq)
        };
        self.topics()
            .entry(topic.to_string())
            .or_default()
            .entries
            .push(BusMessage {
                id: id.clone(),
                fields: fields.iter().cloned().collect(),
            });
        self.published.notify_waiters();
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
        let deadline = Instant::now() + block;
        loop {
            let notified = self.published.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.take_undelivered(topic, group, consumer, max_count)?;
            if !batch.is_empty() {
                return Ok(batch);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn read_pending(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        max_count: usize,
    ) -> Result<Vec<BusMessage>, BusError> {
        let topics = self.topics();
        let no_group = || BusError::NoSuchGroup {
            topic: topic.to_string(),
            group: group.to_string(),
        };
        let t = topics.get(topic).ok_or_else(no_group)?;
        let g = t.groups.get(group).ok_or_else(no_group)?;

        Ok(g.pending
            .iter()
            .filter(|(_, owner)| owner == consumer)
            .filter_map(|(id, _)| t.entries.iter().find(|m| &m.id == id).cloned())
            .take(max_count)
            .collect())
    }

    async fn ack(&self, topic: &str, group: &str, id: &str) -> Result<(), BusError> {
        if let Some(g) = self
            .topics()
            .get_mut(topic)
            .and_then(|t| t.groups.get_mut(group))
        {
            g.pending.retain(|(pending_id, _)| pending_id != id);
        }
        Ok(())
    }

    async fn create_group(
        &self,
        topic: &str,
        group: &str,
        start: GroupStart,
        create_topic: bool,
    ) -> Result<(), BusError> {
        let mut topics = self.topics();
        if !topics.contains_key(topic) {
            if !create_topic {
                return Err(BusError::NoSuchTopic(topic.to_string()));
            }
            topics.insert(topic.to_string(), Topic::default());
        }
        let t = topics
            .get_mut(topic)
            .ok_or_else(|| BusError::NoSuchTopic(topic.to_string()))?;
        let cursor = match start {
            GroupStart::Beginning => 0,
            GroupStart::Now => t.entries.len(),
        };
        t.groups.entry(group.to_string()).or_insert_with(|| Group {
            cursor,
            pending: Vec::new(),
        });
        Ok(())
    }

    async fn delete_topic(&self, topic: &str) -> Result<(), BusError> {
        self.topics().remove(topic);
        Ok(())
    }

    async fn ping(&self) -> Result<(), BusError> {
        Ok(())
    }
}
