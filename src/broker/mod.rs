//! Message broker boundary.
//!
//! A [`Broker`] is a set of partitioned, append-only topics with per-group
//! committed offsets. Consumers keep their own read position; anything past
//! the committed offset is redelivered after a restart or a rewind, which
//! gives at-least-once delivery.
//!
//! ```text
//!  publish(key) ──▶ partition = hash(key) % n ──▶ [ 0 | 1 | 2 | 3 | ... ]
//!                                                       ▲
//!                         committed(group, tp) ─────────┘
//! ```
//!
//! Implementations:
//! - **[`MemoryBroker`]**: in-process, for tests and embedded use.
//! - **[`SqliteBroker`]**: durable log and offsets in SQLite.

pub mod memory;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::fmt;

pub use memory::MemoryBroker;
pub use sqlite::SqliteBroker;

/// A partition of a topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: u32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: u32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.topic, self.partition)
    }
}

/// A message as delivered to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub partition: u32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Partitions per topic.
    fn partition_count(&self) -> u32;

    /// Append a message; returns `(partition, offset)`.
    async fn publish(&self, topic: &str, key: Option<&str>, payload: &[u8]) -> Result<(u32, i64)>;

    /// Read the message at `offset`, or the next one after it if that offset
    /// is gone. `None` when the consumer is caught up.
    async fn fetch(&self, tp: &TopicPartition, offset: i64) -> Result<Option<Message>>;

    /// Next offset the group should consume (0 if nothing committed).
    async fn committed(&self, group: &str, tp: &TopicPartition) -> Result<i64>;

    /// Mark everything up to and including `offset` as consumed by the group.
    async fn commit(&self, group: &str, tp: &TopicPartition, offset: i64) -> Result<()>;

    /// Offset the next published message would get.
    async fn end_offset(&self, tp: &TopicPartition) -> Result<i64>;

    /// All partitions of the given topics.
    fn assignments(&self, topics: &[String]) -> Vec<TopicPartition> {
        topics
            .iter()
            .flat_map(|t| (0..self.partition_count()).map(move |p| TopicPartition::new(t.clone(), p)))
            .collect()
    }
}

/// Stable key-to-partition mapping, so one entity always lands on one partition.
pub fn partition_for(key: Option<&str>, partitions: u32) -> u32 {
    match key {
        Some(k) if partitions > 1 => {
            let digest = Sha256::digest(k.as_bytes());
            u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]) % partitions
        }
        _ => 0,
    }
}

/// Best-effort partition key for a raw snippet payload: its `id` field.
pub fn key_of(payload: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(payload).ok()?;
    value.get("id")?.as_str().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_stable_and_in_range() {
        for key in ["abc-123", "snippet-9", ""] {
            let p = partition_for(Some(key), 4);
            assert!(p < 4);
            assert_eq!(p, partition_for(Some(key), 4));
        }
        assert_eq!(partition_for(None, 4), 0);
        assert_eq!(partition_for(Some("x"), 1), 0);
    }

    #[test]
    fn test_key_of() {
        assert_eq!(key_of(br#"{"id":"abc","code":"x"}"#).as_deref(), Some("abc"));
        assert_eq!(key_of(b"not json"), None);
        assert_eq!(key_of(br#"{"id": 7}"#), None);
    }
}
