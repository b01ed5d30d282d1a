//! In-memory [`Broker`] for tests and embedded use.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use super::{partition_for, Broker, Message, TopicPartition};

pub struct MemoryBroker {
    partitions: u32,
    logs: Mutex<HashMap<TopicPartition, Vec<Message>>>,
    offsets: Mutex<HashMap<(String, TopicPartition), i64>>,
}

impl MemoryBroker {
    pub fn new(partitions: u32) -> Self {
        Self {
            partitions: partitions.max(1),
            logs: Mutex::new(HashMap::new()),
            offsets: Mutex::new(HashMap::new()),
        }
    }
}

fn poisoned<T>(_: T) -> anyhow::Error {
    anyhow!("memory broker lock poisoned")
}

#[async_trait]
impl Broker for MemoryBroker {
    fn partition_count(&self) -> u32 {
        self.partitions
    }

    async fn publish(&self, topic: &str, key: Option<&str>, payload: &[u8]) -> Result<(u32, i64)> {
        let partition = partition_for(key, self.partitions);
        let tp = TopicPartition::new(topic, partition);
        let mut logs = self.logs.lock().map_err(poisoned)?;
        let log = logs.entry(tp).or_default();
        let offset = log.len() as i64;
        log.push(Message {
            topic: topic.to_string(),
            partition,
            offset,
            key: key.map(str::to_string),
            payload: payload.to_vec(),
        });
        Ok((partition, offset))
    }

    async fn fetch(&self, tp: &TopicPartition, offset: i64) -> Result<Option<Message>> {
        let logs = self.logs.lock().map_err(poisoned)?;
        let start = offset.max(0) as usize;
        Ok(logs.get(tp).and_then(|log| log.get(start)).cloned())
    }

    async fn committed(&self, group: &str, tp: &TopicPartition) -> Result<i64> {
        let offsets = self.offsets.lock().map_err(poisoned)?;
        Ok(offsets
            .get(&(group.to_string(), tp.clone()))
            .copied()
            .unwrap_or(0))
    }

    async fn commit(&self, group: &str, tp: &TopicPartition, offset: i64) -> Result<()> {
        let mut offsets = self.offsets.lock().map_err(poisoned)?;
        let next = offsets.entry((group.to_string(), tp.clone())).or_insert(0);
        // Commits never move backwards.
        *next = (*next).max(offset + 1);
        Ok(())
    }

    async fn end_offset(&self, tp: &TopicPartition) -> Result<i64> {
        let logs = self.logs.lock().map_err(poisoned)?;
        Ok(logs.get(tp).map(|l| l.len() as i64).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_fetch_commit() {
        let broker = MemoryBroker::new(2);
        let (p, o0) = broker.publish("t", Some("k"), b"one").await.unwrap();
        let (p2, o1) = broker.publish("t", Some("k"), b"two").await.unwrap();
        assert_eq!(p, p2);
        assert_eq!((o0, o1), (0, 1));

        let tp = TopicPartition::new("t", p);
        assert_eq!(broker.committed("g", &tp).await.unwrap(), 0);
        let m = broker.fetch(&tp, 0).await.unwrap().unwrap();
        assert_eq!(m.payload, b"one");

        broker.commit("g", &tp, 0).await.unwrap();
        assert_eq!(broker.committed("g", &tp).await.unwrap(), 1);
        // Other groups are independent.
        assert_eq!(broker.committed("other", &tp).await.unwrap(), 0);

        broker.commit("g", &tp, 1).await.unwrap();
        broker.commit("g", &tp, 0).await.unwrap();
        assert_eq!(broker.committed("g", &tp).await.unwrap(), 2);
        assert!(broker.fetch(&tp, 2).await.unwrap().is_none());
        assert_eq!(broker.end_offset(&tp).await.unwrap(), 2);
    }
}
