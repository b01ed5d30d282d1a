//! SQLite-backed [`Broker`].
//!
//! The message log and committed offsets live in one database file, so a
//! producer (`snip ingest`) and a consumer (`snip serve`) can share it across
//! processes. Offsets are assigned per partition as `MAX(msg_offset) + 1`
//! inside a transaction.

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use tokio::sync::Mutex;

use super::{partition_for, Broker, Message, TopicPartition};
use crate::{db, migrate};

pub struct SqliteBroker {
    pool: SqlitePool,
    partitions: u32,
    publish_lock: Mutex<()>,
}

impl SqliteBroker {
    pub async fn open(path: &Path, partitions: u32) -> Result<Self> {
        let pool = db::connect(path).await?;
        migrate::migrate_broker(&pool).await?;
        Ok(Self::from_pool(pool, partitions))
    }

    fn from_pool(pool: SqlitePool, partitions: u32) -> Self {
        Self {
            pool,
            partitions: partitions.max(1),
            publish_lock: Mutex::new(()),
        }
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[async_trait]
impl Broker for SqliteBroker {
    fn partition_count(&self) -> u32 {
        self.partitions
    }

    async fn publish(&self, topic: &str, key: Option<&str>, payload: &[u8]) -> Result<(u32, i64)> {
        let partition = partition_for(key, self.partitions);
        let _guard = self.publish_lock.lock().await;

        let mut tx = self.pool.begin().await?;
        let offset: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(msg_offset) + 1, 0) FROM messages WHERE topic = ? AND partition_id = ?",
        )
        .bind(topic)
        .bind(partition as i64)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO messages (topic, partition_id, msg_offset, msg_key, payload, published_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(topic)
        .bind(partition as i64)
        .bind(offset)
        .bind(key)
        .bind(payload)
        .bind(now_millis())
        .execute(&mut *tx)
        .await
        .with_context(|| format!("Failed to append to {}[{}]", topic, partition))?;
        tx.commit().await?;

        Ok((partition, offset))
    }

    async fn fetch(&self, tp: &TopicPartition, offset: i64) -> Result<Option<Message>> {
        let row = sqlx::query(
            "SELECT msg_offset, msg_key, payload FROM messages
             WHERE topic = ? AND partition_id = ? AND msg_offset >= ?
             ORDER BY msg_offset ASC LIMIT 1",
        )
        .bind(&tp.topic)
        .bind(tp.partition as i64)
        .bind(offset)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| Message {
            topic: tp.topic.clone(),
            partition: tp.partition,
            offset: r.get("msg_offset"),
            key: r.get("msg_key"),
            payload: r.get("payload"),
        }))
    }

    async fn committed(&self, group: &str, tp: &TopicPartition) -> Result<i64> {
        let next: Option<i64> = sqlx::query_scalar(
            "SELECT next_offset FROM consumer_offsets WHERE group_id = ? AND topic = ? AND partition_id = ?",
        )
        .bind(group)
        .bind(&tp.topic)
        .bind(tp.partition as i64)
        .fetch_optional(&self.pool)
        .await?;
        Ok(next.unwrap_or(0))
    }

    async fn commit(&self, group: &str, tp: &TopicPartition, offset: i64) -> Result<()> {
        sqlx::query(
            "INSERT INTO consumer_offsets (group_id, topic, partition_id, next_offset, updated_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(group_id, topic, partition_id) DO UPDATE SET
                next_offset = MAX(consumer_offsets.next_offset, excluded.next_offset),
                updated_at = excluded.updated_at",
        )
        .bind(group)
        .bind(&tp.topic)
        .bind(tp.partition as i64)
        .bind(offset + 1)
        .bind(now_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn end_offset(&self, tp: &TopicPartition) -> Result<i64> {
        let end: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(msg_offset) + 1, 0) FROM messages WHERE topic = ? AND partition_id = ?",
        )
        .bind(&tp.topic)
        .bind(tp.partition as i64)
        .fetch_one(&self.pool)
        .await?;
        Ok(end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_offsets_survive_reopen() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("broker.sqlite");

        let (partition, offset) = {
            let broker = SqliteBroker::open(&path, 4).await.unwrap();
            let first = broker.publish("snippet.created", Some("abc"), b"1").await.unwrap();
            let second = broker.publish("snippet.created", Some("abc"), b"2").await.unwrap();
            assert_eq!(first.0, second.0);
            assert_eq!(second.1, first.1 + 1);
            broker
                .commit("g", &TopicPartition::new("snippet.created", first.0), first.1)
                .await
                .unwrap();
            second
        };

        let broker = SqliteBroker::open(&path, 4).await.unwrap();
        let tp = TopicPartition::new("snippet.created", partition);
        let next = broker.committed("g", &tp).await.unwrap();
        assert_eq!(next, offset);
        let msg = broker.fetch(&tp, next).await.unwrap().unwrap();
        assert_eq!(msg.payload, b"2");
        assert_eq!(msg.key.as_deref(), Some("abc"));
        assert!(broker.fetch(&tp, next + 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_commit_is_monotonic() {
        let tmp = TempDir::new().unwrap();
        let broker = SqliteBroker::open(&tmp.path().join("b.sqlite"), 1).await.unwrap();
        let tp = TopicPartition::new("t", 0);
        broker.commit("g", &tp, 5).await.unwrap();
        broker.commit("g", &tp, 2).await.unwrap();
        assert_eq!(broker.committed("g", &tp).await.unwrap(), 6);
    }
}
