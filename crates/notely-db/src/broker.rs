//! Durable message broker on PostgreSQL.
//!
//! Messages live in `broker_message` until acknowledged. Each topic is a
//! strict FIFO: only the oldest unacknowledged message of a topic can be
//! leased, and while it is leased the topic yields nothing else. A lease
//! that expires without an ack makes the same message visible again.
//!
//! The head-of-line lookup must not use `SKIP LOCKED`: skipping a locked
//! head would hand a later message to a second consumer. Competing
//! consumers race on the conditional `UPDATE` and the loser sees no row.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};
use tokio::sync::Notify;
use tracing::{debug, info};

use notely_core::{Broker, Delivery, Error, Result, Topic};

const DELIVERY_COLUMNS: &str = "id, topic, payload, delivery_count, published_at";

/// PostgreSQL implementation of [`Broker`].
#[derive(Clone)]
pub struct PgBroker {
    pool: Pool<Postgres>,
    /// Wakes idle consumers in this process on publish and nack.
    notify: Arc<Notify>,
}

impl PgBroker {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self {
            pool,
            notify: Arc::new(Notify::new()),
        }
    }

    fn parse_delivery_row(row: &PgRow) -> Result<Delivery> {
        let topic: String = row.get("topic");
        Ok(Delivery {
            id: row.get("id"),
            topic: topic.parse::<Topic>().map_err(Error::Broker)?,
            payload: row.get("payload"),
            delivery_count: row.get("delivery_count"),
            published_at: row.get("published_at"),
        })
    }

    /// Delete acknowledged messages older than `older_than`.
    pub async fn purge_acked(&self, older_than: Duration) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM broker_message
             WHERE acked_at IS NOT NULL AND acked_at < now() - make_interval(secs => $1)",
        )
        .bind(older_than.as_secs_f64())
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Broker(e.to_string()))?;

        let purged = result.rows_affected();
        if purged > 0 {
            info!(
                subsystem = "broker",
                op = "purge",
                purged,
                older_than_secs = older_than.as_secs(),
                "Purged acknowledged messages"
            );
        }
        Ok(purged)
    }

    /// Number of unacknowledged messages per topic.
    pub async fn depth(&self, topic: Topic) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM broker_message WHERE topic = $1 AND acked_at IS NULL",
        )
        .bind(topic.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::Broker(e.to_string()))?;

        Ok(count)
    }
}

#[async_trait]
impl Broker for PgBroker {
    async fn publish(&self, topic: Topic, payload: String) -> Result<i64> {
        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO broker_message (topic, payload) VALUES ($1, $2) RETURNING id",
        )
        .bind(topic.as_str())
        .bind(&payload)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::Broker(e.to_string()))?;

        debug!(subsystem = "broker", op = "publish", topic = %topic, message_id = id, "Published");
        self.notify.notify_waiters();
        Ok(id)
    }

    async fn receive(&self, topic: Topic, lease: Duration) -> Result<Option<Delivery>> {
        let row = sqlx::query(&format!(
            "UPDATE broker_message
             SET leased_until = now() + make_interval(secs => $2),
                 delivery_count = delivery_count + 1
             WHERE id = (
                 SELECT id FROM broker_message
                 WHERE topic = $1 AND acked_at IS NULL
                 ORDER BY id
                 LIMIT 1
             )
               AND acked_at IS NULL
               AND (leased_until IS NULL OR leased_until < now())
             RETURNING {DELIVERY_COLUMNS}"
        ))
        .bind(topic.as_str())
        .bind(lease.as_secs_f64())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Broker(e.to_string()))?;

        row.as_ref().map(Self::parse_delivery_row).transpose()
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        sqlx::query(
            "UPDATE broker_message SET acked_at = now(), leased_until = NULL
             WHERE id = $1 AND acked_at IS NULL",
        )
        .bind(delivery.id)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Broker(e.to_string()))?;

        Ok(())
    }

    async fn nack(&self, delivery: &Delivery) -> Result<()> {
        sqlx::query(
            "UPDATE broker_message SET leased_until = NULL WHERE id = $1 AND acked_at IS NULL",
        )
        .bind(delivery.id)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Broker(e.to_string()))?;

        self.notify.notify_waiters();
        Ok(())
    }

    async fn pending(&self, topic: Topic) -> Result<Vec<Delivery>> {
        let rows = sqlx::query(&format!(
            "SELECT {DELIVERY_COLUMNS} FROM broker_message
             WHERE topic = $1 AND acked_at IS NULL
             ORDER BY id"
        ))
        .bind(topic.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Broker(e.to_string()))?;

        rows.iter().map(Self::parse_delivery_row).collect()
    }

    async fn pending_containing(&self, topic: Topic, needles: &[String]) -> Result<Vec<Delivery>> {
        // strpos rather than LIKE: needles are matched literally.
        let rows = sqlx::query(&format!(
            "SELECT {DELIVERY_COLUMNS} FROM broker_message
             WHERE topic = $1 AND acked_at IS NULL
               AND NOT EXISTS (SELECT 1 FROM unnest($2::text[]) AS needle
                               WHERE strpos(payload, needle) = 0)
             ORDER BY id"
        ))
        .bind(topic.as_str())
        .bind(needles)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Broker(e.to_string()))?;

        rows.iter().map(Self::parse_delivery_row).collect()
    }

    fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }
}
