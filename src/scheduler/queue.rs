//! Queue transport with explicit acknowledgment.
//!
//! [`Transport`] is the seam between the worker loop and the broker. The
//! production implementation, [`JobQueue`], is a Redis reliable queue:
//!
//! - `{queue}`: main list. Producers LPUSH, consumers pop from the right (FIFO)
//! - `{queue}:processing:{consumer}`: per-consumer in-flight list filled by
//!   BRPOPLPUSH. A message is acknowledged when it leaves this list
//! - `{queue}:dead_letter`: messages that must not be retried automatically
//! - `{queue}:consumers`: registry of consumers that may hold messages
//! - `{queue}:heartbeat:{consumer}`: liveness lease with a TTL
//!
//! # Liveness
//!
//! A consumer that stops refreshing its heartbeat is considered dead and the
//! messages in its processing list are redelivered by
//! [`Transport::recover_abandoned`]. Workers blocked inside a multi-minute game
//! must therefore call [`Transport::pump_liveness`] on a period shorter than
//! the heartbeat TTL for the whole duration of the game.
//!
//! Durability of published messages is Redis persistence (AOF or RDB).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default heartbeat lease. Must exceed both the consume wait and the
/// liveness pump period.
pub const DEFAULT_HEARTBEAT_TTL: Duration = Duration::from_secs(20);

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Failed to connect to Redis.
    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    RedisError(#[from] redis::RedisError),

    /// Failed to serialize a dead-letter entry.
    #[error("Serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),

    /// The delivery is not the one currently held by this consumer.
    #[error("Delivery {0} is not outstanding on this consumer")]
    UnknownDelivery(u64),

    /// A second message was requested before the first was settled.
    #[error("Prefetch limit of 1 exceeded: delivery {0} is still unacknowledged")]
    PrefetchExceeded(u64),

    /// The consumer was closed.
    #[error("Consumer is closed")]
    Closed,
}

/// A message handed to a consumer, awaiting `ack` or `reject`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    tag: u64,
    payload: Vec<u8>,
}

impl Delivery {
    pub fn new(tag: u64, payload: Vec<u8>) -> Self {
        Self { tag, payload }
    }

    /// Per-consumer delivery tag.
    pub fn tag(&self) -> u64 {
        self.tag
    }

    /// Raw message body.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Body as text for logs and dead-letter entries.
    pub fn body_lossy(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// A dead-lettered message kept for operator inspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// Original message body.
    pub payload: String,
    /// Why the message was dead-lettered.
    pub reason: String,
    /// Consumer that rejected it.
    pub consumer: String,
    /// When it was moved.
    pub moved_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn new(delivery: &Delivery, reason: &str, consumer: &str) -> Self {
        Self {
            payload: delivery.body_lossy(),
            reason: reason.to_string(),
            consumer: consumer.to_string(),
            moved_at: Utc::now(),
        }
    }
}

/// Statistics about queue state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Name of the queue.
    pub queue_name: String,
    /// Messages waiting to be delivered.
    pub pending: usize,
    /// Messages delivered but not yet acknowledged.
    pub in_flight: usize,
    /// Messages in the dead-letter list.
    pub dead_lettered: usize,
}

impl QueueStats {
    /// Returns whether every published message has been settled.
    pub fn is_drained(&self) -> bool {
        self.pending == 0 && self.in_flight == 0
    }
}

/// A durable, acknowledgment-based point-to-point queue.
///
/// Each handle is one consumer with a prefetch of one: `consume` refuses to
/// hand out a second message until the first is settled.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Identity of this consumer in the broker.
    fn consumer_id(&self) -> &str;

    /// Publishes a persistent message.
    async fn publish(&self, payload: &[u8]) -> Result<(), QueueError>;

    /// Waits up to `wait` for the next message.
    async fn consume(&self, wait: Duration) -> Result<Option<Delivery>, QueueError>;

    /// Permanently removes a delivered message.
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Settles a message without processing it.
    ///
    /// `requeue = false` routes it to the dead-letter list with `reason`;
    /// `requeue = true` puts it back at the head of the queue.
    async fn reject(
        &self,
        delivery: &Delivery,
        requeue: bool,
        reason: &str,
    ) -> Result<(), QueueError>;

    /// Publishes `payload` as a fresh message at the tail and acknowledges
    /// the original, as one step.
    async fn requeue(&self, delivery: &Delivery, payload: &[u8]) -> Result<(), QueueError>;

    /// Services consumer liveness. Call periodically while blocked.
    async fn pump_liveness(&self) -> Result<(), QueueError>;

    /// Redelivers messages held by consumers whose liveness lapsed.
    ///
    /// Returns the number of messages put back in circulation.
    async fn recover_abandoned(&self) -> Result<usize, QueueError>;

    /// Returns queue statistics.
    async fn stats(&self) -> Result<QueueStats, QueueError>;

    /// Returns up to `limit` dead-letter entries, newest first, without
    /// removing them.
    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, QueueError>;

    /// Deregisters the consumer. Unsettled messages stay in its processing
    /// list and are redelivered once its heartbeat expires.
    async fn close(&self) -> Result<(), QueueError>;
}

/// Tracks the single outstanding delivery of a consumer.
#[derive(Debug, Default)]
pub(crate) struct Prefetch {
    next_tag: AtomicU64,
    outstanding: Mutex<Option<u64>>,
}

impl Prefetch {
    /// Fails if a delivery is still outstanding.
    pub(crate) fn check_free(&self) -> Result<(), QueueError> {
        match *self.lock() {
            Some(tag) => Err(QueueError::PrefetchExceeded(tag)),
            None => Ok(()),
        }
    }

    pub(crate) fn hand_out(&self, payload: Vec<u8>) -> Delivery {
        let tag = self.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
        *self.lock() = Some(tag);
        Delivery::new(tag, payload)
    }

    pub(crate) fn check_outstanding(&self, delivery: &Delivery) -> Result<(), QueueError> {
        match *self.lock() {
            Some(tag) if tag == delivery.tag() => Ok(()),
            _ => Err(QueueError::UnknownDelivery(delivery.tag())),
        }
    }

    pub(crate) fn settle(&self) {
        *self.lock() = None;
    }

    pub(crate) fn is_outstanding(&self) -> bool {
        self.lock().is_some()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<u64>> {
        // A poisoned lock only means a panic elsewhere; the tag is still valid.
        self.outstanding
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Redis-backed reliable queue.
pub struct JobQueue {
    /// Redis connection manager (handles reconnection automatically).
    redis: ConnectionManager,
    queue_name: String,
    dead_letter_queue: String,
    consumers_key: String,
    consumer_id: String,
    heartbeat_ttl: Duration,
    prefetch: Prefetch,
}

impl JobQueue {
    /// Connects to Redis with a freshly generated consumer id.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::ConnectionFailed` if the connection fails.
    pub async fn connect(redis_url: &str, queue_name: &str) -> Result<Self, QueueError> {
        let consumer_id = format!("consumer-{}", Uuid::new_v4().simple());
        Self::connect_as(redis_url, queue_name, &consumer_id).await
    }

    /// Connects to Redis as a named consumer.
    ///
    /// The id is suffixed with a random token so that two processes using the
    /// same worker name on different hosts never share a processing list.
    pub async fn connect_as(
        redis_url: &str,
        queue_name: &str,
        worker_name: &str,
    ) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        let token = Uuid::new_v4().simple().to_string();
        let consumer_id = format!("{}-{}", worker_name, &token[..8]);

        Ok(Self::from_connection(redis, queue_name, consumer_id))
    }

    /// Creates a JobQueue from an existing ConnectionManager.
    pub fn from_connection(
        redis: ConnectionManager,
        queue_name: &str,
        consumer_id: impl Into<String>,
    ) -> Self {
        Self {
            redis,
            queue_name: queue_name.to_string(),
            dead_letter_queue: format!("{}:dead_letter", queue_name),
            consumers_key: format!("{}:consumers", queue_name),
            consumer_id: consumer_id.into(),
            heartbeat_ttl: DEFAULT_HEARTBEAT_TTL,
            prefetch: Prefetch::default(),
        }
    }

    /// Sets the heartbeat lease duration.
    pub fn with_heartbeat_ttl(mut self, ttl: Duration) -> Self {
        self.heartbeat_ttl = ttl;
        self
    }

    /// Returns the queue name.
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    fn processing_key(&self, consumer: &str) -> String {
        format!("{}:processing:{}", self.queue_name, consumer)
    }

    fn heartbeat_key(&self, consumer: &str) -> String {
        format!("{}:heartbeat:{}", self.queue_name, consumer)
    }

    /// Registers this consumer and refreshes its heartbeat lease.
    async fn touch(&self) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        let ttl_secs = self.heartbeat_ttl.as_secs().max(1);

        // MULTI/EXEC: recovery must never see the registration without
        // its heartbeat.
        let mut pipe = redis::pipe();
        pipe.atomic()
            .sadd(&self.consumers_key, &self.consumer_id)
            .ignore();
        pipe.cmd("SET")
            .arg(self.heartbeat_key(&self.consumer_id))
            .arg(Utc::now().to_rfc3339())
            .arg("EX")
            .arg(ttl_secs)
            .ignore();
        pipe.query_async::<_, ()>(&mut conn).await?;

        Ok(())
    }
}

#[async_trait]
impl Transport for JobQueue {
    fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    async fn publish(&self, payload: &[u8]) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        conn.lpush::<_, _, ()>(&self.queue_name, payload).await?;
        Ok(())
    }

    async fn consume(&self, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        self.prefetch.check_free()?;

        // The heartbeat must cover the whole blocking pop.
        self.touch().await?;

        let mut conn = self.redis.clone();
        let timeout_secs = wait.as_secs().max(1);

        // BRPOPLPUSH atomically pops from the main queue and parks the
        // message in this consumer's processing list.
        let result: Option<Vec<u8>> = redis::cmd("BRPOPLPUSH")
            .arg(&self.queue_name)
            .arg(self.processing_key(&self.consumer_id))
            .arg(timeout_secs)
            .query_async(&mut conn)
            .await?;

        Ok(result.map(|payload| self.prefetch.hand_out(payload)))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.prefetch.check_outstanding(delivery)?;

        let mut conn = self.redis.clone();
        conn.lrem::<_, _, ()>(
            self.processing_key(&self.consumer_id),
            1,
            delivery.payload(),
        )
        .await?;

        self.prefetch.settle();
        Ok(())
    }

    async fn reject(
        &self,
        delivery: &Delivery,
        requeue: bool,
        reason: &str,
    ) -> Result<(), QueueError> {
        self.prefetch.check_outstanding(delivery)?;

        let mut conn = self.redis.clone();
        let processing = self.processing_key(&self.consumer_id);

        let mut pipe = redis::pipe();
        pipe.atomic().lrem(&processing, 1, delivery.payload()).ignore();

        if requeue {
            // Right end is the next to be consumed.
            pipe.rpush(&self.queue_name, delivery.payload()).ignore();
        } else {
            let entry = DeadLetterEntry::new(delivery, reason, &self.consumer_id);
            let serialized = serde_json::to_string(&entry)?;
            pipe.lpush(&self.dead_letter_queue, serialized).ignore();
        }

        pipe.query_async::<_, ()>(&mut conn).await?;
        self.prefetch.settle();

        Ok(())
    }

    async fn requeue(&self, delivery: &Delivery, payload: &[u8]) -> Result<(), QueueError> {
        self.prefetch.check_outstanding(delivery)?;

        let mut conn = self.redis.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .lpush(&self.queue_name, payload)
            .ignore()
            .lrem(self.processing_key(&self.consumer_id), 1, delivery.payload())
            .ignore();
        pipe.query_async::<_, ()>(&mut conn).await?;

        self.prefetch.settle();
        Ok(())
    }

    async fn pump_liveness(&self) -> Result<(), QueueError> {
        self.touch().await
    }

    async fn recover_abandoned(&self) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let consumers: Vec<String> = conn.smembers(&self.consumers_key).await?;
        let mut recovered = 0;

        for consumer in consumers {
            if consumer == self.consumer_id {
                continue;
            }

            let alive: bool = conn.exists(self.heartbeat_key(&consumer)).await?;
            if alive {
                continue;
            }

            let processing = self.processing_key(&consumer);
            loop {
                let moved: Option<Vec<u8>> = redis::cmd("RPOPLPUSH")
                    .arg(&processing)
                    .arg(&self.queue_name)
                    .query_async(&mut conn)
                    .await?;

                match moved {
                    Some(_) => recovered += 1,
                    None => break,
                }
            }

            conn.srem::<_, _, ()>(&self.consumers_key, &consumer).await?;
            debug!(consumer = %consumer, "Deregistered dead consumer");
        }

        if recovered > 0 {
            info!(recovered, queue = %self.queue_name, "Redelivered abandoned messages");
        }

        Ok(recovered)
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let mut conn = self.redis.clone();

        let pending: usize = conn.llen(&self.queue_name).await?;
        let dead_lettered: usize = conn.llen(&self.dead_letter_queue).await?;

        let consumers: Vec<String> = conn.smembers(&self.consumers_key).await?;
        let mut in_flight = 0;
        for consumer in consumers {
            let len: usize = conn.llen(self.processing_key(&consumer)).await?;
            in_flight += len;
        }

        Ok(QueueStats {
            queue_name: self.queue_name.clone(),
            pending,
            in_flight,
            dead_lettered,
        })
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.redis.clone();
        let data: Vec<String> = conn
            .lrange(&self.dead_letter_queue, 0, limit as isize - 1)
            .await?;

        let mut entries = Vec::with_capacity(data.len());
        for raw in data {
            match serde_json::from_str(&raw) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(error = %e, "Skipping unreadable dead-letter entry"),
            }
        }

        Ok(entries)
    }

    async fn close(&self) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        let held: usize = conn.llen(self.processing_key(&self.consumer_id)).await?;

        if held > 0 || self.prefetch.is_outstanding() {
            warn!(
                consumer = %self.consumer_id,
                held,
                "Closing with unsettled messages; they will be redelivered"
            );
            return Ok(());
        }

        let mut pipe = redis::pipe();
        pipe.srem(&self.consumers_key, &self.consumer_id)
            .ignore()
            .del(self.heartbeat_key(&self.consumer_id))
            .ignore();
        pipe.query_async::<_, ()>(&mut conn).await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_error_display() {
        let err = QueueError::ConnectionFailed("timeout".to_string());
        assert!(err.to_string().contains("timeout"));

        let err = QueueError::PrefetchExceeded(7);
        assert!(err.to_string().contains("7"));

        let err = QueueError::UnknownDelivery(3);
        assert!(err.to_string().contains("not outstanding"));
    }

    #[test]
    fn test_queue_stats_drained() {
        let mut stats = QueueStats {
            queue_name: "play".to_string(),
            pending: 0,
            in_flight: 1,
            dead_lettered: 4,
        };
        assert!(!stats.is_drained());

        stats.in_flight = 0;
        assert!(stats.is_drained());
    }

    #[test]
    fn test_prefetch_allows_one_outstanding_delivery() {
        let prefetch = Prefetch::default();
        assert!(prefetch.check_free().is_ok());

        let first = prefetch.hand_out(b"one".to_vec());
        assert!(matches!(
            prefetch.check_free(),
            Err(QueueError::PrefetchExceeded(tag)) if tag == first.tag()
        ));

        let stale = Delivery::new(first.tag() + 10, b"other".to_vec());
        assert!(prefetch.check_outstanding(&stale).is_err());
        assert!(prefetch.check_outstanding(&first).is_ok());

        prefetch.settle();
        assert!(prefetch.check_free().is_ok());
        assert!(prefetch.check_outstanding(&first).is_err());
    }

    #[test]
    fn test_dead_letter_entry_structure() {
        let delivery = Delivery::new(1, b"{broken".to_vec());
        let entry = DeadLetterEntry::new(&delivery, "Malformed message", "worker-0-abcd");

        let serialized = serde_json::to_string(&entry).expect("entry should serialize");
        let parsed: serde_json::Value =
            serde_json::from_str(&serialized).expect("should parse back");

        assert_eq!(parsed["payload"], "{broken");
        assert_eq!(parsed["reason"], "Malformed message");
        assert!(parsed.get("moved_at").is_some());
    }
}
