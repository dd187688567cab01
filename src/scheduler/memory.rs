//! In-process broker implementing [`Transport`].
//!
//! Mirrors the Redis layout (a shared pending list, one in-flight slot per
//! consumer, a dead-letter list) so the worker loop can be driven end to end
//! without a broker. Crashes are simulated with [`MemoryBroker::crash`],
//! after which `recover_abandoned` redelivers whatever the crashed consumer
//! held.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use super::queue::{DeadLetterEntry, Delivery, Prefetch, QueueError, QueueStats, Transport};

#[derive(Default)]
struct BrokerState {
    pending: VecDeque<Vec<u8>>,
    in_flight: HashMap<String, Vec<u8>>,
    dead_letters: Vec<DeadLetterEntry>,
    crashed: HashSet<String>,
    liveness_pumps: HashMap<String, u64>,
    published: u64,
}

/// Shared state of an in-memory queue.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    name: String,
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
}

impl MemoryBroker {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Opens a consumer handle.
    pub fn connect(&self, consumer_id: impl Into<String>) -> MemoryQueue {
        MemoryQueue {
            broker: self.clone(),
            consumer_id: consumer_id.into(),
            prefetch: Prefetch::default(),
        }
    }

    /// Marks a consumer as dead. Its unacknowledged message stays parked
    /// until some other consumer calls `recover_abandoned`.
    pub fn crash(&self, consumer_id: &str) {
        self.lock().crashed.insert(consumer_id.to_string());
    }

    /// Number of messages waiting to be delivered.
    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    /// Snapshot of pending payloads, head first.
    pub fn pending(&self) -> Vec<Vec<u8>> {
        self.lock().pending.iter().rev().cloned().collect()
    }

    /// Dead-lettered entries in the order they arrived.
    pub fn dead_lettered(&self) -> Vec<DeadLetterEntry> {
        self.lock().dead_letters.clone()
    }

    /// How many times a consumer pumped liveness.
    pub fn liveness_pumps(&self, consumer_id: &str) -> u64 {
        self.lock()
            .liveness_pumps
            .get(consumer_id)
            .copied()
            .unwrap_or(0)
    }

    /// Total number of publish calls.
    pub fn published(&self) -> u64 {
        self.lock().published
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A consumer handle on a [`MemoryBroker`].
pub struct MemoryQueue {
    broker: MemoryBroker,
    consumer_id: String,
    prefetch: Prefetch,
}

impl MemoryQueue {
    fn check_alive(&self) -> Result<(), QueueError> {
        if self.broker.lock().crashed.contains(&self.consumer_id) {
            return Err(QueueError::Closed);
        }
        Ok(())
    }

    fn try_pop(&self) -> Option<Vec<u8>> {
        let mut state = self.broker.lock();
        let payload = state.pending.pop_back()?;
        state
            .in_flight
            .insert(self.consumer_id.clone(), payload.clone());
        Some(payload)
    }

    fn settle(&self, delivery: &Delivery) -> Result<MutexGuard<'_, BrokerState>, QueueError> {
        self.check_alive()?;
        self.prefetch.check_outstanding(delivery)?;

        let mut state = self.broker.lock();
        state.in_flight.remove(&self.consumer_id);
        self.prefetch.settle();
        Ok(state)
    }
}

#[async_trait]
impl Transport for MemoryQueue {
    fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    async fn publish(&self, payload: &[u8]) -> Result<(), QueueError> {
        {
            let mut state = self.broker.lock();
            state.pending.push_front(payload.to_vec());
            state.published += 1;
        }
        self.broker.notify.notify_waiters();
        Ok(())
    }

    async fn consume(&self, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        self.check_alive()?;
        self.prefetch.check_free()?;

        if let Some(payload) = self.try_pop() {
            return Ok(Some(self.prefetch.hand_out(payload)));
        }

        let notified = self.broker.notify.notified();
        let _ = tokio::time::timeout(wait, notified).await;

        Ok(self
            .try_pop()
            .map(|payload| self.prefetch.hand_out(payload)))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.settle(delivery)?;
        Ok(())
    }

    async fn reject(
        &self,
        delivery: &Delivery,
        requeue: bool,
        reason: &str,
    ) -> Result<(), QueueError> {
        let mut state = self.settle(delivery)?;

        if requeue {
            state.pending.push_back(delivery.payload().to_vec());
        } else {
            state
                .dead_letters
                .push(DeadLetterEntry::new(delivery, reason, &self.consumer_id));
        }
        drop(state);

        self.broker.notify.notify_waiters();
        Ok(())
    }

    async fn requeue(&self, delivery: &Delivery, payload: &[u8]) -> Result<(), QueueError> {
        let mut state = self.settle(delivery)?;
        state.pending.push_front(payload.to_vec());
        state.published += 1;
        drop(state);

        self.broker.notify.notify_waiters();
        Ok(())
    }

    async fn pump_liveness(&self) -> Result<(), QueueError> {
        self.check_alive()?;
        *self
            .broker
            .lock()
            .liveness_pumps
            .entry(self.consumer_id.clone())
            .or_insert(0) += 1;
        Ok(())
    }

    async fn recover_abandoned(&self) -> Result<usize, QueueError> {
        let mut state = self.broker.lock();
        let dead: Vec<String> = state
            .in_flight
            .keys()
            .filter(|id| state.crashed.contains(*id) && **id != self.consumer_id)
            .cloned()
            .collect();

        for id in &dead {
            if let Some(payload) = state.in_flight.remove(id) {
                state.pending.push_front(payload);
            }
        }
        drop(state);

        if !dead.is_empty() {
            self.broker.notify.notify_waiters();
        }
        Ok(dead.len())
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let state = self.broker.lock();
        Ok(QueueStats {
            queue_name: self.broker.name.clone(),
            pending: state.pending.len(),
            in_flight: state.in_flight.len(),
            dead_lettered: state.dead_letters.len(),
        })
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, QueueError> {
        let state = self.broker.lock();
        Ok(state.dead_letters.iter().rev().take(limit).cloned().collect())
    }

    async fn close(&self) -> Result<(), QueueError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_millis(10);

    #[tokio::test]
    async fn test_fifo_delivery_and_ack() {
        let broker = MemoryBroker::new("play");
        let queue = broker.connect("worker-0");

        queue.publish(b"first").await.unwrap();
        queue.publish(b"second").await.unwrap();

        let delivery = queue.consume(WAIT).await.unwrap().expect("message");
        assert_eq!(delivery.payload(), b"first");
        queue.ack(&delivery).await.unwrap();

        let delivery = queue.consume(WAIT).await.unwrap().expect("message");
        assert_eq!(delivery.payload(), b"second");
        queue.ack(&delivery).await.unwrap();

        assert!(queue.consume(WAIT).await.unwrap().is_none());
        assert!(queue.stats().await.unwrap().is_drained());
    }

    #[tokio::test]
    async fn test_prefetch_of_one() {
        let broker = MemoryBroker::new("play");
        let queue = broker.connect("worker-0");
        queue.publish(b"a").await.unwrap();
        queue.publish(b"b").await.unwrap();

        let _held = queue.consume(WAIT).await.unwrap().expect("message");
        assert!(matches!(
            queue.consume(WAIT).await,
            Err(QueueError::PrefetchExceeded(_))
        ));
    }

    #[tokio::test]
    async fn test_reject_routes_to_dead_letter_or_head() {
        let broker = MemoryBroker::new("play");
        let queue = broker.connect("worker-0");
        queue.publish(b"bad").await.unwrap();
        queue.publish(b"retry").await.unwrap();

        let bad = queue.consume(WAIT).await.unwrap().unwrap();
        queue.reject(&bad, false, "Malformed message").await.unwrap();

        let retry = queue.consume(WAIT).await.unwrap().unwrap();
        queue.reject(&retry, true, "").await.unwrap();

        let again = queue.consume(WAIT).await.unwrap().unwrap();
        assert_eq!(again.payload(), b"retry");

        let dead = queue.dead_letters(10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].payload, "bad");
        assert_eq!(dead[0].reason, "Malformed message");
    }

    #[tokio::test]
    async fn test_requeue_publishes_fresh_copy_at_tail() {
        let broker = MemoryBroker::new("play");
        let queue = broker.connect("worker-0");
        queue.publish(b"job-1").await.unwrap();
        queue.publish(b"job-2").await.unwrap();

        let first = queue.consume(WAIT).await.unwrap().unwrap();
        queue.requeue(&first, b"job-1-copy").await.unwrap();

        assert_eq!(broker.pending(), vec![b"job-2".to_vec(), b"job-1-copy".to_vec()]);
        assert_eq!(queue.stats().await.unwrap().in_flight, 0);
    }

    #[tokio::test]
    async fn test_crashed_consumer_message_is_redelivered() {
        let broker = MemoryBroker::new("play");
        let crashed = broker.connect("worker-0");
        let survivor = broker.connect("worker-1");
        crashed.publish(b"long game").await.unwrap();

        let _lost = crashed.consume(WAIT).await.unwrap().unwrap();
        broker.crash("worker-0");

        assert!(survivor.consume(WAIT).await.unwrap().is_none());
        assert_eq!(survivor.recover_abandoned().await.unwrap(), 1);

        let redelivered = survivor.consume(WAIT).await.unwrap().unwrap();
        assert_eq!(redelivered.payload(), b"long game");
    }

    #[tokio::test]
    async fn test_liveness_pumps_are_counted() {
        let broker = MemoryBroker::new("play");
        let queue = broker.connect("worker-0");

        queue.pump_liveness().await.unwrap();
        queue.pump_liveness().await.unwrap();

        assert_eq!(broker.liveness_pumps("worker-0"), 2);
        assert_eq!(broker.liveness_pumps("worker-1"), 0);
    }
}
