//! # In-process broker with JetStream-style delivery semantics.
//!
//! [`MemoryBroker`] implements the [`Broker`] contract for a single process:
//! streams are append-only logs bound to subject filters, durable consumers
//! are persistent cursors keyed by name, and delivery follows the
//! at-least-once rules of the contract.
//!
//! ## Rules
//! - A durable consumer keeps its cursor across `create_consumer` calls
//!   with the same name; the supplied config is ignored for an existing
//!   durable.
//! - A delivery not acked within `ack_wait` becomes eligible for
//!   redelivery; the expiry itself consumes an attempt.
//! - A nak schedules redelivery after `backoff[attempt - 1]` (the ladder is
//!   clamped to its last entry).
//! - Once `max_deliver` attempts are spent, the message is dead-lettered:
//!   removed from the consumer's pending set, never delivered again.
//! - New deliveries stop while `max_ack_pending` messages are outstanding
//!   (in flight or awaiting a backoff slot); redeliveries are exempt since
//!   they already own a slot.
//! - Subject filters support a trailing `>` wildcard on stream bindings;
//!   consumer filters are exact subjects.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::time::{sleep, Instant};

use super::contract::{AckHandle, Broker, BrokerConsumer, ConsumerConfig, Delivery};
use super::error::BrokerError;

/// Single-process [`Broker`] implementation.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    streams: Arc<RwLock<HashMap<String, Arc<StreamState>>>>,
}

struct StreamState {
    subjects: RwLock<Vec<String>>,
    log: Mutex<Vec<StoredMessage>>,
    consumers: Mutex<HashMap<String, Arc<MemoryConsumer>>>,
    notify: Notify,
}

#[derive(Clone)]
struct StoredMessage {
    seq: u64,
    subject: String,
    payload: Vec<u8>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    async fn stream_for_subject(&self, subject: &str) -> Option<Arc<StreamState>> {
        let streams = self.streams.read().await;
        for stream in streams.values() {
            let subjects = stream.subjects.read().await;
            if subjects.iter().any(|f| subject_matches(f, subject)) {
                return Some(Arc::clone(stream));
            }
        }
        None
    }
}

/// Returns `true` when `filter` covers `subject`.
///
/// Exact match, or a trailing `>` wildcard covering any non-empty remainder
/// (`task.>` matches `task.hints` and `task.functions/foo`, never `task`).
fn subject_matches(filter: &str, subject: &str) -> bool {
    if let Some(prefix) = filter.strip_suffix('>') {
        subject.len() > prefix.len() && subject.starts_with(prefix)
    } else {
        filter == subject
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn ensure_stream(&self, name: &str, subjects: &[&str]) -> Result<(), BrokerError> {
        let mut streams = self.streams.write().await;
        let stream = streams.entry(name.to_string()).or_insert_with(|| {
            Arc::new(StreamState {
                subjects: RwLock::new(Vec::new()),
                log: Mutex::new(Vec::new()),
                consumers: Mutex::new(HashMap::new()),
                notify: Notify::new(),
            })
        });
        let mut bound = stream.subjects.write().await;
        for subject in subjects {
            if !bound.iter().any(|s| s == subject) {
                bound.push(subject.to_string());
            }
        }
        Ok(())
    }

    async fn publish(&self, subject: &str, payload: &[u8]) -> Result<(), BrokerError> {
        let stream =
            self.stream_for_subject(subject)
                .await
                .ok_or_else(|| BrokerError::StreamNotFound {
                    subject: subject.to_string(),
                })?;

        let mut log = stream.log.lock().await;
        let seq = log.len() as u64 + 1;
        log.push(StoredMessage {
            seq,
            subject: subject.to_string(),
            payload: payload.to_vec(),
        });
        drop(log);

        stream.notify.notify_waiters();
        Ok(())
    }

    async fn create_consumer(
        &self,
        stream: &str,
        cfg: ConsumerConfig,
    ) -> Result<Arc<dyn BrokerConsumer>, BrokerError> {
        let streams = self.streams.read().await;
        let stream = streams
            .get(stream)
            .ok_or_else(|| BrokerError::Unavailable {
                reason: format!("stream {stream:?} does not exist"),
            })?
            .clone();
        drop(streams);

        let mut consumers = stream.consumers.lock().await;
        if let Some(existing) = consumers.get(&cfg.durable_name) {
            return Ok(Arc::clone(existing) as Arc<dyn BrokerConsumer>);
        }

        let consumer = Arc::new(MemoryConsumer {
            inner: Arc::new(ConsumerInner {
                cfg: cfg.clone(),
                stream: Arc::downgrade(&stream),
                cursor: Mutex::new(Cursor {
                    next_seq: 1,
                    pending: HashMap::new(),
                }),
            }),
        });
        consumers.insert(cfg.durable_name, Arc::clone(&consumer));
        Ok(consumer as Arc<dyn BrokerConsumer>)
    }
}

/// Durable cursor over one subject of a stream.
pub struct MemoryConsumer {
    inner: Arc<ConsumerInner>,
}

struct ConsumerInner {
    cfg: ConsumerConfig,
    stream: Weak<StreamState>,
    cursor: Mutex<Cursor>,
}

struct Cursor {
    /// Next log sequence this cursor has not yet delivered.
    next_seq: u64,
    /// Delivered but unacked messages.
    pending: HashMap<u64, PendingState>,
}

#[derive(Debug, Clone, Copy)]
enum PendingState {
    /// Out with a consumer; redeliverable once `deadline` passes.
    InFlight { delivery_count: u64, deadline: Instant },
    /// Nak'd; redeliverable at `at`.
    Scheduled { delivery_count: u64, at: Instant },
}

impl PendingState {
    fn due_at(&self) -> Instant {
        match self {
            PendingState::InFlight { deadline, .. } => *deadline,
            PendingState::Scheduled { at, .. } => *at,
        }
    }

    fn delivery_count(&self) -> u64 {
        match self {
            PendingState::InFlight { delivery_count, .. }
            | PendingState::Scheduled { delivery_count, .. } => *delivery_count,
        }
    }
}

impl ConsumerInner {
    /// Attempts one delivery. Returns the delivery, or the earliest instant
    /// at which a pending message becomes redeliverable.
    async fn try_deliver(
        self: &Arc<Self>,
        stream: &Arc<StreamState>,
    ) -> (Option<Delivery>, Option<Instant>) {
        let mut cursor = self.cursor.lock().await;
        let now = Instant::now();
        let mut next_wake: Option<Instant> = None;

        // Redeliveries first; they already own an ack-pending slot.
        let mut due: Vec<u64> = cursor
            .pending
            .iter()
            .filter(|(_, p)| p.due_at() <= now)
            .map(|(seq, _)| *seq)
            .collect();
        due.sort_unstable();

        for seq in due {
            let count = cursor.pending[&seq].delivery_count();
            if count >= self.cfg.max_deliver {
                // Ack-wait expired on the final attempt: dead-letter.
                cursor.pending.remove(&seq);
                continue;
            }
            let attempt = count + 1;
            cursor.pending.insert(
                seq,
                PendingState::InFlight {
                    delivery_count: attempt,
                    deadline: now + self.cfg.ack_wait,
                },
            );
            let log = stream.log.lock().await;
            let msg = log[(seq - 1) as usize].clone();
            return (Some(self.delivery(msg, attempt)), None);
        }

        for p in cursor.pending.values() {
            let at = p.due_at();
            next_wake = Some(next_wake.map_or(at, |w: Instant| w.min(at)));
        }

        // New deliveries respect the in-flight ceiling.
        if cursor.pending.len() < self.cfg.max_ack_pending {
            let log = stream.log.lock().await;
            let start = (cursor.next_seq - 1) as usize;
            for msg in log.iter().skip(start) {
                if msg.subject != self.cfg.filter_subject {
                    continue;
                }
                cursor.next_seq = msg.seq + 1;
                cursor.pending.insert(
                    msg.seq,
                    PendingState::InFlight {
                        delivery_count: 1,
                        deadline: now + self.cfg.ack_wait,
                    },
                );
                return (Some(self.delivery(msg.clone(), 1)), None);
            }
            // Skip past non-matching prefix so the scan stays short.
            cursor.next_seq = log.len() as u64 + 1;
        }

        (None, next_wake)
    }

    fn delivery(self: &Arc<Self>, msg: StoredMessage, attempt: u64) -> Delivery {
        Delivery::new(
            msg.subject,
            msg.payload,
            attempt,
            Arc::new(MemoryAck {
                inner: Arc::clone(self),
                seq: msg.seq,
            }),
        )
    }
}

#[async_trait]
impl BrokerConsumer for MemoryConsumer {
    async fn fetch(&self, max_wait: Duration) -> Result<Delivery, BrokerError> {
        let deadline = Instant::now() + max_wait;

        loop {
            let stream = self
                .inner
                .stream
                .upgrade()
                .ok_or_else(|| BrokerError::Unavailable {
                    reason: "stream dropped".into(),
                })?;

            // Arm the wakeup before checking, so a publish between the check
            // and the wait is never missed.
            let notified = stream.notify.notified();
            tokio::pin!(notified);

            let (delivery, next_wake) = self.inner.try_deliver(&stream).await;
            if let Some(d) = delivery {
                return Ok(d);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(BrokerError::NoMessages);
            }
            let mut wait = deadline - now;
            if let Some(wake) = next_wake {
                wait = wait.min(wake.saturating_duration_since(now).max(Duration::from_millis(1)));
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = sleep(wait) => {}
            }
        }
    }
}

struct MemoryAck {
    inner: Arc<ConsumerInner>,
    seq: u64,
}

#[async_trait]
impl AckHandle for MemoryAck {
    async fn ack(&self) {
        let mut cursor = self.inner.cursor.lock().await;
        let removed = cursor.pending.remove(&self.seq).is_some();
        drop(cursor);

        if removed {
            if let Some(stream) = self.inner.stream.upgrade() {
                // A slot freed up; wake fetchers blocked on max_ack_pending.
                stream.notify.notify_waiters();
            }
        }
    }

    async fn nak(&self) {
        let mut cursor = self.inner.cursor.lock().await;
        let Some(state) = cursor.pending.get(&self.seq).copied() else {
            return;
        };
        let count = state.delivery_count();
        if count >= self.inner.cfg.max_deliver {
            // Attempts exhausted: dead-letter.
            cursor.pending.remove(&self.seq);
        } else {
            let delay = self
                .inner
                .cfg
                .backoff
                .get((count - 1) as usize)
                .or_else(|| self.inner.cfg.backoff.last())
                .copied()
                .unwrap_or(Duration::ZERO);
            cursor.pending.insert(
                self.seq,
                PendingState::Scheduled {
                    delivery_count: count,
                    at: Instant::now() + delay,
                },
            );
        }
        drop(cursor);

        if let Some(stream) = self.inner.stream.upgrade() {
            stream.notify.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn consumer_config(filter: &str) -> ConsumerConfig {
        ConsumerConfig {
            durable_name: "pod-test".into(),
            filter_subject: filter.into(),
            ack_wait: Duration::from_millis(200),
            max_ack_pending: 8,
            max_deliver: 3,
            backoff: vec![Duration::from_millis(10), Duration::from_millis(20)],
        }
    }

    async fn broker_with_stream() -> MemoryBroker {
        let broker = MemoryBroker::new();
        broker
            .ensure_stream("TASKS", &["tasks.execute", "task.>"])
            .await
            .unwrap();
        broker
    }

    #[test]
    fn subject_wildcards() {
        assert!(subject_matches("tasks.execute", "tasks.execute"));
        assert!(subject_matches("task.>", "task.hints"));
        assert!(subject_matches("task.>", "task.functions/foo"));
        assert!(!subject_matches("task.>", "task."));
        assert!(!subject_matches("task.>", "tasks.execute"));
        assert!(!subject_matches("tasks.execute", "tasks.cancel"));
    }

    #[tokio::test]
    async fn publish_rejects_unbound_subject() {
        let broker = broker_with_stream().await;
        assert!(matches!(
            broker.publish("orders.create", b"x").await,
            Err(BrokerError::StreamNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn fetch_delivers_in_publish_order() {
        let broker = broker_with_stream().await;
        broker.publish("task.functions/foo", b"one").await.unwrap();
        broker.publish("task.functions/bar", b"other").await.unwrap();
        broker.publish("task.functions/foo", b"two").await.unwrap();

        let cons = broker
            .create_consumer("TASKS", consumer_config("task.functions/foo"))
            .await
            .unwrap();

        let first = cons.fetch(Duration::from_millis(50)).await.unwrap();
        assert_eq!(first.payload, b"one");
        assert_eq!(first.attempt, 1);
        first.ack().await;

        let second = cons.fetch(Duration::from_millis(50)).await.unwrap();
        assert_eq!(second.payload, b"two");
        second.ack().await;

        // The bar message belongs to another consumer's filter.
        assert!(matches!(
            cons.fetch(Duration::from_millis(20)).await,
            Err(BrokerError::NoMessages)
        ));
    }

    #[tokio::test]
    async fn nak_redelivers_after_backoff() {
        let broker = broker_with_stream().await;
        broker.publish("task.functions/foo", b"poison").await.unwrap();
        let cons = broker
            .create_consumer("TASKS", consumer_config("task.functions/foo"))
            .await
            .unwrap();

        let d = cons.fetch(Duration::from_millis(50)).await.unwrap();
        d.nak().await;

        let d = cons.fetch(Duration::from_millis(200)).await.unwrap();
        assert_eq!(d.attempt, 2);
        d.ack().await;
    }

    #[tokio::test]
    async fn max_deliver_dead_letters() {
        let broker = broker_with_stream().await;
        broker.publish("task.functions/foo", b"poison").await.unwrap();
        let cons = broker
            .create_consumer("TASKS", consumer_config("task.functions/foo"))
            .await
            .unwrap();

        for attempt in 1..=3u64 {
            let d = cons.fetch(Duration::from_millis(500)).await.unwrap();
            assert_eq!(d.attempt, attempt);
            d.nak().await;
        }

        // Third nak spent the last attempt; the message is gone.
        assert!(matches!(
            cons.fetch(Duration::from_millis(100)).await,
            Err(BrokerError::NoMessages)
        ));
    }

    #[tokio::test]
    async fn ack_wait_expiry_redelivers() {
        let broker = broker_with_stream().await;
        broker.publish("task.functions/foo", b"slow").await.unwrap();
        let mut cfg = consumer_config("task.functions/foo");
        cfg.ack_wait = Duration::from_millis(30);
        let cons = broker.create_consumer("TASKS", cfg).await.unwrap();

        let d = cons.fetch(Duration::from_millis(50)).await.unwrap();
        assert_eq!(d.attempt, 1);
        // No ack: the delivery expires and comes back.
        let d = cons.fetch(Duration::from_millis(200)).await.unwrap();
        assert_eq!(d.attempt, 2);
        d.ack().await;
    }

    #[tokio::test]
    async fn max_ack_pending_gates_new_deliveries() {
        let broker = broker_with_stream().await;
        for i in 0..3 {
            broker
                .publish("task.functions/foo", format!("m{i}").as_bytes())
                .await
                .unwrap();
        }
        let mut cfg = consumer_config("task.functions/foo");
        cfg.max_ack_pending = 1;
        let cons = broker.create_consumer("TASKS", cfg).await.unwrap();

        let first = cons.fetch(Duration::from_millis(50)).await.unwrap();
        assert!(matches!(
            cons.fetch(Duration::from_millis(30)).await,
            Err(BrokerError::NoMessages)
        ));

        first.ack().await;
        let second = cons.fetch(Duration::from_millis(50)).await.unwrap();
        assert_eq!(second.payload, b"m1");
        second.ack().await;
    }

    #[tokio::test]
    async fn durable_consumer_keeps_cursor() {
        let broker = broker_with_stream().await;
        broker.publish("task.functions/foo", b"one").await.unwrap();
        broker.publish("task.functions/foo", b"two").await.unwrap();

        let cons = broker
            .create_consumer("TASKS", consumer_config("task.functions/foo"))
            .await
            .unwrap();
        cons.fetch(Duration::from_millis(50)).await.unwrap().ack().await;

        // Same durable name: same cursor, not a replay from the start.
        let again = broker
            .create_consumer("TASKS", consumer_config("task.functions/foo"))
            .await
            .unwrap();
        let d = again.fetch(Duration::from_millis(50)).await.unwrap();
        assert_eq!(d.payload, b"two");
        d.ack().await;
    }

    #[tokio::test]
    async fn ack_and_nak_are_idempotent() {
        let broker = broker_with_stream().await;
        broker.publish("task.functions/foo", b"once").await.unwrap();
        let cons = broker
            .create_consumer("TASKS", consumer_config("task.functions/foo"))
            .await
            .unwrap();

        let d = cons.fetch(Duration::from_millis(50)).await.unwrap();
        d.ack().await;
        d.ack().await;
        d.nak().await;

        assert!(matches!(
            cons.fetch(Duration::from_millis(30)).await,
            Err(BrokerError::NoMessages)
        ));
    }
}
