//! # Stream-side broker contract.
//!
//! Minimal interface over an ordered, persistent message log with durable
//! consumers and explicit acknowledgement. The shape mirrors what the agent
//! actually needs; any JetStream-like system can sit behind it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::error::BrokerError;

/// Configuration of a durable consumer.
///
/// | field | meaning |
/// |---|---|
/// | `durable_name` | stable cursor identity across restarts |
/// | `filter_subject` | only messages on this subject are delivered |
/// | `ack_wait` | redeliver if not acked within this window |
/// | `max_ack_pending` | ceiling on unacked deliveries in flight |
/// | `max_deliver` | attempts before the message is dead-lettered |
/// | `backoff` | per-attempt redelivery delays after a nak |
///
/// Acknowledgement is always explicit; there is no auto-ack mode.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub durable_name: String,
    pub filter_subject: String,
    pub ack_wait: Duration,
    pub max_ack_pending: usize,
    pub max_deliver: u64,
    pub backoff: Vec<Duration>,
}

/// One delivered message plus its acknowledgement handle.
pub struct Delivery {
    pub subject: String,
    pub payload: Vec<u8>,
    /// 1-based delivery attempt for this consumer.
    pub attempt: u64,
    handle: Arc<dyn AckHandle>,
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("subject", &self.subject)
            .field("payload", &self.payload)
            .field("attempt", &self.attempt)
            .finish()
    }
}

impl Delivery {
    pub fn new(subject: String, payload: Vec<u8>, attempt: u64, handle: Arc<dyn AckHandle>) -> Self {
        Self {
            subject,
            payload,
            attempt,
            handle,
        }
    }

    /// Acknowledges the message; it will not be redelivered. Idempotent.
    pub async fn ack(&self) {
        self.handle.ack().await;
    }

    /// Negatively acknowledges the message; the broker redelivers it after
    /// the attempt's backoff delay, or dead-letters it once `max_deliver`
    /// attempts are spent. Idempotent.
    pub async fn nak(&self) {
        self.handle.nak().await;
    }
}

/// Acknowledgement back-channel owned by the broker implementation.
#[async_trait]
pub trait AckHandle: Send + Sync {
    async fn ack(&self);
    async fn nak(&self);
}

/// A durable consumer: a persistent cursor over one subject of a stream.
#[async_trait]
pub trait BrokerConsumer: Send + Sync + 'static {
    /// Pulls a single message, waiting at most `max_wait`.
    ///
    /// Returns [`BrokerError::NoMessages`] when the deadline elapses without
    /// a delivery.
    async fn fetch(&self, max_wait: Duration) -> Result<Delivery, BrokerError>;
}

/// The broker connection.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Creates the stream if absent and extends its subject filters
    /// otherwise. Idempotent.
    async fn ensure_stream(&self, name: &str, subjects: &[&str]) -> Result<(), BrokerError>;

    /// Appends a message to the stream bound to `subject`.
    async fn publish(&self, subject: &str, payload: &[u8]) -> Result<(), BrokerError>;

    /// Returns the durable consumer named in `cfg`, creating it if absent.
    /// An existing durable keeps its cursor; the supplied configuration is
    /// ignored in that case.
    async fn create_consumer(
        &self,
        stream: &str,
        cfg: ConsumerConfig,
    ) -> Result<Arc<dyn BrokerConsumer>, BrokerError>;
}
