//! # Traffic hints.
//!
//! A hint announces "this function's queue has work" so an agent knows to
//! start consuming from it. Hints are cheap and idempotent: the supervisor
//! coalesces repeats by checking whether a consumer is already running.
//!
//! The payload is the bare function name (`functions/<slug>`); the consumer
//! side derives the queue subject itself, keeping producers out of the
//! subject namespace.

use std::sync::Arc;
use std::time::Duration;

use crate::broker::{Broker, BrokerConsumer, ConsumerConfig, Delivery};
use crate::error::Error;
use crate::names::FunctionName;

use super::publisher::{STREAM_TASKS, SUBJECT_HINTS};

/// Publishes and consumes queue-traffic hints.
#[derive(Clone)]
pub struct HintClient {
    broker: Arc<dyn Broker>,
}

impl HintClient {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }

    /// Announces traffic on `function`'s queue.
    pub async fn publish_hint(&self, function: &FunctionName) -> Result<(), Error> {
        self.broker
            .publish(SUBJECT_HINTS, function.as_str().as_bytes())
            .await
            .map_err(|e| Error::BrokerUnavailable {
                reason: e.to_string(),
            })?;
        Ok(())
    }

    /// Creates the agent's durable hint consumer (`<pod>-hints`).
    ///
    /// Hints are processed one at a time (`max_ack_pending = 1`); a lost
    /// hint only delays consumption until the next one arrives.
    pub async fn subscribe(
        &self,
        pod_name: &str,
        ack_wait: Duration,
        max_deliver: u64,
        backoff: Vec<Duration>,
    ) -> Result<Arc<dyn BrokerConsumer>, Error> {
        let consumer = self
            .broker
            .create_consumer(
                STREAM_TASKS,
                ConsumerConfig {
                    durable_name: format!("{pod_name}-hints"),
                    filter_subject: SUBJECT_HINTS.into(),
                    ack_wait,
                    max_ack_pending: 1,
                    max_deliver,
                    backoff,
                },
            )
            .await
            .map_err(|e| Error::BrokerUnavailable {
                reason: e.to_string(),
            })?;
        Ok(consumer)
    }

    /// Decodes a hint delivery into the function it announces.
    pub fn decode(delivery: &Delivery) -> Result<FunctionName, Error> {
        let raw = std::str::from_utf8(&delivery.payload)
            .map_err(|_| Error::invalid_argument("hint payload is not utf-8"))?;
        FunctionName::parse(raw)
    }
}
