//! # Broker abstraction: ordered streams, durable consumers, versioned KV.
//!
//! The platform talks to its broker through a deliberately small surface
//! (publish, create consumer, fetch, ack, nak) plus a versioned key-value
//! bucket with per-key revisions. The traits are the seam; the in-memory
//! implementation in [`memory`] is the v1 transport and doubles as the test
//! harness.
//!
//! ## Contents
//! - [`Broker`], [`BrokerConsumer`], [`Delivery`], [`ConsumerConfig`] — the
//!   stream-side contract with at-least-once delivery and explicit acks.
//! - [`KvBucket`], [`KvEntry`] — compare-and-swap key-value storage.
//! - [`MemoryBroker`], [`MemoryKv`] — single-process implementations with
//!   JetStream-style semantics (durable cursors, ack-wait redelivery, nak
//!   backoff ladder, max-deliver dead-lettering).
//!
//! ## Delivery guarantees
//! - Within one subject, messages are delivered to a consumer in publish
//!   order; completion order is up to the consumer.
//! - A fetched message is redelivered unless acked within `ack_wait`.
//! - A nak schedules redelivery after the attempt's backoff delay.
//! - After `max_deliver` attempts the message is dead-lettered and will
//!   never be delivered again.

mod contract;
mod error;
mod kv;
mod memory;

pub use contract::{AckHandle, Broker, BrokerConsumer, ConsumerConfig, Delivery};
pub use error::BrokerError;
pub use kv::{KvBucket, KvEntry, MemoryKv};
pub use memory::MemoryBroker;
