//! # Versioned key-value bucket.
//!
//! Storage contract for the task record store: every key carries a
//! bucket-scoped revision that increases on each write, and updates are
//! compare-and-swap against the caller's expected revision. This is the
//! only mutation path the record store uses; correctness of the task state
//! machine rests entirely on these revisions.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::error::BrokerError;

/// A stored value together with its revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    pub key: String,
    pub value: Vec<u8>,
    pub revision: u64,
}

/// Versioned bucket with per-key revisions and CAS updates.
#[async_trait]
pub trait KvBucket: Send + Sync + 'static {
    /// Atomic create-if-absent. Fails with [`BrokerError::KeyExists`] when
    /// the key is present.
    async fn create(&self, key: &str, value: &[u8]) -> Result<u64, BrokerError>;

    /// Returns the entry and its current revision.
    async fn get(&self, key: &str) -> Result<KvEntry, BrokerError>;

    /// Compare-and-swap write: succeeds only while the key still holds
    /// `expected_revision`; fails with [`BrokerError::WrongRevision`]
    /// otherwise.
    async fn update(
        &self,
        key: &str,
        value: &[u8],
        expected_revision: u64,
    ) -> Result<u64, BrokerError>;

    /// Tombstones the key. No revision guard.
    async fn delete(&self, key: &str) -> Result<(), BrokerError>;

    /// Returns all live keys in lexicographic order.
    async fn keys(&self) -> Result<Vec<String>, BrokerError>;
}

/// In-process [`KvBucket`] backed by an ordered map.
pub struct MemoryKv {
    state: RwLock<KvState>,
}

struct KvState {
    next_revision: u64,
    entries: BTreeMap<String, (u64, Vec<u8>)>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(KvState {
                next_revision: 1,
                entries: BTreeMap::new(),
            }),
        }
    }
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvBucket for MemoryKv {
    async fn create(&self, key: &str, value: &[u8]) -> Result<u64, BrokerError> {
        let mut state = self.state.write().await;
        if state.entries.contains_key(key) {
            return Err(BrokerError::KeyExists { key: key.into() });
        }
        let revision = state.next_revision;
        state.next_revision += 1;
        state.entries.insert(key.into(), (revision, value.to_vec()));
        Ok(revision)
    }

    async fn get(&self, key: &str) -> Result<KvEntry, BrokerError> {
        let state = self.state.read().await;
        let (revision, value) = state
            .entries
            .get(key)
            .ok_or_else(|| BrokerError::KeyNotFound { key: key.into() })?;
        Ok(KvEntry {
            key: key.into(),
            value: value.clone(),
            revision: *revision,
        })
    }

    async fn update(
        &self,
        key: &str,
        value: &[u8],
        expected_revision: u64,
    ) -> Result<u64, BrokerError> {
        let mut state = self.state.write().await;
        let current = match state.entries.get(key) {
            Some((rev, _)) => *rev,
            None => return Err(BrokerError::KeyNotFound { key: key.into() }),
        };
        if current != expected_revision {
            return Err(BrokerError::WrongRevision {
                key: key.into(),
                expected: expected_revision,
                current,
            });
        }
        let revision = state.next_revision;
        state.next_revision += 1;
        state.entries.insert(key.into(), (revision, value.to_vec()));
        Ok(revision)
    }

    async fn delete(&self, key: &str) -> Result<(), BrokerError> {
        let mut state = self.state.write().await;
        if state.entries.remove(key).is_none() {
            return Err(BrokerError::KeyNotFound { key: key.into() });
        }
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, BrokerError> {
        let state = self.state.read().await;
        Ok(state.entries.keys().cloned().collect())
    }
}
