use std::pin::Pin;

use anyhow::Result;
use async_trait::async_trait;
use futures_core::Stream;
use serde::{Deserialize, Serialize};

/// A stored value together with the revision at which it was last modified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    pub key: String,
    pub value: Vec<u8>,
    pub revision: u64,
}

/// A change observed under a watched prefix. `value` is `None` for deletions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WatchEvent {
    pub key: String,
    pub value: Option<Vec<u8>>,
    pub revision: u64,
}

pub type WatchStream = Pin<Box<dyn Stream<Item = WatchEvent> + Send>>;

/// Result of a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    /// The write was applied at `revision`.
    Swapped { revision: u64 },
    /// The key was at `current_revision` (0 when absent) and nothing was written.
    Conflict { current_revision: u64 },
}

impl CasOutcome {
    pub fn is_swapped(&self) -> bool {
        matches!(self, CasOutcome::Swapped { .. })
    }
}

/// Revisioned key/value storage shared by every control-plane process.
///
/// `compare_and_swap` with `expected_revision == 0` only succeeds when the key
/// does not exist, which doubles as put-if-absent.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn put(&self, key: &str, value: Vec<u8>, ttl_ms: Option<u64>) -> Result<u64>;
    async fn get(&self, key: &str) -> Result<Option<KvEntry>>;
    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> Result<bool>;
    /// Returns the number of removed keys.
    async fn delete_prefix(&self, prefix: &str) -> Result<u64>;
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<KvEntry>>;

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_revision: u64,
        value: Vec<u8>,
    ) -> Result<CasOutcome>;

    async fn watch_prefix(
        &self,
        prefix: &str,
        start_revision_exclusive: Option<u64>,
    ) -> Result<WatchStream>;
}
