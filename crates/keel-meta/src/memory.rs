use std::{collections::BTreeMap, sync::Arc};

use anyhow::Result;
use tokio::sync::{broadcast, RwLock};
use tokio_stream::{wrappers::BroadcastStream, StreamExt};

use crate::types::{CasOutcome, KvEntry, KvStore, WatchEvent, WatchStream};

/// Process-local store used by tests and single-process deployments.
/// TTLs are accepted but not enforced.
#[derive(Debug, Clone)]
pub struct MemoryKvStore {
    inner: Arc<RwLock<Inner>>,
    tx: broadcast::Sender<WatchEvent>,
}

#[derive(Debug, Default)]
struct Inner {
    revision: u64,
    kv: BTreeMap<String, (Vec<u8>, u64)>,
}

impl Inner {
    fn next_revision(&mut self) -> u64 {
        self.revision = self.revision.saturating_add(1);
        self.revision
    }

    fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.kv
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect()
    }
}

impl MemoryKvStore {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(1024);
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            tx,
        }
    }

    fn emit(&self, events: Vec<WatchEvent>) {
        for event in events {
            let _ = self.tx.send(event);
        }
    }
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl KvStore for MemoryKvStore {
    async fn put(&self, key: &str, value: Vec<u8>, _ttl_ms: Option<u64>) -> Result<u64> {
        let (rev, event) = {
            let mut inner = self.inner.write().await;
            let rev = inner.next_revision();
            inner.kv.insert(key.to_string(), (value.clone(), rev));
            (
                rev,
                WatchEvent {
                    key: key.to_string(),
                    value: Some(value),
                    revision: rev,
                },
            )
        };
        self.emit(vec![event]);
        Ok(rev)
    }

    async fn get(&self, key: &str) -> Result<Option<KvEntry>> {
        let inner = self.inner.read().await;
        Ok(inner.kv.get(key).map(|(v, rev)| KvEntry {
            key: key.to_string(),
            value: v.clone(),
            revision: *rev,
        }))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let event = {
            let mut inner = self.inner.write().await;
            if inner.kv.remove(key).is_none() {
                return Ok(false);
            }
            let rev = inner.next_revision();
            WatchEvent {
                key: key.to_string(),
                value: None,
                revision: rev,
            }
        };
        self.emit(vec![event]);
        Ok(true)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        let events = {
            let mut inner = self.inner.write().await;
            let keys = inner.keys_with_prefix(prefix);
            if keys.is_empty() {
                return Ok(0);
            }
            // etcd removes a range under a single revision; mirror that here.
            let rev = inner.next_revision();
            keys.into_iter()
                .map(|key| {
                    inner.kv.remove(&key);
                    WatchEvent {
                        key,
                        value: None,
                        revision: rev,
                    }
                })
                .collect::<Vec<_>>()
        };
        let removed = events.len() as u64;
        self.emit(events);
        Ok(removed)
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<KvEntry>> {
        let inner = self.inner.read().await;
        let out = inner
            .kv
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, (v, rev))| KvEntry {
                key: k.clone(),
                value: v.clone(),
                revision: *rev,
            })
            .collect();
        Ok(out)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_revision: u64,
        value: Vec<u8>,
    ) -> Result<CasOutcome> {
        let (outcome, event) = {
            let mut inner = self.inner.write().await;
            let current_rev = inner.kv.get(key).map(|(_, rev)| *rev).unwrap_or(0);
            if current_rev != expected_revision {
                return Ok(CasOutcome::Conflict {
                    current_revision: current_rev,
                });
            }
            let rev = inner.next_revision();
            inner.kv.insert(key.to_string(), (value.clone(), rev));
            (
                CasOutcome::Swapped { revision: rev },
                WatchEvent {
                    key: key.to_string(),
                    value: Some(value),
                    revision: rev,
                },
            )
        };
        self.emit(vec![event]);
        Ok(outcome)
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
        start_revision_exclusive: Option<u64>,
    ) -> Result<WatchStream> {
        let prefix = prefix.to_string();
        let min_rev = start_revision_exclusive.unwrap_or(0);
        let rx = self.tx.subscribe();
        let stream = BroadcastStream::new(rx).filter_map(move |msg| match msg {
            Ok(ev) if ev.revision > min_rev && ev.key.starts_with(&prefix) => Some(ev),
            _ => None,
        });

        Ok(Box::pin(stream))
    }
}
