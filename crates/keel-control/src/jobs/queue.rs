//! Hand-off of jobs to out-of-process workers through the shared store.
//!
//! A message key is derived from `(job id, attempt, payload)`, so dispatching
//! the same attempt twice is a no-op while a retry gets a fresh message.
//! Workers claim a message by compare-and-swap before running it and delete
//! it once done.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keel_common::{Job, WeightInstallRequest};
use keel_meta::{CasOutcome, KvStore, WatchStream};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::{ControlError, Result};

pub const WEIGHT_INSTALL_QUEUE_PREFIX: &str = "/queue/weight_install/";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueueMessage {
    pub job_id: String,
    pub attempt: u32,
    pub request: WeightInstallRequest,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued { key: String },
    AlreadyQueued { key: String },
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: &Job, request: &WeightInstallRequest) -> Result<EnqueueOutcome>;
    /// Messages waiting for a worker.
    async fn depth(&self) -> Result<usize>;
}

/// Content hash identifying one dispatch of one attempt.
pub fn dispatch_hash(job_id: &str, attempt: u32, request: &WeightInstallRequest) -> Result<String> {
    let mut hasher = Sha256::new();
    hasher.update(job_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(attempt.to_be_bytes());
    hasher.update([0u8]);
    hasher.update(serde_json::to_vec(request)?);
    Ok(hex::encode(hasher.finalize()))
}

#[derive(Debug, Clone)]
pub struct ClaimedMessage {
    pub key: String,
    pub message: QueueMessage,
    /// The worker whose expired claim was taken over, if any.
    pub reclaimed_from: Option<String>,
}

#[derive(Clone)]
pub struct KvJobQueue {
    kv: Arc<dyn KvStore>,
    prefix: String,
    /// Claims older than this are assumed to belong to a dead worker.
    claim_timeout: Duration,
}

impl KvJobQueue {
    pub fn new(kv: Arc<dyn KvStore>, claim_timeout: Duration) -> Self {
        Self {
            kv,
            prefix: WEIGHT_INSTALL_QUEUE_PREFIX.to_string(),
            claim_timeout,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub async fn watch(&self) -> Result<WatchStream> {
        Ok(self.kv.watch_prefix(&self.prefix, None).await?)
    }

    fn claimable(&self, msg: &QueueMessage, now: DateTime<Utc>) -> bool {
        match msg.claimed_at {
            None => msg.claimed_by.is_none(),
            Some(at) => (now - at)
                .to_std()
                .map(|age| age > self.claim_timeout)
                .unwrap_or(false),
        }
    }

    /// Claim the oldest claimable message for `worker_id`.
    pub async fn claim_next(&self, worker_id: &str) -> Result<Option<ClaimedMessage>> {
        let now = Utc::now();
        let mut candidates = Vec::new();
        for entry in self.kv.list_prefix(&self.prefix).await? {
            match serde_json::from_slice::<QueueMessage>(&entry.value) {
                Ok(msg) if self.claimable(&msg, now) => candidates.push((entry, msg)),
                Ok(_) => {}
                Err(e) => {
                    warn!(key = %entry.key, error = %e, "dropping undecodable queue message");
                    let _ = self.kv.delete(&entry.key).await;
                }
            }
        }
        candidates.sort_by(|a, b| a.1.enqueued_at.cmp(&b.1.enqueued_at));

        for (entry, mut msg) in candidates {
            let reclaimed_from = msg.claimed_by.take();
            if let Some(previous) = &reclaimed_from {
                warn!(job_id = %msg.job_id, %previous, "reclaiming stale queue message");
            }
            msg.claimed_by = Some(worker_id.to_string());
            msg.claimed_at = Some(now);
            let value = serde_json::to_vec(&msg)?;
            match self.kv.compare_and_swap(&entry.key, entry.revision, value).await? {
                CasOutcome::Swapped { .. } => {
                    return Ok(Some(ClaimedMessage {
                        key: entry.key,
                        message: msg,
                        reclaimed_from,
                    }))
                }
                CasOutcome::Conflict { .. } => {
                    debug!(key = %entry.key, "queue message claimed by another worker");
                }
            }
        }
        Ok(None)
    }

    pub async fn ack(&self, claimed: &ClaimedMessage) -> Result<()> {
        self.kv.delete(&claimed.key).await?;
        Ok(())
    }
}

#[async_trait]
impl JobQueue for KvJobQueue {
    async fn enqueue(&self, job: &Job, request: &WeightInstallRequest) -> Result<EnqueueOutcome> {
        let key = format!("{}{}", self.prefix, dispatch_hash(&job.id, job.attempt, request)?);
        let msg = QueueMessage {
            job_id: job.id.clone(),
            attempt: job.attempt,
            request: request.clone(),
            enqueued_at: Utc::now(),
            claimed_by: None,
            claimed_at: None,
        };
        let outcome = self
            .kv
            .compare_and_swap(&key, 0, serde_json::to_vec(&msg)?)
            .await
            .map_err(|e| ControlError::queue(format!("enqueue failed: {e}")))?;
        Ok(match outcome {
            CasOutcome::Swapped { .. } => EnqueueOutcome::Enqueued { key },
            CasOutcome::Conflict { .. } => EnqueueOutcome::AlreadyQueued { key },
        })
    }

    async fn depth(&self) -> Result<usize> {
        let now = Utc::now();
        let entries = self.kv.list_prefix(&self.prefix).await?;
        Ok(entries
            .iter()
            .filter_map(|e| serde_json::from_slice::<QueueMessage>(&e.value).ok())
            .filter(|m| self.claimable(m, now))
            .count())
    }
}
