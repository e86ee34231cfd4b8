//! Typed persistence for jobs, history and catalog snapshots on top of a
//! revisioned [`KvStore`].
//!
//! Layout:
//! - `/jobs/{id}`: one JSON [`Job`] per key
//! - `/history/seq`: last allocated history id
//! - `/history/entries/{id:020}`: one JSON [`HistoryEntry`] per key
//! - `/catalog/snapshot`: latest live catalog plus its timestamp
//!
//! Job mutations are optimistic: read with revision, apply a guarded closure,
//! compare-and-swap. A lost race re-reads and re-runs the guard, so two
//! conflicting transitions can never both commit.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use keel_common::{HistoryEntry, Job, JobStatus, Model, NewHistoryEntry};
use keel_meta::{CasOutcome, KvStore};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ControlError, Result};

const JOBS_PREFIX: &str = "/jobs/";
const HISTORY_SEQ_KEY: &str = "/history/seq";
const HISTORY_PREFIX: &str = "/history/entries/";
const CATALOG_SNAPSHOT_KEY: &str = "/catalog/snapshot";

const MAX_CAS_RETRIES: usize = 16;

/// Persisted copy of the last live catalog.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CatalogSnapshotRecord {
    pub models: Vec<Model>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct StateStore {
    kv: Arc<dyn KvStore>,
}

impl StateStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    pub fn kv(&self) -> &Arc<dyn KvStore> {
        &self.kv
    }

    fn job_key(id: &str) -> String {
        format!("{JOBS_PREFIX}{id}")
    }

    /// Insert a new job; fails if the id is taken.
    pub async fn create_job(&self, job: &Job) -> Result<()> {
        let value = serde_json::to_vec(job)?;
        match self.kv.compare_and_swap(&Self::job_key(&job.id), 0, value).await? {
            CasOutcome::Swapped { .. } => Ok(()),
            CasOutcome::Conflict { .. } => Err(ControlError::invalid(format!(
                "job {} already exists",
                job.id
            ))),
        }
    }

    pub async fn get_job(&self, id: &str) -> Result<Option<Job>> {
        match self.kv.get(&Self::job_key(id)).await? {
            Some(entry) => Ok(Some(serde_json::from_slice(&entry.value)?)),
            None => Ok(None),
        }
    }

    pub async fn require_job(&self, id: &str) -> Result<Job> {
        self.get_job(id)
            .await?
            .ok_or_else(|| ControlError::JobNotFound(id.to_string()))
    }

    /// Read-modify-write a job. `apply` sees the freshest stored copy on every
    /// attempt and may reject the change by returning an error, which is
    /// passed through untouched.
    pub async fn update_job<F>(&self, id: &str, mut apply: F) -> Result<Job>
    where
        F: FnMut(&mut Job) -> Result<()> + Send,
    {
        let key = Self::job_key(id);
        for _ in 0..MAX_CAS_RETRIES {
            let entry = self
                .kv
                .get(&key)
                .await?
                .ok_or_else(|| ControlError::JobNotFound(id.to_string()))?;
            let mut job: Job = serde_json::from_slice(&entry.value)?;
            apply(&mut job)?;
            job.updated_at = job.updated_at.max(Utc::now());

            let value = serde_json::to_vec(&job)?;
            match self.kv.compare_and_swap(&key, entry.revision, value).await? {
                CasOutcome::Swapped { .. } => return Ok(job),
                CasOutcome::Conflict { current_revision } => {
                    debug!(job_id = %id, current_revision, "job changed underneath update, retrying");
                }
            }
        }
        Err(ControlError::Conflict(format!(
            "job {id} kept changing during update"
        )))
    }

    /// Newest first. `limit == 0` returns everything.
    pub async fn list_jobs(&self, limit: usize) -> Result<Vec<Job>> {
        let mut jobs = self
            .kv
            .list_prefix(JOBS_PREFIX)
            .await?
            .into_iter()
            .map(|entry| serde_json::from_slice::<Job>(&entry.value))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        if limit > 0 {
            jobs.truncate(limit);
        }
        Ok(jobs)
    }

    pub async fn count_jobs_by_status(&self) -> Result<BTreeMap<JobStatus, usize>> {
        let mut counts = BTreeMap::new();
        for job in self.list_jobs(0).await? {
            *counts.entry(job.status).or_insert(0) += 1;
        }
        Ok(counts)
    }

    /// Remove all jobs, or only those in `status`. Returns the number removed.
    pub async fn delete_jobs(&self, status: Option<JobStatus>) -> Result<u64> {
        let Some(status) = status else {
            return Ok(self.kv.delete_prefix(JOBS_PREFIX).await?);
        };
        let mut removed = 0;
        for job in self.list_jobs(0).await? {
            if job.status == status && self.kv.delete(&Self::job_key(&job.id)).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn next_history_id(&self) -> Result<u64> {
        for _ in 0..MAX_CAS_RETRIES {
            let (next, revision) = match self.kv.get(HISTORY_SEQ_KEY).await? {
                Some(entry) => {
                    let current: u64 = String::from_utf8_lossy(&entry.value)
                        .trim()
                        .parse()
                        .map_err(|e| anyhow::anyhow!("corrupt history sequence: {e}"))?;
                    (current + 1, entry.revision)
                }
                None => (1, 0),
            };
            let outcome = self
                .kv
                .compare_and_swap(HISTORY_SEQ_KEY, revision, next.to_string().into_bytes())
                .await?;
            if outcome.is_swapped() {
                return Ok(next);
            }
        }
        Err(ControlError::Conflict(
            "history sequence kept changing".to_string(),
        ))
    }

    pub async fn append_history(&self, entry: NewHistoryEntry) -> Result<HistoryEntry> {
        let id = self.next_history_id().await?;
        let record = HistoryEntry {
            id,
            event: entry.event,
            model_id: entry.model_id,
            metadata: entry.metadata,
            created_at: Utc::now(),
        };
        let key = format!("{HISTORY_PREFIX}{id:020}");
        self.kv.put(&key, serde_json::to_vec(&record)?, None).await?;
        Ok(record)
    }

    /// Newest first. `limit == 0` returns everything.
    pub async fn list_history(&self, limit: usize) -> Result<Vec<HistoryEntry>> {
        let mut entries = self
            .kv
            .list_prefix(HISTORY_PREFIX)
            .await?
            .into_iter()
            .map(|entry| serde_json::from_slice::<HistoryEntry>(&entry.value))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        entries.sort_by(|a, b| b.id.cmp(&a.id));
        if limit > 0 {
            entries.truncate(limit);
        }
        Ok(entries)
    }

    /// Drops every entry. The sequence keeps counting so ids are never reused.
    pub async fn clear_history(&self) -> Result<u64> {
        Ok(self.kv.delete_prefix(HISTORY_PREFIX).await?)
    }

    pub async fn save_catalog_snapshot(&self, models: &[Model]) -> Result<DateTime<Utc>> {
        let record = CatalogSnapshotRecord {
            models: models.to_vec(),
            updated_at: Utc::now(),
        };
        self.kv
            .put(CATALOG_SNAPSHOT_KEY, serde_json::to_vec(&record)?, None)
            .await?;
        Ok(record.updated_at)
    }

    pub async fn load_catalog_snapshot(&self) -> Result<Option<CatalogSnapshotRecord>> {
        match self.kv.get(CATALOG_SNAPSHOT_KEY).await? {
            Some(entry) => Ok(Some(serde_json::from_slice(&entry.value)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_common::{LogLevel, JOB_TYPE_WEIGHT_INSTALL};
    use keel_meta::MemoryKvStore;

    fn store() -> StateStore {
        StateStore::new(Arc::new(MemoryKvStore::new()))
    }

    fn job(id: &str) -> Job {
        Job::new(id, JOB_TYPE_WEIGHT_INSTALL, serde_json::json!({"modelId": "foo/bar"}), 3)
    }

    #[tokio::test]
    async fn test_create_rejects_duplicate_id() {
        let store = store();
        store.create_job(&job("j1")).await.unwrap();
        let err = store.create_job(&job("j1")).await.unwrap_err();
        assert!(matches!(err, ControlError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_update_guard_error_is_returned_unchanged() {
        let store = store();
        store.create_job(&job("j1")).await.unwrap();

        let err = store
            .update_job("j1", |j| Err(ControlError::not_retryable(&j.id, j.status)))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::InvalidTransition { .. }));
        assert_eq!(store.require_job("j1").await.unwrap().status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_update_missing_job_is_not_found() {
        let err = store().update_job("nope", |_| Ok(())).await.unwrap_err();
        assert!(matches!(err, ControlError::JobNotFound(_)));
    }

    #[tokio::test]
    async fn test_racing_terminal_transitions_commit_once() {
        let store = store();
        store.create_job(&job("j1")).await.unwrap();
        store
            .update_job("j1", |j| {
                j.status = JobStatus::Running;
                Ok(())
            })
            .await
            .unwrap();

        let finish = |target: JobStatus| {
            let store = store.clone();
            async move {
                store
                    .update_job("j1", move |j| {
                        if j.status != JobStatus::Running {
                            return Err(ControlError::not_cancellable(&j.id, j.status));
                        }
                        j.status = target;
                        j.push_log(LogLevel::Info, format!("-> {target}"));
                        Ok(())
                    })
                    .await
            }
        };

        let (done, cancelled) = tokio::join!(
            tokio::spawn(finish(JobStatus::Done)),
            tokio::spawn(finish(JobStatus::Cancelled))
        );
        let outcomes = [done.unwrap().is_ok(), cancelled.unwrap().is_ok()];
        assert_eq!(outcomes.iter().filter(|ok| **ok).count(), 1);

        let stored = store.require_job("j1").await.unwrap();
        assert!(stored.status.is_terminal());
        assert_eq!(stored.logs.len(), 1);
    }

    #[tokio::test]
    async fn test_list_jobs_newest_first_with_limit() {
        let store = store();
        for (i, id) in ["a", "b", "c"].iter().enumerate() {
            let mut j = job(id);
            j.created_at = Utc::now() + chrono::Duration::seconds(i as i64);
            store.create_job(&j).await.unwrap();
        }
        let ids: Vec<_> = store
            .list_jobs(2)
            .await
            .unwrap()
            .into_iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(ids, vec!["c", "b"]);
    }

    #[tokio::test]
    async fn test_delete_jobs_by_status() {
        let store = store();
        store.create_job(&job("a")).await.unwrap();
        store.create_job(&job("b")).await.unwrap();
        store
            .update_job("b", |j| {
                j.status = JobStatus::Failed;
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(store.delete_jobs(Some(JobStatus::Failed)).await.unwrap(), 1);
        let counts = store.count_jobs_by_status().await.unwrap();
        assert_eq!(counts.get(&JobStatus::Pending), Some(&1));
        assert_eq!(counts.get(&JobStatus::Failed), None);
        assert_eq!(store.delete_jobs(None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_history_ids_are_monotonic_across_clear() {
        let store = store();
        let first = store
            .append_history(NewHistoryEntry::new("model_activated", Some("m".into()), serde_json::Value::Null))
            .await
            .unwrap();
        let second = store
            .append_history(NewHistoryEntry::new("model_deactivated", None, serde_json::Value::Null))
            .await
            .unwrap();
        assert_eq!((first.id, second.id), (1, 2));

        let listed = store.list_history(0).await.unwrap();
        assert_eq!(listed[0].event, "model_deactivated");

        assert_eq!(store.clear_history().await.unwrap(), 2);
        let third = store
            .append_history(NewHistoryEntry::new("model_activated", None, serde_json::Value::Null))
            .await
            .unwrap();
        assert_eq!(third.id, 3);
    }

    #[tokio::test]
    async fn test_catalog_snapshot_overwritten_wholesale() {
        let store = store();
        assert!(store.load_catalog_snapshot().await.unwrap().is_none());

        let a = Model { id: "a".into(), ..Default::default() };
        let b = Model { id: "b".into(), ..Default::default() };
        store.save_catalog_snapshot(&[a, b.clone()]).await.unwrap();
        let ts = store.save_catalog_snapshot(&[b]).await.unwrap();

        let snap = store.load_catalog_snapshot().await.unwrap().unwrap();
        assert_eq!(snap.models.len(), 1);
        assert_eq!(snap.models[0].id, "b");
        assert_eq!(snap.updated_at, ts);
    }
}
