//! Weight-install jobs: creation, dispatch, execution and the operator
//! actions (cancel, retry) layered on top.

pub mod installer;
pub mod queue;
pub mod registry;
pub mod weights;
mod worker;

pub use installer::{
    HfCliFetcher, InstallContext, InstallOptions, InstallProgress, LocalWeightInstaller,
    WeightFetcher, WeightInstaller,
};
pub use queue::{ClaimedMessage, EnqueueOutcome, JobQueue, KvJobQueue, QueueMessage};
pub use registry::{TaskRegistry, TaskTicket};
pub use weights::{WeightInfo, WeightInventory};
pub use worker::QueueWorker;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use keel_common::history::{HISTORY_WEIGHT_INSTALL_COMPLETED, HISTORY_WEIGHT_INSTALL_FAILED};
use keel_common::{
    Event, Job, JobLogEntry, JobStatus, LogLevel, NewHistoryEntry, WeightInstallRequest,
    JOB_TYPE_WEIGHT_INSTALL,
};
use serde::Serialize;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::{Capability, ControlConfig};
use crate::error::{ControlError, ErrorKind, Result};
use crate::events::EventBus;
use crate::metrics::JobMetrics;
use crate::store::StateStore;

const PROGRESS_BACKLOG: usize = 32;

#[derive(Debug, Clone)]
pub struct JobSettings {
    pub install_timeout: Duration,
    pub default_max_attempts: u32,
    pub install_concurrency: usize,
    pub hf_token: Option<String>,
    pub weights_pvc_name: Option<String>,
    pub inference_model_root: Option<String>,
}

impl From<&ControlConfig> for JobSettings {
    fn from(cfg: &ControlConfig) -> Self {
        Self {
            install_timeout: cfg.install_timeout,
            default_max_attempts: cfg.default_max_attempts,
            install_concurrency: cfg.install_concurrency.max(1),
            hf_token: cfg.hf_token.clone(),
            weights_pvc_name: cfg.weights_pvc_name.clone(),
            inference_model_root: Some(cfg.inference_model_root.clone()).filter(|s| !s.is_empty()),
        }
    }
}

/// Where a dispatched attempt will run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Queued,
    Inline,
}

#[derive(Debug, Clone, Serialize)]
pub struct Submission {
    pub job: Job,
    pub mode: ExecutionMode,
}

#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub job_type: Option<String>,
    /// Case-insensitive match against the payload's model id.
    pub model_id: Option<String>,
    /// 0 means no limit.
    pub limit: usize,
}

impl JobFilter {
    fn matches(&self, job: &Job) -> bool {
        if self.status.is_some_and(|s| s != job.status) {
            return false;
        }
        if self.job_type.as_deref().is_some_and(|t| t != job.job_type) {
            return false;
        }
        match self.model_id.as_deref().filter(|m| !m.is_empty()) {
            Some(wanted) => job
                .payload_model_id()
                .is_some_and(|m| m.eq_ignore_ascii_case(wanted)),
            None => true,
        }
    }
}

enum Outcome {
    Finished(anyhow::Result<WeightInfo>),
    Cancelled,
    TimedOut,
}

fn attempt_label(job: &Job) -> String {
    if job.max_attempts == 0 {
        job.attempt.to_string()
    } else {
        format!("{}/{}", job.attempt, job.max_attempts)
    }
}

/// Only the execution that moved the job to running at `attempt` may move it on.
fn ensure_running(job: &Job, attempt: u32) -> Result<()> {
    if job.status != JobStatus::Running || job.attempt != attempt {
        return Err(ControlError::InvalidTransition {
            job_id: job.id.clone(),
            status: job.status,
            action: "running",
        });
    }
    Ok(())
}

fn download_progress(p: &InstallProgress) -> (u8, String) {
    let percent = if p.total_files > 0 {
        let ratio = p.completed_files.min(p.total_files) as f64 / p.total_files as f64;
        20 + (ratio * 70.0).round() as u8
    } else {
        20
    };
    let message = match (&p.current, p.total_files) {
        (Some(file), t) if t > 0 => format!("Downloading {file} ({}/{t})", p.completed_files),
        (None, t) if t > 0 => format!("Downloading weights ({}/{t})", p.completed_files),
        _ => "Downloading weights".to_string(),
    };
    (percent, message)
}

/// Owns the job lifecycle. Every transition is a compare-and-swap on the
/// stored job, so concurrent cancel, retry and completion cannot both win.
pub struct JobOrchestrator {
    store: StateStore,
    events: EventBus,
    installer: Arc<dyn WeightInstaller>,
    queue: Capability<Arc<dyn JobQueue>>,
    settings: JobSettings,
    pool: Arc<Semaphore>,
    tasks: TaskRegistry,
    inline: Mutex<JoinSet<()>>,
    metrics: JobMetrics,
}

impl JobOrchestrator {
    pub fn new(
        store: StateStore,
        events: EventBus,
        installer: Arc<dyn WeightInstaller>,
        queue: Capability<Arc<dyn JobQueue>>,
        settings: JobSettings,
    ) -> Self {
        let pool = Arc::new(Semaphore::new(settings.install_concurrency.max(1)));
        Self {
            store,
            events,
            installer,
            queue,
            settings,
            pool,
            tasks: TaskRegistry::new(),
            inline: Mutex::new(JoinSet::new()),
            metrics: JobMetrics::default(),
        }
    }

    pub fn metrics(&self) -> &JobMetrics {
        &self.metrics
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn queue_enabled(&self) -> bool {
        self.queue.is_enabled()
    }

    fn publish(&self, job: &Job, with_log: bool) {
        self.events.publish(Event::job(job));
        if with_log {
            if let Some(ev) = Event::job_log(job) {
                self.events.publish(ev);
            }
        }
    }

    async fn record_history(&self, event: &str, model_id: &str, metadata: serde_json::Value) {
        let entry = NewHistoryEntry::new(event, Some(model_id.to_string()), metadata);
        if let Err(e) = self.store.append_history(entry).await {
            warn!(event, error = %e, "failed to record history");
        }
    }

    /// Validate and persist a new pending job. Does not start it.
    pub async fn create(&self, request: &WeightInstallRequest) -> Result<Job> {
        if request.model_id.trim().is_empty() {
            return Err(ControlError::invalid("modelId is required"));
        }
        weights::canonical_target(&request.model_id, request.target.as_deref())?;
        if request.files.iter().any(|f| f.trim().is_empty()) {
            return Err(ControlError::invalid("file names must not be empty"));
        }

        let max_attempts = request.max_attempts.unwrap_or(self.settings.default_max_attempts);
        let mut job = Job::new(
            uuid::Uuid::new_v4().to_string(),
            JOB_TYPE_WEIGHT_INSTALL,
            serde_json::to_value(request)?,
            max_attempts,
        );
        job.message = Some("Waiting for worker".to_string());
        job.push_log(LogLevel::Info, "Job created");
        self.store.create_job(&job).await?;

        info!(job_id = %job.id, model_id = %request.model_id, max_attempts, "weight install job created");
        self.publish(&job, true);
        Ok(job)
    }

    /// Create a job and start its first attempt.
    pub async fn submit(self: &Arc<Self>, request: WeightInstallRequest) -> Result<Submission> {
        let job = self.create(&request).await?;
        let mode = self.dispatch(&job, request).await;
        Ok(Submission { job, mode })
    }

    /// Hand the job's current attempt to the queue, or run it in this
    /// process when no queue is configured or the enqueue fails.
    pub async fn dispatch(self: &Arc<Self>, job: &Job, request: WeightInstallRequest) -> ExecutionMode {
        if let Some(queue) = self.queue.get() {
            match queue.enqueue(job, &request).await {
                Ok(EnqueueOutcome::Enqueued { key }) => {
                    debug!(job_id = %job.id, attempt = job.attempt, %key, "job enqueued");
                    return ExecutionMode::Queued;
                }
                Ok(EnqueueOutcome::AlreadyQueued { key }) => {
                    debug!(job_id = %job.id, %key, "attempt already queued");
                    return ExecutionMode::Queued;
                }
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "queue dispatch failed, running inline");
                }
            }
        }
        self.spawn_inline(job.id.clone(), request);
        ExecutionMode::Inline
    }

    fn spawn_inline(self: &Arc<Self>, job_id: String, request: WeightInstallRequest) {
        let this = Arc::clone(self);
        let pool = Arc::clone(&self.pool);
        let ticket = self.tasks.register(&job_id);

        let mut set = self.inline.lock().unwrap_or_else(|e| e.into_inner());
        while set.try_join_next().is_some() {}
        set.spawn(async move {
            let _permit = tokio::select! {
                permit = pool.acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => {
                        this.tasks.unregister(&job_id, &ticket);
                        return;
                    }
                },
                _ = ticket.token.cancelled() => {
                    debug!(job_id = %job_id, "job cancelled before it started");
                    this.tasks.unregister(&job_id, &ticket);
                    return;
                }
            };
            if let Err(e) = this.execute_registered(&job_id, &request, ticket).await {
                match e.kind() {
                    ErrorKind::Invalid => debug!(job_id = %job_id, error = %e, "job not runnable"),
                    _ => warn!(job_id = %job_id, error = %e, "job execution failed"),
                }
            }
        });
    }

    /// Run one attempt of a pending job to a terminal state.
    pub async fn execute(&self, job_id: &str, request: &WeightInstallRequest) -> Result<Job> {
        let ticket = self.tasks.register(job_id);
        self.execute_registered(job_id, request, ticket).await
    }

    async fn execute_registered(
        &self,
        job_id: &str,
        request: &WeightInstallRequest,
        ticket: TaskTicket,
    ) -> Result<Job> {
        let result = self.run_attempt(job_id, request, &ticket).await;
        self.tasks.unregister(job_id, &ticket);
        result
    }

    /// Signal the local execution of `job_id`, if there is one. The stored
    /// job is not touched.
    pub fn signal_cancel(&self, job_id: &str) -> bool {
        self.tasks.cancel(job_id)
    }

    async fn run_attempt(
        &self,
        job_id: &str,
        request: &WeightInstallRequest,
        ticket: &TaskTicket,
    ) -> Result<Job> {
        let token = &ticket.token;
        let job = self
            .store
            .update_job(job_id, |job| {
                if job.status != JobStatus::Pending {
                    return Err(ControlError::InvalidTransition {
                        job_id: job.id.clone(),
                        status: job.status,
                        action: "runnable",
                    });
                }
                job.status = JobStatus::Running;
                job.stage = "preparing".to_string();
                job.progress = 15;
                job.message = Some("Preparing cache directory".to_string());
                job.error = None;
                let label = attempt_label(job);
                job.push_log(LogLevel::Info, format!("Attempt {label} started"));
                Ok(())
            })
            .await?;
        self.publish(&job, true);
        let attempt = job.attempt;
        let started = Instant::now();
        info!(job_id, attempt, model_id = %request.model_id, "weight install started");

        let opts = InstallOptions {
            model_id: request.model_id.clone(),
            revision: request.revision.clone(),
            target: request.target.clone(),
            files: request.files.clone(),
            token: self.settings.hf_token.clone(),
            overwrite: request.overwrite,
        };
        let (progress_tx, mut progress_rx) = mpsc::channel(PROGRESS_BACKLOG);
        let ctx = InstallContext::new(token.clone(), progress_tx);

        let supervised = async {
            let install = self.installer.install(ctx, opts);
            tokio::pin!(install);
            loop {
                tokio::select! {
                    res = &mut install => break Outcome::Finished(res),
                    _ = token.cancelled() => break Outcome::Cancelled,
                    Some(progress) = progress_rx.recv() => self.record_progress(job_id, attempt, &progress).await,
                }
            }
        };
        let outcome = tokio::time::timeout(self.settings.install_timeout, supervised)
            .await
            .unwrap_or(Outcome::TimedOut);

        let finished = match outcome {
            Outcome::Finished(Ok(info)) => self.complete(job_id, attempt, request, &info).await,
            Outcome::Finished(Err(e)) if token.is_cancelled() => {
                debug!(job_id, error = %e, "installer stopped after cancellation");
                self.interrupted(job_id, attempt).await
            }
            Outcome::Finished(Err(e)) => self.fail(job_id, attempt, request, format!("{e:#}")).await,
            Outcome::Cancelled => self.interrupted(job_id, attempt).await,
            Outcome::TimedOut => {
                token.cancel();
                let limit = self.settings.install_timeout;
                self.fail(job_id, attempt, request, format!("install timed out after {limit:?}"))
                    .await
            }
        };
        if let Ok(job) = &finished {
            if job.attempt == attempt {
                self.metrics.observe_attempt(job.status, started.elapsed());
            }
        }
        finished
    }

    async fn record_progress(&self, job_id: &str, attempt: u32, progress: &InstallProgress) {
        let (percent, message) = download_progress(progress);
        let updated = self
            .store
            .update_job(job_id, |job| {
                ensure_running(job, attempt)?;
                job.stage = "downloading".to_string();
                job.progress = percent.max(job.progress);
                job.message = Some(message.clone());
                Ok(())
            })
            .await;
        match updated {
            Ok(job) => self.publish(&job, false),
            Err(e) => debug!(job_id, error = %e, "progress update skipped"),
        }
    }

    fn install_result(&self, info: &WeightInfo) -> serde_json::Value {
        let mut result = serde_json::json!({
            "path": info.path,
            "name": info.name,
            "sizeBytes": info.size_bytes,
            "fileCount": info.file_count,
        });
        if let Some(at) = info.installed_at {
            result["installedAt"] = at.to_rfc3339().into();
        }
        if let Some(pvc) = self.settings.weights_pvc_name.as_deref().filter(|p| !p.is_empty()) {
            result["storageUri"] = format!("pvc://{pvc}/{}", info.name).into();
        }
        if let Some(root) = self.settings.inference_model_root.as_deref() {
            result["inferenceModelPath"] = Path::new(root).join(&info.name).to_string_lossy().into_owned().into();
        }
        result
    }

    async fn complete(
        &self,
        job_id: &str,
        attempt: u32,
        request: &WeightInstallRequest,
        info: &WeightInfo,
    ) -> Result<Job> {
        let result = self.install_result(info);
        let committed = self
            .store
            .update_job(job_id, |job| {
                ensure_running(job, attempt)?;
                job.status = JobStatus::Done;
                job.stage = "completed".to_string();
                job.progress = 100;
                job.message = Some("Weights ready".to_string());
                job.result = Some(result.clone());
                job.error = None;
                job.push_log(LogLevel::Info, format!("Weights installed at {}", info.path));
                Ok(())
            })
            .await;

        match committed {
            Ok(job) => {
                info!(job_id, path = %info.path, "weight install completed");
                self.metrics.record_status(job.status);
                self.publish(&job, true);
                let mut metadata = result;
                metadata["jobId"] = job_id.into();
                self.record_history(HISTORY_WEIGHT_INSTALL_COMPLETED, &request.model_id, metadata)
                    .await;
                Ok(job)
            }
            Err(ControlError::InvalidTransition { status, .. }) => {
                info!(job_id, attempt, %status, "discarding install result, attempt no longer running");
                self.store.require_job(job_id).await
            }
            Err(e) => Err(e),
        }
    }

    async fn fail(&self, job_id: &str, attempt: u32, request: &WeightInstallRequest, error: String) -> Result<Job> {
        let committed = self
            .store
            .update_job(job_id, |job| {
                ensure_running(job, attempt)?;
                job.status = JobStatus::Failed;
                job.stage = "failed".to_string();
                job.message = Some(error.clone());
                job.error = Some(error.clone());
                job.push_log(LogLevel::Error, error.clone());
                Ok(())
            })
            .await;

        match committed {
            Ok(job) => {
                warn!(job_id, error = %error, "weight install failed");
                self.metrics.record_status(job.status);
                self.publish(&job, true);
                self.record_history(
                    HISTORY_WEIGHT_INSTALL_FAILED,
                    &request.model_id,
                    serde_json::json!({ "jobId": job_id, "error": error }),
                )
                .await;
                Ok(job)
            }
            Err(ControlError::InvalidTransition { .. }) => self.store.require_job(job_id).await,
            Err(e) => Err(e),
        }
    }

    /// The attempt was stopped by its token. An operator cancel has already
    /// committed; anything else (shutdown) leaves the job running, so mark it.
    async fn interrupted(&self, job_id: &str, attempt: u32) -> Result<Job> {
        let committed = self
            .store
            .update_job(job_id, |job| {
                ensure_running(job, attempt)?;
                job.status = JobStatus::Failed;
                job.stage = "failed".to_string();
                job.message = Some("Interrupted".to_string());
                job.error = Some("interrupted before completion".to_string());
                job.push_log(LogLevel::Warn, "Attempt interrupted before completion");
                Ok(())
            })
            .await;
        match committed {
            Ok(job) => {
                warn!(job_id, "weight install interrupted");
                self.metrics.record_status(job.status);
                self.publish(&job, true);
                Ok(job)
            }
            Err(ControlError::InvalidTransition { .. }) => self.store.require_job(job_id).await,
            Err(e) => Err(e),
        }
    }

    /// Fail an attempt whose executor disappeared without reporting back.
    /// A job that moved on since (cancelled, retried) is returned untouched.
    pub async fn recover_lost(
        &self,
        job_id: &str,
        attempt: u32,
        request: &WeightInstallRequest,
        executor: &str,
    ) -> Result<Job> {
        let error = format!("worker {executor} lost before completion");
        self.fail(job_id, attempt, request, error).await
    }

    /// Cancel a pending or running job and signal its executor.
    pub async fn cancel(&self, job_id: &str) -> Result<Job> {
        let job = self
            .store
            .update_job(job_id, |job| {
                if !job.status.is_cancellable() {
                    return Err(ControlError::not_cancellable(&job.id, job.status));
                }
                job.status = JobStatus::Cancelled;
                job.stage = "cancelled".to_string();
                job.message = Some("Cancelled by operator".to_string());
                job.error = Some("cancelled".to_string());
                job.cancelled_at = Some(chrono::Utc::now());
                job.push_log(LogLevel::Warn, "Job cancelled via API");
                Ok(())
            })
            .await?;

        let signalled = self.tasks.cancel(job_id);
        info!(job_id, signalled, "job cancelled");
        self.metrics.record_status(job.status);
        self.publish(&job, true);
        Ok(job)
    }

    /// Reset a failed or cancelled job to pending as its next attempt and
    /// dispatch it again.
    pub async fn retry(self: &Arc<Self>, job_id: &str) -> Result<Submission> {
        let job = self
            .store
            .update_job(job_id, |job| {
                if !job.status.is_retryable() {
                    return Err(ControlError::not_retryable(&job.id, job.status));
                }
                if job.attempts_exhausted() {
                    return Err(ControlError::MaxAttemptsReached {
                        attempt: job.attempt,
                        max_attempts: job.max_attempts,
                    });
                }
                job.attempt += 1;
                job.status = JobStatus::Pending;
                job.stage = "queued".to_string();
                job.progress = 0;
                job.message = Some("Retry requested".to_string());
                job.error = None;
                job.cancelled_at = None;
                job.result = None;
                let label = attempt_label(job);
                job.push_log(LogLevel::Info, format!("Retry scheduled ({label})"));
                Ok(())
            })
            .await?;

        info!(job_id, attempt = job.attempt, "job retry scheduled");
        self.publish(&job, true);
        let request: WeightInstallRequest = serde_json::from_value(job.payload.clone())?;
        let mode = self.dispatch(&job, request).await;
        Ok(Submission { job, mode })
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Job> {
        self.store.require_job(job_id).await
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .store
            .list_jobs(0)
            .await?
            .into_iter()
            .filter(|j| filter.matches(j))
            .collect();
        if filter.limit > 0 {
            jobs.truncate(filter.limit);
        }
        Ok(jobs)
    }

    pub async fn job_logs(&self, job_id: &str) -> Result<Vec<JobLogEntry>> {
        Ok(self.store.require_job(job_id).await?.logs)
    }

    /// Delete stored jobs, optionally only those in `status`. Running jobs
    /// are never deleted.
    pub async fn delete_jobs(&self, status: Option<JobStatus>) -> Result<u64> {
        if status == Some(JobStatus::Running) {
            return Err(ControlError::invalid("running jobs cannot be deleted"));
        }
        match status {
            Some(s) => self.store.delete_jobs(Some(s)).await,
            None => {
                let mut deleted = 0;
                for s in JobStatus::ALL.iter().filter(|s| **s != JobStatus::Running) {
                    deleted += self.store.delete_jobs(Some(*s)).await?;
                }
                Ok(deleted)
            }
        }
    }

    pub async fn counts(&self) -> Result<BTreeMap<JobStatus, usize>> {
        self.store.count_jobs_by_status().await
    }

    /// Unclaimed queue depth, or `None` without a queue.
    pub async fn queue_depth(&self) -> Option<usize> {
        let queue = self.queue.get()?;
        match queue.depth().await {
            Ok(depth) => Some(depth),
            Err(e) => {
                warn!(error = %e, "failed to read queue depth");
                None
            }
        }
    }

    /// Wait for inline executions spawned so far.
    pub async fn wait_idle(&self) {
        let mut set = std::mem::take(&mut *self.inline.lock().unwrap_or_else(|e| e.into_inner()));
        while set.join_next().await.is_some() {}
    }

    /// Stop local executions; their jobs are marked interrupted.
    pub async fn shutdown(&self) {
        self.tasks.cancel_all();
        self.wait_idle().await;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::installer::tests::{wait_until, FakeFetcher, HangingFetcher};
    use super::*;
    use async_trait::async_trait;
    use futures_util::StreamExt;
    use keel_meta::{CasOutcome, KvEntry, KvStore, MemoryKvStore, WatchStream};

    /// Memory store whose reads lag, widening the window between a job
    /// update being decided and committed.
    struct SlowReads {
        inner: MemoryKvStore,
        delay: Duration,
    }

    #[async_trait]
    impl KvStore for SlowReads {
        async fn put(&self, key: &str, value: Vec<u8>, ttl_ms: Option<u64>) -> anyhow::Result<u64> {
            self.inner.put(key, value, ttl_ms).await
        }

        async fn get(&self, key: &str) -> anyhow::Result<Option<KvEntry>> {
            tokio::time::sleep(self.delay).await;
            self.inner.get(key).await
        }

        async fn delete(&self, key: &str) -> anyhow::Result<bool> {
            self.inner.delete(key).await
        }

        async fn delete_prefix(&self, prefix: &str) -> anyhow::Result<u64> {
            self.inner.delete_prefix(prefix).await
        }

        async fn list_prefix(&self, prefix: &str) -> anyhow::Result<Vec<KvEntry>> {
            self.inner.list_prefix(prefix).await
        }

        async fn compare_and_swap(
            &self,
            key: &str,
            expected_revision: u64,
            value: Vec<u8>,
        ) -> anyhow::Result<CasOutcome> {
            self.inner.compare_and_swap(key, expected_revision, value).await
        }

        async fn watch_prefix(
            &self,
            prefix: &str,
            start_revision_exclusive: Option<u64>,
        ) -> anyhow::Result<WatchStream> {
            self.inner.watch_prefix(prefix, start_revision_exclusive).await
        }
    }

    async fn wait_for_status(orch: &JobOrchestrator, id: &str, status: JobStatus, attempt: u32) -> bool {
        for _ in 0..200 {
            let job = orch.get_job(id).await.unwrap();
            if job.status == status && job.attempt == attempt {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    /// Runs until cancelled.
    struct BlockingInstaller;

    #[async_trait]
    impl WeightInstaller for BlockingInstaller {
        async fn install(&self, ctx: InstallContext, _opts: InstallOptions) -> anyhow::Result<WeightInfo> {
            ctx.cancel.cancelled().await;
            anyhow::bail!("download cancelled")
        }
    }

    pub(crate) fn settings() -> JobSettings {
        JobSettings {
            install_timeout: Duration::from_secs(30),
            default_max_attempts: 3,
            install_concurrency: 2,
            hf_token: None,
            weights_pvc_name: Some("weights".into()),
            inference_model_root: Some("/mnt/models".into()),
        }
    }

    pub(crate) fn request(model_id: &str) -> WeightInstallRequest {
        WeightInstallRequest {
            model_id: model_id.into(),
            files: vec!["config.json".into()],
            ..Default::default()
        }
    }

    fn orchestrator(installer: Arc<dyn WeightInstaller>) -> Arc<JobOrchestrator> {
        let store = StateStore::new(Arc::new(MemoryKvStore::new()));
        Arc::new(JobOrchestrator::new(
            store,
            EventBus::new(64),
            installer,
            Capability::disabled("no queue in tests"),
            settings(),
        ))
    }

    fn local(dir: &Path, fetcher: Arc<FakeFetcher>) -> Arc<dyn WeightInstaller> {
        Arc::new(LocalWeightInstaller::new(WeightInventory::new(dir), fetcher))
    }

    async fn force_failed(orch: &JobOrchestrator, id: &str, attempt: u32, max_attempts: u32) {
        orch.store
            .update_job(id, |job| {
                job.status = JobStatus::Failed;
                job.attempt = attempt;
                job.max_attempts = max_attempts;
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_inline_install_runs_to_done() {
        let tmp = tempfile::tempdir().unwrap();
        let orch = orchestrator(local(tmp.path(), FakeFetcher::ok()));

        let sub = orch.submit(request("foo/bar")).await.unwrap();
        assert_eq!(sub.mode, ExecutionMode::Inline);
        assert_eq!(sub.job.status, JobStatus::Pending);
        assert_eq!(sub.job.attempt, 1);

        orch.wait_idle().await;
        let job = orch.get_job(&sub.job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Done);
        assert_eq!(job.progress, 100);
        assert_eq!(job.attempt, 1, "execution must not consume attempts");
        let result = job.result.unwrap();
        assert_eq!(result["name"], "foo/bar");
        assert_eq!(result["storageUri"], "pvc://weights/foo/bar");
        assert_eq!(result["inferenceModelPath"], "/mnt/models/foo/bar");

        let history = orch.store.list_history(0).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].event, HISTORY_WEIGHT_INSTALL_COMPLETED);
        assert_eq!(history[0].model_id.as_deref(), Some("foo/bar"));
    }

    #[tokio::test]
    async fn test_failed_install_records_error_and_history() {
        let tmp = tempfile::tempdir().unwrap();
        let orch = orchestrator(local(tmp.path(), FakeFetcher::failing("repo not found")));

        let sub = orch.submit(request("foo/missing")).await.unwrap();
        orch.wait_idle().await;
        let job = orch.get_job(&sub.job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.unwrap().contains("repo not found"));
        assert_eq!(job.logs.last().unwrap().level, LogLevel::Error);

        let history = orch.store.list_history(0).await.unwrap();
        assert_eq!(history[0].event, HISTORY_WEIGHT_INSTALL_FAILED);
    }

    #[tokio::test]
    async fn test_cancel_running_job_emits_single_cancelled_event() {
        let orch = orchestrator(Arc::new(BlockingInstaller));
        let mut feed = orch.events().subscribe();

        let sub = orch.submit(request("foo/bar")).await.unwrap();
        let id = sub.job.id.clone();
        for _ in 0..100 {
            if orch.get_job(&id).await.unwrap().status == JobStatus::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let job = orch.cancel(&id).await.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.cancelled_at.is_some());
        orch.wait_idle().await;

        let job = orch.get_job(&id).await.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.result.is_none());

        feed.unsubscribe();
        let mut kinds = Vec::new();
        while let Some(ev) = feed.next().await {
            kinds.push(ev.kind);
        }
        assert_eq!(kinds.iter().filter(|k| *k == "job.cancelled").count(), 1);
        assert!(!kinds.iter().any(|k| k == "job.done" || k == "job.failed"));
        assert!(orch.store.list_history(0).await.unwrap().is_empty());
        assert_eq!(orch.metrics().status_total(JobStatus::Cancelled), 1);
        assert_eq!(orch.metrics().duration(JobStatus::Cancelled).unwrap().count, 1);
    }

    #[tokio::test]
    async fn test_timed_out_install_fails_and_releases_download() {
        let tmp = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(HangingFetcher::default());
        let installer = Arc::new(LocalWeightInstaller::new(WeightInventory::new(tmp.path()), fetcher.clone()));
        let mut cfg = settings();
        cfg.install_timeout = Duration::from_millis(100);
        let orch = Arc::new(JobOrchestrator::new(
            StateStore::new(Arc::new(MemoryKvStore::new())),
            EventBus::new(64),
            installer,
            Capability::disabled("no queue in tests"),
            cfg,
        ));

        let sub = orch.submit(request("foo/bar")).await.unwrap();
        orch.wait_idle().await;

        let job = orch.get_job(&sub.job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("install timed out after 100ms"));
        assert!(orch.tasks.is_empty());
        assert_eq!(orch.metrics().status_total(JobStatus::Failed), 1);
        assert_eq!(orch.metrics().duration(JobStatus::Failed).unwrap().count, 1);

        let partial = tmp.path().join("foo/bar.tmp");
        assert!(wait_until(|| !partial.exists()).await, "timed out install left {partial:?}");
        assert!(
            wait_until(|| fetcher.progress_released()).await,
            "progress monitor outlived the timed out install"
        );
    }

    #[tokio::test]
    async fn test_cancel_after_quick_retry_reaches_new_attempt() {
        let kv = Arc::new(SlowReads {
            inner: MemoryKvStore::new(),
            delay: Duration::from_millis(20),
        });
        let orch = Arc::new(JobOrchestrator::new(
            StateStore::new(kv),
            EventBus::new(256),
            Arc::new(BlockingInstaller),
            Capability::disabled("no queue in tests"),
            settings(),
        ));

        let sub = orch.submit(request("foo/bar")).await.unwrap();
        let id = sub.job.id.clone();
        assert!(wait_for_status(&orch, &id, JobStatus::Running, 1).await);

        orch.cancel(&id).await.unwrap();
        let retried = orch.retry(&id).await.unwrap();
        assert_eq!(retried.job.attempt, 2);
        assert!(wait_for_status(&orch, &id, JobStatus::Running, 2).await);
        // let the first attempt finish unwinding
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(orch.tasks.is_tracked(&id), "second attempt lost its cancellation handle");

        let job = orch.cancel(&id).await.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(
            tokio::time::timeout(Duration::from_secs(3), orch.wait_idle()).await.is_ok(),
            "second attempt kept running after cancel"
        );
        let job = orch.get_job(&id).await.unwrap();
        assert_eq!((job.status, job.attempt), (JobStatus::Cancelled, 2));
    }

    #[tokio::test]
    async fn test_stale_attempt_cannot_finish_newer_attempt() {
        let orch = orchestrator(Arc::new(BlockingInstaller));
        let job = orch.create(&request("foo/bar")).await.unwrap();
        orch.store
            .update_job(&job.id, |job| {
                job.status = JobStatus::Running;
                job.attempt = 2;
                Ok(())
            })
            .await
            .unwrap();

        let seen = orch.interrupted(&job.id, 1).await.unwrap();
        assert_eq!((seen.status, seen.attempt), (JobStatus::Running, 2));
        let seen = orch.fail(&job.id, 1, &request("foo/bar"), "late".into()).await.unwrap();
        assert_eq!(seen.status, JobStatus::Running);

        let lost = orch.recover_lost(&job.id, 2, &request("foo/bar"), "w9").await.unwrap();
        assert_eq!(lost.status, JobStatus::Failed);
        assert_eq!(lost.error.as_deref(), Some("worker w9 lost before completion"));
    }

    #[tokio::test]
    async fn test_cancel_pending_job_prevents_execution() {
        let tmp = tempfile::tempdir().unwrap();
        let fetcher = FakeFetcher::ok();
        let orch = orchestrator(local(tmp.path(), fetcher.clone()));

        let job = orch.create(&request("foo/bar")).await.unwrap();
        orch.cancel(&job.id).await.unwrap();
        let err = orch.execute(&job.id, &request("foo/bar")).await.unwrap_err();
        assert!(matches!(err, ControlError::InvalidTransition { .. }));
        assert_eq!(fetcher.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancel_terminal_job_is_rejected() {
        let orch = orchestrator(Arc::new(BlockingInstaller));
        let job = orch.create(&request("foo/bar")).await.unwrap();
        force_failed(&orch, &job.id, 1, 3).await;
        let err = orch.cancel(&job.id).await.unwrap_err();
        assert!(matches!(err, ControlError::InvalidTransition { action: "cancellable", .. }));
    }

    #[tokio::test]
    async fn test_retry_respects_max_attempts() {
        let tmp = tempfile::tempdir().unwrap();
        let orch = orchestrator(local(tmp.path(), FakeFetcher::failing("boom")));
        let job = orch.create(&request("foo/bar")).await.unwrap();

        force_failed(&orch, &job.id, 2, 2).await;
        let err = orch.retry(&job.id).await.unwrap_err();
        assert!(matches!(
            err,
            ControlError::MaxAttemptsReached { attempt: 2, max_attempts: 2 }
        ));
        assert_eq!(orch.get_job(&job.id).await.unwrap().attempt, 2);

        force_failed(&orch, &job.id, 2, 3).await;
        let sub = orch.retry(&job.id).await.unwrap();
        assert_eq!(sub.job.status, JobStatus::Pending);
        assert_eq!(sub.job.attempt, 3);
        assert_eq!(sub.job.progress, 0);
        assert!(sub.job.error.is_none());
        orch.wait_idle().await;
    }

    #[tokio::test]
    async fn test_single_attempt_job_cannot_be_retried() {
        let tmp = tempfile::tempdir().unwrap();
        let orch = orchestrator(local(tmp.path(), FakeFetcher::failing("boom")));
        let mut req = request("foo/bar");
        req.max_attempts = Some(1);

        let sub = orch.submit(req).await.unwrap();
        orch.wait_idle().await;
        assert_eq!(orch.get_job(&sub.job.id).await.unwrap().status, JobStatus::Failed);
        assert!(matches!(
            orch.retry(&sub.job.id).await.unwrap_err(),
            ControlError::MaxAttemptsReached { attempt: 1, max_attempts: 1 }
        ));
    }

    #[tokio::test]
    async fn test_two_attempts_allow_exactly_one_retry() {
        let tmp = tempfile::tempdir().unwrap();
        let orch = orchestrator(local(tmp.path(), FakeFetcher::failing("boom")));
        let mut req = request("foo/bar");
        req.max_attempts = Some(2);

        let sub = orch.submit(req).await.unwrap();
        orch.wait_idle().await;
        let retried = orch.retry(&sub.job.id).await.unwrap();
        assert_eq!(retried.job.attempt, 2);
        orch.wait_idle().await;

        let job = orch.get_job(&sub.job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempt, 2);
        assert!(orch.retry(&sub.job.id).await.is_err());
    }

    #[tokio::test]
    async fn test_zero_max_attempts_is_unlimited() {
        let orch = orchestrator(Arc::new(BlockingInstaller));
        let mut req = request("foo/bar");
        req.max_attempts = Some(0);
        let job = orch.create(&req).await.unwrap();

        force_failed(&orch, &job.id, 50, 0).await;
        let sub = orch.retry(&job.id).await.unwrap();
        assert_eq!(sub.job.attempt, 51);
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_retry_of_done_job_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let orch = orchestrator(local(tmp.path(), FakeFetcher::ok()));
        let sub = orch.submit(request("foo/bar")).await.unwrap();
        orch.wait_idle().await;
        let err = orch.retry(&sub.job.id).await.unwrap_err();
        assert!(matches!(err, ControlError::InvalidTransition { action: "retryable", .. }));
    }

    #[tokio::test]
    async fn test_create_rejects_blank_model() {
        let orch = orchestrator(Arc::new(BlockingInstaller));
        let err = orch.create(&request("  ")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invalid);
    }

    #[tokio::test]
    async fn test_queue_dispatch_leaves_job_pending() {
        let kv = Arc::new(MemoryKvStore::new());
        let queue = Arc::new(KvJobQueue::new(kv.clone(), Duration::from_secs(60)));
        let orch = Arc::new(JobOrchestrator::new(
            StateStore::new(kv),
            EventBus::new(16),
            Arc::new(BlockingInstaller),
            Capability::Enabled(queue as Arc<dyn JobQueue>),
            settings(),
        ));

        let sub = orch.submit(request("foo/bar")).await.unwrap();
        assert_eq!(sub.mode, ExecutionMode::Queued);
        assert_eq!(orch.queue_depth().await, Some(1));
        orch.wait_idle().await;
        assert_eq!(orch.get_job(&sub.job.id).await.unwrap().status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_list_jobs_filters_by_model_case_insensitively() {
        let orch = orchestrator(Arc::new(BlockingInstaller));
        orch.create(&request("Org/Alpha")).await.unwrap();
        orch.create(&request("org/beta")).await.unwrap();

        let filter = JobFilter {
            model_id: Some("org/alpha".into()),
            ..Default::default()
        };
        let jobs = orch.list_jobs(&filter).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].payload_model_id(), Some("Org/Alpha"));

        let filter = JobFilter {
            status: Some(JobStatus::Done),
            ..Default::default()
        };
        assert!(orch.list_jobs(&filter).await.unwrap().is_empty());
    }

    #[test]
    fn test_download_progress_maps_into_band() {
        let p = InstallProgress { completed_files: 1, total_files: 2, current: Some("a.bin".into()) };
        assert_eq!(download_progress(&p), (55, "Downloading a.bin (1/2)".to_string()));
        let p = InstallProgress { completed_files: 3, total_files: 0, current: None };
        assert_eq!(download_progress(&p).0, 20);
    }
}
