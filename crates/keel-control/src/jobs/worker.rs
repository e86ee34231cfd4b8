use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use keel_common::{JobStatus, WeightInstallRequest};
use keel_meta::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::queue::{ClaimedMessage, KvJobQueue};
use super::JobOrchestrator;
use crate::error::Result;

const CANCELLED_EVENT: &str = "job.cancelled";

/// Drains the queue one message at a time. Wakes on queue changes, with a
/// periodic poll as a fallback for missed notifications.
pub struct QueueWorker {
    worker_id: String,
    queue: Arc<KvJobQueue>,
    orchestrator: Arc<JobOrchestrator>,
    poll_interval: Duration,
}

async fn next_change(watch: &mut Option<WatchStream>) -> bool {
    match watch.as_mut() {
        Some(stream) => stream.next().await.is_some(),
        None => std::future::pending().await,
    }
}

impl QueueWorker {
    pub fn new(
        worker_id: impl Into<String>,
        queue: Arc<KvJobQueue>,
        orchestrator: Arc<JobOrchestrator>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            queue,
            orchestrator,
            poll_interval,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!(worker_id = %self.worker_id, prefix = self.queue.prefix(), "queue worker started");
        let mut watch: Option<WatchStream> = None;
        loop {
            if watch.is_none() {
                watch = match self.queue.watch().await {
                    Ok(stream) => Some(stream),
                    Err(e) => {
                        warn!(error = %e, "queue watch unavailable, polling only");
                        None
                    }
                };
            }

            while !shutdown.is_cancelled() {
                match self.queue.claim_next(&self.worker_id).await {
                    Ok(Some(claimed)) => self.process(claimed).await,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "failed to claim queue message");
                        break;
                    }
                }
            }

            let alive = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(worker_id = %self.worker_id, "queue worker stopping");
                    self.orchestrator.shutdown().await;
                    return Ok(());
                }
                alive = next_change(&mut watch) => alive,
                _ = tokio::time::sleep(self.poll_interval) => true,
            };
            if !alive {
                debug!("queue watch ended, reopening");
                watch = None;
            }
        }
    }

    /// Run one claimed message. The message is acknowledged whatever the
    /// outcome; failures are recorded on the job itself.
    pub async fn process(&self, claimed: ClaimedMessage) {
        let msg = &claimed.message;
        match self.orchestrator.store().get_job(&msg.job_id).await {
            Ok(Some(job)) if job.attempt != msg.attempt => {
                info!(job_id = %job.id, queued = msg.attempt, current = job.attempt, "skipping superseded attempt");
            }
            Ok(Some(job)) if job.status == JobStatus::Running => match &claimed.reclaimed_from {
                Some(previous) => {
                    match self
                        .orchestrator
                        .recover_lost(&job.id, job.attempt, &msg.request, previous)
                        .await
                    {
                        Ok(job) => warn!(job_id = %job.id, %previous, status = %job.status, "recovered attempt of lost worker"),
                        Err(e) => {
                            warn!(job_id = %job.id, error = %e, "failed to recover lost attempt, leaving message claimed");
                            return;
                        }
                    }
                }
                None => info!(job_id = %job.id, "job already running elsewhere"),
            },
            Ok(Some(job)) if job.status != JobStatus::Pending => {
                info!(job_id = %job.id, status = %job.status, "skipping job that is no longer pending");
            }
            Ok(Some(job)) => self.execute_watched(&job.id, &msg.request).await,
            Ok(None) => warn!(job_id = %msg.job_id, "queued job no longer exists"),
            Err(e) => {
                warn!(job_id = %msg.job_id, error = %e, "failed to load queued job, leaving message claimed");
                return;
            }
        }
        if let Err(e) = self.queue.ack(&claimed).await {
            warn!(key = %claimed.key, error = %e, "failed to acknowledge queue message");
        }
    }

    /// Execute while watching for an operator cancel made in another process:
    /// relayed `job.cancelled` events, with a periodic read of the job as a
    /// fallback when the relay misses one.
    async fn execute_watched(&self, job_id: &str, request: &WeightInstallRequest) {
        let mut feed = self.orchestrator.events().subscribe();
        let mut recheck = tokio::time::interval(self.poll_interval);
        recheck.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let execution = self.orchestrator.execute(job_id, request);
        tokio::pin!(execution);

        let mut signalled = false;
        loop {
            let cancelled = tokio::select! {
                res = &mut execution => {
                    match res {
                        Ok(done) => debug!(job_id = %done.id, status = %done.status, "queued job finished"),
                        Err(e) => warn!(job_id, error = %e, "queued job did not run"),
                    }
                    return;
                }
                Some(ev) = feed.next() => ev.kind == CANCELLED_EVENT && ev.id == job_id,
                _ = recheck.tick() => matches!(
                    self.orchestrator.store().get_job(job_id).await,
                    Ok(Some(job)) if job.status == JobStatus::Cancelled
                ),
            };
            if cancelled && !signalled {
                signalled = self.orchestrator.signal_cancel(job_id);
                info!(job_id, signalled, "job cancelled remotely");
            }
        }
    }
}
