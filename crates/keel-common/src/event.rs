use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::Job;

pub mod types {
    pub const JOB_LOG: &str = "job.log";
    pub const ACTIVATION_STARTED: &str = "model.activation.started";
    pub const ACTIVATION_COMPLETED: &str = "model.activation.completed";
    pub const ACTIVATION_FAILED: &str = "model.activation.failed";
    pub const DEACTIVATION_STARTED: &str = "model.deactivation.started";
    pub const DEACTIVATION_COMPLETED: &str = "model.deactivation.completed";
    pub const DEACTIVATION_FAILED: &str = "model.deactivation.failed";
    pub const SEED_START: &str = "stream.seed.start";
    pub const SEED_COMPLETE: &str = "stream.seed.complete";
}

/// Pub/sub envelope. Not persisted; the job or history record behind it is.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Event {
    pub fn new(kind: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: kind.into(),
            timestamp: Utc::now(),
            data,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// `job.<status>` carrying the full job record.
    pub fn job(job: &Job) -> Self {
        let data = serde_json::to_value(job).unwrap_or(serde_json::Value::Null);
        Self {
            id: job.id.clone(),
            kind: format!("job.{}", job.status),
            timestamp: job.updated_at,
            data,
        }
    }

    /// `job.log` for the most recent log line of `job`, if any.
    pub fn job_log(job: &Job) -> Option<Self> {
        let entry = job.logs.last()?;
        let nanos = entry.timestamp.timestamp_nanos_opt().unwrap_or_default();
        Some(Self {
            id: format!("{}-log-{}", job.id, nanos),
            kind: types::JOB_LOG.to_string(),
            timestamp: entry.timestamp,
            data: serde_json::json!({ "jobId": job.id, "log": entry }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobStatus, LogLevel, JOB_TYPE_WEIGHT_INSTALL};

    #[test]
    fn test_job_event_type_follows_status() {
        let mut job = Job::new("j1", JOB_TYPE_WEIGHT_INSTALL, serde_json::Value::Null, 1);
        job.status = JobStatus::Done;
        let ev = Event::job(&job);
        assert_eq!(ev.kind, "job.done");
        assert_eq!(ev.id, "j1");
        assert_eq!(ev.data["status"], "done");
    }

    #[test]
    fn test_job_log_event_needs_a_log_line() {
        let mut job = Job::new("j1", JOB_TYPE_WEIGHT_INSTALL, serde_json::Value::Null, 1);
        assert!(Event::job_log(&job).is_none());
        job.push_log(LogLevel::Info, "Job created");
        let ev = Event::job_log(&job).unwrap();
        assert!(ev.id.starts_with("j1-log-"));
        assert_eq!(ev.data["log"]["message"], "Job created");
    }

    #[test]
    fn test_envelope_uses_type_key() {
        let ev = Event::new(types::SEED_START, serde_json::json!({"count": 0}));
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "stream.seed.start");
    }
}
