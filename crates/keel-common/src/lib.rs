pub mod event;
pub mod history;
pub mod job;
pub mod model;

pub use event::Event;
pub use history::{HistoryEntry, NewHistoryEntry};
pub use job::{Job, JobLogEntry, JobStatus, LogLevel, WeightInstallRequest, JOB_TYPE_WEIGHT_INSTALL};
pub use model::{
    ConfigMapVolumeSource, EnvVar, EnvVarSource, KeySelector, Model, ModelSummary, PvcSource,
    Resources, SecretVolumeSource, Storage, Toleration, VllmConfig, Volume, VolumeMount,
};

pub mod telemetry;
