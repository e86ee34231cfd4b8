//! Control plane for a single-slot model deployment: catalog, weight
//! install jobs, activation and the event feed.

pub mod activation;
pub mod catalog;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod jobs;
pub mod metrics;
pub mod store;
pub mod validator;

pub use config::{Capability, ControlConfig};
pub use coordinator::{Capabilities, Coordinator, HistoryFilter, StatusReport};
pub use error::{ControlError, ErrorKind, Result};
pub use events::{EventBus, EventRelay, EventStream};
pub use metrics::{CatalogMetrics, HistogramSnapshot, JobMetrics};
pub use store::StateStore;
