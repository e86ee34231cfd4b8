use std::sync::Arc;

use keel_control::Coordinator;

use crate::metrics::Metrics;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    pub metrics: Arc<Metrics>,
}

impl AppState {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self {
            coordinator,
            metrics: Arc::new(Metrics::default()),
        }
    }
}
