use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// The cancellation handle of one registered execution. `generation` tells
/// an execution apart from a later one of the same job.
#[derive(Debug, Clone)]
pub struct TaskTicket {
    pub generation: u64,
    pub token: CancellationToken,
}

/// Cancellation signals for jobs executing in this process, keyed by job id.
/// At most one execution per job is tracked.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tokens: DashMap<String, TaskTicket>,
    next_generation: AtomicU64,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new execution of `job_id`. A still-tracked earlier execution
    /// is superseded and signalled.
    pub fn register(&self, job_id: &str) -> TaskTicket {
        let ticket = TaskTicket {
            generation: self.next_generation.fetch_add(1, Ordering::Relaxed),
            token: CancellationToken::new(),
        };
        if let Some(old) = self.tokens.insert(job_id.to_string(), ticket.clone()) {
            debug!(job_id = %job_id, superseded = old.generation, "replacing tracked execution");
            old.token.cancel();
        }
        ticket
    }

    /// Fire and forget the job's token. Returns whether it was tracked here.
    pub fn cancel(&self, job_id: &str) -> bool {
        match self.tokens.remove(job_id) {
            Some((_, ticket)) => {
                debug!(job_id = %job_id, generation = ticket.generation, "signalling cancellation to running job");
                ticket.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Stop tracking `ticket`'s execution. A newer registration for the same
    /// job is left alone.
    pub fn unregister(&self, job_id: &str, ticket: &TaskTicket) {
        self.tokens
            .remove_if(job_id, |_, current| current.generation == ticket.generation);
    }

    pub fn is_tracked(&self, job_id: &str) -> bool {
        self.tokens.contains_key(job_id)
    }

    pub fn cancel_all(&self) {
        for entry in self.tokens.iter() {
            entry.value().token.cancel();
        }
        self.tokens.clear();
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_signals_and_forgets() {
        let reg = TaskRegistry::new();
        let t = reg.register("j1");
        assert_eq!(reg.len(), 1);
        assert!(reg.cancel("j1"));
        assert!(t.token.is_cancelled());
        assert!(!reg.cancel("j1"));
    }

    #[test]
    fn test_stale_unregister_keeps_newer_execution() {
        let reg = TaskRegistry::new();
        let first = reg.register("j1");
        assert!(reg.cancel("j1"));
        let second = reg.register("j1");

        reg.unregister("j1", &first);
        assert!(reg.is_tracked("j1"), "finishing the old attempt must not drop the new token");

        assert!(reg.cancel("j1"));
        assert!(second.token.is_cancelled());
    }

    #[test]
    fn test_register_supersedes_tracked_execution() {
        let reg = TaskRegistry::new();
        let first = reg.register("j1");
        let second = reg.register("j1");
        assert!(first.token.is_cancelled());
        assert!(!second.token.is_cancelled());
        assert_ne!(first.generation, second.generation);

        reg.unregister("j1", &second);
        assert!(reg.is_empty());
    }

    #[test]
    fn test_cancel_all() {
        let reg = TaskRegistry::new();
        let a = reg.register("a");
        let b = reg.register("b");
        reg.cancel_all();
        assert!(a.token.is_cancelled() && b.token.is_cancelled());
        assert!(reg.is_empty());
    }
}
