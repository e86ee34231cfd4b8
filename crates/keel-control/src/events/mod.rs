//! In-process fan-out of state changes to observers.
//!
//! Every subscriber owns a bounded channel. Publishing never waits: a full
//! subscriber misses the event (the store stays the source of truth) and a
//! closed one is pruned. New subscribers can be seeded with recent jobs
//! before live events are spliced in.

mod relay;

pub use relay::EventRelay;

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::task::{Context, Poll};

use dashmap::DashMap;
use futures_core::Stream;
use keel_common::event::types;
use keel_common::Event;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::Result;
use crate::store::StateStore;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    pub dropped: usize,
}

struct BusInner {
    subscribers: DashMap<u64, mpsc::Sender<Event>>,
    next_id: AtomicU64,
    capacity: usize,
    relay: OnceLock<mpsc::Sender<Event>>,
}

#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: DashMap::new(),
                next_id: AtomicU64::new(1),
                capacity: capacity.max(1),
                relay: OnceLock::new(),
            }),
        }
    }

    /// Deliver to every local subscriber and hand a copy to the relay, if any.
    pub fn publish(&self, event: Event) -> PublishReport {
        let report = self.deliver_local(&event);
        if let Some(relay) = self.inner.relay.get() {
            if relay.try_send(event).is_err() {
                warn!("event relay backlog full, event not mirrored");
            }
        }
        report
    }

    pub(crate) fn deliver_local(&self, event: &Event) -> PublishReport {
        let mut report = PublishReport::default();
        let mut closed = Vec::new();
        for entry in self.inner.subscribers.iter() {
            match entry.value().try_send(event.clone()) {
                Ok(()) => report.delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    report.dropped += 1;
                    warn!(subscriber = *entry.key(), event_type = %event.kind, "subscriber buffer full, dropping event");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*entry.key()),
            }
        }
        for id in closed {
            self.inner.subscribers.remove(&id);
        }
        report
    }

    pub(crate) fn attach_relay(&self, tx: mpsc::Sender<Event>) -> bool {
        self.inner.relay.set(tx).is_ok()
    }

    pub fn subscribe(&self) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.inner.capacity);
        self.inner.subscribers.insert(id, tx);
        debug!(subscriber = id, "event subscriber added");
        Subscription {
            id,
            rx,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Subscribe, then replay the `window` most recent jobs as `job.<status>`
    /// events (oldest first) between seed markers. Subscribing first means a
    /// job changing during the replay shows up again live rather than not at all.
    pub async fn subscribe_with_replay(&self, store: &StateStore, window: usize) -> Result<EventStream> {
        let live = self.subscribe();
        let jobs = store.list_jobs(window.max(1)).await?;
        let count = jobs.len();

        let seed_id = uuid::Uuid::new_v4().to_string();
        let mut seed = VecDeque::with_capacity(count + 2);
        seed.push_back(
            Event::new(types::SEED_START, serde_json::json!({ "count": count })).with_id(seed_id.clone()),
        );
        seed.extend(jobs.iter().rev().map(Event::job));
        seed.push_back(
            Event::new(types::SEED_COMPLETE, serde_json::json!({ "count": count }))
                .with_id(format!("{seed_id}.complete")),
        );

        Ok(EventStream { seed, live })
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }
}

/// A live feed. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Event>,
    bus: Weak<BusInner>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Detach from the bus. Safe to call repeatedly; buffered events can
    /// still be drained afterwards.
    pub fn unsubscribe(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            if bus.subscribers.remove(&self.id).is_some() {
                debug!(subscriber = self.id, "event subscriber removed");
            }
        }
        self.rx.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl Stream for Subscription {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        self.rx.poll_recv(cx)
    }
}

/// Seed events followed by the live subscription.
pub struct EventStream {
    seed: VecDeque<Event>,
    live: Subscription,
}

impl EventStream {
    pub fn seed_len(&self) -> usize {
        self.seed.len()
    }

    pub fn unsubscribe(&mut self) {
        self.seed.clear();
        self.live.unsubscribe();
    }
}

impl Stream for EventStream {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        if let Some(ev) = self.seed.pop_front() {
            return Poll::Ready(Some(ev));
        }
        Pin::new(&mut self.live).poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use futures_util::StreamExt;
    use keel_common::{Job, JobStatus, JOB_TYPE_WEIGHT_INSTALL};
    use keel_meta::MemoryKvStore;

    #[tokio::test]
    async fn test_fanout_to_all_subscribers() {
        let bus = EventBus::new(4);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        let report = bus.publish(Event::new("job.pending", serde_json::Value::Null));
        assert_eq!(report, PublishReport { delivered: 2, dropped: 0 });
        assert_eq!(a.recv().await.unwrap().kind, "job.pending");
        assert_eq!(b.recv().await.unwrap().kind, "job.pending");
    }

    #[tokio::test]
    async fn test_slow_subscriber_does_not_block_others() {
        let bus = EventBus::new(2);
        let _slow = bus.subscribe();
        let mut fast = bus.subscribe();

        let mut dropped = 0;
        for i in 0..5 {
            let report = bus.publish(Event::new(format!("e{i}"), serde_json::Value::Null));
            dropped += report.dropped;
            assert_eq!(fast.recv().await.unwrap().kind, format!("e{i}"));
        }
        assert_eq!(dropped, 3);
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent_and_releases_slot() {
        let bus = EventBus::new(4);
        let mut sub = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        sub.unsubscribe();
        sub.unsubscribe();
        assert_eq!(bus.subscriber_count(), 0);
        assert!(sub.recv().await.is_none());

        {
            let _dropped = bus.subscribe();
            assert_eq!(bus.subscriber_count(), 1);
        }
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_replay_brackets_recent_jobs_before_live_events() {
        let store = StateStore::new(Arc::new(MemoryKvStore::new()));
        for (i, id) in ["old", "mid", "new"].iter().enumerate() {
            let mut job = Job::new(*id, JOB_TYPE_WEIGHT_INSTALL, serde_json::Value::Null, 1);
            job.created_at = Utc::now() + chrono::Duration::seconds(i as i64);
            if *id == "old" {
                job.status = JobStatus::Failed;
            }
            store.create_job(&job).await.unwrap();
        }

        let bus = EventBus::new(16);
        let mut stream = bus.subscribe_with_replay(&store, 2).await.unwrap();
        bus.publish(Event::new("model.activation.started", serde_json::Value::Null));

        let mut kinds = Vec::new();
        let mut ids = Vec::new();
        for _ in 0..5 {
            let ev = stream.next().await.unwrap();
            kinds.push(ev.kind.clone());
            ids.push(ev.id.clone());
        }
        assert_eq!(
            kinds,
            vec![
                "stream.seed.start",
                "job.pending",
                "job.pending",
                "stream.seed.complete",
                "model.activation.started"
            ]
        );
        assert_eq!(&ids[1..3], &["mid".to_string(), "new".to_string()]);
        assert_eq!(ids[3], format!("{}.complete", ids[0]));
    }

    #[tokio::test]
    async fn test_replay_with_no_jobs_still_emits_markers() {
        let store = StateStore::new(Arc::new(MemoryKvStore::new()));
        let bus = EventBus::new(16);
        let mut stream = bus.subscribe_with_replay(&store, 5).await.unwrap();
        assert_eq!(stream.seed_len(), 2);
        assert_eq!(stream.next().await.unwrap().data["count"], 0);
        assert_eq!(stream.next().await.unwrap().kind, "stream.seed.complete");
    }
}
