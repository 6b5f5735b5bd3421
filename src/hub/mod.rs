//! Event broadcast hub.
//!
//! In-process pub/sub that fans out [`PipelineEvent`]s to all connected
//! observers. Run-scoped events are also appended to a bounded per-run
//! ring buffer so an observer joining mid-run receives recent context
//! before its live stream, with no gap and no duplicate (replay and
//! registration happen under the same lock as publication).
//!
//! Observers are decoupled from producers through bounded `mpsc` queues.
//! An observer whose queue overflows is disconnected instead of blocking
//! the supervisor or the other observers.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::event::PipelineEvent;

/// What a subscription wants to see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFilter {
    /// Every event, including process-wide quota updates.
    All,
    /// Only events belonging to one run.
    Run(Uuid),
}

impl EventFilter {
    fn matches(&self, event: &PipelineEvent) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::Run(id) => event.run_id() == Some(*id),
        }
    }
}

/// Identifier of a connected observer, usable for explicit unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// A live event subscription.
///
/// Dropping the subscription disconnects the observer; the hub prunes it
/// on the next publication.
pub struct Subscription {
    id: ObserverId,
    rx: mpsc::Receiver<PipelineEvent>,
}

impl Subscription {
    /// The observer id of this subscription.
    pub fn id(&self) -> ObserverId {
        self.id
    }

    /// Receives the next event, or `None` once disconnected.
    pub async fn recv(&mut self) -> Option<PipelineEvent> {
        self.rx.recv().await
    }

    /// Converts the subscription into a `Stream` of events.
    pub fn into_stream(self) -> ReceiverStream<PipelineEvent> {
        ReceiverStream::new(self.rx)
    }
}

struct Observer {
    id: ObserverId,
    filter: EventFilter,
    tx: mpsc::Sender<PipelineEvent>,
}

/// A buffered event together with its hub arrival order, so "all" replays
/// can interleave rings from different runs deterministically.
#[derive(Clone)]
struct Buffered {
    arrival: u64,
    event: PipelineEvent,
}

struct HubInner {
    observers: Vec<Observer>,
    rings: HashMap<Uuid, VecDeque<Buffered>>,
    next_observer: u64,
    next_arrival: u64,
}

/// The broadcast hub shared by the supervisor, coordinator and quota
/// guard. Cheap to clone.
#[derive(Clone)]
pub struct EventHub {
    inner: Arc<Mutex<HubInner>>,
    ring_capacity: usize,
    queue_capacity: usize,
}

impl EventHub {
    /// Creates a hub with the given per-run ring capacity and per-observer
    /// queue capacity.
    pub fn new(ring_capacity: usize, queue_capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HubInner {
                observers: Vec::new(),
                rings: HashMap::new(),
                next_observer: 0,
                next_arrival: 0,
            })),
            ring_capacity,
            queue_capacity,
        }
    }

    /// Publishes an event to the ring buffer and every matching observer.
    ///
    /// Never blocks: an observer that cannot keep up is disconnected.
    pub fn publish(&self, event: PipelineEvent) {
        let mut inner = self.inner.lock().expect("hub lock poisoned");

        let arrival = inner.next_arrival;
        inner.next_arrival += 1;

        // Quota events are process-wide and not owned by any run, so they
        // are delivered live only and never replayed.
        if let Some(run_id) = event.run_id() {
            let ring = inner.rings.entry(run_id).or_default();
            if ring.len() == self.ring_capacity {
                ring.pop_front();
            }
            ring.push_back(Buffered {
                arrival,
                event: event.clone(),
            });
        }

        let mut overflowed = Vec::new();
        inner.observers.retain(|observer| {
            if !observer.filter.matches(&event) {
                return true;
            }
            match observer.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    overflowed.push(observer.id);
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
        drop(inner);

        for id in overflowed {
            warn!(observer = id.0, "observer queue overflowed, disconnecting");
        }
    }

    /// Subscribes an observer, replaying buffered events matching `filter`
    /// before any live event.
    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let mut inner = self.inner.lock().expect("hub lock poisoned");

        let id = ObserverId(inner.next_observer);
        inner.next_observer += 1;

        let mut replay: Vec<Buffered> = match filter {
            EventFilter::Run(run_id) => inner
                .rings
                .get(&run_id)
                .map(|ring| ring.iter().cloned().collect())
                .unwrap_or_default(),
            EventFilter::All => inner
                .rings
                .values()
                .flat_map(|ring| ring.iter().cloned())
                .collect(),
        };
        replay.sort_by_key(|buffered| buffered.arrival);

        // Keep only the most recent events that fit the observer's queue,
        // leaving the rest of its capacity for live delivery headroom.
        let skip = replay.len().saturating_sub(self.queue_capacity);
        for buffered in replay.into_iter().skip(skip) {
            // Cannot fail: the channel is fresh and sized >= what we send.
            let _ = tx.try_send(buffered.event);
        }

        inner.observers.push(Observer { id, filter, tx });
        debug!(observer = id.0, "observer subscribed");

        Subscription { id, rx }
    }

    /// Removes an observer. A no-op if it is already gone.
    pub fn unsubscribe(&self, id: ObserverId) {
        let mut inner = self.inner.lock().expect("hub lock poisoned");
        inner.observers.retain(|observer| observer.id != id);
    }

    /// Drops the replay ring of an evicted run.
    pub fn drop_run(&self, run_id: Uuid) {
        let mut inner = self.inner.lock().expect("hub lock poisoned");
        inner.rings.remove(&run_id);
    }

    /// Number of currently connected observers.
    pub fn observer_count(&self) -> usize {
        self.inner.lock().expect("hub lock poisoned").observers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{LogEvent, StreamKind};
    use chrono::Utc;

    fn log_event(run_id: Uuid, sequence: u64) -> PipelineEvent {
        PipelineEvent::Log(LogEvent {
            run_id,
            stage: "scrape".to_string(),
            sequence,
            stream: StreamKind::Stdout,
            text: format!("line {sequence}"),
            timestamp: Utc::now(),
        })
    }

    fn sequence_of(event: &PipelineEvent) -> u64 {
        match event {
            PipelineEvent::Log(e) => e.sequence,
            other => panic!("expected log event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_live_delivery_in_order() {
        let hub = EventHub::new(16, 16);
        let run_id = Uuid::new_v4();
        let mut sub = hub.subscribe(EventFilter::Run(run_id));

        for sequence in 0..5 {
            hub.publish(log_event(run_id, sequence));
        }

        for expected in 0..5 {
            let event = sub.recv().await.unwrap();
            assert_eq!(sequence_of(&event), expected);
        }
    }

    #[tokio::test]
    async fn test_replay_then_live_no_gap_no_duplicate() {
        let hub = EventHub::new(16, 16);
        let run_id = Uuid::new_v4();

        for sequence in 0..3 {
            hub.publish(log_event(run_id, sequence));
        }

        let mut sub = hub.subscribe(EventFilter::Run(run_id));
        for sequence in 3..6 {
            hub.publish(log_event(run_id, sequence));
        }

        for expected in 0..6 {
            let event = sub.recv().await.unwrap();
            assert_eq!(sequence_of(&event), expected);
        }
    }

    #[tokio::test]
    async fn test_ring_evicts_oldest() {
        let hub = EventHub::new(2, 16);
        let run_id = Uuid::new_v4();

        for sequence in 0..5 {
            hub.publish(log_event(run_id, sequence));
        }

        let mut sub = hub.subscribe(EventFilter::Run(run_id));
        assert_eq!(sequence_of(&sub.recv().await.unwrap()), 3);
        assert_eq!(sequence_of(&sub.recv().await.unwrap()), 4);
    }

    #[tokio::test]
    async fn test_run_filter_excludes_other_runs() {
        let hub = EventHub::new(16, 16);
        let watched = Uuid::new_v4();
        let other = Uuid::new_v4();

        let mut sub = hub.subscribe(EventFilter::Run(watched));
        hub.publish(log_event(other, 0));
        hub.publish(log_event(watched, 0));

        let event = sub.recv().await.unwrap();
        assert_eq!(event.run_id(), Some(watched));
    }

    #[tokio::test]
    async fn test_slow_observer_disconnected_others_unaffected() {
        let hub = EventHub::new(64, 4);
        let run_id = Uuid::new_v4();

        // The slow observer never reads; the fast one drains as it goes.
        let _slow = hub.subscribe(EventFilter::Run(run_id));
        let mut fast = hub.subscribe(EventFilter::Run(run_id));
        assert_eq!(hub.observer_count(), 2);

        for sequence in 0..10 {
            hub.publish(log_event(run_id, sequence));
            assert_eq!(sequence_of(&fast.recv().await.unwrap()), sequence);
        }

        // Slow observer overflowed its 4-slot queue and was dropped.
        assert_eq!(hub.observer_count(), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_removes_observer() {
        let hub = EventHub::new(16, 16);
        let sub = hub.subscribe(EventFilter::All);
        assert_eq!(hub.observer_count(), 1);

        hub.unsubscribe(sub.id());
        assert_eq!(hub.observer_count(), 0);
    }

    #[tokio::test]
    async fn test_drop_run_clears_replay() {
        let hub = EventHub::new(16, 16);
        let run_id = Uuid::new_v4();
        hub.publish(log_event(run_id, 0));
        hub.drop_run(run_id);

        let mut sub = hub.subscribe(EventFilter::Run(run_id));
        hub.publish(log_event(run_id, 1));
        assert_eq!(sequence_of(&sub.recv().await.unwrap()), 1);
    }
}
