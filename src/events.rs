//! Intra-process pub/sub of room events.
//!
//! Events are facts: they describe state transitions after they committed
//! and never carry errors. The bus fans each event out to per-subscriber
//! pump tasks so a slow callback can never block the publisher; callbacks
//! needing backpressure keep their own bounded queue downstream.

use crate::id_types::{ParticipantId, RoomId, TrackId};
use crate::participant::{Metadata, ParticipantInfo};
use crate::track::MediaTrack;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, RwLock, Weak};
use tokio::sync::mpsc;
use tracing::{error, warn};

/// Closed set of event kinds observable on the bus and on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "room.created")]
    RoomCreated,
    #[serde(rename = "room.deleted")]
    RoomDeleted,
    #[serde(rename = "participant.joined")]
    ParticipantJoined,
    #[serde(rename = "participant.left")]
    ParticipantLeft,
    #[serde(rename = "participant.updated")]
    ParticipantUpdated,
    #[serde(rename = "track.published")]
    TrackPublished,
    #[serde(rename = "track.unpublished")]
    TrackUnpublished,
    #[serde(rename = "metadata.updated")]
    MetadataUpdated,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::RoomCreated => "room.created",
            EventType::RoomDeleted => "room.deleted",
            EventType::ParticipantJoined => "participant.joined",
            EventType::ParticipantLeft => "participant.left",
            EventType::ParticipantUpdated => "participant.updated",
            EventType::TrackPublished => "track.published",
            EventType::TrackUnpublished => "track.unpublished",
            EventType::MetadataUpdated => "metadata.updated",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of a committed room fact. Snapshots only, no live references.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    RoomCreated {
        name: String,
    },
    RoomDeleted {},
    ParticipantJoined {
        participant: ParticipantInfo,
    },
    ParticipantLeft {
        participant: ParticipantInfo,
    },
    ParticipantUpdated {
        participant: ParticipantInfo,
    },
    TrackPublished {
        track: MediaTrack,
    },
    TrackUnpublished {
        track_id: TrackId,
        owner: ParticipantId,
    },
    MetadataUpdated {
        metadata: Metadata,
    },
}

/// A fact about one room, stamped at commit time.
#[derive(Debug, Clone, Serialize)]
pub struct RoomEvent {
    pub room_id: RoomId,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

impl RoomEvent {
    pub fn new(room_id: RoomId, payload: EventPayload) -> Self {
        RoomEvent {
            room_id,
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn kind(&self) -> EventType {
        match &self.payload {
            EventPayload::RoomCreated { .. } => EventType::RoomCreated,
            EventPayload::RoomDeleted {} => EventType::RoomDeleted,
            EventPayload::ParticipantJoined { .. } => EventType::ParticipantJoined,
            EventPayload::ParticipantLeft { .. } => EventType::ParticipantLeft,
            EventPayload::ParticipantUpdated { .. } => EventType::ParticipantUpdated,
            EventPayload::TrackPublished { .. } => EventType::TrackPublished,
            EventPayload::TrackUnpublished { .. } => EventType::TrackUnpublished,
            EventPayload::MetadataUpdated { .. } => EventType::MetadataUpdated,
        }
    }
}

pub type EventCallback = dyn Fn(&RoomEvent) + Send + Sync;

/// A callback is dropped after this many panics.
const MAX_STRIKES: u8 = 2;

struct Registration {
    id: u64,
    /// `None` subscribes to every kind.
    kind: Option<EventType>,
    callback: Arc<EventCallback>,
    tx: mpsc::UnboundedSender<RoomEvent>,
    strikes: Arc<AtomicU8>,
}

struct BusInner {
    registrations: RwLock<Vec<Registration>>,
    next_id: AtomicU64,
}

impl BusInner {
    fn remove(&self, id: u64) {
        let mut regs = self.registrations.write().unwrap();
        regs.retain(|r| r.id != id);
    }
}

/// Keeps a subscription alive. Dropping the handle deregisters the
/// callback and stops its pump task; call [`SubscriptionHandle::detach`]
/// to keep the subscription for the lifetime of the bus instead.
pub struct SubscriptionHandle {
    id: u64,
    bus: Weak<BusInner>,
    detached: bool,
}

impl SubscriptionHandle {
    pub fn unsubscribe(mut self) {
        self.detached = false;
        // Drop runs the removal.
    }

    /// Leaves the callback registered until the bus itself is dropped.
    pub fn detach(mut self) {
        self.detached = true;
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if self.detached {
            return;
        }
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(self.id);
        }
    }
}

/// Intra-process event bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus").finish_non_exhaustive()
    }
}

impl EventBus {
    pub fn new() -> Self {
        EventBus {
            inner: Arc::new(BusInner {
                registrations: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Registers `callback` for one event kind.
    pub fn subscribe<F>(&self, kind: EventType, callback: F) -> SubscriptionHandle
    where
        F: Fn(&RoomEvent) + Send + Sync + 'static,
    {
        self.register(Some(kind), Arc::new(callback))
    }

    /// Registers `callback` for every event kind.
    pub fn subscribe_all<F>(&self, callback: F) -> SubscriptionHandle
    where
        F: Fn(&RoomEvent) + Send + Sync + 'static,
    {
        self.register(None, Arc::new(callback))
    }

    fn register(&self, kind: Option<EventType>, callback: Arc<EventCallback>) -> SubscriptionHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let strikes = Arc::new(AtomicU8::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel::<RoomEvent>();

        // One pump task per subscriber: preserves publish order per
        // subscriber and isolates its panics from the publisher.
        let pump_cb = callback.clone();
        let pump_strikes = strikes.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if invoke_guarded(&pump_cb, &event, &pump_strikes) >= MAX_STRIKES {
                    warn!(subscriber = id, "event subscriber deregistered after repeated panics");
                    break;
                }
            }
        });

        self.inner.registrations.write().unwrap().push(Registration {
            id,
            kind,
            callback,
            tx,
            strikes,
        });

        SubscriptionHandle {
            id,
            bus: Arc::downgrade(&self.inner),
            detached: false,
        }
    }

    /// Queues `event` on every matching subscriber and returns without
    /// waiting for any callback to run.
    pub fn publish(&self, event: RoomEvent) {
        let mut dead = Vec::new();
        {
            let regs = self.inner.registrations.read().unwrap();
            for reg in regs.iter() {
                if !matches(reg.kind, event.kind()) {
                    continue;
                }
                if reg.tx.send(event.clone()).is_err() {
                    dead.push(reg.id);
                }
            }
        }
        for id in dead {
            self.inner.remove(id);
        }
    }

    /// Invokes matching callbacks serially in the caller's context.
    /// Ordering-critical tests only; production paths use [`publish`].
    ///
    /// [`publish`]: EventBus::publish
    pub fn publish_sync(&self, event: RoomEvent) {
        let matching: Vec<(Arc<EventCallback>, Arc<AtomicU8>, u64)> = {
            let regs = self.inner.registrations.read().unwrap();
            regs.iter()
                .filter(|r| matches(r.kind, event.kind()))
                .map(|r| (r.callback.clone(), r.strikes.clone(), r.id))
                .collect()
        };
        for (callback, strikes, id) in matching {
            if invoke_guarded(&callback, &event, &strikes) >= MAX_STRIKES {
                warn!(subscriber = id, "event subscriber deregistered after repeated panics");
                self.inner.remove(id);
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.registrations.read().unwrap().len()
    }
}

fn matches(kind: Option<EventType>, actual: EventType) -> bool {
    kind.map(|k| k == actual).unwrap_or(true)
}

/// Runs a callback under a recover boundary. Returns the strike count
/// after the call.
fn invoke_guarded(callback: &Arc<EventCallback>, event: &RoomEvent, strikes: &AtomicU8) -> u8 {
    match catch_unwind(AssertUnwindSafe(|| callback(event))) {
        Ok(()) => strikes.load(Ordering::Relaxed),
        Err(_) => {
            let total = strikes.fetch_add(1, Ordering::Relaxed) + 1;
            error!(
                kind = %event.kind(),
                room = %event.room_id,
                strikes = total,
                "event subscriber panicked"
            );
            total
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn event(kind: EventType) -> RoomEvent {
        let payload = match kind {
            EventType::RoomCreated => EventPayload::RoomCreated {
                name: "r".to_string(),
            },
            EventType::RoomDeleted => EventPayload::RoomDeleted {},
            _ => EventPayload::MetadataUpdated {
                metadata: Metadata::new(),
            },
        };
        RoomEvent::new(RoomId::from("room-1"), payload)
    }

    #[tokio::test]
    async fn test_subscribe_receives_matching_kind_only() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_cb = hits.clone();
        let _handle = bus.subscribe(EventType::RoomCreated, move |_| {
            hits_cb.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(event(EventType::RoomCreated));
        bus.publish(event(EventType::RoomDeleted));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_subscribe_all_receives_everything() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_cb = hits.clone();
        let _handle = bus.subscribe_all(move |_| {
            hits_cb.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(event(EventType::RoomCreated));
        bus.publish(event(EventType::RoomDeleted));
        bus.publish(event(EventType::MetadataUpdated));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_drop_handle_deregisters() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_cb = hits.clone();
        let handle = bus.subscribe_all(move |_| {
            hits_cb.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(bus.subscriber_count(), 1);

        drop(handle);
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(event(EventType::RoomCreated));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_detach_keeps_subscription() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_cb = hits.clone();
        bus.subscribe_all(move |_| {
            hits_cb.fetch_add(1, Ordering::SeqCst);
        })
        .detach();

        bus.publish(event(EventType::RoomCreated));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_publish_sync_runs_in_caller_order() {
        let bus = EventBus::new();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_cb = seen.clone();
        let _handle = bus.subscribe_all(move |e| {
            seen_cb.lock().unwrap().push(e.kind());
        });

        bus.publish_sync(event(EventType::RoomCreated));
        bus.publish_sync(event(EventType::MetadataUpdated));
        bus.publish_sync(event(EventType::RoomDeleted));

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                EventType::RoomCreated,
                EventType::MetadataUpdated,
                EventType::RoomDeleted
            ]
        );
    }

    #[tokio::test]
    async fn test_per_subscriber_ordering_async() {
        let bus = EventBus::new();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_cb = seen.clone();
        let _handle = bus.subscribe(EventType::RoomCreated, move |e| {
            seen_cb.lock().unwrap().push(e.timestamp);
        });

        for _ in 0..20 {
            bus.publish(event(EventType::RoomCreated));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 20);
        let mut sorted = seen.clone();
        sorted.sort();
        assert_eq!(*seen, sorted);
    }

    #[tokio::test]
    async fn test_panicking_subscriber_deregistered_after_repeat_offence() {
        let bus = EventBus::new();
        let healthy_hits = Arc::new(AtomicUsize::new(0));
        let healthy_cb = healthy_hits.clone();
        let _healthy = bus.subscribe_all(move |_| {
            healthy_cb.fetch_add(1, Ordering::SeqCst);
        });
        let _bad = bus.subscribe_all(|_| panic!("subscriber bug"));

        for _ in 0..4 {
            bus.publish_sync(event(EventType::RoomCreated));
        }
        // Two strikes removed the offender; the healthy one saw all four.
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(healthy_hits.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_event_type_wire_names() {
        assert_eq!(EventType::ParticipantJoined.as_str(), "participant.joined");
        assert_eq!(
            serde_json::to_string(&EventType::TrackUnpublished).unwrap(),
            "\"track.unpublished\""
        );
    }

    #[test]
    fn test_event_timestamp_set_at_creation() {
        let before = Utc::now();
        let e = event(EventType::RoomCreated);
        assert!(e.timestamp >= before);
    }
}
