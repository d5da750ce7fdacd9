use dashmap::DashMap;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::warn;
use ulid::Ulid;

use crate::model::LifecycleEvent;
use crate::store::CommitHook;

pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Fan-out of lifecycle events to every attached observer.
///
/// Each observer owns an independent cursor into a bounded ring. Publishing
/// never waits: an observer that falls more than `capacity` events behind loses
/// the oldest ones (for itself only) and carries on from there.
pub struct NotifyHub {
    all: broadcast::Sender<LifecycleEvent>,
    machines: DashMap<Ulid, broadcast::Sender<LifecycleEvent>>,
    capacity: usize,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl NotifyHub {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            all: broadcast::channel(capacity).0,
            machines: DashMap::new(),
            capacity,
        }
    }

    /// Attach to every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.all.subscribe()
    }

    /// Attach to one machine's events. Creates the channel if needed, first
    /// dropping channels whose observers have all gone away.
    pub fn subscribe_machine(&self, machine_id: Ulid) -> broadcast::Receiver<LifecycleEvent> {
        if !self.machines.contains_key(&machine_id) {
            self.machines.retain(|_, sender| sender.receiver_count() > 0);
        }
        self.machines
            .entry(machine_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Deliver to all current observers. No-op if nobody is listening.
    pub fn publish(&self, event: &LifecycleEvent) {
        let machine_id = event.machine_id();
        let orphaned = match self.machines.get(&machine_id) {
            Some(sender) => sender.send(event.clone()).is_err(),
            None => false,
        };
        if orphaned {
            self.machines
                .remove_if(&machine_id, |_, sender| sender.receiver_count() == 0);
        }
        let _ = self.all.send(event.clone());
    }

    /// Per-machine channels currently held.
    pub fn machine_channel_count(&self) -> usize {
        self.machines.len()
    }

    pub fn observer_count(&self) -> usize {
        self.all.receiver_count()
    }

    /// Lazy, infinite event stream starting now. Not restartable: a new call
    /// starts a new cursor, it never replays.
    pub fn events(&self) -> BoxStream<'static, LifecycleEvent> {
        into_stream(self.subscribe())
    }

    pub fn machine_events(&self, machine_id: Ulid) -> BoxStream<'static, LifecycleEvent> {
        into_stream(self.subscribe_machine(machine_id))
    }
}

impl CommitHook for NotifyHub {
    fn committed(&self, event: LifecycleEvent) {
        self.publish(&event);
    }
}

/// Turn a receiver into a stream that skips over events lost to lag.
pub fn into_stream(rx: broadcast::Receiver<LifecycleEvent>) -> BoxStream<'static, LifecycleEvent> {
    stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => return Some((event, rx)),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "observer lagged; events dropped for this observer");
                    metrics::counter!(crate::observability::OBSERVER_EVENTS_DROPPED_TOTAL).increment(skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Category, Reservation, Span};

    fn booked(machine_id: Ulid, start: i64) -> LifecycleEvent {
        LifecycleEvent::Booked {
            reservation: Reservation::booked("u".into(), machine_id, Category::Washer, Span::new(start, start + 1), 0),
        }
    }

    #[tokio::test]
    async fn every_observer_sees_events_in_publish_order() {
        let hub = NotifyHub::new(16);
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();
        let mid = Ulid::new();
        let events: Vec<_> = (0..5).map(|i| booked(mid, i)).collect();
        for e in &events {
            hub.publish(e);
        }
        for e in &events {
            assert_eq!(&a.recv().await.unwrap(), e);
            assert_eq!(&b.recv().await.unwrap(), e);
        }
    }

    #[tokio::test]
    async fn publish_without_observers_is_noop() {
        let hub = NotifyHub::default();
        assert_eq!(hub.observer_count(), 0);
        hub.publish(&LifecycleEvent::Cancelled {
            reservation_id: Ulid::new(),
            machine_id: Ulid::new(),
        });
    }

    #[tokio::test]
    async fn late_observer_gets_no_replay() {
        let hub = NotifyHub::new(16);
        let mid = Ulid::new();
        hub.publish(&booked(mid, 0));
        let mut late = hub.subscribe();
        let fresh = booked(mid, 10);
        hub.publish(&fresh);
        assert_eq!(late.recv().await.unwrap(), fresh);
    }

    #[tokio::test]
    async fn slow_observer_does_not_hold_back_others() {
        let hub = NotifyHub::new(2);
        let mut slow = hub.events();
        let mut fast = hub.subscribe();
        let mid = Ulid::new();
        let events: Vec<_> = (0..5).map(|i| booked(mid, i)).collect();
        for e in &events {
            hub.publish(e);
            assert_eq!(&fast.recv().await.unwrap(), e);
        }
        // The slow observer lost the oldest three and resumes with the rest.
        assert_eq!(slow.next().await.unwrap(), events[3]);
        assert_eq!(slow.next().await.unwrap(), events[4]);
    }

    #[tokio::test]
    async fn machine_channel_only_sees_its_machine() {
        let hub = NotifyHub::new(16);
        let mine = Ulid::new();
        let other = Ulid::new();
        let mut rx = hub.machine_events(mine);
        hub.publish(&booked(other, 0));
        let expected = booked(mine, 1);
        hub.publish(&expected);
        assert_eq!(rx.next().await.unwrap(), expected);
    }

    #[tokio::test]
    async fn abandoned_machine_channels_are_dropped() {
        let hub = NotifyHub::new(4);
        for _ in 0..1000 {
            drop(hub.machine_events(Ulid::new()));
        }
        assert!(hub.machine_channel_count() <= 1);

        let kept = Ulid::new();
        let mut rx = hub.machine_events(kept);
        let gone = Ulid::new();
        drop(hub.machine_events(gone));
        hub.publish(&booked(gone, 0));
        assert_eq!(hub.machine_channel_count(), 1);

        let expected = booked(kept, 1);
        hub.publish(&expected);
        assert_eq!(rx.next().await.unwrap(), expected);
    }

    #[tokio::test]
    async fn stream_ends_when_hub_dropped() {
        let hub = NotifyHub::new(4);
        let mut events = hub.events();
        drop(hub);
        assert!(events.next().await.is_none());
    }
}
