//! Process-wide publish/subscribe channel.
//!
//! Publishing fans out under the registry read lock while attach and detach
//! take the write lock. A subscriber therefore never sees an event published
//! before its `subscribe` call returned, and never misses one published
//! after. Delivery uses unbounded channels so publishers never wait on slow
//! consumers.

use crate::error::BusError;
use comet_core::{Event, EventKind};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use uuid::Uuid;

/// Which event kinds a subscriber wants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFilter {
    kinds: BTreeSet<EventKind>,
}

impl EventFilter {
    pub fn all() -> Self {
        Self::only(EventKind::ALL)
    }

    pub fn only(kinds: impl IntoIterator<Item = EventKind>) -> Self {
        Self {
            kinds: kinds.into_iter().collect(),
        }
    }

    pub fn accepts(&self, kind: EventKind) -> bool {
        self.kinds.contains(&kind)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

struct Subscriber {
    label: String,
    filter: EventFilter,
    sender: UnboundedSender<Event>,
    live: Arc<AtomicBool>,
}

#[derive(Default)]
struct Registry {
    subscribers: HashMap<SubscriptionId, Subscriber>,
    closed: bool,
}

#[derive(Default)]
struct BusInner {
    registry: RwLock<Registry>,
}

impl BusInner {
    fn read(&self) -> RwLockReadGuard<'_, Registry> {
        self.registry
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Registry> {
        self.registry
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn remove(&self, id: SubscriptionId) -> bool {
        match self.write().subscribers.remove(&id) {
            Some(subscriber) => {
                subscriber.live.store(false, Ordering::SeqCst);
                tracing::debug!(subscription = %id, label = %subscriber.label, "subscriber detached");
                true
            }
            None => false,
        }
    }
}

#[derive(Clone, Default)]
pub struct NotificationBus {
    inner: Arc<BusInner>,
}

impl NotificationBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(
        &self,
        label: impl Into<String>,
        filter: EventFilter,
    ) -> Result<Subscription, BusError> {
        let label = label.into();
        let (sender, receiver) = unbounded_channel();
        let live = Arc::new(AtomicBool::new(true));
        let id = SubscriptionId::new();

        let mut registry = self.inner.write();
        if registry.closed {
            return Err(BusError::Closed);
        }
        tracing::debug!(subscription = %id, label = %label, "subscriber attached");
        registry.subscribers.insert(
            id,
            Subscriber {
                label,
                filter,
                sender,
                live: live.clone(),
            },
        );

        Ok(Subscription {
            id,
            bus: Arc::downgrade(&self.inner),
            receiver,
            live,
        })
    }

    /// Detaches a subscriber. Events still queued for it are never handed out.
    pub fn detach(&self, id: SubscriptionId) -> bool {
        self.inner.remove(id)
    }

    /// Returns the number of subscribers the event was delivered to.
    pub fn publish(&self, event: Event) -> usize {
        let registry = self.inner.read();
        if registry.closed {
            tracing::debug!(kind = ?event.kind(), "dropping event published on closed bus");
            return 0;
        }

        let kind = event.kind();
        let mut delivered = 0;
        for subscriber in registry.subscribers.values() {
            if !subscriber.filter.accepts(kind) {
                continue;
            }
            if subscriber.sender.send(event.clone()).is_ok() {
                delivered += 1;
            }
        }
        tracing::trace!(?kind, delivered, "event published");
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.read().subscribers.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.read().closed
    }

    /// Detaches everyone and refuses further subscriptions. Later publishes
    /// are dropped.
    pub fn close(&self) {
        let mut registry = self.inner.write();
        registry.closed = true;
        for (_, subscriber) in registry.subscribers.drain() {
            subscriber.live.store(false, Ordering::SeqCst);
        }
        tracing::info!("notification bus closed");
    }
}

/// Receiving end of a subscription. Dropping it detaches the subscriber.
pub struct Subscription {
    id: SubscriptionId,
    bus: Weak<BusInner>,
    receiver: UnboundedReceiver<Event>,
    live: Arc<AtomicBool>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn is_attached(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// Next event, or `None` once detached.
    pub async fn recv(&mut self) -> Option<Event> {
        if !self.is_attached() {
            return None;
        }
        let event = self.receiver.recv().await?;
        self.is_attached().then_some(event)
    }

    pub fn try_recv(&mut self) -> Option<Event> {
        if !self.is_attached() {
            return None;
        }
        let event = self.receiver.try_recv().ok()?;
        self.is_attached().then_some(event)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use comet_core::Revision;

    fn changed(raw: u64) -> Event {
        Event::StoreChanged {
            revision: Revision::from_raw(raw),
        }
    }

    #[tokio::test]
    async fn filter_limits_delivery() {
        let bus = NotificationBus::new();
        let mut changes = bus
            .subscribe("changes", EventFilter::only([EventKind::StoreChanged]))
            .expect("subscribed");
        let mut ticks = bus
            .subscribe("ticks", EventFilter::only([EventKind::PollTick]))
            .expect("subscribed");

        assert_eq!(bus.publish(changed(1)), 1);
        assert_eq!(changes.recv().await, Some(changed(1)));
        assert!(ticks.try_recv().is_none());
    }

    #[tokio::test]
    async fn late_subscriber_misses_earlier_events() {
        let bus = NotificationBus::new();
        bus.publish(changed(1));
        let mut late = bus.subscribe("late", EventFilter::all()).expect("subscribed");
        bus.publish(changed(2));
        assert_eq!(late.recv().await, Some(changed(2)));
        assert!(late.try_recv().is_none());
    }

    #[tokio::test]
    async fn detached_subscriber_gets_nothing_queued() {
        let bus = NotificationBus::new();
        let mut sub = bus.subscribe("view", EventFilter::all()).expect("subscribed");
        bus.publish(changed(1));
        assert!(bus.detach(sub.id()));
        bus.publish(changed(2));

        assert!(sub.try_recv().is_none());
        assert_eq!(sub.recv().await, None);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn dropping_subscription_detaches() {
        let bus = NotificationBus::new();
        let sub = bus.subscribe("view", EventFilter::all()).expect("subscribed");
        assert_eq!(bus.subscriber_count(), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(bus.publish(changed(1)), 0);
    }

    #[tokio::test]
    async fn closed_bus_drops_publishes() {
        let bus = NotificationBus::new();
        let mut sub = bus.subscribe("view", EventFilter::all()).expect("subscribed");
        bus.close();

        assert_eq!(bus.publish(changed(1)), 0);
        assert_eq!(sub.recv().await, None);
        assert!(bus.subscribe("late", EventFilter::all()).is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn attach_during_publishing_sees_a_suffix() {
        let bus = NotificationBus::new();
        let publisher = {
            let bus = bus.clone();
            tokio::spawn(async move {
                for raw in 0..2_000 {
                    bus.publish(changed(raw));
                    if raw % 100 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            })
        };

        let mut subs = Vec::new();
        for index in 0..20 {
            subs.push(
                bus.subscribe(format!("sub-{index}"), EventFilter::all())
                    .expect("subscribed"),
            );
            tokio::task::yield_now().await;
        }
        publisher.await.expect("publisher finished");

        for mut sub in subs {
            let mut seen = Vec::new();
            while let Some(Event::StoreChanged { revision }) = sub.try_recv() {
                seen.push(revision.into_raw());
            }
            // Whatever a subscriber saw is a gap-free tail of the stream.
            if let Some(first) = seen.first().copied() {
                let expected = (first..2_000).collect::<Vec<_>>();
                assert_eq!(seen, expected);
            }
        }
    }
}
