//! Publish/subscribe channels for status and pull-progress events.
//!
//! Each event kind gets its own [`EventBus`]. Subscribers receive events in
//! the order they registered; dropping or unsubscribing a [`Subscription`]
//! deregisters it and no further events are delivered to it.

use futures::Stream;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};
use tokio::sync::mpsc;

struct Subscriber<T> {
    id: u64,
    tx: mpsc::UnboundedSender<T>,
}

struct BusInner<T> {
    next_id: AtomicU64,
    subscribers: Mutex<Vec<Subscriber<T>>>,
}

impl<T> BusInner<T> {
    fn remove(&self, id: u64) {
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.retain(|s| s.id != id);
        }
    }
}

/// A fan-out channel for one event kind.
pub struct EventBus<T> {
    inner: Arc<BusInner<T>>,
}

impl<T> Clone for EventBus<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> Default for EventBus<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> EventBus<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                next_id: AtomicU64::new(1),
                subscribers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Register a new subscriber.
    pub fn subscribe(&self) -> Subscription<T> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut subs) = self.inner.subscribers.lock() {
            subs.push(Subscriber { id, tx });
        }
        Subscription {
            id,
            rx,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver `event` to every live subscriber in registration order.
    ///
    /// Returns the number of subscribers that received it.
    pub fn publish(&self, event: T) -> usize {
        let Ok(mut subs) = self.inner.subscribers.lock() else {
            return 0;
        };
        subs.retain(|s| !s.tx.is_closed());
        let mut delivered = 0;
        for sub in subs.iter() {
            if sub.tx.send(event.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .lock()
            .map(|subs| subs.len())
            .unwrap_or(0)
    }
}

/// A registered subscriber. Doubles as the deregistration handle.
pub struct Subscription<T> {
    id: u64,
    rx: mpsc::UnboundedReceiver<T>,
    bus: Weak<BusInner<T>>,
}

impl<T> Subscription<T> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the next event. Returns `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Take an already-delivered event without waiting.
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Deregister explicitly. Equivalent to dropping the subscription.
    pub fn unsubscribe(self) {}
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(self.id);
        }
    }
}

impl<T> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_delivery_in_registration_order() {
        let bus: EventBus<u32> = EventBus::new();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();
        assert!(first.id() < second.id());

        assert_eq!(bus.publish(7), 2);
        assert_eq!(first.recv().await, Some(7));
        assert_eq!(second.recv().await, Some(7));
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let bus: EventBus<&'static str> = EventBus::new();
        let keep = bus.subscribe();
        let gone = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        gone.unsubscribe();
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(bus.publish("status"), 1);
        drop(keep);
        assert_eq!(bus.publish("status"), 0);
    }

    #[tokio::test]
    async fn test_subscription_as_stream() {
        let bus: EventBus<u8> = EventBus::new();
        let sub = bus.subscribe();
        bus.publish(1);
        bus.publish(2);
        drop(bus);
        let collected: Vec<u8> = sub.collect().await;
        assert_eq!(collected, vec![1, 2]);
    }

    #[test]
    fn test_recv_wakes_on_publish() {
        let bus: EventBus<u8> = EventBus::new();
        let mut sub = bus.subscribe();
        let mut next = tokio_test::task::spawn(sub.recv());
        tokio_test::assert_pending!(next.poll());

        bus.publish(9);
        assert!(next.is_woken());
        tokio_test::assert_ready_eq!(next.poll(), Some(9));
    }

    #[test]
    fn test_try_recv_empty() {
        let bus: EventBus<u8> = EventBus::new();
        let mut sub = bus.subscribe();
        assert_eq!(sub.try_recv(), None);
        bus.publish(3);
        assert_eq!(sub.try_recv(), Some(3));
    }
}
