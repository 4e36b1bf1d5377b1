// ABOUTME: In-process event bus fanning change events out to subscriber inboxes
// ABOUTME: Non-blocking publish over a copy-on-read registry snapshot with drop accounting

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;
use table_watcher::{ChangeEvent, TableSet};
use tokio::sync::mpsc;

/// Inbox capacity used when none is configured.
pub const DEFAULT_INBOX_CAPACITY: usize = 256;

/// Subscriber ID (unique per registration, never reused)
pub type SubscriberId = u64;

/// Delivery counters shared between a registry slot and its subscriber
#[derive(Debug, Default)]
struct SubscriberCounters {
    delivered: AtomicU64,
    dropped: AtomicU64,
}

/// Registry entry. The bus only holds the sending half of the inbox.
///
/// Publishers hold `active` for reading across the flag check and the
/// `try_send`; `unsubscribe` clears it under the write lock, so once it
/// returns no publisher can still be enqueueing into this slot.
struct Slot {
    filter: TableSet,
    sender: mpsc::Sender<Arc<ChangeEvent>>,
    active: RwLock<bool>,
    counters: Arc<SubscriberCounters>,
}

impl Slot {
    fn deactivate(&self) {
        *self.active.write().unwrap_or_else(PoisonError::into_inner) = false;
    }
}

/// Receiving side of one registration.
///
/// Events are drained in FIFO order. Items already queued stay readable
/// after the registration is removed.
pub struct Subscriber {
    id: SubscriberId,
    filter: TableSet,
    inbox: mpsc::Receiver<Arc<ChangeEvent>>,
    counters: Arc<SubscriberCounters>,
}

impl Subscriber {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn filter(&self) -> TableSet {
        self.filter
    }

    /// Waits for the next event. `None` once unsubscribed and drained.
    pub async fn recv(&mut self) -> Option<Arc<ChangeEvent>> {
        self.inbox.recv().await
    }

    /// Takes the next queued event without waiting.
    ///
    /// Returns `None` when the inbox is empty, whether or not the
    /// registration is still live. Use [`Subscriber::recv`] to tell the two
    /// apart.
    pub fn try_recv(&mut self) -> Option<Arc<ChangeEvent>> {
        self.inbox.try_recv().ok()
    }

    /// Events currently waiting in the inbox
    pub fn buffered(&self) -> usize {
        self.inbox.len()
    }

    /// Events discarded because the inbox was full
    pub fn dropped(&self) -> u64 {
        self.counters.dropped.load(Ordering::Relaxed)
    }

    pub fn delivered(&self) -> u64 {
        self.counters.delivered.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("id", &self.id)
            .field("filter", &self.filter)
            .field("buffered", &self.buffered())
            .field("dropped", &self.dropped())
            .finish()
    }
}

/// Result of one `publish` call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishOutcome {
    /// Active subscribers whose filter included the event's table
    pub matched: usize,
    pub delivered: usize,
    /// Matched subscribers whose inbox was full
    pub dropped: usize,
}

#[derive(Debug, Default)]
struct BusMetrics {
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    subscribed: AtomicU64,
    unsubscribed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BusMetricsSnapshot {
    pub published: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub subscribed: u64,
    pub unsubscribed: u64,
    pub active_subscribers: usize,
}

/// Fan-out point between change feeds and client sessions.
///
/// `publish` runs on the caller's task and never waits on a subscriber. It
/// clones the current slot list and releases the registry lock before
/// delivering, so `subscribe` never waits on a delivery. `unsubscribe`
/// waits at most for a `try_send` already in progress on that one slot.
pub struct EventBus {
    registry: RwLock<HashMap<SubscriberId, Arc<Slot>>>,
    next_id: AtomicU64,
    capacity: usize,
    metrics: BusMetrics,
}

impl EventBus {
    /// Creates a bus whose subscribers each get an inbox of `capacity` events.
    ///
    /// A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            registry: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            capacity: capacity.max(1),
            metrics: BusMetrics::default(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Registers a new subscriber with a bounded inbox.
    ///
    /// # Arguments
    ///
    /// * `filter` - Tables whose events this subscriber receives
    ///
    /// # Returns
    ///
    /// The receiving half. It only sees events published after this call
    /// returns; nothing is replayed.
    ///
    /// # Examples
    ///
    /// ```
    /// # use campus_relay::EventBus;
    /// # use table_watcher::TableSet;
    /// let bus = EventBus::new(16);
    /// let registrar = bus.subscribe("students,enrollments".parse::<TableSet>().unwrap());
    /// assert!(bus.is_registered(registrar.id()));
    /// assert_eq!(bus.subscriber_count(), 1);
    /// ```
    pub fn subscribe(&self, filter: TableSet) -> Subscriber {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, inbox) = mpsc::channel(self.capacity);
        let counters = Arc::new(SubscriberCounters::default());
        let slot = Arc::new(Slot {
            filter,
            sender,
            active: RwLock::new(true),
            counters: Arc::clone(&counters),
        });

        let active = {
            let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
            registry.insert(id, slot);
            registry.len()
        };
        self.metrics.subscribed.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(subscriber = id, tables = %filter, active, "subscriber registered");

        Subscriber {
            id,
            filter,
            inbox,
            counters,
        }
    }

    /// Subscribes and returns a guard that unsubscribes when dropped.
    ///
    /// Sessions keep the guard on their own stack so that every exit path,
    /// including a panic or a dropped response body, releases the slot.
    pub fn register(self: &Arc<Self>, filter: TableSet) -> (Subscriber, Registration) {
        let subscriber = self.subscribe(filter);
        let registration = Registration {
            bus: Arc::clone(self),
            id: subscriber.id(),
        };
        (subscriber, registration)
    }

    /// Removes a subscriber. Returns `false` if it was not registered.
    ///
    /// Once this returns, no publish can deliver to `id` any more. Events
    /// already in the inbox stay readable, and [`Subscriber::recv`] yields
    /// `None` after they are drained.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let (removed, active) = {
            let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
            let removed = registry.remove(&id);
            (removed, registry.len())
        };
        match removed {
            Some(slot) => {
                slot.deactivate();
                self.metrics.unsubscribed.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(subscriber = id, active, "subscriber unregistered");
                true
            }
            None => false,
        }
    }

    /// Wraps `event` in an `Arc` and hands it to [`EventBus::publish_shared`].
    pub fn publish(&self, event: ChangeEvent) -> PublishOutcome {
        self.publish_shared(Arc::new(event))
    }

    /// Offers `event` to every matching inbox. Full inboxes drop the event
    /// for that subscriber only.
    ///
    /// Every matching subscriber gets a clone of the same `Arc`, so the
    /// payload is allocated once however many clients are connected. Events
    /// from one caller arrive in each inbox in the order they were published.
    ///
    /// # Arguments
    ///
    /// * `event` - Change to fan out; routed by `event.table()`
    ///
    /// # Returns
    ///
    /// A [`PublishOutcome`]. `matched` counts registered subscribers whose
    /// filter includes the table; each is delivered, dropped, or skipped
    /// because its receiver is already gone.
    ///
    /// # Examples
    ///
    /// ```
    /// # use std::sync::Arc;
    /// # use campus_relay::EventBus;
    /// # use table_watcher::{ChangeEvent, ChangeOperation, TableName, TableSet};
    /// let bus = EventBus::new(1);
    /// let mut kiosk = bus.subscribe("announcements".parse::<TableSet>().unwrap());
    ///
    /// let record = serde_json::json!({"id": 7}).as_object().cloned();
    /// let posted = ChangeEvent::new(
    ///     TableName::Announcements,
    ///     ChangeOperation::Insert,
    ///     record,
    ///     None,
    ///     chrono::Utc::now(),
    /// )
    /// .unwrap();
    /// let event = Arc::new(posted);
    ///
    /// let first = bus.publish_shared(Arc::clone(&event));
    /// assert_eq!((first.matched, first.delivered, first.dropped), (1, 1, 0));
    ///
    /// // The one-slot inbox is full now.
    /// let second = bus.publish_shared(Arc::clone(&event));
    /// assert_eq!((second.matched, second.delivered, second.dropped), (1, 0, 1));
    ///
    /// assert!(Arc::ptr_eq(&kiosk.try_recv().unwrap(), &event));
    /// ```
    pub fn publish_shared(&self, event: Arc<ChangeEvent>) -> PublishOutcome {
        self.metrics.published.fetch_add(1, Ordering::Relaxed);
        let snapshot: Vec<(SubscriberId, Arc<Slot>)> = self
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, slot)| (*id, Arc::clone(slot)))
            .collect();

        let table = event.table();
        let mut outcome = PublishOutcome::default();
        for (id, slot) in snapshot {
            if !slot.filter.contains(table) {
                continue;
            }
            let active = slot.active.read().unwrap_or_else(PoisonError::into_inner);
            if !*active {
                continue;
            }
            outcome.matched += 1;
            match slot.sender.try_send(Arc::clone(&event)) {
                Ok(()) => {
                    outcome.delivered += 1;
                    slot.counters.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    outcome.dropped += 1;
                    let dropped = slot.counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    tracing::debug!(subscriber = id, table = %table, dropped, "inbox full, event dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    // Receiver gone; the owner's registration guard removes the slot.
                }
            }
        }

        self.metrics
            .delivered
            .fetch_add(outcome.delivered as u64, Ordering::Relaxed);
        self.metrics
            .dropped
            .fetch_add(outcome.dropped as u64, Ordering::Relaxed);
        tracing::trace!(
            table = %table,
            operation = event.operation().as_str(),
            matched = outcome.matched,
            delivered = outcome.delivered,
            dropped = outcome.dropped,
            "published change event"
        );
        outcome
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_registered(&self, id: SubscriberId) -> bool {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id)
    }

    pub fn metrics(&self) -> BusMetricsSnapshot {
        BusMetricsSnapshot {
            published: self.metrics.published.load(Ordering::Relaxed),
            delivered: self.metrics.delivered.load(Ordering::Relaxed),
            dropped: self.metrics.dropped.load(Ordering::Relaxed),
            subscribed: self.metrics.subscribed.load(Ordering::Relaxed),
            unsubscribed: self.metrics.unsubscribed.load(Ordering::Relaxed),
            active_subscribers: self.subscriber_count(),
        }
    }
}

/// Keeps a subscriber registered for as long as it is alive.
#[must_use = "dropping the registration unsubscribes immediately"]
pub struct Registration {
    bus: Arc<EventBus>,
    id: SubscriberId,
}

impl Registration {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Unsubscribes now. Dropping afterwards is harmless.
    pub fn release(&self) -> bool {
        self.bus.unsubscribe(self.id)
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.id);
    }
}
