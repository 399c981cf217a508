//! In-process publish/subscribe router.
//!
//! Every subscriber owns a bounded tokio mpsc buffer. `publish` never blocks:
//! when a subscriber's buffer is full the new event is dropped for that
//! subscriber only, a warning is logged and the per-type drop counter is
//! bumped. `publish_blocking` waits for space instead and is meant for paths
//! where losing an event is not acceptable.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::mpsc::{self, error::TrySendError};

use crate::events::{Event, EventType};
use crate::logging::log_dropped_event;

pub const DEFAULT_BUFFER_SIZE: usize = 1000;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TypeCounters {
    pub published: u64,
    pub dropped: u64,
}

#[derive(Debug)]
struct Subscriber {
    id: u64,
    tx: mpsc::Sender<Event>,
}

#[derive(Debug)]
struct BusInner {
    subscribers: RwLock<HashMap<EventType, Vec<Subscriber>>>,
    counters: Mutex<BTreeMap<EventType, TypeCounters>>,
    next_id: AtomicU64,
    buffer_size: usize,
    closed: AtomicBool,
}

/// Cloneable handle; clones share subscribers and counters.
#[derive(Debug, Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

/// Receiving end of one subscription.
#[derive(Debug)]
pub struct Subscription {
    pub id: u64,
    pub event_type: EventType,
    rx: mpsc::Receiver<Event>,
}

impl Subscription {
    /// Next event, or `None` once the bus is closed or the subscription removed.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }

    /// Drain everything currently buffered.
    pub fn drain(&mut self) -> Vec<Event> {
        let mut out = Vec::new();
        while let Ok(ev) = self.rx.try_recv() {
            out.push(ev);
        }
        out
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE)
    }
}

impl EventBus {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: RwLock::new(HashMap::new()),
                counters: Mutex::new(BTreeMap::new()),
                next_id: AtomicU64::new(1),
                buffer_size: buffer_size.max(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self, event_type: EventType) -> Subscription {
        let (tx, rx) = mpsc::channel(self.inner.buffer_size);
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        if !self.is_closed() {
            let mut subs = self.inner.subscribers.write().unwrap_or_else(|e| e.into_inner());
            subs.entry(event_type).or_default().push(Subscriber { id, tx });
        }
        // On a closed bus the sender is dropped here, so `recv` yields None.
        tracing::debug!(domain = "system", event_type = event_type.as_str(), id, "subscribed");
        Subscription { id, event_type, rx }
    }

    /// Remove a subscription. Returns false if it was unknown.
    pub fn unsubscribe(&self, id: u64) -> bool {
        let mut subs = self.inner.subscribers.write().unwrap_or_else(|e| e.into_inner());
        let mut removed = false;
        for list in subs.values_mut() {
            let before = list.len();
            list.retain(|s| s.id != id);
            removed |= list.len() != before;
        }
        removed
    }

    fn bump(&self, event_type: EventType, published: u64, dropped: u64) {
        let mut counters = self.inner.counters.lock().unwrap_or_else(|e| e.into_inner());
        let c = counters.entry(event_type).or_default();
        c.published += published;
        c.dropped += dropped;
    }

    fn senders(&self, event_type: EventType) -> Vec<(u64, mpsc::Sender<Event>)> {
        let subs = self.inner.subscribers.read().unwrap_or_else(|e| e.into_inner());
        subs.get(&event_type)
            .map(|list| list.iter().map(|s| (s.id, s.tx.clone())).collect())
            .unwrap_or_default()
    }

    fn prune(&self, event_type: EventType, dead: &[u64]) {
        if dead.is_empty() {
            return;
        }
        let mut subs = self.inner.subscribers.write().unwrap_or_else(|e| e.into_inner());
        if let Some(list) = subs.get_mut(&event_type) {
            list.retain(|s| !dead.contains(&s.id));
        }
    }

    /// Fan out without blocking. Returns the number of subscribers that
    /// accepted the event.
    pub fn publish(&self, event: Event) -> usize {
        if self.is_closed() {
            return 0;
        }
        let event_type = event.event_type();
        let senders = self.senders(event_type);
        let mut delivered = 0;
        let mut dropped = 0;
        let mut dead = Vec::new();
        for (id, tx) in senders {
            match tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    dropped += 1;
                    log_dropped_event(event_type.as_str(), id, self.inner.buffer_size);
                }
                Err(TrySendError::Closed(_)) => dead.push(id),
            }
        }
        self.prune(event_type, &dead);
        self.bump(event_type, 1, dropped);
        delivered
    }

    /// Fan out, waiting for buffer space on each subscriber in turn.
    pub async fn publish_blocking(&self, event: Event) -> usize {
        if self.is_closed() {
            return 0;
        }
        let event_type = event.event_type();
        let mut delivered = 0;
        let mut dead = Vec::new();
        for (id, tx) in self.senders(event_type) {
            match tx.send(event.clone()).await {
                Ok(()) => delivered += 1,
                Err(_) => dead.push(id),
            }
        }
        self.prune(event_type, &dead);
        self.bump(event_type, 1, 0);
        delivered
    }

    /// Drop every subscriber; receivers observe end-of-stream.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let mut subs = self.inner.subscribers.write().unwrap_or_else(|e| e.into_inner());
        subs.clear();
    }

    pub fn subscriber_count(&self, event_type: EventType) -> usize {
        let subs = self.inner.subscribers.read().unwrap_or_else(|e| e.into_inner());
        subs.get(&event_type).map(|l| l.len()).unwrap_or(0)
    }

    /// Event types that currently have at least one subscriber, sorted.
    pub fn event_types(&self) -> Vec<EventType> {
        let subs = self.inner.subscribers.read().unwrap_or_else(|e| e.into_inner());
        let mut types: Vec<EventType> = subs.iter().filter(|(_, l)| !l.is_empty()).map(|(t, _)| *t).collect();
        types.sort();
        types
    }

    pub fn counters(&self, event_type: EventType) -> TypeCounters {
        let counters = self.inner.counters.lock().unwrap_or_else(|e| e.into_inner());
        counters.get(&event_type).copied().unwrap_or_default()
    }

    pub fn published(&self, event_type: EventType) -> u64 {
        self.counters(event_type).published
    }

    pub fn dropped(&self, event_type: EventType) -> u64 {
        self.counters(event_type).dropped
    }
}
