//! Demand-controlled subscriptions.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use sonde_types::{EventKindSet, HubEvent};
use tokio::sync::mpsc;

/// Options for one subscription.
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Initial demand; events arriving while demand is zero are dropped
    /// for this subscriber and counted.
    pub demand: u64,
    /// Event kinds this subscription receives.
    pub kinds: EventKindSet,
}

impl SubscribeOptions {
    pub fn with_demand(mut self, demand: u64) -> Self {
        self.demand = demand;
        self
    }

    pub fn with_kinds(mut self, kinds: EventKindSet) -> Self {
        self.kinds = kinds;
        self
    }
}

pub(crate) struct SubInner {
    kinds: EventKindSet,
    demand: AtomicU64,
    dropped: AtomicU64,
    cancelled: AtomicBool,
    tx: mpsc::UnboundedSender<HubEvent>,
}

impl SubInner {
    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Offers one event: delivered when demand is available, dropped and
    /// counted when not, ignored when the kind does not match.
    pub(crate) fn offer(&self, event: &HubEvent) -> bool {
        if self.is_cancelled() || !self.kinds.contains(event.kind()) {
            return false;
        }
        // Take one unit of demand, never going below zero.
        let took = self
            .demand
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |d| d.checked_sub(1))
            .is_ok();
        if !took {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        if self.tx.send(event.clone()).is_err() {
            // Receiver side is gone; treat like cancellation.
            self.cancelled.store(true, Ordering::Release);
            return false;
        }
        true
    }
}

pub(crate) fn create(
    topic: String,
    options: SubscribeOptions,
) -> (Subscription, Arc<SubInner>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let inner = Arc::new(SubInner {
        kinds: options.kinds,
        demand: AtomicU64::new(options.demand),
        dropped: AtomicU64::new(0),
        cancelled: AtomicBool::new(false),
        tx,
    });
    (
        Subscription {
            topic,
            inner: Arc::clone(&inner),
            rx,
        },
        inner,
    )
}

/// A live subscription handed to the consumer.
///
/// The queue is unbounded but effectively capped by demand: the bus never
/// enqueues more events than the subscriber has requested.
pub struct Subscription {
    topic: String,
    inner: Arc<SubInner>,
    rx: mpsc::UnboundedReceiver<HubEvent>,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Grants the bus permission to deliver `n` more events.
    pub fn request(&self, n: u64) {
        self.inner.demand.fetch_add(n, Ordering::AcqRel);
    }

    /// Number of events dropped because demand was exhausted.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Awaits the next delivered event; `None` after cancellation once the
    /// queue drains.
    pub async fn recv(&mut self) -> Option<HubEvent> {
        self.rx.recv().await
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<HubEvent> {
        self.rx.try_recv().ok()
    }

    /// Blocking receive for non-async consumers.
    pub fn blocking_recv(&mut self) -> Option<HubEvent> {
        self.rx.blocking_recv()
    }

    /// Stops delivery. In-flight events already queued remain readable;
    /// the bus unregisters this subscription on its next publish to the
    /// topic.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}
