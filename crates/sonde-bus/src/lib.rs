//! Topic-addressed pub/sub for the Sonde observation hub.
//!
//! Topics are hierarchical string IDs (see [`sonde_types::topics`]).
//! Publishing fans an event out to every subscription on the topic whose
//! event-kind set matches. Delivery within one topic follows publication
//! order; across topics no order is guaranteed.
//!
//! Back-pressure is demand-based and never blocks the publisher: each
//! subscription carries a demand counter, and an event arriving while a
//! subscriber has zero demand is dropped for that subscriber and counted,
//! so slow consumers cannot stall fast ones.

mod subscription;

pub use subscription::{SubscribeOptions, Subscription};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use sonde_types::HubEvent;

use subscription::SubInner;

/// The process-wide event bus.
///
/// Cloning is cheap; clones share the same topic registry.
#[derive(Clone, Default)]
pub struct EventBus {
    topics: Arc<RwLock<HashMap<String, Arc<Topic>>>>,
}

struct Topic {
    /// Serialises publishers so subscribers observe publication order.
    publish_lock: Mutex<()>,
    subs: RwLock<Vec<Arc<SubInner>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn topic(&self, topic_id: &str) -> Arc<Topic> {
        if let Some(t) = self.topics.read().expect("topics lock poisoned").get(topic_id) {
            return Arc::clone(t);
        }
        let mut topics = self.topics.write().expect("topics lock poisoned");
        Arc::clone(topics.entry(topic_id.to_string()).or_insert_with(|| {
            Arc::new(Topic {
                publish_lock: Mutex::new(()),
                subs: RwLock::new(Vec::new()),
            })
        }))
    }

    /// Registers a subscription on one topic.
    ///
    /// The returned [`Subscription`] starts with the initial demand from
    /// `options`; request more with [`Subscription::request`].
    pub fn subscribe(&self, topic_id: &str, options: SubscribeOptions) -> Subscription {
        let topic = self.topic(topic_id);
        let (subscription, inner) = subscription::create(topic_id.to_string(), options);
        topic
            .subs
            .write()
            .expect("subscribers lock poisoned")
            .push(inner);
        subscription
    }

    /// Publishes one event to a topic.
    ///
    /// Returns the number of subscriptions the event was delivered to
    /// (dropped-for-zero-demand deliveries not included).
    pub fn publish(&self, topic_id: &str, event: HubEvent) -> usize {
        let topic = self.topic(topic_id);
        let _order = topic.publish_lock.lock().expect("publish lock poisoned");

        // Prune cancelled subscriptions while already holding the write
        // path; this keeps the common read path allocation-free.
        let cancelled_present = {
            let subs = topic.subs.read().expect("subscribers lock poisoned");
            subs.iter().any(|s| s.is_cancelled())
        };
        if cancelled_present {
            topic
                .subs
                .write()
                .expect("subscribers lock poisoned")
                .retain(|s| !s.is_cancelled());
        }

        let subs = topic.subs.read().expect("subscribers lock poisoned");
        let mut delivered = 0;
        for sub in subs.iter() {
            if sub.offer(&event) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Number of live subscriptions on a topic.
    pub fn subscriber_count(&self, topic_id: &str) -> usize {
        self.topics
            .read()
            .expect("topics lock poisoned")
            .get(topic_id)
            .map(|t| {
                t.subs
                    .read()
                    .expect("subscribers lock poisoned")
                    .iter()
                    .filter(|s| !s.is_cancelled())
                    .count()
            })
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sonde_types::{topics, EventKind, EventKindSet};

    fn status_event(uid: &str) -> HubEvent {
        HubEvent::SystemChanged {
            system_uid: uid.to_string(),
        }
    }

    #[tokio::test]
    async fn subscribers_receive_in_publication_order() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe("t", SubscribeOptions::default().with_demand(10));

        for i in 0..5 {
            bus.publish("t", status_event(&format!("urn:sonde:sys:{i}")));
        }

        for i in 0..5 {
            let event = sub.recv().await.expect("event");
            match event {
                HubEvent::SystemChanged { system_uid } => {
                    assert_eq!(system_uid, format!("urn:sonde:sys:{i}"));
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn zero_demand_drops_and_counts() {
        let bus = EventBus::new();
        let fast = bus.subscribe("t", SubscribeOptions::default().with_demand(10));
        let slow = bus.subscribe("t", SubscribeOptions::default().with_demand(0));

        for _ in 0..5 {
            bus.publish("t", status_event("urn:sonde:sys:x"));
        }

        assert_eq!(fast.dropped(), 0);
        assert_eq!(slow.dropped(), 5);

        let mut fast = fast;
        for _ in 0..5 {
            fast.recv().await.expect("fast subscriber got everything");
        }
    }

    #[tokio::test]
    async fn demand_is_consumed_and_replenished() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe("t", SubscribeOptions::default().with_demand(1));

        bus.publish("t", status_event("urn:sonde:sys:a"));
        bus.publish("t", status_event("urn:sonde:sys:b"));
        assert_eq!(sub.dropped(), 1);

        sub.recv().await.expect("first event");
        sub.request(1);
        bus.publish("t", status_event("urn:sonde:sys:c"));
        sub.recv().await.expect("event after replenish");
        assert_eq!(sub.dropped(), 1);
    }

    #[tokio::test]
    async fn cancelled_subscription_receives_nothing_further() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe("t", SubscribeOptions::default().with_demand(10));

        bus.publish("t", status_event("urn:sonde:sys:a"));
        sub.recv().await.unwrap();
        sub.cancel();

        assert_eq!(bus.publish("t", status_event("urn:sonde:sys:b")), 0);
        assert!(sub.try_recv().is_none());
        assert_eq!(bus.subscriber_count("t"), 0);
    }

    #[tokio::test]
    async fn event_kind_set_filters_delivery() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(
            topics::REGISTRY,
            SubscribeOptions::default()
                .with_demand(10)
                .with_kinds(EventKindSet::of(&[EventKind::SystemAdded])),
        );

        bus.publish(topics::REGISTRY, status_event("urn:sonde:sys:skip"));
        bus.publish(
            topics::REGISTRY,
            HubEvent::SystemAdded {
                system_uid: "urn:sonde:sys:new".to_string(),
                name: "new".to_string(),
            },
        );

        let event = sub.recv().await.unwrap();
        assert!(matches!(event, HubEvent::SystemAdded { .. }));
        assert!(sub.try_recv().is_none());
        // A non-matching kind neither consumes demand nor counts as drop.
        assert_eq!(sub.dropped(), 0);
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let bus = EventBus::new();
        let mut a = bus.subscribe("topic-a", SubscribeOptions::default().with_demand(10));
        bus.publish("topic-b", status_event("urn:sonde:sys:b"));
        assert!(a.try_recv().is_none());
    }
}
