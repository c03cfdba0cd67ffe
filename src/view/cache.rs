//! Two-level view subscription cache
//!
//! Index shape: metric/view-type name -> entity id -> subscribers, keyed
//! by subscription id. Every second-level set is non-empty; emptied sets
//! and emptied entity maps are pruned immediately, so cache size always
//! reflects live membership.

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::model::ViewSubscription;
use crate::bus::ConsumerHandle;

/// A registered subscriber: descriptor, owner, and the live bus consumer
/// feeding it. The consumer must be unregistered when the subscriber is
/// removed.
pub struct ViewSubscriber {
    /// Current subscription descriptor; updates mutate it in place
    pub subscription: Arc<RwLock<ViewSubscription>>,
    /// Owning developer id
    pub subscriber_id: String,
    /// Creation timestamp (epoch millis)
    pub created_at: i64,
    consumer: ConsumerHandle,
}

impl ViewSubscriber {
    /// Create a subscriber wrapping a live consumer handle.
    pub fn new(
        subscription: Arc<RwLock<ViewSubscription>>,
        subscriber_id: impl Into<String>,
        created_at: i64,
        consumer: ConsumerHandle,
    ) -> Self {
        Self {
            subscription,
            subscriber_id: subscriber_id.into(),
            created_at,
            consumer,
        }
    }

    /// The assigned subscription id.
    pub fn subscription_id(&self) -> String {
        self.subscription
            .read()
            .subscription_id
            .clone()
            .unwrap_or_default()
    }

    /// Snapshot of the current descriptor.
    pub fn snapshot(&self) -> ViewSubscription {
        self.subscription.read().clone()
    }

    /// Tear down the live event consumer.
    pub fn unregister_consumer(&self) {
        self.consumer.unregister();
    }
}

type EntitySubscribers = HashMap<String, HashMap<String, Arc<ViewSubscriber>>>;

/// Concurrent two-level subscription index.
#[derive(Default)]
pub struct SubscriptionCache {
    inner: RwLock<HashMap<String, EntitySubscribers>>,
}

impl SubscriptionCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `subscriber` under every (metric type, entity id) pair.
    pub fn register<'a>(
        &self,
        subscriber: &Arc<ViewSubscriber>,
        metric_types: impl IntoIterator<Item = &'a str>,
        entity_ids: impl IntoIterator<Item = &'a str> + Clone,
    ) {
        let id = subscriber.subscription_id();
        let mut inner = self.inner.write();
        for metric_type in metric_types {
            let entities = inner.entry(metric_type.to_string()).or_default();
            for entity_id in entity_ids.clone() {
                entities
                    .entry(entity_id.to_string())
                    .or_default()
                    .insert(id.clone(), subscriber.clone());
            }
        }
    }

    /// Add one (metric type, entity id) entry for `subscriber`.
    pub fn insert(&self, metric_type: &str, entity_id: &str, subscriber: Arc<ViewSubscriber>) {
        let mut inner = self.inner.write();
        inner
            .entry(metric_type.to_string())
            .or_default()
            .entry(entity_id.to_string())
            .or_default()
            .insert(subscriber.subscription_id(), subscriber);
    }

    /// Remove the subscriber with `subscription_id` from one entry,
    /// pruning emptied branches.
    pub fn remove(&self, metric_type: &str, entity_id: &str, subscription_id: &str) {
        let mut inner = self.inner.write();
        if let Some(entities) = inner.get_mut(metric_type) {
            if let Some(subscribers) = entities.get_mut(entity_id) {
                subscribers.remove(subscription_id);
                if subscribers.is_empty() {
                    entities.remove(entity_id);
                }
            }
            if entities.is_empty() {
                inner.remove(metric_type);
            }
        }
    }

    /// Find a subscriber anywhere in the cache by subscription id.
    pub fn find(&self, subscription_id: &str) -> Option<Arc<ViewSubscriber>> {
        let inner = self.inner.read();
        inner
            .values()
            .flat_map(|entities| entities.values())
            .find_map(|subscribers| subscribers.get(subscription_id).cloned())
    }

    /// Remove a subscriber from every entry it belongs to.
    pub fn unregister(&self, subscription_id: &str) -> Option<Arc<ViewSubscriber>> {
        let mut removed = None;
        let mut inner = self.inner.write();
        inner.retain(|_, entities| {
            entities.retain(|_, subscribers| {
                if let Some(subscriber) = subscribers.remove(subscription_id) {
                    removed = Some(subscriber);
                }
                !subscribers.is_empty()
            });
            !entities.is_empty()
        });
        removed
    }

    /// Subscribers registered under a (metric type, entity id) pair.
    pub fn subscribers_for(&self, metric_type: &str, entity_id: &str) -> Vec<Arc<ViewSubscriber>> {
        let inner = self.inner.read();
        inner
            .get(metric_type)
            .and_then(|entities| entities.get(entity_id))
            .map(|subscribers| subscribers.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Distinct subscribers owned by `developer`.
    pub fn for_developer(&self, developer: &str) -> Vec<Arc<ViewSubscriber>> {
        let inner = self.inner.read();
        let mut seen = HashMap::new();
        for entities in inner.values() {
            for subscribers in entities.values() {
                for (id, subscriber) in subscribers {
                    if subscriber.subscriber_id == developer {
                        seen.entry(id.clone()).or_insert_with(|| subscriber.clone());
                    }
                }
            }
        }
        seen.into_values().collect()
    }

    /// Remove every subscriber owned by `developer`, pruning as it goes.
    pub fn unregister_developer(&self, developer: &str) -> Vec<Arc<ViewSubscriber>> {
        let mut removed: HashMap<String, Arc<ViewSubscriber>> = HashMap::new();
        let mut inner = self.inner.write();
        inner.retain(|_, entities| {
            entities.retain(|_, subscribers| {
                subscribers.retain(|id, subscriber| {
                    if subscriber.subscriber_id == developer {
                        removed
                            .entry(id.clone())
                            .or_insert_with(|| subscriber.clone());
                        false
                    } else {
                        true
                    }
                });
                !subscribers.is_empty()
            });
            !entities.is_empty()
        });
        removed.into_values().collect()
    }

    /// Snapshot of subscriber counts: metric type -> entity id -> count.
    pub fn stats(&self) -> BTreeMap<String, BTreeMap<String, usize>> {
        let inner = self.inner.read();
        inner
            .iter()
            .map(|(metric_type, entities)| {
                let counts = entities
                    .iter()
                    .map(|(entity_id, subscribers)| (entity_id.clone(), subscribers.len()))
                    .collect();
                (metric_type.clone(), counts)
            })
            .collect()
    }

    /// True when no subscriber is registered at all.
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}
