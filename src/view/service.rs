//! View subscription service
//!
//! Owns the subscription cache and the per-subscription event consumers.
//! Each subscription gets a private `view.<uuid>` address; the internal
//! metric/trace/log feed publishes batches there, and the consumer
//! reshapes them into [`ViewEvent`]s on the owning developer's outbound
//! address.

use chrono::Utc;
use parking_lot::RwLock;
use serde_json::{Value, json};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Weak};
use uuid::Uuid;

use super::cache::{SubscriptionCache, ViewSubscriber};
use super::model::{ViewEvent, ViewSubscription};
use crate::bus::{ConsumerHandle, EventBus};
use crate::error::{ViewError, ViewResult};
use crate::instrument::command::MARKER_DISCONNECTED;

/// Outbound address carrying reshaped view events for one developer.
pub fn view_subscriber_address(developer: &str) -> String {
    format!("subscriber.view.{developer}")
}

/// Manages view subscriptions and their fan-out bookkeeping.
pub struct LiveViewService {
    bus: EventBus,
    cache: SubscriptionCache,
    marker_consumer: RwLock<Option<ConsumerHandle>>,
}

impl LiveViewService {
    /// Create the service and wire the client-disconnected signal to
    /// subscription cleanup.
    pub fn start(bus: EventBus) -> Arc<Self> {
        let service = Arc::new(Self {
            bus: bus.clone(),
            cache: SubscriptionCache::new(),
            marker_consumer: RwLock::new(None),
        });

        let weak: Weak<Self> = Arc::downgrade(&service);
        let handle = bus.consumer(MARKER_DISCONNECTED, move |body| {
            let Some(service) = weak.upgrade() else {
                return;
            };
            let Some(developer) = body.get("developer").and_then(Value::as_str) else {
                tracing::warn!("marker-disconnected signal missing developer id");
                return;
            };
            match service.clear_live_views(developer) {
                Ok(cleared) => tracing::info!(
                    developer,
                    count = cleared.len(),
                    "cleared live views for disconnected marker"
                ),
                Err(err) => {
                    tracing::warn!(developer, error = %err, "failed to clear live views on disconnect")
                }
            }
        });
        *service.marker_consumer.write() = Some(handle);
        service
    }

    /// Add a subscription for `developer`, allocating a fresh id and
    /// opening its live event consumer.
    pub fn add_live_view(
        &self,
        developer: &str,
        subscription: ViewSubscription,
    ) -> ViewResult<ViewSubscription> {
        let address = format!("view.{}", Uuid::new_v4());
        let mut assigned = subscription;
        assigned.subscription_id = Some(address.clone());
        tracing::info!(developer, subscription_id = %address, "adding live view");

        let state = Arc::new(RwLock::new(assigned.clone()));
        let forward_state = state.clone();
        let forward_bus = self.bus.clone();
        let outbound = view_subscriber_address(developer);
        let consumer = self.bus.consumer(address, move |event| {
            forward_view_event(&forward_bus, &forward_state, &outbound, event);
        });

        let subscriber = Arc::new(ViewSubscriber::new(
            state,
            developer,
            Utc::now().timestamp_millis(),
            consumer,
        ));
        let metric_types: Vec<String> = assigned.view_config.view_metrics.clone();
        let entity_ids: Vec<String> = assigned.entity_ids.iter().cloned().collect();
        self.cache.register(
            &subscriber,
            metric_types.iter().map(String::as_str),
            entity_ids.iter().map(String::as_str),
        );

        Ok(assigned)
    }

    /// Remove a subscription by id, tearing down its consumer.
    pub fn remove_live_view(&self, subscription_id: &str) -> ViewResult<ViewSubscription> {
        tracing::debug!(subscription_id, "removing live view");
        let subscriber = self
            .cache
            .unregister(subscription_id)
            .ok_or_else(|| ViewError::InvalidSubscriptionId(subscription_id.to_string()))?;
        subscriber.unregister_consumer();
        tracing::info!(subscription_id, "removed live view");
        Ok(subscriber.snapshot())
    }

    /// Update a subscription's entity id set, reindexing the cache by the
    /// symmetric difference and pruning emptied branches.
    pub fn update_live_view(
        &self,
        subscription_id: &str,
        subscription: ViewSubscription,
    ) -> ViewResult<ViewSubscription> {
        tracing::debug!(subscription_id, "updating live view");
        let subscriber = self
            .cache
            .find(subscription_id)
            .ok_or_else(|| ViewError::InvalidSubscriptionId(subscription_id.to_string()))?;

        let current = subscriber.snapshot();
        let removed: BTreeSet<String> = current
            .entity_ids
            .difference(&subscription.entity_ids)
            .cloned()
            .collect();
        let added: BTreeSet<String> = subscription
            .entity_ids
            .difference(&current.entity_ids)
            .cloned()
            .collect();

        for metric_type in &subscription.view_config.view_metrics {
            for entity_id in &removed {
                self.cache.remove(metric_type, entity_id, subscription_id);
            }
            for entity_id in &added {
                self.cache.insert(metric_type, entity_id, subscriber.clone());
            }
        }

        {
            let mut stored = subscriber.subscription.write();
            stored.entity_ids.retain(|id| !removed.contains(id));
            stored.entity_ids.extend(added);
        }
        Ok(subscriber.snapshot())
    }

    /// Read-only lookup by subscription id.
    pub fn get_live_view(&self, subscription_id: &str) -> ViewResult<ViewSubscription> {
        self.cache
            .find(subscription_id)
            .map(|subscriber| subscriber.snapshot())
            .ok_or_else(|| ViewError::InvalidSubscriptionId(subscription_id.to_string()))
    }

    /// All subscriptions owned by `developer`.
    pub fn get_live_views(&self, developer: &str) -> Vec<ViewSubscription> {
        self.cache
            .for_developer(developer)
            .into_iter()
            .map(|subscriber| subscriber.snapshot())
            .collect()
    }

    /// Remove and tear down every subscription owned by `developer`.
    pub fn clear_live_views(&self, developer: &str) -> ViewResult<Vec<ViewSubscription>> {
        let removed = self.cache.unregister_developer(developer);
        let mut cleared = Vec::with_capacity(removed.len());
        for subscriber in removed {
            subscriber.unregister_consumer();
            cleared.push(subscriber.snapshot());
        }
        Ok(cleared)
    }

    /// Diagnostic snapshot: metric type -> entity id -> subscriber count.
    pub fn stats(&self) -> BTreeMap<String, BTreeMap<String, usize>> {
        self.cache.stats()
    }

    /// The underlying cache, for the metric feed integration.
    pub fn cache(&self) -> &SubscriptionCache {
        &self.cache
    }
}

/// Reshape one internal metric event and publish it to the developer's
/// outbound address. Multi-metric batches collapse into a single event
/// whose time bucket comes from the first row.
fn forward_view_event(
    bus: &EventBus,
    state: &Arc<RwLock<ViewSubscription>>,
    outbound: &str,
    event: &Value,
) {
    let subscription = state.read().clone();
    let Some(subscription_id) = subscription.subscription_id.clone() else {
        return;
    };

    let (time_bucket, metrics_data) = if event
        .get("multiMetrics")
        .and_then(Value::as_bool)
        .unwrap_or(false)
    {
        let Some(rows) = event.get("metrics").and_then(Value::as_array) else {
            tracing::warn!(subscription_id, "multi-metric event without rows");
            return;
        };
        let bucket = rows.first().map(|row| time_bucket_of(row)).unwrap_or_default();
        (bucket, Value::Array(rows.clone()).to_string())
    } else {
        (time_bucket_of(event), event.to_string())
    };

    let view_event = ViewEvent {
        subscription_id,
        entity_id: subscription
            .primary_entity_id()
            .unwrap_or_default()
            .to_string(),
        artifact_qualified_name: subscription.artifact_qualified_name.clone(),
        time_bucket,
        view_config: subscription.view_config.clone(),
        metrics_data,
    };
    if let Err(err) = bus.publish(outbound, json!(view_event)) {
        tracing::warn!(error = %err, "failed to forward view event");
    }
}

fn time_bucket_of(row: &Value) -> String {
    match row.get("timeBucket") {
        Some(Value::String(bucket)) => bucket.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}
