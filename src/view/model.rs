//! View subscription descriptors and subscriber-facing events

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Names the metric/view types a subscription receives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewConfig {
    /// Human-readable view name
    pub view_name: String,
    /// Metric/view type names routed to this subscription
    pub view_metrics: Vec<String>,
}

impl ViewConfig {
    /// Create a config for `view_name` over `view_metrics`.
    pub fn new(view_name: impl Into<String>, view_metrics: Vec<String>) -> Self {
        Self {
            view_name: view_name.into(),
            view_metrics,
        }
    }
}

/// A standing request to receive metric/trace/log events for named
/// entities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewSubscription {
    /// Assigned on add; `None` on an incoming request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<String>,
    /// Entity ids the subscription watches
    pub entity_ids: BTreeSet<String>,
    /// Qualified name of the watched artifact
    pub artifact_qualified_name: String,
    /// Which metric/view types to receive
    pub view_config: ViewConfig,
}

impl ViewSubscription {
    /// Create an unassigned subscription.
    pub fn new(
        entity_ids: BTreeSet<String>,
        artifact_qualified_name: impl Into<String>,
        view_config: ViewConfig,
    ) -> Self {
        Self {
            subscription_id: None,
            entity_ids,
            artifact_qualified_name: artifact_qualified_name.into(),
            view_config,
        }
    }

    /// The subscription's primary entity id (first in order).
    pub fn primary_entity_id(&self) -> Option<&str> {
        self.entity_ids.iter().next().map(String::as_str)
    }
}

/// An internal metric event reshaped for one subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewEvent {
    /// The receiving subscription
    pub subscription_id: String,
    /// Primary entity id of the subscription
    pub entity_id: String,
    /// Watched artifact
    pub artifact_qualified_name: String,
    /// Time-bucket key carried by the metric row(s)
    pub time_bucket: String,
    /// The subscription's view config, echoed for the client
    pub view_config: ViewConfig,
    /// JSON-encoded metric row or row batch
    pub metrics_data: String,
}
