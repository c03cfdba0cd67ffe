//! Live view subscriptions
//!
//! Routes the internal metric/trace/log stream to the correct subset of
//! external subscribers via a two-level cache with bounded membership
//! bookkeeping.

pub mod cache;
pub mod model;
pub mod service;

pub use cache::{SubscriptionCache, ViewSubscriber};
pub use model::{ViewConfig, ViewEvent, ViewSubscription};
pub use service::{LiveViewService, view_subscriber_address};
