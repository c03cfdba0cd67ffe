//! In-process event bus
//!
//! All platform components communicate exclusively through published and
//! consumed messages on named addresses. Consumers come in two forms:
//! inline handlers (invoked on the publisher's thread) and bounded channel
//! consumers for subscriber-facing delivery. Publishing is fire-and-forget
//! with an explicit [`PublishOutcome`] so a missing remote is a first-class
//! result, not a caught exception.
//!
//! Ordering is preserved per address; nothing is guaranteed across
//! addresses. A channel consumer whose buffer is full is dropped rather
//! than blocking the publisher.

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::error::{BusError, BusResult};

/// Result of a publish: how the message was (or was not) delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum PublishOutcome {
    /// Delivered to this many live consumers
    Delivered(usize),
    /// No consumer is registered on the address
    NoSubscriber,
}

impl PublishOutcome {
    /// Whether at least one consumer received the message.
    pub fn is_delivered(&self) -> bool {
        matches!(self, PublishOutcome::Delivered(n) if *n > 0)
    }
}

/// Callback invoked for each message delivered to a handler consumer.
pub type Handler = Arc<dyn Fn(&Value) + Send + Sync>;

#[derive(Clone)]
enum ConsumerSink {
    Handler(Handler),
    Channel(Sender<Value>),
}

#[derive(Clone)]
struct RegisteredConsumer {
    id: u64,
    sink: ConsumerSink,
}

struct BusInner {
    consumers: RwLock<HashMap<String, Vec<RegisteredConsumer>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

/// Named-address pub/sub bus shared by every platform component.
///
/// Cloning is cheap; all clones share the same consumer table.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Create a new, empty bus.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                consumers: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Register an inline handler consumer on `address`.
    ///
    /// The handler runs on the publishing thread; it must not block.
    pub fn consumer<F>(&self, address: impl Into<String>, handler: F) -> ConsumerHandle
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.register(address.into(), ConsumerSink::Handler(Arc::new(handler)))
    }

    /// Register a bounded channel consumer on `address`.
    ///
    /// The receiver end is handed to the caller. If the buffer fills up the
    /// consumer is dropped from the address rather than blocking publishers.
    pub fn channel_consumer(
        &self,
        address: impl Into<String>,
        buffer: usize,
    ) -> (ConsumerHandle, Receiver<Value>) {
        let (sender, receiver) = bounded(buffer);
        let handle = self.register(address.into(), ConsumerSink::Channel(sender));
        (handle, receiver)
    }

    fn register(&self, address: String, sink: ConsumerSink) -> ConsumerHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let mut consumers = self.inner.consumers.write();
        consumers
            .entry(address.clone())
            .or_default()
            .push(RegisteredConsumer { id, sink });
        ConsumerHandle {
            inner: self.inner.clone(),
            address,
            id,
        }
    }

    /// Publish `value` to every consumer on `address`.
    ///
    /// Handler consumers are invoked inline without any bus lock held, so a
    /// handler may itself publish or (un)register consumers. Channel
    /// consumers whose buffer is full or whose receiver is gone are pruned.
    pub fn publish(&self, address: &str, value: Value) -> BusResult<PublishOutcome> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }

        let targets: Vec<RegisteredConsumer> = {
            let consumers = self.inner.consumers.read();
            match consumers.get(address) {
                Some(list) if !list.is_empty() => list.clone(),
                _ => return Ok(PublishOutcome::NoSubscriber),
            }
        };

        let mut delivered = 0usize;
        let mut dead: Vec<u64> = Vec::new();
        for consumer in &targets {
            match &consumer.sink {
                ConsumerSink::Handler(handler) => {
                    handler(&value);
                    delivered += 1;
                }
                ConsumerSink::Channel(sender) => match sender.try_send(value.clone()) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                        dead.push(consumer.id);
                    }
                },
            }
        }

        if !dead.is_empty() {
            tracing::warn!(
                address,
                dropped = dead.len(),
                "dropping unresponsive bus consumers"
            );
            let mut consumers = self.inner.consumers.write();
            if let Some(list) = consumers.get_mut(address) {
                list.retain(|c| !dead.contains(&c.id));
                if list.is_empty() {
                    consumers.remove(address);
                }
            }
        }

        if delivered == 0 {
            Ok(PublishOutcome::NoSubscriber)
        } else {
            Ok(PublishOutcome::Delivered(delivered))
        }
    }

    /// Number of live consumers on `address`.
    pub fn consumer_count(&self, address: &str) -> usize {
        self.inner
            .consumers
            .read()
            .get(address)
            .map(|list| list.len())
            .unwrap_or(0)
    }

    /// Shut the bus down. Further publishes fail with [`BusError::Closed`].
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.consumers.write().clear();
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a registered consumer; used to unregister it.
pub struct ConsumerHandle {
    inner: Arc<BusInner>,
    address: String,
    id: u64,
}

impl ConsumerHandle {
    /// The address this consumer is registered on.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Remove the consumer from its address. Idempotent.
    pub fn unregister(&self) {
        let mut consumers = self.inner.consumers.write();
        if let Some(list) = consumers.get_mut(&self.address) {
            list.retain(|c| c.id != self.id);
            if list.is_empty() {
                consumers.remove(&self.address);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[test]
    fn publish_without_consumers_reports_no_subscriber() {
        let bus = EventBus::new();
        let outcome = bus.publish("nobody.home", json!({})).unwrap();
        assert_eq!(outcome, PublishOutcome::NoSubscriber);
    }

    #[test]
    fn handler_consumers_receive_inline() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let _handle = bus.consumer("greetings", move |value| {
            seen_clone.lock().unwrap().push(value.clone());
        });

        let outcome = bus.publish("greetings", json!({"hello": "world"})).unwrap();
        assert_eq!(outcome, PublishOutcome::Delivered(1));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn unregistered_consumers_stop_receiving() {
        let bus = EventBus::new();
        let (handle, receiver) = bus.channel_consumer("updates", 8);
        assert!(bus.publish("updates", json!(1)).unwrap().is_delivered());
        assert_eq!(receiver.try_recv().unwrap(), json!(1));

        handle.unregister();
        let outcome = bus.publish("updates", json!(2)).unwrap();
        assert_eq!(outcome, PublishOutcome::NoSubscriber);
    }

    #[test]
    fn full_channel_consumers_are_dropped() {
        let bus = EventBus::new();
        let (_handle, receiver) = bus.channel_consumer("firehose", 1);
        assert!(bus.publish("firehose", json!(1)).unwrap().is_delivered());
        // Buffer now full; the consumer is pruned instead of blocking.
        let outcome = bus.publish("firehose", json!(2)).unwrap();
        assert_eq!(outcome, PublishOutcome::NoSubscriber);
        assert_eq!(bus.consumer_count("firehose"), 0);
        assert_eq!(receiver.try_recv().unwrap(), json!(1));
    }

    #[test]
    fn closed_bus_rejects_publishes() {
        let bus = EventBus::new();
        bus.close();
        assert!(matches!(
            bus.publish("anywhere", json!(null)),
            Err(BusError::Closed)
        ));
    }

    #[test]
    fn handlers_may_publish_reentrantly() {
        let bus = EventBus::new();
        let bus_clone = bus.clone();
        let _first = bus.consumer("first", move |_| {
            let _ = bus_clone.publish("second", json!("chained"));
        });
        let (_handle, receiver) = bus.channel_consumer("second", 8);

        assert!(bus.publish("first", json!(null)).unwrap().is_delivered());
        assert_eq!(receiver.try_recv().unwrap(), json!("chained"));
    }
}
