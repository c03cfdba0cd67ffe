//! Apply-wait registry
//!
//! Callers that request apply-immediately semantics block on a one-shot
//! handler keyed by instrument id. The handler is consumed exactly once,
//! by whichever of the applied-confirmation or removal-with-cause events
//! arrives first; the loser finds the entry gone and no-ops.

use parking_lot::Mutex;
use std::collections::HashMap;

use super::model::DeveloperInstrument;
use crate::error::InstrumentResult;

/// One-shot completion callback for an apply-immediately caller.
pub type ApplyHandler = Box<dyn FnOnce(InstrumentResult<DeveloperInstrument>) + Send>;

/// Tracks callers blocked on "apply immediately", keyed by instrument id.
#[derive(Default)]
pub struct ApplyWaitRegistry {
    waiting: Mutex<HashMap<String, ApplyHandler>>,
}

impl ApplyWaitRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `instrument_id`, replacing any previous one.
    pub fn register(&self, instrument_id: impl Into<String>, handler: ApplyHandler) {
        self.waiting.lock().insert(instrument_id.into(), handler);
    }

    /// Resolve the waiter for `instrument_id`, if any.
    ///
    /// The consuming lookup is remove-and-return, so a racing resolution
    /// finds nothing and returns `false`. The handler runs without the
    /// registry lock held.
    pub fn resolve(
        &self,
        instrument_id: &str,
        result: InstrumentResult<DeveloperInstrument>,
    ) -> bool {
        let handler = self.waiting.lock().remove(instrument_id);
        match handler {
            Some(handler) => {
                handler(result);
                true
            }
            None => false,
        }
    }

    /// Drop the waiter for `instrument_id` without invoking it.
    ///
    /// Used when an apply-immediately caller gives up (e.g. timeout).
    pub fn cancel(&self, instrument_id: &str) -> bool {
        self.waiting.lock().remove(instrument_id).is_some()
    }

    /// Number of callers currently waiting.
    pub fn waiting_count(&self) -> usize {
        self.waiting.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::InstrumentError;
    use crate::instrument::model::{LiveInstrument, SourceLocation};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sample() -> DeveloperInstrument {
        let mut bp = LiveInstrument::breakpoint(SourceLocation::new("Foo", 1));
        bp.id = Some("bp-1".to_string());
        DeveloperInstrument::new("alice", bp)
    }

    #[test]
    fn resolves_exactly_once() {
        let registry = ApplyWaitRegistry::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        registry.register("bp-1", Box::new(move |_| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(registry.resolve("bp-1", Ok(sample())));
        // A racing removal event loses and must be a safe no-op.
        assert!(!registry.resolve(
            "bp-1",
            Err(InstrumentError::UnrecognizedCause("late".to_string()))
        ));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancel_drops_without_invoking() {
        let registry = ApplyWaitRegistry::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        registry.register("bp-1", Box::new(move |_| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(registry.cancel("bp-1"));
        assert!(!registry.resolve("bp-1", Ok(sample())));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(registry.waiting_count(), 0);
    }
}
