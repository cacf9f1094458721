//! Observer callback bridge
//!
//! Marshals fragment notifications from the generation thread to the
//! host's observer. The bridge holds the observer weakly behind a
//! revocable slot: a torn-down or revoked observer turns every
//! notification into a silent no-op rather than a fault.

use std::sync::{Arc, RwLock, Weak};

use tokio::runtime::Handle;

/// Callback surface the host implements to receive streamed output.
pub trait ChatObserver: Send + Sync {
    /// Called once per generated fragment, in generation order.
    fn on_fragment(&self, text: &str);

    /// Called exactly once when a generation ends, with the full
    /// accumulated text (possibly partial on failure or cancellation).
    fn on_finished(&self, full_text: &str);
}

type ObserverSlot = Arc<RwLock<Option<Weak<dyn ChatObserver>>>>;

/// Bridges engine-thread notifications to the host observer.
///
/// Clones share one observer slot, so revoking the bridge (on session
/// release) is observed by generation tasks already in flight. If the
/// host registered from inside a tokio runtime, notifications arriving
/// on a bare thread enter that runtime for the duration of the
/// callback; the guard drops on every exit path, so a panicking
/// observer cannot leak the transient association.
#[derive(Clone)]
pub struct CallbackBridge {
    slot: ObserverSlot,
    runtime: Option<Handle>,
}

impl CallbackBridge {
    /// Create a bridge for an observer, capturing the ambient tokio
    /// runtime handle if the caller has one.
    pub fn new(observer: &Arc<dyn ChatObserver>) -> Self {
        Self {
            slot: Arc::new(RwLock::new(Some(Arc::downgrade(observer)))),
            runtime: Handle::try_current().ok(),
        }
    }

    /// Clear the observer slot. All clones of this bridge become
    /// permanent no-ops.
    pub fn revoke(&self) {
        let mut slot = self.slot.write().unwrap_or_else(|e| e.into_inner());
        *slot = None;
        tracing::debug!("Callback bridge revoked");
    }

    /// Deliver one fragment notification.
    pub fn notify_fragment(&self, fragment: &str) {
        self.with_observer(|obs| obs.on_fragment(fragment));
    }

    /// Deliver the terminal notification.
    pub fn notify_finished(&self, full_text: &str) {
        self.with_observer(|obs| obs.on_finished(full_text));
    }

    fn with_observer<F: FnOnce(&dyn ChatObserver)>(&self, f: F) {
        // Upgrade under the read lock, invoke outside it: the observer
        // may call back into code that touches this bridge.
        let observer = {
            let slot = self.slot.read().unwrap_or_else(|e| e.into_inner());
            slot.as_ref().and_then(Weak::upgrade)
        };

        let Some(observer) = observer else {
            tracing::trace!("No live observer, dropping notification");
            return;
        };

        // Attach this thread to the host runtime only if it has none of
        // its own; the guard detaches when it leaves scope.
        let _guard = match (&self.runtime, Handle::try_current()) {
            (Some(handle), Err(_)) => Some(handle.enter()),
            _ => None,
        };

        f(observer.as_ref());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    struct CountingObserver {
        fragments: Arc<AtomicUsize>,
        finishes: Arc<AtomicUsize>,
    }

    impl ChatObserver for CountingObserver {
        fn on_fragment(&self, _text: &str) {
            self.fragments.fetch_add(1, Ordering::SeqCst);
        }

        fn on_finished(&self, _full_text: &str) {
            self.finishes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counting_observer() -> (Arc<dyn ChatObserver>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let fragments = Arc::new(AtomicUsize::new(0));
        let finishes = Arc::new(AtomicUsize::new(0));
        let observer: Arc<dyn ChatObserver> = Arc::new(CountingObserver {
            fragments: fragments.clone(),
            finishes: finishes.clone(),
        });
        (observer, fragments, finishes)
    }

    #[test]
    fn test_notifications_reach_live_observer() {
        let (observer, fragments, finishes) = counting_observer();
        let bridge = CallbackBridge::new(&observer);

        bridge.notify_fragment("a");
        bridge.notify_fragment("b");
        bridge.notify_finished("ab");

        assert_eq!(fragments.load(Ordering::SeqCst), 2);
        assert_eq!(finishes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dropped_observer_is_silent_noop() {
        let (observer, fragments, finishes) = counting_observer();
        let bridge = CallbackBridge::new(&observer);
        drop(observer);

        bridge.notify_fragment("a");
        bridge.notify_finished("a");

        assert_eq!(fragments.load(Ordering::SeqCst), 0);
        assert_eq!(finishes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_revoked_bridge_is_silent_noop() {
        let (observer, fragments, finishes) = counting_observer();
        let bridge = CallbackBridge::new(&observer);
        let task_side = bridge.clone();

        bridge.revoke();
        task_side.notify_fragment("a");
        task_side.notify_finished("a");

        assert_eq!(fragments.load(Ordering::SeqCst), 0);
        assert_eq!(finishes.load(Ordering::SeqCst), 0);
        // Observer is still alive, the slot just no longer reaches it
        drop(observer);
    }

    struct RuntimeProbe {
        results: mpsc::Sender<bool>,
    }

    impl ChatObserver for RuntimeProbe {
        fn on_fragment(&self, _text: &str) {
            let _ = self.results.send(Handle::try_current().is_ok());
        }

        fn on_finished(&self, _full_text: &str) {}
    }

    #[test]
    fn test_transient_runtime_attach_and_detach() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let (results_tx, results_rx) = mpsc::channel();

        // Register from inside the runtime so the bridge captures it
        let bridge = {
            let _enter = rt.enter();
            let observer: Arc<dyn ChatObserver> = Arc::new(RuntimeProbe {
                results: results_tx,
            });
            let bridge = CallbackBridge::new(&observer);
            // Keep the observer alive for the duration of the test
            std::mem::forget(observer);
            bridge
        };

        // Notify from a bare thread: the callback must see a runtime,
        // and the thread must be detached again afterwards.
        let handle = std::thread::spawn(move || {
            bridge.notify_fragment("probe");
            Handle::try_current().is_ok()
        });

        assert!(results_rx.recv().unwrap(), "observer saw no runtime");
        assert!(
            !handle.join().unwrap(),
            "runtime context leaked past the notification"
        );
    }
}
