//! Stream sink
//!
//! The write-sink a generation task hands to the engine. Every
//! non-empty fragment is forwarded to the bridge synchronously, one
//! notification per fragment, and accumulated for the terminal
//! notification. No buffering happens across calls; forwarding runs on
//! whatever thread the engine is generating on.

use crate::inference::FragmentSink;
use crate::session::bridge::CallbackBridge;

/// Forwards fragments to the observer bridge and accumulates the full
/// text for the terminal notification.
pub struct StreamSink {
    bridge: CallbackBridge,
    text: String,
}

impl StreamSink {
    pub fn new(bridge: CallbackBridge) -> Self {
        Self {
            bridge,
            text: String::new(),
        }
    }

    /// The text accumulated so far
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Consume the sink, yielding the accumulated text
    pub fn into_text(self) -> String {
        self.text
    }
}

impl FragmentSink for StreamSink {
    fn push(&mut self, fragment: &str) {
        if fragment.is_empty() {
            return;
        }
        self.bridge.notify_fragment(fragment);
        self.text.push_str(fragment);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::bridge::ChatObserver;
    use std::sync::{Arc, Mutex};

    struct RecordingObserver {
        fragments: Arc<Mutex<Vec<String>>>,
    }

    impl ChatObserver for RecordingObserver {
        fn on_fragment(&self, text: &str) {
            self.fragments.lock().unwrap().push(text.to_string());
        }

        fn on_finished(&self, _full_text: &str) {}
    }

    #[test]
    fn test_forwards_each_fragment_once() {
        let fragments = Arc::new(Mutex::new(Vec::new()));
        let observer: Arc<dyn ChatObserver> = Arc::new(RecordingObserver {
            fragments: fragments.clone(),
        });
        let mut sink = StreamSink::new(CallbackBridge::new(&observer));

        sink.push("Hel");
        sink.push("lo, ");
        sink.push("world");

        assert_eq!(*fragments.lock().unwrap(), vec!["Hel", "lo, ", "world"]);
        assert_eq!(sink.text(), "Hello, world");
        assert_eq!(sink.into_text(), "Hello, world");
    }

    #[test]
    fn test_empty_fragments_are_skipped() {
        let fragments = Arc::new(Mutex::new(Vec::new()));
        let observer: Arc<dyn ChatObserver> = Arc::new(RecordingObserver {
            fragments: fragments.clone(),
        });
        let mut sink = StreamSink::new(CallbackBridge::new(&observer));

        sink.push("");
        sink.push("x");
        sink.push("");

        assert_eq!(*fragments.lock().unwrap(), vec!["x"]);
        assert_eq!(sink.text(), "x");
    }

    #[test]
    fn test_accumulates_even_without_observer() {
        let observer: Arc<dyn ChatObserver> = Arc::new(RecordingObserver {
            fragments: Arc::new(Mutex::new(Vec::new())),
        });
        let bridge = CallbackBridge::new(&observer);
        drop(observer);

        let mut sink = StreamSink::new(bridge);
        sink.push("still ");
        sink.push("recorded");

        assert_eq!(sink.into_text(), "still recorded");
    }
}
