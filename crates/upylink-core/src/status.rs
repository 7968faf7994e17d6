//! Status and progress sinks.
//!
//! The protocol core never talks to a UI directly.  Device output, user
//! notices, and progress state go through these traits; the embedding
//! application provides the implementations.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Status sink
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A text channel visible to the user.
///
/// Implementations must be `Send + Sync` so they can be held behind an
/// `Arc` and used from multiple async tasks.
pub trait StatusSink: Send + Sync {
    /// Append a line of device or status output.
    fn append_line(&self, line: &str);

    /// Show a non-fatal notice to the user.
    fn warn(&self, message: &str);

    /// Show an error message to the user.
    fn error(&self, message: &str);

    /// Discard everything shown so far.
    fn clear(&self);

    /// Reveal or hide the channel.
    fn set_visible(&self, visible: bool);
}

/// In-memory sink for tests and headless embedding.
#[derive(Default)]
pub struct BufferSink {
    lines: Mutex<Vec<String>>,
    warnings: Mutex<Vec<String>>,
    errors: Mutex<Vec<String>>,
    visible: AtomicBool,
}

impl BufferSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all appended lines.
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }

    /// Snapshot of all warnings.
    pub fn warnings(&self) -> Vec<String> {
        self.warnings.lock().unwrap().clone()
    }

    /// Snapshot of all errors.
    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().unwrap().clone()
    }

    pub fn is_visible(&self) -> bool {
        self.visible.load(Ordering::SeqCst)
    }
}

impl StatusSink for BufferSink {
    fn append_line(&self, line: &str) {
        self.lines.lock().unwrap().push(line.to_string());
    }

    fn warn(&self, message: &str) {
        self.warnings.lock().unwrap().push(message.to_string());
    }

    fn error(&self, message: &str) {
        self.errors.lock().unwrap().push(message.to_string());
    }

    fn clear(&self) {
        self.lines.lock().unwrap().clear();
    }

    fn set_visible(&self, visible: bool) {
        self.visible.store(visible, Ordering::SeqCst);
    }
}

/// Sink that routes everything to the `log` facade.  Default for
/// embeddings without a visible output channel.
#[derive(Default)]
pub struct LogSink;

impl StatusSink for LogSink {
    fn append_line(&self, line: &str) {
        log::info!("{line}");
    }

    fn warn(&self, message: &str) {
        log::warn!("{message}");
    }

    fn error(&self, message: &str) {
        log::error!("{message}");
    }

    fn clear(&self) {}

    fn set_visible(&self, _visible: bool) {}
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Progress notification
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Progress state change for a named activity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    /// Identifier of the activity (e.g. `"upload"`, `"prep"`).
    pub source_id: String,
    /// Whether a progress animation should be running.
    pub animating: bool,
}

/// Listener notified when a long-running operation starts or ends.
pub trait ProgressListener: Send + Sync {
    fn refresh(&self, update: &ProgressUpdate);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_sink_records_lines() {
        let sink = BufferSink::new();
        sink.append_line("one");
        sink.append_line("two");
        assert_eq!(sink.lines(), vec!["one", "two"]);
    }

    #[test]
    fn test_buffer_sink_clear() {
        let sink = BufferSink::new();
        sink.append_line("one");
        sink.clear();
        assert!(sink.lines().is_empty());
    }

    #[test]
    fn test_buffer_sink_warnings_and_errors_survive_clear() {
        let sink = BufferSink::new();
        sink.warn("low memory");
        sink.error("it broke");
        sink.clear();
        assert_eq!(sink.warnings(), vec!["low memory"]);
        assert_eq!(sink.errors(), vec!["it broke"]);
    }

    #[test]
    fn test_buffer_sink_visibility() {
        let sink = BufferSink::new();
        assert!(!sink.is_visible());
        sink.set_visible(true);
        assert!(sink.is_visible());
    }

    #[test]
    fn test_progress_update_serialises_camel_case() {
        let update = ProgressUpdate {
            source_id: "upload".into(),
            animating: true,
        };
        let json = serde_json::to_string(&update).unwrap();
        assert!(json.contains("\"sourceId\""));
        assert!(json.contains("\"animating\":true"));
    }
}
