//! Protocol transcript capture.
//!
//! Records the line traffic of a session (host to device and back) with
//! timestamps, for protocol debugging.  Kept in a bounded in-memory ring;
//! the embedding application decides whether and where to persist it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;

/// Data direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataDirection {
    Tx,
    Rx,
}

impl DataDirection {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Tx => "TX",
            Self::Rx => "RX",
        }
    }

    pub fn arrow(&self) -> &'static str {
        match self {
            Self::Tx => ">>>",
            Self::Rx => "<<<",
        }
    }
}

/// A single transcript entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptEntry {
    pub timestamp: DateTime<Utc>,
    pub direction: DataDirection,
    pub text: String,
}

impl TranscriptEntry {
    pub fn new(direction: DataDirection, text: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            direction,
            text: text.into(),
        }
    }
}

/// Format an entry as a plain marked line.
pub fn format_plain(entry: &TranscriptEntry) -> String {
    format!("{} {}", entry.direction.arrow(), entry.text)
}

/// Format an entry as a timestamped line.
pub fn format_timestamped(entry: &TranscriptEntry) -> String {
    let ts = entry.timestamp.format("%Y-%m-%d %H:%M:%S%.3f");
    format!("[{}] {} {}", ts, entry.direction.label(), entry.text)
}

/// Bounded in-memory transcript of one session.
pub struct Transcript {
    entries: Mutex<VecDeque<TranscriptEntry>>,
    capacity: usize,
}

impl Transcript {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
        }
    }

    /// Record one line of traffic, evicting the oldest entry when full.
    pub fn record(&self, direction: DataDirection, text: &str) {
        let mut entries = self.entries.lock().unwrap();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(TranscriptEntry::new(direction, text));
    }

    /// Snapshot of the recorded entries, oldest first.
    pub fn snapshot(&self) -> Vec<TranscriptEntry> {
        self.entries.lock().unwrap().iter().cloned().collect()
    }

    /// Render the whole transcript with timestamps.
    pub fn render(&self) -> String {
        self.snapshot()
            .iter()
            .map(format_timestamped)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl Default for Transcript {
    fn default() -> Self {
        Self::new(1000)
    }
}
