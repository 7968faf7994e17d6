//! Shared types for the REPL link crate.
//!
//! Covers the wire-level control bytes, link configuration, command and
//! completion-strategy types, connection state, and upload requests.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Wire-level constants
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Control bytes of the REPL dialect.
pub mod control {
    /// Enter raw REPL (Ctrl-A).
    pub const RAW_ENTER: u8 = 0x01;
    /// Exit raw REPL / soft-reboot variant (Ctrl-B).
    pub const RAW_EXIT: u8 = 0x02;
    /// Interrupt a running program (Ctrl-C).
    pub const INTERRUPT: u8 = 0x03;
    /// Execute buffered raw-mode input (Ctrl-D).
    pub const EXECUTE: u8 = 0x04;
}

/// Banner substring the interpreter prints on raw-mode entry.  Not
/// actively matched; documents the expected device response.
pub const RAW_MODE_BANNER: &str = "raw REPL; CTRL-B to exit";

/// Pattern confirming the interpreter left raw mode (start of the
/// standard help banner).
pub const EXIT_BANNER_PATTERN: &str = "^Type";

/// Compile a pattern that is known to be valid at build time.
pub(crate) fn re(pattern: &str) -> Regex {
    Regex::new(pattern).expect("static pattern")
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Link configuration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Configuration of the device link.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkConfig {
    /// Serial baud rate.  The device family runs at a fixed 115200.
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Settle delay after a bare command, in milliseconds.
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,

    /// Pause between the bytes of the raw-mode handshake, in milliseconds.
    #[serde(default = "default_raw_pause_ms")]
    pub raw_pause_ms: u64,

    /// Maximum characters of escaped payload per literal-write command.
    #[serde(default = "default_write_window")]
    pub write_window: usize,

    /// A free-memory probe is sent after every n-th literal write.
    #[serde(default = "default_probe_interval")]
    pub probe_interval: usize,

    /// Free-memory low-water mark; transfers abort below this.
    #[serde(default = "default_memory_low_water")]
    pub memory_low_water: u32,

    /// Deadline for a transfer reply pattern, in milliseconds.
    #[serde(default = "default_reply_timeout_ms")]
    pub reply_timeout_ms: u64,

    /// Deadline for the raw-mode exit banner, in milliseconds.
    #[serde(default = "default_banner_timeout_ms")]
    pub banner_timeout_ms: u64,
}

fn default_baud_rate() -> u32 {
    115_200
}
fn default_settle_delay_ms() -> u64 {
    10
}
fn default_raw_pause_ms() -> u64 {
    10
}
fn default_write_window() -> usize {
    54
}
fn default_probe_interval() -> usize {
    10
}
fn default_memory_low_water() -> u32 {
    5000
}
fn default_reply_timeout_ms() -> u64 {
    5000
}
fn default_banner_timeout_ms() -> u64 {
    1000
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            baud_rate: default_baud_rate(),
            settle_delay_ms: default_settle_delay_ms(),
            raw_pause_ms: default_raw_pause_ms(),
            write_window: default_write_window(),
            probe_interval: default_probe_interval(),
            memory_low_water: default_memory_low_water(),
            reply_timeout_ms: default_reply_timeout_ms(),
            banner_timeout_ms: default_banner_timeout_ms(),
        }
    }
}

impl LinkConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn raw_pause(&self) -> Duration {
        Duration::from_millis(self.raw_pause_ms)
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    pub fn banner_timeout(&self) -> Duration {
        Duration::from_millis(self.banner_timeout_ms)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Commands
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// How the driver decides a command has completed.
#[derive(Debug, Clone)]
pub enum Completion {
    /// Wait a fixed settle delay after sending.
    Settle(Duration),
    /// Wait until a line matching `pattern` arrives, or until `timeout`
    /// elapses.  On timeout the wait resolves with `label`.
    Pattern {
        pattern: Regex,
        timeout: Duration,
        label: String,
    },
}

/// One line of text sent to the interpreter, paired with its completion
/// strategy.
#[derive(Debug, Clone)]
pub struct Command {
    pub text: String,
    pub completion: Completion,
}

impl Command {
    /// A bare command with the default short settle delay.
    pub fn bare(text: impl Into<String>) -> Self {
        Self::settle(text, Duration::from_millis(default_settle_delay_ms()))
    }

    /// A command with an explicit settle delay.
    pub fn settle(text: impl Into<String>, delay: Duration) -> Self {
        Self {
            text: text.into(),
            completion: Completion::Settle(delay),
        }
    }

    /// A command confirmed by a reply pattern.
    pub fn expect(
        text: impl Into<String>,
        pattern: Regex,
        timeout: Duration,
        label: impl Into<String>,
    ) -> Self {
        Self {
            text: text.into(),
            completion: Completion::Pattern {
                pattern,
                timeout,
                label: label.into(),
            },
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Connection state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Lifecycle state of the single serial connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    Closed,
    Opening,
    Open,
    Error,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Control keys and uploads
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Raw control keys the user can send interactively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKey {
    A,
    B,
    C,
    D,
    E,
}

impl ControlKey {
    /// The control byte sent for this key.  E duplicates the execute byte;
    /// the dialect defines no fifth control byte.
    pub fn byte(&self) -> u8 {
        match self {
            Self::A => control::RAW_ENTER,
            Self::B => control::RAW_EXIT,
            Self::C => control::INTERRUPT,
            Self::D => control::EXECUTE,
            Self::E => control::EXECUTE,
        }
    }
}

/// Target name used for entry-point uploads.
pub const ENTRY_POINT_TARGET: &str = "main.py";

/// Role of an uploaded file, declared by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileRole {
    /// The program the device runs on boot; uploaded as `main.py` and
    /// followed by a soft reboot.
    EntryPoint,
    /// A library module; uploaded under its own name.
    Module,
}

/// A file upload requested by the embedding application.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    /// Display name of the source file.
    pub file_name: String,
    /// Raw file contents.
    pub bytes: Vec<u8>,
    /// Declared role; decides target name and soft-reboot behaviour.
    pub role: FileRole,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_bytes() {
        assert_eq!(control::RAW_ENTER, 0x01);
        assert_eq!(control::RAW_EXIT, 0x02);
        assert_eq!(control::INTERRUPT, 0x03);
        assert_eq!(control::EXECUTE, 0x04);
    }

    #[test]
    fn test_control_key_bytes() {
        assert_eq!(ControlKey::A.byte(), 0x01);
        assert_eq!(ControlKey::B.byte(), 0x02);
        assert_eq!(ControlKey::C.byte(), 0x03);
        assert_eq!(ControlKey::D.byte(), 0x04);
        assert_eq!(ControlKey::E.byte(), 0x04);
    }

    #[test]
    fn test_link_config_defaults() {
        let config = LinkConfig::default();
        assert_eq!(config.baud_rate, 115_200);
        assert_eq!(config.write_window, 54);
        assert_eq!(config.probe_interval, 10);
        assert_eq!(config.memory_low_water, 5000);
        assert_eq!(config.reply_timeout(), Duration::from_secs(5));
        assert_eq!(config.banner_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn test_link_config_deserialises_partial() {
        let config: LinkConfig = serde_json::from_str(r#"{"writeWindow": 32}"#).unwrap();
        assert_eq!(config.write_window, 32);
        assert_eq!(config.baud_rate, 115_200);
    }

    #[test]
    fn test_bare_command_uses_settle() {
        let cmd = Command::bare("import gc");
        assert_eq!(cmd.text, "import gc");
        assert!(matches!(cmd.completion, Completion::Settle(d) if d == Duration::from_millis(10)));
    }

    #[test]
    fn test_expect_command_carries_pattern() {
        let cmd = Command::expect("fd.close()", re(r"^>>> fd\.close\(\)$"), Duration::from_secs(5), "timeOut");
        match cmd.completion {
            Completion::Pattern { pattern, label, .. } => {
                assert!(pattern.is_match(">>> fd.close()"));
                assert_eq!(label, "timeOut");
            }
            Completion::Settle(_) => panic!("expected pattern completion"),
        }
    }
}
