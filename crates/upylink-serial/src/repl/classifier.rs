//! Streaming output classifier.
//!
//! Consumes decoded serial lines and decides what the user sees: an
//! ordered filter-rule table rewrites or suppresses interpreter noise, a
//! visibility state machine gates streaming around protocol phases, and a
//! single-slot pattern-wait lets the driver await expected replies.  An
//! observer predicate latches a flag used for in-band flow control during
//! file transfer.

use crate::repl::types::re;
use regex::Regex;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use upylink_core::StatusSink;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Filter rules
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// What a matching rule removes from the line.
#[derive(Debug, Clone)]
pub enum DeleteAction {
    /// Keep the line as matched.
    None,
    /// Strip the sub-pattern before emitting.
    Pattern(Regex),
    /// Drop the whole line.
    WholeLine,
}

/// One entry of the ordered filter table.  First match wins.
#[derive(Debug, Clone)]
pub struct FilterRule {
    pub search: Regex,
    pub delete: DeleteAction,
    /// New value of the sticky pass-through flag for unmatched lines.
    pub visible: bool,
    pub replace: Option<String>,
}

fn default_rules() -> Vec<FilterRule> {
    vec![
        FilterRule {
            search: re("^Traceback"),
            delete: DeleteAction::None,
            visible: true,
            replace: None,
        },
        FilterRule {
            search: re("[a-zA-Z]+Error:"),
            delete: DeleteAction::None,
            visible: false,
            replace: None,
        },
        FilterRule {
            search: re("^[a-zA-Z]+Interrupt:"),
            delete: DeleteAction::None,
            visible: false,
            replace: None,
        },
        FilterRule {
            search: re("^MPY: soft reboot"),
            delete: DeleteAction::None,
            visible: true,
            replace: Some(" > Program is running...".to_string()),
        },
        FilterRule {
            search: re("^MicroPython v"),
            delete: DeleteAction::None,
            visible: false,
            replace: Some(" > Program has been terminated.".to_string()),
        },
        FilterRule {
            search: re(r#"^Type "help\(\)" for more information\.$"#),
            delete: DeleteAction::WholeLine,
            visible: true,
            replace: None,
        },
        FilterRule {
            search: re("^>>>"),
            delete: DeleteAction::Pattern(re(">>> *")),
            visible: true,
            replace: None,
        },
    ]
}

/// Substrings recognised as device-side errors worth a user notice,
/// independent of the current visibility state.
struct ErrorNotice {
    search: Regex,
    message: String,
    is_error: bool,
}

fn default_notices() -> Vec<ErrorNotice> {
    vec![ErrorNotice {
        search: re(r"^OSError:[ \[a-zA-Z]*28"),
        message: "The error message 'OSError: 28' means that the device storage is full."
            .to_string(),
        is_error: true,
    }]
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Pattern waits
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Result of a single-shot pattern wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The first line matching the pattern, before the deadline.
    Matched(String),
    /// No match before the deadline; carries the caller's timeout label.
    TimedOut(String),
}

impl WaitOutcome {
    pub fn matched(&self) -> bool {
        matches!(self, Self::Matched(_))
    }
}

enum WaitSignal {
    Matched(String),
    Failed,
}

struct PendingWait {
    pattern: Regex,
    tx: oneshot::Sender<WaitSignal>,
    /// Identity of this wait, so a timed-out waiter only clears its own
    /// slot and never a newer wait that replaced it.
    seq: u64,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Visibility state machine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

enum Mode {
    /// Pass every line to the sink.
    Streaming,
    /// Pass nothing.
    Suppressed,
    /// Suppressed until a match, then streaming; the match is emitted.
    WaitForOnPattern { pattern: Regex },
    /// Streaming until a match, then suppressed.
    WaitForOffPattern { pattern: Regex },
    /// Suppressed while traffic keeps arriving; the deadline slides on
    /// every line, so it fires after a quiet window.
    SuppressUntilSilence { deadline: Instant, window: Duration },
    /// Suppressed until a match or the sliding deadline, whichever comes
    /// first.
    WaitForPatternOrDeadline {
        pattern: Regex,
        deadline: Instant,
        window: Duration,
        emit_on_trigger: bool,
    },
    /// Apply the filter-rule table.
    Filtering,
}

struct Inner {
    mode: Mode,
    rules: Vec<FilterRule>,
    notices: Vec<ErrorNotice>,
    /// Sticky pass-through flag set by the last matched filter rule.
    filter_enabled: bool,
    /// Gate in front of the visible sink.
    user_messages: bool,
    pending: Option<PendingWait>,
    wait_seq: u64,
    observe: Option<Box<dyn Fn(&str) -> bool + Send + Sync>>,
    observed_flag: bool,
    /// Echoed literal-write commands must not fail a pending wait even
    /// when their payload looks like a device error.
    echoed_write: Regex,
}

enum SinkAction {
    Line(String),
    Warn(String),
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Classifier
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Classifies raw serial lines and drives the visible status channel.
pub struct OutputClassifier {
    inner: Mutex<Inner>,
    sink: Arc<dyn StatusSink>,
}

impl OutputClassifier {
    pub fn new(sink: Arc<dyn StatusSink>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                mode: Mode::Streaming,
                rules: default_rules(),
                notices: default_notices(),
                filter_enabled: false,
                user_messages: true,
                pending: None,
                wait_seq: 0,
                observe: None,
                observed_flag: false,
                echoed_write: re(r#"^>>> f\(b".*"\)$"#),
            }),
            sink,
        }
    }

    /// The sink this classifier writes to.
    pub fn sink(&self) -> Arc<dyn StatusSink> {
        self.sink.clone()
    }

    /// Classify one decoded line.
    ///
    /// Resolves a pending pattern-wait on match, latches the observer
    /// flag, raises error notices, and forwards the line to the sink
    /// according to the current visibility mode.
    pub fn handle_line(&self, line: &str) {
        let mut actions: Vec<SinkAction> = Vec::new();
        {
            let mut guard = self.inner.lock().unwrap();
            let st = &mut *guard;

            if let Some(condition) = &st.observe {
                if condition(line) {
                    st.observed_flag = true;
                }
            }

            let echoed_write = st.echoed_write.is_match(line);
            let mut fail_wait = false;
            for notice in &st.notices {
                if notice.search.is_match(line) && notice.is_error {
                    if st.pending.is_some() && !echoed_write {
                        fail_wait = true;
                    }
                    if st.user_messages {
                        actions.push(SinkAction::Warn(notice.message.clone()));
                    }
                }
            }
            if fail_wait {
                if let Some(wait) = st.pending.take() {
                    let _ = wait.tx.send(WaitSignal::Failed);
                }
            }

            let resolves = st
                .pending
                .as_ref()
                .map(|wait| wait.pattern.is_match(line))
                .unwrap_or(false);
            if resolves {
                if let Some(wait) = st.pending.take() {
                    let _ = wait.tx.send(WaitSignal::Matched(line.to_string()));
                }
            }

            let now = Instant::now();
            let mut emit: Option<String> = None;
            let mut next_mode: Option<Mode> = None;
            match &mut st.mode {
                Mode::Streaming => emit = Some(line.to_string()),
                Mode::Suppressed => {}
                Mode::WaitForOnPattern { pattern } => {
                    if pattern.is_match(line) {
                        next_mode = Some(Mode::Streaming);
                        emit = Some(line.to_string());
                    }
                }
                Mode::WaitForOffPattern { pattern } => {
                    if pattern.is_match(line) {
                        next_mode = Some(Mode::Suppressed);
                    } else {
                        emit = Some(line.to_string());
                    }
                }
                Mode::SuppressUntilSilence { deadline, window } => {
                    if now >= *deadline {
                        next_mode = Some(Mode::Streaming);
                        emit = Some(line.to_string());
                    } else {
                        *deadline = now + *window;
                    }
                }
                Mode::WaitForPatternOrDeadline {
                    pattern,
                    deadline,
                    window,
                    emit_on_trigger,
                } => {
                    if now >= *deadline || pattern.is_match(line) {
                        if *emit_on_trigger {
                            emit = Some(line.to_string());
                        }
                        next_mode = Some(Mode::Streaming);
                    } else {
                        *deadline = now + *window;
                    }
                }
                Mode::Filtering => {
                    let mut matched = false;
                    for rule in &st.rules {
                        if rule.search.is_match(line) {
                            matched = true;
                            st.filter_enabled = rule.visible;
                            let mut output = line.to_string();
                            if let DeleteAction::Pattern(delete) = &rule.delete {
                                output = delete.replace(&output, "").into_owned();
                            }
                            if matches!(rule.delete, DeleteAction::WholeLine)
                                || output.is_empty()
                            {
                                break;
                            }
                            emit = Some(rule.replace.clone().unwrap_or(output));
                            break;
                        }
                    }
                    if !matched && st.filter_enabled {
                        emit = Some(line.to_string());
                    }
                }
            }
            if let Some(mode) = next_mode {
                st.mode = mode;
            }
            if let Some(text) = emit {
                if st.user_messages {
                    actions.push(SinkAction::Line(text));
                }
            }
        }

        for action in actions {
            match action {
                SinkAction::Line(text) => {
                    self.sink.append_line(&text);
                    self.sink.set_visible(true);
                }
                SinkAction::Warn(text) => self.sink.warn(&text),
            }
        }
    }

    // ── Visibility control ────────────────────────────────────────

    /// Stream everything (`true`) or nothing (`false`).
    pub fn set_streaming(&self, on: bool) {
        self.inner.lock().unwrap().mode = if on { Mode::Streaming } else { Mode::Suppressed };
    }

    /// Switch to the filter-rule table.
    pub fn enable_filtering(&self) {
        self.inner.lock().unwrap().mode = Mode::Filtering;
    }

    /// Clear the sticky pass-through flag of the filter table.
    pub fn disable_filter_subflag(&self) {
        self.inner.lock().unwrap().filter_enabled = false;
    }

    /// Suppress output until a line matches `pattern`.
    pub fn suppress_until_pattern(&self, pattern: Regex) {
        self.inner.lock().unwrap().mode = Mode::WaitForOnPattern { pattern };
    }

    /// Stream output until a line matches `pattern`.
    pub fn stream_until_pattern(&self, pattern: Regex) {
        self.inner.lock().unwrap().mode = Mode::WaitForOffPattern { pattern };
    }

    /// Suppress output until the line flow pauses for `window`.
    pub fn suppress_until_silence(&self, window: Duration) {
        self.inner.lock().unwrap().mode = Mode::SuppressUntilSilence {
            deadline: Instant::now() + window,
            window,
        };
    }

    /// Suppress output until `pattern` matches or the flow pauses for
    /// `window`, whichever comes first.
    pub fn suppress_until(&self, pattern: Regex, window: Duration, emit_on_trigger: bool) {
        self.inner.lock().unwrap().mode = Mode::WaitForPatternOrDeadline {
            pattern,
            deadline: Instant::now() + window,
            window,
            emit_on_trigger,
        };
    }

    // ── Pattern waits ─────────────────────────────────────────────

    /// Wait for the next line matching `pattern`.
    ///
    /// Resolves with the matching line, or with `label` once `timeout`
    /// elapses.  Only one wait may be outstanding; a later call replaces
    /// an unresolved earlier one, which then resolves with its label.
    pub async fn wait_for_pattern(
        &self,
        pattern: Regex,
        timeout: Duration,
        label: impl Into<String>,
    ) -> WaitOutcome {
        let label = label.into();
        let (tx, rx) = oneshot::channel();
        let seq;
        {
            let mut st = self.inner.lock().unwrap();
            st.wait_seq += 1;
            seq = st.wait_seq;
            if st.pending.replace(PendingWait { pattern, tx, seq }).is_some() {
                log::warn!("pattern wait replaced while still outstanding");
            }
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(WaitSignal::Matched(line))) => WaitOutcome::Matched(line),
            Ok(Ok(WaitSignal::Failed)) | Ok(Err(_)) => WaitOutcome::TimedOut(label),
            Err(_) => {
                let mut st = self.inner.lock().unwrap();
                if st.pending.as_ref().map(|wait| wait.seq) == Some(seq) {
                    st.pending = None;
                }
                WaitOutcome::TimedOut(label)
            }
        }
    }

    // ── Observer flag ─────────────────────────────────────────────

    /// Evaluate `condition` on every subsequent line; the first `true`
    /// latches the observed flag.
    pub fn observe_condition(
        &self,
        condition: impl Fn(&str) -> bool + Send + Sync + 'static,
    ) {
        let mut st = self.inner.lock().unwrap();
        st.observe = Some(Box::new(condition));
        st.observed_flag = false;
    }

    /// Consume the observed flag.  Returns `true` at most once per latch.
    pub fn consume_observed_flag(&self) -> bool {
        let mut st = self.inner.lock().unwrap();
        if st.observed_flag {
            st.observed_flag = false;
            true
        } else {
            false
        }
    }

    // ── User messages ─────────────────────────────────────────────

    /// Gate device output in front of the visible sink.
    pub fn set_user_messages(&self, on: bool) {
        self.inner.lock().unwrap().user_messages = on;
    }

    /// Show a host-side status message, bypassing the gate.
    pub fn message(&self, text: &str) {
        self.sink.append_line(&format!(" > {text}"));
        self.sink.set_visible(true);
    }

    /// Show an error message, bypassing the gate.
    pub fn report_error(&self, text: &str) {
        self.sink.error(text);
    }

    pub fn clear(&self) {
        self.sink.clear();
    }

    pub fn set_visible(&self, visible: bool) {
        self.sink.set_visible(visible);
    }
}
