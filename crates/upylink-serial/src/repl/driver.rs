//! Raw-REPL protocol driver.
//!
//! Sequences command lists against the interpreter: optional raw-mode
//! entry (interrupt burst plus entry handshake), per-command completion
//! strategies (settle delay or pattern wait), mid-stream overflow abort,
//! and confirmed raw-mode exit.  All failures funnel through the typed
//! error forwarding helper.

use crate::repl::classifier::{OutputClassifier, WaitOutcome};
use crate::repl::connection::ConnectionManager;
use crate::repl::transport::TransportError;
use crate::repl::types::{control, re, Command, Completion, LinkConfig, EXIT_BANNER_PATTERN};
use std::sync::Arc;
use upylink_core::{forward, LinkError, LinkResult};

/// Drives the raw-REPL dialect over the managed connection.
pub struct ReplDriver {
    conn: Arc<ConnectionManager>,
    classifier: Arc<OutputClassifier>,
    config: LinkConfig,
}

impl ReplDriver {
    pub fn new(
        conn: Arc<ConnectionManager>,
        classifier: Arc<OutputClassifier>,
        config: LinkConfig,
    ) -> Self {
        Self {
            conn,
            classifier,
            config,
        }
    }

    /// Execute a command list on the interpreter.
    ///
    /// Sends an interrupt, optionally enters raw mode, then writes each
    /// command followed by a carriage return and awaits its completion
    /// strategy.  A latched overflow flag aborts the remaining sequence
    /// with `MemoryOverflow`.  With `end_with_enter` the sequence ends on
    /// the execute byte and filtered streaming is re-enabled; raw mode is
    /// always exited explicitly and confirmed via the interpreter banner.
    pub async fn execute(
        &self,
        commands: Vec<Command>,
        end_with_enter: bool,
        enter_raw: bool,
        completion_message: Option<String>,
    ) -> LinkResult<()> {
        self.run(commands, end_with_enter, enter_raw, completion_message)
            .await
            .map_err(|err| forward(err, |detail| LinkError::CommandExecutionFailed { detail }))
    }

    async fn run(
        &self,
        commands: Vec<Command>,
        end_with_enter: bool,
        enter_raw: bool,
        completion_message: Option<String>,
    ) -> LinkResult<()> {
        self.conn.connect().await?;
        self.write_logged(&[control::INTERRUPT]).await;
        if enter_raw {
            self.enter_raw_mode().await?;
        }

        let mut overflow = false;
        for command in &commands {
            if self.classifier.consume_observed_flag() {
                overflow = true;
                break;
            }
            self.write_logged(format!("{}\r", command.text).as_bytes())
                .await;
            match &command.completion {
                Completion::Settle(delay) => tokio::time::sleep(*delay).await,
                Completion::Pattern {
                    pattern,
                    timeout,
                    label,
                } => {
                    let outcome = self
                        .classifier
                        .wait_for_pattern(pattern.clone(), *timeout, label.clone())
                        .await;
                    if let WaitOutcome::TimedOut(label) = outcome {
                        return Err(LinkError::CommandExecutionFailed {
                            detail: format!(
                                "no reply matching `{pattern}` for `{}` ({label})",
                                command.text
                            ),
                        });
                    }
                }
            }
        }
        if overflow {
            return Err(LinkError::MemoryOverflow);
        }

        if let Some(message) = completion_message {
            self.classifier.message(&message);
        }
        if end_with_enter {
            self.classifier.set_user_messages(true);
        }
        if end_with_enter || enter_raw {
            self.write_logged(&[control::EXECUTE]).await;
            if end_with_enter {
                self.classifier.enable_filtering();
                self.classifier.disable_filter_subflag();
            }
            tokio::time::sleep(self.config.settle_delay()).await;
        }
        if enter_raw {
            self.write_logged(&[control::RAW_EXIT]).await;
            let outcome = self
                .classifier
                .wait_for_pattern(
                    re(EXIT_BANNER_PATTERN),
                    self.config.banner_timeout(),
                    "timeout",
                )
                .await;
            if !outcome.matched() {
                return Err(LinkError::CommandExecutionFailed {
                    detail: "interpreter banner did not confirm raw mode exit".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Enter raw REPL mode.
    async fn enter_raw_mode(&self) -> LinkResult<()> {
        self.raw_handshake()
            .await
            .map_err(|err| forward(err, |detail| LinkError::RawModeEntryFailed { detail }))
    }

    async fn raw_handshake(&self) -> Result<(), TransportError> {
        // Three interrupts with short pauses break out of any running loop.
        for _ in 0..3 {
            self.conn.write(&[control::INTERRUPT]).await?;
            tokio::time::sleep(self.config.raw_pause()).await;
        }
        self.conn.write(&[b'\r', control::RAW_ENTER]).await?;
        tokio::time::sleep(self.config.raw_pause()).await;
        self.conn.write(&[control::EXECUTE]).await?;
        tokio::time::sleep(self.config.raw_pause()).await;
        Ok(())
    }

    /// Transient write errors do not abort the in-flight command; the
    /// expected response will time out on its own if the write was lost.
    async fn write_logged(&self, data: &[u8]) {
        if let Err(err) = self.conn.write(data).await {
            log::warn!("serial write failed: {err}");
        }
    }
}
