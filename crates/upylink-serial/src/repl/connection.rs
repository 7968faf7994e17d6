//! Serial connection management.
//!
//! Owns the single serial connection: lazy discovery and open, reuse of a
//! healthy handle, reopen of a closed one, and a reader task that splits
//! the incoming byte stream into lines for the output classifier.

use crate::repl::classifier::OutputClassifier;
use crate::repl::logging::{DataDirection, Transcript};
use crate::repl::port_scanner::{self, DeviceCandidate};
use crate::repl::transport::{SerialTransport, TransportError, TransportFactory};
use crate::repl::types::ConnectionState;
use bytes::BytesMut;
use std::sync::Arc;
use tokio::sync::Mutex;
use upylink_core::{LinkError, LinkResult};

struct Active {
    transport: Arc<dyn SerialTransport>,
    reader_attached: bool,
}

/// Manages the one serial connection to the device.
pub struct ConnectionManager {
    factory: Arc<dyn TransportFactory>,
    classifier: Arc<OutputClassifier>,
    transcript: Arc<Transcript>,
    active: Mutex<Option<Active>>,
    state: std::sync::Mutex<ConnectionState>,
}

impl ConnectionManager {
    pub fn new(factory: Arc<dyn TransportFactory>, classifier: Arc<OutputClassifier>) -> Self {
        Self {
            factory,
            classifier,
            transcript: Arc::new(Transcript::default()),
            active: Mutex::new(None),
            state: std::sync::Mutex::new(ConnectionState::Closed),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    /// The protocol transcript of this connection.
    pub fn transcript(&self) -> Arc<Transcript> {
        self.transcript.clone()
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap() = state;
    }

    /// Open the connection, creating it on first use.
    ///
    /// Idempotent: a healthy handle is reused, a closed one is reopened,
    /// and a handle that cannot be reopened is discarded so the next call
    /// performs fresh discovery.
    pub async fn open(&self) -> LinkResult<Arc<dyn SerialTransport>> {
        let mut active = self.active.lock().await;

        if let Some(existing) = active.as_ref() {
            if existing.transport.is_open() {
                return Ok(existing.transport.clone());
            }
            let transport = existing.transport.clone();
            return match transport.open().await {
                Ok(()) if transport.is_open() => {
                    self.set_state(ConnectionState::Open);
                    Ok(transport)
                }
                _ => {
                    let path = transport.path().to_string();
                    *active = None;
                    self.set_state(ConnectionState::Error);
                    Err(LinkError::ConnectionOpenFailed { detail: path })
                }
            };
        }

        self.set_state(ConnectionState::Opening);
        let chosen = match self.discover().await {
            Ok(chosen) => chosen,
            Err(err) => {
                self.set_state(ConnectionState::Error);
                return Err(err);
            }
        };
        let transport = self.factory.create(&chosen);
        if let Err(err) = transport.open().await {
            self.set_state(ConnectionState::Error);
            return Err(LinkError::ConnectionOpenFailed {
                detail: err.to_string(),
            });
        }
        log::debug!("opened serial device {}", transport.path());
        *active = Some(Active {
            transport: transport.clone(),
            reader_attached: false,
        });
        self.set_state(ConnectionState::Open);
        Ok(transport)
    }

    /// Enumerate attached serial devices and select the single one
    /// matching the reserved vendor id.
    pub async fn discover(&self) -> LinkResult<DeviceCandidate> {
        let candidates =
            self.factory
                .enumerate()
                .await
                .map_err(|err| LinkError::ConnectionOpenFailed {
                    detail: err.to_string(),
                })?;
        port_scanner::select_device(&candidates)
    }

    /// Open the connection and make sure the line reader is attached.
    pub async fn connect(&self) -> LinkResult<Arc<dyn SerialTransport>> {
        let transport = self.open().await?;
        let mut active = self.active.lock().await;
        if let Some(existing) = active.as_mut() {
            if !existing.reader_attached {
                self.spawn_reader(existing.transport.clone());
                existing.reader_attached = true;
            }
        }
        Ok(transport)
    }

    /// Write bytes to the device.
    ///
    /// On failure the handle is discarded; the caller layer decides
    /// whether to force a fresh `open()` on the next attempt.
    pub async fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        let mut active = self.active.lock().await;
        let Some(existing) = active.as_ref() else {
            return Err(TransportError::new("no open connection"));
        };
        match existing.transport.write(data).await {
            Ok(_) => {
                let text = String::from_utf8_lossy(data);
                self.transcript
                    .record(DataDirection::Tx, text.trim_end_matches('\r'));
                Ok(())
            }
            Err(err) => {
                *active = None;
                self.set_state(ConnectionState::Error);
                Err(err)
            }
        }
    }

    /// Close the connection.
    pub async fn close(&self) -> LinkResult<()> {
        let mut active = self.active.lock().await;
        let result = match active.take() {
            Some(existing) => existing.transport.close().await,
            None => Ok(()),
        };
        // Connected state resets even when the close itself failed, so a
        // dead handle can never be mistaken for a usable one.
        self.set_state(ConnectionState::Closed);
        result.map_err(|_| LinkError::ConnectionCloseFailed)
    }

    fn spawn_reader(&self, transport: Arc<dyn SerialTransport>) {
        let classifier = self.classifier.clone();
        let transcript = self.transcript.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            let mut acc = BytesMut::with_capacity(4096);
            loop {
                match transport.read(&mut buf).await {
                    Ok(0) => {
                        if !transport.is_open() {
                            break;
                        }
                    }
                    Ok(n) => {
                        acc.extend_from_slice(&buf[..n]);
                        while let Some(line) = take_line(&mut acc) {
                            transcript.record(DataDirection::Rx, &line);
                            classifier.handle_line(&line);
                        }
                    }
                    Err(err) => {
                        log::debug!("line reader stopped: {err}");
                        break;
                    }
                }
            }
        });
    }
}

/// Split one `\r\n`-terminated line off the accumulator.
fn take_line(acc: &mut BytesMut) -> Option<String> {
    let pos = acc.windows(2).position(|w| w == b"\r\n")?;
    let line = acc.split_to(pos);
    let _ = acc.split_to(2);
    Some(String::from_utf8_lossy(&line).into_owned())
}
