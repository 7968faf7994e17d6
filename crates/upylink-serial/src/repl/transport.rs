//! Serial port transport abstraction.
//!
//! Platform-agnostic byte-level read/write over a serial port.  The real
//! back-end is the `serialport` crate, wrapped so blocking I/O never runs
//! on the async executor.  An in-memory `SimulatedTransport` ships for
//! unit tests and offline use; both are injected via the
//! `SerialTransport` trait.

use crate::repl::port_scanner::{self, DeviceCandidate};
use crate::repl::types::LinkConfig;
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use upylink_core::ForwardSource;

/// Untyped transport-level failure.  Wrapped into the typed taxonomy at
/// the point it crosses into protocol logic.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct TransportError(String);

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<TransportError> for ForwardSource {
    fn from(err: TransportError) -> Self {
        ForwardSource::Untyped(err.0)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Transport trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Platform-agnostic serial port transport.
///
/// Implementations must be `Send + Sync` so they can be held behind an
/// `Arc` and used from multiple async tasks.
#[async_trait::async_trait]
pub trait SerialTransport: Send + Sync + std::fmt::Debug {
    /// Open the port.
    async fn open(&self) -> Result<(), TransportError>;

    /// Close the port.
    async fn close(&self) -> Result<(), TransportError>;

    /// Read up to `buf.len()` bytes into `buf`.  Returns the number of
    /// bytes read; `0` means no data arrived within the read window.
    async fn read(&self, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Write all bytes in `buf`.
    async fn write(&self, buf: &[u8]) -> Result<usize, TransportError>;

    /// Check whether the port is open.
    fn is_open(&self) -> bool;

    /// The device path this transport is bound to.
    fn path(&self) -> &str;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Simulated transport (for testing & offline use)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A fully in-memory transport useful for unit tests and scripted fakes.
#[derive(Debug)]
pub struct SimulatedTransport {
    name: String,
    open: AtomicBool,
    rx_buf: Mutex<VecDeque<u8>>,
    tx_buf: Mutex<VecDeque<u8>>,
    rx_notify: Notify,
    tx_notify: Notify,
}

impl SimulatedTransport {
    /// Create a new simulated transport for the given port path.
    pub fn new(path: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: path.into(),
            open: AtomicBool::new(false),
            rx_buf: Mutex::new(VecDeque::with_capacity(4096)),
            tx_buf: Mutex::new(VecDeque::with_capacity(4096)),
            rx_notify: Notify::new(),
            tx_notify: Notify::new(),
        })
    }

    /// Inject bytes into the receive buffer (simulate incoming data).
    pub async fn inject_rx(&self, data: &[u8]) {
        let mut buf = self.rx_buf.lock().await;
        buf.extend(data);
        self.rx_notify.notify_waiters();
    }

    /// Drain all bytes from the transmit buffer (for test assertions).
    pub async fn drain_tx(&self) -> Vec<u8> {
        let mut buf = self.tx_buf.lock().await;
        buf.drain(..).collect()
    }

    /// Peek at the transmit buffer contents without draining.
    pub async fn peek_tx(&self) -> Vec<u8> {
        let buf = self.tx_buf.lock().await;
        buf.iter().copied().collect()
    }

    /// Wait until the host writes something, then drain it.
    pub async fn next_tx(&self) -> Vec<u8> {
        loop {
            {
                let mut buf = self.tx_buf.lock().await;
                if !buf.is_empty() {
                    return buf.drain(..).collect();
                }
            }
            self.tx_notify.notified().await;
        }
    }
}

#[async_trait::async_trait]
impl SerialTransport for SimulatedTransport {
    async fn open(&self) -> Result<(), TransportError> {
        if self.open.load(Ordering::SeqCst) {
            return Err(TransportError::new(format!(
                "port {} already open",
                self.name
            )));
        }
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.open.store(false, Ordering::SeqCst);
        self.rx_notify.notify_waiters();
        Ok(())
    }

    async fn read(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(TransportError::new("port not open"));
        }
        let mut rx = self.rx_buf.lock().await;
        if rx.is_empty() {
            drop(rx);
            // Wait for data with a short timeout
            tokio::select! {
                _ = self.rx_notify.notified() => {},
                _ = tokio::time::sleep(tokio::time::Duration::from_millis(50)) => {},
            }
            rx = self.rx_buf.lock().await;
        }
        let count = buf.len().min(rx.len());
        for b in buf.iter_mut().take(count) {
            *b = rx.pop_front().unwrap();
        }
        Ok(count)
    }

    async fn write(&self, buf: &[u8]) -> Result<usize, TransportError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(TransportError::new("port not open"));
        }
        let mut tx = self.tx_buf.lock().await;
        tx.extend(buf);
        drop(tx);
        // notify_one stores a permit, so a consumer checking the buffer
        // right now cannot miss this write.
        self.tx_notify.notify_one();
        Ok(buf.len())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn path(&self) -> &str {
        &self.name
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  System transport (serialport back-end)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Transport backed by a real serial port.  All blocking port I/O runs
/// on the blocking thread pool.
#[derive(Debug)]
pub struct SystemTransport {
    path: String,
    baud_rate: u32,
    port: Arc<std::sync::Mutex<Option<Box<dyn serialport::SerialPort>>>>,
}

impl SystemTransport {
    pub fn new(path: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            path: path.into(),
            baud_rate,
            port: Arc::new(std::sync::Mutex::new(None)),
        }
    }
}

#[async_trait::async_trait]
impl SerialTransport for SystemTransport {
    async fn open(&self) -> Result<(), TransportError> {
        let path = self.path.clone();
        let baud_rate = self.baud_rate;
        let slot = self.port.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = slot
                .lock()
                .map_err(|_| TransportError::new("port state poisoned"))?;
            if guard.is_some() {
                return Ok(());
            }
            let port = serialport::new(&path, baud_rate)
                .timeout(std::time::Duration::from_millis(50))
                .open()
                .map_err(|e| TransportError::new(format!("open {path}: {e}")))?;
            *guard = Some(port);
            Ok(())
        })
        .await
        .map_err(|e| TransportError::new(format!("blocking task failed: {e}")))?
    }

    async fn close(&self) -> Result<(), TransportError> {
        let slot = self.port.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = slot
                .lock()
                .map_err(|_| TransportError::new("port state poisoned"))?;
            guard.take();
            Ok(())
        })
        .await
        .map_err(|e| TransportError::new(format!("blocking task failed: {e}")))?
    }

    async fn read(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let slot = self.port.clone();
        let capacity = buf.len();
        let data: Vec<u8> = tokio::task::spawn_blocking(move || {
            let mut guard = slot
                .lock()
                .map_err(|_| TransportError::new("port state poisoned"))?;
            let port = guard
                .as_mut()
                .ok_or_else(|| TransportError::new("port not open"))?;
            let mut tmp = vec![0u8; capacity];
            match port.read(&mut tmp) {
                Ok(n) => {
                    tmp.truncate(n);
                    Ok(tmp)
                }
                Err(err) if err.kind() == std::io::ErrorKind::TimedOut => Ok(Vec::new()),
                Err(err) => Err(TransportError::new(format!("read: {err}"))),
            }
        })
        .await
        .map_err(|e| TransportError::new(format!("blocking task failed: {e}")))??;
        buf[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }

    async fn write(&self, buf: &[u8]) -> Result<usize, TransportError> {
        let slot = self.port.clone();
        let data = buf.to_vec();
        tokio::task::spawn_blocking(move || {
            let mut guard = slot
                .lock()
                .map_err(|_| TransportError::new("port state poisoned"))?;
            let port = guard
                .as_mut()
                .ok_or_else(|| TransportError::new("port not open"))?;
            port.write_all(&data)
                .map_err(|e| TransportError::new(format!("write: {e}")))?;
            let _ = port.flush();
            Ok(data.len())
        })
        .await
        .map_err(|e| TransportError::new(format!("blocking task failed: {e}")))?
    }

    fn is_open(&self) -> bool {
        self.port
            .lock()
            .map(|guard| guard.is_some())
            .unwrap_or(false)
    }

    fn path(&self) -> &str {
        &self.path
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Transport factory
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Discovers device candidates and creates transports for them.  The
/// connection manager owns one of these; tests inject a simulated one.
#[async_trait::async_trait]
pub trait TransportFactory: Send + Sync {
    /// Enumerate attached serial devices.
    async fn enumerate(&self) -> Result<Vec<DeviceCandidate>, TransportError>;

    /// Create a transport bound to the given candidate.
    fn create(&self, candidate: &DeviceCandidate) -> Arc<dyn SerialTransport>;
}

/// Factory backed by the system serial port enumeration.
pub struct SystemFactory {
    config: LinkConfig,
}

impl SystemFactory {
    pub fn new(config: LinkConfig) -> Self {
        Self { config }
    }
}

#[async_trait::async_trait]
impl TransportFactory for SystemFactory {
    async fn enumerate(&self) -> Result<Vec<DeviceCandidate>, TransportError> {
        tokio::task::spawn_blocking(port_scanner::enumerate_system_ports)
            .await
            .map_err(|e| TransportError::new(format!("blocking task failed: {e}")))?
    }

    fn create(&self, candidate: &DeviceCandidate) -> Arc<dyn SerialTransport> {
        Arc::new(SystemTransport::new(&candidate.path, self.config.baud_rate))
    }
}

/// Factory over a fixed candidate list and a shared simulated transport.
pub struct SimulatedFactory {
    candidates: Vec<DeviceCandidate>,
    transport: Arc<SimulatedTransport>,
}

impl SimulatedFactory {
    /// Factory reporting exactly one matching device.
    pub fn single(transport: Arc<SimulatedTransport>) -> Self {
        let candidate = DeviceCandidate {
            path: transport.path().to_string(),
            vendor_id: Some(port_scanner::DEVICE_VENDOR_ID.to_string()),
            product_id: None,
            serial_number: None,
        };
        Self {
            candidates: vec![candidate],
            transport,
        }
    }

    /// Factory reporting an arbitrary candidate list.
    pub fn with_candidates(
        transport: Arc<SimulatedTransport>,
        candidates: Vec<DeviceCandidate>,
    ) -> Self {
        Self {
            candidates,
            transport,
        }
    }
}

#[async_trait::async_trait]
impl TransportFactory for SimulatedFactory {
    async fn enumerate(&self) -> Result<Vec<DeviceCandidate>, TransportError> {
        Ok(self.candidates.clone())
    }

    fn create(&self, _candidate: &DeviceCandidate) -> Arc<dyn SerialTransport> {
        self.transport.clone()
    }
}
