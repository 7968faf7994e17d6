//! # upylink – MicroPython REPL link over serial
//!
//! Device-communication crate for boards running a MicroPython-class
//! interactive interpreter over a byte-oriented serial transport:
//!
//! - **Device Discovery** – find the board by its USB vendor id
//! - **Transport** – abstracted read/write over a serial port, with an
//!   in-memory simulated transport for tests and offline use
//! - **Output Classification** – reclassify raw serial lines into
//!   user-visible output, suppressed noise, and protocol replies
//! - **REPL Driver** – raw-mode entry/exit, command sequencing with
//!   pattern-based acknowledgement waits and timeouts
//! - **File Transfer** – chunked literal-write upload with in-band
//!   free-memory flow control and CRC-32 verification
//! - **Session Control** – single-operation surface: upload, stop,
//!   soft-reboot, delete, eject

pub mod repl;

pub use repl::classifier::{OutputClassifier, WaitOutcome};
pub use repl::connection::ConnectionManager;
pub use repl::controller::{DriveEjector, FirmwareFlasher, Operation, OperationOutcome, SessionController};
pub use repl::driver::ReplDriver;
pub use repl::port_scanner::{DeviceCandidate, DEVICE_VENDOR_ID};
pub use repl::transfer::{crc32, FileTransferEngine};
pub use repl::transport::{
    SerialTransport, SimulatedFactory, SimulatedTransport, SystemFactory, TransportError,
    TransportFactory,
};
pub use repl::types::*;
