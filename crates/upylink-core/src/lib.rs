//! # upylink – core
//!
//! Infrastructure shared by the upylink crates:
//!
//! - **Error taxonomy** – typed link errors with stable numeric codes and
//!   per-kind remedy messages for end users
//! - **Status sinks** – narrow traits decoupling the protocol core from
//!   whatever surface displays device output and progress state

pub mod error;
pub mod status;

pub use error::{forward, ForwardSource, LinkError, LinkResult};
pub use status::{BufferSink, LogSink, ProgressListener, ProgressUpdate, StatusSink};
