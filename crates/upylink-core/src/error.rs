//! Typed errors for the device link.
//!
//! Every failure that crosses out of the protocol layer is one of these
//! kinds.  Each kind carries a stable numeric code for diagnostics and maps
//! to a fixed remedy message; end users never see a raw error chain.

use thiserror::Error;

/// Result alias used throughout the workspace.
pub type LinkResult<T> = Result<T, LinkError>;

/// All errors surfaced by the device link.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LinkError {
    /// No attached device matched the reserved USB vendor id.
    #[error("no device was recognised")]
    NoDeviceFound,

    /// More than one matching device is attached.
    #[error("more than one device was detected")]
    AmbiguousDevice,

    /// The serial port could not be opened or re-opened.
    #[error("the serial port could not be opened: {detail}")]
    ConnectionOpenFailed { detail: String },

    /// The serial port could not be closed.
    #[error("the serial port could not be closed")]
    ConnectionCloseFailed,

    /// A command sent to the interpreter failed or its expected reply
    /// never arrived.
    #[error("command execution failed: {detail}")]
    CommandExecutionFailed { detail: String },

    /// The raw-REPL entry handshake failed.
    #[error("raw REPL entry failed: {detail}")]
    RawModeEntryFailed { detail: String },

    /// A file transfer could not be completed.
    #[error("file transfer failed: {detail}")]
    FileTransferFailed { detail: String },

    /// The device ran out of free memory mid-transfer.
    #[error("file was too large for the available memory")]
    MemoryOverflow,

    /// The host operating system is not supported for this operation.
    #[error("operating system is not supported")]
    UnsupportedPlatform,

    /// The interpreter probe got no answer.
    #[error("the device does not react to the interpreter probe")]
    DeviceUnresponsive,

    /// The device drive could not be ejected.
    #[error("ejecting the device drive failed: {detail}")]
    EjectFailed { detail: String },

    /// No workspace is open on the host side.
    #[error("no workspace is open")]
    NoWorkspaceOpen,
}

impl LinkError {
    /// Stable numeric code for diagnostics and logs.
    pub fn code(&self) -> u16 {
        match self {
            Self::ConnectionOpenFailed { .. } => 301,
            Self::AmbiguousDevice => 302,
            Self::NoDeviceFound => 303,
            Self::CommandExecutionFailed { .. } => 305,
            Self::RawModeEntryFailed { .. } => 307,
            Self::FileTransferFailed { .. } => 308,
            Self::ConnectionCloseFailed => 313,
            Self::MemoryOverflow => 314,
            Self::UnsupportedPlatform => 317,
            Self::DeviceUnresponsive => 320,
            Self::EjectFailed { .. } => 323,
            Self::NoWorkspaceOpen => 324,
        }
    }

    /// Fixed remedy message shown to the user for this error kind.
    pub fn remedy(&self) -> &'static str {
        match self {
            Self::NoDeviceFound => {
                "The device was not found. Check whether it is correctly \
                 connected to your computer with a USB cable."
            }
            Self::AmbiguousDevice => {
                "More than one device is connected to your computer. \
                 Remove one."
            }
            Self::ConnectionOpenFailed { .. } => {
                "No connection can be established with the device. Check \
                 that it is correctly connected with a USB cable."
            }
            Self::ConnectionCloseFailed => "The port could not be closed.",
            Self::CommandExecutionFailed { .. }
            | Self::RawModeEntryFailed { .. }
            | Self::FileTransferFailed { .. } => {
                "There is a problem uploading a Python file to the device. \
                 Try the following (one after the other):\n\
                 Check whether the device is correctly connected.\n\
                 Press the reset button on the device.\n\
                 Pull out the USB plug and connect again.\n\
                 Flash MicroPython to the device."
            }
            Self::MemoryOverflow => {
                "The file was too large for the available memory."
            }
            Self::UnsupportedPlatform => "Operating system is not supported.",
            Self::DeviceUnresponsive => {
                "The device does not react as desired. Try the following \
                 (one after the other):\n\
                 Press the reset button on the device.\n\
                 Pull out the USB plug and connect again.\n\
                 Flash MicroPython to the device."
            }
            Self::EjectFailed { .. } => {
                "An error occurred when ejecting the device."
            }
            Self::NoWorkspaceOpen => "No workspace is open.",
        }
    }
}

/// Source for [`forward`]: either an already-typed link error or an
/// untyped message from a lower layer.
pub enum ForwardSource {
    Typed(LinkError),
    Untyped(String),
}

impl From<LinkError> for ForwardSource {
    fn from(err: LinkError) -> Self {
        Self::Typed(err)
    }
}

impl From<String> for ForwardSource {
    fn from(message: String) -> Self {
        Self::Untyped(message)
    }
}

impl From<&str> for ForwardSource {
    fn from(message: &str) -> Self {
        Self::Untyped(message.to_string())
    }
}

/// Funnel an error across the protocol boundary.
///
/// An already-typed [`LinkError`] passes through unchanged; anything
/// untyped is wrapped with the caller-supplied constructor.
pub fn forward(
    err: impl Into<ForwardSource>,
    wrap: impl FnOnce(String) -> LinkError,
) -> LinkError {
    match err.into() {
        ForwardSource::Typed(err) => err,
        ForwardSource::Untyped(message) => wrap(message),
    }
}
