//! REPL link: sub-modules.

pub mod classifier;
pub mod connection;
pub mod controller;
pub mod driver;
pub mod logging;
pub mod port_scanner;
pub mod transfer;
pub mod transport;
pub mod types;
