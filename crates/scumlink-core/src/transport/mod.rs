//! Byte transports
//!
//! A [`Transport`] is a duplex byte channel to the device. The provided
//! implementation, [`PolledTransport`], runs a background poll loop that
//! fills a fixed-size receive buffer and tells its [`TransportListener`]
//! whenever new bytes arrived. The physical side is a [`Link`]: a serial
//! port ([`SerialLink`]) or a pair of files ([`FileLink`]) standing in for
//! one.

mod channel;
pub mod file;
mod polled;
pub mod serial;

use std::sync::Weak;

use crate::protocol::ProtocolError;

pub use channel::{CommunicationChannel, SerialChannel};
pub use file::{FileChannel, FileLink, FileSettings};
pub use polled::{Link, PolledTransport};
pub use serial::{list_ports, PortInfo, SerialLink, SerialSettings};

/// Capacity of the transport receive buffer
pub const RECEIVE_BUFFER_SIZE: usize = 4096;

/// Default cadence of the poll loop in milliseconds
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 10;

/// Receives transport notifications
///
/// Both callbacks run on the transport's poll thread (or, for
/// `on_disconnected`, on whichever thread disconnected the transport).
pub trait TransportListener: Send + Sync {
    /// New bytes are waiting in the receive buffer
    fn on_data_available(&self);

    /// The transport closed, explicitly or after an I/O failure
    fn on_disconnected(&self) {}
}

/// Duplex byte channel to the device
pub trait Transport: Send + Sync {
    /// Open the channel and start polling
    ///
    /// Fails with [`ProtocolError::AlreadyConnected`] if already open.
    fn connect(&self) -> Result<(), ProtocolError>;

    /// Close the channel; returns false if it was not open
    fn disconnect(&self) -> bool;

    /// Whether the channel is open
    fn is_connected(&self) -> bool;

    /// Write bytes; a no-op while disconnected
    fn write(&self, data: &[u8]);

    /// Take every buffered byte
    fn read(&self) -> Vec<u8>;

    /// Register the listener for data and disconnect notifications
    ///
    /// The transport only keeps a weak reference.
    fn set_listener(&self, listener: Option<Weak<dyn TransportListener>>);

    /// Candidate endpoints to scan; empty for a fixed endpoint
    fn endpoints(&self) -> Vec<String> {
        Vec::new()
    }

    /// Use `endpoint` for the next [`connect`](Transport::connect)
    fn select_endpoint(&self, _endpoint: &str) -> Result<(), ProtocolError> {
        Ok(())
    }

    /// Human readable name of the current endpoint
    fn endpoint(&self) -> String;
}
