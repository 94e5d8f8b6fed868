//! Protocol errors

use thiserror::Error;

/// Errors that can occur during protocol communication
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Serial port failure reported by the driver
    #[error("Serial port error: {0}")]
    SerialError(String),

    /// Operation needs an open transport
    #[error("Not connected to device")]
    NotConnected,

    /// Transport could not be opened
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// `connect` on an open transport
    #[error("Already connected")]
    AlreadyConnected,

    /// Endpoint selection while connected
    #[error("Endpoint cannot be changed while connected")]
    EndpointLocked,

    /// No such serial port
    #[error("Port not found: {0}")]
    PortNotFound(String),

    /// Frame body that does not decode to a command
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// Unterminated input grew past the frame limit
    #[error("Frame exceeds {0} bytes without a terminator")]
    FrameOverflow(usize),

    /// Unusable control characters
    #[error("Invalid frame format: {0}")]
    InvalidFormat(String),

    /// Fewer arguments than read
    #[error("Missing argument at position {0}")]
    MissingArgument(usize),

    /// Argument that does not parse or fails validation
    #[error("Invalid argument at position {position}: {value:?}")]
    InvalidArgument {
        /// Zero-based argument position
        position: usize,
        /// Offending text
        value: String,
    },

    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<serialport::Error> for ProtocolError {
    fn from(e: serialport::Error) -> Self {
        match e.kind() {
            serialport::ErrorKind::NoDevice => ProtocolError::PortNotFound(e.description),
            _ => ProtocolError::SerialError(e.to_string()),
        }
    }
}
