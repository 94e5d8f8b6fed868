//! Link configuration
//!
//! Everything needed to reach the meter, stored as JSON. Missing fields take
//! their defaults, so an empty object is a valid configuration.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;

use crate::protocol::{ConnectionManagerConfig, FrameFormat, ProtocolError};
use crate::transport::{FileSettings, PolledTransport, SerialSettings, Transport};

/// Which transport to use
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportConfig {
    /// A serial port
    Serial(SerialSettings),
    /// A pair of files standing in for a serial port
    File(FileSettings),
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig::Serial(SerialSettings::default())
    }
}

impl TransportConfig {
    /// Build the transport
    pub fn build(&self) -> Arc<dyn Transport> {
        match self {
            TransportConfig::Serial(settings) => Arc::new(PolledTransport::serial(settings.clone())),
            TransportConfig::File(settings) => Arc::new(PolledTransport::file(settings.clone())),
        }
    }
}

/// Control characters of the wire format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameConfig {
    /// Between the id and each argument
    pub field_separator: char,
    /// Ends a command
    pub command_terminator: char,
    /// Makes the next character literal
    pub escape: char,
}

impl Default for FrameConfig {
    fn default() -> Self {
        let format = FrameFormat::default();
        Self {
            field_separator: format.field_separator as char,
            command_terminator: format.command_terminator as char,
            escape: format.escape as char,
        }
    }
}

impl FrameConfig {
    /// Convert to a validated [`FrameFormat`]
    pub fn to_format(&self) -> Result<FrameFormat, ProtocolError> {
        let byte = |c: char| -> Result<u8, ProtocolError> {
            if c.is_ascii() {
                Ok(c as u8)
            } else {
                Err(ProtocolError::InvalidFormat(format!(
                    "control character {:?} is not ASCII",
                    c
                )))
            }
        };
        let format = FrameFormat {
            field_separator: byte(self.field_separator)?,
            command_terminator: byte(self.command_terminator)?,
            escape: byte(self.escape)?,
        };
        format.validate()?;
        Ok(format)
    }
}

/// Complete link configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Where bytes go
    pub transport: TransportConfig,
    /// Wire format characters
    pub frame: FrameConfig,
    /// Scanning, handshake and watchdog
    pub connection: ConnectionManagerConfig,
}

impl LinkConfig {
    /// Load from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let content = fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Save as pretty-printed JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(path, content)
    }
}
