//! Serial port handling
//!
//! Port discovery, port setup and the [`SerialLink`] the polled transport
//! opens when talking to real hardware.

use serde::{Deserialize, Serialize};
use serialport::{SerialPort, SerialPortInfo, SerialPortType};
use std::collections::HashMap;
#[cfg(target_os = "linux")]
use std::fs;
use std::sync::RwLock;
use std::time::Duration;
use tracing::{debug, warn};

use super::{CommunicationChannel, Link, SerialChannel};
use crate::protocol::{ProtocolError, DEFAULT_BAUD_RATE};

/// Information about an available serial port
#[derive(Debug, Clone)]
pub struct PortInfo {
    /// Port name (e.g., "/dev/ttyUSB0" or "COM3")
    pub name: String,

    /// USB vendor ID (if USB device)
    pub vid: Option<u16>,

    /// USB product ID (if USB device)
    pub pid: Option<u16>,

    /// Manufacturer name (if available)
    pub manufacturer: Option<String>,

    /// Product name (if available)
    pub product: Option<String>,
}

impl PortInfo {
    fn named(name: String) -> Self {
        Self {
            name,
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
        }
    }
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        match info.port_type {
            SerialPortType::UsbPort(usb_info) => Self {
                name: info.port_name,
                vid: Some(usb_info.vid),
                pid: Some(usb_info.pid),
                manufacturer: usb_info.manufacturer,
                product: usb_info.product,
            },
            _ => Self::named(info.port_name),
        }
    }
}

/// Sort key so that ttyACM* ports come first, then ttyUSB*, then the rest,
/// numeric suffixes compared as numbers
fn port_sort_key(name: &str) -> (u8, usize, String) {
    let basename = name.rsplit('/').next().unwrap_or(name);
    if let Some(rest) = basename.strip_prefix("ttyACM") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (0, num, basename.to_string());
    }
    if let Some(rest) = basename.strip_prefix("ttyUSB") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (1, num, basename.to_string());
    }
    if let Some(rest) = basename.strip_prefix("COM") {
        if let Ok(num) = rest.parse::<usize>() {
            return (2, num, basename.to_string());
        }
    }
    (3, 0, basename.to_string())
}

/// List all available serial ports, with /dev fallbacks and deterministic ordering
pub fn list_ports() -> Vec<PortInfo> {
    let mut map: HashMap<String, PortInfo> = HashMap::new();
    for info in serialport::available_ports().unwrap_or_default() {
        let p = PortInfo::from(info);
        map.entry(p.name.clone()).or_insert(p);
    }

    // Linux-only: pick up ACM/USB nodes the enumeration API missed
    #[cfg(target_os = "linux")]
    if let Ok(entries) = fs::read_dir("/dev") {
        for entry in entries.flatten() {
            if let Some(fname) = entry.file_name().to_str() {
                if fname.starts_with("ttyACM") || fname.starts_with("ttyUSB") {
                    let full = format!("/dev/{}", fname);
                    map.entry(full.clone())
                        .or_insert_with(|| PortInfo::named(full));
                }
            }
        }
    }

    let mut v: Vec<PortInfo> = map.into_values().collect();
    v.sort_by_key(|p| port_sort_key(&p.name));
    v
}

/// Serial line settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    /// Port to open; empty means "scan for it"
    pub port_name: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Assert DTR after opening (some boards reset while DTR toggles)
    pub dtr_enable: bool,
    /// Read timeout, which also paces the poll loop
    pub read_timeout_ms: u64,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            dtr_enable: false,
            read_timeout_ms: 100,
        }
    }
}

/// Open a serial port with the given settings
pub fn open_port(settings: &SerialSettings) -> Result<Box<dyn SerialPort>, ProtocolError> {
    let baud = if settings.baud_rate == 0 {
        warn!("open_port: baud_rate is 0, defaulting to {}", DEFAULT_BAUD_RATE);
        DEFAULT_BAUD_RATE
    } else {
        settings.baud_rate
    };

    serialport::new(&settings.port_name, baud)
        .timeout(Duration::from_millis(settings.read_timeout_ms))
        .open()
        .map_err(ProtocolError::from)
}

/// Configure a serial port for 8N1 without flow control
pub fn configure_port(port: &mut dyn SerialPort, dtr_enable: bool) -> Result<(), ProtocolError> {
    port.set_data_bits(serialport::DataBits::Eight)?;
    port.set_parity(serialport::Parity::None)?;
    port.set_stop_bits(serialport::StopBits::One)?;
    port.set_flow_control(serialport::FlowControl::None)?;

    if let Err(e) = port.write_data_terminal_ready(dtr_enable) {
        debug!("configure_port: failed to set DTR {}: {} (continuing)", dtr_enable, e);
    }

    Ok(())
}

/// Clear the serial port buffers
pub fn clear_buffers(port: &mut dyn SerialPort) -> Result<(), ProtocolError> {
    port.clear(serialport::ClearBuffer::All)?;
    Ok(())
}

/// Serial [`Link`]: opens the configured port, scans the system's ports
pub struct SerialLink {
    settings: RwLock<SerialSettings>,
}

impl SerialLink {
    /// Link that opens `settings.port_name` unless another endpoint is selected
    pub fn new(settings: SerialSettings) -> Self {
        Self {
            settings: RwLock::new(settings),
        }
    }

    /// Current settings
    pub fn settings(&self) -> SerialSettings {
        self.settings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl Link for SerialLink {
    fn open(&self) -> Result<Box<dyn CommunicationChannel>, ProtocolError> {
        let settings = self.settings();
        if settings.port_name.is_empty() {
            return Err(ProtocolError::ConnectionFailed(
                "no serial port selected".to_string(),
            ));
        }

        let mut port = open_port(&settings)?;
        configure_port(port.as_mut(), settings.dtr_enable)?;
        clear_buffers(port.as_mut())?;
        let channel = SerialChannel::new(port);
        debug!(
            "opened {} at {} baud (dtr={})",
            channel.port_name().unwrap_or(settings.port_name),
            settings.baud_rate,
            settings.dtr_enable
        );
        Ok(Box::new(channel))
    }

    fn endpoints(&self) -> Vec<String> {
        let configured = self.settings().port_name;
        let mut names: Vec<String> = list_ports().into_iter().map(|p| p.name).collect();
        if !configured.is_empty() {
            names.retain(|n| *n != configured);
            names.insert(0, configured);
        }
        names
    }

    fn select_endpoint(&self, endpoint: &str) -> Result<(), ProtocolError> {
        self.settings
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .port_name = endpoint.to_string();
        Ok(())
    }

    fn describe(&self) -> String {
        let settings = self.settings();
        format!("{}@{}", settings.port_name, settings.baud_rate)
    }
}
