//! In-memory stand-in for the meter
//!
//! [`StubDevice`] implements `Transport`. Frames the host writes are decoded
//! and handed to a responder; whatever it returns is queued as device output
//! and announced to the listener before `write` returns.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use scumlink_core::device::{MeterCommand, UNIQUE_DEVICE_ID};
use scumlink_core::protocol::{
    Command, ConnectionManagerConfig, FrameDecoder, FrameFormat, ProtocolError, ReceivedCommand,
    WatchdogConfig,
};
use scumlink_core::transport::{Transport, TransportListener};

/// Decides the device's answer to one host command
pub type Responder = Box<dyn Fn(&str, &ReceivedCommand) -> Vec<Command> + Send + Sync>;

pub struct StubDevice {
    connected: AtomicBool,
    silent: AtomicBool,
    endpoints: Vec<String>,
    selected: Mutex<String>,
    responder: Responder,
    decoder: Mutex<FrameDecoder>,
    output: Mutex<Vec<u8>>,
    received: Mutex<Vec<String>>,
    listener: Mutex<Option<Weak<dyn TransportListener>>>,
    connects: AtomicUsize,
}

impl StubDevice {
    /// Device on `endpoints` (empty for a fixed endpoint) answering with `responder`
    pub fn new(endpoints: &[&str], responder: Responder) -> Arc<Self> {
        Arc::new(Self {
            connected: AtomicBool::new(false),
            silent: AtomicBool::new(false),
            endpoints: endpoints.iter().map(|e| e.to_string()).collect(),
            selected: Mutex::new(endpoints.first().unwrap_or(&"stub").to_string()),
            responder,
            decoder: Mutex::new(FrameDecoder::default()),
            output: Mutex::new(Vec::new()),
            received: Mutex::new(Vec::new()),
            listener: Mutex::new(None),
            connects: AtomicUsize::new(0),
        })
    }

    /// Answers every command with a copy of itself
    pub fn echo() -> Arc<Self> {
        Self::new(
            &[],
            Box::new(|_, cmd| {
                let mut reply = Command::new(cmd.id());
                for arg in cmd.arguments() {
                    reply.push_arg(arg.as_str());
                }
                vec![reply]
            }),
        )
    }

    /// Never answers
    pub fn mute() -> Arc<Self> {
        Self::new(&[], Box::new(|_, _| Vec::new()))
    }

    /// Answers identify with `device_id` on the endpoints in `answering`
    pub fn meter(endpoints: &[&str], answering: &[&str], device_id: &str) -> Arc<Self> {
        let answering: Vec<String> = answering.iter().map(|e| e.to_string()).collect();
        let device_id = device_id.to_string();
        Self::new(
            endpoints,
            Box::new(move |endpoint, cmd| {
                let fixed = answering.is_empty();
                if !fixed && !answering.iter().any(|a| a == endpoint) {
                    return Vec::new();
                }
                meter_reply(cmd, &device_id)
            }),
        )
    }

    /// Make the device stop (or resume) answering
    pub fn set_silent(&self, silent: bool) {
        self.silent.store(silent, Ordering::SeqCst);
    }

    /// Commands the host sent, in wire text
    pub fn received(&self) -> Vec<String> {
        self.received.lock().unwrap().clone()
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Inject raw device output
    pub fn push(&self, bytes: &[u8]) {
        self.output.lock().unwrap().extend_from_slice(bytes);
        self.notify_data();
    }

    /// Simulate the cable being pulled
    pub fn unplug(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            if let Some(listener) = self.listener() {
                listener.on_disconnected();
            }
        }
    }

    fn listener(&self) -> Option<Arc<dyn TransportListener>> {
        self.listener.lock().unwrap().as_ref().and_then(Weak::upgrade)
    }

    fn notify_data(&self) {
        if let Some(listener) = self.listener() {
            listener.on_data_available();
        }
    }
}

/// The firmware's answers
pub fn meter_reply(cmd: &ReceivedCommand, device_id: &str) -> Vec<Command> {
    match MeterCommand::from_id(cmd.id()) {
        Some(MeterCommand::Identify) => {
            vec![Command::new(MeterCommand::Identify.id()).arg(device_id)]
        }
        Some(MeterCommand::SetDateTime) | Some(MeterCommand::SetConfiguration) => {
            vec![Command::new(MeterCommand::Acknowledge.id())]
        }
        Some(MeterCommand::GetConfiguration) => vec![Command::new(
            MeterCommand::ConfigurationData.id(),
        )
        .arg(120u32)
        .arg(5u32)
        .arg(60u32)
        .arg("15")
        .arg("11")
        .arg("20")],
        Some(MeterCommand::RequestDataDownload) => {
            vec![Command::new(MeterCommand::DataDownloadStart.id())]
        }
        _ => Vec::new(),
    }
}

impl Transport for StubDevice {
    fn connect(&self) -> Result<(), ProtocolError> {
        if self.connected.swap(true, Ordering::SeqCst) {
            return Err(ProtocolError::AlreadyConnected);
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.decoder.lock().unwrap().reset();
        self.output.lock().unwrap().clear();
        Ok(())
    }

    fn disconnect(&self) -> bool {
        let was = self.connected.swap(false, Ordering::SeqCst);
        if was {
            if let Some(listener) = self.listener() {
                listener.on_disconnected();
            }
        }
        was
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn write(&self, data: &[u8]) {
        if !self.is_connected() {
            return;
        }
        let commands = self.decoder.lock().unwrap().feed(data);
        let endpoint = self.endpoint();
        let format = FrameFormat::default();
        let mut replies = Vec::new();
        for cmd in commands.into_iter().flatten() {
            self.received.lock().unwrap().push(cmd.to_string());
            if !self.silent.load(Ordering::SeqCst) {
                replies.extend((self.responder)(&endpoint, &cmd));
            }
        }
        if replies.is_empty() {
            return;
        }
        let mut bytes = Vec::new();
        for reply in &replies {
            bytes.extend(format.encode(reply));
        }
        self.push(&bytes);
    }

    fn read(&self) -> Vec<u8> {
        std::mem::take(&mut *self.output.lock().unwrap())
    }

    fn set_listener(&self, listener: Option<Weak<dyn TransportListener>>) {
        *self.listener.lock().unwrap() = listener;
    }

    fn endpoints(&self) -> Vec<String> {
        self.endpoints.clone()
    }

    fn select_endpoint(&self, endpoint: &str) -> Result<(), ProtocolError> {
        if self.is_connected() {
            return Err(ProtocolError::EndpointLocked);
        }
        *self.selected.lock().unwrap() = endpoint.to_string();
        Ok(())
    }

    fn endpoint(&self) -> String {
        self.selected.lock().unwrap().clone()
    }
}

/// Route library logs to the test harness; `RUST_LOG` picks the level
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Manager settings with short timers
pub fn fast_config() -> ConnectionManagerConfig {
    ConnectionManagerConfig {
        device_id: UNIQUE_DEVICE_ID.to_string(),
        handshake_timeout_ms: 100,
        scan_interval_ms: 20,
        watchdog: WatchdogConfig {
            enabled: false,
            interval_ms: 30,
            timeout_ms: 60,
        },
        ..ConnectionManagerConfig::default()
    }
}

/// Wait for the first message matching `pred`
pub fn wait_for<T>(rx: &Receiver<T>, timeout: Duration, mut pred: impl FnMut(&T) -> bool) -> Option<T> {
    let deadline = std::time::Instant::now() + timeout;
    loop {
        let left = deadline.checked_duration_since(std::time::Instant::now())?;
        match rx.recv_timeout(left) {
            Ok(msg) if pred(&msg) => return Some(msg),
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
}
