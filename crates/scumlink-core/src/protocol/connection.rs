//! Connection management
//!
//! A [`ConnectionManager`] runs one supervisor thread per session. That
//! thread scans the transport's endpoints, handshakes with whatever answers,
//! and once connected runs the watchdog, so a handshake and a watchdog probe
//! never overlap.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{
    Command, Messenger, ProtocolError, QueueStrategy, DEFAULT_DEVICE_ID, DEFAULT_TIMEOUT_MS,
    IDENTIFY_COMMAND_ID,
};
use crate::events::EventHub;

/// How often the link is checked while connected with the watchdog off
const LINK_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Not running
    Disconnected,
    /// Looking for the device
    Scanning,
    /// Handshake succeeded
    Connected,
    /// The device stopped answering
    TimedOut,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Scanning => "scanning",
            ConnectionState::Connected => "connected",
            ConnectionState::TimedOut => "timed out",
        };
        f.write_str(s)
    }
}

/// Importance of a progress message
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ProgressLevel {
    /// State changes
    Major = 1,
    /// Individual attempts
    Minor = 2,
    /// Details of each attempt
    Verbose = 3,
}

impl ProgressLevel {
    /// Numeric level, 1 being the most important
    pub fn level(self) -> u8 {
        self as u8
    }

    /// Whether the message belongs on a status line
    pub fn is_status(self) -> bool {
        self.level() <= 2
    }
}

/// Events raised by the connection manager, all on its supervisor thread
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// Handshake succeeded
    Found {
        /// Endpoint the device answered on
        endpoint: String,
    },
    /// The connected device went away
    Lost,
    /// Human readable progress
    Progress {
        /// What is happening
        description: String,
        /// How prominently to show it
        level: ProgressLevel,
    },
    /// State transition
    StateChanged {
        /// State before
        from: ConnectionState,
        /// State after
        to: ConnectionState,
    },
}

/// Watchdog settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// Probe the device while connected
    pub enabled: bool,
    /// Time between watchdog ticks in milliseconds
    pub interval_ms: u64,
    /// Silence after which a tick probes the device, in milliseconds
    pub timeout_ms: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_ms: 2000,
            timeout_ms: 4000,
        }
    }
}

/// Connection manager configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionManagerConfig {
    /// Identifier the device must answer the handshake with
    pub device_id: String,
    /// Command sent to identify the device
    pub identify_command_id: i32,
    /// Command the device answers the identify command with
    pub acknowledge_command_id: i32,
    /// Handshake reply timeout in milliseconds
    pub handshake_timeout_ms: u64,
    /// Pause between two unsuccessful scan passes in milliseconds
    pub scan_interval_ms: u64,
    /// Watchdog settings
    pub watchdog: WatchdogConfig,
}

impl Default for ConnectionManagerConfig {
    fn default() -> Self {
        Self {
            device_id: DEFAULT_DEVICE_ID.to_string(),
            identify_command_id: IDENTIFY_COMMAND_ID,
            acknowledge_command_id: IDENTIFY_COMMAND_ID,
            handshake_timeout_ms: DEFAULT_TIMEOUT_MS,
            scan_interval_ms: 1000,
            watchdog: WatchdogConfig::default(),
        }
    }
}

/// Stop flag with an interruptible sleep
struct StopSignal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl StopSignal {
    fn lock(&self) -> MutexGuard<'_, bool> {
        self.stopped.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_set(&self) -> bool {
        *self.lock()
    }

    fn set(&self, value: bool) {
        *self.lock() = value;
        self.wake.notify_all();
    }

    /// Sleep for `duration`; false if stopped meanwhile
    fn pause(&self, duration: Duration) -> bool {
        let guard = self.lock();
        let (guard, _) = self
            .wake
            .wait_timeout_while(guard, duration, |stopped| !*stopped)
            .unwrap_or_else(|e| e.into_inner());
        !*guard
    }
}

struct Shared {
    messenger: Arc<Messenger>,
    config: ConnectionManagerConfig,
    state: Mutex<ConnectionState>,
    endpoint: Mutex<Option<String>>,
    events: EventHub<ConnectionEvent>,
    stop: StopSignal,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, to: ConnectionState) {
        let from = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *state, to)
        };
        if from != to {
            debug!("connection state {} -> {}", from, to);
            self.events.emit(&ConnectionEvent::StateChanged { from, to });
        }
    }

    fn progress(&self, level: ProgressLevel, description: impl Into<String>) {
        let description = description.into();
        debug!("{}", description);
        self.events
            .emit(&ConnectionEvent::Progress { description, level });
    }

    fn last_endpoint(&self) -> Option<String> {
        self.endpoint
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn identify(&self) -> Command {
        Command::request(
            self.config.identify_command_id,
            self.config.acknowledge_command_id,
            self.config.handshake_timeout_ms,
        )
    }

    /// Send the identify command and check the answer
    fn handshake(&self, receive_strategy: QueueStrategy) -> bool {
        let mut reply = self.messenger.send_command_with(
            &self.identify(),
            QueueStrategy::None,
            receive_strategy,
        );
        if !reply.ok() {
            self.progress(ProgressLevel::Verbose, "No answer to identify");
            return false;
        }
        let id = reply.read_string();
        if id.as_bytes() != self.config.device_id.as_bytes() {
            self.progress(
                ProgressLevel::Verbose,
                format!("Unexpected device id '{}'", id),
            );
            return false;
        }
        true
    }

    fn try_endpoint(&self) -> bool {
        let transport = self.messenger.transport();
        let endpoint = transport.endpoint();
        self.progress(ProgressLevel::Minor, format!("Trying {}", endpoint));

        if let Err(e) = self.messenger.connect() {
            self.progress(
                ProgressLevel::Verbose,
                format!("Could not open {}: {}", endpoint, e),
            );
            return false;
        }

        if self.handshake(QueueStrategy::ClearQueue) {
            *self.endpoint.lock().unwrap_or_else(|e| e.into_inner()) = Some(endpoint);
            return true;
        }

        self.messenger.disconnect();
        false
    }

    /// One pass over every candidate endpoint, last good one first
    fn scan_pass(&self) -> bool {
        let transport = self.messenger.transport();
        let mut candidates = transport.endpoints();
        if candidates.is_empty() {
            return self.try_endpoint();
        }

        if let Some(last) = self.last_endpoint() {
            if let Some(pos) = candidates.iter().position(|c| *c == last) {
                let last = candidates.remove(pos);
                candidates.insert(0, last);
            }
        }

        for candidate in candidates {
            if self.stop.is_set() {
                return false;
            }
            if let Err(e) = transport.select_endpoint(&candidate) {
                self.progress(
                    ProgressLevel::Verbose,
                    format!("Skipping {}: {}", candidate, e),
                );
                continue;
            }
            if self.try_endpoint() {
                return true;
            }
        }
        false
    }

    /// Watchdog tick; false when the device is gone
    fn check_alive(&self) -> bool {
        if !self.messenger.is_connected() {
            self.progress(ProgressLevel::Minor, "Transport closed");
            return false;
        }

        let watchdog = &self.config.watchdog;
        if !watchdog.enabled {
            return true;
        }

        let timeout = Duration::from_millis(watchdog.timeout_ms);
        match self.messenger.idle_time() {
            Some(idle) if idle < timeout => true,
            _ => {
                self.progress(ProgressLevel::Verbose, "Watchdog probing device");
                self.handshake(QueueStrategy::None)
            }
        }
    }

    fn run(self: Arc<Self>) {
        info!("connection manager started");
        self.set_state(ConnectionState::Scanning);
        self.progress(ProgressLevel::Major, "Scanning for device");

        while !self.stop.is_set() {
            match self.state() {
                ConnectionState::Connected => {
                    let tick = if self.config.watchdog.enabled {
                        Duration::from_millis(self.config.watchdog.interval_ms)
                    } else {
                        LINK_CHECK_INTERVAL
                    };
                    if !self.stop.pause(tick) {
                        break;
                    }
                    if self.check_alive() || self.stop.is_set() {
                        continue;
                    }

                    warn!("connection to {} lost", self.messenger.transport().endpoint());
                    self.set_state(ConnectionState::TimedOut);
                    self.messenger.disconnect();
                    self.events.emit(&ConnectionEvent::Lost);
                    self.progress(ProgressLevel::Major, "Connection lost, scanning for device");
                    self.set_state(ConnectionState::Scanning);
                }
                ConnectionState::Scanning => {
                    if self.scan_pass() {
                        let endpoint = self.messenger.transport().endpoint();
                        info!("device found on {}", endpoint);
                        self.set_state(ConnectionState::Connected);
                        self.progress(ProgressLevel::Major, format!("Connected to {}", endpoint));
                        self.events.emit(&ConnectionEvent::Found { endpoint });
                    } else if !self.stop.is_set() {
                        self.progress(ProgressLevel::Minor, "Device not found, retrying");
                        if !self
                            .stop
                            .pause(Duration::from_millis(self.config.scan_interval_ms))
                        {
                            break;
                        }
                    }
                }
                ConnectionState::TimedOut | ConnectionState::Disconnected => {
                    self.set_state(ConnectionState::Scanning);
                }
            }
        }
        debug!("connection supervisor stopped");
    }
}

/// Finds the device, handshakes with it and watches the link
pub struct ConnectionManager {
    shared: Arc<Shared>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Create a stopped manager for `messenger`
    pub fn new(messenger: Arc<Messenger>, config: ConnectionManagerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                messenger,
                config,
                state: Mutex::new(ConnectionState::Disconnected),
                endpoint: Mutex::new(None),
                events: EventHub::new(),
                stop: StopSignal {
                    stopped: Mutex::new(false),
                    wake: Condvar::new(),
                },
            }),
            supervisor: Mutex::new(None),
        }
    }

    /// Connection events
    pub fn events(&self) -> &EventHub<ConnectionEvent> {
        &self.shared.events
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Endpoint of the last successful handshake
    pub fn endpoint(&self) -> Option<String> {
        self.shared.last_endpoint()
    }

    /// The messenger the manager drives
    pub fn messenger(&self) -> &Arc<Messenger> {
        &self.shared.messenger
    }

    /// Configuration in use
    pub fn config(&self) -> &ConnectionManagerConfig {
        &self.shared.config
    }

    /// Whether the supervisor is running
    pub fn is_running(&self) -> bool {
        self.supervisor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Start scanning on a supervisor thread; a no-op when already running
    pub fn start(&self) -> Result<(), ProtocolError> {
        let mut supervisor = self.supervisor.lock().unwrap_or_else(|e| e.into_inner());
        if supervisor.is_some() {
            debug!("connection manager already running");
            return Ok(());
        }

        self.shared.stop.set(false);
        let shared = self.shared.clone();
        *supervisor = Some(
            thread::Builder::new()
                .name("connection-supervisor".to_string())
                .spawn(move || shared.run())?,
        );
        Ok(())
    }

    /// Drop every subscriber, then stop scanning and watching and disconnect
    ///
    /// Subscribers hear nothing from the shutdown itself, not even the final
    /// move to `Disconnected`.
    pub fn stop(&self) {
        let handle = self
            .supervisor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        self.shared.events.clear();
        self.shared.stop.set(true);
        self.shared.messenger.abort_pending();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }

        self.shared.messenger.disconnect();
        self.shared.set_state(ConnectionState::Disconnected);
        info!("connection manager stopped");
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_levels() {
        assert!(ProgressLevel::Major.is_status());
        assert!(ProgressLevel::Minor.is_status());
        assert!(!ProgressLevel::Verbose.is_status());
        assert_eq!(ProgressLevel::Verbose.level(), 3);
    }

    #[test]
    fn test_default_config_targets_scumbelina() {
        let config = ConnectionManagerConfig::default();
        assert_eq!(config.device_id, "F21089D968C34F2E97F34FA6EB5AEDCA");
        assert_eq!(config.identify_command_id, 0);
        assert_eq!(config.acknowledge_command_id, 0);
        assert!(!config.watchdog.enabled);
    }

    #[test]
    fn test_config_fields_default_when_missing() {
        let config: ConnectionManagerConfig =
            serde_json::from_str(r#"{"watchdog": {"enabled": true}}"#).unwrap();
        assert!(config.watchdog.enabled);
        assert_eq!(config.watchdog.interval_ms, 2000);
        assert_eq!(config.scan_interval_ms, 1000);
    }

    #[test]
    fn test_stop_pause() {
        let signal = StopSignal {
            stopped: Mutex::new(false),
            wake: Condvar::new(),
        };
        assert!(signal.pause(Duration::from_millis(1)));
        signal.set(true);
        assert!(!signal.pause(Duration::from_secs(5)));
    }
}
