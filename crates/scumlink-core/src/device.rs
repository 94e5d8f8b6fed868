//! Scumbelina battery meter commands
//!
//! Typed wrappers around the messenger for the meter firmware: clock
//! setting, configuration and log download.

use chrono::{DateTime, Datelike, NaiveDateTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::events::EventHub;
use crate::protocol::{
    Command, Messenger, ProtocolError, QueueStrategy, ReceivedCommand, DEFAULT_DEVICE_ID,
    IDENTIFY_COMMAND_ID,
};

/// Identifier the meter answers [`MeterCommand::Identify`] with
pub const UNIQUE_DEVICE_ID: &str = DEFAULT_DEVICE_ID;

/// Reply timeout used for meter requests, in milliseconds
pub const DEVICE_REPLY_TIMEOUT_MS: u64 = 500;

/// Largest text the firmware stores for a configuration threshold
pub const MAX_THRESHOLD_LEN: usize = 2;

/// Meter command ids, in firmware order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum MeterCommand {
    /// Handshake; answered with the same id and [`UNIQUE_DEVICE_ID`]
    Identify = IDENTIFY_COMMAND_ID,
    /// Command accepted
    Acknowledge = 1,
    /// Command rejected by the firmware
    Error = 2,
    /// Set the clock: year, month, day, hour, minute, second
    SetDateTime = 3,
    /// Ask for logged samples between two Unix timestamps
    RequestDataDownload = 4,
    /// Download accepted, items follow
    DataDownloadStart = 5,
    /// One logged sample
    DataDownloadItem = 6,
    /// No more items
    DataDownloadComplete = 7,
    /// Ask for the stored configuration
    GetConfiguration = 8,
    /// Replace the stored configuration
    SetConfiguration = 9,
    /// Stored configuration, answer to `GetConfiguration`
    ConfigurationData = 10,
}

impl MeterCommand {
    const ALL: [MeterCommand; 11] = [
        MeterCommand::Identify,
        MeterCommand::Acknowledge,
        MeterCommand::Error,
        MeterCommand::SetDateTime,
        MeterCommand::RequestDataDownload,
        MeterCommand::DataDownloadStart,
        MeterCommand::DataDownloadItem,
        MeterCommand::DataDownloadComplete,
        MeterCommand::GetConfiguration,
        MeterCommand::SetConfiguration,
        MeterCommand::ConfigurationData,
    ];

    /// Wire id
    pub fn id(self) -> i32 {
        self as i32
    }

    /// Look up a wire id
    pub fn from_id(id: i32) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.id() == id)
    }

    /// Request expecting `reply` within the meter timeout
    fn request(self, reply: MeterCommand) -> Command {
        Command::request(self.id(), reply.id(), DEVICE_REPLY_TIMEOUT_MS)
    }
}

/// One logged sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatteryMeasurement {
    /// When the meter took the sample
    pub timestamp: DateTime<Utc>,
    /// Battery voltage
    pub volts: f64,
    /// Current, negative while discharging
    pub amps: f64,
}

impl BatteryMeasurement {
    /// Parse a `DataDownloadItem`: Unix seconds, volts, amps
    pub fn from_command(command: &mut ReceivedCommand) -> Result<Self, ProtocolError> {
        let seconds = command.try_read_u32()?;
        let timestamp = Utc
            .timestamp_opt(i64::from(seconds), 0)
            .single()
            .ok_or_else(|| ProtocolError::InvalidArgument {
                position: 0,
                value: seconds.to_string(),
            })?;
        Ok(Self {
            timestamp,
            volts: command.try_read_f64()?,
            amps: command.try_read_f64()?,
        })
    }
}

/// Meter settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeterConfiguration {
    /// Screen saver timeout in seconds
    pub display_timeout_s: u32,
    /// Meter sampling interval in seconds
    pub meter_poll_interval_s: u32,
    /// Data log interval in seconds
    pub data_log_interval_s: u32,
    /// Upper voltage alarm threshold
    pub max_volts: String,
    /// Lower voltage alarm threshold
    pub min_volts: String,
    /// Current alarm threshold
    pub max_amps: String,
}

impl Default for MeterConfiguration {
    fn default() -> Self {
        Self {
            display_timeout_s: 60,
            meter_poll_interval_s: 5,
            data_log_interval_s: 30,
            max_volts: "16".to_string(),
            min_volts: "12".to_string(),
            max_amps: "10".to_string(),
        }
    }
}

impl MeterConfiguration {
    /// Parse a `ConfigurationData` reply
    pub fn from_command(command: &mut ReceivedCommand) -> Result<Self, ProtocolError> {
        Ok(Self {
            display_timeout_s: command.try_read_u32()?,
            meter_poll_interval_s: command.try_read_u32()?,
            data_log_interval_s: command.try_read_u32()?,
            max_volts: command.try_read_string()?,
            min_volts: command.try_read_string()?,
            max_amps: command.try_read_string()?,
        })
    }

    /// Check the thresholds fit in the firmware's buffers
    pub fn validate(&self) -> Result<(), ProtocolError> {
        let thresholds = [&self.max_volts, &self.min_volts, &self.max_amps];
        for (i, value) in thresholds.into_iter().enumerate() {
            if value.is_empty() || value.len() > MAX_THRESHOLD_LEN {
                return Err(ProtocolError::InvalidArgument {
                    position: i + 3,
                    value: value.clone(),
                });
            }
        }
        Ok(())
    }

    fn to_command(&self) -> Command {
        MeterCommand::SetConfiguration
            .request(MeterCommand::Acknowledge)
            .arg(self.display_timeout_s)
            .arg(self.meter_poll_interval_s)
            .arg(self.data_log_interval_s)
            .arg(self.max_volts.as_str())
            .arg(self.min_volts.as_str())
            .arg(self.max_amps.as_str())
    }
}

/// Notifications about a log download and unsolicited meter traffic
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadEvent {
    /// The meter accepted the download request
    Started,
    /// One logged sample
    Item(BatteryMeasurement),
    /// Every sample was sent
    Completed,
    /// The meter reported an error
    DeviceError,
    /// Informational message for the user
    Notice(String),
}

/// Typed meter client over a messenger
pub struct MeterClient {
    messenger: Arc<Messenger>,
    events: Arc<EventHub<DownloadEvent>>,
}

impl MeterClient {
    /// Client over an already constructed messenger
    pub fn new(messenger: Arc<Messenger>) -> Self {
        Self {
            messenger,
            events: Arc::new(EventHub::new()),
        }
    }

    /// Download and notice events
    pub fn events(&self) -> &EventHub<DownloadEvent> {
        &self.events
    }

    /// The messenger commands go through
    pub fn messenger(&self) -> &Arc<Messenger> {
        &self.messenger
    }

    /// Set the meter clock; true when acknowledged
    pub fn set_date_time(&self, when: NaiveDateTime) -> bool {
        let command = MeterCommand::SetDateTime
            .request(MeterCommand::Acknowledge)
            .arg(when.year())
            .arg(when.month())
            .arg(when.day())
            .arg(when.hour())
            .arg(when.minute())
            .arg(when.second());

        let reply = self.messenger.send_command(&command);
        if !reply.ok() {
            warn!("set date/time: no acknowledge from meter");
        }
        reply.ok()
    }

    /// Read the meter configuration
    pub fn get_configuration(&self) -> Option<MeterConfiguration> {
        let command = MeterCommand::GetConfiguration.request(MeterCommand::ConfigurationData);
        let mut reply = self.messenger.send_command(&command);
        if !reply.ok() {
            warn!("get configuration: no reply from meter");
            return None;
        }
        match MeterConfiguration::from_command(&mut reply) {
            Ok(config) => Some(config),
            Err(e) => {
                warn!("get configuration: bad reply {}: {}", reply, e);
                None
            }
        }
    }

    /// Write the meter configuration; true when acknowledged
    pub fn set_configuration(&self, config: &MeterConfiguration) -> Result<bool, ProtocolError> {
        config.validate()?;
        let reply = self.messenger.send_command(&config.to_command());
        if !reply.ok() {
            warn!("set configuration: no acknowledge from meter");
        }
        Ok(reply.ok())
    }

    /// Ask for logged samples between `start` and `end` (Unix seconds)
    ///
    /// Pending traffic in both queues is dropped first. Samples arrive
    /// through [`DownloadEvent::Item`] once handlers are attached.
    pub fn request_data_download(&self, start: u32, end: u32) -> bool {
        let command = MeterCommand::RequestDataDownload
            .request(MeterCommand::DataDownloadStart)
            .arg(start)
            .arg(end);

        let reply = self.messenger.send_command_with(
            &command,
            QueueStrategy::ClearQueue,
            QueueStrategy::ClearQueue,
        );
        if !reply.ok() {
            warn!("data download: meter did not start");
            return false;
        }
        info!("data download started");
        self.events.emit(&DownloadEvent::Started);
        true
    }

    /// Download the whole log
    pub fn request_full_download(&self) -> bool {
        self.request_data_download(0, 999_999)
    }

    /// Route meter traffic into [`DownloadEvent`]s
    pub fn attach_download_handlers(&self) {
        let dispatcher = self.messenger.dispatcher();

        let events = self.events.clone();
        dispatcher.attach(MeterCommand::DataDownloadItem.id(), move |mut command| {
            match BatteryMeasurement::from_command(&mut command) {
                Ok(item) => events.emit(&DownloadEvent::Item(item)),
                Err(e) => warn!("skipping download item {}: {}", command, e),
            }
        });

        let events = self.events.clone();
        dispatcher.attach(MeterCommand::DataDownloadComplete.id(), move |_| {
            debug!("data download complete");
            events.emit(&DownloadEvent::Completed);
        });

        let events = self.events.clone();
        dispatcher.attach(MeterCommand::Error.id(), move |_| {
            warn!("meter reported an error");
            events.emit(&DownloadEvent::DeviceError);
        });

        let events = self.events.clone();
        dispatcher.attach(MeterCommand::Acknowledge.id(), move |_| {
            events.emit(&DownloadEvent::Notice("Meter acknowledged".to_string()));
        });

        let events = self.events.clone();
        dispatcher.attach_default(move |command| {
            debug!("unhandled command {}", command);
            events.emit(&DownloadEvent::Notice(format!(
                "Command without attached callback received ({})",
                command.id()
            )));
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_command_ids_follow_firmware_order() {
        assert_eq!(MeterCommand::Identify.id(), 0);
        assert_eq!(MeterCommand::DataDownloadItem.id(), 6);
        assert_eq!(MeterCommand::ConfigurationData.id(), 10);
        assert_eq!(MeterCommand::from_id(7), Some(MeterCommand::DataDownloadComplete));
        assert_eq!(MeterCommand::from_id(11), None);
    }

    #[test]
    fn test_default_handshake_matches_meter() {
        let config = crate::protocol::ConnectionManagerConfig::default();
        assert_eq!(config.device_id, UNIQUE_DEVICE_ID);
        assert_eq!(config.identify_command_id, MeterCommand::Identify.id());
        assert_eq!(config.acknowledge_command_id, MeterCommand::Identify.id());
    }

    #[test]
    fn test_measurement_from_item() {
        let mut cmd = ReceivedCommand::new(
            6,
            vec!["1700000000".into(), "12.75".into(), "-3.5".into()],
        );
        let m = BatteryMeasurement::from_command(&mut cmd).unwrap();
        assert_eq!(m.timestamp.timestamp(), 1_700_000_000);
        assert_eq!(m.volts, 12.75);
        assert_eq!(m.amps, -3.5);
    }

    #[test]
    fn test_measurement_missing_field() {
        let mut cmd = ReceivedCommand::new(6, vec!["1700000000".into(), "12.75".into()]);
        assert!(matches!(
            BatteryMeasurement::from_command(&mut cmd),
            Err(ProtocolError::MissingArgument(_))
        ));
    }

    #[test]
    fn test_configuration_layout() {
        let config = MeterConfiguration::default();
        assert_eq!(config.to_command().to_string(), "9,60,5,30,16,12,10");

        let mut reply = ReceivedCommand::new(
            10,
            ["60", "5", "30", "16", "12", "10"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        );
        assert_eq!(MeterConfiguration::from_command(&mut reply).unwrap(), config);
    }

    #[test]
    fn test_configuration_threshold_length() {
        let config = MeterConfiguration {
            max_amps: "100".to_string(),
            ..MeterConfiguration::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ProtocolError::InvalidArgument { position: 5, .. })
        ));
    }
}
