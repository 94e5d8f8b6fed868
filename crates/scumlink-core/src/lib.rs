//! # ScumLink Core Library
//!
//! Command messaging for the Scumbelina battery meter.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - Byte transports over serial ports or a pair of files
//! - A text frame codec with escaping (`id,arg,arg;`)
//! - Blocking request/response and callback dispatch over one link
//! - Device discovery, handshake and watchdog
//! - The meter's command set (clock, configuration, log download)
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use scumlink_core::prelude::*;
//!
//! let config = LinkConfig::load("scumlink.json")?;
//! let messenger = Arc::new(Messenger::new(
//!     config.transport.build(),
//!     config.frame.to_format()?,
//! )?);
//! let manager = ConnectionManager::new(messenger.clone(), config.connection);
//! manager.events().subscribe(|event| println!("{:?}", event));
//! manager.start()?;
//!
//! let meter = MeterClient::new(messenger);
//! if let Some(settings) = meter.get_configuration() {
//!     println!("logging every {} s", settings.data_log_interval_s);
//! }
//! ```

pub mod config;
pub mod device;
pub mod events;
pub mod protocol;
pub mod transport;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{FrameConfig, LinkConfig, TransportConfig};
    pub use crate::device::{
        BatteryMeasurement, DownloadEvent, MeterClient, MeterCommand, MeterConfiguration,
    };
    pub use crate::events::{EventHub, SubscriptionId};
    pub use crate::protocol::{
        Command, ConnectionEvent, ConnectionManager, ConnectionManagerConfig, ConnectionState,
        Messenger, MessengerEvent, ProgressLevel, ProtocolError, QueueStrategy, ReceivedCommand,
    };
    pub use crate::transport::{PolledTransport, Transport};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
