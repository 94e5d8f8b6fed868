//! Command messaging protocol
//!
//! Text framed commands over a byte transport: `id,arg,arg;` with `/` as
//! the escape character. [`Messenger`] turns a [`Transport`](crate::transport::Transport)
//! into request/response and callback style messaging, and
//! [`ConnectionManager`] finds the device, handshakes with it and notices
//! when it goes away.

mod codec;
mod command;
mod connection;
mod dispatcher;
mod error;
mod messenger;
mod queue;

pub use codec::{FrameDecoder, FrameFormat};
pub use command::{Argument, Command, ReceivedCommand, ReplyExpectation};
pub use connection::{
    ConnectionEvent, ConnectionManager, ConnectionManagerConfig, ConnectionState, ProgressLevel,
    WatchdogConfig,
};
pub use dispatcher::{ChannelInvoker, CommandCallback, CommandDispatcher, DirectInvoker, Invoker, Job};
pub use error::ProtocolError;
pub use messenger::{Messenger, MessengerEvent};
pub use queue::{CommandQueue, QueueItem, QueueStrategy};

/// Default baud rate of the device's serial link
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Default reply timeout in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 1000;

/// Identifier a device is expected to answer the handshake with
pub const DEFAULT_DEVICE_ID: &str = "F21089D968C34F2E97F34FA6EB5AEDCA";

/// Command id of the identify handshake and of its answer
pub const IDENTIFY_COMMAND_ID: i32 = 0;

/// Longest frame body the decoder buffers before giving up on it
pub const MAX_FRAME_SIZE: usize = 1024;
