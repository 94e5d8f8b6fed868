use serialport::SerialPort;
use std::io::{self, Read, Write};

/// Abstraction for the raw channel behind a transport (serial port or files)
///
/// The poll loop reads from one handle while callers write through a clone,
/// so every channel must be cloneable into an independent handle.
pub trait CommunicationChannel: Read + Write + Send {
    /// Discard unread input
    fn clear_input_buffer(&mut self) -> io::Result<()>;

    /// Get a second handle to the same channel
    fn try_clone(&self) -> io::Result<Box<dyn CommunicationChannel>>;
}

/// [`CommunicationChannel`] over an open serial port
///
/// A read that hits the port timeout reports zero bytes, so the poll loop
/// sees an idle line rather than an error.
pub struct SerialChannel(Box<dyn SerialPort>);

impl SerialChannel {
    /// Wrap a port already configured by [`super::serial::configure_port`]
    pub fn new(port: Box<dyn SerialPort>) -> Self {
        Self(port)
    }

    /// Name the operating system gave the port, if any
    pub fn port_name(&self) -> Option<String> {
        self.0.name()
    }
}

impl Read for SerialChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.0.read(buf) {
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            other => other,
        }
    }
}

impl Write for SerialChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl CommunicationChannel for SerialChannel {
    fn clear_input_buffer(&mut self) -> io::Result<()> {
        Ok(self.0.clear(serialport::ClearBuffer::Input)?)
    }

    fn try_clone(&self) -> io::Result<Box<dyn CommunicationChannel>> {
        let twin = self.0.try_clone()?;
        Ok(Box::new(Self(twin)))
    }
}

/// Errors the poll loop and writers treat as "nothing happened this time"
pub(crate) fn is_timeout_class(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}
