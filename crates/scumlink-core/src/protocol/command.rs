//! Commands
//!
//! A [`Command`] is an integer id followed by an ordered list of typed
//! arguments. Outbound commands are built with [`Command::new`] /
//! [`Command::request`] and the `arg` builder; inbound frames decode into a
//! [`ReceivedCommand`] that hands its arguments out through a forward-only
//! cursor.

use std::fmt;
use std::time::Duration;

use super::ProtocolError;

/// A single typed command argument
#[derive(Debug, Clone, PartialEq)]
pub enum Argument {
    /// Signed integer
    Int(i64),
    /// Unsigned integer
    UInt(u64),
    /// Floating point number
    Float(f64),
    /// Boolean, sent as `1` / `0`
    Bool(bool),
    /// Free text
    Text(String),
}

impl Argument {
    /// Locale-independent wire text for this argument (before escaping)
    pub fn to_wire(&self) -> String {
        match self {
            Argument::Int(v) => v.to_string(),
            Argument::UInt(v) => v.to_string(),
            // `Display` for f64 never groups digits and always uses '.',
            // and prints the shortest form that parses back to the same value.
            Argument::Float(v) => v.to_string(),
            Argument::Bool(v) => (if *v { "1" } else { "0" }).to_string(),
            Argument::Text(s) => s.clone(),
        }
    }
}

macro_rules! impl_from_argument {
    ($variant:ident, $target:ty, $($t:ty),+) => {
        $(
            impl From<$t> for Argument {
                fn from(v: $t) -> Self {
                    Argument::$variant(v as $target)
                }
            }
        )+
    };
}

impl_from_argument!(Int, i64, i8, i16, i32, i64);
impl_from_argument!(UInt, u64, u8, u16, u32, u64);
impl_from_argument!(Float, f64, f32, f64);

impl From<bool> for Argument {
    fn from(v: bool) -> Self {
        Argument::Bool(v)
    }
}

impl From<&str> for Argument {
    fn from(v: &str) -> Self {
        Argument::Text(v.to_string())
    }
}

impl From<String> for Argument {
    fn from(v: String) -> Self {
        Argument::Text(v)
    }
}

/// What a request waits for after it has been written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyExpectation {
    /// Command id that resolves the request
    pub reply_id: i32,
    /// How long to wait for it
    pub timeout: Duration,
}

/// An outbound command
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    id: i32,
    arguments: Vec<Argument>,
    reply: Option<ReplyExpectation>,
}

impl Command {
    /// Create a fire-and-forget command
    pub fn new(id: i32) -> Self {
        Self {
            id,
            arguments: Vec::new(),
            reply: None,
        }
    }

    /// Create a command that waits up to `timeout_ms` for a reply with `reply_id`
    pub fn request(id: i32, reply_id: i32, timeout_ms: u64) -> Self {
        Self {
            id,
            arguments: Vec::new(),
            reply: Some(ReplyExpectation {
                reply_id,
                timeout: Duration::from_millis(timeout_ms),
            }),
        }
    }

    /// Append an argument
    pub fn arg(mut self, value: impl Into<Argument>) -> Self {
        self.arguments.push(value.into());
        self
    }

    /// Append an argument in place
    pub fn push_arg(&mut self, value: impl Into<Argument>) {
        self.arguments.push(value.into());
    }

    /// Command id
    pub fn id(&self) -> i32 {
        self.id
    }

    /// Arguments in send order
    pub fn arguments(&self) -> &[Argument] {
        &self.arguments
    }

    /// Reply expectation, if this command is a request
    pub fn reply(&self) -> Option<ReplyExpectation> {
        self.reply
    }

    /// Whether the sender blocks for a reply
    pub fn expects_reply(&self) -> bool {
        self.reply.is_some()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)?;
        for arg in &self.arguments {
            write!(f, ",{}", arg.to_wire())?;
        }
        Ok(())
    }
}

/// A decoded inbound command
///
/// Arguments are kept in their unescaped wire text and parsed on demand.
/// Every `read_*` / `try_read_*` call consumes one argument; the cursor never
/// moves backwards.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReceivedCommand {
    id: i32,
    arguments: Vec<String>,
    cursor: usize,
    ok: bool,
}

impl ReceivedCommand {
    /// A successfully decoded command
    pub fn new(id: i32, arguments: Vec<String>) -> Self {
        Self {
            id,
            arguments,
            cursor: 0,
            ok: true,
        }
    }

    /// The result of a request that got no reply
    pub fn not_ok(id: i32) -> Self {
        Self {
            id,
            arguments: Vec::new(),
            cursor: 0,
            ok: false,
        }
    }

    /// Command id
    pub fn id(&self) -> i32 {
        self.id
    }

    /// Whether the awaited reply arrived in time
    pub fn ok(&self) -> bool {
        self.ok
    }

    /// Raw argument texts
    pub fn arguments(&self) -> &[String] {
        &self.arguments
    }

    /// Number of arguments not yet consumed
    pub fn remaining(&self) -> usize {
        self.arguments.len().saturating_sub(self.cursor)
    }

    /// Consume the next argument without interpreting it
    pub fn next_arg(&mut self) -> Option<&str> {
        let arg = self.arguments.get(self.cursor)?;
        self.cursor += 1;
        Some(arg.as_str())
    }

    fn try_parse<T: std::str::FromStr>(&mut self) -> Result<T, ProtocolError> {
        let position = self.cursor;
        let raw = self
            .next_arg()
            .ok_or(ProtocolError::MissingArgument(position))?;
        raw.trim()
            .parse::<T>()
            .map_err(|_| ProtocolError::InvalidArgument {
                position,
                value: raw.to_string(),
            })
    }

    /// Next argument as a signed integer
    pub fn try_read_i32(&mut self) -> Result<i32, ProtocolError> {
        self.try_parse()
    }

    /// Next argument as a signed 64-bit integer
    pub fn try_read_i64(&mut self) -> Result<i64, ProtocolError> {
        self.try_parse()
    }

    /// Next argument as an unsigned integer
    pub fn try_read_u32(&mut self) -> Result<u32, ProtocolError> {
        self.try_parse()
    }

    /// Next argument as a floating point number
    pub fn try_read_f64(&mut self) -> Result<f64, ProtocolError> {
        self.try_parse()
    }

    /// Next argument as a boolean (`1`/`0`, `true`/`false`)
    pub fn try_read_bool(&mut self) -> Result<bool, ProtocolError> {
        let position = self.cursor;
        let raw = self
            .next_arg()
            .ok_or(ProtocolError::MissingArgument(position))?;
        match raw.trim() {
            "1" | "true" => Ok(true),
            "0" | "false" => Ok(false),
            other => Err(ProtocolError::InvalidArgument {
                position,
                value: other.to_string(),
            }),
        }
    }

    /// Next argument as text
    pub fn try_read_string(&mut self) -> Result<String, ProtocolError> {
        let position = self.cursor;
        self.next_arg()
            .map(str::to_string)
            .ok_or(ProtocolError::MissingArgument(position))
    }

    /// Next argument as a signed integer, 0 if missing or invalid
    pub fn read_i32(&mut self) -> i32 {
        self.try_read_i32().unwrap_or_default()
    }

    /// Next argument as a signed 64-bit integer, 0 if missing or invalid
    pub fn read_i64(&mut self) -> i64 {
        self.try_read_i64().unwrap_or_default()
    }

    /// Next argument as an unsigned integer, 0 if missing or invalid
    pub fn read_u32(&mut self) -> u32 {
        self.try_read_u32().unwrap_or_default()
    }

    /// Next argument as a float, 0.0 if missing or invalid
    pub fn read_f64(&mut self) -> f64 {
        self.try_read_f64().unwrap_or_default()
    }

    /// Next argument as a boolean, false if missing or invalid
    pub fn read_bool(&mut self) -> bool {
        self.try_read_bool().unwrap_or_default()
    }

    /// Next argument as text, empty if missing
    pub fn read_string(&mut self) -> String {
        self.try_read_string().unwrap_or_default()
    }
}

impl fmt::Display for ReceivedCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)?;
        for arg in &self.arguments {
            write!(f, ",{}", arg)?;
        }
        Ok(())
    }
}
