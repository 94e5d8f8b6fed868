//! Frame encoding/decoding
//!
//! Frame format:
//! - command id as decimal text
//! - for each argument: field separator, then the argument text
//! - command terminator
//!
//! A literal separator, terminator or escape byte inside an argument is
//! prefixed with the escape byte. The defaults (`,` `;` `/`) match the
//! device firmware.
//!
//! [`FrameDecoder`] is a streaming scanner: feed it whatever the transport
//! produced and it yields every complete frame, keeping a partial frame
//! until its terminator arrives.

use tracing::{trace, warn};

use super::{Command, ProtocolError, ReceivedCommand, MAX_FRAME_SIZE};

/// Control bytes of the wire format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameFormat {
    /// Separates the id and the arguments
    pub field_separator: u8,
    /// Ends a command
    pub command_terminator: u8,
    /// Makes the next byte literal
    pub escape: u8,
}

impl Default for FrameFormat {
    fn default() -> Self {
        Self {
            field_separator: b',',
            command_terminator: b';',
            escape: b'/',
        }
    }
}

impl FrameFormat {
    /// Check that the three control bytes are distinct
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.field_separator == self.command_terminator
            || self.field_separator == self.escape
            || self.command_terminator == self.escape
        {
            return Err(ProtocolError::InvalidFormat(format!(
                "control bytes must be distinct (separator {:?}, terminator {:?}, escape {:?})",
                self.field_separator as char, self.command_terminator as char, self.escape as char
            )));
        }
        Ok(())
    }

    fn is_control(&self, b: u8) -> bool {
        b == self.field_separator || b == self.command_terminator || b == self.escape
    }

    /// Escape every control byte in `field`
    pub fn escape_field(&self, field: &[u8], out: &mut Vec<u8>) {
        for &b in field {
            if self.is_control(b) {
                out.push(self.escape);
            }
            out.push(b);
        }
    }

    /// Remove escape bytes from a field
    pub fn unescape_field(&self, field: &[u8]) -> Vec<u8> {
        let mut result = Vec::with_capacity(field.len());
        let mut escaped = false;
        for &b in field {
            if escaped {
                result.push(b);
                escaped = false;
            } else if b == self.escape {
                escaped = true;
            } else {
                result.push(b);
            }
        }
        result
    }

    /// Encode a command into one terminated frame
    pub fn encode(&self, command: &Command) -> Vec<u8> {
        let mut frame = command.id().to_string().into_bytes();
        for arg in command.arguments() {
            frame.push(self.field_separator);
            self.escape_field(arg.to_wire().as_bytes(), &mut frame);
        }
        frame.push(self.command_terminator);
        frame
    }

    /// Split a frame body (terminator already removed) on unescaped separators
    fn split_fields<'a>(&self, body: &'a [u8]) -> Vec<&'a [u8]> {
        let mut fields = Vec::new();
        let mut start = 0;
        let mut escaped = false;
        for (i, &b) in body.iter().enumerate() {
            if escaped {
                escaped = false;
            } else if b == self.escape {
                escaped = true;
            } else if b == self.field_separator {
                fields.push(&body[start..i]);
                start = i + 1;
            }
        }
        fields.push(&body[start..]);
        fields
    }

    /// Decode one frame body (without terminator)
    pub fn decode_body(&self, body: &[u8]) -> Result<ReceivedCommand, ProtocolError> {
        let fields = self.split_fields(body);
        let (head, rest) = fields
            .split_first()
            .ok_or_else(|| ProtocolError::MalformedFrame("empty frame".to_string()))?;

        let id_text = String::from_utf8_lossy(head);
        let id_text = id_text.trim();
        let id = id_text.parse::<i32>().map_err(|_| {
            ProtocolError::MalformedFrame(format!("invalid command id {:?}", id_text))
        })?;

        let arguments = rest
            .iter()
            .map(|field| String::from_utf8_lossy(&self.unescape_field(field)).into_owned())
            .collect();

        Ok(ReceivedCommand::new(id, arguments))
    }
}

/// Streaming frame scanner
#[derive(Debug)]
pub struct FrameDecoder {
    format: FrameFormat,
    /// Bytes of the frame being assembled (still escaped)
    pending: Vec<u8>,
    /// The previous byte was an escape
    escaped: bool,
    /// Dropping bytes until the next terminator after an overflow
    discarding: bool,
}

impl FrameDecoder {
    /// Create a decoder for the given wire format
    pub fn new(format: FrameFormat) -> Self {
        Self {
            format,
            pending: Vec::new(),
            escaped: false,
            discarding: false,
        }
    }

    /// Wire format in use
    pub fn format(&self) -> &FrameFormat {
        &self.format
    }

    /// Bytes held for an incomplete frame
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Drop any partial frame
    pub fn reset(&mut self) {
        self.pending.clear();
        self.escaped = false;
        self.discarding = false;
    }

    /// Feed raw bytes, returning one result per completed frame
    ///
    /// Malformed frames come back as errors; the decoder has already
    /// resynchronised on the terminator that ended them.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Result<ReceivedCommand, ProtocolError>> {
        let mut results = Vec::new();

        for &b in data {
            if self.escaped {
                self.escaped = false;
                self.push(b, &mut results);
                continue;
            }

            if b == self.format.escape {
                self.escaped = true;
                self.push(b, &mut results);
            } else if b == self.format.command_terminator {
                if self.discarding {
                    self.discarding = false;
                    self.pending.clear();
                    continue;
                }
                let body = std::mem::take(&mut self.pending);
                if body.iter().all(|c| c.is_ascii_whitespace()) {
                    continue;
                }
                let decoded = self.format.decode_body(&body);
                match &decoded {
                    Ok(cmd) => trace!("decoded frame: {}", cmd),
                    Err(e) => warn!("dropping frame {:?}: {}", String::from_utf8_lossy(&body), e),
                }
                results.push(decoded);
            } else {
                self.push(b, &mut results);
            }
        }

        results
    }

    fn push(&mut self, b: u8, results: &mut Vec<Result<ReceivedCommand, ProtocolError>>) {
        if self.discarding {
            return;
        }
        if self.pending.len() >= MAX_FRAME_SIZE {
            warn!(
                "frame exceeds {} bytes without terminator, skipping to next frame",
                MAX_FRAME_SIZE
            );
            self.pending.clear();
            self.discarding = true;
            results.push(Err(ProtocolError::FrameOverflow(MAX_FRAME_SIZE)));
            return;
        }
        self.pending.push(b);
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(FrameFormat::default())
    }
}
