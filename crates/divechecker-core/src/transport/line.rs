//! Newline-terminated ASCII command framing

use core::fmt::Write;

use heapless::Vec;
use log::trace;

use crate::protocol::{CommandFrame, CommandKind, PayloadEncoding, Reply};

use super::{FrameBuf, TransportError};

/// Payload bytes kept per command; the rest of an over-long line is dropped.
pub const LINE_PAYLOAD_MAX: usize = 71;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    Idle,
    Collecting(CommandKind),
}

/// Single letters act immediately; `N W A F` collect up to CR or LF.
pub struct LineDecoder {
    state: ParseState,
    buf: Vec<u8, LINE_PAYLOAD_MAX>,
}

impl LineDecoder {
    pub const fn new() -> Self {
        Self {
            state: ParseState::Idle,
            buf: Vec::new(),
        }
    }

    pub fn is_collecting(&self) -> bool {
        matches!(self.state, ParseState::Collecting(_))
    }

    pub fn push(&mut self, byte: u8) -> Option<CommandFrame> {
        match self.state {
            ParseState::Idle => {
                let kind = CommandKind::from_letter(byte)?;
                if kind.takes_payload() {
                    self.buf.clear();
                    self.state = ParseState::Collecting(kind);
                    None
                } else {
                    Some(CommandFrame::new(kind, PayloadEncoding::Text))
                }
            }
            ParseState::Collecting(kind) => {
                if byte == b'\n' || byte == b'\r' {
                    self.state = ParseState::Idle;
                    let frame = CommandFrame::with_payload(kind, PayloadEncoding::Text, &self.buf);
                    self.buf.clear();
                    Some(frame)
                } else {
                    if self.buf.push(byte).is_err() {
                        trace!("Command line overflow, dropping 0x{byte:02X}");
                    }
                    None
                }
            }
        }
    }
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Adapter so `core::fmt` can write straight into a frame buffer.
struct FrameWriter<'a>(&'a mut FrameBuf);

impl Write for FrameWriter<'_> {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        self.0
            .extend_from_slice(s.as_bytes())
            .map_err(|_| core::fmt::Error)
    }
}

/// Render `reply` as text terminated by `\n`.
pub fn encode(reply: &Reply<'_>, out: &mut FrameBuf) -> Result<(), TransportError> {
    out.clear();
    let mut w = FrameWriter(out);
    reply
        .write_text(&mut w)
        .and_then(|()| w.write_char('\n'))
        .map_err(|_| TransportError::Overflow)
}
