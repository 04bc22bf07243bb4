//! Byte-level framings over the USB serial link
//!
//! The device speaks either newline-terminated ASCII or MIDI SysEx, picked
//! at build time through [`Framing`]. Both produce [`CommandFrame`]s for the
//! dispatcher and render [`Reply`] values back into a [`FrameBuf`].

pub mod line;
pub mod sysex;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex;
use embedded_io_async::Write;
use log::error;
use thiserror_no_std::Error;

use crate::config::Framing;
use crate::protocol::{CommandFrame, Reply, ReplySink};

use line::LineDecoder;
use sysex::SysExDecoder;

/// One encoded reply, ready for the wire.
pub type FrameBuf = heapless::Vec<u8, 256>;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    #[error("Frame does not fit the output buffer")]
    Overflow,
    #[error("Serial write failed")]
    Write,
}

pub enum Decoder {
    Line(LineDecoder),
    SysEx(SysExDecoder),
}

impl Decoder {
    pub const fn new(framing: Framing) -> Self {
        match framing {
            Framing::Line => Self::Line(LineDecoder::new()),
            Framing::SysEx => Self::SysEx(SysExDecoder::new()),
        }
    }

    pub fn push(&mut self, byte: u8) -> Option<CommandFrame> {
        match self {
            Self::Line(decoder) => decoder.push(byte),
            Self::SysEx(decoder) => decoder.push(byte),
        }
    }
}

pub fn encode(framing: Framing, reply: &Reply<'_>, out: &mut FrameBuf) -> Result<(), TransportError> {
    match framing {
        Framing::Line => line::encode(reply, out),
        Framing::SysEx => sysex::encode(reply, out),
    }
}

/// Serial port shared by every reply producer.
///
/// Each reply is written under the lock, so frames never interleave even when
/// several contexts send.
pub type SharedSerial<W> = Mutex<CriticalSectionRawMutex, W>;

/// [`ReplySink`] that encodes into a local buffer and writes whole frames.
pub struct SerialLink<'a, W> {
    port: &'a SharedSerial<W>,
    framing: Framing,
    buf: FrameBuf,
}

impl<'a, W: Write> SerialLink<'a, W> {
    pub fn new(port: &'a SharedSerial<W>, framing: Framing) -> Self {
        Self {
            port,
            framing,
            buf: FrameBuf::new(),
        }
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    pub async fn write_reply(&mut self, reply: &Reply<'_>) -> Result<(), TransportError> {
        encode(self.framing, reply, &mut self.buf)?;

        let mut port = self.port.lock().await;
        port.write_all(&self.buf).await.map_err(|e| {
            error!("Serial write failed: {:?}", e);
            TransportError::Write
        })?;
        port.flush().await.map_err(|e| {
            error!("Serial flush failed: {:?}", e);
            TransportError::Write
        })
    }
}

impl<W: Write> ReplySink for SerialLink<'_, W> {
    async fn send(&mut self, reply: Reply<'_>) {
        // A lost reply is recovered by the host's own retry or ping timeout.
        if let Err(e) = self.write_reply(&reply).await {
            error!("Reply dropped: {}", e);
        }
    }
}
