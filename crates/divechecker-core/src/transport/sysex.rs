//! MIDI System Exclusive framing
//!
//! `F0 7D 01 <cmd> <7-bit data...> F7`. Manufacturer `0x7D` is the
//! non-commercial id, device `0x01` identifies this product.

use core::fmt::Write;

use heapless::{String, Vec};
use log::debug;

use crate::config::DEVICE_NAME_MAX_LEN;
use crate::protocol::{CommandFrame, CommandKind, MAX_PAYLOAD_LEN, PayloadEncoding, Reply};

use super::{FrameBuf, TransportError};

pub const SYSEX_START: u8 = 0xF0;
pub const SYSEX_END: u8 = 0xF7;
pub const MANUFACTURER_ID: u8 = 0x7D;
pub const DEVICE_ID: u8 = 0x01;

// Device -> host
pub const CMD_PRESSURE: u8 = 0x01;
pub const CMD_DEVICE_INFO: u8 = 0x02;
pub const CMD_CONFIG: u8 = 0x03;
pub const CMD_AUTH_RESPONSE: u8 = 0x04;
pub const CMD_SENSOR_STATUS: u8 = 0x05;
pub const CMD_INFO_TEXT: u8 = 0x06;
pub const CMD_ERROR_TEXT: u8 = 0x07;

// Both directions
pub const CMD_PING: u8 = 0x10;
pub const CMD_PONG: u8 = 0x11;

// Host -> device
pub const CMD_REQUEST_INFO: u8 = 0x20;
pub const CMD_SET_NAME: u8 = 0x21;
pub const CMD_SET_OUTPUT_RATE: u8 = 0x22;
pub const CMD_RESET_BASELINE: u8 = 0x23;
pub const CMD_AUTH_CHALLENGE: u8 = 0x30;
pub const CMD_SET_PIN: u8 = 0x31;

const FIRMWARE_FIELD_MAX: usize = 16;
const SERIAL_FIELD_MAX: usize = 24;

/// Host command byte to command kind.
///
/// `CONFIG` and `SENSOR_STATUS` double as requests for the configuration and
/// the sensor self test. Reboot has no binary form.
pub fn command_kind(command: u8) -> Option<CommandKind> {
    Some(match command {
        CMD_PING => CommandKind::Ping,
        CMD_REQUEST_INFO => CommandKind::GetInfo,
        CMD_SET_NAME => CommandKind::SetName,
        CMD_SET_OUTPUT_RATE => CommandKind::SetRate,
        CMD_RESET_BASELINE => CommandKind::ResetBaseline,
        CMD_AUTH_CHALLENGE => CommandKind::Auth,
        CMD_SET_PIN => CommandKind::ChangePin,
        CMD_CONFIG => CommandKind::GetConfig,
        CMD_SENSOR_STATUS => CommandKind::Diagnostic,
        _ => return None,
    })
}

/// Sign-magnitude, five 7-bit groups, most significant first. Bit 6 of the
/// first byte carries the sign.
pub fn encode_pressure(value: i32) -> [u8; 5] {
    let magnitude = value.unsigned_abs();
    let sign = if value < 0 { 0x40 } else { 0x00 };
    [
        ((magnitude >> 28) & 0x0F) as u8 | sign,
        ((magnitude >> 21) & 0x7F) as u8,
        ((magnitude >> 14) & 0x7F) as u8,
        ((magnitude >> 7) & 0x7F) as u8,
        (magnitude & 0x7F) as u8,
    ]
}

pub fn decode_pressure(data: &[u8; 5]) -> i32 {
    let magnitude = ((data[0] & 0x0F) as u32) << 28
        | ((data[1] & 0x7F) as u32) << 21
        | ((data[2] & 0x7F) as u32) << 14
        | ((data[3] & 0x7F) as u32) << 7
        | (data[4] & 0x7F) as u32;
    if data[0] & 0x40 != 0 {
        (magnitude as i32).wrapping_neg()
    } else {
        magnitude as i32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RxState {
    Idle,
    Manufacturer,
    Device,
    Command,
    Data,
}

pub struct SysExDecoder {
    state: RxState,
    command: u8,
    data: Vec<u8, MAX_PAYLOAD_LEN>,
    /// Payload outgrew `data`; the frame is dropped at its end marker.
    overflowed: bool,
}

impl SysExDecoder {
    pub const fn new() -> Self {
        Self {
            state: RxState::Idle,
            command: 0,
            data: Vec::new(),
            overflowed: false,
        }
    }

    pub fn push(&mut self, byte: u8) -> Option<CommandFrame> {
        // Real-time messages may interleave anywhere.
        if byte >= 0xF8 {
            return None;
        }

        match byte {
            SYSEX_START => {
                self.state = RxState::Manufacturer;
                self.data.clear();
                self.overflowed = false;
                return None;
            }
            SYSEX_END => {
                let complete = self.state == RxState::Data;
                self.state = RxState::Idle;
                return if complete { self.finish() } else { None };
            }
            0x80.. => {
                self.state = RxState::Idle;
                return None;
            }
            _ => {}
        }

        self.state = match self.state {
            RxState::Idle => RxState::Idle,
            RxState::Manufacturer if byte == MANUFACTURER_ID => RxState::Device,
            RxState::Device if byte == DEVICE_ID => RxState::Command,
            RxState::Manufacturer | RxState::Device => RxState::Idle,
            RxState::Command => {
                self.command = byte;
                RxState::Data
            }
            RxState::Data => {
                if self.data.push(byte).is_err() {
                    self.overflowed = true;
                }
                RxState::Data
            }
        };
        None
    }

    fn finish(&mut self) -> Option<CommandFrame> {
        if self.overflowed {
            debug!(
                "Dropping SysEx command 0x{:02X}: payload over {} bytes",
                self.command, MAX_PAYLOAD_LEN
            );
            return None;
        }
        let Some(kind) = command_kind(self.command) else {
            debug!("Ignoring SysEx command 0x{:02X}", self.command);
            return None;
        };
        Some(CommandFrame::with_payload(
            kind,
            PayloadEncoding::Binary,
            &self.data,
        ))
    }
}

impl Default for SysExDecoder {
    fn default() -> Self {
        Self::new()
    }
}

struct FrameBuilder<'a> {
    out: &'a mut FrameBuf,
}

impl<'a> FrameBuilder<'a> {
    fn start(out: &'a mut FrameBuf, command: u8) -> Result<Self, TransportError> {
        out.clear();
        out.extend_from_slice(&[SYSEX_START, MANUFACTURER_ID, DEVICE_ID, command])
            .map_err(|_| TransportError::Overflow)?;
        Ok(Self { out })
    }

    fn byte(&mut self, b: u8) -> Result<(), TransportError> {
        // Reserve room for the end marker.
        if self.out.len() + 1 >= self.out.capacity() {
            return Err(TransportError::Overflow);
        }
        self.out.push(b & 0x7F).map_err(|_| TransportError::Overflow)
    }

    fn bytes(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        bytes.iter().try_for_each(|&b| self.byte(b))
    }

    /// Text bytes; anything outside 7-bit ASCII becomes `?`.
    fn ascii(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        bytes
            .iter()
            .try_for_each(|&b| self.byte(if b.is_ascii() { b } else { b'?' }))
    }

    fn nibbles(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        bytes
            .iter()
            .try_for_each(|&b| self.bytes(&[b >> 4, b & 0x0F]))
    }

    /// Length-prefixed string, mapped like [`Self::ascii`].
    fn field(&mut self, s: &str, max: usize) -> Result<(), TransportError> {
        let bytes = &s.as_bytes()[..s.len().min(max)];
        self.byte(bytes.len() as u8)?;
        self.ascii(bytes)
    }

    fn end(self) -> Result<(), TransportError> {
        self.out
            .push(SYSEX_END)
            .map_err(|_| TransportError::Overflow)
    }
}

fn text_frame(
    out: &mut FrameBuf,
    command: u8,
    write: impl FnOnce(&mut String<200>) -> core::fmt::Result,
) -> Result<(), TransportError> {
    let mut text = String::<200>::new();
    write(&mut text).map_err(|_| TransportError::Overflow)?;
    let mut frame = FrameBuilder::start(out, command)?;
    frame.ascii(text.as_bytes())?;
    frame.end()
}

pub fn encode(reply: &Reply<'_>, out: &mut FrameBuf) -> Result<(), TransportError> {
    match reply {
        Reply::Pong => FrameBuilder::start(out, CMD_PONG)?.end(),
        Reply::Pressure(packet) => {
            let mut frame = FrameBuilder::start(out, CMD_PRESSURE)?;
            frame.bytes(&encode_pressure(packet.delta_milli_hpa))?;
            frame.end()
        }
        Reply::Config(rate) => {
            let mut frame = FrameBuilder::start(out, CMD_CONFIG)?;
            frame.byte(rate.hz())?;
            frame.end()
        }
        Reply::DeviceInfo(info) => {
            let mut frame = FrameBuilder::start(out, CMD_DEVICE_INFO)?;
            frame.field(info.serial, SERIAL_FIELD_MAX)?;
            frame.field(info.name, DEVICE_NAME_MAX_LEN)?;
            frame.field(info.firmware, FIRMWARE_FIELD_MAX)?;
            frame.byte(info.sensor_ok as u8)?;
            frame.end()
        }
        Reply::AuthOk(der) => {
            let mut frame = FrameBuilder::start(out, CMD_AUTH_RESPONSE)?;
            frame.nibbles(der)?;
            frame.end()
        }
        Reply::DiagnosticRegisters(report) => {
            let mut frame = FrameBuilder::start(out, CMD_SENSOR_STATUS)?;
            frame.byte(1)?;
            frame.nibbles(&[report.chip_id, report.ctrl_meas, report.config])?;
            frame.end()
        }
        Reply::Notice(notice) => text_frame(out, CMD_INFO_TEXT, |t| write!(t, "{notice}")),
        Reply::Error(e) => text_frame(out, CMD_ERROR_TEXT, |t| write!(t, "{e}")),
        Reply::AuthErr(e) => text_frame(out, CMD_ERROR_TEXT, |t| write!(t, "{e}")),
        Reply::Beacon { .. } | Reply::DiagnosticShot { .. } => {
            text_frame(out, CMD_INFO_TEXT, |t| reply.write_text(t))
        }
    }
}
