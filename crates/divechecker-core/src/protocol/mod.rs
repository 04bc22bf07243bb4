//! Host command model shared by both wire framings
//!
//! The line and SysEx decoders both produce a [`CommandFrame`]; the
//! [`CommandProtocol`] dispatcher validates it and answers with [`Reply`]
//! values, which each framing renders its own way.

mod dispatcher;
mod reply;

use heapless::Vec;
use thiserror_no_std::Error;

use crate::auth::NONCE_LEN;
use crate::sampling::InvalidRate;
use crate::storage::StorageError;

pub use dispatcher::*;
pub use reply::*;

/// Largest payload either framing can deliver (SysEx data area).
pub const MAX_PAYLOAD_LEN: usize = 251;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Ping,
    ResetBaseline,
    GetConfig,
    GetInfo,
    Diagnostic,
    Reboot,
    SetName,
    ChangePin,
    Auth,
    SetRate,
}

impl CommandKind {
    /// Map a line-mode command letter, case-insensitively.
    pub fn from_letter(letter: u8) -> Option<Self> {
        Some(match letter.to_ascii_uppercase() {
            b'P' => Self::Ping,
            b'R' => Self::ResetBaseline,
            b'C' => Self::GetConfig,
            b'I' => Self::GetInfo,
            b'T' => Self::Diagnostic,
            b'B' => Self::Reboot,
            b'N' => Self::SetName,
            b'W' => Self::ChangePin,
            b'A' => Self::Auth,
            b'F' => Self::SetRate,
            _ => return None,
        })
    }

    pub fn letter(self) -> u8 {
        match self {
            Self::Ping => b'P',
            Self::ResetBaseline => b'R',
            Self::GetConfig => b'C',
            Self::GetInfo => b'I',
            Self::Diagnostic => b'T',
            Self::Reboot => b'B',
            Self::SetName => b'N',
            Self::ChangePin => b'W',
            Self::Auth => b'A',
            Self::SetRate => b'F',
        }
    }

    /// Whether the line framing collects a payload up to end-of-line.
    pub fn takes_payload(self) -> bool {
        matches!(
            self,
            Self::SetName | Self::ChangePin | Self::Auth | Self::SetRate
        )
    }
}

/// How payload bytes are to be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadEncoding {
    /// ASCII as typed on the line transport: hex nonce, decimal rate.
    Text,
    /// 7-bit SysEx data: nibble nonce, raw rate byte.
    Binary,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    pub kind: CommandKind,
    pub payload: Vec<u8, MAX_PAYLOAD_LEN>,
    pub encoding: PayloadEncoding,
}

impl CommandFrame {
    pub fn new(kind: CommandKind, encoding: PayloadEncoding) -> Self {
        Self {
            kind,
            payload: Vec::new(),
            encoding,
        }
    }

    /// Frame with a payload; bytes past [`MAX_PAYLOAD_LEN`] are dropped.
    pub fn with_payload(kind: CommandKind, encoding: PayloadEncoding, payload: &[u8]) -> Self {
        let mut frame = Self::new(kind, encoding);
        let len = payload.len().min(MAX_PAYLOAD_LEN);
        // Cannot fail: clamped to capacity.
        let _ = frame.payload.extend_from_slice(&payload[..len]);
        frame
    }

    /// The 32-byte challenge, from 64 hex digits or 64 nibble bytes.
    pub fn nonce(&self) -> Option<[u8; NONCE_LEN]> {
        if self.payload.len() != NONCE_LEN * 2 {
            return None;
        }
        let digit = |b: u8| match self.encoding {
            PayloadEncoding::Text => (b as char).to_digit(16).map(|d| d as u8),
            PayloadEncoding::Binary => (b <= 0x0F).then_some(b),
        };

        let mut nonce = [0u8; NONCE_LEN];
        for (out, pair) in nonce.iter_mut().zip(self.payload.chunks_exact(2)) {
            *out = (digit(pair[0])? << 4) | digit(pair[1])?;
        }
        Some(nonce)
    }

    /// Requested output rate; unparsable input reads as 0 (and so fails
    /// range validation).
    pub fn rate(&self) -> u16 {
        match self.encoding {
            PayloadEncoding::Text => parse_leading_int(&self.payload),
            PayloadEncoding::Binary => self.payload.first().copied().unwrap_or(0) as u16,
        }
    }
}

/// Decimal prefix of `bytes` after optional leading whitespace and sign.
/// Negative values and overflow clamp into `0..=u16::MAX`.
fn parse_leading_int(bytes: &[u8]) -> u16 {
    let mut rest = bytes.trim_ascii_start();
    let negative = match rest.first() {
        Some(b'-') => {
            rest = &rest[1..];
            true
        }
        Some(b'+') => {
            rest = &rest[1..];
            false
        }
        _ => false,
    };

    let value = rest
        .iter()
        .take_while(|b| b.is_ascii_digit())
        .fold(0u32, |acc, &b| {
            acc.saturating_mul(10).saturating_add((b - b'0') as u32)
        });

    if negative {
        0
    } else {
        value.min(u16::MAX as u32) as u16
    }
}

/// Rejections reported back to the host. `Display` is the wire text.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Wrong PIN")]
    WrongPin,
    #[error("PIN must be 4 digits")]
    InvalidPinFormat,
    #[error("Rate must be 4-50Hz")]
    InvalidRate,
    #[error("Empty name")]
    EmptyName,
    #[error("Format {0}")]
    MalformedPayload(&'static str),
    #[error("Settings not saved")]
    Storage,
    #[error("Sensor not responding")]
    Sensor,
}

impl From<InvalidRate> for ProtocolError {
    fn from(_: InvalidRate) -> Self {
        Self::InvalidRate
    }
}

impl From<StorageError> for ProtocolError {
    fn from(_: StorageError) -> Self {
        Self::Storage
    }
}
