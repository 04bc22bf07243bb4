use core::fmt::Write;

use heapless::String;

use crate::config::SERIAL_MAX_LEN;

/// Read-only identity derived once at boot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    serial: String<SERIAL_MAX_LEN>,
}

impl DeviceIdentity {
    /// Builds the serial number as upper-case hex of the chip's unique id.
    ///
    /// Only the first eight bytes are used.
    pub fn from_unique_id(unique_id: &[u8]) -> Self {
        let mut serial = String::new();
        for byte in unique_id.iter().take(SERIAL_MAX_LEN / 2) {
            // Cannot overflow: capacity is two characters per byte taken.
            let _ = write!(serial, "{byte:02X}");
        }
        Self { serial }
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }
}
