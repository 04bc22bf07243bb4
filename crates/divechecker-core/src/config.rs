//! Build-time constants and runtime engine configuration

/// Firmware version reported by the `I` command and the SysEx device info.
pub const FW_VERSION: &str = "4.5.0";

// Sampling
pub const INTERNAL_SAMPLE_RATE_HZ: u32 = 100;
pub const SAMPLE_INTERVAL_US: u64 = 1_000_000 / INTERNAL_SAMPLE_RATE_HZ as u64;
pub const DEFAULT_OUTPUT_RATE_HZ: u8 = 8;
pub const MIN_OUTPUT_RATE_HZ: u8 = 4;
pub const MAX_OUTPUT_RATE_HZ: u8 = 50;
/// Buffer capacity: the slowest output rate averages the most samples.
pub const MAX_SAMPLES_PER_OUTPUT: usize =
    (INTERNAL_SAMPLE_RATE_HZ / MIN_OUTPUT_RATE_HZ as u32) as usize;

// Connection
pub const CONNECTION_TIMEOUT_MS: u64 = 3000;
pub const BEACON_INTERVAL_MS: u64 = 200;

/// Depth of the sampling → I/O packet queue.
pub const PRESSURE_QUEUE_SIZE: usize = 32;

// Device settings
pub const DEVICE_NAME_MAX_LEN: usize = 24;
pub const DEVICE_PIN_LEN: usize = 4;
pub const DEFAULT_DEVICE_NAME: &str = "DiveChecker";
pub const DEFAULT_DEVICE_PIN: &str = "0000";
/// Hex characters of the serial number (8 unique-id bytes at most).
pub const SERIAL_MAX_LEN: usize = 16;

// Flash layout: the settings live in the last 4 KiB sector of the partition.
pub const FLASH_SECTOR_SIZE: u32 = 4096;
pub const SETTINGS_RECORD_SIZE: usize = 256;
pub const SETTINGS_MAGIC: u32 = 0x4449_5646; // "DIVF"

// Delays
pub const SENSOR_POWER_UP_MS: u32 = 100;
pub const REBOOT_FLUSH_DELAY_MS: u32 = 200;

/// How the sampling and I/O halves of the engine are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulingMode {
    /// One loop interleaves sampling and I/O steps.
    #[default]
    Cooperative,
    /// Sampling owns one core/executor, I/O owns the other.
    DualContext,
}

/// Wire framing used for both requests and replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Framing {
    /// Newline-terminated ASCII lines.
    #[default]
    Line,
    /// MIDI System Exclusive frames.
    SysEx,
}

/// Where the ECDSA private key comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeySource {
    /// Key compiled into the image at build time.
    #[default]
    Compiled,
    /// Key programmed into one-time-programmable fuse rows.
    Otp,
}

/// Runtime selection of the engine variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EngineConfig {
    pub scheduling: SchedulingMode,
    pub framing: Framing,
    pub key_source: KeySource,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_engine_config() {
        let config = EngineConfig::default();
        assert_eq!(config.scheduling, SchedulingMode::Cooperative);
        assert_eq!(config.framing, Framing::Line);
        assert_eq!(config.key_source, KeySource::Compiled);
    }

    #[test]
    fn test_sample_buffer_covers_slowest_rate() {
        assert_eq!(MAX_SAMPLES_PER_OUTPUT, 25);
        assert_eq!(SAMPLE_INTERVAL_US, 10_000);
    }
}
