mod bmp280;
pub mod sim;

use thiserror_no_std::Error;

pub use bmp280::*;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorError {
    #[error("No BMP280/BME280 found (chip id 0x{chip_id:02X})")]
    NotFound { chip_id: u8 },
    #[error("I2C failure during {operation}")]
    Bus { operation: &'static str },
}

/// Trait for barometric sensors feeding the sampling pipeline.
pub trait PressureSensor {
    /// Whether initialization succeeded; readings are meaningless otherwise.
    fn is_ready(&self) -> bool;

    /// Read the compensated absolute pressure in hPa.
    ///
    /// Bus failures and an uninitialized sensor both yield `0.0`.
    fn read_pressure(&mut self) -> impl Future<Output = f32>;
}
