use divechecker_core::app_state::StatusLed;
use divechecker_core::async_i2c_bus::SharedI2cDevice;
use divechecker_core::protocol::Board;
use divechecker_core::sensors::{BMP280_DEFAULT_ADDRESS, DiagnosticReport, SensorError, diagnose};
use embassy_time::{Delay, Timer};
use esp_hal::gpio::{Level, Output};
use log::info;

use super::I2cBus;

/// Board services for the I/O context.
pub struct FirmwareBoard {
    diag_bus: SharedI2cDevice<'static, I2cBus>,
    led: Output<'static>,
}

impl FirmwareBoard {
    pub fn new(diag_bus: SharedI2cDevice<'static, I2cBus>, led: Output<'static>) -> Self {
        Self { diag_bus, led }
    }
}

impl Board for FirmwareBoard {
    async fn run_diagnostic(&mut self) -> Result<DiagnosticReport, SensorError> {
        diagnose(&mut self.diag_bus, &mut Delay, BMP280_DEFAULT_ADDRESS).await
    }

    fn set_status(&mut self, status: StatusLed) {
        // Single-colour LED: lit once USB is up, off otherwise.
        let level = match status {
            StatusLed::Off | StatusLed::UsbWait => Level::Low,
            StatusLed::Boot | StatusLed::UsbReady | StatusLed::AppConnected => Level::High,
        };
        self.led.set_level(level);
    }

    async fn delay_ms(&mut self, ms: u32) {
        Timer::after_millis(ms.into()).await;
    }

    async fn reboot_to_loader(&mut self) {
        info!("Rebooting into the serial loader");
        // Latched in the RTC domain; the ROM enters the serial loader.
        esp_hal::peripherals::LPWR::regs()
            .option1()
            .modify(|_, w| w.force_download_boot().set_bit());
        esp_hal::system::software_reset();
    }
}
