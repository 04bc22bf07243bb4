//! Embassy tasks running the engine
//!
//! Dual-core builds run [`sampling_task`] on the app core and [`io_task`] on
//! the protocol core; `single-core` builds run [`cooperative_task`] alone.

use divechecker_core::async_i2c_bus::SharedI2cDevice;
use divechecker_core::engine::{CooperativeEngine, IoTask, SamplingTask};
use divechecker_core::sensors::Bmp280;
use divechecker_core::transport::SerialLink;
use embassy_time::{Delay, Duration, Instant, Ticker};
use log::info;

use crate::app_state::{FirmwareBoard, HwEntropy, I2cBus, SettingsFlash, UsbRx, UsbTx};
use crate::device_key::DeviceKey;

/// Engine loop period. Sampling itself runs on its own 10 ms cadence.
const STEP_PERIOD: Duration = Duration::from_millis(1);

pub type Sensor = Bmp280<SharedI2cDevice<'static, I2cBus>, Delay>;
pub type Io = IoTask<'static, SettingsFlash, DeviceKey, HwEntropy, FirmwareBoard>;
pub type Engine =
    CooperativeEngine<'static, Sensor, SettingsFlash, DeviceKey, HwEntropy, FirmwareBoard>;
pub type Serial = SerialLink<'static, UsbTx>;

#[embassy_executor::task]
pub async fn sampling_task(mut task: SamplingTask<'static, Sensor>) -> ! {
    info!("Sampling task started");
    let mut ticker = Ticker::every(STEP_PERIOD);
    loop {
        task.step(Instant::now().as_micros()).await;
        ticker.next().await;
    }
}

#[embassy_executor::task]
pub async fn io_task(mut io: Io, mut rx: UsbRx, mut out: Serial) -> ! {
    info!("I/O task started");
    let mut buf = [0u8; 64];
    let mut ticker = Ticker::every(STEP_PERIOD);
    loop {
        let n = rx.drain_rx_fifo(&mut buf);
        let now_ms = Instant::now().as_millis();
        io.receive(&buf[..n], now_ms, &mut out).await;
        io.service(now_ms, &mut out).await;
        ticker.next().await;
    }
}

#[embassy_executor::task]
pub async fn cooperative_task(mut engine: Engine, mut rx: UsbRx, mut out: Serial) -> ! {
    info!("Cooperative engine started");
    let mut buf = [0u8; 64];
    let mut ticker = Ticker::every(STEP_PERIOD);
    loop {
        let n = rx.drain_rx_fifo(&mut buf);
        engine
            .step(Instant::now().as_micros(), &buf[..n], &mut out)
            .await;
        ticker.next().await;
    }
}
