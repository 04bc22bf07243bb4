//! Hardware initialization for the DiveChecker board
//!
//! Peripheral bring-up in dependency order: the I2C bus the BMP280 hangs off,
//! the USB serial link to the host, the settings flash, and the identity,
//! key fuses and entropy source the protocol needs.

use divechecker_core::app_state::DeviceIdentity;
use divechecker_core::async_i2c_bus::SharedI2cBus;
use divechecker_core::auth::{EntropySource, OtpImage, PRIVATE_KEY_LEN};
use divechecker_core::storage::SettingsStore;
use divechecker_core::transport::SharedSerial;
use embassy_sync::mutex::Mutex;
use embedded_io_async::{ErrorKind, ErrorType, Write};
use esp_hal::efuse::{Efuse, KEY0, KEY1, KEY2, KEY3, USER_DATA};
use esp_hal::i2c::master::{Config as I2cConfig, I2c};
use esp_hal::rng::Rng;
use esp_hal::time::Rate;
use esp_hal::usb_serial_jtag::{UsbSerialJtag, UsbSerialJtagRx, UsbSerialJtagTx};
use esp_hal::{Async, Blocking};
use esp_storage::FlashStorage;
use log::info;
use static_cell::StaticCell;

pub type I2cBus = I2c<'static, Async>;
pub type UsbRx = UsbSerialJtagRx<'static, Blocking>;
pub type SettingsFlash = FlashStorage<'static>;

/// Create the sensor I2C bus (400 kHz).
pub fn create_i2c_bus(
    i2c0: esp_hal::peripherals::I2C0<'static>,
    sda: esp_hal::peripherals::GPIO8<'static>,
    scl: esp_hal::peripherals::GPIO9<'static>,
) -> I2cBus {
    I2c::new(i2c0, I2cConfig::default().with_frequency(Rate::from_khz(400)))
        .expect("I2C0 config is valid")
        .with_sda(sda)
        .with_scl(scl)
        .into_async()
}

/// Put the bus behind a mutex so the sampler and the diagnostic can share it.
pub fn share_i2c_bus(i2c: I2cBus) -> &'static SharedI2cBus<I2cBus> {
    static I2C0_BUS: StaticCell<SharedI2cBus<I2cBus>> = StaticCell::new();
    I2C0_BUS.init(Mutex::new(i2c))
}

/// Transmit half of the USB serial link.
pub struct UsbTx(UsbSerialJtagTx<'static, Blocking>);

impl ErrorType for UsbTx {
    type Error = ErrorKind;
}

impl Write for UsbTx {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        self.0.write(buf).map_err(|_| ErrorKind::Other)?;
        Ok(buf.len())
    }

    async fn flush(&mut self) -> Result<(), Self::Error> {
        self.0.flush_tx().map_err(|_| ErrorKind::Other)
    }
}

/// Split the USB serial/JTAG peripheral into a receiver and a shared sender.
pub fn init_usb_serial(
    usb: esp_hal::peripherals::USB_DEVICE<'static>,
) -> (UsbRx, &'static SharedSerial<UsbTx>) {
    static USB_TX: StaticCell<SharedSerial<UsbTx>> = StaticCell::new();

    let (rx, tx) = UsbSerialJtag::new(usb).split();
    info!("USB serial ready");
    (rx, USB_TX.init(Mutex::new(UsbTx(tx))))
}

pub fn init_settings(flash: esp_hal::peripherals::FLASH<'static>) -> SettingsStore<SettingsFlash> {
    let mut settings = SettingsStore::at_last_sector(FlashStorage::new(flash));
    info!("Device name: {}", settings.load().name());
    settings
}

/// Serial number from the factory MAC in eFuse.
pub fn device_identity() -> DeviceIdentity {
    DeviceIdentity::from_unique_id(&Efuse::mac_address())
}

/// Key fuses mapped onto the OTP row layout.
///
/// `BLOCK_KEY0` holds the private key, `BLOCK_KEY1..=3` the public key and
/// the first two bytes of `BLOCK_USR_DATA` the programmed flag, high byte
/// first. The key blocks must be burnt with the `USER` purpose.
pub fn read_key_fuses() -> OtpImage {
    let private: [u8; PRIVATE_KEY_LEN] = Efuse::read_field_le(KEY0);

    let mut public = [0u8; 3 * 32];
    for (block, field) in public.chunks_exact_mut(32).zip([KEY1, KEY2, KEY3]) {
        block.copy_from_slice(&Efuse::read_field_le::<[u8; 32]>(field));
    }

    let user: [u8; 32] = Efuse::read_field_le(USER_DATA);
    let flag = u16::from_be_bytes([user[0], user[1]]);
    info!("Key fuses read, flag 0x{:04X}", flag);

    OtpImage::new(private, &public, flag)
}

/// Hardware TRNG seeding the signing DRBG.
pub struct HwEntropy(pub Rng);

impl EntropySource for HwEntropy {
    fn fill_bytes(&mut self, dest: &mut [u8]) {
        for chunk in dest.chunks_mut(4) {
            let word = self.0.random().to_le_bytes();
            chunk.copy_from_slice(&word[..chunk.len()]);
        }
    }
}
