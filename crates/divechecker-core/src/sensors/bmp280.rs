//! Bosch BMP280 / BME280 pressure driver
//!
//! Only the pressure path is used. Temperature is compensated solely to obtain
//! `t_fine`, which the pressure formula needs.

use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::i2c::I2c;
use log::{debug, error, info, warn};

use super::{PressureSensor, SensorError};

pub const BMP280_DEFAULT_ADDRESS: u8 = 0x76;

pub const REG_CALIB_START: u8 = 0x88;
pub const REG_CHIP_ID: u8 = 0xD0;
pub const REG_RESET: u8 = 0xE0;
pub const REG_CTRL_MEAS: u8 = 0xF4;
pub const REG_CONFIG: u8 = 0xF5;
pub const REG_PRESS_MSB: u8 = 0xF7;

pub const CHIP_ID_BMP280: u8 = 0x58;
pub const CHIP_ID_BME280: u8 = 0x60;
pub const RESET_COMMAND: u8 = 0xB6;

/// Sleep mode, all measurements off.
pub const CTRL_MEAS_SLEEP: u8 = 0x00;
/// T x1, P x16, normal mode.
pub const CTRL_MEAS_NORMAL: u8 = 0x57;
/// T x1, P x16, single forced measurement.
pub const CTRL_MEAS_FORCED: u8 = 0x55;
/// Standby 0.5 ms, IIR filter x2.
pub const CONFIG_FILTERED: u8 = 0x04;
/// `osrs_p` bits of `ctrl_meas`.
pub const CTRL_MEAS_OSRS_P_MASK: u8 = 0x1C;

pub const CALIBRATION_LEN: usize = 24;
pub const DIAGNOSTIC_SHOTS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChipVariant {
    Bmp280,
    Bme280,
}

impl ChipVariant {
    pub fn from_chip_id(chip_id: u8) -> Option<Self> {
        match chip_id {
            CHIP_ID_BMP280 => Some(Self::Bmp280),
            CHIP_ID_BME280 => Some(Self::Bme280),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Bmp280 => "BMP280",
            Self::Bme280 => "BME280",
        }
    }
}

/// Factory trimming constants, read once after reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Calibration {
    pub t1: u16,
    pub t2: i16,
    pub t3: i16,
    pub p1: u16,
    pub p2: i16,
    pub p3: i16,
    pub p4: i16,
    pub p5: i16,
    pub p6: i16,
    pub p7: i16,
    pub p8: i16,
    pub p9: i16,
}

impl Calibration {
    /// Parse the little-endian block starting at `0x88`.
    pub fn from_bytes(raw: &[u8; CALIBRATION_LEN]) -> Self {
        let u = |i: usize| u16::from_le_bytes([raw[i], raw[i + 1]]);
        let s = |i: usize| i16::from_le_bytes([raw[i], raw[i + 1]]);

        Self {
            t1: u(0),
            t2: s(2),
            t3: s(4),
            p1: u(6),
            p2: s(8),
            p3: s(10),
            p4: s(12),
            p5: s(14),
            p6: s(16),
            p7: s(18),
            p8: s(20),
            p9: s(22),
        }
    }

    /// 32-bit temperature stage; returns `t_fine`.
    pub fn fine_temperature(&self, adc_t: i32) -> i32 {
        let t1 = self.t1 as i32;
        let var1 = ((adc_t >> 3) - (t1 << 1)).wrapping_mul(self.t2 as i32) >> 11;
        let d = (adc_t >> 4) - t1;
        let var2 = (d.wrapping_mul(d) >> 12).wrapping_mul(self.t3 as i32) >> 14;
        var1.wrapping_add(var2)
    }

    /// 64-bit pressure stage; returns Pa in Q24.8, or `None` when the
    /// divisor collapses to zero.
    pub fn compensate_pressure(&self, adc_p: i32, t_fine: i32) -> Option<i64> {
        let mut var1 = t_fine as i64 - 128_000;
        let mut var2 = var1.wrapping_mul(var1).wrapping_mul(self.p6 as i64);
        var2 = var2.wrapping_add(var1.wrapping_mul(self.p5 as i64) << 17);
        var2 = var2.wrapping_add((self.p4 as i64) << 35);
        var1 = (var1.wrapping_mul(var1).wrapping_mul(self.p3 as i64) >> 8)
            .wrapping_add(var1.wrapping_mul(self.p2 as i64) << 12);
        var1 = ((1i64 << 47).wrapping_add(var1)).wrapping_mul(self.p1 as i64) >> 33;

        if var1 == 0 {
            return None;
        }

        let mut p = 1_048_576 - adc_p as i64;
        p = ((p << 31).wrapping_sub(var2)).wrapping_mul(3125) / var1;
        var1 = (self.p9 as i64).wrapping_mul(p >> 13).wrapping_mul(p >> 13) >> 25;
        var2 = (self.p8 as i64).wrapping_mul(p) >> 19;
        Some((p.wrapping_add(var1).wrapping_add(var2) >> 8) + ((self.p7 as i64) << 4))
    }
}

/// One 6-byte burst from `0xF7`: raw pressure then raw temperature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawReading {
    pub bytes: [u8; 6],
}

impl RawReading {
    pub fn adc_p(&self) -> i32 {
        Self::adc20(&self.bytes[0..3])
    }

    pub fn adc_t(&self) -> i32 {
        Self::adc20(&self.bytes[3..6])
    }

    fn adc20(b: &[u8]) -> i32 {
        ((b[0] as i32) << 12) | ((b[1] as i32) << 4) | ((b[2] as i32) >> 4)
    }
}

/// Register snapshot and forced-mode dumps collected by [`diagnose`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiagnosticReport {
    pub chip_id: u8,
    pub ctrl_meas: u8,
    pub config: u8,
    /// `ctrl_meas` re-read after a recovery re-init, when one was needed.
    pub reinitialized: Option<u8>,
    pub shots: [RawReading; DIAGNOSTIC_SHOTS],
}

impl DiagnosticReport {
    pub fn pressure_was_disabled(&self) -> bool {
        self.reinitialized.is_some()
    }
}

async fn write_reg<I: I2c>(i2c: &mut I, address: u8, reg: u8, value: u8) -> Result<(), SensorError> {
    i2c.write(address, &[reg, value]).await.map_err(|e| {
        error!("BMP280 write 0x{reg:02X} failed: {e:?}");
        SensorError::Bus {
            operation: "register write",
        }
    })
}

async fn read_regs<I: I2c>(
    i2c: &mut I,
    address: u8,
    reg: u8,
    buf: &mut [u8],
) -> Result<(), SensorError> {
    i2c.write_read(address, &[reg], buf).await.map_err(|e| {
        error!("BMP280 read 0x{reg:02X} failed: {e:?}");
        SensorError::Bus {
            operation: "register read",
        }
    })
}

async fn read_reg<I: I2c>(i2c: &mut I, address: u8, reg: u8) -> Result<u8, SensorError> {
    let mut value = [0u8];
    read_regs(i2c, address, reg, &mut value).await?;
    Ok(value[0])
}

/// Sleep, configure, then start normal mode; `config` may only be written
/// while asleep.
async fn configure<I: I2c, D: DelayNs>(
    i2c: &mut I,
    delay: &mut D,
    address: u8,
    settle_ms: [u32; 3],
) -> Result<(), SensorError> {
    write_reg(i2c, address, REG_CTRL_MEAS, CTRL_MEAS_SLEEP).await?;
    delay.delay_ms(settle_ms[0]).await;
    write_reg(i2c, address, REG_CONFIG, CONFIG_FILTERED).await?;
    delay.delay_ms(settle_ms[1]).await;
    write_reg(i2c, address, REG_CTRL_MEAS, CTRL_MEAS_NORMAL).await?;
    delay.delay_ms(settle_ms[2]).await;
    Ok(())
}

/// Register dump and forced-mode self test.
///
/// Runs against its own bus handle so it can execute outside the sampling
/// context. Normal mode is restored before returning.
pub async fn diagnose<I: I2c, D: DelayNs>(
    i2c: &mut I,
    delay: &mut D,
    address: u8,
) -> Result<DiagnosticReport, SensorError> {
    let chip_id = read_reg(i2c, address, REG_CHIP_ID).await?;
    let ctrl_meas = read_reg(i2c, address, REG_CTRL_MEAS).await?;
    let config = read_reg(i2c, address, REG_CONFIG).await?;

    let reinitialized = if ctrl_meas & CTRL_MEAS_OSRS_P_MASK == 0 {
        warn!("Pressure disabled! Reinitializing...");
        configure(i2c, delay, address, [10, 10, 100]).await?;
        Some(read_reg(i2c, address, REG_CTRL_MEAS).await?)
    } else {
        None
    };

    let mut shots = [RawReading { bytes: [0; 6] }; DIAGNOSTIC_SHOTS];
    for shot in shots.iter_mut() {
        write_reg(i2c, address, REG_CTRL_MEAS, CTRL_MEAS_FORCED).await?;
        delay.delay_ms(50).await;
        read_regs(i2c, address, REG_PRESS_MSB, &mut shot.bytes).await?;
        delay.delay_ms(100).await;
    }

    write_reg(i2c, address, REG_CTRL_MEAS, CTRL_MEAS_NORMAL).await?;

    Ok(DiagnosticReport {
        chip_id,
        ctrl_meas,
        config,
        reinitialized,
        shots,
    })
}

pub struct Bmp280<I, D> {
    i2c: I,
    delay: D,
    address: u8,
    variant: Option<ChipVariant>,
    calibration: Option<Calibration>,
    t_fine: i32,
}

impl<I: I2c, D: DelayNs> Bmp280<I, D> {
    pub fn new(i2c: I, delay: D) -> Self {
        Self::with_address(i2c, delay, BMP280_DEFAULT_ADDRESS)
    }

    pub fn with_address(i2c: I, delay: D, address: u8) -> Self {
        Self {
            i2c,
            delay,
            address,
            variant: None,
            calibration: None,
            t_fine: 0,
        }
    }

    pub fn variant(&self) -> Option<ChipVariant> {
        self.variant
    }

    pub fn calibration(&self) -> Option<&Calibration> {
        self.calibration.as_ref()
    }

    /// Fine temperature from the most recent reading.
    pub fn t_fine(&self) -> i32 {
        self.t_fine
    }

    /// Identify, reset, load calibration and start normal-mode conversion.
    pub async fn init(&mut self) -> Result<ChipVariant, SensorError> {
        let chip_id = read_reg(&mut self.i2c, self.address, REG_CHIP_ID).await?;
        let variant = ChipVariant::from_chip_id(chip_id).ok_or_else(|| {
            error!("ChipID=0x{chip_id:02X} (Unknown)");
            SensorError::NotFound { chip_id }
        })?;
        info!("ChipID=0x{chip_id:02X} ({})", variant.name());

        write_reg(&mut self.i2c, self.address, REG_RESET, RESET_COMMAND).await?;
        self.delay.delay_ms(10).await;

        let mut raw = [0u8; CALIBRATION_LEN];
        read_regs(&mut self.i2c, self.address, REG_CALIB_START, &mut raw).await?;
        let calibration = Calibration::from_bytes(&raw);

        configure(&mut self.i2c, &mut self.delay, self.address, [5, 5, 50]).await?;

        let ctrl_meas = read_reg(&mut self.i2c, self.address, REG_CTRL_MEAS).await?;
        let config = read_reg(&mut self.i2c, self.address, REG_CONFIG).await?;
        info!("CTRL_MEAS=0x{ctrl_meas:02X} CONFIG=0x{config:02X} (X16+IIR2)");

        self.variant = Some(variant);
        self.calibration = Some(calibration);
        Ok(variant)
    }

    pub async fn read_raw(&mut self) -> Result<RawReading, SensorError> {
        let mut reading = RawReading { bytes: [0; 6] };
        read_regs(&mut self.i2c, self.address, REG_PRESS_MSB, &mut reading.bytes).await?;
        Ok(reading)
    }

    /// Run [`diagnose`] over this driver's own bus handle.
    pub async fn diagnose(&mut self) -> Result<DiagnosticReport, SensorError> {
        diagnose(&mut self.i2c, &mut self.delay, self.address).await
    }

    pub fn release(self) -> (I, D) {
        (self.i2c, self.delay)
    }
}

impl<I: I2c, D: DelayNs> PressureSensor for Bmp280<I, D> {
    fn is_ready(&self) -> bool {
        self.calibration.is_some()
    }

    async fn read_pressure(&mut self) -> f32 {
        let Some(calibration) = self.calibration else {
            return 0.0;
        };

        let raw = match self.read_raw().await {
            Ok(raw) => raw,
            Err(e) => {
                debug!("Pressure read dropped: {e}");
                return 0.0;
            }
        };

        self.t_fine = calibration.fine_temperature(raw.adc_t());
        match calibration.compensate_pressure(raw.adc_p(), self.t_fine) {
            Some(q24_8) => q24_8 as f32 / 25600.0,
            None => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensors::sim::{
        Bmp280RegisterModel, DATASHEET_ADC_P, DATASHEET_ADC_T, NoDelay, datasheet_calibration,
    };
    use embassy_futures::block_on;

    #[test]
    fn test_calibration_parses_little_endian() {
        let calib = datasheet_calibration();
        let mut raw = [0u8; CALIBRATION_LEN];
        let words: [u16; 12] = [
            calib.t1,
            calib.t2 as u16,
            calib.t3 as u16,
            calib.p1,
            calib.p2 as u16,
            calib.p3 as u16,
            calib.p4 as u16,
            calib.p5 as u16,
            calib.p6 as u16,
            calib.p7 as u16,
            calib.p8 as u16,
            calib.p9 as u16,
        ];
        for (chunk, word) in raw.chunks_exact_mut(2).zip(words) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        assert_eq!(Calibration::from_bytes(&raw), calib);
    }

    #[test]
    fn test_datasheet_fine_temperature() {
        assert_eq!(
            datasheet_calibration().fine_temperature(DATASHEET_ADC_T),
            128_422
        );
    }

    #[test]
    fn test_datasheet_pressure() {
        let calib = datasheet_calibration();
        let t_fine = calib.fine_temperature(DATASHEET_ADC_T);
        assert_eq!(
            calib.compensate_pressure(DATASHEET_ADC_P, t_fine),
            Some(25_767_233)
        );
    }

    #[test]
    fn test_zero_p1_yields_no_pressure() {
        let calib = Calibration {
            p1: 0,
            ..datasheet_calibration()
        };
        assert_eq!(calib.compensate_pressure(DATASHEET_ADC_P, 128_422), None);
    }

    #[test]
    fn test_raw_reading_unpacks_20_bit_codes() {
        let raw = RawReading {
            bytes: [0x65, 0x5A, 0xC0, 0x7E, 0xED, 0x00],
        };
        assert_eq!(raw.adc_p(), 415_148);
        assert_eq!(raw.adc_t(), 519_888);
    }

    #[test]
    fn test_init_and_read_pressure() {
        let mut sensor = Bmp280::new(Bmp280RegisterModel::datasheet(), NoDelay);
        assert!(!sensor.is_ready());
        assert_eq!(block_on(sensor.read_pressure()), 0.0);

        assert_eq!(block_on(sensor.init()), Ok(ChipVariant::Bmp280));
        assert!(sensor.is_ready());

        let hpa = block_on(sensor.read_pressure());
        assert!((hpa - 1006.5325).abs() < 0.001, "got {hpa}");
        assert_eq!(sensor.t_fine(), 128_422);

        let (bus, _) = sensor.release();
        assert_eq!(bus.register(REG_CTRL_MEAS), CTRL_MEAS_NORMAL);
        assert_eq!(bus.register(REG_CONFIG), CONFIG_FILTERED);
        assert!(bus.reset_count() >= 1);
    }

    #[test]
    fn test_bme280_is_accepted() {
        let mut model = Bmp280RegisterModel::datasheet();
        model.set_register(REG_CHIP_ID, CHIP_ID_BME280);
        let mut sensor = Bmp280::new(model, NoDelay);
        assert_eq!(block_on(sensor.init()), Ok(ChipVariant::Bme280));
    }

    #[test]
    fn test_unknown_chip_is_not_found() {
        let mut model = Bmp280RegisterModel::datasheet();
        model.set_register(REG_CHIP_ID, 0x55);
        let mut sensor = Bmp280::new(model, NoDelay);
        assert_eq!(
            block_on(sensor.init()),
            Err(SensorError::NotFound { chip_id: 0x55 })
        );
        assert!(!sensor.is_ready());
    }

    #[test]
    fn test_bus_error_reads_zero() {
        let mut sensor = Bmp280::new(Bmp280RegisterModel::datasheet(), NoDelay);
        block_on(sensor.init()).unwrap();

        let (mut bus, delay) = sensor.release();
        bus.set_failing(true);
        let mut sensor = Bmp280::new(bus, delay);
        // Re-init fails on the bus, so the driver stays unready and reads 0.
        assert!(block_on(sensor.init()).is_err());
        assert_eq!(block_on(sensor.read_pressure()), 0.0);
    }

    #[test]
    fn test_diagnose_healthy_sensor() {
        let mut sensor = Bmp280::new(Bmp280RegisterModel::datasheet(), NoDelay);
        block_on(sensor.init()).unwrap();

        let report = block_on(sensor.diagnose()).unwrap();
        assert_eq!(report.chip_id, CHIP_ID_BMP280);
        assert_eq!(report.ctrl_meas, CTRL_MEAS_NORMAL);
        assert_eq!(report.config, CONFIG_FILTERED);
        assert!(!report.pressure_was_disabled());
        for shot in report.shots {
            assert_eq!(shot.adc_p(), DATASHEET_ADC_P);
            assert_eq!(shot.adc_t(), DATASHEET_ADC_T);
        }

        let (bus, _) = sensor.release();
        assert_eq!(bus.forced_triggers(), DIAGNOSTIC_SHOTS);
        assert_eq!(bus.register(REG_CTRL_MEAS), CTRL_MEAS_NORMAL);
    }

    #[test]
    fn test_diagnose_recovers_disabled_pressure() {
        let mut model = Bmp280RegisterModel::datasheet();
        // Normal mode with pressure oversampling skipped.
        model.set_register(REG_CTRL_MEAS, 0x23);
        let mut delay = NoDelay;

        let report = block_on(diagnose(&mut model, &mut delay, BMP280_DEFAULT_ADDRESS)).unwrap();
        assert_eq!(report.ctrl_meas, 0x23);
        assert_eq!(report.reinitialized, Some(CTRL_MEAS_NORMAL));
        assert_eq!(model.register(REG_CTRL_MEAS), CTRL_MEAS_NORMAL);
    }
}
