//! Register-level BMP280 model used by the tests and the desktop simulator.

use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::i2c::{
    Error, ErrorKind, ErrorType, I2c, NoAcknowledgeSource, Operation,
};

use super::bmp280::{
    BMP280_DEFAULT_ADDRESS, CHIP_ID_BMP280, CTRL_MEAS_FORCED, Calibration, REG_CALIB_START,
    REG_CHIP_ID, REG_CONFIG, REG_CTRL_MEAS, REG_PRESS_MSB, REG_RESET, RESET_COMMAND,
};

/// Raw pressure code of the Bosch datasheet worked example.
pub const DATASHEET_ADC_P: i32 = 415_148;
/// Raw temperature code of the Bosch datasheet worked example.
pub const DATASHEET_ADC_T: i32 = 519_888;

/// Calibration of the Bosch datasheet worked example.
pub const fn datasheet_calibration() -> Calibration {
    Calibration {
        t1: 27504,
        t2: 26435,
        t3: -1000,
        p1: 36477,
        p2: -10685,
        p3: 3024,
        p4: 2855,
        p5: 140,
        p6: -7,
        p7: 15500,
        p8: -14600,
        p9: 6000,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimBusError {
    NoAcknowledge,
    Injected,
}

impl Error for SimBusError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::NoAcknowledge => ErrorKind::NoAcknowledge(NoAcknowledgeSource::Address),
            Self::Injected => ErrorKind::Other,
        }
    }
}

/// 256-byte register file with an auto-incrementing pointer.
pub struct Bmp280RegisterModel {
    address: u8,
    regs: [u8; 256],
    pointer: u8,
    failing: bool,
    resets: usize,
    forced_triggers: usize,
}

impl Bmp280RegisterModel {
    pub fn new(calibration: &Calibration) -> Self {
        let mut model = Self {
            address: BMP280_DEFAULT_ADDRESS,
            regs: [0; 256],
            pointer: 0,
            failing: false,
            resets: 0,
            forced_triggers: 0,
        };
        model.regs[REG_CHIP_ID as usize] = CHIP_ID_BMP280;

        let words: [u16; 12] = [
            calibration.t1,
            calibration.t2 as u16,
            calibration.t3 as u16,
            calibration.p1,
            calibration.p2 as u16,
            calibration.p3 as u16,
            calibration.p4 as u16,
            calibration.p5 as u16,
            calibration.p6 as u16,
            calibration.p7 as u16,
            calibration.p8 as u16,
            calibration.p9 as u16,
        ];
        let start = REG_CALIB_START as usize;
        for (i, word) in words.iter().enumerate() {
            model.regs[start + 2 * i..start + 2 * i + 2].copy_from_slice(&word.to_le_bytes());
        }
        model
    }

    /// Model loaded with the datasheet example calibration and raw codes.
    pub fn datasheet() -> Self {
        let mut model = Self::new(&datasheet_calibration());
        model.set_raw(DATASHEET_ADC_P, DATASHEET_ADC_T);
        model
    }

    /// Place 20-bit raw codes in the data registers.
    pub fn set_raw(&mut self, adc_p: i32, adc_t: i32) {
        let base = REG_PRESS_MSB as usize;
        for (offset, adc) in [(0, adc_p), (3, adc_t)] {
            self.regs[base + offset] = (adc >> 12) as u8;
            self.regs[base + offset + 1] = (adc >> 4) as u8;
            self.regs[base + offset + 2] = ((adc & 0x0F) << 4) as u8;
        }
    }

    pub fn set_register(&mut self, reg: u8, value: u8) {
        self.regs[reg as usize] = value;
    }

    pub fn register(&self, reg: u8) -> u8 {
        self.regs[reg as usize]
    }

    /// Make every following transaction fail.
    pub fn set_failing(&mut self, failing: bool) {
        self.failing = failing;
    }

    pub fn reset_count(&self) -> usize {
        self.resets
    }

    pub fn forced_triggers(&self) -> usize {
        self.forced_triggers
    }

    fn write_register(&mut self, reg: u8, value: u8) {
        match reg {
            REG_RESET if value == RESET_COMMAND => {
                self.resets += 1;
                self.regs[REG_CTRL_MEAS as usize] = 0;
                self.regs[REG_CONFIG as usize] = 0;
            }
            REG_RESET => {}
            REG_CTRL_MEAS => {
                if value & 0x03 == CTRL_MEAS_FORCED & 0x03 {
                    self.forced_triggers += 1;
                }
                self.regs[reg as usize] = value;
            }
            REG_CONFIG => self.regs[reg as usize] = value,
            // Calibration, id and data registers are read-only.
            _ => {}
        }
    }
}

impl ErrorType for Bmp280RegisterModel {
    type Error = SimBusError;
}

impl I2c for Bmp280RegisterModel {
    async fn transaction(
        &mut self,
        address: u8,
        operations: &mut [Operation<'_>],
    ) -> Result<(), Self::Error> {
        if self.failing {
            return Err(SimBusError::Injected);
        }
        if address != self.address {
            return Err(SimBusError::NoAcknowledge);
        }

        for op in operations {
            match op {
                Operation::Write(bytes) => {
                    if let Some((&reg, values)) = bytes.split_first() {
                        self.pointer = reg;
                        for &value in values {
                            self.write_register(self.pointer, value);
                            self.pointer = self.pointer.wrapping_add(1);
                        }
                    }
                }
                Operation::Read(buf) => {
                    for byte in buf.iter_mut() {
                        *byte = self.regs[self.pointer as usize];
                        self.pointer = self.pointer.wrapping_add(1);
                    }
                }
            }
        }
        Ok(())
    }
}

/// Delay that returns immediately.
pub struct NoDelay;

impl DelayNs for NoDelay {
    async fn delay_ns(&mut self, _ns: u32) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_futures::block_on;

    #[test]
    fn test_burst_read_auto_increments() {
        let mut model = Bmp280RegisterModel::datasheet();
        let mut buf = [0u8; 6];
        block_on(model.write_read(BMP280_DEFAULT_ADDRESS, &[REG_PRESS_MSB], &mut buf)).unwrap();
        assert_eq!(buf, [0x65, 0x5A, 0xC0, 0x7E, 0xED, 0x00]);
    }

    #[test]
    fn test_wrong_address_is_nacked() {
        let mut model = Bmp280RegisterModel::datasheet();
        let mut buf = [0u8; 1];
        assert_eq!(
            block_on(model.write_read(0x77, &[REG_CHIP_ID], &mut buf)),
            Err(SimBusError::NoAcknowledge)
        );
    }

    #[test]
    fn test_reset_clears_control_registers() {
        let mut model = Bmp280RegisterModel::datasheet();
        model.set_register(REG_CTRL_MEAS, 0x57);
        block_on(model.write(BMP280_DEFAULT_ADDRESS, &[REG_RESET, RESET_COMMAND])).unwrap();
        assert_eq!(model.register(REG_CTRL_MEAS), 0);
        assert_eq!(model.reset_count(), 1);
    }
}
