//! Persistent device settings
//!
//! One 256-byte record in the last erase sector of the settings partition:
//!
//! ```text
//! [magic u32 LE "DIVF"][postcard(DeviceSettings)][0xFF padding]
//! ```
//!
//! A missing magic or an undecodable body means factory defaults. Saving
//! erases the whole sector before programming the record, so the flash holds
//! either the previous record, the new one, or (after a failed program) an
//! erased sector that loads as defaults.

mod ram_flash;

use embedded_storage::nor_flash::NorFlash;
use heapless::String;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use thiserror_no_std::Error;

use crate::config::{
    DEFAULT_DEVICE_NAME, DEFAULT_DEVICE_PIN, DEVICE_NAME_MAX_LEN, DEVICE_PIN_LEN,
    FLASH_SECTOR_SIZE, SETTINGS_MAGIC, SETTINGS_RECORD_SIZE,
};

pub use ram_flash::*;

const MAGIC_LEN: usize = 4;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageError {
    #[error("Flash erase failed")]
    Erase,
    #[error("Flash program failed")]
    Program,
    #[error("Settings do not fit the record")]
    Encode,
}

/// True for exactly four ASCII digits.
pub fn is_valid_pin(pin: &str) -> bool {
    pin.len() == DEVICE_PIN_LEN && pin.bytes().all(|b| b.is_ascii_digit())
}

/// Longest prefix of `name` that fits the name field without splitting a
/// UTF-8 sequence.
pub fn truncate_name(name: &str) -> &str {
    if name.len() <= DEVICE_NAME_MAX_LEN {
        return name;
    }
    let mut end = DEVICE_NAME_MAX_LEN;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DeviceSettings {
    pin: String<DEVICE_PIN_LEN>,
    name: String<DEVICE_NAME_MAX_LEN>,
}

impl DeviceSettings {
    pub fn pin(&self) -> &str {
        &self.pin
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Copy with a new name, truncated to fit.
    pub fn with_name(&self, name: &str) -> Self {
        let mut updated = self.clone();
        updated.name.clear();
        // Cannot fail: truncated to capacity above.
        let _ = updated.name.push_str(truncate_name(name));
        updated
    }

    /// Copy with a new PIN; `None` unless it is four digits.
    pub fn with_pin(&self, pin: &str) -> Option<Self> {
        if !is_valid_pin(pin) {
            return None;
        }
        let mut updated = self.clone();
        updated.pin = String::try_from(pin).ok()?;
        Some(updated)
    }

    fn is_valid(&self) -> bool {
        is_valid_pin(&self.pin) && !self.name.is_empty()
    }

    pub fn to_record(&self) -> Result<[u8; SETTINGS_RECORD_SIZE], StorageError> {
        let mut record = [0xFF; SETTINGS_RECORD_SIZE];
        record[..MAGIC_LEN].copy_from_slice(&SETTINGS_MAGIC.to_le_bytes());
        postcard::to_slice(self, &mut record[MAGIC_LEN..]).map_err(|e| {
            error!("Settings encode failed: {e:?}");
            StorageError::Encode
        })?;
        Ok(record)
    }

    /// Decode a record; `None` for a bad magic, body, or field value.
    pub fn from_record(record: &[u8; SETTINGS_RECORD_SIZE]) -> Option<Self> {
        let magic = u32::from_le_bytes([record[0], record[1], record[2], record[3]]);
        if magic != SETTINGS_MAGIC {
            return None;
        }
        postcard::from_bytes::<Self>(&record[MAGIC_LEN..])
            .ok()
            .filter(Self::is_valid)
    }
}

impl Default for DeviceSettings {
    fn default() -> Self {
        let mut settings = Self {
            pin: String::new(),
            name: String::new(),
        };
        let _ = settings.pin.push_str(DEFAULT_DEVICE_PIN);
        let _ = settings.name.push_str(DEFAULT_DEVICE_NAME);
        settings
    }
}

/// Cached settings record backed by NOR flash.
pub struct SettingsStore<F> {
    flash: F,
    offset: u32,
    current: DeviceSettings,
}

impl<F: NorFlash> SettingsStore<F> {
    /// Store at an explicit sector-aligned offset.
    pub fn new(flash: F, offset: u32) -> Self {
        Self {
            flash,
            offset,
            current: DeviceSettings::default(),
        }
    }

    /// Store in the last sector of `flash`.
    pub fn at_last_sector(flash: F) -> Self {
        let offset = flash.capacity() as u32 - FLASH_SECTOR_SIZE;
        Self::new(flash, offset)
    }

    /// Read the record into the cache, falling back to defaults.
    ///
    /// Never writes: a blank or corrupt sector is only replaced by the next
    /// explicit save.
    pub fn load(&mut self) -> &DeviceSettings {
        let mut record = [0u8; SETTINGS_RECORD_SIZE];
        self.current = match self.flash.read(self.offset, &mut record) {
            Ok(()) => match DeviceSettings::from_record(&record) {
                Some(settings) => {
                    info!("Loaded settings: name={}", settings.name());
                    settings
                }
                None => {
                    warn!("No valid settings record, using defaults");
                    DeviceSettings::default()
                }
            },
            Err(e) => {
                error!("Settings read failed: {e:?}");
                DeviceSettings::default()
            }
        };
        &self.current
    }

    pub fn settings(&self) -> &DeviceSettings {
        &self.current
    }

    pub fn verify_pin(&self, pin: &str) -> bool {
        self.current.pin() == pin
    }

    /// Erase the sector and program `settings`; the cache only changes once
    /// the program succeeded.
    pub fn save(&mut self, settings: DeviceSettings) -> Result<(), StorageError> {
        let record = settings.to_record()?;

        self.flash
            .erase(self.offset, self.offset + FLASH_SECTOR_SIZE)
            .map_err(|e| {
                error!("Settings erase failed: {e:?}");
                StorageError::Erase
            })?;
        self.flash.write(self.offset, &record).map_err(|e| {
            error!("Settings program failed: {e:?}");
            StorageError::Program
        })?;

        self.current = settings;
        Ok(())
    }

    pub fn set_name(&mut self, name: &str) -> Result<(), StorageError> {
        self.save(self.current.with_name(name))
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }

    pub fn flash_mut(&mut self) -> &mut F {
        &mut self.flash
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FLASH_LEN: usize = 2 * FLASH_SECTOR_SIZE as usize;

    fn store() -> SettingsStore<RamFlash<FLASH_LEN>> {
        SettingsStore::at_last_sector(RamFlash::new())
    }

    #[test]
    fn test_blank_flash_loads_defaults_without_writing() {
        let mut store = store();
        let settings = store.load().clone();
        assert_eq!(settings.name(), "DiveChecker");
        assert_eq!(settings.pin(), "0000");
        assert_eq!(store.flash().erase_count(), 0);
    }

    #[test]
    fn test_saved_record_survives_reload() {
        let mut store = store();
        store.load();
        store.set_name("Reef Diver").unwrap();
        let updated = store.settings().with_pin("4321").unwrap();
        store.save(updated).unwrap();

        let mut reopened = SettingsStore::at_last_sector(store.flash);
        let settings = reopened.load();
        assert_eq!(settings.name(), "Reef Diver");
        assert_eq!(settings.pin(), "4321");
    }

    #[test]
    fn test_record_layout() {
        let mut store = store();
        store.save(DeviceSettings::default()).unwrap();

        let page = &store.flash().as_bytes()[FLASH_SECTOR_SIZE as usize..];
        assert_eq!(&page[..4], &[0x46, 0x56, 0x49, 0x44]);
        assert!(page[64..SETTINGS_RECORD_SIZE].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_bad_magic_falls_back_to_defaults() {
        let mut store = store();
        store.set_name("Custom").unwrap();
        store.flash_mut().as_bytes_mut()[FLASH_SECTOR_SIZE as usize] = 0x00;

        assert_eq!(store.load().name(), "DiveChecker");
    }

    #[test]
    fn test_corrupt_pin_falls_back_to_defaults() {
        let mut record = DeviceSettings::default().to_record().unwrap();
        // Byte 4 is the pin length prefix, byte 5 its first digit.
        record[5] = b'x';
        assert_eq!(DeviceSettings::from_record(&record), None);
    }

    #[test]
    fn test_failed_program_keeps_cache() {
        let mut store = store();
        store.load();
        store.flash_mut().fail_write(true);

        assert_eq!(store.set_name("Lost"), Err(StorageError::Program));
        assert_eq!(store.settings().name(), "DiveChecker");
    }

    #[test]
    fn test_failed_erase_keeps_flash_and_cache() {
        let mut store = store();
        store.set_name("Kept").unwrap();
        store.flash_mut().fail_erase(true);

        assert_eq!(store.set_name("Other"), Err(StorageError::Erase));
        assert_eq!(store.settings().name(), "Kept");
        assert_eq!(store.load().name(), "Kept");
    }

    #[test]
    fn test_name_truncated_on_char_boundary() {
        // 23 ASCII bytes then a 2-byte character straddling the limit.
        let name = "abcdefghijklmnopqrstuvwé";
        assert_eq!(truncate_name(name), "abcdefghijklmnopqrstuvw");
        assert_eq!(truncate_name("short"), "short");

        let long = "x".repeat(40);
        assert_eq!(DeviceSettings::default().with_name(&long).name().len(), 24);
    }

    #[test]
    fn test_pin_validation() {
        assert!(is_valid_pin("0000"));
        assert!(is_valid_pin("9876"));
        assert!(!is_valid_pin("123"));
        assert!(!is_valid_pin("12345"));
        assert!(!is_valid_pin("12a4"));
        assert!(DeviceSettings::default().with_pin("12a4").is_none());
    }

    #[test]
    fn test_verify_pin() {
        let mut store = store();
        store.load();
        assert!(store.verify_pin("0000"));
        assert!(!store.verify_pin("1234"));
    }
}
