//! Settings flash persisted to a file between simulator runs.
//!
//! The image lives in a [`RamFlash`] and is written back whole after every
//! erase or program, so the file always mirrors what the chip would hold.

use std::fs;
use std::io;
use std::path::PathBuf;

use divechecker_core::config::FLASH_SECTOR_SIZE;
use divechecker_core::storage::{RamFlash, RamFlashError};
use embedded_storage::nor_flash::{
    ErrorType, NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash,
};
use log::{info, warn};

pub const FLASH_LEN: usize = FLASH_SECTOR_SIZE as usize;

#[derive(Debug)]
pub enum FileFlashError {
    Flash(RamFlashError),
    Io(io::ErrorKind),
}

impl NorFlashError for FileFlashError {
    fn kind(&self) -> NorFlashErrorKind {
        match self {
            Self::Flash(e) => e.kind(),
            Self::Io(_) => NorFlashErrorKind::Other,
        }
    }
}

pub struct FileFlash {
    path: PathBuf,
    flash: RamFlash<FLASH_LEN>,
}

impl FileFlash {
    /// Open the image at `path`. A missing or wrongly sized file reads as
    /// erased flash and is only created by the first save.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut flash = RamFlash::new();
        match fs::read(&path) {
            Ok(bytes) if bytes.len() == FLASH_LEN => {
                flash.as_bytes_mut().copy_from_slice(&bytes);
                info!("Settings flash loaded from {}", path.display());
            }
            Ok(bytes) => warn!(
                "Ignoring {}: {} bytes, expected {}",
                path.display(),
                bytes.len(),
                FLASH_LEN
            ),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!("No settings flash at {}, starting erased", path.display());
            }
            Err(e) => warn!("Cannot read {}: {e}", path.display()),
        }
        Self { path, flash }
    }

    fn persist(&self) -> Result<(), FileFlashError> {
        fs::write(&self.path, self.flash.as_bytes()).map_err(|e| {
            warn!("Cannot write {}: {e}", self.path.display());
            FileFlashError::Io(e.kind())
        })
    }
}

impl ErrorType for FileFlash {
    type Error = FileFlashError;
}

impl ReadNorFlash for FileFlash {
    const READ_SIZE: usize = RamFlash::<FLASH_LEN>::READ_SIZE;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        self.flash.read(offset, bytes).map_err(FileFlashError::Flash)
    }

    fn capacity(&self) -> usize {
        self.flash.capacity()
    }
}

impl NorFlash for FileFlash {
    const WRITE_SIZE: usize = RamFlash::<FLASH_LEN>::WRITE_SIZE;
    const ERASE_SIZE: usize = RamFlash::<FLASH_LEN>::ERASE_SIZE;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        self.flash.erase(from, to).map_err(FileFlashError::Flash)?;
        self.persist()
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        self.flash.write(offset, bytes).map_err(FileFlashError::Flash)?;
        self.persist()
    }
}
