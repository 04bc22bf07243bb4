//! NOR flash held in RAM, with erase-before-program semantics.

use embedded_storage::nor_flash::{
    ErrorType, NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash, check_erase, check_read,
    check_write,
};

use crate::config::FLASH_SECTOR_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RamFlashError {
    Bounds(NorFlashErrorKind),
    Injected,
}

impl NorFlashError for RamFlashError {
    fn kind(&self) -> NorFlashErrorKind {
        match self {
            Self::Bounds(kind) => *kind,
            Self::Injected => NorFlashErrorKind::Other,
        }
    }
}

/// `N` bytes of erased (`0xFF`) flash. Programming can only clear bits.
pub struct RamFlash<const N: usize> {
    data: [u8; N],
    fail_erase: bool,
    fail_write: bool,
    erases: usize,
}

impl<const N: usize> RamFlash<N> {
    pub const fn new() -> Self {
        Self {
            data: [0xFF; N],
            fail_erase: false,
            fail_write: false,
            erases: 0,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn fail_erase(&mut self, fail: bool) {
        self.fail_erase = fail;
    }

    pub fn fail_write(&mut self, fail: bool) {
        self.fail_write = fail;
    }

    pub fn erase_count(&self) -> usize {
        self.erases
    }
}

impl<const N: usize> Default for RamFlash<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> ErrorType for RamFlash<N> {
    type Error = RamFlashError;
}

impl<const N: usize> ReadNorFlash for RamFlash<N> {
    const READ_SIZE: usize = 1;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        check_read(self, offset, bytes.len()).map_err(RamFlashError::Bounds)?;
        let start = offset as usize;
        bytes.copy_from_slice(&self.data[start..start + bytes.len()]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        N
    }
}

impl<const N: usize> NorFlash for RamFlash<N> {
    const WRITE_SIZE: usize = 4;
    const ERASE_SIZE: usize = FLASH_SECTOR_SIZE as usize;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        check_erase(self, from, to).map_err(RamFlashError::Bounds)?;
        if self.fail_erase {
            return Err(RamFlashError::Injected);
        }
        self.data[from as usize..to as usize].fill(0xFF);
        self.erases += 1;
        Ok(())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        check_write(self, offset, bytes.len()).map_err(RamFlashError::Bounds)?;
        if self.fail_write {
            return Err(RamFlashError::Injected);
        }
        let start = offset as usize;
        for (cell, byte) in self.data[start..start + bytes.len()].iter_mut().zip(bytes) {
            *cell &= byte;
        }
        Ok(())
    }
}
