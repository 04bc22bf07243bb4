//! Async I2C bus sharing between the sampling and I/O contexts
//!
//! The sampling context owns the pressure driver, but the `T` diagnostic runs
//! from the I/O context against the same physical bus. Both hold a
//! [`SharedI2cDevice`] over one mutex so transactions never interleave.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex;
use embedded_hal_async::i2c::{ErrorType, I2c, Operation};

pub type SharedI2cBus<T> = Mutex<CriticalSectionRawMutex, T>;

/// One handle onto a shared bus.
///
/// The lock is held for a whole transaction and released between them, so a
/// long diagnostic only delays the sampler by one transfer at a time.
///
/// # Example
///
/// ```ignore
/// static I2C_BUS: StaticCell<SharedI2cBus<I2c<'static, Async>>> = StaticCell::new();
///
/// let bus = I2C_BUS.init(Mutex::new(i2c));
/// let sensor = Bmp280::new(SharedI2cDevice::new(bus), Delay);
/// let diag = SharedI2cDevice::new(bus);
/// ```
pub struct SharedI2cDevice<'a, T> {
    bus: &'a SharedI2cBus<T>,
}

impl<'a, T> SharedI2cDevice<'a, T> {
    #[inline]
    pub const fn new(bus: &'a SharedI2cBus<T>) -> Self {
        Self { bus }
    }
}

impl<T> Clone for SharedI2cDevice<'_, T> {
    fn clone(&self) -> Self {
        Self { bus: self.bus }
    }
}

impl<T> ErrorType for SharedI2cDevice<'_, T>
where
    T: ErrorType,
{
    type Error = T::Error;
}

impl<T> I2c for SharedI2cDevice<'_, T>
where
    T: I2c,
{
    #[inline]
    async fn read(&mut self, address: u8, read: &mut [u8]) -> Result<(), Self::Error> {
        let mut bus = self.bus.lock().await;
        bus.read(address, read).await
    }

    #[inline]
    async fn write(&mut self, address: u8, write: &[u8]) -> Result<(), Self::Error> {
        let mut bus = self.bus.lock().await;
        bus.write(address, write).await
    }

    /// The register pointer write and the data read stay under one lock.
    #[inline]
    async fn write_read(
        &mut self,
        address: u8,
        write: &[u8],
        read: &mut [u8],
    ) -> Result<(), Self::Error> {
        let mut bus = self.bus.lock().await;
        bus.write_read(address, write, read).await
    }

    #[inline]
    async fn transaction(
        &mut self,
        address: u8,
        operations: &mut [Operation<'_>],
    ) -> Result<(), Self::Error> {
        let mut bus = self.bus.lock().await;
        bus.transaction(address, operations).await
    }
}

// Safety: the handle only holds a shared reference to the mutex, which
// serializes every access to `T`.
unsafe impl<T: Send> Send for SharedI2cDevice<'_, T> {}
