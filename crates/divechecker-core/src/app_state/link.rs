use core::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;

use crate::config::PRESSURE_QUEUE_SIZE;
use crate::sampling::{OutputRate, SampleEvent};

/// Bounded queue carrying reduced samples from the sampling context to the
/// I/O context. The producer only ever uses `try_send`.
pub type PressureChannel = Channel<CriticalSectionRawMutex, SampleEvent, PRESSURE_QUEUE_SIZE>;

/// Flags crossing the sampling/I/O boundary.
///
/// Single writer: every setter is called from the I/O context (protocol and
/// connection manager). The sampling context only reads. `sensor_ready` is the
/// one exception: the sampling context writes it once during boot, before the
/// I/O loop starts reading it.
pub struct LinkState {
    connected: AtomicBool,
    session_epoch: AtomicU32,
    output_rate: AtomicU8,
    sensor_ready: AtomicBool,
}

impl LinkState {
    pub const fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            session_epoch: AtomicU32::new(0),
            output_rate: AtomicU8::new(OutputRate::DEFAULT.hz()),
            sensor_ready: AtomicBool::new(false),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }

    /// Ask the sampling context to drop its baseline and partial buffer.
    ///
    /// The pipeline notices the new epoch on its next step.
    pub fn request_session_reset(&self) {
        self.session_epoch.fetch_add(1, Ordering::AcqRel);
    }

    pub fn session_epoch(&self) -> u32 {
        self.session_epoch.load(Ordering::Acquire)
    }

    pub fn output_rate(&self) -> OutputRate {
        OutputRate::new(self.output_rate.load(Ordering::Acquire).into()).unwrap_or_default()
    }

    pub fn set_output_rate(&self, rate: OutputRate) {
        self.output_rate.store(rate.hz(), Ordering::Release);
    }

    pub fn sensor_ready(&self) -> bool {
        self.sensor_ready.load(Ordering::Acquire)
    }

    pub fn mark_sensor_ready(&self, ready: bool) {
        self.sensor_ready.store(ready, Ordering::Release);
    }
}

impl Default for LinkState {
    fn default() -> Self {
        Self::new()
    }
}
