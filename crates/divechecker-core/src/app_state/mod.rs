//! Device-wide state shared between the sampling and I/O contexts

mod identity;
mod link;

pub use identity::*;
pub use link::*;

/// Status indicator states driven by the board's LED.
///
/// The engine only ever selects one of these; turning them into colours is the
/// board's business.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusLed {
    Off,
    /// Power-on, before the sensor is probed
    Boot,
    /// Waiting for the USB host (blinks with `Off`)
    UsbWait,
    /// USB is up, no application session
    UsbReady,
    /// Application is pinging us
    AppConnected,
}
