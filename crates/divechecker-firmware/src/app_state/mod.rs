//! Firmware-specific application state extensions
//!
//! Re-exports the hardware-independent app state from `divechecker_core` and
//! adds ESP32-S3 peripheral bring-up and the board services.

mod board;
mod hardware;

pub use board::*;
pub use hardware::*;

// Re-export all shared app state types from divechecker-core
pub use divechecker_core::app_state::*;
