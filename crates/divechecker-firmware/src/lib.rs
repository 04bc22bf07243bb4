//! ESP32-S3 firmware-specific modules for DiveChecker
//!
//! This crate contains the code that cannot compile on desktop targets:
//! peripheral bring-up, the USB serial adapter, the board services the
//! protocol calls into, and the embassy tasks that run the engine.

#![no_std]

pub mod app_state;
pub mod device_key;
pub mod tasks;
