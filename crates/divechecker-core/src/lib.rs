//! Hardware-independent core of the DiveChecker pressure trainer
//!
//! This crate contains all platform-agnostic logic of the device firmware:
//! the BMP280 compensation driver, the sampling/averaging pipeline, the
//! connection liveness tracker, the command protocol shared by the ASCII line
//! and MIDI SysEx transports, ECDSA challenge-response signing and the
//! persistent settings record.
//!
//! It is `#![no_std]` so it compiles on both the ESP32-S3 firmware and desktop
//! hosts (for the simulator and tests).

#![cfg_attr(not(test), no_std)]

pub mod app_state;
pub mod async_i2c_bus;
pub mod auth;
pub mod config;
pub mod connection;
pub mod engine;
pub mod protocol;
pub mod sampling;
pub mod sensors;
pub mod storage;
pub mod transport;
