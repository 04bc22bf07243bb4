//! Averaging pipeline turning 100 Hz sensor readings into relative pressure
//!
//! Every output cycle the buffered readings are averaged. The first mean after
//! a connection (or an explicit reset) becomes the baseline; every later mean
//! is reported as `baseline` delta in milli-hPa.

use heapless::Vec;
use log::{debug, info};
use thiserror_no_std::Error;

use crate::app_state::LinkState;
use crate::config::{
    DEFAULT_OUTPUT_RATE_HZ, INTERNAL_SAMPLE_RATE_HZ, MAX_OUTPUT_RATE_HZ, MAX_SAMPLES_PER_OUTPUT,
    MIN_OUTPUT_RATE_HZ, SAMPLE_INTERVAL_US,
};
use crate::sensors::PressureSensor;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Rate must be 4-50Hz")]
pub struct InvalidRate;

/// Validated output rate in Hz.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputRate(u8);

impl OutputRate {
    pub const DEFAULT: Self = Self(DEFAULT_OUTPUT_RATE_HZ);

    pub fn new(hz: u16) -> Result<Self, InvalidRate> {
        if (MIN_OUTPUT_RATE_HZ as u16..=MAX_OUTPUT_RATE_HZ as u16).contains(&hz) {
            Ok(Self(hz as u8))
        } else {
            Err(InvalidRate)
        }
    }

    pub const fn hz(self) -> u8 {
        self.0
    }

    /// Readings averaged per output value.
    ///
    /// Integer division: rates that do not divide 100 evenly average fewer
    /// samples than the true cadence would allow. Kept as-is because the
    /// deadband is tuned to this behaviour.
    pub const fn samples_per_output(self) -> usize {
        (INTERNAL_SAMPLE_RATE_HZ / self.0 as u32) as usize
    }

    pub const fn interval_ms(self) -> u64 {
        1000 / self.0 as u64
    }
}

impl Default for OutputRate {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Relative pressure in milli-hPa, the unit placed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PressurePacket {
    pub delta_milli_hpa: i32,
}

impl PressurePacket {
    /// Scales a delta in hPa, truncating toward zero.
    ///
    /// Anything strictly inside ±1 milli-hPa is reported as 0.
    pub fn from_delta(delta_hpa: f32) -> Self {
        let scaled = delta_hpa * 1000.0;
        let delta_milli_hpa = if scaled > -1.0 && scaled < 1.0 {
            0
        } else {
            scaled as i32
        };
        Self { delta_milli_hpa }
    }
}

/// What one output cycle produced.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SampleEvent {
    /// A new baseline was taken; announced once per baseline.
    BaselineSet { hpa: f32 },
    Pressure(PressurePacket),
}

#[derive(Debug, Clone, Copy, Default)]
struct Baseline {
    hpa: f32,
    set: bool,
}

pub struct SamplingPipeline {
    buffer: Vec<f32, MAX_SAMPLES_PER_OUTPUT>,
    baseline: Baseline,
    rate: OutputRate,
    session_epoch: u32,
    last_sample_us: u64,
    last_output_ms: u64,
}

impl SamplingPipeline {
    pub const fn new() -> Self {
        Self {
            buffer: Vec::new(),
            baseline: Baseline {
                hpa: 0.0,
                set: false,
            },
            rate: OutputRate::DEFAULT,
            session_epoch: 0,
            last_sample_us: 0,
            last_output_ms: 0,
        }
    }

    pub fn output_rate(&self) -> OutputRate {
        self.rate
    }

    pub fn samples_per_output(&self) -> usize {
        self.rate.samples_per_output()
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn baseline(&self) -> Option<f32> {
        self.baseline.set.then_some(self.baseline.hpa)
    }

    fn is_full(&self) -> bool {
        self.buffer.len() >= self.samples_per_output()
    }

    /// Appends a reading unless this cycle already has enough.
    ///
    /// Returns `false` when the reading was dropped.
    pub fn push_reading(&mut self, hpa: f32) -> bool {
        if self.is_full() {
            return false;
        }
        self.buffer.push(hpa).is_ok()
    }

    /// Internal-rate tick: takes one reading if there is room for it.
    pub async fn tick_sample<S: PressureSensor>(&mut self, sensor: &mut S) {
        if self.is_full() {
            return;
        }
        let reading = sensor.read_pressure().await;
        self.push_reading(reading);
    }

    /// Output-rate tick: reduces the buffer to one event.
    pub fn tick_output(&mut self) -> Option<SampleEvent> {
        if self.buffer.is_empty() {
            return None;
        }

        let mean = self.buffer.iter().sum::<f32>() / self.buffer.len() as f32;
        self.buffer.clear();

        if !self.baseline.set {
            self.baseline = Baseline {
                hpa: mean,
                set: true,
            };
            info!("Baseline {mean:.3} hPa");
            return Some(SampleEvent::BaselineSet { hpa: mean });
        }

        Some(SampleEvent::Pressure(PressurePacket::from_delta(
            mean - self.baseline.hpa,
        )))
    }

    /// Validates and applies a new output rate, discarding the partial average.
    pub fn set_output_rate(&mut self, hz: u16) -> Result<OutputRate, InvalidRate> {
        let rate = OutputRate::new(hz)?;
        self.apply_output_rate(rate);
        Ok(rate)
    }

    fn apply_output_rate(&mut self, rate: OutputRate) {
        self.rate = rate;
        self.buffer.clear();
        debug!(
            "Output rate {}Hz ({} samples avg)",
            rate.hz(),
            rate.samples_per_output()
        );
    }

    /// Forgets the baseline; the next output cycle takes a new one.
    pub fn reset_baseline(&mut self) {
        self.baseline.set = false;
        self.buffer.clear();
    }

    /// Picks up requests posted by the I/O context.
    ///
    /// Returns whether sampling is enabled (a host is connected).
    pub fn sync(&mut self, link: &LinkState) -> bool {
        let epoch = link.session_epoch();
        if epoch != self.session_epoch {
            self.session_epoch = epoch;
            self.reset_baseline();
        }

        let rate = link.output_rate();
        if rate != self.rate {
            self.apply_output_rate(rate);
        }

        link.is_connected()
    }

    /// One iteration of the sampling loop at time `now_us`.
    ///
    /// Samples on the 10 ms internal cadence and reduces on the output
    /// interval. Nothing is sampled while disconnected or without a sensor.
    pub async fn step<S: PressureSensor>(
        &mut self,
        now_us: u64,
        sensor: &mut S,
        link: &LinkState,
    ) -> Option<SampleEvent> {
        if !self.sync(link) || !sensor.is_ready() {
            self.buffer.clear();
            return None;
        }

        if now_us.saturating_sub(self.last_sample_us) >= SAMPLE_INTERVAL_US {
            self.last_sample_us = now_us;
            self.tick_sample(sensor).await;
        }

        let now_ms = now_us / 1000;
        if now_ms.saturating_sub(self.last_output_ms) >= self.rate.interval_ms() {
            self.last_output_ms = now_ms;
            return self.tick_output();
        }

        None
    }
}

impl Default for SamplingPipeline {
    fn default() -> Self {
        Self::new()
    }
}
