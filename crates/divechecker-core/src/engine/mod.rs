//! Sampling and I/O loops, shared by both scheduling modes
//!
//! [`SamplingTask`] owns the sensor and pushes reduced samples into the
//! [`PressureChannel`]. [`IoTask`] owns the protocol, feeds it decoded frames
//! and drains the channel towards the host. On a dual-core target each runs
//! on its own executor; [`CooperativeEngine`] interleaves them in one loop.

use embassy_sync::channel::TrySendError;
use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::i2c::I2c;
use embedded_storage::nor_flash::NorFlash;
use log::{error, info, trace};

use crate::app_state::{LinkState, PressureChannel};
use crate::auth::{EntropySource, KeyProvider};
use crate::config::{Framing, SENSOR_POWER_UP_MS};
use crate::protocol::{Board, CommandProtocol, ReplySink};
use crate::sampling::SamplingPipeline;
use crate::sensors::{Bmp280, ChipVariant, PressureSensor, SensorError};
use crate::transport::Decoder;

/// Power-up wait, then identify and configure the sensor.
///
/// The outcome is published through [`LinkState::mark_sensor_ready`]; a
/// missing sensor leaves the device running so the host can still query it.
pub async fn start_sensor<I, D, W>(
    sensor: &mut Bmp280<I, D>,
    delay: &mut W,
    link: &LinkState,
) -> Result<ChipVariant, SensorError>
where
    I: I2c,
    D: DelayNs,
    W: DelayNs,
{
    delay.delay_ms(SENSOR_POWER_UP_MS).await;

    let result = sensor.init().await;
    match &result {
        Ok(variant) => info!("{} ready", variant.name()),
        Err(e) => error!("Sensor init failed: {e}"),
    }
    link.mark_sensor_ready(result.is_ok());
    result
}

/// Producer half: sensor reads and averaging.
pub struct SamplingTask<'a, S> {
    pipeline: SamplingPipeline,
    sensor: S,
    link: &'a LinkState,
    channel: &'a PressureChannel,
}

impl<'a, S: PressureSensor> SamplingTask<'a, S> {
    pub fn new(sensor: S, link: &'a LinkState, channel: &'a PressureChannel) -> Self {
        Self {
            pipeline: SamplingPipeline::new(),
            sensor,
            link,
            channel,
        }
    }

    pub fn pipeline(&self) -> &SamplingPipeline {
        &self.pipeline
    }

    pub fn sensor_mut(&mut self) -> &mut S {
        &mut self.sensor
    }

    /// Run one pipeline iteration. Returns whether an event was queued.
    ///
    /// Never waits on the consumer: with the channel full the event is lost.
    pub async fn step(&mut self, now_us: u64) -> bool {
        let Some(event) = self
            .pipeline
            .step(now_us, &mut self.sensor, self.link)
            .await
        else {
            return false;
        };

        match self.channel.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(dropped)) => {
                trace!("Pressure channel full, dropped {:?}", dropped);
                false
            }
        }
    }
}

/// Consumer half: transport decoding, command dispatch, liveness and
/// forwarding of queued samples.
pub struct IoTask<'a, F, K, E, B> {
    protocol: CommandProtocol<'a, F, K, E, B>,
    decoder: Decoder,
    channel: &'a PressureChannel,
}

impl<'a, F, K, E, B> IoTask<'a, F, K, E, B>
where
    F: NorFlash,
    K: KeyProvider,
    E: EntropySource,
    B: Board,
{
    pub fn new(
        protocol: CommandProtocol<'a, F, K, E, B>,
        framing: Framing,
        channel: &'a PressureChannel,
    ) -> Self {
        Self {
            protocol,
            decoder: Decoder::new(framing),
            channel,
        }
    }

    pub fn protocol(&mut self) -> &mut CommandProtocol<'a, F, K, E, B> {
        &mut self.protocol
    }

    /// Decode received bytes, dispatching every completed command.
    pub async fn receive<S: ReplySink>(&mut self, bytes: &[u8], now_ms: u64, sink: &mut S) {
        for &byte in bytes {
            if let Some(frame) = self.decoder.push(byte) {
                self.protocol.dispatch(&frame, now_ms, sink).await;
            }
        }
    }

    /// Connection upkeep, then everything the sampler has queued.
    pub async fn service<S: ReplySink>(&mut self, now_ms: u64, sink: &mut S) {
        self.protocol.poll(now_ms, sink).await;
        while let Ok(event) = self.channel.try_receive() {
            self.protocol.forward(event, sink).await;
        }
    }
}

/// Both halves driven from a single loop.
pub struct CooperativeEngine<'a, P, F, K, E, B> {
    sampling: SamplingTask<'a, P>,
    io: IoTask<'a, F, K, E, B>,
}

impl<'a, P, F, K, E, B> CooperativeEngine<'a, P, F, K, E, B>
where
    P: PressureSensor,
    F: NorFlash,
    K: KeyProvider,
    E: EntropySource,
    B: Board,
{
    pub fn new(sampling: SamplingTask<'a, P>, io: IoTask<'a, F, K, E, B>) -> Self {
        Self { sampling, io }
    }

    pub fn sampling(&mut self) -> &mut SamplingTask<'a, P> {
        &mut self.sampling
    }

    pub fn io(&mut self) -> &mut IoTask<'a, F, K, E, B> {
        &mut self.io
    }

    /// One pass: sample, handle `rx`, then service the link.
    pub async fn step<S: ReplySink>(&mut self, now_us: u64, rx: &[u8], sink: &mut S) {
        let now_ms = now_us / 1000;
        self.sampling.step(now_us).await;
        self.io.receive(rx, now_ms, sink).await;
        self.io.service(now_ms, sink).await;
    }
}
