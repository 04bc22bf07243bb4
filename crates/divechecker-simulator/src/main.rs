//! Desktop simulator for the DiveChecker pressure trainer.
//!
//! Runs the device engine against a simulated BMP280 and speaks the device
//! protocol on stdin/stdout, so a host application (or a terminal) can talk to
//! it instead of hardware. Logs go to stderr via `env_logger`.
//!
//! # Options
//!
//! | Flag      | Effect                                             |
//! |-----------|----------------------------------------------------|
//! | `--sysex` | MIDI SysEx framing instead of ASCII lines          |
//! | `--dual`  | Sampling and I/O on separate threads               |
//! | `--otp`   | Load the signing key through the OTP row layout    |
//!
//! The signing key is read from `DIVECHECKER_PRIVATE_KEY` (64 hex digits),
//! either in the environment or in a `.env` file. Without it the device
//! answers every challenge with `AUTH_ERR`, like an unprovisioned unit.
//!
//! Settings (name, PIN) persist in the flash image named by
//! `DIVECHECKER_SETTINGS_FILE`, `divechecker-settings.bin` by default.
//!
//! The simulated diver equalizes every few seconds: a short pressure pulse on
//! top of a steady ambient reading.

mod file_flash;

use std::f64::consts::PI;
use std::io::{Read, Write as _};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread;
use std::time::{Duration, Instant};

use embassy_futures::block_on;
use embedded_hal_async::delay::DelayNs;
use embedded_io_async::{ErrorKind, ErrorType, Write};
use log::{info, warn};
use rand::RngCore;
use rand::rngs::OsRng;

use divechecker_core::app_state::{DeviceIdentity, LinkState, PressureChannel, StatusLed};
use divechecker_core::async_i2c_bus::{SharedI2cBus, SharedI2cDevice};
use divechecker_core::auth::{
    AuthSubsystem, EntropySource, KeyProvider, OtpImage, OtpKeyProvider, StaticKey,
};
use divechecker_core::config::{EngineConfig, Framing, KeySource, SchedulingMode};
use divechecker_core::engine::{CooperativeEngine, IoTask, SamplingTask, start_sensor};
use divechecker_core::protocol::{Board, CommandProtocol};
use divechecker_core::sensors::sim::{Bmp280RegisterModel, DATASHEET_ADC_P, DATASHEET_ADC_T};
use divechecker_core::sensors::{
    BMP280_DEFAULT_ADDRESS, Bmp280, DiagnosticReport, SensorError, diagnose,
};
use divechecker_core::storage::SettingsStore;
use divechecker_core::transport::{SerialLink, SharedSerial};

use crate::file_flash::FileFlash;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const KEY_ENV_VAR: &str = "DIVECHECKER_PRIVATE_KEY";
const SETTINGS_ENV_VAR: &str = "DIVECHECKER_SETTINGS_FILE";
const DEFAULT_SETTINGS_FILE: &str = "divechecker-settings.bin";

/// Stand-in for the chip's factory unique id.
const SIM_UNIQUE_ID: [u8; 6] = [0xD1, 0x7E, 0xC4, 0xEC, 0x00, 0x01];

/// Loop period of every simulated context.
const STEP_INTERVAL: Duration = Duration::from_millis(1);

/// One equalization every `EQUALIZE_PERIOD`, lasting `PULSE_LENGTH`.
const EQUALIZE_PERIOD: Duration = Duration::from_secs(6);
const PULSE_LENGTH: Duration = Duration::from_millis(1500);

/// Pulse height in raw ADC counts. Lower counts read as higher pressure.
const PULSE_ADC_COUNTS: f64 = 20_000.0;

type SimBus = SharedI2cBus<Bmp280RegisterModel>;

// ---------------------------------------------------------------------------
// Host stand-ins for board services
// ---------------------------------------------------------------------------

/// Reply sink end of the serial link.
struct StdoutPort;

impl ErrorType for StdoutPort {
    type Error = ErrorKind;
}

impl Write for StdoutPort {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        std::io::stdout().write(buf).map_err(|_| ErrorKind::Other)
    }

    async fn flush(&mut self) -> Result<(), Self::Error> {
        std::io::stdout().flush().map_err(|_| ErrorKind::Other)
    }
}

struct StdDelay;

impl DelayNs for StdDelay {
    async fn delay_ns(&mut self, ns: u32) {
        thread::sleep(Duration::from_nanos(ns.into()));
    }
}

/// Operating system randomness in place of the chip's TRNG.
struct HostEntropy;

impl EntropySource for HostEntropy {
    fn fill_bytes(&mut self, dest: &mut [u8]) {
        OsRng.fill_bytes(dest);
    }
}

/// Diagnostics share the simulated bus with the sampler.
struct SimBoard<'a> {
    bus: SharedI2cDevice<'a, Bmp280RegisterModel>,
}

impl Board for SimBoard<'_> {
    async fn run_diagnostic(&mut self) -> Result<DiagnosticReport, SensorError> {
        diagnose(&mut self.bus, &mut StdDelay, BMP280_DEFAULT_ADDRESS).await
    }

    fn set_status(&mut self, status: StatusLed) {
        info!("Status LED: {:?}", status);
    }

    async fn delay_ms(&mut self, ms: u32) {
        thread::sleep(Duration::from_millis(ms.into()));
    }

    async fn reboot_to_loader(&mut self) {
        info!("Reboot to loader requested, exiting");
        std::process::exit(0);
    }
}

/// Fuses as the provisioning tool burns them. An unusable key leaves them
/// blank.
fn provision_otp(mut key: StaticKey) -> OtpImage {
    let Ok(private) = key.load() else {
        return OtpImage::blank();
    };
    match AuthSubsystem::new(key, HostEntropy).public_key_sec1() {
        Ok(public) => OtpImage::programmed(*private, &public),
        Err(_) => {
            warn!("No usable key, OTP left unprogrammed");
            OtpImage::blank()
        }
    }
}

// ---------------------------------------------------------------------------
// Simulated diver
// ---------------------------------------------------------------------------

/// Place the raw pressure code for time `t` in the sensor registers.
fn simulate_pressure(bus: &SimBus, t: Duration) {
    let phase = t.as_secs_f64() % EQUALIZE_PERIOD.as_secs_f64();
    let pulse = if phase < PULSE_LENGTH.as_secs_f64() {
        (PI * phase / PULSE_LENGTH.as_secs_f64()).sin()
    } else {
        0.0
    };
    let adc_p = DATASHEET_ADC_P - (pulse * PULSE_ADC_COUNTS) as i32;
    block_on(bus.lock()).set_raw(adc_p, DATASHEET_ADC_T);
}

// ---------------------------------------------------------------------------
// Serial input
// ---------------------------------------------------------------------------

fn spawn_stdin_reader() -> Receiver<u8> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut stdin = std::io::stdin().lock();
        let mut buf = [0u8; 64];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if buf[..n].iter().any(|&b| tx.send(b).is_err()) {
                        break;
                    }
                }
            }
        }
        info!("Host closed the link");
    });
    rx
}

/// Everything received since the last call; `None` once the host is gone.
fn drain(rx: &Receiver<u8>) -> Option<Vec<u8>> {
    let mut bytes = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(byte) => bytes.push(byte),
            Err(TryRecvError::Empty) => return Some(bytes),
            Err(TryRecvError::Disconnected) => return (!bytes.is_empty()).then_some(bytes),
        }
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn parse_args() -> EngineConfig {
    let mut config = EngineConfig::default();
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--sysex" => config.framing = Framing::SysEx,
            "--dual" => config.scheduling = SchedulingMode::DualContext,
            "--otp" => config.key_source = KeySource::Otp,
            other => warn!("Ignoring unknown argument {other}"),
        }
    }
    config
}

fn compiled_key() -> StaticKey {
    match std::env::var(KEY_ENV_VAR) {
        Ok(hex) => StaticKey::from_hex(&hex).unwrap_or_else(|| {
            warn!("{KEY_ENV_VAR} is not 64 hex digits, using placeholder");
            StaticKey::PLACEHOLDER
        }),
        Err(_) => {
            warn!("{KEY_ENV_VAR} not set, authentication disabled");
            StaticKey::PLACEHOLDER
        }
    }
}

fn main() {
    // A missing .env is normal.
    let _ = dotenvy::dotenv();
    env_logger::init();

    let config = parse_args();
    info!("Starting DiveChecker simulator: {:?}", config);

    let key = compiled_key();
    match config.key_source {
        KeySource::Compiled => run(config, key),
        KeySource::Otp => run(config, OtpKeyProvider::new(provision_otp(key))),
    }

    info!("Simulator exiting");
}

fn run<K: KeyProvider>(config: EngineConfig, keys: K) {
    let link = LinkState::new();
    let channel = PressureChannel::new();
    let bus = SimBus::new(Bmp280RegisterModel::datasheet());
    let port = SharedSerial::new(StdoutPort);
    let rx = spawn_stdin_reader();

    let mut sensor = Bmp280::new(SharedI2cDevice::new(&bus), StdDelay);
    if let Err(e) = block_on(start_sensor(&mut sensor, &mut StdDelay, &link)) {
        warn!("Continuing without sensor: {}", e);
    }

    let settings_file =
        std::env::var(SETTINGS_ENV_VAR).unwrap_or_else(|_| DEFAULT_SETTINGS_FILE.into());
    let mut settings = SettingsStore::at_last_sector(FileFlash::open(settings_file));
    info!("Device name: {}", settings.load().name());

    let protocol = CommandProtocol::new(
        &link,
        settings,
        AuthSubsystem::new(keys, HostEntropy),
        DeviceIdentity::from_unique_id(&SIM_UNIQUE_ID),
        SimBoard {
            bus: SharedI2cDevice::new(&bus),
        },
    );
    let sampling = SamplingTask::new(sensor, &link, &channel);
    let mut io = IoTask::new(protocol, config.framing, &channel);
    let mut out = SerialLink::new(&port, config.framing);
    let start = Instant::now();

    match config.scheduling {
        SchedulingMode::Cooperative => {
            let mut engine = CooperativeEngine::new(sampling, io);
            while let Some(bytes) = drain(&rx) {
                let now = start.elapsed();
                simulate_pressure(&bus, now);
                block_on(engine.step(now.as_micros() as u64, &bytes, &mut out));
                thread::sleep(STEP_INTERVAL);
            }
        }
        SchedulingMode::DualContext => {
            let running = AtomicBool::new(true);
            thread::scope(|s| {
                let mut sampling = sampling;
                let (bus, running) = (&bus, &running);
                s.spawn(move || {
                    info!("Sampling context started");
                    while running.load(Ordering::Relaxed) {
                        let now = start.elapsed();
                        simulate_pressure(bus, now);
                        block_on(sampling.step(now.as_micros() as u64));
                        thread::sleep(STEP_INTERVAL);
                    }
                });

                info!("I/O context started");
                while let Some(bytes) = drain(&rx) {
                    let now_ms = start.elapsed().as_millis() as u64;
                    block_on(io.receive(&bytes, now_ms, &mut out));
                    block_on(io.service(now_ms, &mut out));
                    thread::sleep(STEP_INTERVAL);
                }
                running.store(false, Ordering::Relaxed);
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_entropy_seeds_differ() {
        let mut first = [0u8; 32];
        let mut second = [0u8; 32];
        HostEntropy.fill_bytes(&mut first);
        HostEntropy.fill_bytes(&mut second);
        assert_ne!(first, second);
        assert_ne!(first, [0u8; 32]);
    }

    #[test]
    fn test_provisioned_otp_signs_with_configured_key() {
        let hex = "c9afa9d845ba75166b5c215767b1d6934e50c3db36e89b127b8a622b120f6721";
        let key = StaticKey::from_hex(hex).unwrap();
        let mut auth = AuthSubsystem::new(OtpKeyProvider::new(provision_otp(key)), HostEntropy);
        assert!(auth.sign(&[0x11; 32]).is_ok());

        let blank = provision_otp(StaticKey::PLACEHOLDER);
        let mut auth = AuthSubsystem::new(OtpKeyProvider::new(blank), HostEntropy);
        assert!(auth.sign(&[0x11; 32]).is_err());
    }
}
