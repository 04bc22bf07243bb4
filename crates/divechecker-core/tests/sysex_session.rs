//! A host session over the SysEx framing, from raw bytes in to raw bytes out.

use core::convert::Infallible;

use divechecker_core::app_state::{DeviceIdentity, LinkState, PressureChannel, StatusLed};
use divechecker_core::auth::{AuthSubsystem, EntropySource, StaticKey};
use divechecker_core::config::{FLASH_SECTOR_SIZE, Framing};
use divechecker_core::engine::{CooperativeEngine, IoTask, SamplingTask, start_sensor};
use divechecker_core::protocol::{Board, CommandProtocol};
use divechecker_core::sensors::sim::{Bmp280RegisterModel, NoDelay};
use divechecker_core::sensors::{
    BMP280_DEFAULT_ADDRESS, Bmp280, CONFIG_FILTERED, CTRL_MEAS_NORMAL, DiagnosticReport,
    REG_CONFIG, REG_CTRL_MEAS, SensorError, diagnose,
};
use divechecker_core::storage::{RamFlash, SettingsStore};
use divechecker_core::transport::sysex::{self, decode_pressure};
use divechecker_core::transport::{SerialLink, SharedSerial};
use embassy_futures::block_on;
use embedded_io_async::{ErrorType, Write};
use p256::ecdsa::signature::Verifier;
use p256::ecdsa::{Signature, SigningKey};

const TEST_KEY: [u8; 32] = [
    0xC9, 0xAF, 0xA9, 0xD8, 0x45, 0xBA, 0x75, 0x16, 0x6B, 0x5C, 0x21, 0x57, 0x67, 0xB1, 0xD6, 0x93,
    0x4E, 0x50, 0xC3, 0xDB, 0x36, 0xE8, 0x9B, 0x12, 0x7B, 0x8A, 0x62, 0x2B, 0x12, 0x0F, 0x67, 0x21,
];

type Flash = RamFlash<{ FLASH_SECTOR_SIZE as usize }>;

#[derive(Default)]
struct Wire(Vec<u8>);

impl ErrorType for Wire {
    type Error = Infallible;
}

impl Write for Wire {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        self.0.extend_from_slice(buf);
        Ok(buf.len())
    }

    async fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

impl Wire {
    /// Split the captured stream into `(command, data)` frames.
    fn frames(&mut self) -> Vec<(u8, Vec<u8>)> {
        let bytes = core::mem::take(&mut self.0);
        bytes
            .split(|&b| b == sysex::SYSEX_END)
            .filter(|f| !f.is_empty())
            .map(|f| {
                assert_eq!(&f[..3], &[sysex::SYSEX_START, 0x7D, 0x01]);
                (f[3], f[4..].to_vec())
            })
            .collect()
    }
}

/// Diagnostics run on a second model so the sampler's bus is untouched.
struct ModelBoard {
    bus: Bmp280RegisterModel,
}

impl Board for ModelBoard {
    async fn run_diagnostic(&mut self) -> Result<DiagnosticReport, SensorError> {
        diagnose(&mut self.bus, &mut NoDelay, BMP280_DEFAULT_ADDRESS).await
    }

    fn set_status(&mut self, _status: StatusLed) {}

    async fn delay_ms(&mut self, _ms: u32) {}

    async fn reboot_to_loader(&mut self) {}
}

struct Counter(u8);

impl EntropySource for Counter {
    fn fill_bytes(&mut self, dest: &mut [u8]) {
        for b in dest {
            self.0 = self.0.wrapping_add(1);
            *b = self.0;
        }
    }
}

/// Model as left by a completed init: normal mode, IIR x2.
fn running_model() -> Bmp280RegisterModel {
    let mut model = Bmp280RegisterModel::datasheet();
    model.set_register(REG_CTRL_MEAS, CTRL_MEAS_NORMAL);
    model.set_register(REG_CONFIG, CONFIG_FILTERED);
    model
}

fn sysex(command: u8, data: &[u8]) -> Vec<u8> {
    let mut frame = vec![sysex::SYSEX_START, 0x7D, 0x01, command];
    frame.extend_from_slice(data);
    frame.push(sysex::SYSEX_END);
    frame
}

#[test]
fn test_sysex_session() {
    let link = LinkState::new();
    let channel = PressureChannel::new();
    let port = SharedSerial::new(Wire::default());
    let mut out = SerialLink::new(&port, Framing::SysEx);

    let mut sensor = Bmp280::new(Bmp280RegisterModel::datasheet(), NoDelay);
    block_on(start_sensor(&mut sensor, &mut NoDelay, &link)).unwrap();

    let mut settings = SettingsStore::new(Flash::new(), 0);
    settings.load();
    let protocol = CommandProtocol::new(
        &link,
        settings,
        AuthSubsystem::new(StaticKey::new(TEST_KEY), Counter(0)),
        DeviceIdentity::from_unique_id(&[0xE6, 0x61]),
        ModelBoard {
            bus: running_model(),
        },
    );
    let mut engine = CooperativeEngine::new(
        SamplingTask::new(sensor, &link, &channel),
        IoTask::new(protocol, Framing::SysEx, &channel),
    );

    // Connect.
    block_on(engine.step(0, &sysex(sysex::CMD_PING, &[]), &mut out));
    let frames = port.try_lock().unwrap().frames();
    assert_eq!(frames[0].0, sysex::CMD_INFO_TEXT);
    assert_eq!(frames[0].1, b"Connected");
    assert_eq!(frames[1], (sysex::CMD_PONG, vec![]));

    // Rate change to 20 Hz: 5 samples per 50 ms cycle.
    block_on(engine.step(0, &sysex(sysex::CMD_SET_OUTPUT_RATE, &[20]), &mut out));
    let frames = port.try_lock().unwrap().frames();
    assert_eq!(frames[0].1, b"Output rate 20Hz (5 samples avg)");

    // Baseline then a zero delta.
    let mut now_ms = 10;
    while now_ms <= 100 {
        block_on(engine.step(now_ms * 1000, &[], &mut out));
        now_ms += 10;
    }
    let frames = port.try_lock().unwrap().frames();
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].0, sysex::CMD_INFO_TEXT);
    assert!(frames[0].1.starts_with(b"Baseline 1006.5"));
    assert_eq!(frames[1].0, sysex::CMD_PRESSURE);
    let data: [u8; 5] = frames[1].1.as_slice().try_into().unwrap();
    assert_eq!(decode_pressure(&data), 0);

    // Device info.
    block_on(engine.step(now_ms * 1000, &sysex(sysex::CMD_REQUEST_INFO, &[]), &mut out));
    let frames = port.try_lock().unwrap().frames();
    let (command, data) = &frames[0];
    assert_eq!(*command, sysex::CMD_DEVICE_INFO);
    assert_eq!(&data[..5], &[4, b'E', b'6', b'6', b'1']);
    assert_eq!(&data[5..17], b"\x0bDiveChecker");
    assert_eq!(data.last(), Some(&1));

    // Challenge-response with a nibble-encoded nonce.
    let nonce: [u8; 32] = core::array::from_fn(|i| (i * 7) as u8);
    let nibbles: Vec<u8> = nonce.iter().flat_map(|b| [b >> 4, b & 0x0F]).collect();
    block_on(engine.step(now_ms * 1000, &sysex(sysex::CMD_AUTH_CHALLENGE, &nibbles), &mut out));
    let frames = port.try_lock().unwrap().frames();
    let (command, data) = &frames[0];
    assert_eq!(*command, sysex::CMD_AUTH_RESPONSE);
    let der: Vec<u8> = data.chunks_exact(2).map(|p| (p[0] << 4) | p[1]).collect();

    let verifying_key = *SigningKey::from_slice(&TEST_KEY).unwrap().verifying_key();
    let signature = Signature::from_der(&der).unwrap();
    assert!(verifying_key.verify(&nonce, &signature).is_ok());

    // Sensor self test: registers, then five forced shots as text.
    block_on(engine.step(now_ms * 1000, &sysex(sysex::CMD_SENSOR_STATUS, &[]), &mut out));
    let frames = port.try_lock().unwrap().frames();
    assert_eq!(frames[0].1, b"Sensor debug test...");
    assert_eq!(frames[1], (sysex::CMD_SENSOR_STATUS, vec![1, 0x05, 0x08, 0x05, 0x07, 0x00, 0x04]));
    assert_eq!(frames.len(), 2 + 5 + 1);
    assert_eq!(frames[7].1, b"Test complete");

    // Wrong PIN on rename.
    block_on(engine.step(now_ms * 1000, &sysex(sysex::CMD_SET_NAME, b"1234Reef"), &mut out));
    let frames = port.try_lock().unwrap().frames();
    assert_eq!(frames[0], (sysex::CMD_ERROR_TEXT, b"Wrong PIN".to_vec()));
}
