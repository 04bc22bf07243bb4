use log::{debug, info};

use crate::app_state::{DeviceIdentity, LinkState, StatusLed};
use crate::auth::{AuthError, AuthSubsystem, EntropySource, KeyProvider};
use crate::config::{DEVICE_PIN_LEN, FW_VERSION, REBOOT_FLUSH_DELAY_MS};
use crate::connection::{ConnectionEvent, ConnectionManager};
use crate::sampling::{OutputRate, SampleEvent};
use crate::sensors::{DiagnosticReport, SensorError};
use crate::storage::{SettingsStore, is_valid_pin};
use embedded_storage::nor_flash::NorFlash;

use super::{CommandFrame, CommandKind, DeviceInfo, Notice, ProtocolError, Reply};

/// Destination for replies on the transport the command arrived on.
pub trait ReplySink {
    fn send(&mut self, reply: Reply<'_>) -> impl Future<Output = ()>;
}

/// Board services the protocol needs beyond the core components.
pub trait Board {
    /// Register dump and forced-mode test of the pressure sensor.
    fn run_diagnostic(&mut self) -> impl Future<Output = Result<DiagnosticReport, SensorError>>;

    fn set_status(&mut self, status: StatusLed);

    fn delay_ms(&mut self, ms: u32) -> impl Future<Output = ()>;

    /// Restart into the ROM loader, ready for a firmware download. Returns
    /// only on hosts that cannot reboot.
    fn reboot_to_loader(&mut self) -> impl Future<Output = ()>;
}

/// I/O-context command handler.
///
/// Owns the connection tracker, settings and auth; everything the sampler
/// must see goes through [`LinkState`].
pub struct CommandProtocol<'a, F, K, E, B> {
    link: &'a LinkState,
    connection: ConnectionManager,
    settings: SettingsStore<F>,
    auth: AuthSubsystem<K, E>,
    identity: DeviceIdentity,
    board: B,
}

impl<'a, F, K, E, B> CommandProtocol<'a, F, K, E, B>
where
    F: NorFlash,
    K: KeyProvider,
    E: EntropySource,
    B: Board,
{
    pub fn new(
        link: &'a LinkState,
        settings: SettingsStore<F>,
        auth: AuthSubsystem<K, E>,
        identity: DeviceIdentity,
        board: B,
    ) -> Self {
        Self {
            link,
            connection: ConnectionManager::new(),
            settings,
            auth,
            identity,
            board,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn settings(&self) -> &SettingsStore<F> {
        &self.settings
    }

    pub fn board(&mut self) -> &mut B {
        &mut self.board
    }

    /// Liveness check: reports a timeout and emits the discovery beacon.
    pub async fn poll<S: ReplySink>(&mut self, now_ms: u64, sink: &mut S) {
        let polled = self.connection.poll(now_ms, self.link);

        if let Some(event) = polled.event {
            self.announce(event, sink).await;
        }

        if polled.beacon_due {
            sink.send(Reply::Beacon {
                serial: self.identity.serial(),
                name: self.settings.settings().name(),
            })
            .await;
        }
    }

    /// Forward one sampler output; dropped unless a host is connected.
    pub async fn forward<S: ReplySink>(&mut self, event: SampleEvent, sink: &mut S) {
        if !self.connection.is_connected() {
            return;
        }
        match event {
            SampleEvent::BaselineSet { hpa } => {
                sink.send(Reply::Notice(Notice::BaselineSet(hpa))).await
            }
            SampleEvent::Pressure(packet) => sink.send(Reply::Pressure(packet)).await,
        }
    }

    async fn announce<S: ReplySink>(&mut self, event: ConnectionEvent, sink: &mut S) {
        self.board.set_status(event.status());
        sink.send(Reply::Notice(Notice::Connection(event))).await;
    }

    pub async fn dispatch<S: ReplySink>(&mut self, frame: &CommandFrame, now_ms: u64, sink: &mut S) {
        debug!("Command {:?} ({} payload bytes)", frame.kind, frame.payload.len());

        match frame.kind {
            CommandKind::Ping => {
                if let Some(event) = self.connection.on_ping(now_ms, self.link) {
                    self.announce(event, sink).await;
                }
                sink.send(Reply::Pong).await;
            }
            CommandKind::ResetBaseline => {
                self.link.request_session_reset();
                sink.send(Reply::Notice(Notice::BaselineReset)).await;
            }
            CommandKind::GetConfig => sink.send(Reply::Config(self.link.output_rate())).await,
            CommandKind::GetInfo => {
                sink.send(Reply::DeviceInfo(DeviceInfo {
                    serial: self.identity.serial(),
                    name: self.settings.settings().name(),
                    firmware: FW_VERSION,
                    sensor_ok: self.link.sensor_ready(),
                }))
                .await;
            }
            CommandKind::Diagnostic => self.run_diagnostic(sink).await,
            CommandKind::Reboot => {
                info!("Reboot requested");
                sink.send(Reply::Notice(Notice::Rebooting)).await;
                self.board.delay_ms(REBOOT_FLUSH_DELAY_MS).await;
                self.board.reboot_to_loader().await;
            }
            CommandKind::SetName => {
                let reply = match self.set_name(&frame.payload) {
                    Ok(()) => Reply::Notice(Notice::NameSaved),
                    Err(e) => Reply::Error(e),
                };
                sink.send(reply).await;
            }
            CommandKind::ChangePin => {
                let reply = match self.change_pin(&frame.payload) {
                    Ok(()) => Reply::Notice(Notice::PinChanged),
                    Err(e) => Reply::Error(e),
                };
                sink.send(reply).await;
            }
            CommandKind::Auth => {
                let signed = match frame.nonce() {
                    Some(nonce) => self.auth.sign(&nonce),
                    None => Err(AuthError::MalformedNonce),
                };
                match signed {
                    Ok(der) => sink.send(Reply::AuthOk(&der)).await,
                    Err(e) => sink.send(Reply::AuthErr(e)).await,
                }
            }
            CommandKind::SetRate => match OutputRate::new(frame.rate()) {
                Ok(rate) => {
                    self.link.set_output_rate(rate);
                    sink.send(Reply::Notice(Notice::RateChanged(rate))).await;
                }
                Err(e) => sink.send(Reply::Error(e.into())).await,
            },
        }
    }

    async fn run_diagnostic<S: ReplySink>(&mut self, sink: &mut S) {
        sink.send(Reply::Notice(Notice::DiagnosticStarted)).await;

        let report = match self.board.run_diagnostic().await {
            Ok(report) => report,
            Err(e) => {
                info!("Diagnostic aborted: {e}");
                sink.send(Reply::Error(ProtocolError::Sensor)).await;
                return;
            }
        };

        sink.send(Reply::DiagnosticRegisters(&report)).await;
        for (index, shot) in report.shots.iter().enumerate() {
            sink.send(Reply::DiagnosticShot { index, shot: *shot }).await;
        }
        sink.send(Reply::Notice(Notice::DiagnosticComplete)).await;
    }

    /// `N<pin><name>`
    fn set_name(&mut self, payload: &[u8]) -> Result<(), ProtocolError> {
        if payload.len() < DEVICE_PIN_LEN {
            return Err(ProtocolError::MalformedPayload("N<PIN><NAME>"));
        }
        let (pin, name) = payload.split_at(DEVICE_PIN_LEN);

        if !self.pin_matches(pin) {
            return Err(ProtocolError::WrongPin);
        }
        let name = utf8_prefix(name);
        if name.is_empty() {
            return Err(ProtocolError::EmptyName);
        }

        self.settings.set_name(name)?;
        info!("Name saved: {}", self.settings.settings().name());
        Ok(())
    }

    /// `W<old><new>`
    fn change_pin(&mut self, payload: &[u8]) -> Result<(), ProtocolError> {
        if payload.len() != DEVICE_PIN_LEN * 2 {
            return Err(ProtocolError::MalformedPayload("W<OLD><NEW>"));
        }
        let (old, new) = payload.split_at(DEVICE_PIN_LEN);

        if !self.pin_matches(old) {
            return Err(ProtocolError::WrongPin);
        }
        let new = core::str::from_utf8(new).map_err(|_| ProtocolError::InvalidPinFormat)?;
        if !is_valid_pin(new) {
            return Err(ProtocolError::InvalidPinFormat);
        }

        let updated = self
            .settings
            .settings()
            .with_pin(new)
            .ok_or(ProtocolError::InvalidPinFormat)?;
        self.settings.save(updated)?;
        info!("PIN changed");
        Ok(())
    }

    fn pin_matches(&self, candidate: &[u8]) -> bool {
        core::str::from_utf8(candidate).is_ok_and(|pin| self.settings.verify_pin(pin))
    }
}

/// Longest valid UTF-8 prefix.
fn utf8_prefix(bytes: &[u8]) -> &str {
    match core::str::from_utf8(bytes) {
        Ok(s) => s,
        // Cannot fail: `valid_up_to` marks a boundary.
        Err(e) => core::str::from_utf8(&bytes[..e.valid_up_to()]).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticKey;
    use crate::config::FLASH_SECTOR_SIZE;
    use crate::protocol::PayloadEncoding;
    use crate::sensors::RawReading;
    use crate::storage::RamFlash;
    use embassy_futures::block_on;
    use std::string::String;
    use std::vec::Vec;

    type Flash = RamFlash<{ FLASH_SECTOR_SIZE as usize }>;

    #[derive(Default)]
    struct Lines(Vec<String>);

    impl ReplySink for Lines {
        async fn send(&mut self, reply: Reply<'_>) {
            let mut text = String::new();
            reply.write_text(&mut text).unwrap();
            self.0.extend(text.split('\n').map(String::from));
        }
    }

    #[derive(Default)]
    struct FakeBoard {
        status: Vec<StatusLed>,
        reboots: usize,
        delayed_ms: u32,
        broken_sensor: bool,
    }

    impl Board for FakeBoard {
        async fn run_diagnostic(&mut self) -> Result<DiagnosticReport, SensorError> {
            if self.broken_sensor {
                return Err(SensorError::Bus {
                    operation: "register read",
                });
            }
            Ok(DiagnosticReport {
                chip_id: 0x58,
                ctrl_meas: 0x57,
                config: 0x04,
                reinitialized: None,
                shots: [RawReading {
                    bytes: [0x65, 0x5A, 0xC0, 0x7E, 0xED, 0x00],
                }; 5],
            })
        }

        fn set_status(&mut self, status: StatusLed) {
            self.status.push(status);
        }

        async fn delay_ms(&mut self, ms: u32) {
            self.delayed_ms += ms;
        }

        async fn reboot_to_loader(&mut self) {
            self.reboots += 1;
        }
    }

    struct NoEntropy;

    impl EntropySource for NoEntropy {
        fn fill_bytes(&mut self, dest: &mut [u8]) {
            dest.fill(0x42);
        }
    }

    type Protocol<'a> = CommandProtocol<'a, Flash, StaticKey, NoEntropy, FakeBoard>;

    fn protocol(link: &LinkState) -> Protocol<'_> {
        let mut settings = SettingsStore::new(Flash::new(), 0);
        settings.load();
        CommandProtocol::new(
            link,
            settings,
            AuthSubsystem::new(StaticKey::PLACEHOLDER, NoEntropy),
            DeviceIdentity::from_unique_id(&[0xE6, 0x61, 0x18, 0x60]),
            FakeBoard::default(),
        )
    }

    fn run(protocol: &mut Protocol<'_>, kind: CommandKind, payload: &[u8]) -> Vec<String> {
        let frame = CommandFrame::with_payload(kind, PayloadEncoding::Text, payload);
        let mut lines = Lines::default();
        block_on(protocol.dispatch(&frame, 0, &mut lines));
        lines.0
    }

    #[test]
    fn test_first_ping_connects() {
        let link = LinkState::new();
        let mut protocol = protocol(&link);

        assert_eq!(
            run(&mut protocol, CommandKind::Ping, b""),
            ["INFO:Connected", "PONG"]
        );
        assert_eq!(run(&mut protocol, CommandKind::Ping, b""), ["PONG"]);
        assert!(link.is_connected());
        assert_eq!(protocol.board.status, [StatusLed::AppConnected]);
    }

    #[test]
    fn test_timeout_announces_disconnect() {
        let link = LinkState::new();
        let mut protocol = protocol(&link);
        run(&mut protocol, CommandKind::Ping, b"");

        let mut lines = Lines::default();
        block_on(protocol.poll(3000, &mut lines));
        assert_eq!(lines.0[0], "INFO:Disconnected");
        assert_eq!(lines.0[1], "BEACON:E6611860:DiveChecker");
        assert_eq!(protocol.board.status.last(), Some(&StatusLed::UsbReady));
    }

    #[test]
    fn test_info_and_config() {
        let link = LinkState::new();
        link.mark_sensor_ready(true);
        let mut protocol = protocol(&link);

        assert_eq!(
            run(&mut protocol, CommandKind::GetInfo, b""),
            [
                "INFO:Serial E6611860",
                "INFO:Name DiveChecker",
                "INFO:Sensor OK",
                "INFO:Firmware 4.5.0"
            ]
        );
        assert_eq!(run(&mut protocol, CommandKind::GetConfig, b""), ["CFG:8"]);
    }

    #[test]
    fn test_rate_change_reaches_link() {
        let link = LinkState::new();
        let mut protocol = protocol(&link);

        assert_eq!(
            run(&mut protocol, CommandKind::SetRate, b"20"),
            ["INFO:Output rate 20Hz (5 samples avg)"]
        );
        assert_eq!(link.output_rate().hz(), 20);

        assert_eq!(
            run(&mut protocol, CommandKind::SetRate, b"51"),
            ["ERR:Rate must be 4-50Hz"]
        );
        assert_eq!(
            run(&mut protocol, CommandKind::SetRate, b"3"),
            ["ERR:Rate must be 4-50Hz"]
        );
        assert_eq!(link.output_rate().hz(), 20);
    }

    #[test]
    fn test_reset_bumps_session() {
        let link = LinkState::new();
        let mut protocol = protocol(&link);
        assert_eq!(
            run(&mut protocol, CommandKind::ResetBaseline, b""),
            ["INFO:Baseline reset"]
        );
        assert_eq!(link.session_epoch(), 1);
    }

    #[test]
    fn test_set_name_flow() {
        let link = LinkState::new();
        let mut protocol = protocol(&link);

        assert_eq!(
            run(&mut protocol, CommandKind::SetName, b"000"),
            ["ERR:Format N<PIN><NAME>"]
        );
        assert_eq!(
            run(&mut protocol, CommandKind::SetName, b"1234Reef"),
            ["ERR:Wrong PIN"]
        );
        assert_eq!(
            run(&mut protocol, CommandKind::SetName, b"0000"),
            ["ERR:Empty name"]
        );
        assert_eq!(
            run(&mut protocol, CommandKind::SetName, b"0000Reef Diver"),
            ["INFO:Name saved"]
        );
        assert_eq!(protocol.settings().settings().name(), "Reef Diver");
    }

    #[test]
    fn test_long_name_is_truncated() {
        let link = LinkState::new();
        let mut protocol = protocol(&link);
        run(
            &mut protocol,
            CommandKind::SetName,
            b"0000abcdefghijklmnopqrstuvwxyz",
        );
        assert_eq!(
            protocol.settings().settings().name(),
            "abcdefghijklmnopqrstuvwx"
        );
    }

    #[test]
    fn test_change_pin_flow() {
        let link = LinkState::new();
        let mut protocol = protocol(&link);

        assert_eq!(
            run(&mut protocol, CommandKind::ChangePin, b"00001234"),
            ["INFO:PIN changed"]
        );
        assert!(protocol.settings().verify_pin("1234"));

        // The old PIN no longer works.
        assert_eq!(
            run(&mut protocol, CommandKind::ChangePin, b"00005678"),
            ["ERR:Wrong PIN"]
        );
        assert_eq!(
            run(&mut protocol, CommandKind::ChangePin, b"123412a4"),
            ["ERR:PIN must be 4 digits"]
        );
        assert_eq!(
            run(&mut protocol, CommandKind::ChangePin, b"1234567"),
            ["ERR:Format W<OLD><NEW>"]
        );
        assert!(protocol.settings().verify_pin("1234"));
    }

    #[test]
    fn test_auth_rejects_bad_nonce_before_signing() {
        let link = LinkState::new();
        let mut protocol = protocol(&link);

        assert_eq!(
            run(&mut protocol, CommandKind::Auth, b"abc"),
            ["AUTH_ERR:Invalid nonce"]
        );
        // The placeholder key was never touched by the malformed request.
        assert!(!protocol.auth.is_ready());
        assert!(matches!(protocol.auth.ensure_initialized(), Err(AuthError::KeyNotConfigured)));
    }

    #[test]
    fn test_auth_placeholder_key() {
        let link = LinkState::new();
        let mut protocol = protocol(&link);
        assert_eq!(
            run(&mut protocol, CommandKind::Auth, &[b'0'; 64]),
            ["AUTH_ERR:ECDSA not ready"]
        );
    }

    #[test]
    fn test_diagnostic_dump() {
        let link = LinkState::new();
        let mut protocol = protocol(&link);
        let lines = run(&mut protocol, CommandKind::Diagnostic, b"");

        assert_eq!(lines.first().unwrap(), "INFO:Sensor debug test...");
        assert_eq!(lines[1], "ChipID: 0x58 | CTRL_MEAS: 0x57 | CONFIG: 0x04");
        assert_eq!(lines.iter().filter(|l| l.contains("FORCED:")).count(), 5);
        assert_eq!(lines.last().unwrap(), "INFO:Test complete");
    }

    #[test]
    fn test_diagnostic_bus_failure() {
        let link = LinkState::new();
        let mut protocol = protocol(&link);
        protocol.board.broken_sensor = true;
        assert_eq!(
            run(&mut protocol, CommandKind::Diagnostic, b""),
            ["INFO:Sensor debug test...", "ERR:Sensor not responding"]
        );
    }

    #[test]
    fn test_reboot_flushes_then_enters_update_mode() {
        let link = LinkState::new();
        let mut protocol = protocol(&link);
        assert_eq!(
            run(&mut protocol, CommandKind::Reboot, b""),
            ["INFO:Rebooting to update mode..."]
        );
        assert_eq!(protocol.board.delayed_ms, 200);
        assert_eq!(protocol.board.reboots, 1);
    }

    #[test]
    fn test_samples_only_forwarded_while_connected() {
        let link = LinkState::new();
        let mut protocol = protocol(&link);
        let packet = SampleEvent::Pressure(crate::sampling::PressurePacket {
            delta_milli_hpa: 42,
        });

        let mut lines = Lines::default();
        block_on(protocol.forward(packet, &mut lines));
        assert!(lines.0.is_empty());

        run(&mut protocol, CommandKind::Ping, b"");
        block_on(protocol.forward(packet, &mut lines));
        block_on(protocol.forward(SampleEvent::BaselineSet { hpa: 1000.0 }, &mut lines));
        assert_eq!(lines.0, ["D:42", "INFO:Baseline 1000.000 hPa"]);
    }
}
