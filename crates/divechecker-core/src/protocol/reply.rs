use core::fmt::{self, Display, Formatter, Write};

use crate::auth::AuthError;
use crate::connection::ConnectionEvent;
use crate::sampling::{OutputRate, PressurePacket};
use crate::sensors::{CTRL_MEAS_NORMAL, DiagnosticReport, RawReading};

use super::ProtocolError;

/// Fixed informational texts (`INFO:` on the line transport).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Notice {
    Connection(ConnectionEvent),
    BaselineSet(f32),
    BaselineReset,
    RateChanged(OutputRate),
    NameSaved,
    PinChanged,
    DiagnosticStarted,
    DiagnosticComplete,
    Rebooting,
}

impl Display for Notice {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection(event) => f.write_str(event.message()),
            Self::BaselineSet(hpa) => write!(f, "Baseline {hpa:.3} hPa"),
            Self::BaselineReset => f.write_str("Baseline reset"),
            Self::RateChanged(rate) => write!(
                f,
                "Output rate {}Hz ({} samples avg)",
                rate.hz(),
                rate.samples_per_output()
            ),
            Self::NameSaved => f.write_str("Name saved"),
            Self::PinChanged => f.write_str("PIN changed"),
            Self::DiagnosticStarted => f.write_str("Sensor debug test..."),
            Self::DiagnosticComplete => f.write_str("Test complete"),
            Self::Rebooting => f.write_str("Rebooting to update mode..."),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo<'a> {
    pub serial: &'a str,
    pub name: &'a str,
    pub firmware: &'a str,
    pub sensor_ok: bool,
}

/// Everything the device can say to the host.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reply<'a> {
    Pong,
    Pressure(PressurePacket),
    Config(OutputRate),
    DeviceInfo(DeviceInfo<'a>),
    Beacon { serial: &'a str, name: &'a str },
    Notice(Notice),
    Error(ProtocolError),
    AuthOk(&'a [u8]),
    AuthErr(AuthError),
    DiagnosticRegisters(&'a DiagnosticReport),
    DiagnosticShot { index: usize, shot: RawReading },
}

impl Reply<'_> {
    /// Line-transport rendering, without the final line terminator.
    ///
    /// Multi-line replies separate their lines with `\n`.
    pub fn write_text<W: Write>(&self, w: &mut W) -> fmt::Result {
        match self {
            Self::Pong => w.write_str("PONG"),
            Self::Pressure(packet) => write!(w, "D:{}", packet.delta_milli_hpa),
            Self::Config(rate) => write!(w, "CFG:{}", rate.hz()),
            Self::DeviceInfo(info) => write!(
                w,
                "INFO:Serial {}\nINFO:Name {}\nINFO:Sensor {}\nINFO:Firmware {}",
                info.serial,
                info.name,
                if info.sensor_ok { "OK" } else { "Error" },
                info.firmware
            ),
            Self::Beacon { serial, name } => write!(w, "BEACON:{serial}:{name}"),
            Self::Notice(notice) => write!(w, "INFO:{notice}"),
            Self::Error(e) => write!(w, "ERR:{e}"),
            Self::AuthOk(der) => {
                w.write_str("AUTH_OK:")?;
                der.iter().try_for_each(|b| write!(w, "{b:02x}"))
            }
            Self::AuthErr(e) => write!(w, "AUTH_ERR:{e}"),
            Self::DiagnosticRegisters(report) => {
                writeln!(
                    w,
                    "ChipID: 0x{:02X} | CTRL_MEAS: 0x{:02X} | CONFIG: 0x{:02X}",
                    report.chip_id, report.ctrl_meas, report.config
                )?;
                if let Some(ctrl) = report.reinitialized {
                    writeln!(
                        w,
                        "WARN: Pressure disabled! Reinitializing...\nAfter reinit: CTRL_MEAS=0x{ctrl:02X} (expect 0x{CTRL_MEAS_NORMAL:02X})"
                    )?;
                }
                w.write_str("Testing FORCED MODE (single measurement, X16)...")
            }
            Self::DiagnosticShot { index, shot } => {
                let b = shot.bytes;
                write!(
                    w,
                    "[{index}] FORCED: P={:02X}{:02X}{:02X} T={:02X}{:02X}{:02X} | P_adc={} T_adc={}",
                    b[0],
                    b[1],
                    b[2],
                    b[3],
                    b[4],
                    b[5],
                    shot.adc_p(),
                    shot.adc_t()
                )
            }
        }
    }
}
