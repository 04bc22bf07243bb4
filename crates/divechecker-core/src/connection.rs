//! Host liveness tracking and discovery beacon scheduling

use log::info;

use crate::app_state::{LinkState, StatusLed};
use crate::config::{BEACON_INTERVAL_MS, CONNECTION_TIMEOUT_MS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
}

impl ConnectionEvent {
    pub fn message(self) -> &'static str {
        match self {
            Self::Connected => "Connected",
            Self::Disconnected => "Disconnected",
        }
    }

    pub fn status(self) -> StatusLed {
        match self {
            Self::Connected => StatusLed::AppConnected,
            Self::Disconnected => StatusLed::UsbReady,
        }
    }
}

/// Result of one [`ConnectionManager::poll`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectionPoll {
    pub event: Option<ConnectionEvent>,
    pub beacon_due: bool,
}

/// Owned by the I/O context. Publishes the connected flag through
/// [`LinkState`] for the sampler.
pub struct ConnectionManager {
    connected: bool,
    last_ping_ms: u64,
    last_beacon_ms: Option<u64>,
}

impl ConnectionManager {
    pub const fn new() -> Self {
        Self {
            connected: false,
            last_ping_ms: 0,
            last_beacon_ms: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn last_ping_ms(&self) -> u64 {
        self.last_ping_ms
    }

    /// Refresh liveness. A ping while disconnected opens a new session and
    /// asks the sampler for a fresh baseline.
    pub fn on_ping(&mut self, now_ms: u64, link: &LinkState) -> Option<ConnectionEvent> {
        self.last_ping_ms = now_ms;
        if self.connected {
            return None;
        }

        self.connected = true;
        link.request_session_reset();
        link.set_connected(true);
        info!("Host connected");
        Some(ConnectionEvent::Connected)
    }

    /// Check for a ping timeout and whether a beacon should go out.
    pub fn poll(&mut self, now_ms: u64, link: &LinkState) -> ConnectionPoll {
        let mut result = ConnectionPoll::default();

        if self.connected && now_ms.saturating_sub(self.last_ping_ms) >= CONNECTION_TIMEOUT_MS {
            self.connected = false;
            link.set_connected(false);
            link.request_session_reset();
            info!("Host timed out after {} ms", now_ms - self.last_ping_ms);
            result.event = Some(ConnectionEvent::Disconnected);
        }

        if !self.connected {
            let due = self
                .last_beacon_ms
                .is_none_or(|last| now_ms.saturating_sub(last) >= BEACON_INTERVAL_MS);
            if due {
                self.last_beacon_ms = Some(now_ms);
                result.beacon_due = true;
            }
        }

        result
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}
