//! The device record: a discovered peer, as tracked by discovery and
//! consumed by the controller when initiating a send.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    Android,
    Windows,
    Linux,
    Ios,
    Unknown,
}

impl DeviceClass {
    /// The single ASCII byte the UDP broadcast packet carries for this class.
    pub fn wire_byte(self) -> u8 {
        match self {
            DeviceClass::Android => b'a',
            DeviceClass::Windows => b'w',
            DeviceClass::Linux => b'l',
            DeviceClass::Ios => b'i',
            DeviceClass::Unknown => b'u',
        }
    }

    pub fn from_wire_byte(b: u8) -> Self {
        match b {
            b'a' => DeviceClass::Android,
            b'w' => DeviceClass::Windows,
            b'l' => DeviceClass::Linux,
            b'i' => DeviceClass::Ios,
            _ => DeviceClass::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    Wifi,
    Bluetooth,
    Webrtc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    Available,
    Busy,
    Offline,
    Trusted,
}

/// A discovered peer. `short_id` is the equality key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub short_id: String,
    pub display_name: String,
    pub device_class: DeviceClass,
    pub address: SocketAddr,
    pub connection_kind: ConnectionKind,
    pub protocol_version: u16,
    pub state: DeviceState,
    #[serde(skip, default = "Instant::now")]
    pub last_seen: Instant,
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.short_id == other.short_id
    }
}
impl Eq for Device {}

impl Device {
    pub fn refresh(&mut self, seen_at: Instant) {
        self.last_seen = seen_at;
        if self.state == DeviceState::Offline {
            self.state = DeviceState::Available;
        }
    }

    pub fn is_timed_out(&self, now: Instant, device_timeout: Duration) -> bool {
        now.duration_since(self.last_seen) >= device_timeout
    }

    pub fn is_expired(&self, now: Instant, device_timeout: Duration) -> bool {
        now.duration_since(self.last_seen) >= device_timeout * 2
    }
}
