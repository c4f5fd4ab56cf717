//! Device identity, capabilities, and connection state types

pub mod commands;
pub mod handle;
pub mod link;
pub mod session;

pub use commands::{DeviceCommand, DeviceCounters, DeviceTuning};
pub use handle::DeviceHandle;
pub use link::{build_link, LinkSpec, MockLink, MockLinkController, TransportLink};
pub use session::DeviceWorker;

use serde::{Deserialize, Serialize};

use crate::color::channel_max;

/// Physical device category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceKind {
    GridController,
    LedStrip,
    LedMatrix,
}

/// Wire protocol a device is reached over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportId {
    SysexMidi,
    HttpJson,
    RelaySocket,
    UdpWarls,
}

/// Per-device connection state
///
/// Owned exclusively by the device worker; everyone else observes it through
/// `ConnectionChange` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Idle,
    Connecting,
    Connected,
    Error,
    Disconnected,
    /// Reconnection attempt cap exhausted; the device keeps its state and
    /// waits for an external retry request.
    Stale,
}

impl ConnectionStatus {
    /// Whether the device should read as disconnected in a UI.
    pub fn is_down(&self) -> bool {
        !matches!(self, ConnectionStatus::Connected)
    }
}

/// Declared hardware capabilities
///
/// Color depth is per device, never a hardcoded constant: 6-bit grid
/// generations and 8-bit LED hardware coexist on the same gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Bits per color channel (6 -> 0-63, 8 -> 0-255)
    pub color_depth_bits: u8,
    /// Whether pads report real velocity; if not, presses synthesize 127
    pub velocity_sensitive: bool,
    /// Animation modes the firmware supports (informational)
    #[serde(default)]
    pub animation_modes: Vec<String>,
}

impl Capabilities {
    /// Maximum channel value in this device's native color domain.
    pub fn channel_max(&self) -> u8 {
        channel_max(self.color_depth_bits)
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            color_depth_bits: 8,
            velocity_sensitive: false,
            animation_modes: Vec::new(),
        }
    }
}

/// A physical device the gateway drives
#[derive(Debug, Clone)]
pub struct Device {
    /// Stable identifier, unique across the gateway
    pub id: String,
    pub kind: DeviceKind,
    pub transport: TransportId,
    /// Number of addressable units (pads or LEDs)
    pub unit_count: u16,
    pub capabilities: Capabilities,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_is_down() {
        assert!(!ConnectionStatus::Connected.is_down());
        assert!(ConnectionStatus::Error.is_down());
        assert!(ConnectionStatus::Stale.is_down());
        assert!(ConnectionStatus::Idle.is_down());
    }

    #[test]
    fn test_capabilities_channel_max() {
        let grid = Capabilities {
            color_depth_bits: 6,
            ..Default::default()
        };
        assert_eq!(grid.channel_max(), 63);
        assert_eq!(Capabilities::default().channel_max(), 255);
    }

    #[test]
    fn test_serde_kebab_case_names() {
        let kind: DeviceKind = serde_yaml::from_str("grid-controller").unwrap();
        assert_eq!(kind, DeviceKind::GridController);
        let transport: TransportId = serde_yaml::from_str("udp-warls").unwrap();
        assert_eq!(transport, TransportId::UdpWarls);
    }
}
