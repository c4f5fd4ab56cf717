//! Transport adapters: pure, stateless wire codecs
//!
//! One codec per wire protocol, dispatched through a tagged enum rather than
//! trait objects. Codecs only translate between typed payloads and bytes;
//! all I/O belongs to the device session layer.

pub mod sysex;
pub mod warls;
pub mod wled_json;

use thiserror::Error;

use crate::color::Rgb;
use crate::device::{Capabilities, TransportId};
use crate::events::InputEvent;

pub use sysex::GridVariant;

/// One unit's desired color, addressed by index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedUpdate {
    pub index: u16,
    pub color: Rgb,
}

/// How a transport addresses units on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireMode {
    /// Individually addressed updates (SysEx quads, JSON index list)
    Sparse,
    /// A contiguous run of colors from unit 0 (WARLS-style strip packet)
    DensePrefix,
}

/// Encoding failure: the update is logged and dropped, never retried
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncodeError {
    #[error("batch of {units} units exceeds the transport limit of {max}")]
    BatchTooLarge { units: usize, max: usize },

    #[error("unit index {0} does not fit the transport's 7-bit address space")]
    IndexUnaddressable(u16),

    #[error("operation not supported by this transport")]
    Unsupported,
}

/// Decoding failure: the packet is logged and dropped, the stream continues
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("truncated or malformed packet: {0}")]
    Malformed(String),

    #[error("identity signature does not match the configured device")]
    IdentityMismatch,

    #[error("invalid relay envelope: {0}")]
    BadEnvelope(String),
}

/// Stateless codec for one device's wire protocol
#[derive(Debug, Clone)]
pub enum TransportCodec {
    /// SysEx-framed grid controller protocol, parameterized by hardware
    /// variant (generations share the protocol modulo one header byte)
    GridSysex(GridVariant),
    /// WLED-style HTTP JSON state replacement
    WledJson,
    /// Raw per-pixel UDP packet
    Warls,
    /// WARLS payload wrapped in a JSON envelope for the local relay bridge
    Relay { device_id: String },
}

impl TransportCodec {
    /// Build the codec for a device's transport.
    ///
    /// `variant` is required for SysEx grid controllers and ignored
    /// elsewhere; a missing variant falls back to the current generation.
    pub fn for_transport(transport: TransportId, device_id: &str, variant: Option<GridVariant>) -> Self {
        match transport {
            TransportId::SysexMidi => {
                TransportCodec::GridSysex(variant.unwrap_or(GridVariant::LAUNCH_MK3))
            }
            TransportId::HttpJson => TransportCodec::WledJson,
            TransportId::UdpWarls => TransportCodec::Warls,
            TransportId::RelaySocket => TransportCodec::Relay {
                device_id: device_id.to_string(),
            },
        }
    }

    pub fn wire_mode(&self) -> WireMode {
        match self {
            TransportCodec::GridSysex(_) | TransportCodec::WledJson => WireMode::Sparse,
            TransportCodec::Warls | TransportCodec::Relay { .. } => WireMode::DensePrefix,
        }
    }

    /// Encode a batch of individually addressed updates (sparse transports).
    pub fn encode_led_batch(
        &self,
        updates: &[LedUpdate],
        caps: &Capabilities,
    ) -> Result<Vec<u8>, EncodeError> {
        match self {
            TransportCodec::GridSysex(variant) => sysex::encode_led_batch(variant, updates),
            TransportCodec::WledJson => wled_json::encode_led_batch(updates, caps),
            _ => Err(EncodeError::Unsupported),
        }
    }

    /// Encode a contiguous strip of colors starting at unit 0 (dense
    /// transports). `hold_secs` is the device-side realtime hold; derive it
    /// from the sender's keep-alive interval with
    /// [`warls::realtime_hold_secs`] so the override never lapses between
    /// refreshes.
    pub fn encode_strip(
        &self,
        colors: &[Rgb],
        caps: &Capabilities,
        hold_secs: u8,
    ) -> Result<Vec<u8>, EncodeError> {
        match self {
            TransportCodec::Warls => warls::encode_strip(colors, caps, hold_secs),
            TransportCodec::Relay { device_id } => {
                let inner = warls::encode_strip(colors, caps, hold_secs)?;
                Ok(warls::wrap_relay_envelope(device_id, &inner))
            }
            _ => Err(EncodeError::Unsupported),
        }
    }

    /// Identification request bytes, for transports that handshake in-band.
    pub fn encode_handshake(&self) -> Option<Vec<u8>> {
        match self {
            TransportCodec::GridSysex(_) => Some(sysex::encode_device_inquiry()),
            TransportCodec::Relay { device_id } => Some(warls::encode_relay_hello(device_id)),
            _ => None,
        }
    }

    /// Keep-alive bytes, for transports that heartbeat in-band.
    ///
    /// The grid inquiry doubles as the keep-alive; its reply refreshes the
    /// session's heartbeat clock.
    pub fn encode_heartbeat(&self) -> Option<Vec<u8>> {
        match self {
            TransportCodec::GridSysex(_) => Some(sysex::encode_device_inquiry()),
            _ => None,
        }
    }

    /// Whether inbound bytes are the identification reply for this device.
    pub fn is_handshake_reply(&self, bytes: &[u8]) -> bool {
        match self {
            TransportCodec::GridSysex(variant) => sysex::is_inquiry_reply(variant, bytes),
            _ => false,
        }
    }

    /// Validate an out-of-band identity reply (HTTP info document).
    pub fn verify_identity(&self, reply: &[u8], expected_units: u16) -> Result<(), DecodeError> {
        match self {
            TransportCodec::WledJson => wled_json::verify_info_reply(reply, expected_units),
            _ => Ok(()),
        }
    }

    /// Decode inbound bytes into normalized input events.
    ///
    /// LED-only transports produce no input; they return an empty vec for
    /// well-formed packets and an error for garbage.
    pub fn decode(
        &self,
        device_id: &str,
        caps: &Capabilities,
        bytes: &[u8],
    ) -> Result<Vec<InputEvent>, DecodeError> {
        match self {
            TransportCodec::GridSysex(_) => sysex::decode_input(device_id, caps, bytes),
            TransportCodec::Relay { .. } => warls::decode_relay_inbound(bytes),
            _ => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_modes() {
        let grid = TransportCodec::for_transport(TransportId::SysexMidi, "g", None);
        assert_eq!(grid.wire_mode(), WireMode::Sparse);
        let udp = TransportCodec::for_transport(TransportId::UdpWarls, "s", None);
        assert_eq!(udp.wire_mode(), WireMode::DensePrefix);
    }

    #[test]
    fn test_dense_codec_rejects_sparse_encode() {
        let udp = TransportCodec::for_transport(TransportId::UdpWarls, "s", None);
        let err = udp
            .encode_led_batch(&[], &Capabilities::default())
            .unwrap_err();
        assert_eq!(err, EncodeError::Unsupported);
    }

    #[test]
    fn test_handshake_presence_by_transport() {
        let grid = TransportCodec::for_transport(TransportId::SysexMidi, "g", None);
        assert!(grid.encode_handshake().is_some());
        let http = TransportCodec::for_transport(TransportId::HttpJson, "w", None);
        assert!(http.encode_handshake().is_none());
    }
}
