//! Raw per-pixel UDP codec and the relay-socket envelope
//!
//! The strip packet is `[protocol_id, timeout, R,G,B per unit in index
//! order]`, low latency and fire-and-forget. The relay variant wraps the same
//! bytes in a small JSON envelope so a local bridge process can forward them
//! to hardware the gateway cannot reach directly.

use serde::{Deserialize, Serialize};

use crate::color::Rgb;
use crate::device::Capabilities;
use crate::events::InputEvent;

use super::{DecodeError, EncodeError};

/// Protocol tag for the per-pixel realtime format
pub const PROTOCOL_ID: u8 = 0x01;

/// Ceiling for the hold byte; the protocol reads 255 as "hold until the
/// next packet".
pub const REALTIME_HOLD_MAX_S: u8 = 255;

/// Seconds the device holds the realtime override before reverting to its
/// own program.
///
/// The hold must outlast the keep-alive interval, or an idle strip flips
/// back to its built-in program between refreshes. One extra second absorbs
/// tick scheduling jitter.
pub fn realtime_hold_secs(keepalive_interval_ms: u64) -> u8 {
    let secs = keepalive_interval_ms.div_ceil(1_000).saturating_add(1);
    secs.min(u64::from(REALTIME_HOLD_MAX_S)) as u8
}

/// Units per datagram; 3 bytes each plus the 2-byte header stays well under
/// a 1500-byte MTU.
pub const MAX_UNITS: usize = 490;

/// Encode a contiguous run of colors from unit 0.
///
/// Colors are expanded from the device's native depth to the 8-bit wire
/// domain. Partial updates send a prefix of the strip; anything past
/// `colors.len()` is left untouched by the device. `hold_secs` is how long
/// the device keeps this override before reverting, normally
/// [`realtime_hold_secs`] of the sender's keep-alive interval.
pub fn encode_strip(
    colors: &[Rgb],
    caps: &Capabilities,
    hold_secs: u8,
) -> Result<Vec<u8>, EncodeError> {
    if colors.len() > MAX_UNITS {
        return Err(EncodeError::BatchTooLarge {
            units: colors.len(),
            max: MAX_UNITS,
        });
    }

    let mut packet = Vec::with_capacity(2 + colors.len() * 3);
    packet.push(PROTOCOL_ID);
    packet.push(hold_secs);
    for color in colors {
        let c = color.expand_to_8bit(caps.color_depth_bits);
        packet.push(c.r);
        packet.push(c.g);
        packet.push(c.b);
    }
    Ok(packet)
}

/// Relay envelope carried as one text frame over the bridge socket
#[derive(Debug, Serialize, Deserialize)]
struct RelayEnvelope<'a> {
    device: &'a str,
    /// Hex-encoded wire payload; hex keeps the envelope printable in the
    /// bridge's own logs
    payload: String,
}

/// Wrap an already-encoded strip packet for the relay bridge.
pub fn wrap_relay_envelope(device_id: &str, payload: &[u8]) -> Vec<u8> {
    let envelope = RelayEnvelope {
        device: device_id,
        payload: hex::encode_upper(payload),
    };
    serde_json::to_vec(&envelope).expect("envelope serialization is infallible")
}

/// Hello frame announcing which device this session speaks for.
pub fn encode_relay_hello(device_id: &str) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({ "device": device_id, "hello": true }))
        .expect("hello serialization is infallible")
}

/// Decode a message arriving from the relay bridge.
///
/// The bridge only forwards acknowledgements and status frames today; LED
/// devices have no input units, so a well-formed frame yields no events.
/// Garbage still has to be rejected so the session can count it.
pub fn decode_relay_inbound(bytes: &[u8]) -> Result<Vec<InputEvent>, DecodeError> {
    let value: serde_json::Value = serde_json::from_slice(bytes)
        .map_err(|e| DecodeError::BadEnvelope(e.to_string()))?;
    if !value.is_object() {
        return Err(DecodeError::BadEnvelope("expected a JSON object".into()));
    }
    Ok(Vec::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(bits: u8) -> Capabilities {
        Capabilities {
            color_depth_bits: bits,
            ..Default::default()
        }
    }

    #[test]
    fn test_strip_packet_layout() {
        let colors = [Rgb::new(255, 0, 0), Rgb::new(0, 255, 0), Rgb::new(0, 0, 255)];
        let packet = encode_strip(&colors, &caps(8), 6).unwrap();
        assert_eq!(
            packet,
            vec![
                PROTOCOL_ID,
                6, // hold seconds
                255, 0, 0, //
                0, 255, 0, //
                0, 0, 255,
            ]
        );
    }

    #[test]
    fn test_hold_outlasts_keepalive_interval() {
        // Rounded up to whole seconds plus headroom, capped at the protocol
        // maximum.
        assert_eq!(realtime_hold_secs(5_000), 6);
        assert_eq!(realtime_hold_secs(4_500), 6);
        assert_eq!(realtime_hold_secs(1), 2);
        assert_eq!(realtime_hold_secs(10_000_000), REALTIME_HOLD_MAX_S);

        for interval_ms in [1_000u64, 5_000, 60_000] {
            let hold = realtime_hold_secs(interval_ms);
            assert!(
                u64::from(hold) * 1_000 > interval_ms,
                "hold {hold}s lapses within a {interval_ms}ms keep-alive cycle"
            );
        }
    }

    #[test]
    fn test_native_depth_expansion() {
        let packet = encode_strip(&[Rgb::new(63, 0, 32)], &caps(6), 6).unwrap();
        assert_eq!(&packet[2..], &[255, 0, 130]);
    }

    #[test]
    fn test_unit_limit() {
        let colors = vec![Rgb::BLACK; MAX_UNITS + 1];
        assert!(matches!(
            encode_strip(&colors, &caps(8), 6),
            Err(EncodeError::BatchTooLarge { .. })
        ));
    }

    #[test]
    fn test_relay_envelope_wraps_payload_hex() {
        let inner = encode_strip(&[Rgb::new(1, 2, 3)], &caps(8), 6).unwrap();
        let framed = wrap_relay_envelope("strip-1", &inner);

        let doc: serde_json::Value = serde_json::from_slice(&framed).unwrap();
        assert_eq!(doc["device"], "strip-1");
        let decoded = hex::decode(doc["payload"].as_str().unwrap()).unwrap();
        assert_eq!(decoded, inner);
    }

    #[test]
    fn test_relay_inbound_rejects_garbage() {
        assert!(decode_relay_inbound(br#"{"ack":true}"#).unwrap().is_empty());
        assert!(decode_relay_inbound(b"\x01\x02\x03").is_err());
        assert!(decode_relay_inbound(b"[1,2,3]").is_err());
    }
}
