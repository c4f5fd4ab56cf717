//! WLED-style HTTP JSON codec
//!
//! Builds a state-replace payload addressing individual units by index.
//! Suitable for low-frequency or bulk updates only; the session layer keeps
//! this transport under ~30 updates/sec by construction (flush throttle).

use serde_json::{json, Value};

use crate::device::Capabilities;

use super::{DecodeError, EncodeError, LedUpdate};

/// Most index/color assignments one state payload may carry.
pub const MAX_BATCH: usize = 256;

/// Encode a batch as a JSON segment update: `{"seg":{"i":[idx,"RRGGBB",..]}}`.
///
/// Colors are expanded from the device's native depth to the 8-bit hex the
/// firmware expects.
pub fn encode_led_batch(updates: &[LedUpdate], caps: &Capabilities) -> Result<Vec<u8>, EncodeError> {
    if updates.len() > MAX_BATCH {
        return Err(EncodeError::BatchTooLarge {
            units: updates.len(),
            max: MAX_BATCH,
        });
    }

    let mut items: Vec<Value> = Vec::with_capacity(updates.len() * 2);
    for update in updates {
        let c = update.color.expand_to_8bit(caps.color_depth_bits);
        items.push(json!(update.index));
        items.push(json!(format!("{:02X}{:02X}{:02X}", c.r, c.g, c.b)));
    }

    let payload = json!({
        "on": true,
        "seg": { "i": items },
    });

    Ok(payload.to_string().into_bytes())
}

/// Validate the info document returned by the identification request.
///
/// The declared LED count is the identity signature; a mismatch means the
/// config points at different hardware than expected.
pub fn verify_info_reply(reply: &[u8], expected_units: u16) -> Result<(), DecodeError> {
    let doc: Value = serde_json::from_slice(reply)
        .map_err(|e| DecodeError::Malformed(format!("info reply: {e}")))?;

    let count = doc
        .pointer("/leds/count")
        .and_then(Value::as_u64)
        .ok_or_else(|| DecodeError::Malformed("info reply missing leds.count".into()))?;

    if count != expected_units as u64 {
        return Err(DecodeError::IdentityMismatch);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::color::Rgb;

    fn caps(bits: u8) -> Capabilities {
        Capabilities {
            color_depth_bits: bits,
            ..Default::default()
        }
    }

    #[test]
    fn test_payload_shape() {
        let updates = [
            LedUpdate {
                index: 0,
                color: Rgb::new(255, 0, 0),
            },
            LedUpdate {
                index: 5,
                color: Rgb::new(0, 0, 255),
            },
        ];
        let bytes = encode_led_batch(&updates, &caps(8)).unwrap();
        let doc: Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(doc["on"], json!(true));
        assert_eq!(doc["seg"]["i"], json!([0, "FF0000", 5, "0000FF"]));
    }

    #[test]
    fn test_colors_expand_from_native_depth() {
        let updates = [LedUpdate {
            index: 1,
            color: Rgb::new(63, 0, 63), // 6-bit full scale
        }];
        let bytes = encode_led_batch(&updates, &caps(6)).unwrap();
        let doc: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(doc["seg"]["i"], json!([1, "FF00FF"]));
    }

    #[test]
    fn test_batch_limit() {
        let too_many: Vec<LedUpdate> = (0..MAX_BATCH as u16 + 1)
            .map(|i| LedUpdate {
                index: i,
                color: Rgb::BLACK,
            })
            .collect();
        assert!(matches!(
            encode_led_batch(&too_many, &caps(8)),
            Err(EncodeError::BatchTooLarge { .. })
        ));
    }

    #[test]
    fn test_info_reply_verification() {
        let ok = br#"{"leds":{"count":60},"name":"strip"}"#;
        assert!(verify_info_reply(ok, 60).is_ok());
        assert_eq!(
            verify_info_reply(ok, 61),
            Err(DecodeError::IdentityMismatch)
        );
        assert!(matches!(
            verify_info_reply(b"{\"leds\":{}}", 60),
            Err(DecodeError::Malformed(_))
        ));
        assert!(matches!(
            verify_info_reply(b"not json", 60),
            Err(DecodeError::Malformed(_))
        ));
    }
}
