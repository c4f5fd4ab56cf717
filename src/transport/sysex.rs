//! SysEx grid controller codec
//!
//! Requests are framed as `[0xF0, vendor(3), family, member, command,
//! data..., 0xF7]`. The member byte is the only difference between hardware
//! generations that otherwise share the protocol, so it lives in
//! [`GridVariant`] instead of being baked into the framing code.
//!
//! Identification uses the universal device-inquiry exchange; the reply
//! carries the vendor and variant bytes we match against.

use crate::color::Rgb;
use crate::device::Capabilities;
use crate::events::{now_ms, InputEvent, InputKind};
use crate::midi::MidiMessage;

use super::{DecodeError, EncodeError, LedUpdate};

/// LED batch command: quads of `[index, r, g, b]`
const CMD_SET_LED_RGB: u8 = 0x0B;

/// Universal SysEx device inquiry (non-realtime, all-call)
const DEVICE_INQUIRY: [u8; 6] = [0xF0, 0x7E, 0x7F, 0x06, 0x01, 0xF7];

/// Inquiry reply sub-IDs: non-realtime, general information, identity reply
const INQUIRY_REPLY_HEAD: [u8; 3] = [0x7E, 0x06, 0x02];

/// Longest LED batch one SysEx frame carries.
///
/// Conservative bound; the firmware accepts up to 97 quads but links choke
/// well before that when frames are sent back to back.
pub const MAX_BATCH: usize = 32;

/// Hardware variant of a grid controller family
///
/// `vendor` is the 3-byte manufacturer header, `family`/`member` the product
/// bytes that follow it. Two generations of the same product line differ
/// only in `member`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridVariant {
    pub vendor: [u8; 3],
    pub family: u8,
    pub member: u8,
}

impl GridVariant {
    /// Launchpad-class, previous generation
    pub const LAUNCH_PRO: GridVariant = GridVariant {
        vendor: [0x00, 0x20, 0x29],
        family: 0x02,
        member: 0x10,
    };

    /// Launchpad-class, current generation (identical protocol, one header
    /// byte apart from [`Self::LAUNCH_PRO`])
    pub const LAUNCH_MK3: GridVariant = GridVariant {
        vendor: [0x00, 0x20, 0x29],
        family: 0x02,
        member: 0x0D,
    };

    /// APC-class grid controller
    pub const APC_MK2: GridVariant = GridVariant {
        vendor: [0x47, 0x00, 0x29],
        family: 0x02,
        member: 0x7F,
    };

    /// Look up a variant by its config name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "launchpad-pro" => Some(Self::LAUNCH_PRO),
            "launchpad-mk3" => Some(Self::LAUNCH_MK3),
            "apc-mk2" => Some(Self::APC_MK2),
            _ => None,
        }
    }
}

/// Encode a batch of LED updates as one SysEx frame.
pub fn encode_led_batch(
    variant: &GridVariant,
    updates: &[LedUpdate],
) -> Result<Vec<u8>, EncodeError> {
    if updates.len() > MAX_BATCH {
        return Err(EncodeError::BatchTooLarge {
            units: updates.len(),
            max: MAX_BATCH,
        });
    }

    let mut frame = Vec::with_capacity(7 + updates.len() * 4 + 1);
    frame.push(0xF0);
    frame.extend_from_slice(&variant.vendor);
    frame.push(variant.family);
    frame.push(variant.member);
    frame.push(CMD_SET_LED_RGB);

    for update in updates {
        if update.index > 0x7F {
            return Err(EncodeError::IndexUnaddressable(update.index));
        }
        frame.push(update.index as u8);
        // Colors arrive already quantized to the device depth; masking keeps
        // the data bytes 7-bit clean regardless.
        frame.push(update.color.r & 0x7F);
        frame.push(update.color.g & 0x7F);
        frame.push(update.color.b & 0x7F);
    }

    frame.push(0xF7);
    Ok(frame)
}

/// Universal device-inquiry request bytes.
pub fn encode_device_inquiry() -> Vec<u8> {
    DEVICE_INQUIRY.to_vec()
}

/// Whether `bytes` is the identity reply for the given variant.
///
/// Reply shape: `F0 7E <dev> 06 02 <vendor(3)> <family> <member> ... F7`.
pub fn is_inquiry_reply(variant: &GridVariant, bytes: &[u8]) -> bool {
    let Some(MidiMessage::SysEx { data }) = MidiMessage::parse(bytes) else {
        return false;
    };
    // data = [7E, dev, 06, 02, vendor.., family, member, ...]
    if data.len() < 9 {
        return false;
    }
    if data[0] != INQUIRY_REPLY_HEAD[0]
        || data[2] != INQUIRY_REPLY_HEAD[1]
        || data[3] != INQUIRY_REPLY_HEAD[2]
    {
        return false;
    }
    data[4..7] == variant.vendor && data[7] == variant.family && data[8] == variant.member
}

/// Build the inquiry reply a device of this variant would send (test rigs
/// and the loopback link use this to impersonate hardware).
pub fn encode_inquiry_reply(variant: &GridVariant) -> Vec<u8> {
    let mut frame = vec![0xF0, 0x7E, 0x00, 0x06, 0x02];
    frame.extend_from_slice(&variant.vendor);
    frame.push(variant.family);
    frame.push(variant.member);
    // Firmware revision, irrelevant for matching
    frame.extend_from_slice(&[0x00, 0x00, 0x00, 0x01]);
    frame.push(0xF7);
    frame
}

/// Decode inbound grid controller bytes into normalized input events.
///
/// Note-on with nonzero velocity is a press, note-on zero / note-off a
/// release, poly pressure an aftertouch. The top-row buttons arrive as CC
/// and are velocity-insensitive by construction.
pub fn decode_input(
    device_id: &str,
    caps: &Capabilities,
    bytes: &[u8],
) -> Result<Vec<InputEvent>, DecodeError> {
    let msg = MidiMessage::parse(bytes)
        .ok_or_else(|| DecodeError::Malformed(format!("{} bytes", bytes.len())))?;

    let ts = now_ms();
    let event = |unit: u8, kind: InputKind, value: u8| InputEvent {
        device_id: device_id.to_string(),
        unit_index: unit as u16,
        kind,
        value,
        timestamp_ms: ts,
    };

    let events = match msg {
        MidiMessage::NoteOn { note, velocity, .. } => {
            let value = if caps.velocity_sensitive { velocity } else { 127 };
            vec![event(note, InputKind::Press, value)]
        }
        MidiMessage::NoteOff { note, .. } => vec![event(note, InputKind::Release, 0)],
        MidiMessage::PolyPressure { note, pressure, .. } => {
            vec![event(note, InputKind::Aftertouch, pressure)]
        }
        MidiMessage::ControlChange { cc, value, .. } => {
            if value > 0 {
                vec![event(cc, InputKind::Press, 127)]
            } else {
                vec![event(cc, InputKind::Release, 0)]
            }
        }
        // Vendor SysEx that is not an inquiry reply carries no input
        MidiMessage::SysEx { .. } => Vec::new(),
    };

    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(velocity: bool) -> Capabilities {
        Capabilities {
            color_depth_bits: 6,
            velocity_sensitive: velocity,
            animation_modes: Vec::new(),
        }
    }

    #[test]
    fn test_led_batch_framing() {
        let updates = [
            LedUpdate {
                index: 0,
                color: Rgb::new(63, 0, 63),
            },
            LedUpdate {
                index: 7,
                color: Rgb::new(63, 0, 0),
            },
        ];
        let frame = encode_led_batch(&GridVariant::LAUNCH_PRO, &updates).unwrap();
        assert_eq!(
            frame,
            vec![
                0xF0, 0x00, 0x20, 0x29, 0x02, 0x10, 0x0B, //
                0, 63, 0, 63, //
                7, 63, 0, 0, //
                0xF7
            ]
        );
    }

    #[test]
    fn test_variant_changes_one_header_byte() {
        let update = [LedUpdate {
            index: 1,
            color: Rgb::new(1, 2, 3),
        }];
        let pro = encode_led_batch(&GridVariant::LAUNCH_PRO, &update).unwrap();
        let mk3 = encode_led_batch(&GridVariant::LAUNCH_MK3, &update).unwrap();
        let diff: Vec<usize> = pro
            .iter()
            .zip(mk3.iter())
            .enumerate()
            .filter(|(_, (a, b))| a != b)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(diff, vec![5]); // the member byte only
    }

    #[test]
    fn test_batch_limits() {
        let too_many: Vec<LedUpdate> = (0..MAX_BATCH as u16 + 1)
            .map(|i| LedUpdate {
                index: i,
                color: Rgb::BLACK,
            })
            .collect();
        assert!(matches!(
            encode_led_batch(&GridVariant::LAUNCH_PRO, &too_many),
            Err(EncodeError::BatchTooLarge { .. })
        ));

        let out_of_range = [LedUpdate {
            index: 128,
            color: Rgb::BLACK,
        }];
        assert_eq!(
            encode_led_batch(&GridVariant::LAUNCH_PRO, &out_of_range),
            Err(EncodeError::IndexUnaddressable(128))
        );
    }

    #[test]
    fn test_inquiry_reply_matching() {
        let reply = encode_inquiry_reply(&GridVariant::LAUNCH_PRO);
        assert!(is_inquiry_reply(&GridVariant::LAUNCH_PRO, &reply));
        // The other generation must not match
        assert!(!is_inquiry_reply(&GridVariant::LAUNCH_MK3, &reply));
        assert!(!is_inquiry_reply(&GridVariant::LAUNCH_PRO, &[0x90, 1, 1]));
    }

    #[test]
    fn test_press_release_decode() {
        let press = decode_input("g", &caps(true), &[0x90, 36, 100]).unwrap();
        assert_eq!(press[0].kind, InputKind::Press);
        assert_eq!(press[0].unit_index, 36);
        assert_eq!(press[0].value, 100);

        // Note-on with zero velocity is a release
        let release = decode_input("g", &caps(true), &[0x90, 36, 0]).unwrap();
        assert_eq!(release[0].kind, InputKind::Release);
        assert_eq!(release[0].value, 0);
    }

    #[test]
    fn test_velocity_insensitive_synthesizes_full_value() {
        let press = decode_input("g", &caps(false), &[0x90, 36, 17]).unwrap();
        assert_eq!(press[0].value, 127);
    }

    #[test]
    fn test_aftertouch_decode() {
        let events = decode_input("g", &caps(true), &[0xA0, 40, 64]).unwrap();
        assert_eq!(events[0].kind, InputKind::Aftertouch);
        assert_eq!(events[0].value, 64);
    }

    #[test]
    fn test_malformed_packet_is_an_error_not_a_panic() {
        assert!(decode_input("g", &caps(true), &[0x90, 36]).is_err());
        assert!(decode_input("g", &caps(true), &[]).is_err());
    }

    #[test]
    fn test_variant_names() {
        assert_eq!(
            GridVariant::from_name("launchpad-pro"),
            Some(GridVariant::LAUNCH_PRO)
        );
        assert_eq!(GridVariant::from_name("unknown"), None);
    }
}
