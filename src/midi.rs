//! MIDI message parsing and encoding
//!
//! Covers the subset of the protocol grid controllers speak: note on/off for
//! pad presses, polyphonic pressure for aftertouch, control change for the
//! top-row buttons, and SysEx for everything vendor-specific.

use std::fmt;

/// MIDI message types used by grid controllers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MidiMessage {
    /// Note Off: channel (0-15), note (0-127), velocity (0-127)
    NoteOff { channel: u8, note: u8, velocity: u8 },

    /// Note On: channel (0-15), note (0-127), velocity (0-127)
    NoteOn { channel: u8, note: u8, velocity: u8 },

    /// Polyphonic Key Pressure: channel (0-15), note (0-127), pressure (0-127)
    PolyPressure { channel: u8, note: u8, pressure: u8 },

    /// Control Change: channel (0-15), cc (0-127), value (0-127)
    ControlChange { channel: u8, cc: u8, value: u8 },

    /// System Exclusive: payload between 0xF0 and 0xF7
    SysEx { data: Vec<u8> },
}

impl MidiMessage {
    /// Parse a MIDI message from raw bytes
    ///
    /// Returns `None` for truncated input, running status, and status bytes
    /// outside the supported subset.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.is_empty() {
            return None;
        }

        let status = data[0];

        // Running status (data byte first) is never sent by the hardware we
        // talk to; reject it rather than guess.
        if status < 0x80 {
            return None;
        }

        if status < 0xF0 {
            let message_type = status & 0xF0;
            let channel = status & 0x0F;

            match message_type {
                0x80 => {
                    if data.len() < 3 {
                        return None;
                    }
                    Some(MidiMessage::NoteOff {
                        channel,
                        note: data[1] & 0x7F,
                        velocity: data[2] & 0x7F,
                    })
                }
                0x90 => {
                    // Note On with velocity 0 is a Note Off by convention
                    if data.len() < 3 {
                        return None;
                    }
                    let note = data[1] & 0x7F;
                    let velocity = data[2] & 0x7F;

                    if velocity == 0 {
                        Some(MidiMessage::NoteOff {
                            channel,
                            note,
                            velocity: 0,
                        })
                    } else {
                        Some(MidiMessage::NoteOn {
                            channel,
                            note,
                            velocity,
                        })
                    }
                }
                0xA0 => {
                    if data.len() < 3 {
                        return None;
                    }
                    Some(MidiMessage::PolyPressure {
                        channel,
                        note: data[1] & 0x7F,
                        pressure: data[2] & 0x7F,
                    })
                }
                0xB0 => {
                    if data.len() < 3 {
                        return None;
                    }
                    Some(MidiMessage::ControlChange {
                        channel,
                        cc: data[1] & 0x7F,
                        value: data[2] & 0x7F,
                    })
                }
                _ => None,
            }
        } else if status == 0xF0 {
            // System Exclusive - payload runs until 0xF7
            data.iter()
                .position(|&b| b == 0xF7)
                .map(|end| MidiMessage::SysEx {
                    data: data[1..end].to_vec(),
                })
        } else {
            None
        }
    }

    /// Encode the message to MIDI bytes
    pub fn encode(&self) -> Vec<u8> {
        match *self {
            MidiMessage::NoteOff {
                channel,
                note,
                velocity,
            } => {
                vec![0x80 | (channel & 0x0F), note & 0x7F, velocity & 0x7F]
            }
            MidiMessage::NoteOn {
                channel,
                note,
                velocity,
            } => {
                vec![0x90 | (channel & 0x0F), note & 0x7F, velocity & 0x7F]
            }
            MidiMessage::PolyPressure {
                channel,
                note,
                pressure,
            } => {
                vec![0xA0 | (channel & 0x0F), note & 0x7F, pressure & 0x7F]
            }
            MidiMessage::ControlChange { channel, cc, value } => {
                vec![0xB0 | (channel & 0x0F), cc & 0x7F, value & 0x7F]
            }
            MidiMessage::SysEx { ref data } => {
                let mut result = vec![0xF0];
                result.extend_from_slice(data);
                result.push(0xF7);
                result
            }
        }
    }
}

impl fmt::Display for MidiMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            MidiMessage::NoteOff {
                channel,
                note,
                velocity,
            } => {
                write!(f, "NoteOff ch:{} n:{} v:{}", channel + 1, note, velocity)
            }
            MidiMessage::NoteOn {
                channel,
                note,
                velocity,
            } => {
                write!(f, "NoteOn ch:{} n:{} v:{}", channel + 1, note, velocity)
            }
            MidiMessage::PolyPressure {
                channel,
                note,
                pressure,
            } => {
                write!(
                    f,
                    "PolyPressure ch:{} n:{} p:{}",
                    channel + 1,
                    note,
                    pressure
                )
            }
            MidiMessage::ControlChange { channel, cc, value } => {
                write!(f, "CC ch:{} cc:{} v:{}", channel + 1, cc, value)
            }
            MidiMessage::SysEx { ref data } => {
                write!(f, "SysEx {} bytes", data.len())
            }
        }
    }
}

/// Format MIDI bytes as hex string for debugging
pub fn format_hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_note_on_parsing() {
        let data = vec![0x90, 60, 100];
        let msg = MidiMessage::parse(&data).unwrap();

        assert_eq!(
            msg,
            MidiMessage::NoteOn {
                channel: 0,
                note: 60,
                velocity: 100,
            }
        );
    }

    #[test]
    fn test_note_on_velocity_zero_is_note_off() {
        let data = vec![0x90, 60, 0];
        let msg = MidiMessage::parse(&data).unwrap();

        assert_eq!(
            msg,
            MidiMessage::NoteOff {
                channel: 0,
                note: 60,
                velocity: 0,
            }
        );
    }

    #[test]
    fn test_poly_pressure() {
        let data = vec![0xA5, 36, 90];
        let msg = MidiMessage::parse(&data).unwrap();

        assert_eq!(
            msg,
            MidiMessage::PolyPressure {
                channel: 5,
                note: 36,
                pressure: 90,
            }
        );
    }

    #[test]
    fn test_sysex_roundtrip() {
        let raw = vec![0xF0, 0x00, 0x20, 0x29, 0x02, 0x10, 0x0B, 0xF7];
        let msg = MidiMessage::parse(&raw).unwrap();
        assert_eq!(
            msg,
            MidiMessage::SysEx {
                data: vec![0x00, 0x20, 0x29, 0x02, 0x10, 0x0B]
            }
        );
        assert_eq!(msg.encode(), raw);
    }

    #[test]
    fn test_truncated_and_garbage_input() {
        assert_eq!(MidiMessage::parse(&[]), None);
        assert_eq!(MidiMessage::parse(&[0x90, 60]), None);
        assert_eq!(MidiMessage::parse(&[0x42, 0x00]), None); // running status
        assert_eq!(MidiMessage::parse(&[0xF0, 0x00, 0x20]), None); // unterminated SysEx
    }

    #[test]
    fn test_format_hex() {
        assert_eq!(format_hex(&[0x90, 0x3C, 0x64]), "90 3C 64");
    }
}
