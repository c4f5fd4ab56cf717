//! RGB color values and per-device bit-depth handling
//!
//! Hardware disagrees about channel resolution: older grid controllers take
//! 0-63 per channel, LED strips take 0-255. The depth is a declared device
//! capability, and every conversion goes through this module.

use serde::{Deserialize, Serialize};

/// An RGB color in a device's native channel domain.
///
/// The valid range per channel is `0..=channel_max` for the device the color
/// is destined for (63 on 6-bit grid hardware, 255 on 8-bit LED hardware).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const BLACK: Rgb = Rgb { r: 0, g: 0, b: 0 };

    pub fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Quantize an 8-bit logical color down to `depth_bits` per channel.
    ///
    /// `depth_bits` must be 1-8; an 8-bit depth is the identity.
    pub fn quantize(self, depth_bits: u8) -> Self {
        let shift = 8u8.saturating_sub(depth_bits.clamp(1, 8));
        Self {
            r: self.r >> shift,
            g: self.g >> shift,
            b: self.b >> shift,
        }
    }

    /// Expand a color in `depth_bits` domain back to the 8-bit domain.
    ///
    /// Replicates the high bits into the low bits so full scale maps to 255
    /// rather than 252 (the usual bit-replication expansion).
    pub fn expand_to_8bit(self, depth_bits: u8) -> Self {
        let bits = depth_bits.clamp(1, 8);
        if bits == 8 {
            return self;
        }
        let expand = |v: u8| -> u8 {
            let mut out: u16 = 0;
            let mut filled = 0u8;
            while filled < 8 {
                let take = bits.min(8 - filled);
                out = (out << take) | ((v as u16) >> (bits - take));
                filled += take;
            }
            out as u8
        };
        Self {
            r: expand(self.r),
            g: expand(self.g),
            b: expand(self.b),
        }
    }

    /// Clamp each channel to `channel_max`.
    pub fn clamp_to(self, channel_max: u8) -> Self {
        Self {
            r: self.r.min(channel_max),
            g: self.g.min(channel_max),
            b: self.b.min(channel_max),
        }
    }
}

/// Maximum channel value for a given bit depth (e.g. 6 -> 63, 8 -> 255).
pub fn channel_max(depth_bits: u8) -> u8 {
    match depth_bits.clamp(1, 8) {
        8 => 255,
        bits => (1u8 << bits) - 1,
    }
}
