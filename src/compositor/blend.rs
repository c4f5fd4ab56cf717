//! Per-channel blend arithmetic
//!
//! All math runs in the device's native channel domain `0..=channel_max`, so
//! a 6-bit grid and an 8-bit strip blend identically in relative terms.

use serde::{Deserialize, Serialize};

use crate::color::Rgb;

/// How overlapping frames combine on a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlendMode {
    /// `a * b / max`; darkens, identity is full white
    Multiply,
    /// `max - (max-a)(max-b)/max`; lightens, identity is black
    Screen,
    /// `min(a + b, max)`; saturating sum
    Additive,
    /// `max(a, b)`; brightest writer wins
    #[default]
    Max,
}

impl BlendMode {
    fn channel(self, a: u8, b: u8, max: u8) -> u8 {
        let (a, b, max) = (a as u16, b as u16, max as u16);
        let out = match self {
            BlendMode::Multiply => a * b / max,
            BlendMode::Screen => max - (max - a) * (max - b) / max,
            BlendMode::Additive => (a + b).min(max),
            BlendMode::Max => a.max(b),
        };
        out as u8
    }

    /// Blend two colors channel-wise. Inputs are assumed clamped to
    /// `channel_max`; the result stays within it for every mode.
    pub fn blend(self, a: Rgb, b: Rgb, channel_max: u8) -> Rgb {
        Rgb {
            r: self.channel(a.r, b.r, channel_max),
            g: self.channel(a.g, b.g, channel_max),
            b: self.channel(a.b, b.b, channel_max),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const MAX6: u8 = 63;

    #[test]
    fn test_multiply_darkens() {
        let a = Rgb::new(63, 32, 0);
        let white = Rgb::new(63, 63, 63);
        // Full white is the multiply identity
        assert_eq!(BlendMode::Multiply.blend(a, white, MAX6), a);
        assert_eq!(
            BlendMode::Multiply.blend(a, Rgb::new(31, 31, 31), MAX6),
            Rgb::new(31, 15, 0)
        );
    }

    #[test]
    fn test_screen_lightens() {
        let a = Rgb::new(63, 32, 0);
        // Black is the screen identity
        assert_eq!(BlendMode::Screen.blend(a, Rgb::BLACK, MAX6), a);
        let out = BlendMode::Screen.blend(Rgb::new(32, 32, 32), Rgb::new(32, 32, 32), MAX6);
        assert!(out.r > 32);
    }

    #[test]
    fn test_additive_saturates() {
        assert_eq!(
            BlendMode::Additive.blend(Rgb::new(40, 40, 40), Rgb::new(40, 10, 0), MAX6),
            Rgb::new(63, 50, 40)
        );
    }

    #[test]
    fn test_max_takes_brightest_per_channel() {
        assert_eq!(
            BlendMode::Max.blend(Rgb::new(63, 0, 0), Rgb::new(0, 0, 63), MAX6),
            Rgb::new(63, 0, 63)
        );
    }

    proptest! {
        /// Every mode stays inside the channel domain for all inputs.
        #[test]
        fn prop_result_within_channel_max(
            ar in 0u8..=63, ag in 0u8..=63, ab in 0u8..=63,
            br in 0u8..=63, bg in 0u8..=63, bb in 0u8..=63,
        ) {
            let a = Rgb::new(ar, ag, ab);
            let b = Rgb::new(br, bg, bb);
            for mode in [BlendMode::Multiply, BlendMode::Screen, BlendMode::Additive, BlendMode::Max] {
                let out = mode.blend(a, b, MAX6);
                prop_assert!(out.r <= MAX6 && out.g <= MAX6 && out.b <= MAX6);
            }
        }

        /// All four modes are commutative, so fold order within a priority
        /// class cannot change the composited output.
        #[test]
        fn prop_blend_is_commutative(
            ar in 0u8..=63, ag in 0u8..=63, ab in 0u8..=63,
            br in 0u8..=63, bg in 0u8..=63, bb in 0u8..=63,
        ) {
            let a = Rgb::new(ar, ag, ab);
            let b = Rgb::new(br, bg, bb);
            for mode in [BlendMode::Multiply, BlendMode::Screen, BlendMode::Additive, BlendMode::Max] {
                prop_assert_eq!(mode.blend(a, b, MAX6), mode.blend(b, a, MAX6));
            }
        }
    }
}
