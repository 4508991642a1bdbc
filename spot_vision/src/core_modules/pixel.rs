// THEORY (single-pixel color math):
// The shadow-robust difference compares crops in a hue/saturation/value space
// instead of RGB. A cast shadow mostly lowers a pixel's value (brightness) and
// barely moves its hue or saturation, so once the channels are separated the
// difference stage can weight them unequally.
//
// Channels use the compact 8-bit convention common to camera pipelines:
// - hue:        [0, 180) (degrees halved so it fits a byte)
// - saturation: [0, 255]
// - value:      [0, 255]
//
// Everything here is single-pixel scope: no neighbors, no history.

pub mod pixel {
    use image::Rgb;

    pub type Channel = u8;

    /// Hue range in the 8-bit convention (degrees / 2).
    pub const HUE_RANGE: u8 = 180;

    /// A pixel expressed as 8-bit hue, saturation and value.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct HsvPixel {
        /// Hue in [0, 180).
        pub hue: Channel,
        /// Saturation in [0, 255].
        pub saturation: Channel,
        /// Value in [0, 255].
        pub value: Channel,
    }

    impl HsvPixel {
        pub fn from_rgb(pixel: &Rgb<u8>) -> Self {
            let [red, green, blue] = pixel.0;
            let red_normalized = red as f32 / 255.0;
            let green_normalized = green as f32 / 255.0;
            let blue_normalized = blue as f32 / 255.0;

            let maximum_channel = red_normalized.max(green_normalized.max(blue_normalized));
            let minimum_channel = red_normalized.min(green_normalized.min(blue_normalized));
            let chroma = maximum_channel - minimum_channel;

            let value = (maximum_channel * 255.0).round() as Channel;
            let saturation = if maximum_channel <= 1e-6 {
                0
            } else {
                ((chroma / maximum_channel) * 255.0).round() as Channel
            };

            if chroma <= 1e-6 {
                return Self {
                    hue: 0,
                    saturation,
                    value,
                };
            }

            let inverse_chroma = 1.0 / chroma;
            let (base_difference, sector_offset) = if maximum_channel == red_normalized {
                (green_normalized - blue_normalized, 0.0)
            } else if maximum_channel == green_normalized {
                (blue_normalized - red_normalized, 2.0)
            } else {
                (red_normalized - green_normalized, 4.0)
            };

            let mut hue_degrees = (base_difference * inverse_chroma + sector_offset) * 60.0;
            if hue_degrees < 0.0 {
                hue_degrees += 360.0;
            }
            // 359.5 degrees rounds to 180, which is the same angle as 0.
            let hue = ((hue_degrees / 2.0).round() as u32 % HUE_RANGE as u32) as Channel;

            Self {
                hue,
                saturation,
                value,
            }
        }
    }

    /// Distance between two hues on the 8-bit hue circle, in [0, 90].
    pub fn hue_distance(a: Channel, b: Channel) -> Channel {
        let direct = a.abs_diff(b);
        direct.min(HUE_RANGE.saturating_sub(direct))
    }
}
