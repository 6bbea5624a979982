//! Wire format spoken by the LED controller.
//!
//! One frame per write, no length prefix; the opcode fixes the layout:
//!
//! ```text
//! 0x00 SetRawColors     [0x00][byte...]
//! 0x02 SetStaticColor   [0x02][r][g][b]
//! 0x05 SetBrightness    [0x05][level]
//! 0x06 SetRegionColors  [0x06][count][r0][g0][b0]...
//! ```

use crate::error::EncodeError;

/// Default TCP port of the controller.
pub const DEFAULT_PORT: u16 = 1338;

pub const OP_SET_RAW_COLORS: u8 = 0x00;
pub const OP_SET_STATIC_COLOR: u8 = 0x02;
pub const OP_SET_BRIGHTNESS: u8 = 0x05;
pub const OP_SET_REGION_COLORS: u8 = 0x06;

pub type Rgb = [u8; 3];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCommand {
    /// Payload is forwarded to the strip unmodified.
    SetRawColors(Vec<u8>),
    SetStaticColor(u8, u8, u8),
    SetBrightness(u8),
    /// One color per region band, in left-to-right screen order.
    SetRegionColors(Vec<Rgb>),
}

impl DeviceCommand {
    pub fn opcode(&self) -> u8 {
        match self {
            Self::SetRawColors(_) => OP_SET_RAW_COLORS,
            Self::SetStaticColor(..) => OP_SET_STATIC_COLOR,
            Self::SetBrightness(_) => OP_SET_BRIGHTNESS,
            Self::SetRegionColors(_) => OP_SET_REGION_COLORS,
        }
    }

    /// Encodes the command into a single wire frame.
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        let mut frame = Vec::with_capacity(self.encoded_len());
        frame.push(self.opcode());
        match self {
            Self::SetRawColors(bytes) => frame.extend_from_slice(bytes),
            Self::SetStaticColor(r, g, b) => frame.extend_from_slice(&[*r, *g, *b]),
            Self::SetBrightness(level) => frame.push(*level),
            Self::SetRegionColors(colors) => {
                let count = u8::try_from(colors.len())
                    .map_err(|_| EncodeError::TooManyRegions(colors.len()))?;
                frame.push(count);
                for color in colors {
                    frame.extend_from_slice(color);
                }
            }
        }
        Ok(frame)
    }

    fn encoded_len(&self) -> usize {
        match self {
            Self::SetRawColors(bytes) => 1 + bytes.len(),
            Self::SetStaticColor(..) => 4,
            Self::SetBrightness(_) => 2,
            Self::SetRegionColors(colors) => 2 + colors.len() * 3,
        }
    }
}

/// Maps a 0–100 brightness percentage onto the controller's 0–255 level.
pub fn brightness_level(percent: f32) -> u8 {
    if !percent.is_finite() {
        return 0;
    }
    (percent * 255.0 / 100.0).round().clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_color_frame_layout() {
        let frame = DeviceCommand::SetStaticColor(10, 20, 30).encode().unwrap();
        assert_eq!(frame, vec![0x02, 10, 20, 30]);
    }

    #[test]
    fn brightness_frame_layout() {
        let frame = DeviceCommand::SetBrightness(128).encode().unwrap();
        assert_eq!(frame, vec![0x05, 128]);
    }

    #[test]
    fn raw_payload_passes_through() {
        let payload = vec![0, 1, 2, 250, 255, 7, 7];
        let frame = DeviceCommand::SetRawColors(payload.clone()).encode().unwrap();
        assert_eq!(frame[0], 0x00);
        assert_eq!(&frame[1..], payload.as_slice());
    }

    #[test]
    fn sixteen_regions_encode_count_and_payload() {
        let colors: Vec<Rgb> = (0..16u8).map(|i| [i, i * 2, 255 - i]).collect();
        let frame = DeviceCommand::SetRegionColors(colors.clone())
            .encode()
            .unwrap();

        assert_eq!(frame.len(), 2 + 48);
        assert_eq!(frame[0], 0x06);
        assert_eq!(frame[1], 16);
        let flattened: Vec<u8> = colors.iter().flatten().copied().collect();
        assert_eq!(&frame[2..], flattened.as_slice());
    }

    #[test]
    fn region_payload_is_three_bytes_per_count() {
        for regions in [0usize, 1, 7, 16, 255] {
            let frame = DeviceCommand::SetRegionColors(vec![[1, 2, 3]; regions])
                .encode()
                .unwrap();
            let count = frame[1] as usize;
            assert_eq!(count, regions);
            assert_eq!(frame.len() - 2, 3 * count);
        }
    }

    #[test]
    fn too_many_regions_is_rejected() {
        let err = DeviceCommand::SetRegionColors(vec![[0, 0, 0]; 256])
            .encode()
            .unwrap_err();
        assert_eq!(err, EncodeError::TooManyRegions(256));
    }

    #[test]
    fn brightness_percent_maps_with_rounding() {
        for percent in 0..=100u32 {
            let expected = (percent as f64 * 255.0 / 100.0).round() as u8;
            assert_eq!(brightness_level(percent as f32), expected, "percent {percent}");
        }
        assert_eq!(brightness_level(50.0), 128);
        assert_eq!(brightness_level(100.0), 255);
    }

    #[test]
    fn brightness_out_of_range_is_clamped() {
        assert_eq!(brightness_level(-5.0), 0);
        assert_eq!(brightness_level(250.0), 255);
        assert_eq!(brightness_level(f32::NAN), 0);
    }
}
