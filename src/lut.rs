//! Lookup table for 8-bit display renditions of captured frames.
//!
//! Raw pixels inside the input range map linearly onto the output range;
//! values outside the input range clip to its ends.

use crate::error::{DcamError, DcamResult};
use crate::property::FrameGeometry;

/// Inclusive value range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LutRange {
    /// Lowest value, inclusive.
    pub min: u32,
    /// Highest value, inclusive.
    pub max: u32,
}

impl LutRange {
    /// Range `[min, max]`; `min` must be below `max` and `max` at most
    /// `limit`.
    pub fn new(max: u32, min: u32, limit: u32) -> DcamResult<Self> {
        if min >= max {
            return Err(DcamError::OutOfRange(format!(
                "LUT range min {min} must be below max {max}"
            )));
        }
        if max > limit {
            return Err(DcamError::OutOfRange(format!("LUT range max {max} exceeds {limit}")));
        }
        Ok(Self { min, max })
    }
}

/// Input and output ranges of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lut {
    /// Raw range; `None` follows the current data range.
    pub input: Option<LutRange>,
    /// 8-bit range the input is stretched onto.
    pub output: LutRange,
}

impl Default for Lut {
    fn default() -> Self {
        Self {
            input: None,
            output: LutRange { min: 0, max: 255 },
        }
    }
}

impl Lut {
    /// Render `frame` (laid out as `geometry`) to one byte per pixel,
    /// rows packed without padding.
    #[must_use]
    pub fn render(&self, frame: &[u8], geometry: &FrameGeometry) -> Vec<u8> {
        let input = self.input.unwrap_or(LutRange {
            min: 0,
            max: geometry.max_value(),
        });
        let in_span = f64::from(input.max - input.min);
        let out_span = f64::from(self.output.max - self.output.min);

        let map = |raw: u32| -> u8 {
            let clipped = raw.clamp(input.min, input.max) - input.min;
            let scaled = f64::from(clipped) * out_span / in_span;
            (f64::from(self.output.min) + scaled).round() as u8
        };

        let mut out = Vec::with_capacity(geometry.width * geometry.height);
        for row in frame.chunks_exact(geometry.row_bytes).take(geometry.height) {
            if geometry.bytes_per_pixel == 1 {
                out.extend(row.iter().take(geometry.width).map(|&px| map(u32::from(px))));
            } else {
                out.extend(
                    row.chunks_exact(2)
                        .take(geometry.width)
                        .map(|px| map(u32::from(u16::from_le_bytes([px[0], px[1]])))),
                );
            }
        }
        out
    }
}
