//! Frame data stored in ring slots.
//!
//! A slot is sized once, when the ring is allocated or attached, from the
//! image geometry in effect at that moment. The pixel buffer never grows or
//! shrinks afterwards; only the metadata changes from frame to frame.

/// Byte layout shared by every slot of a ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotLayout {
    /// Bytes occupied by one image row (the row stride).
    pub row_bytes: usize,
    /// Bytes occupied by one complete frame.
    pub frame_bytes: usize,
}

impl SlotLayout {
    /// Layout for `height` rows of `row_bytes` each.
    #[must_use]
    pub const fn new(row_bytes: usize, height: usize) -> Self {
        Self {
            row_bytes,
            frame_bytes: row_bytes * height,
        }
    }
}

/// One frame slot.
///
/// `sequence` is `None` until the acquisition engine has written a frame
/// into the slot; readers must not interpret `pixels` before that.
#[derive(Debug)]
pub struct FrameData {
    /// Pixel buffer. Its length is at least the layout's `frame_bytes`;
    /// caller-attached buffers may be longer.
    pub pixels: Vec<u8>,

    /// Monotonic capture sequence number of the frame held in this slot.
    pub sequence: Option<u64>,

    /// Capture timestamp in nanoseconds since the Unix epoch.
    pub timestamp_ns: i64,

    /// Exposure time the frame was taken with, in seconds.
    pub exposure_s: f64,
}

impl FrameData {
    /// Wrap an already-sized pixel buffer.
    #[must_use]
    pub fn from_buffer(pixels: Vec<u8>) -> Self {
        Self {
            pixels,
            sequence: None,
            timestamp_ns: 0,
            exposure_s: 0.0,
        }
    }

    /// Clear the metadata so the slot reads as empty.
    ///
    /// Pixel contents are left in place; the next write overwrites them.
    pub fn reset(&mut self) {
        self.sequence = None;
        self.timestamp_ns = 0;
        self.exposure_s = 0.0;
    }

    /// True once a frame has been written into the slot.
    #[inline]
    #[must_use]
    pub fn is_filled(&self) -> bool {
        self.sequence.is_some()
    }

    /// The first `frame_bytes` of the pixel buffer.
    #[inline]
    #[must_use]
    pub fn frame(&self, layout: SlotLayout) -> &[u8] {
        &self.pixels[..layout.frame_bytes]
    }

    /// Mutable access to the first `frame_bytes` of the pixel buffer.
    #[inline]
    pub fn frame_mut(&mut self, layout: SlotLayout) -> &mut [u8] {
        &mut self.pixels[..layout.frame_bytes]
    }
}
