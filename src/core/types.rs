//! Shared frame/timestamp types used across the capture and write stages.
//!
//! All core timestamps are in microseconds; containers rescale to their
//! stream time base at the mux boundary.

use serde::Serialize;

use crate::core::slot_pool::SlotClaim;

/// Pixel format of a frame buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    /// 4 bytes per pixel: R, G, B, A.  The capture backend produces this.
    Rgba,
    /// Planar YUV 4:2:0, 12 bits per pixel, Y then U then V planes.
    Yuv420p,
}

impl PixelFormat {
    /// Byte length of one `width`×`height` frame in this format.
    pub fn frame_len(self, width: u32, height: u32) -> usize {
        let px = (width as usize) * (height as usize);
        match self {
            Self::Rgba => px * 4,
            Self::Yuv420p => px + px / 2,
        }
    }
}

/// Capture-target geometry, read once at open and fixed for the session.
#[derive(Clone, Copy, Debug)]
pub struct Geometry {
    pub width: u32,
    pub height: u32,
    /// Visual depth of the target (bits); drives rendering-config selection.
    pub depth: i32,
    /// Bytes per row of the captured RGBA image.
    pub stride: usize,
}

impl Geometry {
    pub fn new(width: u32, height: u32, depth: i32) -> Self {
        Self {
            width,
            height,
            depth,
            stride: width as usize * 4,
        }
    }

    /// Byte length of one captured RGBA frame.
    pub fn frame_len(&self) -> usize {
        PixelFormat::Rgba.frame_len(self.width, self.height)
    }
}

/// A rational time base (`num/den` seconds per tick).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Rational {
    pub num: i32,
    pub den: i32,
}

impl Rational {
    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    /// One tick per frame at `fps` frames per second.
    pub const fn per_frame(fps: u32) -> Self {
        Self::new(1, fps as i32)
    }
}

/// Rescale a timestamp from one time base to another, rounding to nearest
/// (half away from zero) — the `av_rescale_q` contract.
pub fn rescale(ts: i64, from: Rational, to: Rational) -> i64 {
    let num = ts as i128 * from.num as i128 * to.den as i128;
    let den = from.den as i128 * to.num as i128;
    debug_assert!(den != 0, "rescale with zero denominator");
    let half = den.abs() / 2;
    let out = if num >= 0 {
        (num + half) / den
    } else {
        (num - half) / den
    };
    out as i64
}

/// One timestamped frame produced by the capture source.
///
/// The pixel payload is parked in the frame slot identified by `claim`;
/// the unit is consumed exactly once by the writer, which takes the payload,
/// releases it to its buffer backend, and frees the slot.
#[derive(Debug)]
pub struct CapturedUnit {
    pub claim: SlotClaim,
    /// Presentation timestamp: the pacing anchor of the tick, microseconds.
    pub pts_us: i64,
    /// Fixed per-frame duration, microseconds.
    pub duration_us: i64,
    /// 1-based capture tick counter (drops included).
    pub seq: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_len_by_format() {
        assert_eq!(PixelFormat::Rgba.frame_len(4, 2), 32);
        assert_eq!(PixelFormat::Yuv420p.frame_len(4, 2), 12);
        assert_eq!(Geometry::new(1920, 1080, 24).frame_len(), 1920 * 1080 * 4);
    }

    #[test]
    fn rescale_matches_av_rescale_q() {
        // 1/30 ticks → milliseconds: tick 30 is exactly 1000 ms.
        let enc = Rational::new(1, 30);
        let ms = Rational::new(1, 1000);
        assert_eq!(rescale(30, enc, ms), 1000);
        // tick 1 = 33.33 ms, rounds to 33.
        assert_eq!(rescale(1, enc, ms), 33);
        // tick 2 = 66.67 ms, rounds to 67.
        assert_eq!(rescale(2, enc, ms), 67);
        // identity
        assert_eq!(rescale(123, ms, ms), 123);
        // negative timestamps round away from zero
        assert_eq!(rescale(-1, enc, ms), -33);
    }
}
