//! Pixel layouts, resolutions and frame rates

use serde::{Deserialize, Serialize};
use std::fmt;

/// Luma/chroma quantization range of a YCbCr source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorRange {
    /// Studio swing: luma 16..=235, chroma 16..=240
    Video,
    /// Full swing: 0..=255
    Full,
}

impl ColorRange {
    /// Luma offset and scale used when expanding to full-range RGB
    pub fn luma_offset_scale(&self) -> (f32, f32) {
        match self {
            ColorRange::Video => (16.0, 255.0 / 219.0),
            ColorRange::Full => (0.0, 1.0),
        }
    }
}

/// Memory layout of a captured frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelLayout {
    /// Packed 32-bit B, G, R, A
    Bgra,
    /// Three-plane 4:2:0 (Y, then Cb, then Cr)
    I420(ColorRange),
    /// Two-plane 4:2:0 (Y, then interleaved CbCr)
    Nv12(ColorRange),
    /// Anything the pipeline cannot process, tagged by FourCC
    Other([u8; 4]),
}

impl PixelLayout {
    /// Minimal row stride in bytes of the first plane
    ///
    /// NV12 chroma rows share the luma stride and hold a full Cb/Cr pair for
    /// the last column, so an odd width needs one extra byte per row.
    pub fn min_stride(&self, width: u32) -> Option<u32> {
        match self {
            PixelLayout::Bgra => Some(width * 4),
            PixelLayout::I420(_) => Some(width),
            PixelLayout::Nv12(_) => Some(width.div_ceil(2) * 2),
            PixelLayout::Other(_) => None,
        }
    }

    /// Bytes needed to hold a frame with the given first-plane stride.
    ///
    /// Chroma planes of I420 use `ceil(stride / 2)`; NV12 chroma rows have
    /// the same stride as luma rows.
    pub fn frame_size(&self, stride: u32, height: u32) -> Option<usize> {
        let stride = stride as usize;
        let height = height as usize;
        let chroma_rows = height.div_ceil(2);
        match self {
            PixelLayout::Bgra => Some(stride * height),
            PixelLayout::I420(_) => Some(stride * height + 2 * stride.div_ceil(2) * chroma_rows),
            PixelLayout::Nv12(_) => Some(stride * height + stride * chroma_rows),
            PixelLayout::Other(_) => None,
        }
    }
}

impl fmt::Display for PixelLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PixelLayout::Bgra => write!(f, "BGRA"),
            PixelLayout::I420(ColorRange::Video) => write!(f, "I420 (video range)"),
            PixelLayout::I420(ColorRange::Full) => write!(f, "I420 (full range)"),
            PixelLayout::Nv12(ColorRange::Video) => write!(f, "NV12 (video range)"),
            PixelLayout::Nv12(ColorRange::Full) => write!(f, "NV12 (full range)"),
            PixelLayout::Other(fourcc) => write!(f, "{}", String::from_utf8_lossy(fourcc)),
        }
    }
}

impl std::str::FromStr for PixelLayout {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "bgra" => Ok(PixelLayout::Bgra),
            "i420" | "yuv420" => Ok(PixelLayout::I420(ColorRange::Video)),
            "i420-full" | "yuv420-full" => Ok(PixelLayout::I420(ColorRange::Full)),
            "nv12" => Ok(PixelLayout::Nv12(ColorRange::Video)),
            "nv12-full" => Ok(PixelLayout::Nv12(ColorRange::Full)),
            _ => Err(format!("Unknown pixel layout: {}", s)),
        }
    }
}

/// Resolution (width x height)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Check if resolution is usable for streaming
    pub fn is_valid(&self) -> bool {
        self.width >= 16 && self.width <= 15360 && self.height >= 16 && self.height <= 8640
    }

    /// Get total pixels
    pub fn pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub const VGA: Resolution = Resolution {
        width: 640,
        height: 480,
    };
    pub const HD720: Resolution = Resolution {
        width: 1280,
        height: 720,
    };
    pub const HD1080: Resolution = Resolution {
        width: 1920,
        height: 1080,
    };
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl From<(u32, u32)> for Resolution {
    fn from((width, height): (u32, u32)) -> Self {
        Self { width, height }
    }
}

/// Exact frame rate expressed as a rational number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameRate {
    pub numerator: u32,
    pub denominator: u32,
}

/// NTSC-style rates that must be carried as x000/1001 to avoid drift
const NTSC_RATES: [(f64, u32); 4] = [
    (23.976, 24_000),
    (29.97, 30_000),
    (59.94, 60_000),
    (119.88, 120_000),
];

impl FrameRate {
    pub fn new(numerator: u32, denominator: u32) -> Self {
        let divisor = gcd(numerator, denominator.max(1));
        Self {
            numerator: numerator / divisor,
            denominator: denominator.max(1) / divisor,
        }
    }

    /// Build a rational from a nominal rate.
    ///
    /// 29.97 becomes 30000/1001 rather than 30/1; integral rates become n/1;
    /// everything else keeps millihertz precision.
    pub fn from_fps(fps: f64) -> Self {
        for (nominal, numerator) in NTSC_RATES {
            if (fps - nominal).abs() < 0.01 {
                return Self::new(numerator, 1001);
            }
        }
        let rounded = fps.round();
        if (fps - rounded).abs() < 1e-6 {
            return Self::new(rounded.max(1.0) as u32, 1);
        }
        Self::new((fps * 1000.0).round().max(1.0) as u32, 1000)
    }

    pub fn as_f64(&self) -> f64 {
        self.numerator as f64 / self.denominator as f64
    }

    /// Nominal integral rate (29.97 → 30), never zero
    pub fn rounded(&self) -> u32 {
        (self.as_f64().round() as u32).max(1)
    }
}

impl fmt::Display for FrameRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.numerator, self.denominator)
    }
}

fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a.max(1)
}
