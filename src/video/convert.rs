//! Pixel format conversion to packed BGRA
//!
//! Primary use case: YCbCr 4:2:0 camera output (I420 / NV12) → BGRA for
//! uncompressed transport frames.

use crate::error::{Result, StreamError};
use crate::video::format::{ColorRange, PixelLayout};
use crate::video::frame::{ConvertedFrame, VideoFrame};

/// BT.601 coefficients in 16.16 fixed point
const CR_TO_R: i32 = 91_881; // 1.402
const CB_TO_G: i32 = 22_554; // 0.344136
const CR_TO_G: i32 = 46_802; // 0.714136
const CB_TO_B: i32 = 116_130; // 1.772
const ROUND: i32 = 1 << 15;

/// Pixel converter producing packed BGRA
///
/// Owns one scratch buffer that is reused across conversions. The buffer
/// only ever grows, so frames of stable size never reallocate.
pub struct PixelConverter {
    /// Output buffer (reused across conversions)
    buffer: Vec<u8>,
    /// Scaled luma lookup, 16.16 fixed point, for video range
    video_luma: [i32; 256],
    /// Scaled luma lookup, 16.16 fixed point, for full range
    full_luma: [i32; 256],
}

impl PixelConverter {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            video_luma: luma_table(ColorRange::Video),
            full_luma: luma_table(ColorRange::Full),
        }
    }

    /// Current scratch buffer capacity in bytes
    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }

    /// Convert a frame and return a view of the output buffer
    pub fn convert(&mut self, frame: &VideoFrame) -> Result<ConvertedFrame<'_>> {
        let width = frame.width() as usize;
        let height = frame.height() as usize;
        let dst_stride = width * 4;
        let required = dst_stride * height;

        frame.validate()?;

        // Grow-only
        if self.buffer.len() < required {
            self.buffer.resize(required, 0);
        }

        match frame.layout {
            PixelLayout::Bgra => self.copy_bgra(frame, required),
            PixelLayout::I420(range) => self.convert_i420(frame, range),
            PixelLayout::Nv12(range) => self.convert_nv12(frame, range),
            PixelLayout::Other(_) => {
                return Err(StreamError::UnsupportedLayout(frame.layout.to_string()));
            }
        }

        Ok(ConvertedFrame {
            width: frame.width(),
            height: frame.height(),
            stride: dst_stride as u32,
            data: &self.buffer[..required],
        })
    }

    fn copy_bgra(&mut self, frame: &VideoFrame, required: usize) {
        let src = frame.data();
        let row_bytes = frame.width() as usize * 4;
        let src_stride = frame.stride as usize;

        if src_stride == row_bytes {
            self.buffer[..required].copy_from_slice(&src[..required]);
            return;
        }

        for (dst_row, src_row) in self.buffer[..required]
            .chunks_exact_mut(row_bytes)
            .zip(src.chunks(src_stride))
        {
            dst_row.copy_from_slice(&src_row[..row_bytes]);
        }
    }

    fn convert_i420(&mut self, frame: &VideoFrame, range: ColorRange) {
        let width = frame.width() as usize;
        let height = frame.height() as usize;
        let y_stride = frame.stride as usize;
        let c_stride = y_stride.div_ceil(2);
        let c_size = c_stride * height.div_ceil(2);

        let data = frame.data();
        let (y_plane, chroma) = data.split_at(y_stride * height);
        let (u_plane, v_plane) = chroma.split_at(c_size);

        let luma = self.luma_table(range);
        for row in 0..height {
            let y_row = &y_plane[row * y_stride..];
            let u_row = &u_plane[(row / 2) * c_stride..];
            let v_row = &v_plane[(row / 2) * c_stride..];
            let out = &mut self.buffer[row * width * 4..(row + 1) * width * 4];
            for col in 0..width {
                let pixel = ycbcr_to_bgra(luma[y_row[col] as usize], u_row[col / 2], v_row[col / 2]);
                out[col * 4..col * 4 + 4].copy_from_slice(&pixel);
            }
        }
    }

    fn convert_nv12(&mut self, frame: &VideoFrame, range: ColorRange) {
        let width = frame.width() as usize;
        let height = frame.height() as usize;
        let stride = frame.stride as usize;

        let data = frame.data();
        let (y_plane, uv_plane) = data.split_at(stride * height);

        let luma = self.luma_table(range);
        for row in 0..height {
            let y_row = &y_plane[row * stride..];
            let uv_row = &uv_plane[(row / 2) * stride..];
            let out = &mut self.buffer[row * width * 4..(row + 1) * width * 4];
            for col in 0..width {
                let pair = (col / 2) * 2;
                let pixel = ycbcr_to_bgra(luma[y_row[col] as usize], uv_row[pair], uv_row[pair + 1]);
                out[col * 4..col * 4 + 4].copy_from_slice(&pixel);
            }
        }
    }

    fn luma_table(&self, range: ColorRange) -> [i32; 256] {
        match range {
            ColorRange::Video => self.video_luma,
            ColorRange::Full => self.full_luma,
        }
    }
}

impl Default for PixelConverter {
    fn default() -> Self {
        Self::new()
    }
}

fn luma_table(range: ColorRange) -> [i32; 256] {
    let (offset, scale) = range.luma_offset_scale();
    let mut table = [0i32; 256];
    for (y, entry) in table.iter_mut().enumerate() {
        *entry = ((y as f32 - offset) * scale * 65536.0).round() as i32;
    }
    table
}

#[inline]
fn ycbcr_to_bgra(luma: i32, cb: u8, cr: u8) -> [u8; 4] {
    let cb = cb as i32 - 128;
    let cr = cr as i32 - 128;
    let r = (luma + CR_TO_R * cr + ROUND) >> 16;
    let g = (luma - CB_TO_G * cb - CR_TO_G * cr + ROUND) >> 16;
    let b = (luma + CB_TO_B * cb + ROUND) >> 16;
    [clamp(b), clamp(g), clamp(r), 255]
}

#[inline]
fn clamp(value: i32) -> u8 {
    value.clamp(0, 255) as u8
}
