//! Software H.264 backend on top of OpenH264

use bytes::Bytes;
use openh264::encoder::{BitRate, Encoder, EncoderConfig, FrameRate, RateControlMode};
use openh264::formats::YUVSlices;
use openh264::{nal_units, OpenH264API};
use tracing::info;

use super::traits::{EncodedPacket, EncoderFactory, EncoderParams, HardwareEncoder};
use crate::config::CodecMode;
use crate::error::{Result, StreamError};
use crate::video::format::PixelLayout;
use crate::video::frame::VideoFrame;

/// NAL unit type of an IDR slice
const NAL_IDR_SLICE: u8 = 5;

pub struct OpenH264Factory;

impl EncoderFactory for OpenH264Factory {
    fn name(&self) -> &str {
        "openh264"
    }

    fn codec(&self) -> CodecMode {
        CodecMode::H264
    }

    fn is_hardware(&self) -> bool {
        false
    }

    fn create(&self, params: &EncoderParams) -> Result<Box<dyn HardwareEncoder>> {
        let resolution = params.resolution;
        if resolution.width % 2 != 0 || resolution.height % 2 != 0 {
            return Err(StreamError::EncoderUnavailable(format!(
                "openh264 needs even dimensions, got {}",
                resolution
            )));
        }

        let bitrate = u32::try_from(params.bitrate_bps).unwrap_or(u32::MAX);
        let config = EncoderConfig::new()
            .bitrate(BitRate::from_bps(bitrate))
            .max_frame_rate(FrameRate::from_hz(params.frame_rate.as_f64() as f32))
            .rate_control_mode(RateControlMode::Bitrate);

        let api = OpenH264API::from_source();
        let encoder = Encoder::with_api_config(api, config)
            .map_err(|e| StreamError::EncoderUnavailable(format!("openh264: {:?}", e)))?;

        info!(
            width = resolution.width,
            height = resolution.height,
            bitrate,
            "OpenH264 encoder created"
        );

        Ok(Box::new(OpenH264Encoder {
            encoder,
            keyframe_interval: params.keyframe_interval.max(1) as u64,
            frames_since_key: 0,
            scratch: Vec::new(),
        }))
    }
}

struct OpenH264Encoder {
    encoder: Encoder,
    keyframe_interval: u64,
    frames_since_key: u64,
    /// I420 staging buffer for BGRA and NV12 input
    scratch: Vec<u8>,
}

impl HardwareEncoder for OpenH264Encoder {
    fn name(&self) -> &str {
        "openh264"
    }

    fn encode(&mut self, frame: &VideoFrame, force_keyframe: bool) -> Result<Vec<EncodedPacket>> {
        frame.validate()?;
        let w = frame.width() as usize;
        let h = frame.height() as usize;

        if force_keyframe || self.frames_since_key >= self.keyframe_interval {
            self.encoder.force_intra_frame();
            self.frames_since_key = 0;
        }

        let bitstream = match frame.layout {
            PixelLayout::I420(_) => {
                let y_stride = frame.stride as usize;
                let c_stride = y_stride.div_ceil(2);
                let data = frame.data();
                let (y, chroma) = data.split_at(y_stride * h);
                let (u, v) = chroma.split_at(c_stride * h.div_ceil(2));
                let yuv = YUVSlices::new((y, u, v), (w, h), (y_stride, c_stride, c_stride));
                self.encoder.encode(&yuv)
            }
            PixelLayout::Bgra => {
                bgra_to_i420(frame, &mut self.scratch);
                let yuv = i420_slices(&self.scratch, w, h);
                self.encoder.encode(&yuv)
            }
            PixelLayout::Nv12(_) => {
                nv12_to_i420(frame, &mut self.scratch);
                let yuv = i420_slices(&self.scratch, w, h);
                self.encoder.encode(&yuv)
            }
            PixelLayout::Other(_) => {
                return Err(StreamError::UnsupportedLayout(frame.layout.to_string()));
            }
        }
        .map_err(|e| StreamError::Encoder(format!("openh264 encode failed: {:?}", e)))?;

        let data = bitstream.to_vec();
        self.frames_since_key += 1;
        if data.is_empty() {
            // Rate control skipped this frame
            return Ok(vec![]);
        }

        let key_frame = nal_units(&data).any(|nal| nal_type(nal) == Some(NAL_IDR_SLICE));
        Ok(vec![EncodedPacket {
            data: Bytes::from(data),
            key_frame,
        }])
    }
}

fn i420_slices(buf: &[u8], w: usize, h: usize) -> YUVSlices<'_> {
    let y_size = w * h;
    let c_size = (w / 2) * (h / 2);
    YUVSlices::new(
        (
            &buf[..y_size],
            &buf[y_size..y_size + c_size],
            &buf[y_size + c_size..y_size + 2 * c_size],
        ),
        (w, h),
        (w, w / 2, w / 2),
    )
}

/// NAL type of a unit, with or without its Annex B start code
fn nal_type(nal: &[u8]) -> Option<u8> {
    let start = nal.iter().position(|&b| b != 0)?;
    let header = if start == 0 { nal.first() } else { nal.get(start + 1) };
    header.map(|h| h & 0x1F)
}

/// BT.601 video-range BGRA → I420, averaging chroma over 2x2 blocks
fn bgra_to_i420(frame: &VideoFrame, out: &mut Vec<u8>) {
    let w = frame.width() as usize;
    let h = frame.height() as usize;
    let stride = frame.stride as usize;
    let src = frame.data();
    let y_size = w * h;
    let c_size = (w / 2) * (h / 2);
    out.resize(y_size + 2 * c_size, 0);

    let (y_plane, chroma) = out.split_at_mut(y_size);
    let (u_plane, v_plane) = chroma.split_at_mut(c_size);

    for row in 0..h {
        for col in 0..w {
            let px = &src[row * stride + col * 4..];
            let (b, g, r) = (px[0] as i32, px[1] as i32, px[2] as i32);
            y_plane[row * w + col] = (((66 * r + 129 * g + 25 * b + 128) >> 8) + 16) as u8;
        }
    }

    for row in (0..h).step_by(2) {
        for col in (0..w).step_by(2) {
            let (mut b, mut g, mut r) = (0i32, 0i32, 0i32);
            for dr in 0..2 {
                for dc in 0..2 {
                    let px = &src[(row + dr) * stride + (col + dc) * 4..];
                    b += px[0] as i32;
                    g += px[1] as i32;
                    r += px[2] as i32;
                }
            }
            let (b, g, r) = (b / 4, g / 4, r / 4);
            let idx = (row / 2) * (w / 2) + col / 2;
            u_plane[idx] = (((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128).clamp(0, 255) as u8;
            v_plane[idx] = (((112 * r - 94 * g - 18 * b + 128) >> 8) + 128).clamp(0, 255) as u8;
        }
    }
}

fn nv12_to_i420(frame: &VideoFrame, out: &mut Vec<u8>) {
    let w = frame.width() as usize;
    let h = frame.height() as usize;
    let stride = frame.stride as usize;
    let src = frame.data();
    let y_size = w * h;
    let c_size = (w / 2) * (h / 2);
    out.resize(y_size + 2 * c_size, 0);

    let (y_plane, chroma) = out.split_at_mut(y_size);
    let (u_plane, v_plane) = chroma.split_at_mut(c_size);
    let (src_y, src_uv) = src.split_at(stride * h);

    for row in 0..h {
        y_plane[row * w..(row + 1) * w].copy_from_slice(&src_y[row * stride..row * stride + w]);
    }
    for row in 0..h / 2 {
        let uv = &src_uv[row * stride..];
        for col in 0..w / 2 {
            u_plane[row * (w / 2) + col] = uv[col * 2];
            v_plane[row * (w / 2) + col] = uv[col * 2 + 1];
        }
    }
}
