//! Encoder traits and common types

use bytes::Bytes;

use crate::config::{CodecMode, StreamConfig};
use crate::error::Result;
use crate::video::format::{FrameRate, Resolution};
use crate::video::frame::VideoFrame;

/// Parameters fixed for the lifetime of one encoder session
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderParams {
    /// Output codec (never `Raw`)
    pub codec: CodecMode,
    /// Resolution the session is bound to
    pub resolution: Resolution,
    /// Exact source frame rate
    pub frame_rate: FrameRate,
    /// Average bitrate in bits per second
    pub bitrate_bps: u64,
    /// Maximum distance between keyframes, in frames
    pub keyframe_interval: u32,
    /// Quality hint in 0.0..=1.0
    pub quality: f32,
    /// Encode for latency rather than throughput
    pub realtime: bool,
    /// Whether B-frames / reordering are allowed
    pub allow_frame_reordering: bool,
    /// Prefer a hardware backend when several are available
    pub prefer_hardware: bool,
}

impl EncoderParams {
    /// Parameters for a live session at the given resolution and rate
    pub fn new(codec: CodecMode, resolution: Resolution, frame_rate: FrameRate, bitrate_bps: u64) -> Self {
        Self {
            codec,
            resolution,
            frame_rate,
            bitrate_bps,
            keyframe_interval: frame_rate.rounded().saturating_mul(2),
            quality: 0.75,
            realtime: true,
            allow_frame_reordering: false,
            prefer_hardware: true,
        }
    }

    /// Derive parameters from the stream configuration
    pub fn for_config(
        config: &StreamConfig,
        codec: CodecMode,
        resolution: Resolution,
        frame_rate: FrameRate,
    ) -> Self {
        Self::new(
            codec,
            resolution,
            frame_rate,
            config.bitrate_for(codec, resolution, frame_rate),
        )
    }
}

/// One chunk of encoder output
#[derive(Debug, Clone)]
pub struct EncodedPacket {
    /// Encoded data (Annex B)
    pub data: Bytes,
    /// Whether this packet starts an independently decodable frame
    pub key_frame: bool,
}

/// A codec instance driven synchronously by a session worker thread
///
/// Not `Sync`: an instance is owned by exactly one worker.
pub trait HardwareEncoder: Send {
    /// Backend name for logs
    fn name(&self) -> &str;

    /// Encode one frame. Real-time encoders return zero or one packet.
    fn encode(&mut self, frame: &VideoFrame, force_keyframe: bool) -> Result<Vec<EncodedPacket>>;

    /// Flush any pending output at end of session
    fn flush(&mut self) -> Result<Vec<EncodedPacket>> {
        Ok(vec![])
    }
}

/// Creates encoder instances for one codec/backend combination
pub trait EncoderFactory: Send + Sync {
    /// Backend name, e.g. "openh264"
    fn name(&self) -> &str;

    /// Codec this factory produces
    fn codec(&self) -> CodecMode;

    /// Whether the backend runs on dedicated hardware
    fn is_hardware(&self) -> bool;

    /// Selection priority among backends of the same kind (higher = preferred)
    fn priority(&self) -> u32 {
        0
    }

    /// Check if this backend can be used on this system
    fn is_available(&self) -> bool {
        true
    }

    /// Create an encoder bound to `params`
    fn create(&self, params: &EncoderParams) -> Result<Box<dyn HardwareEncoder>>;
}
