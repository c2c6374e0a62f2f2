//! Video frame data structures

use bytes::Bytes;
use std::collections::VecDeque;
use std::time::Duration;

use super::format::{PixelLayout, Resolution};
use crate::config::CodecMode;
use crate::error::{Result, StreamError};

/// A captured frame as delivered by the capture source
///
/// The payload is a ref-counted handle to the collaborator's buffer; the
/// pipeline drops its handle as soon as the frame has been processed.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    /// Raw frame data (all planes, contiguous)
    data: Bytes,
    /// Frame resolution
    pub resolution: Resolution,
    /// Pixel layout
    pub layout: PixelLayout,
    /// Stride of the first plane in bytes
    pub stride: u32,
    /// Presentation time on the source clock, if the source has one
    pub pts: Option<Duration>,
    /// Frame sequence number
    pub sequence: u64,
}

impl VideoFrame {
    /// Create a new video frame
    pub fn new(
        data: Bytes,
        resolution: Resolution,
        layout: PixelLayout,
        stride: u32,
        sequence: u64,
    ) -> Self {
        Self {
            data,
            resolution,
            layout,
            stride,
            pts: None,
            sequence,
        }
    }

    /// Create a tightly packed frame from a Vec<u8>
    pub fn from_vec(data: Vec<u8>, resolution: Resolution, layout: PixelLayout, sequence: u64) -> Self {
        let stride = layout.min_stride(resolution.width).unwrap_or(0);
        Self::new(Bytes::from(data), resolution, layout, stride, sequence)
    }

    /// Attach a presentation timestamp
    pub fn with_pts(mut self, pts: Duration) -> Self {
        self.pts = Some(pts);
        self
    }

    /// Get frame data as bytes slice
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Get data length
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if frame is empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn width(&self) -> u32 {
        self.resolution.width
    }

    pub fn height(&self) -> u32 {
        self.resolution.height
    }

    /// Check that stride and payload cover the declared layout
    ///
    /// Must pass before any plane is indexed.
    pub fn validate(&self) -> Result<()> {
        let expected = self
            .layout
            .frame_size(self.stride, self.height())
            .ok_or_else(|| StreamError::UnsupportedLayout(self.layout.to_string()))?;
        let min_stride = self.layout.min_stride(self.width()).unwrap_or(0);
        if self.stride < min_stride || self.len() < expected {
            return Err(StreamError::InvalidFrame(format!(
                "{} {} stride {} (min {}): {} bytes, need {}",
                self.layout,
                self.resolution,
                self.stride,
                min_stride,
                self.len(),
                expected
            )));
        }
        Ok(())
    }
}

/// A packed BGRA frame borrowed from a converter's scratch buffer
///
/// The borrow ends before the converter can be called again.
#[derive(Debug)]
pub struct ConvertedFrame<'a> {
    pub width: u32,
    pub height: u32,
    /// Bytes per row (always `width * 4`)
    pub stride: u32,
    pub data: &'a [u8],
}

/// Compressed output of an encoder session
#[derive(Debug, Clone)]
pub struct CompressedAccessUnit {
    /// Codec of the payload
    pub codec: CodecMode,
    /// Encoded data (Annex B for H.264/HEVC)
    pub data: Bytes,
    /// Resolution the session was bound to
    pub resolution: Resolution,
    /// Presentation time of the source frame
    pub pts: Option<Duration>,
    /// Whether this is a keyframe
    pub key_frame: bool,
    /// Sequence number of the source frame
    pub sequence: u64,
}

impl CompressedAccessUnit {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Bounded FIFO of frames waiting for the processing lane
///
/// When full, pushing evicts the oldest queued frame.
pub struct FrameQueue {
    frames: VecDeque<VideoFrame>,
    capacity: usize,
}

impl FrameQueue {
    /// Create a new frame queue with specified capacity
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "Queue capacity must be > 0");
        Self {
            frames: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Push a frame, returning the evicted frame if the queue was full
    pub fn push(&mut self, frame: VideoFrame) -> Option<VideoFrame> {
        let evicted = if self.frames.len() == self.capacity {
            self.frames.pop_front()
        } else {
            None
        };
        self.frames.push_back(frame);
        evicted
    }

    /// Take the oldest frame
    pub fn pop(&mut self) -> Option<VideoFrame> {
        self.frames.pop_front()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop all queued frames, returning how many were discarded
    pub fn clear(&mut self) -> usize {
        let count = self.frames.len();
        self.frames.clear();
        count
    }
}
