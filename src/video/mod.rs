//! Video processing
//!
//! Pixel formats, frame containers, conversion to BGRA, encoder sessions and
//! the serial processing lane that feeds the transport sink.

pub mod convert;
pub mod encoder;
pub mod format;
pub mod frame;
pub mod pipeline;

pub use convert::PixelConverter;
pub use encoder::{EncoderRegistry, EncoderSession};
pub use format::{ColorRange, FrameRate, PixelLayout, Resolution};
pub use frame::{CompressedAccessUnit, VideoFrame};
pub use pipeline::FramePipeline;
