//! Capture sources
//!
//! A capture source produces frames on its own thread and hands them to the
//! pipeline through a `CaptureHandle`. The handle does not keep the pipeline
//! alive; frames arriving after shutdown are dropped.

pub mod negotiate;
pub mod test_pattern;

use async_trait::async_trait;
use std::sync::Weak;
use tokio::sync::mpsc;
use tracing::{trace, warn};

use crate::error::{Result, StreamError};
use crate::video::format::{FrameRate, Resolution};
use crate::video::frame::VideoFrame;
use crate::video::pipeline::FramePipeline;

pub use negotiate::{closest_frame_rate, FrameRateRange};
pub use test_pattern::TestPatternSource;

/// What the controller asks a source to produce
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptureSettings {
    pub resolution: Resolution,
    pub frame_rate: FrameRate,
}

/// A capture failure reported from the source's own context
#[derive(Debug)]
pub struct CaptureFault {
    /// Start counter of the capture run that failed
    pub epoch: u64,
    pub error: StreamError,
}

/// Sink for frames and errors, given to a source on start
#[derive(Clone)]
pub struct CaptureHandle {
    pipeline: Weak<FramePipeline>,
    faults: mpsc::Sender<CaptureFault>,
    epoch: u64,
}

impl CaptureHandle {
    pub(crate) fn new(pipeline: Weak<FramePipeline>, faults: mpsc::Sender<CaptureFault>, epoch: u64) -> Self {
        Self {
            pipeline,
            faults,
            epoch,
        }
    }

    /// Deliver a captured frame; never blocks
    pub fn on_frame(&self, frame: VideoFrame) {
        match self.pipeline.upgrade() {
            Some(pipeline) => {
                if pipeline.submit(frame).is_err() {
                    trace!("Pipeline closed, frame dropped");
                }
            }
            None => trace!("Pipeline gone, frame dropped"),
        }
    }

    /// Report that capture failed and has stopped producing frames
    ///
    /// Returns false when the fault could not be queued: the controller is
    /// gone or already holds a backlog of faults it has yet to handle.
    pub fn on_error(&self, error: StreamError) -> bool {
        let fault = CaptureFault {
            epoch: self.epoch,
            error,
        };
        match self.faults.try_send(fault) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(fault)) => {
                warn!("Capture fault backlog full, dropped: {}", fault.error);
                false
            }
            Err(mpsc::error::TrySendError::Closed(fault)) => {
                warn!("Controller gone, capture fault dropped: {}", fault.error);
                false
            }
        }
    }
}

/// A video source the controller can switch on and off
#[async_trait]
pub trait CaptureSource: Send + Sync {
    /// Human-readable name used in logs and events
    fn name(&self) -> &str;

    /// Check capture permission; `PermissionDenied` is fatal at startup
    async fn authorize(&self) -> Result<()>;

    /// Frame rates the source can deliver; empty means any rate
    fn supported_frame_rates(&self) -> Vec<FrameRateRange> {
        Vec::new()
    }

    /// Begin producing frames into `handle`
    async fn start(&self, settings: CaptureSettings, handle: CaptureHandle) -> Result<()>;

    /// Stop producing frames; no frames are delivered after this returns
    async fn stop(&self) -> Result<()>;
}
