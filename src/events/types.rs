//! Stream event types
//!
//! Defines all event types that can be broadcast through the event bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::CodecMode;

/// Capture lifecycle as seen by the controller
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureState {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
    /// Failed; a restart may be pending
    Error,
}

impl std::fmt::Display for CaptureState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CaptureState::Stopped => "stopped",
            CaptureState::Starting => "starting",
            CaptureState::Running => "running",
            CaptureState::Stopping => "stopping",
            CaptureState::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// Pipeline counters published with `stream.stats_update`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineStats {
    /// Frames handed to `submit`
    pub frames_submitted: u64,
    /// Frames sent to the sink (raw or compressed)
    pub frames_sent: u64,
    /// Frames evicted from the lane inbox
    pub dropped_queue_full: u64,
    /// Frames the converter rejected
    pub dropped_conversion: u64,
    /// Frames dropped on the codec path (busy, faulted, recreating)
    pub dropped_encoder: u64,
    /// Frames the sink failed to send
    pub dropped_transport: u64,
    /// Frames whose processing panicked
    pub dropped_internal: u64,
    /// Encoder output errors observed
    pub encoder_errors: u64,
    /// Encoder sessions created (including recreates)
    pub encoder_sessions_created: u64,
    /// Output frame rate measured over the last stats interval
    pub current_fps: f32,
}

impl PipelineStats {
    /// Total frames dropped for any reason
    pub fn total_dropped(&self) -> u64 {
        self.dropped_queue_full
            + self.dropped_conversion
            + self.dropped_encoder
            + self.dropped_transport
            + self.dropped_internal
    }
}

/// Stream event enumeration
///
/// Serialized as `{"event": "stream.capture_state_changed", "data": {...}}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum StreamEvent {
    /// Viewer count reported by the sink changed
    #[serde(rename = "stream.connection_count_changed")]
    ConnectionCountChanged { previous: usize, current: usize },

    #[serde(rename = "stream.capture_state_changed")]
    CaptureStateChanged {
        source: String,
        state: CaptureState,
        /// Failure reason when `state` is `error`
        reason: Option<String>,
    },

    /// Encoder session reported an error; a recreate is scheduled
    #[serde(rename = "stream.encoder_fault")]
    EncoderFault {
        codec: CodecMode,
        generation: u64,
        error: String,
        retry_in_ms: u64,
    },

    #[serde(rename = "stream.encoder_recreated")]
    EncoderRecreated {
        codec: CodecMode,
        generation: u64,
        width: u32,
        height: u32,
        /// Name of the backend that was selected
        encoder: String,
    },

    /// Connection count reads keep failing
    #[serde(rename = "stream.poll_failure_escalated")]
    PollFailureEscalated {
        consecutive_failures: u32,
        error: String,
    },

    #[serde(rename = "stream.capture_restart_scheduled")]
    CaptureRestartScheduled {
        source: String,
        error: String,
        retry_in_ms: u64,
    },

    #[serde(rename = "stream.stats_update")]
    StatsUpdate {
        stats: PipelineStats,
        timestamp: DateTime<Utc>,
    },
}

impl StreamEvent {
    /// Get the event name (for filtering/routing)
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::ConnectionCountChanged { .. } => "stream.connection_count_changed",
            Self::CaptureStateChanged { .. } => "stream.capture_state_changed",
            Self::EncoderFault { .. } => "stream.encoder_fault",
            Self::EncoderRecreated { .. } => "stream.encoder_recreated",
            Self::PollFailureEscalated { .. } => "stream.poll_failure_escalated",
            Self::CaptureRestartScheduled { .. } => "stream.capture_restart_scheduled",
            Self::StatsUpdate { .. } => "stream.stats_update",
        }
    }
}
