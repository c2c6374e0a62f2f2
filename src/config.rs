//! Stream configuration
//!
//! Built once at startup (from the command line), validated, then shared
//! read-only as `Arc<StreamConfig>`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::{Result, StreamError};
use crate::video::format::{FrameRate, Resolution};

/// Output transformation applied to each captured frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CodecMode {
    /// Repack to BGRA and send uncompressed
    #[default]
    Raw,
    /// H.264/AVC
    H264,
    /// H.265/HEVC
    Hevc,
}

impl CodecMode {
    /// Whether frames go through an encoder session
    pub fn is_encoded(&self) -> bool {
        !matches!(self, CodecMode::Raw)
    }

    /// Bitrate factor relative to the H.264 baseline
    fn bitrate_factor(&self) -> f64 {
        match self {
            CodecMode::Hevc => 0.75,
            _ => 1.0,
        }
    }
}

impl fmt::Display for CodecMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecMode::Raw => write!(f, "raw"),
            CodecMode::H264 => write!(f, "h264"),
            CodecMode::Hevc => write!(f, "hevc"),
        }
    }
}

impl std::str::FromStr for CodecMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "raw" | "bgra" => Ok(CodecMode::Raw),
            "h264" | "avc" => Ok(CodecMode::H264),
            "hevc" | "h265" => Ok(CodecMode::Hevc),
            _ => Err(format!("Unknown codec: {}", s)),
        }
    }
}

/// Subscriber polling and hysteresis settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ActivationConfig {
    /// Connection count poll interval in milliseconds
    pub poll_interval_ms: u64,
    /// Time the count must stay at zero before capture stops, in milliseconds
    pub hysteresis_ms: u64,
    /// Consecutive poll failures before the failure is escalated
    pub failure_escalation_threshold: u32,
    /// Skip the monitor and keep capture running
    pub always_on: bool,
}

impl Default for ActivationConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            hysteresis_ms: 2000,
            failure_escalation_threshold: 3,
            always_on: false,
        }
    }
}

impl ActivationConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn hysteresis(&self) -> Duration {
        Duration::from_millis(self.hysteresis_ms)
    }
}

/// Processing lane settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Frames buffered ahead of the lane (oldest dropped when full)
    pub queue_capacity: usize,
    /// Frames buffered ahead of an encoder worker
    pub encoder_queue_depth: usize,
    /// Delay before a faulted encoder session is recreated, in milliseconds
    pub encoder_recreate_backoff_ms: u64,
    /// Interval between stats reports, in seconds
    pub stats_interval_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 4,
            encoder_queue_depth: 3,
            encoder_recreate_backoff_ms: 1000,
            stats_interval_secs: 5,
        }
    }
}

impl PipelineConfig {
    pub fn encoder_recreate_backoff(&self) -> Duration {
        Duration::from_millis(self.encoder_recreate_backoff_ms)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs.max(1))
    }
}

/// Top-level stream configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StreamConfig {
    /// Human-readable source name (also used as the capture source name)
    pub source_name: String,
    /// Target capture width
    pub width: u32,
    /// Target capture height
    pub height: u32,
    /// Target frame rate
    pub fps: f64,
    /// Output codec
    pub codec: CodecMode,
    /// Bitrate override in bits per second
    pub bitrate_bps: Option<u64>,
    /// Delay before a failed capture is restarted, in milliseconds
    pub capture_restart_delay_ms: u64,
    /// Subscriber monitor
    pub activation: ActivationConfig,
    /// Processing lane
    pub pipeline: PipelineConfig,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            source_name: "autocast".to_string(),
            width: 1280,
            height: 720,
            fps: 30.0,
            codec: CodecMode::Raw,
            bitrate_bps: None,
            capture_restart_delay_ms: 1000,
            activation: ActivationConfig::default(),
            pipeline: PipelineConfig::default(),
        }
    }
}

impl StreamConfig {
    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }

    pub fn frame_rate(&self) -> FrameRate {
        FrameRate::from_fps(self.fps)
    }

    pub fn capture_restart_delay(&self) -> Duration {
        Duration::from_millis(self.capture_restart_delay_ms)
    }

    /// Bitrate for an encoder session at the given resolution
    ///
    /// Uses the override when set, otherwise pixels × fps × 0.1 (HEVC 75%).
    pub fn bitrate_for(&self, codec: CodecMode, resolution: Resolution, frame_rate: FrameRate) -> u64 {
        self.bitrate_bps
            .unwrap_or_else(|| default_bitrate(codec, resolution, frame_rate))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.source_name.trim().is_empty() {
            return Err(StreamError::Config("source name must not be empty".to_string()));
        }
        if !self.resolution().is_valid() {
            return Err(StreamError::Config(format!(
                "invalid resolution {}",
                self.resolution()
            )));
        }
        if !self.fps.is_finite() || self.fps <= 0.0 || self.fps > 240.0 {
            return Err(StreamError::Config(format!("invalid frame rate {}", self.fps)));
        }
        if self.bitrate_bps == Some(0) {
            return Err(StreamError::Config("bitrate must be positive".to_string()));
        }
        if self.activation.poll_interval_ms == 0 {
            return Err(StreamError::Config("poll interval must be positive".to_string()));
        }
        if self.activation.failure_escalation_threshold == 0 {
            return Err(StreamError::Config(
                "failure escalation threshold must be positive".to_string(),
            ));
        }
        if self.pipeline.queue_capacity == 0 || self.pipeline.encoder_queue_depth == 0 {
            return Err(StreamError::Config("queue sizes must be positive".to_string()));
        }
        Ok(())
    }
}

/// Default bitrate in bits per second
pub fn default_bitrate(codec: CodecMode, resolution: Resolution, frame_rate: FrameRate) -> u64 {
    let bps = resolution.pixels() as f64 * frame_rate.as_f64() * 0.1 * codec.bitrate_factor();
    bps.round().max(1.0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_default_bitrate() {
        let fps = FrameRate::new(30, 1);
        assert_eq!(default_bitrate(CodecMode::H264, Resolution::HD1080, fps), 6_220_800);
        assert_eq!(default_bitrate(CodecMode::Hevc, Resolution::HD1080, fps), 4_665_600);
    }

    #[test]
    fn test_bitrate_override() {
        let config = StreamConfig {
            bitrate_bps: Some(2_000_000),
            ..Default::default()
        };
        assert_eq!(
            config.bitrate_for(CodecMode::Hevc, Resolution::HD720, config.frame_rate()),
            2_000_000
        );
    }

    #[test]
    fn test_validate() {
        assert_ok!(StreamConfig::default().validate());

        let bad_fps = StreamConfig {
            fps: 0.0,
            ..Default::default()
        };
        assert!(matches!(bad_fps.validate(), Err(StreamError::Config(_))));

        let bad_size = StreamConfig {
            width: 4,
            ..Default::default()
        };
        assert_err!(bad_size.validate());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: StreamConfig =
            serde_json::from_str(r#"{"codec":"hevc","activation":{"hysteresis_ms":500}}"#).unwrap();
        assert_eq!(config.codec, CodecMode::Hevc);
        assert_eq!(config.activation.hysteresis(), Duration::from_millis(500));
        assert_eq!(config.activation.poll_interval(), Duration::from_millis(500));
        assert_eq!(config.pipeline.queue_capacity, 4);
    }

    #[test]
    fn test_codec_parse() {
        assert_eq!("H265".parse::<CodecMode>(), Ok(CodecMode::Hevc));
        assert_eq!("raw".parse::<CodecMode>(), Ok(CodecMode::Raw));
        assert_err!("vp9".parse::<CodecMode>());
    }
}
