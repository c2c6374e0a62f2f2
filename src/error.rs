use thiserror::Error;

/// Crate-wide error type
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Unsupported pixel layout: {0}")]
    UnsupportedLayout(String),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Encoder unavailable: {0}")]
    EncoderUnavailable(String),

    #[error("Encoder error: {0}")]
    Encoder(String),

    #[error("Encoder queue full, frame dropped")]
    EncoderBusy,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("Capture error [{source_name}]: {reason}")]
    Capture { source_name: String, reason: String },

    #[error("Capture permission denied for {0}")]
    PermissionDenied(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Pipeline is not running")]
    PipelineClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StreamError {
    /// Errors that must end the process when they occur during startup
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StreamError::PermissionDenied(_)
                | StreamError::TransportUnavailable(_)
                | StreamError::Config(_)
        )
    }

    /// Short stable key used to throttle repeated log lines
    pub fn kind(&self) -> &'static str {
        match self {
            StreamError::UnsupportedLayout(_) => "unsupported_layout",
            StreamError::InvalidFrame(_) => "invalid_frame",
            StreamError::EncoderUnavailable(_) => "encoder_unavailable",
            StreamError::Encoder(_) => "encoder",
            StreamError::EncoderBusy => "encoder_busy",
            StreamError::Transport(_) => "transport",
            StreamError::TransportUnavailable(_) => "transport_unavailable",
            StreamError::Capture { .. } => "capture",
            StreamError::PermissionDenied(_) => "permission_denied",
            StreamError::Config(_) => "config",
            StreamError::PipelineClosed => "pipeline_closed",
            StreamError::Io(_) => "io",
        }
    }
}

/// Result type alias used throughout the crate
pub type Result<T> = std::result::Result<T, StreamError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(StreamError::PermissionDenied("camera".to_string()).is_fatal());
        assert!(StreamError::TransportUnavailable("bind failed".to_string()).is_fatal());
        assert!(!StreamError::EncoderBusy.is_fatal());
        assert!(!StreamError::UnsupportedLayout("YUYV".to_string()).is_fatal());
    }

    #[test]
    fn test_display() {
        let err = StreamError::Capture {
            source_name: "test-pattern".to_string(),
            reason: "device lost".to_string(),
        };
        assert_eq!(err.to_string(), "Capture error [test-pattern]: device lost");
        assert_eq!(err.kind(), "capture");
    }
}
