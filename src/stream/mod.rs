//! Stream lifecycle
//!
//! # Components
//!
//! - `ActivationMonitor` - turns viewer counts into start/stop decisions
//! - `PipelineController` - runs capture and the frame pipeline accordingly

pub mod activation;
pub mod controller;

pub use activation::{ActivationDecision, ActivationMonitor, ActivationState};
pub use controller::{ControllerStats, PipelineController};
