//! Encoder registry - selection among the available encoder backends
//!
//! Backends register an `EncoderFactory`; a session asks the registry for
//! the best factory for its codec. Hardware backends win over software ones
//! when the session prefers hardware, then higher priority wins.

use std::sync::Arc;
use tracing::{debug, info};

use super::traits::{EncoderFactory, EncoderParams};
use crate::config::CodecMode;
use crate::error::{Result, StreamError};

/// Information about a registered encoder backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailableEncoder {
    pub name: String,
    pub codec: CodecMode,
    pub is_hardware: bool,
    pub priority: u32,
    pub available: bool,
}

/// Registered encoder backends
#[derive(Default)]
pub struct EncoderRegistry {
    factories: Vec<Arc<dyn EncoderFactory>>,
}

impl EncoderRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the backends compiled into this build
    pub fn with_builtin() -> Self {
        #[allow(unused_mut)]
        let mut registry = Self::new();
        #[cfg(feature = "openh264")]
        registry.register(Arc::new(super::openh264::OpenH264Factory));
        registry
    }

    /// Register a backend
    pub fn register(&mut self, factory: Arc<dyn EncoderFactory>) {
        info!(
            "Registered encoder backend: {} ({}, {})",
            factory.name(),
            factory.codec(),
            if factory.is_hardware() { "hardware" } else { "software" }
        );
        self.factories.push(factory);
    }

    /// List registered backends
    pub fn encoders(&self) -> Vec<AvailableEncoder> {
        self.factories
            .iter()
            .map(|f| AvailableEncoder {
                name: f.name().to_string(),
                codec: f.codec(),
                is_hardware: f.is_hardware(),
                priority: f.priority(),
                available: f.is_available(),
            })
            .collect()
    }

    /// Whether any available backend produces `codec`
    pub fn supports(&self, codec: CodecMode) -> bool {
        self.factories
            .iter()
            .any(|f| f.codec() == codec && f.is_available())
    }

    /// Pick the best available backend for `params`
    pub fn select(&self, params: &EncoderParams) -> Result<Arc<dyn EncoderFactory>> {
        let selected = self
            .factories
            .iter()
            .filter(|f| f.codec() == params.codec && f.is_available())
            .max_by_key(|f| {
                let hardware_rank = params.prefer_hardware && f.is_hardware();
                (hardware_rank, f.priority())
            })
            .cloned()
            .ok_or_else(|| {
                StreamError::EncoderUnavailable(format!("no encoder backend for {}", params.codec))
            })?;

        debug!("Selected encoder backend {} for {}", selected.name(), params.codec);
        Ok(selected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::encoder::traits::{EncodedPacket, HardwareEncoder};
    use crate::video::format::{FrameRate, Resolution};
    use crate::video::frame::VideoFrame;

    struct StubEncoder;

    impl HardwareEncoder for StubEncoder {
        fn name(&self) -> &str {
            "stub"
        }

        fn encode(&mut self, _frame: &VideoFrame, _force_keyframe: bool) -> Result<Vec<EncodedPacket>> {
            Ok(vec![])
        }
    }

    struct StubFactory {
        name: &'static str,
        codec: CodecMode,
        hardware: bool,
        priority: u32,
        available: bool,
    }

    impl EncoderFactory for StubFactory {
        fn name(&self) -> &str {
            self.name
        }

        fn codec(&self) -> CodecMode {
            self.codec
        }

        fn is_hardware(&self) -> bool {
            self.hardware
        }

        fn priority(&self) -> u32 {
            self.priority
        }

        fn is_available(&self) -> bool {
            self.available
        }

        fn create(&self, _params: &EncoderParams) -> Result<Box<dyn HardwareEncoder>> {
            Ok(Box::new(StubEncoder))
        }
    }

    fn stub(name: &'static str, codec: CodecMode, hardware: bool, priority: u32) -> Arc<StubFactory> {
        Arc::new(StubFactory {
            name,
            codec,
            hardware,
            priority,
            available: true,
        })
    }

    fn params(codec: CodecMode) -> EncoderParams {
        EncoderParams::new(codec, Resolution::VGA, FrameRate::new(30, 1), 1_000_000)
    }

    #[test]
    fn test_prefers_hardware_then_priority() {
        let mut registry = EncoderRegistry::new();
        registry.register(stub("sw-high", CodecMode::H264, false, 100));
        registry.register(stub("hw-low", CodecMode::H264, true, 1));
        registry.register(stub("hw-high", CodecMode::H264, true, 5));

        assert_eq!(registry.select(&params(CodecMode::H264)).unwrap().name(), "hw-high");

        let mut software_first = params(CodecMode::H264);
        software_first.prefer_hardware = false;
        assert_eq!(registry.select(&software_first).unwrap().name(), "sw-high");
    }

    #[test]
    fn test_skips_unavailable_and_other_codecs() {
        let mut registry = EncoderRegistry::new();
        registry.register(Arc::new(StubFactory {
            name: "gone",
            codec: CodecMode::Hevc,
            hardware: true,
            priority: 10,
            available: false,
        }));
        registry.register(stub("avc", CodecMode::H264, true, 1));

        assert!(!registry.supports(CodecMode::Hevc));
        assert!(matches!(
            registry.select(&params(CodecMode::Hevc)),
            Err(StreamError::EncoderUnavailable(_))
        ));
        assert_eq!(registry.encoders().len(), 2);
    }

    #[test]
    fn test_empty_registry() {
        let registry = EncoderRegistry::new();
        assert!(registry.select(&params(CodecMode::H264)).is_err());
    }
}
