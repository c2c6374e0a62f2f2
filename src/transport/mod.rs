//! Transport sinks
//!
//! A sink delivers processed frames to viewers and reports how many viewers
//! are connected. Exactly one sink is active per process.

pub mod tcp;

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

use crate::config::CodecMode;
use crate::error::Result;
use crate::video::format::{FrameRate, Resolution};

pub use tcp::TcpTransportSink;

/// An uncompressed BGRA frame borrowed from the lane's converter
#[derive(Debug)]
pub struct RawTransportFrame<'a> {
    pub width: u32,
    pub height: u32,
    /// Bytes per row
    pub stride: u32,
    /// Packed BGRA pixels
    pub data: &'a [u8],
    pub frame_rate: FrameRate,
    /// Presentation time in 100 ns units, 0 if the source has no clock
    pub timestamp: u64,
    pub sequence: u64,
}

/// A compressed access unit ready for the wire
#[derive(Debug, Clone)]
pub struct CompressedTransportFrame {
    pub codec: CodecMode,
    pub data: Bytes,
    pub resolution: Resolution,
    pub frame_rate: FrameRate,
    /// Presentation time in 100 ns units, 0 if the source has no clock
    pub timestamp: u64,
    pub key_frame: bool,
    pub sequence: u64,
}

/// Downstream transport
///
/// All send calls come from the single processing lane, in order.
#[async_trait]
pub trait TransportSink: Send + Sync {
    /// Current number of connected viewers
    ///
    /// Must not block; implementations return a cached value.
    fn connection_count(&self) -> Result<usize>;

    async fn send_raw(&self, frame: RawTransportFrame<'_>) -> Result<()>;

    async fn send_compressed(&self, frame: CompressedTransportFrame) -> Result<()>;

    /// Forget per-stream metadata (format, parameter sets) after a reset
    async fn clear_metadata(&self) -> Result<()>;
}

/// Presentation time in 100 ns units, 0 when absent
pub fn timestamp_100ns(pts: Option<Duration>) -> u64 {
    pts.map(|d| (d.as_nanos() / 100) as u64).unwrap_or(0)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::error::StreamError;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// What a `MockSink` received
    #[derive(Debug, Clone, PartialEq)]
    pub enum Sent {
        Raw {
            width: u32,
            height: u32,
            data: Vec<u8>,
            frame_rate: FrameRate,
            timestamp: u64,
            sequence: u64,
        },
        Compressed {
            codec: CodecMode,
            resolution: Resolution,
            frame_rate: FrameRate,
            timestamp: u64,
            sequence: u64,
        },
        ClearMetadata,
    }

    /// Sink that records everything and replays scripted viewer counts
    #[derive(Default)]
    pub struct MockSink {
        pub sent: Mutex<Vec<Sent>>,
        /// Scripted poll results; the last one repeats once the script runs out
        pub counts: Mutex<VecDeque<Result<usize>>>,
        last_count: AtomicUsize,
        pub polls: AtomicUsize,
        pub fail_sends: AtomicBool,
        /// Sequence number whose raw send panics
        pub panic_on: Mutex<Option<u64>>,
        pub panic_on_clear: AtomicBool,
    }

    impl MockSink {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_counts(counts: impl IntoIterator<Item = usize>) -> Self {
            let sink = Self::new();
            *sink.counts.lock() = counts.into_iter().map(Ok).collect();
            sink
        }

        pub fn set_count(&self, count: usize) {
            self.counts.lock().clear();
            self.last_count.store(count, Ordering::SeqCst);
        }

        pub fn sent(&self) -> Vec<Sent> {
            self.sent.lock().clone()
        }

        pub fn sequences(&self) -> Vec<u64> {
            self.sent
                .lock()
                .iter()
                .filter_map(|s| match s {
                    Sent::Raw { sequence, .. } | Sent::Compressed { sequence, .. } => Some(*sequence),
                    Sent::ClearMetadata => None,
                })
                .collect()
        }
    }

    #[async_trait]
    impl TransportSink for MockSink {
        fn connection_count(&self) -> Result<usize> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            match self.counts.lock().pop_front() {
                Some(Ok(count)) => {
                    self.last_count.store(count, Ordering::SeqCst);
                    Ok(count)
                }
                Some(Err(e)) => Err(e),
                None => Ok(self.last_count.load(Ordering::SeqCst)),
            }
        }

        async fn send_raw(&self, frame: RawTransportFrame<'_>) -> Result<()> {
            if self.fail_sends.load(Ordering::SeqCst) {
                return Err(StreamError::Transport("mock send failure".to_string()));
            }
            if *self.panic_on.lock() == Some(frame.sequence) {
                panic!("mock sink panicked on frame {}", frame.sequence);
            }
            self.sent.lock().push(Sent::Raw {
                width: frame.width,
                height: frame.height,
                data: frame.data.to_vec(),
                frame_rate: frame.frame_rate,
                timestamp: frame.timestamp,
                sequence: frame.sequence,
            });
            Ok(())
        }

        async fn send_compressed(&self, frame: CompressedTransportFrame) -> Result<()> {
            if self.fail_sends.load(Ordering::SeqCst) {
                return Err(StreamError::Transport("mock send failure".to_string()));
            }
            self.sent.lock().push(Sent::Compressed {
                codec: frame.codec,
                resolution: frame.resolution,
                frame_rate: frame.frame_rate,
                timestamp: frame.timestamp,
                sequence: frame.sequence,
            });
            Ok(())
        }

        async fn clear_metadata(&self) -> Result<()> {
            if self.panic_on_clear.load(Ordering::SeqCst) {
                panic!("mock sink panicked while clearing metadata");
            }
            self.sent.lock().push(Sent::ClearMetadata);
            Ok(())
        }
    }
}
