//! Encoder session - one encoder instance bound to a resolution and rate
//!
//! A session owns a worker running on the blocking thread pool. Frames are
//! handed over through a small bounded job queue; compressed output comes
//! back over the lane's output channel tagged with the session generation,
//! so output from a retired session can be recognised and ignored.

use std::sync::mpsc as std_mpsc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::traits::{EncodedPacket, EncoderFactory, EncoderParams, HardwareEncoder};
use crate::error::{Result, StreamError};
use crate::video::format::Resolution;
use crate::video::frame::{CompressedAccessUnit, VideoFrame};

/// Result of one encode, delivered asynchronously
#[derive(Debug)]
pub struct EncoderOutput {
    /// Generation of the session that produced this output
    pub generation: u64,
    pub result: Result<CompressedAccessUnit>,
}

impl EncoderOutput {
    /// Source frame sequence, when encoding succeeded
    pub fn sequence(&self) -> Option<u64> {
        self.result.as_ref().ok().map(|unit| unit.sequence)
    }
}

struct EncodeJob {
    frame: VideoFrame,
    force_keyframe: bool,
}

/// A live encoder session
pub struct EncoderSession {
    generation: u64,
    params: EncoderParams,
    backend: String,
    jobs: std_mpsc::SyncSender<EncodeJob>,
    worker: JoinHandle<()>,
}

impl EncoderSession {
    /// Create the encoder and start its worker
    ///
    /// Fails with `EncoderUnavailable` if the backend cannot be instantiated.
    pub fn create(
        params: EncoderParams,
        factory: &dyn EncoderFactory,
        generation: u64,
        queue_depth: usize,
        outputs: mpsc::Sender<EncoderOutput>,
    ) -> Result<Self> {
        let encoder = factory.create(&params).map_err(|e| match e {
            StreamError::EncoderUnavailable(_) => e,
            other => StreamError::EncoderUnavailable(format!("{}: {}", factory.name(), other)),
        })?;
        let backend = encoder.name().to_string();

        let (jobs, job_rx) = std_mpsc::sync_channel(queue_depth.max(1));
        let worker_params = params.clone();
        let worker = tokio::task::spawn_blocking(move || {
            encode_loop(encoder, worker_params, generation, job_rx, outputs);
        });

        info!(
            "Encoder session {} created: {} {} @ {} fps, {} bps via {}",
            generation,
            params.codec,
            params.resolution,
            params.frame_rate,
            params.bitrate_bps,
            backend
        );

        Ok(Self {
            generation,
            params,
            backend,
            jobs,
            worker,
        })
    }

    /// Queue a frame for encoding without waiting
    ///
    /// Returns `EncoderBusy` when the job queue is full; the frame is dropped.
    pub fn encode(&self, frame: VideoFrame, force_keyframe: bool) -> Result<()> {
        if frame.resolution != self.params.resolution {
            return Err(StreamError::InvalidFrame(format!(
                "frame {} does not match session {}",
                frame.resolution, self.params.resolution
            )));
        }

        match self.jobs.try_send(EncodeJob {
            frame,
            force_keyframe,
        }) {
            Ok(()) => Ok(()),
            Err(std_mpsc::TrySendError::Full(_)) => Err(StreamError::EncoderBusy),
            Err(std_mpsc::TrySendError::Disconnected(_)) => Err(StreamError::Encoder(format!(
                "session {} worker has exited",
                self.generation
            ))),
        }
    }

    /// Close the job queue and return the worker handle
    ///
    /// The worker finishes queued frames, flushes and releases the encoder.
    /// The caller must keep draining the output channel until the handle
    /// completes.
    pub fn stop(self) -> JoinHandle<()> {
        debug!("Stopping encoder session {}", self.generation);
        drop(self.jobs);
        self.worker
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn resolution(&self) -> Resolution {
        self.params.resolution
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }
}

fn encode_loop(
    mut encoder: Box<dyn HardwareEncoder>,
    params: EncoderParams,
    generation: u64,
    jobs: std_mpsc::Receiver<EncodeJob>,
    outputs: mpsc::Sender<EncoderOutput>,
) {
    let emit = |result: Result<CompressedAccessUnit>| {
        outputs
            .blocking_send(EncoderOutput { generation, result })
            .is_ok()
    };

    while let Ok(job) = jobs.recv() {
        let frame = job.frame;
        match encoder.encode(&frame, job.force_keyframe) {
            Ok(packets) => {
                trace!("Session {} encoded frame #{}", generation, frame.sequence);
                for packet in packets {
                    if !emit(Ok(access_unit(&params, &frame, packet))) {
                        return;
                    }
                }
            }
            Err(e) => {
                warn!("Encoder session {} failed: {}", generation, e);
                emit(Err(e));
                // A faulted encoder is never fed again
                return;
            }
        }
    }

    match encoder.flush() {
        Ok(packets) => {
            for packet in packets {
                let unit = CompressedAccessUnit {
                    codec: params.codec,
                    data: packet.data,
                    resolution: params.resolution,
                    pts: None,
                    key_frame: packet.key_frame,
                    sequence: 0,
                };
                if !emit(Ok(unit)) {
                    return;
                }
            }
        }
        Err(e) => debug!("Encoder session {} flush failed: {}", generation, e),
    }

    debug!("Encoder session {} worker exited", generation);
}

fn access_unit(params: &EncoderParams, frame: &VideoFrame, packet: EncodedPacket) -> CompressedAccessUnit {
    CompressedAccessUnit {
        codec: params.codec,
        data: packet.data,
        resolution: params.resolution,
        pts: frame.pts,
        key_frame: packet.key_frame,
        sequence: frame.sequence,
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::config::CodecMode;
    use crate::video::format::{FrameRate, PixelLayout};
    use std::time::Duration;

    fn params() -> EncoderParams {
        EncoderParams::new(
            CodecMode::H264,
            Resolution::new(16, 16),
            FrameRate::new(30, 1),
            500_000,
        )
    }

    fn frame(sequence: u64) -> VideoFrame {
        VideoFrame::from_vec(vec![0u8; 16 * 16 * 4], Resolution::new(16, 16), PixelLayout::Bgra, sequence)
            .with_pts(Duration::from_millis(sequence * 33))
    }

    #[tokio::test]
    async fn test_outputs_in_order_with_generation() {
        let (factory, _control) = MockFactory::new(CodecMode::H264);
        let (tx, mut rx) = mpsc::channel(16);
        let session = EncoderSession::create(params(), factory.as_ref(), 7, 3, tx).unwrap();
        assert_eq!(session.backend(), "mock");

        for seq in 1..=3 {
            session.encode(frame(seq), false).unwrap();
            let output = rx.recv().await.unwrap();
            assert_eq!(output.generation, 7);
            let unit = output.result.unwrap();
            assert_eq!(unit.sequence, seq);
            assert_eq!(unit.pts, Some(Duration::from_millis(seq * 33)));
            assert_eq!(unit.key_frame, seq == 1);
        }

        session.stop().await.unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_full_queue_reports_busy() {
        let (factory, control) = MockFactory::new(CodecMode::H264);
        let (gate_tx, gate_rx) = std_mpsc::channel();
        let (started_tx, started_rx) = std_mpsc::channel();
        *control.gate.lock() = Some(gate_rx);
        *control.started.lock() = Some(started_tx);

        let (tx, mut rx) = mpsc::channel(16);
        let session = EncoderSession::create(params(), factory.as_ref(), 1, 1, tx).unwrap();

        session.encode(frame(1), false).unwrap();
        // Worker holds frame 1; the queue has room for exactly one more
        let started = tokio::task::spawn_blocking(move || started_rx.recv()).await.unwrap();
        assert_eq!(started.unwrap(), 1);
        session.encode(frame(2), false).unwrap();
        assert!(matches!(session.encode(frame(3), false), Err(StreamError::EncoderBusy)));

        gate_tx.send(()).unwrap();
        gate_tx.send(()).unwrap();
        let join = session.stop();

        let mut sequences = Vec::new();
        while let Some(output) = rx.recv().await {
            sequences.push(output.result.unwrap().sequence);
        }
        join.await.unwrap();
        assert_eq!(sequences, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_error_ends_worker() {
        let (factory, control) = MockFactory::new(CodecMode::H264);
        control.fail_sequences.lock().push(1);
        let (tx, mut rx) = mpsc::channel(16);
        let session = EncoderSession::create(params(), factory.as_ref(), 2, 3, tx).unwrap();

        session.encode(frame(1), false).unwrap();
        let output = rx.recv().await.unwrap();
        assert!(matches!(output.result, Err(StreamError::Encoder(_))));

        // Worker is gone: the next encode cannot be queued
        let mut result = session.encode(frame(2), false);
        for _ in 0..50 {
            if result.is_err() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            result = session.encode(frame(2), false);
        }
        assert!(matches!(result, Err(StreamError::Encoder(_))));
        session.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_create_failure_is_unavailable() {
        let (factory, control) = MockFactory::new(CodecMode::H264);
        control
            .fail_creates
            .store(1, std::sync::atomic::Ordering::SeqCst);
        let (tx, _rx) = mpsc::channel(16);
        let result = EncoderSession::create(params(), factory.as_ref(), 1, 3, tx);
        assert!(matches!(result, Err(StreamError::EncoderUnavailable(_))));
    }

    #[tokio::test]
    async fn test_resolution_mismatch_rejected() {
        let (factory, _control) = MockFactory::new(CodecMode::H264);
        let (tx, _rx) = mpsc::channel(16);
        let session = EncoderSession::create(params(), factory.as_ref(), 1, 3, tx).unwrap();
        let other = VideoFrame::from_vec(vec![0u8; 32 * 16 * 4], Resolution::new(32, 16), PixelLayout::Bgra, 1);
        assert!(matches!(session.encode(other, false), Err(StreamError::InvalidFrame(_))));
        session.stop().await.unwrap();
    }
}
