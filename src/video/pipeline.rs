//! Frame pipeline - the single serial processing lane
//!
//! ```text
//! capture thread ──submit()──> FrameQueue (drop-oldest)
//!                                   │
//!                                   v
//!                        lane task (one tokio task)
//!                         ├─ Raw:  PixelConverter ──> sink.send_raw
//!                         └─ H264/HEVC: EncoderSession.encode
//!                                   │ (worker thread)
//!                                   v
//!                        output channel ──> lane ──> sink.send_compressed
//! ```
//!
//! Every sink call happens on the lane, so frames reach the sink in
//! submission order. Encoder faults retire the session and schedule a
//! recreate after a fixed backoff; codec-path frames are dropped meanwhile.
//! A panic while handling one frame drops that frame; if the lane task ends
//! for any other reason the pipeline reports itself closed.

use arc_swap::ArcSwap;
use chrono::Utc;
use futures::FutureExt;
use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::config::{CodecMode, StreamConfig};
use crate::error::{Result, StreamError};
use crate::events::{EventBus, PipelineStats, StreamEvent};
use crate::transport::{timestamp_100ns, CompressedTransportFrame, RawTransportFrame, TransportSink};
use crate::utils::{sleep_until, LogThrottler};
use crate::video::convert::PixelConverter;
use crate::video::encoder::{EncoderOutput, EncoderParams, EncoderRegistry, EncoderSession};
use crate::video::format::{FrameRate, Resolution};
use crate::video::frame::{CompressedAccessUnit, FrameQueue, VideoFrame};
use crate::{error_throttled, warn_throttled};

/// Capacity of the encoder output channel
const ENCODER_OUTPUT_CAPACITY: usize = 16;

/// Capacity of the lane command channel
const COMMAND_CAPACITY: usize = 16;

enum Command {
    SetMode(CodecMode),
    SetFrameRate(FrameRate),
    Reset(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

#[derive(Default)]
struct PipelineCounters {
    frames_submitted: AtomicU64,
    frames_sent: AtomicU64,
    dropped_queue_full: AtomicU64,
    dropped_conversion: AtomicU64,
    dropped_encoder: AtomicU64,
    dropped_transport: AtomicU64,
    dropped_internal: AtomicU64,
    encoder_errors: AtomicU64,
    encoder_sessions_created: AtomicU64,
    /// f32 bits
    current_fps: AtomicU32,
}

impl PipelineCounters {
    fn snapshot(&self) -> PipelineStats {
        PipelineStats {
            frames_submitted: self.frames_submitted.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            dropped_queue_full: self.dropped_queue_full.load(Ordering::Relaxed),
            dropped_conversion: self.dropped_conversion.load(Ordering::Relaxed),
            dropped_encoder: self.dropped_encoder.load(Ordering::Relaxed),
            dropped_transport: self.dropped_transport.load(Ordering::Relaxed),
            dropped_internal: self.dropped_internal.load(Ordering::Relaxed),
            encoder_errors: self.encoder_errors.load(Ordering::Relaxed),
            encoder_sessions_created: self.encoder_sessions_created.load(Ordering::Relaxed),
            current_fps: f32::from_bits(self.current_fps.load(Ordering::Relaxed)),
        }
    }
}

/// State shared between the pipeline handle and the lane task
struct Shared {
    queue: Mutex<FrameQueue>,
    frame_ready: Notify,
    closed: AtomicBool,
    counters: PipelineCounters,
    mode: ArcSwap<CodecMode>,
    frame_rate: ArcSwap<FrameRate>,
}

/// Handle to the processing lane
pub struct FramePipeline {
    shared: Arc<Shared>,
    commands: mpsc::Sender<Command>,
    lane: Mutex<Option<JoinHandle<()>>>,
}

impl FramePipeline {
    /// Spawn the lane task
    pub fn start(
        config: Arc<StreamConfig>,
        sink: Arc<dyn TransportSink>,
        registry: Arc<EncoderRegistry>,
        events: Arc<EventBus>,
    ) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(FrameQueue::new(config.pipeline.queue_capacity.max(1))),
            frame_ready: Notify::new(),
            closed: AtomicBool::new(false),
            counters: PipelineCounters::default(),
            mode: ArcSwap::from_pointee(config.codec),
            frame_rate: ArcSwap::from_pointee(config.frame_rate()),
        });
        let (commands, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (outputs_tx, outputs_rx) = mpsc::channel(ENCODER_OUTPUT_CAPACITY);

        info!(
            "Starting frame pipeline: mode={}, rate={}, queue={}",
            config.codec,
            config.frame_rate(),
            config.pipeline.queue_capacity
        );

        let lane = Lane {
            frame_rate: config.frame_rate(),
            config,
            sink,
            registry,
            events,
            shared: shared.clone(),
            converter: PixelConverter::new(),
            session: None,
            draining: None,
            next_generation: 1,
            last_resolution: None,
            recreate_at: None,
            outputs_tx,
            throttle: LogThrottler::with_secs(5),
            fps_frames: 0,
            fps_since: Instant::now(),
        };
        let handle = tokio::spawn(lane.run(command_rx, outputs_rx));

        Self {
            shared,
            commands,
            lane: Mutex::new(Some(handle)),
        }
    }

    /// Hand a frame to the lane without blocking
    ///
    /// If the inbox is full the oldest queued frame is dropped.
    pub fn submit(&self, frame: VideoFrame) -> Result<()> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(StreamError::PipelineClosed);
        }

        let counters = &self.shared.counters;
        counters.frames_submitted.fetch_add(1, Ordering::Relaxed);
        if let Some(evicted) = self.shared.queue.lock().push(frame) {
            counters.dropped_queue_full.fetch_add(1, Ordering::Relaxed);
            trace!("Lane busy, dropped frame #{}", evicted.sequence);
        }
        self.shared.frame_ready.notify_one();
        Ok(())
    }

    /// Switch the output codec
    pub async fn set_mode(&self, mode: CodecMode) -> Result<()> {
        self.send(Command::SetMode(mode)).await
    }

    /// Change the frame rate encoder sessions are created with
    pub async fn set_frame_rate(&self, frame_rate: FrameRate) -> Result<()> {
        self.send(Command::SetFrameRate(frame_rate)).await
    }

    /// Drop queued frames, retire the encoder session and clear sink metadata
    ///
    /// Completes once the lane has done so.
    pub async fn reset(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Reset(tx)).await?;
        rx.await.map_err(|_| StreamError::PipelineClosed)
    }

    /// Current output codec
    pub fn mode(&self) -> CodecMode {
        **self.shared.mode.load()
    }

    pub fn frame_rate(&self) -> FrameRate {
        **self.shared.frame_rate.load()
    }

    pub fn stats(&self) -> PipelineStats {
        self.shared.counters.snapshot()
    }

    pub fn is_running(&self) -> bool {
        !self.shared.closed.load(Ordering::Acquire)
    }

    /// Stop the lane, draining the active encoder session first
    pub async fn shutdown(&self) {
        self.shared.closed.store(true, Ordering::Release);
        let Some(handle) = self.lane.lock().take() else {
            return;
        };

        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown(tx)).await.is_ok() {
            let _ = rx.await;
        }

        if let Err(e) = handle.await {
            error!("Frame pipeline task failed: {}", e);
        }
        info!("Frame pipeline stopped");
    }

    async fn send(&self, command: Command) -> Result<()> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(StreamError::PipelineClosed);
        }
        self.commands
            .send(command)
            .await
            .map_err(|_| StreamError::PipelineClosed)
    }
}

/// Marks the pipeline closed when the lane task ends, including by panic
struct LaneExit(Arc<Shared>);

impl Drop for LaneExit {
    fn drop(&mut self) {
        self.0.closed.store(true, Ordering::Release);
        if std::thread::panicking() {
            error!("Frame pipeline lane panicked, pipeline closed");
        }
    }
}

/// Lane task state; owned exclusively by the lane
struct Lane {
    config: Arc<StreamConfig>,
    sink: Arc<dyn TransportSink>,
    registry: Arc<EncoderRegistry>,
    events: Arc<EventBus>,
    shared: Arc<Shared>,
    converter: PixelConverter,
    frame_rate: FrameRate,
    session: Option<EncoderSession>,
    /// Generation of a session being stopped whose output is still wanted
    draining: Option<u64>,
    next_generation: u64,
    /// Resolution of the most recent codec-path frame
    last_resolution: Option<Resolution>,
    /// Pending recreate after an encoder fault
    recreate_at: Option<Instant>,
    outputs_tx: mpsc::Sender<EncoderOutput>,
    throttle: LogThrottler,
    fps_frames: u64,
    fps_since: Instant,
}

impl Lane {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut outputs: mpsc::Receiver<EncoderOutput>,
    ) {
        let shared = self.shared.clone();
        let _exit = LaneExit(shared.clone());
        let mut stats_tick = tokio::time::interval(self.config.pipeline.stats_interval());
        stats_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        stats_tick.tick().await;

        loop {
            let recreate_at = self.recreate_at;

            tokio::select! {
                biased;

                command = commands.recv() => {
                    match command {
                        Some(Command::SetMode(mode)) => self.set_mode(mode, &mut outputs).await,
                        Some(Command::SetFrameRate(rate)) => self.set_frame_rate(rate, &mut outputs).await,
                        Some(Command::Reset(ack)) => {
                            self.reset(&mut outputs).await;
                            let _ = ack.send(());
                        }
                        Some(Command::Shutdown(ack)) => {
                            self.retire_session(&mut outputs).await;
                            let _ = ack.send(());
                            break;
                        }
                        None => {
                            self.retire_session(&mut outputs).await;
                            break;
                        }
                    }
                }

                Some(output) = outputs.recv() => {
                    let sequence = output.sequence();
                    let handled = AssertUnwindSafe(self.handle_output(output, &mut outputs))
                        .catch_unwind()
                        .await;
                    if handled.is_err() {
                        self.dropped_by_panic(sequence);
                    }
                }

                _ = sleep_until(recreate_at) => {
                    self.recreate_after_fault().await;
                }

                _ = shared.frame_ready.notified() => {
                    let (frame, more) = {
                        let mut queue = shared.queue.lock();
                        (queue.pop(), !queue.is_empty())
                    };
                    if more {
                        // Give commands and encoder output a turn between frames
                        shared.frame_ready.notify_one();
                    }
                    if let Some(frame) = frame {
                        let sequence = Some(frame.sequence);
                        let processed = AssertUnwindSafe(self.process(frame, &mut outputs))
                            .catch_unwind()
                            .await;
                        if processed.is_err() {
                            self.dropped_by_panic(sequence);
                        }
                    }
                }

                _ = stats_tick.tick() => {
                    self.report_stats();
                }
            }
        }

        let discarded = shared.queue.lock().clear();
        if discarded > 0 {
            debug!("Discarded {} queued frames on shutdown", discarded);
        }
        debug!("Frame pipeline lane exited");
    }

    fn dropped_by_panic(&self, sequence: Option<u64>) {
        self.shared
            .counters
            .dropped_internal
            .fetch_add(1, Ordering::Relaxed);
        match sequence {
            Some(sequence) => error!("Processing frame #{} panicked, frame dropped", sequence),
            None => error!("Processing encoder output panicked, output dropped"),
        }
    }

    async fn process(&mut self, frame: VideoFrame, outputs: &mut mpsc::Receiver<EncoderOutput>) {
        let mode = **self.shared.mode.load();
        if mode.is_encoded() {
            self.encode(frame, mode, outputs).await;
        } else {
            self.send_raw(&frame).await;
        }
    }

    async fn send_raw(&mut self, frame: &VideoFrame) {
        let counters = &self.shared.counters;
        let converted = match self.converter.convert(frame) {
            Ok(converted) => converted,
            Err(e) => {
                counters.dropped_conversion.fetch_add(1, Ordering::Relaxed);
                warn_throttled!(self.throttle, e.kind(), "Dropping frame #{}: {}", frame.sequence, e);
                return;
            }
        };

        let raw = RawTransportFrame {
            width: converted.width,
            height: converted.height,
            stride: converted.stride,
            data: converted.data,
            frame_rate: self.frame_rate,
            timestamp: timestamp_100ns(frame.pts),
            sequence: frame.sequence,
        };

        match self.sink.send_raw(raw).await {
            Ok(()) => {
                counters.frames_sent.fetch_add(1, Ordering::Relaxed);
                self.fps_frames += 1;
            }
            Err(e) => {
                counters.dropped_transport.fetch_add(1, Ordering::Relaxed);
                warn_throttled!(self.throttle, "send_raw", "Failed to send raw frame: {}", e);
            }
        }
    }

    async fn encode(
        &mut self,
        frame: VideoFrame,
        mode: CodecMode,
        outputs: &mut mpsc::Receiver<EncoderOutput>,
    ) {
        let counters = &self.shared.counters;
        self.last_resolution = Some(frame.resolution);

        if self.recreate_at.is_some() {
            counters.dropped_encoder.fetch_add(1, Ordering::Relaxed);
            trace!("Encoder recreate pending, dropped frame #{}", frame.sequence);
            return;
        }

        if let Some(session) = &self.session {
            if session.resolution() != frame.resolution {
                info!(
                    "Resolution changed {} -> {}, recreating encoder",
                    session.resolution(),
                    frame.resolution
                );
                self.retire_session(outputs).await;
            }
        }

        if self.session.is_none() {
            if let Err(e) = self.create_session(mode, frame.resolution) {
                self.shared
                    .counters
                    .dropped_encoder
                    .fetch_add(1, Ordering::Relaxed);
                error_throttled!(self.throttle, "encoder_create", "Failed to create {} encoder: {}", mode, e);
                self.schedule_recreate();
                return;
            }
        }

        let Some(session) = &self.session else {
            return;
        };
        match session.encode(frame, false) {
            Ok(()) => {}
            Err(StreamError::EncoderBusy) => {
                self.shared
                    .counters
                    .dropped_encoder
                    .fetch_add(1, Ordering::Relaxed);
                warn_throttled!(self.throttle, "encoder_busy", "Encoder busy, dropping frame");
            }
            Err(e) => {
                self.shared
                    .counters
                    .dropped_encoder
                    .fetch_add(1, Ordering::Relaxed);
                self.fault(e, outputs).await;
            }
        }
    }

    async fn handle_output(&mut self, output: EncoderOutput, outputs: &mut mpsc::Receiver<EncoderOutput>) {
        let active = self.session.as_ref().map(|s| s.generation());
        if active != Some(output.generation) && self.draining != Some(output.generation) {
            trace!("Ignoring output from retired session {}", output.generation);
            return;
        }

        match output.result {
            Ok(unit) => self.send_compressed(unit).await,
            Err(e) if active == Some(output.generation) => self.fault(e, outputs).await,
            Err(e) => debug!("Draining session {} reported: {}", output.generation, e),
        }
    }

    async fn send_compressed(&mut self, unit: CompressedAccessUnit) {
        let counters = &self.shared.counters;
        let frame = CompressedTransportFrame {
            codec: unit.codec,
            resolution: unit.resolution,
            frame_rate: self.frame_rate,
            timestamp: timestamp_100ns(unit.pts),
            key_frame: unit.key_frame,
            sequence: unit.sequence,
            data: unit.data,
        };

        match self.sink.send_compressed(frame).await {
            Ok(()) => {
                counters.frames_sent.fetch_add(1, Ordering::Relaxed);
                self.fps_frames += 1;
            }
            Err(e) => {
                counters.dropped_transport.fetch_add(1, Ordering::Relaxed);
                warn_throttled!(self.throttle, "send_compressed", "Failed to send compressed frame: {}", e);
            }
        }
    }

    /// Retire the faulted session and schedule a recreate
    async fn fault(&mut self, error: StreamError, outputs: &mut mpsc::Receiver<EncoderOutput>) {
        let Some(generation) = self.session.as_ref().map(|s| s.generation()) else {
            return;
        };
        let backoff = self.config.pipeline.encoder_recreate_backoff();
        let codec = **self.shared.mode.load();

        self.shared
            .counters
            .encoder_errors
            .fetch_add(1, Ordering::Relaxed);
        warn!(
            "Encoder session {} faulted: {}; recreating in {}ms",
            generation,
            error,
            backoff.as_millis()
        );
        self.events.publish(StreamEvent::EncoderFault {
            codec,
            generation,
            error: error.to_string(),
            retry_in_ms: backoff.as_millis() as u64,
        });

        // Output still queued by the faulted session is discarded
        self.stop_session(outputs, false).await;
        self.schedule_recreate();
    }

    fn schedule_recreate(&mut self) {
        let backoff = self.config.pipeline.encoder_recreate_backoff();
        self.recreate_at = Some(Instant::now() + backoff);
    }

    async fn recreate_after_fault(&mut self) {
        self.recreate_at = None;
        let mode = **self.shared.mode.load();
        let Some(resolution) = self.last_resolution else {
            return;
        };
        if !mode.is_encoded() || self.session.is_some() {
            return;
        }

        match self.create_session(mode, resolution) {
            Ok(()) => {
                if let Some(session) = &self.session {
                    info!("Encoder recreated at {}", resolution);
                    self.events.publish(StreamEvent::EncoderRecreated {
                        codec: mode,
                        generation: session.generation(),
                        width: resolution.width,
                        height: resolution.height,
                        encoder: session.backend().to_string(),
                    });
                }
            }
            Err(e) => {
                error_throttled!(self.throttle, "encoder_create", "Encoder recreate failed: {}", e);
                self.schedule_recreate();
            }
        }
    }

    fn create_session(&mut self, mode: CodecMode, resolution: Resolution) -> Result<()> {
        let params = EncoderParams::for_config(&self.config, mode, resolution, self.frame_rate);
        let factory = self.registry.select(&params)?;
        let generation = self.next_generation;
        self.next_generation += 1;

        let session = EncoderSession::create(
            params,
            factory.as_ref(),
            generation,
            self.config.pipeline.encoder_queue_depth,
            self.outputs_tx.clone(),
        )?;
        self.shared
            .counters
            .encoder_sessions_created
            .fetch_add(1, Ordering::Relaxed);
        self.throttle.clear("encoder_create");
        self.session = Some(session);
        Ok(())
    }

    /// Stop the active session, forwarding its remaining output to the sink
    async fn retire_session(&mut self, outputs: &mut mpsc::Receiver<EncoderOutput>) {
        self.stop_session(outputs, true).await;
    }

    /// Stop the active session and wait for its worker while draining output
    async fn stop_session(&mut self, outputs: &mut mpsc::Receiver<EncoderOutput>, forward: bool) {
        let Some(session) = self.session.take() else {
            return;
        };
        let generation = session.generation();
        self.draining = forward.then_some(generation);

        let mut join = session.stop();
        loop {
            tokio::select! {
                result = &mut join => {
                    if let Err(e) = result {
                        error!("Encoder worker {} panicked: {}", generation, e);
                    }
                    break;
                }
                Some(output) = outputs.recv() => {
                    self.handle_drained(output).await;
                }
            }
        }
        while let Ok(output) = outputs.try_recv() {
            self.handle_drained(output).await;
        }

        self.draining = None;
        debug!("Encoder session {} retired", generation);
    }

    async fn handle_drained(&mut self, output: EncoderOutput) {
        if Some(output.generation) != self.draining {
            return;
        }
        match output.result {
            Ok(unit) => self.send_compressed(unit).await,
            Err(e) => debug!("Session {} failed while draining: {}", output.generation, e),
        }
    }

    async fn set_mode(&mut self, mode: CodecMode, outputs: &mut mpsc::Receiver<EncoderOutput>) {
        if **self.shared.mode.load() == mode {
            return;
        }
        info!("Switching output mode to {}", mode);
        self.retire_session(outputs).await;
        self.recreate_at = None;
        self.shared.mode.store(Arc::new(mode));
        if let Err(e) = self.sink.clear_metadata().await {
            warn!("Failed to clear sink metadata: {}", e);
        }
    }

    async fn set_frame_rate(&mut self, frame_rate: FrameRate, outputs: &mut mpsc::Receiver<EncoderOutput>) {
        if self.frame_rate == frame_rate {
            return;
        }
        info!("Frame rate changed {} -> {}", self.frame_rate, frame_rate);
        self.retire_session(outputs).await;
        self.frame_rate = frame_rate;
        self.shared.frame_rate.store(Arc::new(frame_rate));
    }

    async fn reset(&mut self, outputs: &mut mpsc::Receiver<EncoderOutput>) {
        let discarded = self.shared.queue.lock().clear();
        self.retire_session(outputs).await;
        self.recreate_at = None;
        self.last_resolution = None;
        if let Err(e) = self.sink.clear_metadata().await {
            warn!("Failed to clear sink metadata: {}", e);
        }
        debug!("Pipeline reset, {} queued frames discarded", discarded);
    }

    fn report_stats(&mut self) {
        let elapsed = self.fps_since.elapsed().as_secs_f32();
        let fps = if elapsed > 0.0 {
            self.fps_frames as f32 / elapsed
        } else {
            0.0
        };
        self.fps_frames = 0;
        self.fps_since = Instant::now();

        let counters = &self.shared.counters;
        counters.current_fps.store(fps.to_bits(), Ordering::Relaxed);
        let stats = counters.snapshot();

        if stats.frames_submitted > 0 {
            info!(
                "Pipeline: {:.1} fps, {} sent, {} dropped",
                fps,
                stats.frames_sent,
                stats.total_dropped()
            );
        }
        self.events.publish(StreamEvent::StatsUpdate {
            stats,
            timestamp: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::{MockSink, Sent};
    use crate::video::encoder::testing::MockFactory;
    use crate::video::format::{ColorRange, PixelLayout};
    use std::time::{Duration, Instant as StdInstant};

    fn config(codec: CodecMode, backoff_ms: u64) -> Arc<StreamConfig> {
        let mut config = StreamConfig {
            codec,
            fps: 29.97,
            ..Default::default()
        };
        config.pipeline.encoder_recreate_backoff_ms = backoff_ms;
        config.pipeline.queue_capacity = 64;
        Arc::new(config)
    }

    fn bgra(width: u32, height: u32, sequence: u64) -> VideoFrame {
        VideoFrame::from_vec(
            vec![sequence as u8; (width * height * 4) as usize],
            Resolution::new(width, height),
            PixelLayout::Bgra,
            sequence,
        )
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    async fn next_event(rx: &mut tokio::sync::broadcast::Receiver<StreamEvent>) -> StreamEvent {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("event timeout")
                .unwrap();
            if !matches!(event, StreamEvent::StatsUpdate { .. }) {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn test_raw_frames_in_order() {
        let sink = Arc::new(MockSink::new());
        let pipeline = FramePipeline::start(
            config(CodecMode::Raw, 1000),
            sink.clone(),
            Arc::new(EncoderRegistry::new()),
            Arc::new(EventBus::new()),
        );

        for seq in 1..=10 {
            pipeline
                .submit(bgra(16, 16, seq).with_pts(Duration::from_millis(seq)))
                .unwrap();
        }
        wait_for(|| sink.sequences().len() == 10).await;
        assert_eq!(sink.sequences(), (1..=10).collect::<Vec<_>>());

        match &sink.sent()[0] {
            Sent::Raw {
                width,
                height,
                data,
                frame_rate,
                timestamp,
                ..
            } => {
                assert_eq!((*width, *height), (16, 16));
                assert_eq!(data.len(), 16 * 16 * 4);
                assert_eq!(*frame_rate, FrameRate::new(30_000, 1001));
                assert_eq!(*timestamp, 10_000);
            }
            other => panic!("unexpected {:?}", other),
        }

        assert_eq!(pipeline.stats().frames_sent, 10);
        pipeline.shutdown().await;
        assert!(matches!(pipeline.submit(bgra(16, 16, 11)), Err(StreamError::PipelineClosed)));
    }

    #[tokio::test]
    async fn test_unsupported_layout_is_dropped_and_counted() {
        let sink = Arc::new(MockSink::new());
        let pipeline = FramePipeline::start(
            config(CodecMode::Raw, 1000),
            sink.clone(),
            Arc::new(EncoderRegistry::new()),
            Arc::new(EventBus::new()),
        );

        let yuyv = VideoFrame::new(
            bytes::Bytes::from(vec![0u8; 16 * 16 * 2]),
            Resolution::new(16, 16),
            PixelLayout::Other(*b"YUYV"),
            32,
            1,
        );
        pipeline.submit(yuyv).unwrap();
        pipeline
            .submit(VideoFrame::from_vec(
                vec![16u8; 16 * 16 * 3 / 2],
                Resolution::new(16, 16),
                PixelLayout::I420(ColorRange::Video),
                2,
            ))
            .unwrap();

        wait_for(|| sink.sequences() == vec![2]).await;
        assert_eq!(pipeline.stats().dropped_conversion, 1);
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_encoded_frames_reach_sink() {
        let sink = Arc::new(MockSink::new());
        let (factory, control) = MockFactory::new(CodecMode::H264);
        let mut registry = EncoderRegistry::new();
        registry.register(factory);

        let pipeline = FramePipeline::start(
            config(CodecMode::H264, 1000),
            sink.clone(),
            Arc::new(registry),
            Arc::new(EventBus::new()),
        );

        for seq in 1..=3 {
            pipeline.submit(bgra(32, 32, seq)).unwrap();
            wait_for(|| sink.sequences().len() as u64 == seq).await;
        }
        assert_eq!(sink.sequences(), vec![1, 2, 3]);

        let created = control.created.lock().clone();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].resolution, Resolution::new(32, 32));
        assert_eq!(created[0].frame_rate, FrameRate::new(30_000, 1001));
        assert_eq!(created[0].keyframe_interval, 60);
        assert_eq!(created[0].bitrate_bps, 3069);

        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_resolution_change_recreates_session() {
        let sink = Arc::new(MockSink::new());
        let (factory, control) = MockFactory::new(CodecMode::Hevc);
        let mut registry = EncoderRegistry::new();
        registry.register(factory);

        let pipeline = FramePipeline::start(
            config(CodecMode::Hevc, 1000),
            sink.clone(),
            Arc::new(registry),
            Arc::new(EventBus::new()),
        );

        pipeline.submit(bgra(32, 32, 1)).unwrap();
        wait_for(|| sink.sequences().len() == 1).await;
        pipeline.submit(bgra(64, 32, 2)).unwrap();
        wait_for(|| sink.sequences().len() == 2).await;

        let created = control.created.lock().clone();
        assert_eq!(created.len(), 2);
        assert_eq!(created[1].resolution, Resolution::new(64, 32));
        assert!(matches!(
            sink.sent()[1],
            Sent::Compressed { resolution, codec: CodecMode::Hevc, .. } if resolution == Resolution::new(64, 32)
        ));
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_three_faults_three_recreates_at_backoff() {
        let backoff = Duration::from_millis(100);
        let sink = Arc::new(MockSink::new());
        let (factory, control) = MockFactory::new(CodecMode::H264);
        control.fail_sequences.lock().extend([1, 2, 3]);
        let mut registry = EncoderRegistry::new();
        registry.register(factory);
        let events = Arc::new(EventBus::new());
        let mut rx = events.subscribe();

        let pipeline = FramePipeline::start(
            config(CodecMode::H264, backoff.as_millis() as u64),
            sink.clone(),
            Arc::new(registry),
            events,
        );

        let resolution = Resolution::new(48, 32);
        for seq in 1..=3u64 {
            pipeline.submit(bgra(48, 32, seq)).unwrap();

            let fault = next_event(&mut rx).await;
            let faulted_at = StdInstant::now();
            assert!(matches!(fault, StreamEvent::EncoderFault { retry_in_ms: 100, .. }));

            // Frames during the backoff are dropped
            pipeline.submit(bgra(48, 32, 100 + seq)).unwrap();

            let recreated = next_event(&mut rx).await;
            assert!(faulted_at.elapsed() >= backoff - Duration::from_millis(10));
            match recreated {
                StreamEvent::EncoderRecreated { width, height, .. } => {
                    assert_eq!(Resolution::new(width, height), resolution);
                }
                other => panic!("unexpected {:?}", other),
            }
        }

        let created = control.created.lock().clone();
        assert_eq!(created.len(), 4);
        assert!(created.iter().all(|p| p.resolution == resolution));

        let stats = pipeline.stats();
        assert_eq!(stats.encoder_errors, 3);
        assert_eq!(stats.dropped_encoder, 3);

        // The recreated session works
        pipeline.submit(bgra(48, 32, 4)).unwrap();
        wait_for(|| sink.sequences() == vec![4]).await;
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_missing_backend_drops_frames() {
        let sink = Arc::new(MockSink::new());
        let pipeline = FramePipeline::start(
            config(CodecMode::Hevc, 50),
            sink.clone(),
            Arc::new(EncoderRegistry::new()),
            Arc::new(EventBus::new()),
        );

        pipeline.submit(bgra(16, 16, 1)).unwrap();
        wait_for(|| pipeline.stats().dropped_encoder == 1).await;
        assert!(sink.sequences().is_empty());
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_mode_switch_and_reset() {
        let sink = Arc::new(MockSink::new());
        let (factory, control) = MockFactory::new(CodecMode::H264);
        let mut registry = EncoderRegistry::new();
        registry.register(factory);

        let pipeline = FramePipeline::start(
            config(CodecMode::Raw, 1000),
            sink.clone(),
            Arc::new(registry),
            Arc::new(EventBus::new()),
        );

        pipeline.submit(bgra(16, 16, 1)).unwrap();
        wait_for(|| sink.sequences().len() == 1).await;

        pipeline.set_mode(CodecMode::H264).await.unwrap();
        pipeline.submit(bgra(16, 16, 2)).unwrap();
        wait_for(|| sink.sequences().len() == 2).await;
        assert_eq!(pipeline.mode(), CodecMode::H264);

        pipeline.set_frame_rate(FrameRate::new(25, 1)).await.unwrap();
        pipeline.submit(bgra(16, 16, 3)).unwrap();
        wait_for(|| sink.sequences().len() == 3).await;
        assert_eq!(control.created.lock()[1].frame_rate, FrameRate::new(25, 1));

        pipeline.reset().await.unwrap();
        let sent = sink.sent();
        assert!(matches!(sent[1], Sent::ClearMetadata));
        assert!(matches!(sent.last(), Some(Sent::ClearMetadata)));
        assert!(matches!(sent[0], Sent::Raw { .. }));
        assert!(matches!(sent[2], Sent::Compressed { .. }));

        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_full_inbox_drops_oldest() {
        let sink = Arc::new(MockSink::new());
        let mut config = (*config(CodecMode::Raw, 1000)).clone();
        config.pipeline.queue_capacity = 2;
        let pipeline = FramePipeline::start(
            Arc::new(config),
            sink.clone(),
            Arc::new(EncoderRegistry::new()),
            Arc::new(EventBus::new()),
        );

        // No await between submits: the lane cannot run on this
        // current-thread runtime until the test yields
        for seq in 1..=5 {
            pipeline.submit(bgra(16, 16, seq)).unwrap();
        }
        wait_for(|| sink.sequences().len() == 2).await;
        assert_eq!(sink.sequences(), vec![4, 5]);
        assert_eq!(pipeline.stats().dropped_queue_full, 3);
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_panicking_frame_is_dropped_and_lane_survives() {
        let sink = Arc::new(MockSink::new());
        *sink.panic_on.lock() = Some(1);
        let pipeline = FramePipeline::start(
            config(CodecMode::Raw, 1000),
            sink.clone(),
            Arc::new(EncoderRegistry::new()),
            Arc::new(EventBus::new()),
        );

        pipeline.submit(bgra(16, 16, 1)).unwrap();
        pipeline.submit(bgra(16, 16, 2)).unwrap();
        wait_for(|| sink.sequences().len() == 1).await;

        assert_eq!(sink.sequences(), vec![2]);
        let stats = pipeline.stats();
        assert_eq!(stats.dropped_internal, 1);
        assert_eq!(stats.frames_sent, 1);
        assert!(pipeline.is_running());

        pipeline.submit(bgra(16, 16, 3)).unwrap();
        wait_for(|| sink.sequences().len() == 2).await;
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_lane_panic_closes_pipeline() {
        let sink = Arc::new(MockSink::new());
        sink.panic_on_clear.store(true, Ordering::SeqCst);
        let pipeline = FramePipeline::start(
            config(CodecMode::Raw, 1000),
            sink.clone(),
            Arc::new(EncoderRegistry::new()),
            Arc::new(EventBus::new()),
        );

        assert!(matches!(pipeline.reset().await, Err(StreamError::PipelineClosed)));
        wait_for(|| !pipeline.is_running()).await;
        assert!(matches!(pipeline.submit(bgra(16, 16, 1)), Err(StreamError::PipelineClosed)));
        assert!(matches!(pipeline.set_mode(CodecMode::H264).await, Err(StreamError::PipelineClosed)));

        // Shutdown after the lane died still returns
        pipeline.shutdown().await;
    }
}
