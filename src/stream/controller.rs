//! Stream lifecycle
//!
//! The controller ties the pieces together: the activation monitor decides
//! when capture should run, a driver task starts and stops the capture source
//! accordingly and restarts it after failures, and frames flow from the
//! source straight into the frame pipeline.

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::activation::{ActivationDecision, ActivationMonitor};
use crate::capture::{closest_frame_rate, CaptureFault, CaptureHandle, CaptureSettings, CaptureSource};
use crate::config::StreamConfig;
use crate::error::{Result, StreamError};
use crate::events::{CaptureState, EventBus, PipelineStats, StreamEvent};
use crate::transport::TransportSink;
use crate::utils::sleep_until;
use crate::video::encoder::EncoderRegistry;
use crate::video::format::FrameRate;
use crate::video::pipeline::FramePipeline;

const DECISION_CAPACITY: usize = 8;
const FAULT_CAPACITY: usize = 8;

/// Snapshot of the whole stream
#[derive(Debug, Clone, Serialize)]
pub struct ControllerStats {
    pub capture_state: CaptureState,
    /// Last viewer count the sink reported, if readable
    pub viewers: Option<usize>,
    pub frame_rate: FrameRate,
    pub capture_restarts: u64,
    /// Times the viewer count stayed unreadable for a full escalation window
    pub poll_escalations: u64,
    /// Error behind the most recent escalation
    pub last_poll_error: Option<String>,
    /// False once the frame pipeline lane has stopped
    pub pipeline_running: bool,
    pub pipeline: PipelineStats,
}

/// State visible outside the driver task
#[derive(Default)]
struct Status {
    capture_state: ArcSwap<CaptureState>,
    capture_restarts: AtomicU64,
    poll_escalations: AtomicU64,
    last_poll_error: Mutex<Option<String>>,
}

/// Owns the stream: activation, capture and the frame pipeline
pub struct PipelineController {
    config: Arc<StreamConfig>,
    source: Arc<dyn CaptureSource>,
    sink: Arc<dyn TransportSink>,
    events: Arc<EventBus>,
    pipeline: Arc<FramePipeline>,
    status: Arc<Status>,
    started: AtomicBool,
    monitor_cancel: CancellationToken,
    driver_cancel: CancellationToken,
    monitor_task: Mutex<Option<JoinHandle<()>>>,
    driver_task: Mutex<Option<JoinHandle<()>>>,
}

impl PipelineController {
    /// Create the controller and its frame pipeline
    ///
    /// Must be called inside a tokio runtime; nothing is captured until
    /// `start`.
    pub fn new(
        config: Arc<StreamConfig>,
        source: Arc<dyn CaptureSource>,
        sink: Arc<dyn TransportSink>,
        registry: Arc<EncoderRegistry>,
        events: Arc<EventBus>,
    ) -> Self {
        let pipeline = Arc::new(FramePipeline::start(
            config.clone(),
            sink.clone(),
            registry,
            events.clone(),
        ));
        Self {
            config,
            source,
            sink,
            events,
            pipeline,
            status: Arc::new(Status::default()),
            started: AtomicBool::new(false),
            monitor_cancel: CancellationToken::new(),
            driver_cancel: CancellationToken::new(),
            monitor_task: Mutex::new(None),
            driver_task: Mutex::new(None),
        }
    }

    /// Authorize the source, negotiate the frame rate and begin reacting to
    /// viewers
    ///
    /// A denied capture permission is returned as a fatal error.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            debug!("Controller already started");
            return Ok(());
        }

        if let Err(e) = self.source.authorize().await {
            error!("Capture source {} not authorized: {}", self.source.name(), e);
            self.started.store(false, Ordering::SeqCst);
            return Err(e);
        }

        let frame_rate = self.negotiate_frame_rate().await?;
        let settings = CaptureSettings {
            resolution: self.config.resolution(),
            frame_rate,
        };

        let (decisions_tx, decisions_rx) = mpsc::channel(DECISION_CAPACITY);
        let (faults_tx, faults_rx) = mpsc::channel(FAULT_CAPACITY);

        let driver = CaptureDriver {
            source: self.source.clone(),
            pipeline: self.pipeline.clone(),
            events: self.events.clone(),
            status: self.status.clone(),
            settings,
            restart_delay: self.config.capture_restart_delay(),
            faults_tx,
            epoch: 0,
            wanted: false,
            running: false,
            restart_at: None,
        };
        *self.driver_task.lock() = Some(tokio::spawn(driver.run(
            decisions_rx,
            faults_rx,
            self.driver_cancel.clone(),
        )));

        let activation = &self.config.activation;
        if activation.always_on {
            info!("Always-on mode, starting capture without viewers");
            decisions_tx
                .send(ActivationDecision::StartCapture)
                .await
                .map_err(|_| StreamError::PipelineClosed)?;
        } else {
            let monitor = ActivationMonitor::new(activation, self.events.clone());
            *self.monitor_task.lock() = Some(monitor.spawn(
                self.sink.clone(),
                activation.poll_interval(),
                decisions_tx,
                self.monitor_cancel.clone(),
            ));
        }

        info!(
            "Stream {} started: {} @ {}, codec {}",
            self.config.source_name, settings.resolution, frame_rate, self.config.codec
        );
        Ok(())
    }

    async fn negotiate_frame_rate(&self) -> Result<FrameRate> {
        let requested = self.config.frame_rate();
        let ranges = self.source.supported_frame_rates();
        let Some(fps) = closest_frame_rate(self.config.fps, &ranges) else {
            return Ok(requested);
        };

        let negotiated = FrameRate::from_fps(fps);
        if negotiated != requested {
            info!(
                "Source {} cannot deliver {} fps, using {} fps",
                self.source.name(),
                self.config.fps,
                fps
            );
            self.pipeline.set_frame_rate(negotiated).await?;
        }
        Ok(negotiated)
    }

    /// Tear down in order: monitor, capture, then the pipeline lane
    pub async fn shutdown(&self) {
        self.monitor_cancel.cancel();
        let monitor = self.monitor_task.lock().take();
        if let Some(monitor) = monitor {
            if let Err(e) = monitor.await {
                error!("Activation monitor task failed: {}", e);
            }
        }

        self.driver_cancel.cancel();
        let driver = self.driver_task.lock().take();
        if let Some(driver) = driver {
            if let Err(e) = driver.await {
                error!("Capture driver task failed: {}", e);
            }
        }

        self.pipeline.shutdown().await;
        info!("Stream {} stopped", self.config.source_name);
    }

    pub fn capture_state(&self) -> CaptureState {
        **self.status.capture_state.load()
    }

    pub fn pipeline(&self) -> &Arc<FramePipeline> {
        &self.pipeline
    }

    pub fn stats(&self) -> ControllerStats {
        ControllerStats {
            capture_state: self.capture_state(),
            viewers: self.sink.connection_count().ok(),
            frame_rate: self.pipeline.frame_rate(),
            capture_restarts: self.status.capture_restarts.load(Ordering::Relaxed),
            poll_escalations: self.status.poll_escalations.load(Ordering::Relaxed),
            last_poll_error: self.status.last_poll_error.lock().clone(),
            pipeline_running: self.pipeline.is_running(),
            pipeline: self.pipeline.stats(),
        }
    }
}

/// Task that owns the capture source's running state
struct CaptureDriver {
    source: Arc<dyn CaptureSource>,
    pipeline: Arc<FramePipeline>,
    events: Arc<EventBus>,
    status: Arc<Status>,
    settings: CaptureSettings,
    restart_delay: Duration,
    faults_tx: mpsc::Sender<CaptureFault>,
    /// Incremented on every start so late faults from an old run are ignored
    epoch: u64,
    /// Capture requested by the activation decisions
    wanted: bool,
    running: bool,
    restart_at: Option<Instant>,
}

impl CaptureDriver {
    async fn run(
        mut self,
        mut decisions: mpsc::Receiver<ActivationDecision>,
        mut faults: mpsc::Receiver<CaptureFault>,
        cancel: CancellationToken,
    ) {
        loop {
            let restart_at = self.restart_at;
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                Some(decision) = decisions.recv() => match decision {
                    ActivationDecision::StartCapture => {
                        self.wanted = true;
                        self.start_capture().await;
                    }
                    ActivationDecision::StopCapture => {
                        self.wanted = false;
                        self.stop_capture().await;
                    }
                    ActivationDecision::Escalate { consecutive_failures, error } => {
                        self.on_poll_escalation(consecutive_failures, error);
                    }
                    ActivationDecision::None => {}
                },

                Some(fault) = faults.recv() => self.on_fault(fault).await,

                _ = sleep_until(restart_at) => {
                    self.restart_at = None;
                    if self.wanted {
                        info!("Restarting capture on {}", self.source.name());
                        self.status.capture_restarts.fetch_add(1, Ordering::Relaxed);
                        self.start_capture().await;
                    }
                }
            }
        }

        self.wanted = false;
        self.stop_capture().await;
        debug!("Capture driver stopped");
    }

    async fn start_capture(&mut self) {
        if self.running {
            return;
        }
        self.restart_at = None;
        self.epoch += 1;
        self.set_state(CaptureState::Starting, None);

        let handle = CaptureHandle::new(Arc::downgrade(&self.pipeline), self.faults_tx.clone(), self.epoch);
        match self.source.start(self.settings, handle).await {
            Ok(()) => {
                self.running = true;
                self.set_state(CaptureState::Running, None);
            }
            Err(e) => {
                error!("Failed to start capture on {}: {}", self.source.name(), e);
                self.set_state(CaptureState::Error, Some(e.to_string()));
                self.schedule_restart(&e);
            }
        }
    }

    async fn stop_capture(&mut self) {
        self.restart_at = None;
        if self.running {
            self.set_state(CaptureState::Stopping, None);
            if let Err(e) = self.source.stop().await {
                warn!("Error stopping capture on {}: {}", self.source.name(), e);
            }
            self.running = false;
        }

        // Frames still queued belong to the stopped run
        if let Err(e) = self.pipeline.reset().await {
            debug!("Pipeline reset skipped: {}", e);
        }
        self.set_state(CaptureState::Stopped, None);
    }

    async fn on_fault(&mut self, fault: CaptureFault) {
        if fault.epoch != self.epoch || !self.running {
            debug!("Ignoring fault from capture run {}: {}", fault.epoch, fault.error);
            return;
        }

        warn!("Capture on {} failed: {}", self.source.name(), fault.error);
        if let Err(e) = self.source.stop().await {
            debug!("Stop after capture failure: {}", e);
        }
        self.running = false;
        self.set_state(CaptureState::Error, Some(fault.error.to_string()));
        self.schedule_restart(&fault.error);
    }

    /// Record an unreadable viewer count; capture keeps its current state
    fn on_poll_escalation(&self, consecutive_failures: u32, error: String) {
        let total = self.status.poll_escalations.fetch_add(1, Ordering::Relaxed) + 1;
        error!(
            "Viewer count for {} unreadable for {} polls (escalation #{}), capture {}",
            self.source.name(),
            consecutive_failures,
            total,
            if self.running { "kept running" } else { "stays stopped" }
        );
        *self.status.last_poll_error.lock() = Some(error);
    }

    fn schedule_restart(&mut self, error: &StreamError) {
        if !self.wanted {
            return;
        }
        let delay = self.restart_delay;
        self.restart_at = Some(Instant::now() + delay);
        info!("Capture restart scheduled in {}ms", delay.as_millis());
        self.events.publish(StreamEvent::CaptureRestartScheduled {
            source: self.source.name().to_string(),
            error: error.to_string(),
            retry_in_ms: delay.as_millis() as u64,
        });
    }

    fn set_state(&self, state: CaptureState, reason: Option<String>) {
        let previous = **self.status.capture_state.load();
        if previous == state && reason.is_none() {
            return;
        }
        self.status.capture_state.store(Arc::new(state));
        debug!("Capture state {} -> {}", previous, state);
        self.events.publish(StreamEvent::CaptureStateChanged {
            source: self.source.name().to_string(),
            state,
            reason,
        });
    }
}
