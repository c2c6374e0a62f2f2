//! Subscriber-driven activation
//!
//! Polls the sink's viewer count and decides when capture should run.
//! Capture starts as soon as a viewer appears and stops only after the count
//! has stayed at zero for the hysteresis period. A viewer arriving during
//! that period cancels the pending stop.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ActivationConfig;
use crate::error::{Result, StreamError};
use crate::events::{EventBus, StreamEvent};
use crate::transport::TransportSink;

/// Outcome of one poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivationDecision {
    None,
    StartCapture,
    StopCapture,
    /// The viewer count has been unreadable for a multiple of the
    /// escalation threshold; capture state is unchanged
    Escalate {
        consecutive_failures: u32,
        error: String,
    },
}

/// Derived monitor state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationState {
    /// Capture not wanted
    Idle,
    /// Capture wanted, viewers present
    Active,
    /// Capture wanted, no viewers, stop pending
    Draining,
}

pub struct ActivationMonitor {
    hysteresis: Duration,
    escalation_threshold: u32,
    events: Arc<EventBus>,
    last_count: usize,
    /// Set while active with zero viewers
    zero_since: Option<Instant>,
    active: bool,
    consecutive_failures: u32,
}

impl ActivationMonitor {
    pub fn new(config: &ActivationConfig, events: Arc<EventBus>) -> Self {
        Self {
            hysteresis: config.hysteresis(),
            escalation_threshold: config.failure_escalation_threshold.max(1),
            events,
            last_count: 0,
            zero_since: None,
            active: false,
            consecutive_failures: 0,
        }
    }

    /// Read the sink's viewer count
    pub fn poll(sink: &dyn TransportSink) -> Result<usize> {
        sink.connection_count()
    }

    /// Feed one successful poll result
    pub fn evaluate(&mut self, count: usize, now: Instant) -> ActivationDecision {
        if self.consecutive_failures > 0 {
            info!(
                "Connection count readable again after {} failures",
                self.consecutive_failures
            );
            self.consecutive_failures = 0;
        }

        if count != self.last_count {
            debug!("Viewer count {} -> {}", self.last_count, count);
            self.events.publish(StreamEvent::ConnectionCountChanged {
                previous: self.last_count,
                current: count,
            });
            self.last_count = count;
        }

        if count > 0 {
            if self.zero_since.take().is_some() {
                info!("Viewer reconnected, canceling pending capture stop");
            }
            if !self.active {
                self.active = true;
                info!("{} viewer(s) connected, starting capture", count);
                return ActivationDecision::StartCapture;
            }
            return ActivationDecision::None;
        }

        self.check_drain(now)
    }

    /// Feed one failed poll
    ///
    /// Counts as zero viewers for the pending-stop timer but never stops
    /// capture by itself. Every `escalation_threshold` consecutive failures
    /// yield `Escalate` for the controller.
    pub fn record_failure(&mut self, error: &StreamError, now: Instant) -> ActivationDecision {
        self.consecutive_failures += 1;
        let failures = self.consecutive_failures;

        if self.active && self.zero_since.is_none() {
            self.zero_since = Some(now);
        }

        if failures >= self.escalation_threshold && failures % self.escalation_threshold == 0 {
            error!(
                "Connection count unavailable for {} consecutive polls: {}",
                failures, error
            );
            self.events.publish(StreamEvent::PollFailureEscalated {
                consecutive_failures: failures,
                error: error.to_string(),
            });
            return ActivationDecision::Escalate {
                consecutive_failures: failures,
                error: error.to_string(),
            };
        }

        warn!("Failed to read connection count: {}", error);
        ActivationDecision::None
    }

    fn check_drain(&mut self, now: Instant) -> ActivationDecision {
        if !self.active {
            return ActivationDecision::None;
        }

        let hysteresis = self.hysteresis;
        let since = *self.zero_since.get_or_insert_with(|| {
            info!(
                "No viewers connected, stopping capture in {}ms",
                hysteresis.as_millis()
            );
            now
        });

        if now.duration_since(since) >= hysteresis {
            info!("No viewers for {}ms, stopping capture", hysteresis.as_millis());
            self.active = false;
            self.zero_since = None;
            return ActivationDecision::StopCapture;
        }
        ActivationDecision::None
    }

    pub fn state(&self) -> ActivationState {
        match (self.active, self.zero_since) {
            (false, _) => ActivationState::Idle,
            (true, None) => ActivationState::Active,
            (true, Some(_)) => ActivationState::Draining,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn last_count(&self) -> usize {
        self.last_count
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Run the poll loop until `cancel` fires or the receiver goes away
    pub fn spawn(
        mut self,
        sink: Arc<dyn TransportSink>,
        poll_interval: Duration,
        decisions: mpsc::Sender<ActivationDecision>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!("Activation monitor started (poll every {}ms)", poll_interval.as_millis());

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }

                let now = Instant::now();
                let decision = match Self::poll(sink.as_ref()) {
                    Ok(count) => self.evaluate(count, now),
                    Err(e) => self.record_failure(&e, now),
                };

                if decision != ActivationDecision::None && decisions.send(decision).await.is_err() {
                    break;
                }
            }

            debug!("Activation monitor stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(hysteresis_ms: u64) -> (ActivationMonitor, Arc<EventBus>) {
        let events = Arc::new(EventBus::new());
        let config = ActivationConfig {
            hysteresis_ms,
            ..Default::default()
        };
        (ActivationMonitor::new(&config, events.clone()), events)
    }

    fn run(monitor: &mut ActivationMonitor, counts: &[usize], step: Duration) -> Vec<ActivationDecision> {
        let start = Instant::now();
        counts
            .iter()
            .enumerate()
            .map(|(i, &count)| monitor.evaluate(count, start + step * i as u32))
            .collect()
    }

    #[test]
    fn test_start_on_first_viewer() {
        let (mut m, _) = monitor(2000);
        assert_eq!(m.state(), ActivationState::Idle);
        assert_eq!(m.evaluate(0, Instant::now()), ActivationDecision::None);
        assert_eq!(m.evaluate(3, Instant::now()), ActivationDecision::StartCapture);
        assert_eq!(m.state(), ActivationState::Active);
        assert_eq!(m.evaluate(5, Instant::now()), ActivationDecision::None);
    }

    #[test]
    fn test_stop_after_hysteresis() {
        let (mut m, _) = monitor(2000);
        let decisions = run(&mut m, &[1, 0, 0, 0, 0], Duration::from_millis(500));
        // Zero since t=500ms; hysteresis elapses at t=2500ms
        assert_eq!(
            decisions,
            vec![
                ActivationDecision::StartCapture,
                ActivationDecision::None,
                ActivationDecision::None,
                ActivationDecision::None,
                ActivationDecision::None,
            ]
        );
        assert_eq!(m.state(), ActivationState::Draining);

        let t0 = Instant::now();
        let (mut m, _) = monitor(2000);
        m.evaluate(1, t0);
        m.evaluate(0, t0 + Duration::from_millis(500));
        assert_eq!(
            m.evaluate(0, t0 + Duration::from_millis(2499)),
            ActivationDecision::None
        );
        assert_eq!(
            m.evaluate(0, t0 + Duration::from_millis(2500)),
            ActivationDecision::StopCapture
        );
        assert_eq!(m.state(), ActivationState::Idle);
    }

    #[test]
    fn test_viewer_cancels_pending_stop() {
        let t0 = Instant::now();
        let (mut m, _) = monitor(2000);
        m.evaluate(1, t0);
        m.evaluate(0, t0 + Duration::from_secs(1));
        assert_eq!(m.state(), ActivationState::Draining);

        // Arrives long after the hysteresis would have expired: start wins
        assert_eq!(
            m.evaluate(2, t0 + Duration::from_secs(10)),
            ActivationDecision::None
        );
        assert_eq!(m.state(), ActivationState::Active);

        // Timer restarts from scratch
        m.evaluate(0, t0 + Duration::from_secs(11));
        assert_eq!(
            m.evaluate(0, t0 + Duration::from_secs(12)),
            ActivationDecision::None
        );
        assert_eq!(
            m.evaluate(0, t0 + Duration::from_secs(13)),
            ActivationDecision::StopCapture
        );
    }

    #[test]
    fn test_scenario_decisions() {
        let (mut m, _) = monitor(2000);
        let decisions = run(&mut m, &[0, 0, 1, 1, 0, 0, 0, 0, 1], Duration::from_secs(1));
        use ActivationDecision::*;
        assert_eq!(
            decisions,
            vec![None, None, StartCapture, None, None, None, StopCapture, None, StartCapture]
        );
    }

    #[test]
    fn test_count_change_events() {
        let (mut m, events) = monitor(2000);
        let mut rx = events.subscribe();
        m.evaluate(0, Instant::now());
        m.evaluate(2, Instant::now());
        m.evaluate(2, Instant::now());
        m.evaluate(1, Instant::now());

        let mut changes = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let StreamEvent::ConnectionCountChanged { previous, current } = event {
                changes.push((previous, current));
            }
        }
        assert_eq!(changes, vec![(0, 2), (2, 1)]);
    }

    #[test]
    fn test_failures_never_stop_and_escalate() {
        let t0 = Instant::now();
        let (mut m, events) = monitor(2000);
        let mut rx = events.subscribe();
        m.evaluate(1, t0);

        let err = StreamError::Transport("sink gone".to_string());
        let mut escalated = Vec::new();
        for i in 1..=7u32 {
            match m.record_failure(&err, t0 + Duration::from_secs(i as u64)) {
                ActivationDecision::None => {}
                ActivationDecision::Escalate {
                    consecutive_failures,
                    error,
                } => {
                    assert!(error.contains("sink gone"));
                    escalated.push(consecutive_failures);
                }
                other => panic!("failure must not change capture: {:?}", other),
            }
        }
        assert_eq!(escalated, vec![3, 6]);
        assert!(m.is_active());
        assert_eq!(m.state(), ActivationState::Draining);
        assert_eq!(m.consecutive_failures(), 7);

        let mut escalations = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let StreamEvent::PollFailureEscalated {
                consecutive_failures,
                ..
            } = event
            {
                escalations.push(consecutive_failures);
            }
        }
        assert_eq!(escalations, vec![3, 6]);

        // Failures counted as zero viewers: the next zero read stops at once
        assert_eq!(
            m.evaluate(0, t0 + Duration::from_secs(8)),
            ActivationDecision::StopCapture
        );
        assert_eq!(m.consecutive_failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_loop_sends_decisions() {
        use crate::transport::testing::MockSink;

        let sink = Arc::new(MockSink::with_counts([0, 1, 1, 0, 0, 0, 0]));
        let (mon, _) = monitor(1000);
        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let handle = mon.spawn(sink.clone(), Duration::from_millis(500), tx, cancel.clone());

        assert_eq!(rx.recv().await, Some(ActivationDecision::StartCapture));
        assert_eq!(rx.recv().await, Some(ActivationDecision::StopCapture));

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_loop_forwards_escalation() {
        use crate::transport::testing::MockSink;

        let sink = Arc::new(MockSink::new());
        sink.counts.lock().extend((0..3).map(|_| Err(StreamError::Transport("sink gone".to_string()))));
        let (mon, _) = monitor(1000);
        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let handle = mon.spawn(sink.clone(), Duration::from_millis(500), tx, cancel.clone());

        match rx.recv().await {
            Some(ActivationDecision::Escalate {
                consecutive_failures, ..
            }) => assert_eq!(consecutive_failures, 3),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(sink.polls.load(std::sync::atomic::Ordering::SeqCst), 3);

        cancel.cancel();
        handle.await.unwrap();
    }
}
