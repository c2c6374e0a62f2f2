//! Stream notifications
//!
//! The monitor, the lane and the controller report what they do as
//! `StreamEvent`s. The binary turns them into log lines; tests subscribe and
//! assert on them. Nothing in the pipeline waits on a subscriber.

pub mod types;

pub use types::{CaptureState, PipelineStats, StreamEvent};

use tokio::sync::broadcast;
use tracing::trace;

/// Events a subscriber may fall behind by before it sees `Lagged`
const EVENT_BACKLOG: usize = 256;

/// Fan-out of stream events
///
/// A subscriber only sees events published after it subscribed.
///
/// ```
/// use autocast::events::{CaptureState, EventBus, StreamEvent};
///
/// let bus = EventBus::new();
/// let mut rx = bus.subscribe();
/// bus.publish(StreamEvent::CaptureStateChanged {
///     source: "pattern".to_string(),
///     state: CaptureState::Running,
///     reason: None,
/// });
///
/// let event = rx.try_recv().unwrap();
/// assert_eq!(event.event_name(), "stream.capture_state_changed");
/// ```
pub struct EventBus {
    tx: broadcast::Sender<StreamEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BACKLOG);
        Self { tx }
    }

    /// Never blocks; with nobody listening the event is discarded
    pub fn publish(&self, event: StreamEvent) {
        trace!("Publishing {}", event.event_name());
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn restart(retry_in_ms: u64) -> StreamEvent {
        StreamEvent::CaptureRestartScheduled {
            source: "pattern".to_string(),
            error: "device unplugged".to_string(),
            retry_in_ms,
        }
    }

    #[tokio::test]
    async fn test_events_arrive_in_publish_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(StreamEvent::ConnectionCountChanged {
            previous: 0,
            current: 1,
        });
        bus.publish(restart(1000));

        let names = [rx.recv().await.unwrap(), rx.recv().await.unwrap()].map(|e| e.event_name());
        assert_eq!(
            names,
            ["stream.connection_count_changed", "stream.capture_restart_scheduled"]
        );
    }

    #[test]
    fn test_late_subscriber_misses_earlier_events() {
        let bus = EventBus::new();
        bus.publish(restart(1000));

        let mut rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        assert!(matches!(rx.try_recv(), Err(broadcast::error::TryRecvError::Empty)));
    }

    #[test]
    fn test_slow_subscriber_lags_instead_of_blocking() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        for i in 0..(EVENT_BACKLOG as u64 + 10) {
            bus.publish(restart(i));
        }

        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Lagged(10))
        ));
        match rx.try_recv() {
            Ok(StreamEvent::CaptureRestartScheduled { retry_in_ms, .. }) => assert_eq!(retry_in_ms, 10),
            other => panic!("unexpected {:?}", other),
        }
    }
}
