//! Broadcast event bus for distributing `SchedulerEvent` to multiple subscribers.
//!
//! Built on `tokio::sync::broadcast`. Publishing with no active subscribers
//! is a no-op; a subscriber that falls behind sees `Lagged` and skips ahead.

use batchloom_types::event::SchedulerEvent;
use tokio::sync::broadcast;

/// Multi-consumer bus for task and job status changes.
///
/// Cloning the bus clones the sender, allowing multiple producers.
pub struct EventBus {
    sender: broadcast::Sender<SchedulerEvent>,
}

impl EventBus {
    /// Create a new event bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Create a new subscriber that will receive all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to all current subscribers.
    pub fn publish(&self, event: SchedulerEvent) {
        let _ = self.sender.send(event);
    }

    pub fn publish_all(&self, events: impl IntoIterator<Item = SchedulerEvent>) {
        for event in events {
            self.publish(event);
        }
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchloom_types::ids::JobId;
    use batchloom_types::job::JobStatus;
    use chrono::Utc;

    fn job_event(status: JobStatus) -> SchedulerEvent {
        SchedulerEvent::JobStatusChanged {
            job_id: JobId::new(7, "nightly"),
            status,
            at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn publish_and_subscribe_delivers_event() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish(job_event(JobStatus::Running));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.job(), 7);
        assert!(matches!(
            received,
            SchedulerEvent::JobStatusChanged {
                status: JobStatus::Running,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn multiple_subscribers_each_receive_event() {
        let bus = EventBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish_all([job_event(JobStatus::Running), job_event(JobStatus::Finished)]);

        for rx in [&mut rx1, &mut rx2] {
            assert!(matches!(
                rx.recv().await.unwrap(),
                SchedulerEvent::JobStatusChanged { status: JobStatus::Running, .. }
            ));
            assert!(matches!(
                rx.recv().await.unwrap(),
                SchedulerEvent::JobStatusChanged { status: JobStatus::Finished, .. }
            ));
        }
    }

    #[test]
    fn publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::new(16);
        bus.publish(job_event(JobStatus::Pending));
        assert_eq!(bus.receiver_count(), 0);
    }

    #[test]
    fn lagged_receiver_skips_ahead() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();

        for _ in 0..10 {
            bus.publish(job_event(JobStatus::Running));
        }

        match rx.try_recv() {
            Err(broadcast::error::TryRecvError::Lagged(missed)) => assert_eq!(missed, 6),
            other => panic!("expected lag, got {other:?}"),
        }
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn clone_shares_channel() {
        let bus = EventBus::new(16);
        let bus2 = bus.clone();
        let mut rx = bus.subscribe();

        bus2.publish(job_event(JobStatus::Killed));

        assert!(rx.try_recv().is_ok());
        assert!(format!("{bus:?}").contains("receiver_count"));
    }
}
