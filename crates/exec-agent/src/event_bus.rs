use exec_protocol::ProcessEvent;
use tokio::sync::broadcast;

pub const DEFAULT_EVENT_BUFFER: usize = 1024;

/// In-memory fan-out of process events.
///
/// Delivery is best-effort: events published with no subscriber are dropped,
/// and a subscriber that falls more than `capacity` events behind receives
/// `RecvError::Lagged`. Nothing is replayed to late subscribers.
#[derive(Clone)]
pub struct EventBus {
    broadcaster: broadcast::Sender<ProcessEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (broadcaster, _) = broadcast::channel(capacity.max(1));
        Self { broadcaster }
    }

    /// Publish an event, returning the number of subscribers it reached.
    pub fn publish(&self, event: ProcessEvent) -> usize {
        let event_type = event.event_type.clone();
        let pid = event.pid();
        match self.broadcaster.send(event) {
            Ok(receivers) => {
                tracing::debug!(event_type = %event_type, pid = pid, receivers = receivers, "published event");
                receivers
            }
            Err(_) => {
                tracing::trace!(event_type = %event_type, pid = pid, "no subscribers, event dropped");
                0
            }
        }
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ProcessEvent> {
        self.broadcaster.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use exec_protocol::ProcessEventFactory;
    use tokio::sync::broadcast::error::{RecvError, TryRecvError};

    #[tokio::test]
    async fn test_publish_fans_out() {
        let bus = EventBus::default();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        let event = ProcessEventFactory::new().stdout_event(1, "hi\n", Utc::now());
        assert_eq!(bus.publish(event.clone()), 2);

        assert_eq!(first.recv().await.unwrap(), event);
        assert_eq!(second.recv().await.unwrap(), event);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new(4);
        let event = ProcessEventFactory::new().stdout_event(1, "lost", Utc::now());
        assert_eq!(bus.publish(event), 0);
    }

    #[test]
    fn test_late_subscriber_sees_no_history() {
        let bus = EventBus::new(4);
        let _early = bus.subscribe();
        bus.publish(ProcessEventFactory::new().stdout_event(1, "before", Utc::now()));

        let mut late = bus.subscribe();
        assert!(matches!(late.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_slow_subscriber_lags() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        let factory = ProcessEventFactory::new();
        for i in 0..5 {
            bus.publish(factory.stdout_event(1, format!("line {}\n", i), Utc::now()));
        }

        assert!(matches!(rx.recv().await, Err(RecvError::Lagged(3))));
        let next = rx.recv().await.unwrap();
        assert_eq!(next.pid(), 1);
    }
}
