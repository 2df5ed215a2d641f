use tokio::sync::broadcast;

use super::traits::{AppEvent, EventBus, EventFilter};

const DEFAULT_CAPACITY: usize = 1024;

/// [`EventBus`] implementation backed by a `tokio::sync::broadcast` channel.
pub struct TokioBroadcastBus {
    sender: broadcast::Sender<AppEvent>,
}

impl TokioBroadcastBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }
}

impl Default for TokioBroadcastBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus for TokioBroadcastBus {
    fn publish(&self, event: AppEvent) -> Result<(), String> {
        self.sender
            .send(event)
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    fn subscribe(&self) -> broadcast::Receiver<AppEvent> {
        self.sender.subscribe()
    }

    fn subscribe_filtered(&self, _filter: EventFilter) -> broadcast::Receiver<AppEvent> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::traits::EventType;

    #[tokio::test]
    async fn publish_then_receive() {
        let bus = TokioBroadcastBus::new();
        let mut rx = bus.subscribe();

        bus.publish(AppEvent::HeartbeatTick {
            timestamp: "t0".into(),
        })
        .expect("publish failed");

        let received = rx.recv().await.expect("recv failed");
        assert!(matches!(received, AppEvent::HeartbeatTick { .. }));
    }

    #[tokio::test]
    async fn multiple_subscribers_all_receive() {
        let bus = TokioBroadcastBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(AppEvent::CronFired {
            job_id: "heartbeat".into(),
        })
        .unwrap();

        assert!(matches!(rx1.recv().await.unwrap(), AppEvent::CronFired { .. }));
        assert!(matches!(rx2.recv().await.unwrap(), AppEvent::CronFired { .. }));
    }

    #[tokio::test]
    async fn event_fields_round_trip() {
        let bus = TokioBroadcastBus::new();
        let mut rx = bus.subscribe();

        bus.publish(AppEvent::SafetyDenied {
            tool_name: "stop_vm".into(),
            reason: "protected vmid".into(),
        })
        .unwrap();

        match rx.recv().await.unwrap() {
            AppEvent::SafetyDenied { tool_name, reason } => {
                assert_eq!(tool_name, "stop_vm");
                assert_eq!(reason, "protected vmid");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn subscribe_filtered_returns_receiver() {
        let bus = TokioBroadcastBus::new();
        let filter = EventFilter::new(vec![EventType::HeartbeatTick]);
        let mut rx = bus.subscribe_filtered(filter.clone());

        bus.publish(AppEvent::HeartbeatTick {
            timestamp: "t0".into(),
        })
        .unwrap();
        let event = rx.recv().await.unwrap();
        assert!(filter.matches(&event));
    }

    #[tokio::test]
    async fn lagged_receiver_reports_error() {
        let bus = TokioBroadcastBus::with_capacity(1);
        let mut slow_rx = bus.subscribe();

        bus.publish(AppEvent::HeartbeatTick {
            timestamp: "t0".into(),
        })
        .unwrap();
        bus.publish(AppEvent::HeartbeatTick {
            timestamp: "t1".into(),
        })
        .unwrap();

        let result = slow_rx.recv().await;
        assert!(
            matches!(result, Err(broadcast::error::RecvError::Lagged(_))),
            "expected Lagged, got {result:?}"
        );
    }
}
