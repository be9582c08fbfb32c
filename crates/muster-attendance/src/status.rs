//! Status/event channel between the recognition core and whatever presents it.
//!
//! The core never talks to a UI directly; it publishes [`StatusEvent`]s and
//! any number of subscribers render them.

use std::time::Duration;
use tokio::sync::broadcast;

const STATUS_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum StatusEvent {
    /// Routine progress, e.g. "Attendance stored for Asha".
    Info(String),
    /// A failure that was contained; the loop keeps running.
    Error(String),
    /// Unknown-face alert text; followed by `AlertCleared` after a fixed delay.
    Alert(String),
    AlertCleared,
    /// The recognition loop has exited and released the camera.
    Stopped,
}

/// Cloneable publisher handle.
#[derive(Clone)]
pub struct StatusBus {
    tx: broadcast::Sender<StatusEvent>,
}

impl Default for StatusBus {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(STATUS_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.tx.subscribe()
    }

    /// Publish to current subscribers. Having none is not an error.
    pub fn publish(&self, event: StatusEvent) {
        let _ = self.tx.send(event);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.publish(StatusEvent::Info(message.into()));
    }

    pub fn error(&self, message: impl Into<String>) {
        self.publish(StatusEvent::Error(message.into()));
    }

    /// Publish an alert and schedule its `AlertCleared` after `clear_after`,
    /// whatever else is published in between.
    pub fn alert_transient(&self, message: impl Into<String>, clear_after: Duration) {
        self.publish(StatusEvent::Alert(message.into()));
        let tx = self.tx.clone();
        let spawned = std::thread::Builder::new()
            .name("muster-status-clear".into())
            .spawn(move || {
                std::thread::sleep(clear_after);
                let _ = tx.send(StatusEvent::AlertCleared);
            });
        if let Err(e) = spawned {
            tracing::warn!(error = %e, "could not schedule alert clear");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_without_subscribers() {
        StatusBus::new().info("nobody listening");
    }

    #[test]
    fn test_subscriber_receives_in_order() {
        let bus = StatusBus::new();
        let mut rx = bus.subscribe();
        bus.info("a");
        bus.error("b");
        assert_eq!(rx.try_recv().unwrap(), StatusEvent::Info("a".into()));
        assert_eq!(rx.try_recv().unwrap(), StatusEvent::Error("b".into()));
    }

    #[test]
    fn test_alert_self_clears() {
        let bus = StatusBus::new();
        let mut rx = bus.subscribe();
        bus.alert_transient("Unknown person detected", Duration::from_millis(20));
        bus.info("later event");

        assert_eq!(rx.blocking_recv().unwrap(), StatusEvent::Alert("Unknown person detected".into()));
        assert_eq!(rx.blocking_recv().unwrap(), StatusEvent::Info("later event".into()));
        assert_eq!(rx.blocking_recv().unwrap(), StatusEvent::AlertCleared);
    }
}
