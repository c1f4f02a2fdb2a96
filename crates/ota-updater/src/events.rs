//! Change notifications for observers.
//!
//! Events carry only the `download_id`; observers re-read the record through
//! the controller. A lagging observer loses events, never the state, so it
//! should refresh everything when it sees `RecvError::Lagged`.

use tokio::sync::broadcast;
use tracing::trace;

/// A change to one update record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateEvent {
    /// Status, persistent status or metadata changed
    StatusChanged(String),
    /// Download byte count or ETA changed
    DownloadProgress(String),
    /// Install percent, indeterminate or finalizing flag changed
    InstallProgress(String),
    /// The record is gone from the store
    RecordRemoved(String),
}

impl UpdateEvent {
    pub fn download_id(&self) -> &str {
        match self {
            UpdateEvent::StatusChanged(id)
            | UpdateEvent::DownloadProgress(id)
            | UpdateEvent::InstallProgress(id)
            | UpdateEvent::RecordRemoved(id) => id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            UpdateEvent::StatusChanged(_) => "STATUS_CHANGED",
            UpdateEvent::DownloadProgress(_) => "DOWNLOAD_PROGRESS",
            UpdateEvent::InstallProgress(_) => "INSTALL_PROGRESS",
            UpdateEvent::RecordRemoved(_) => "RECORD_REMOVED",
        }
    }
}

/// Fan-out of [`UpdateEvent`]s to any number of subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<UpdateEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UpdateEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: UpdateEvent) {
        trace!(kind = event.kind(), download_id = %event.download_id(), "Publishing event");
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_in_order() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        bus.publish(UpdateEvent::StatusChanged("a".into()));
        bus.publish(UpdateEvent::DownloadProgress("a".into()));

        assert_eq!(rx.recv().await.unwrap(), UpdateEvent::StatusChanged("a".into()));
        let next = rx.recv().await.unwrap();
        assert_eq!(next.kind(), "DOWNLOAD_PROGRESS");
        assert_eq!(next.download_id(), "a");
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new(1);
        bus.publish(UpdateEvent::RecordRemoved("gone".into()));
    }

    #[tokio::test]
    async fn test_lagging_subscriber_is_told() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for _ in 0..5 {
            bus.publish(UpdateEvent::InstallProgress("a".into()));
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
    }
}
