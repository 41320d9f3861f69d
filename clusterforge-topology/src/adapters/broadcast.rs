use tokio::sync::broadcast;

use crate::ports::{ProgressNotifier, TopologyEvent};

/// Publishes topology events to any number of subscribers. Events are
/// dropped when nobody listens.
pub struct BroadcastNotifier {
    sender: broadcast::Sender<TopologyEvent>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TopologyEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl ProgressNotifier for BroadcastNotifier {
    fn notify(&self, event: TopologyEvent) {
        // Err only means there are no receivers right now
        let _ = self.sender.send(event);
    }
}
