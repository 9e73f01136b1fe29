use tokio::sync::broadcast;

use crate::dispatch::models::{MapCodeStatistics, MissionQueueItem, QueueEvent};

/// Fans queue events out to operator clients. Sends are fire-and-forget; a
/// missing or slow subscriber must never block or fail the dispatcher.
#[derive(Debug, Clone)]
pub struct QueueNotifier {
    sender: broadcast::Sender<QueueEvent>,
}

impl QueueNotifier {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self { sender }
    }

    pub fn queue_item_changed(&self, item: &MissionQueueItem) {
        let _ = self.sender.send(QueueEvent::QueueItemChanged { item: item.clone() });
    }

    pub fn map_statistics(&self, stats: &MapCodeStatistics) {
        let _ = self.sender.send(QueueEvent::MapStatistics { stats: stats.clone() });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.sender.subscribe()
    }
}

impl Default for QueueNotifier {
    fn default() -> Self {
        Self::new()
    }
}
