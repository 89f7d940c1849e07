use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::ChangeEvent;

const CHANNEL_CAPACITY: usize = 256;

/// Sink for committed appointment mutations. Implementations relay events to
/// an external transport; delivery is advisory and may repeat.
pub trait ChangeNotifier: Send + Sync {
    fn publish(&self, event: &ChangeEvent);
}

/// Broadcast hub: one channel per professional plus a firehose of every event.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<ChangeEvent>>,
    all: broadcast::Sender<ChangeEvent>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            all: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    /// Subscribe to changes on one professional's calendar. Creates the channel if needed.
    pub fn subscribe(&self, professional_id: Ulid) -> broadcast::Receiver<ChangeEvent> {
        let sender = self
            .channels
            .entry(professional_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Subscribe to every change.
    pub fn subscribe_all(&self) -> broadcast::Receiver<ChangeEvent> {
        self.all.subscribe()
    }

    /// Drop channels nobody listens to anymore.
    pub fn prune(&self) {
        self.channels.retain(|_, sender| sender.receiver_count() > 0);
    }
}

impl ChangeNotifier for NotifyHub {
    /// No-op for channels without listeners.
    fn publish(&self, event: &ChangeEvent) {
        if let Some(sender) = self.channels.get(&event.professional_id) {
            let _ = sender.send(event.clone());
        }
        let _ = self.all.send(event.clone());
    }
}
