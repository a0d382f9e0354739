use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::ChangeNotice;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for change notices, per interviewer plus one tenant-wide
/// channel.
pub struct NotifyHub {
    channels: DashMap<String, broadcast::Sender<ChangeNotice>>,
    all: broadcast::Sender<ChangeNotice>,
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

    /// Subscribe to one interviewer's notices. Creates the channel if needed.
    pub fn subscribe(&self, interviewer: &str) -> broadcast::Receiver<ChangeNotice> {
        self.channels
            .entry(interviewer.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<ChangeNotice> {
        self.all.subscribe()
    }

    /// Publish a notice on `interviewer`'s channel and the tenant-wide one.
    /// No-op for channels nobody listens on.
    pub fn send(&self, interviewer: &str, notice: &ChangeNotice) {
        if let Some(sender) = self.channels.get(interviewer) {
            let _ = sender.send(notice.clone());
        }
        let _ = self.all.send(notice.clone());
    }

    /// Drop an interviewer's channel once its last listener is gone.
    pub fn remove_if_idle(&self, interviewer: &str) {
        self.channels
            .remove_if(interviewer, |_, sender| sender.receiver_count() == 0);
    }
}
