// Engine notifications
// Observers are called synchronously, after the state lock is released

use serde::Serialize;
use tokio::sync::broadcast;

use crate::auth::{Setting, SettingStatus};

/// A state change the UI may want to reflect
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    TokenChanged {
        token: Option<String>,
        set_manually: bool,
    },
    HeaderChanged {
        header: Option<String>,
    },
    ListeningChanged {
        listening: bool,
    },
    AuthorizationUrlChanged {
        url: String,
    },
    SettingStatusChanged {
        setting: Setting,
        status: SettingStatus,
    },
    RefreshScheduled {
        stamp: u64,
    },
}

/// Subscriber to engine state changes
pub trait EngineObserver: Send + Sync {
    fn on_event(&self, event: &EngineEvent);
}

/// Fans events out to any number of async receivers
pub struct BroadcastObserver {
    sender: broadcast::Sender<EngineEvent>,
}

impl BroadcastObserver {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }
}

impl EngineObserver for BroadcastObserver {
    fn on_event(&self, event: &EngineEvent) {
        // no receivers is fine
        let _ = self.sender.send(event.clone());
    }
}
