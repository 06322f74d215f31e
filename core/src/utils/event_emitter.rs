/// Event emitter for render layers watching the message window
use crate::viewport::UpdateKind;
use serde::Serialize;
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 256;

/// Notification published after every committed window change
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WindowEvent {
    /// The window changed; `kind` tells the view how to scroll
    Updated {
        conversation_id: i64,
        kind: UpdateKind,
        added: usize,
        /// Ids that were not in the window before this update, ascending
        ids: Vec<i64>,
        len: usize,
    },
    /// Phase 1 failed; the view should offer a retry
    LoadFailed { conversation_id: i64, error: String },
}

pub struct EventEmitter {
    tx: broadcast::Sender<WindowEvent>,
}

impl EventEmitter {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(DEFAULT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WindowEvent> {
        self.tx.subscribe()
    }

    /// Fire and forget: having no subscriber is not an error
    pub fn emit(&self, event: WindowEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for EventEmitter {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}
