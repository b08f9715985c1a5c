use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Notification emitted by the sync queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SyncEvent {
  QueueUpdated {
    pending: usize,
    failed: usize,
  },
  SyncStarted {
    pending: usize,
  },
  SyncCompleted {
    sent: usize,
    failed: usize,
    remaining: usize,
  },
  /// The sweep aborted before visiting every pending action
  SyncFailed {
    error: String,
  },
  MessageSent {
    id: i64,
  },
  #[serde(rename_all = "camelCase")]
  MessageFailed {
    id: i64,
    error: String,
    retry_count: u32,
    /// The action reached its retry budget and is now `failed`
    terminal: bool,
  },
}

/// Fan-out of [`SyncEvent`]s. Emitting with no subscribers is not an error.
#[derive(Debug, Clone)]
pub struct EventBus {
  sender: broadcast::Sender<SyncEvent>,
}

impl EventBus {
  pub fn new(capacity: usize) -> Self {
    let (sender, _) = broadcast::channel(capacity);
    Self { sender }
  }

  pub fn emit(&self, event: SyncEvent) {
    tracing::trace!(?event, "Sync event");
    let _ = self.sender.send(event);
  }

  pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
    self.sender.subscribe()
  }
}

impl Default for EventBus {
  fn default() -> Self {
    Self::new(256)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_events_serialize_kebab_case() {
    let event = SyncEvent::MessageFailed {
      id: 4,
      error: "server rejected request (500): boom".to_string(),
      retry_count: 3,
      terminal: true,
    };
    assert_eq!(
      serde_json::to_value(&event).unwrap(),
      json!({
        "type": "message-failed",
        "id": 4,
        "error": "server rejected request (500): boom",
        "retryCount": 3,
        "terminal": true
      })
    );

    let started = serde_json::to_value(SyncEvent::SyncStarted { pending: 2 }).unwrap();
    assert_eq!(started, json!({"type": "sync-started", "pending": 2}));
  }

  #[tokio::test]
  async fn test_bus_delivers_to_every_subscriber() {
    let bus = EventBus::default();
    bus.emit(SyncEvent::MessageSent { id: 0 });

    let mut first = bus.subscribe();
    let mut second = bus.subscribe();
    bus.emit(SyncEvent::MessageSent { id: 1 });

    assert_eq!(first.recv().await.unwrap(), SyncEvent::MessageSent { id: 1 });
    assert_eq!(second.recv().await.unwrap(), SyncEvent::MessageSent { id: 1 });
  }
}
