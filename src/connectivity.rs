//! Online/offline signal shared by the sync queue and the knowledge cache.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use url::Url;

/// Handle to the connectivity state. Clones observe the same state.
#[derive(Debug, Clone)]
pub struct Connectivity {
  tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
  pub fn new(online: bool) -> Self {
    let (tx, _rx) = watch::channel(online);
    Self { tx: Arc::new(tx) }
  }

  pub fn is_online(&self) -> bool {
    *self.tx.borrow()
  }

  /// Record the current state. Returns true when it changed.
  pub fn set_online(&self, online: bool) -> bool {
    let changed = self.tx.send_if_modified(|current| {
      if *current == online {
        false
      } else {
        *current = online;
        true
      }
    });
    if changed {
      tracing::info!(online, "Connectivity changed");
    }
    changed
  }

  /// Receiver notified on every state change.
  pub fn subscribe(&self) -> watch::Receiver<bool> {
    self.tx.subscribe()
  }

  /// Probe `health_url` once and record the outcome. Any response below
  /// 500 counts as reachable.
  pub async fn check(&self, client: &reqwest::Client, health_url: &Url) -> bool {
    let online = match client.get(health_url.clone()).send().await {
      Ok(response) => !response.status().is_server_error(),
      Err(e) => {
        tracing::debug!(error = %e, "Health probe failed");
        false
      }
    };
    self.set_online(online);
    online
  }

  /// Run [`Connectivity::check`] every `interval`.
  pub fn spawn_probe(
    &self,
    client: reqwest::Client,
    health_url: Url,
    interval: Duration,
  ) -> JoinHandle<()> {
    let connectivity = self.clone();
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      loop {
        ticker.tick().await;
        connectivity.check(&client, &health_url).await;
      }
    })
  }
}

impl Default for Connectivity {
  fn default() -> Self {
    Self::new(true)
  }
}
