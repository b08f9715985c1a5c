//! Background task driving sync sweeps.
//!
//! A sweep starts when connectivity comes back, and on every tick of the
//! periodic timer while online with pending work and no sweep active.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::queue::SyncQueue;
use super::transport::MessageSender;
use crate::cache::Fetch;
use crate::connectivity::Connectivity;
use crate::knowledge::KnowledgeCache;

pub struct Scheduler<S: MessageSender, F: Fetch> {
  queue: SyncQueue<S>,
  knowledge: Option<Arc<KnowledgeCache<F>>>,
  connectivity: Connectivity,
  interval: Duration,
}

impl<S: MessageSender + 'static, F: Fetch + 'static> Scheduler<S, F> {
  pub fn new(queue: SyncQueue<S>, connectivity: Connectivity, interval: Duration) -> Self {
    Self {
      queue,
      knowledge: None,
      connectivity,
      interval,
    }
  }

  /// Also refresh the knowledge cache, when due, after reconnecting.
  pub fn with_knowledge(mut self, knowledge: Arc<KnowledgeCache<F>>) -> Self {
    self.knowledge = Some(knowledge);
    self
  }

  pub fn spawn(self) -> JoinHandle<()> {
    tokio::spawn(self.run())
  }

  async fn run(self) {
    let mut online_rx = self.connectivity.subscribe();
    let mut was_online = *online_rx.borrow_and_update();

    let start = tokio::time::Instant::now() + self.interval;
    let mut ticker = tokio::time::interval_at(start, self.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::info!(interval_secs = self.interval.as_secs(), "Sync scheduler started");

    loop {
      tokio::select! {
        _ = ticker.tick() => {
          if self.connectivity.is_online() && !self.queue.is_syncing() && self.has_pending() {
            tracing::debug!("Periodic sync");
            self.sync().await;
          }
        }
        changed = online_rx.changed() => {
          if changed.is_err() {
            break;
          }
          let online = *online_rx.borrow_and_update();
          if online && !was_online {
            tracing::info!("Connectivity restored, syncing");
            self.sync().await;
            self.refresh_knowledge().await;
          }
          was_online = online;
        }
      }
    }
  }

  fn has_pending(&self) -> bool {
    match self.queue.stats() {
      Ok(stats) => stats.pending > 0,
      Err(e) => {
        tracing::warn!(error = %e, "Failed to read queue depth");
        false
      }
    }
  }

  async fn sync(&self) {
    if let Err(e) = self.queue.sync().await {
      tracing::warn!(error = %e, "Scheduled sync failed");
    }
  }

  async fn refresh_knowledge(&self) {
    let Some(knowledge) = &self.knowledge else {
      return;
    };
    match knowledge.refresh_if_due().await {
      Ok(Some(report)) => tracing::info!(
        refreshed = report.refreshed.len(),
        failed = report.failed.len(),
        "Knowledge cache refreshed after reconnect"
      ),
      Ok(None) => {}
      Err(e) => tracing::warn!(error = %e, "Knowledge refresh failed"),
    }
  }
}
