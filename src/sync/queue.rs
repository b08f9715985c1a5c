use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use super::action::{ActionStatus, Attachment, ChatMessage, QueuedAction};
use super::events::{EventBus, SyncEvent};
use super::transport::MessageSender;
use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::connectivity::Connectivity;
use crate::error::{Error, Result, StoreError};
use crate::settings::{self, Setting};
use crate::store::{IndexQuery, Store, ACTION_QUEUE, CACHE_METADATA, PREFERENCES};

const LAST_RUN_PREF: &str = "sync.lastRun";
/// Store-wide claim on the queue, shared by every process using the store.
const LEASE_META: &str = "sync.lease";

static NEXT_OWNER: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStats {
  pub pending: usize,
  pub failed: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncSummary {
  pub sent: usize,
  pub failed: usize,
  pub remaining: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
  Completed(SyncSummary),
  /// Another sweep, in this process or another one sharing the store, is
  /// running; nothing was sent by this call
  AlreadyRunning,
  Offline,
}

/// Summary of the most recent sweep, kept in preferences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastRun {
  pub finished_at: i64,
  pub sent: usize,
  pub failed: usize,
  pub remaining: usize,
}

/// Outcome of [`SyncQueue::retry_failed_actions`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RetryReport {
  pub reset: usize,
  /// Failed actions left as they were because their attachment no longer
  /// validates
  pub rejected: usize,
}

/// Durable outbox of chat messages, replayed in creation order.
pub struct SyncQueue<S: MessageSender> {
  inner: Arc<Inner<S>>,
}

impl<S: MessageSender> Clone for SyncQueue<S> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

struct Inner<S> {
  store: Arc<Store>,
  sender: S,
  connectivity: Connectivity,
  clock: Arc<dyn Clock>,
  events: EventBus,
  config: SyncConfig,
  syncing: AtomicBool,
  /// Identifies this handle's lease
  owner: String,
}

impl<S> Inner<S> {
  /// Take or renew the store-wide lease. Returns false while another
  /// handle holds a live one.
  fn claim_lease(&self) -> Result<bool, StoreError> {
    let now = self.clock.now_millis();
    self.store.run_in_transaction(&[CACHE_METADATA], |tx| {
      let current: Option<Setting> = tx.get(CACHE_METADATA, LEASE_META)?;
      let held_elsewhere = current.is_some_and(|lease| {
        !lease.is_expired(now) && lease.value.as_str() != Some(self.owner.as_str())
      });
      if held_elsewhere {
        return Ok(false);
      }
      let lease = Setting::new(LEASE_META, &self.owner, now)?
        .with_ttl_millis(self.config.lease_millis());
      settings::write_in(tx, CACHE_METADATA, &lease)?;
      Ok(true)
    })
  }

  fn release_lease(&self) -> Result<(), StoreError> {
    self.store.run_in_transaction(&[CACHE_METADATA], |tx| {
      let current: Option<Setting> = tx.get(CACHE_METADATA, LEASE_META)?;
      if current.is_some_and(|lease| lease.value.as_str() == Some(self.owner.as_str())) {
        tx.delete(CACHE_METADATA, LEASE_META)?;
      }
      Ok(())
    })
  }
}

/// Releases the lease and clears the in-progress flag on every exit path,
/// panics included.
struct SyncGuard<'a, S> {
  inner: &'a Inner<S>,
}

impl<S> Drop for SyncGuard<'_, S> {
  fn drop(&mut self) {
    if let Err(e) = self.inner.release_lease() {
      tracing::warn!(error = %e, "Failed to release sync lease");
    }
    self.inner.syncing.store(false, Ordering::Release);
  }
}

impl<S: MessageSender + 'static> SyncQueue<S> {
  pub fn new(
    store: Arc<Store>,
    sender: S,
    connectivity: Connectivity,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
  ) -> Self {
    Self {
      inner: Arc::new(Inner {
        store,
        sender,
        connectivity,
        clock,
        events: EventBus::default(),
        config,
        syncing: AtomicBool::new(false),
        owner: format!(
          "{}:{}",
          std::process::id(),
          NEXT_OWNER.fetch_add(1, Ordering::Relaxed)
        ),
      }),
    }
  }

  pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
    self.inner.events.subscribe()
  }

  /// Whether a sweep is running on this handle. Sweeps in other processes
  /// are not reported.
  pub fn is_syncing(&self) -> bool {
    self.inner.syncing.load(Ordering::Acquire)
  }

  /// Persist a new pending action. When online a sweep is started in the
  /// background; the call does not wait for it.
  pub async fn enqueue(&self, content: ChatMessage, attachment: Option<Attachment>) -> Result<i64> {
    if let Some(attachment) = &attachment {
      attachment.validate()?;
    }

    let action = QueuedAction::new(content, attachment, self.inner.clock.now_millis());
    let id = self
      .inner
      .store
      .put(ACTION_QUEUE, &action)?
      .as_int()
      .ok_or_else(|| StoreError::MissingKey(ACTION_QUEUE.to_string()))?;

    tracing::info!(id, "Queued message");
    self.emit_queue_updated();
    self.trigger();
    Ok(id)
  }

  /// Start a background sweep if online.
  fn trigger(&self) {
    if !self.inner.connectivity.is_online() {
      return;
    }
    let queue = self.clone();
    tokio::spawn(async move {
      if let Err(e) = queue.sync().await {
        tracing::warn!(error = %e, "Background sync failed");
      }
    });
  }

  /// Send every pending action once, oldest first. Actions enqueued while
  /// the sweep runs are picked up before it returns.
  pub async fn sync(&self) -> Result<SyncOutcome> {
    if !self.inner.connectivity.is_online() {
      tracing::debug!("Offline, skipping sync");
      return Ok(SyncOutcome::Offline);
    }
    if self
      .inner
      .syncing
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .is_err()
    {
      tracing::debug!("Sync already in progress");
      return Ok(SyncOutcome::AlreadyRunning);
    }
    let _guard = SyncGuard { inner: &*self.inner };
    if !self.inner.claim_lease()? {
      tracing::debug!("Another process is syncing this store");
      return Ok(SyncOutcome::AlreadyRunning);
    }

    match self.sweep().await {
      Ok(summary) => {
        self.record_last_run(summary);
        self.inner.events.emit(SyncEvent::SyncCompleted {
          sent: summary.sent,
          failed: summary.failed,
          remaining: summary.remaining,
        });
        tracing::info!(
          sent = summary.sent,
          failed = summary.failed,
          remaining = summary.remaining,
          "Sync finished"
        );
        Ok(SyncOutcome::Completed(summary))
      }
      Err(e) => {
        tracing::error!(error = %e, "Sync aborted");
        self.inner.events.emit(SyncEvent::SyncFailed {
          error: e.to_string(),
        });
        Err(e)
      }
    }
  }

  async fn sweep(&self) -> Result<SyncSummary> {
    let mut summary = SyncSummary::default();
    let mut seen = HashSet::new();
    let mut attempts = 0usize;
    let mut started = false;

    'sweep: loop {
      let batch: Vec<QueuedAction> = self
        .pending_actions()?
        .into_iter()
        .filter(|action| action.id.is_some_and(|id| !seen.contains(&id)))
        .collect();

      if !started {
        self.inner.events.emit(SyncEvent::SyncStarted {
          pending: batch.len(),
        });
        started = true;
      }
      if batch.is_empty() {
        break;
      }

      for action in batch {
        let Some(id) = action.id else { continue };
        seen.insert(id);

        if attempts > 0 && !self.inner.config.send_delay().is_zero() {
          tokio::time::sleep(self.inner.config.send_delay()).await;
        }

        // The action may have been discarded while we were sending others.
        let current: Option<QueuedAction> = self.inner.store.get(ACTION_QUEUE, id)?;
        let Some(mut action) = current.filter(|a| a.status == ActionStatus::Pending) else {
          continue;
        };

        if !self.inner.claim_lease()? {
          tracing::warn!("Sync lease taken over by another process, stopping sweep");
          break 'sweep;
        }

        attempts += 1;
        match self
          .inner
          .sender
          .send(&action.content, action.attachment.as_ref())
          .await
        {
          Ok(()) => {
            self.inner.store.delete(ACTION_QUEUE, id)?;
            summary.sent += 1;
            tracing::info!(id, "Message sent");
            self.inner.events.emit(SyncEvent::MessageSent { id });
          }
          Err(e) => {
            let terminal = action.record_failure(e.to_string(), self.inner.config.max_retries);
            self.inner.store.put(ACTION_QUEUE, &action)?;
            summary.failed += 1;
            if terminal {
              let err = Error::MaxRetriesExceeded {
                id,
                attempts: action.retry_count,
              };
              tracing::warn!(error = %err, last_error = %e, "Giving up on message");
            } else {
              tracing::info!(id, retry_count = action.retry_count, error = %e, "Send failed");
            }
            self.inner.events.emit(SyncEvent::MessageFailed {
              id,
              error: e.to_string(),
              retry_count: action.retry_count,
              terminal,
            });
          }
        }
        self.emit_queue_updated();
      }
    }

    summary.remaining = self.stats()?.pending;
    Ok(summary)
  }

  fn record_last_run(&self, summary: SyncSummary) {
    let now = self.inner.clock.now_millis();
    let last_run = LastRun {
      finished_at: now,
      sent: summary.sent,
      failed: summary.failed,
      remaining: summary.remaining,
    };
    let written = Setting::new(LAST_RUN_PREF, last_run, now)
      .and_then(|setting| settings::write(&self.inner.store, PREFERENCES, &setting));
    if let Err(e) = written {
      tracing::warn!(error = %e, "Failed to record sync summary");
    }
  }

  pub fn last_run(&self) -> Result<Option<LastRun>, StoreError> {
    settings::read(
      &self.inner.store,
      PREFERENCES,
      LAST_RUN_PREF,
      self.inner.clock.now_millis(),
    )
  }

  /// Reset every failed action to pending with a fresh retry budget, then
  /// sweep in the background if online. Actions whose attachment no longer
  /// validates stay failed.
  pub async fn retry_failed_actions(&self) -> Result<RetryReport> {
    let report = self.inner.store.run_in_transaction(&[ACTION_QUEUE], |tx| {
      let mut report = RetryReport::default();
      let failed: Vec<QueuedAction> =
        tx.query_by_index(ACTION_QUEUE, "status", status_query(ActionStatus::Failed))?;
      for mut action in failed {
        if let Some(Err(e)) = action.attachment.as_ref().map(Attachment::validate) {
          action.last_error = Some(format!("attachment no longer valid: {}", e));
          report.rejected += 1;
        } else {
          action.reset();
          report.reset += 1;
        }
        tx.put(ACTION_QUEUE, &action)?;
      }
      Ok::<_, StoreError>(report)
    })?;

    tracing::info!(reset = report.reset, rejected = report.rejected, "Retrying failed messages");
    if report.reset > 0 {
      self.emit_queue_updated();
      self.trigger();
    }
    Ok(report)
  }

  /// Discard an action. Returns whether it existed.
  pub fn delete_action(&self, id: i64) -> Result<bool> {
    let removed = self.inner.store.delete(ACTION_QUEUE, id)?;
    if removed {
      tracing::info!(id, "Discarded message");
      self.emit_queue_updated();
    }
    Ok(removed)
  }

  /// Pending actions in creation order.
  pub fn pending_actions(&self) -> Result<Vec<QueuedAction>, StoreError> {
    self.actions_with(ActionStatus::Pending)
  }

  pub fn failed_actions(&self) -> Result<Vec<QueuedAction>, StoreError> {
    self.actions_with(ActionStatus::Failed)
  }

  fn actions_with(&self, status: ActionStatus) -> Result<Vec<QueuedAction>, StoreError> {
    let actions: Vec<QueuedAction> = self
      .inner
      .store
      .query_by_index(ACTION_QUEUE, "createdAt", IndexQuery::All)?;
    Ok(actions.into_iter().filter(|a| a.status == status).collect())
  }

  pub fn stats(&self) -> Result<QueueStats, StoreError> {
    let count = |status| {
      self
        .inner
        .store
        .keys_by_index(ACTION_QUEUE, "status", status_query(status))
        .map(|keys| keys.len())
    };
    Ok(QueueStats {
      pending: count(ActionStatus::Pending)?,
      failed: count(ActionStatus::Failed)?,
    })
  }

  fn emit_queue_updated(&self) {
    match self.stats() {
      Ok(stats) => self.inner.events.emit(SyncEvent::QueueUpdated {
        pending: stats.pending,
        failed: stats.failed,
      }),
      Err(e) => tracing::warn!(error = %e, "Failed to count queued messages"),
    }
  }
}

fn status_query(status: ActionStatus) -> IndexQuery {
  IndexQuery::eq(status.as_str())
}
