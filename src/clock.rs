//! Time source used for TTLs and queue ordering.

use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Source of the current time.
pub trait Clock: Send + Sync {
  fn now(&self) -> DateTime<Utc>;

  /// Current time as Unix epoch milliseconds, the unit stored in records.
  fn now_millis(&self) -> i64 {
    self.now().timestamp_millis()
  }
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> {
    Utc::now()
  }
}

/// Manually driven clock. Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
  millis: Arc<AtomicI64>,
}

impl ManualClock {
  pub fn new(start: DateTime<Utc>) -> Self {
    Self {
      millis: Arc::new(AtomicI64::new(start.timestamp_millis())),
    }
  }

  pub fn advance(&self, by: Duration) {
    self
      .millis
      .fetch_add(by.num_milliseconds(), Ordering::SeqCst);
  }
}

impl Clock for ManualClock {
  fn now(&self) -> DateTime<Utc> {
    let millis = self.millis.load(Ordering::SeqCst);
    Utc
      .timestamp_millis_opt(millis)
      .single()
      .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
  }
}

/// Convert stored epoch milliseconds back into a timestamp.
pub fn from_millis(millis: i64) -> Option<DateTime<Utc>> {
  Utc.timestamp_millis_opt(millis).single()
}
