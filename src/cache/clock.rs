use chrono::Utc;
use std::sync::atomic::{AtomicI64, Ordering};

/// Source of wall-clock time in Unix seconds.
///
/// Staleness is judged against wall-clock time, so a clock that moves
/// backwards can make entries look stale early but never fresh for longer
/// than their TTL plus the skew.
pub trait Clock: Send + Sync {
  fn now(&self) -> i64;
}

/// The system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> i64 {
    Utc::now().timestamp()
  }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock(AtomicI64);

impl ManualClock {
  pub fn new(now: i64) -> Self {
    Self(AtomicI64::new(now))
  }

  pub fn set(&self, now: i64) {
    self.0.store(now, Ordering::SeqCst);
  }

  pub fn advance(&self, seconds: i64) {
    self.0.fetch_add(seconds, Ordering::SeqCst);
  }
}

impl Clock for ManualClock {
  fn now(&self) -> i64 {
    self.0.load(Ordering::SeqCst)
  }
}
