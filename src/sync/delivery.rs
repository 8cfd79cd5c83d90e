//! Two-phase delivery: an optional stale snapshot, then exactly one fresh
//! snapshot or error.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{SyncError, SyncResult};
use crate::repository::DomainObject;

/// Objects delivered for one request.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
  pub key: String,
  /// Sorted objects; at most one for single-object fetches
  pub objects: Vec<DomainObject>,
  /// Served from the ledger while a refresh is in flight
  pub stale: bool,
  /// The server reported more items after these
  pub has_more: bool,
}

impl Snapshot {
  /// The object of a single-object fetch.
  pub fn object(&self) -> Option<&DomainObject> {
    self.objects.first()
  }

  pub fn len(&self) -> usize {
    self.objects.len()
  }

  pub fn is_empty(&self) -> bool {
    self.objects.is_empty()
  }
}

/// One message to a subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
  /// Cached data; a fresh delivery or an error follows
  Stale(Snapshot),
  /// Final data
  Fresh(Snapshot),
  /// Final failure
  Failed(SyncError),
}

impl Delivery {
  /// Whether nothing follows this delivery.
  pub fn is_final(&self) -> bool {
    !matches!(self, Delivery::Stale(_))
  }
}

pub(crate) type DeliverySender = mpsc::UnboundedSender<Delivery>;

/// Receiving end of a fetch.
///
/// Dropping it (or calling [`Subscription::cancel`]) detaches from the
/// request without aborting the network call other subscribers share.
#[derive(Debug)]
pub struct Subscription {
  receiver: mpsc::UnboundedReceiver<Delivery>,
  finished: bool,
}

impl Subscription {
  pub(crate) fn channel() -> (DeliverySender, Self) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
      tx,
      Self {
        receiver: rx,
        finished: false,
      },
    )
  }

  /// Wait for the next delivery. Returns `None` after the final one.
  pub async fn next(&mut self) -> Option<Delivery> {
    if self.finished {
      return None;
    }

    match self.receiver.recv().await {
      Some(delivery) => {
        self.finished = delivery.is_final();
        Some(delivery)
      }
      None => {
        // Sender dropped without a final delivery
        self.finished = true;
        Some(Delivery::Failed(SyncError::Transport(
          "request was cancelled".to_string(),
        )))
      }
    }
  }

  /// Non-blocking variant of [`Subscription::next`], for event loops that
  /// poll on each tick.
  pub fn try_next(&mut self) -> Option<Delivery> {
    if self.finished {
      return None;
    }
    match self.receiver.try_recv() {
      Ok(delivery) => {
        self.finished = delivery.is_final();
        Some(delivery)
      }
      Err(mpsc::error::TryRecvError::Empty) => None,
      Err(mpsc::error::TryRecvError::Disconnected) => {
        self.finished = true;
        Some(Delivery::Failed(SyncError::Transport(
          "request was cancelled".to_string(),
        )))
      }
    }
  }

  /// Skip any stale delivery and wait for the final result.
  pub async fn fresh(mut self) -> SyncResult<Snapshot> {
    loop {
      match self.next().await {
        Some(Delivery::Stale(_)) => continue,
        Some(Delivery::Fresh(snapshot)) => return Ok(snapshot),
        Some(Delivery::Failed(err)) => return Err(err),
        None => {
          return Err(SyncError::Transport(
            "subscription already finished".to_string(),
          ))
        }
      }
    }
  }

  /// Detach; no further deliveries arrive.
  pub fn cancel(mut self) {
    self.receiver.close();
  }
}

/// Callback-style receiver of deliveries.
pub trait Subscriber: Send + Sync + 'static {
  /// Cached data is available; `on_fresh` or `on_error` follows.
  fn on_stale(&self, _snapshot: &Snapshot) {}

  fn on_fresh(&self, snapshot: &Snapshot);

  fn on_error(&self, error: &SyncError);
}

/// Handle to a callback subscriber driven by a background task.
#[derive(Debug)]
pub struct SubscriberHandle {
  task: JoinHandle<()>,
}

impl SubscriberHandle {
  /// Stop calling the subscriber. Callbacks already running finish.
  pub fn detach(self) {
    self.task.abort();
  }

  /// Wait until the subscriber has seen its final delivery.
  pub async fn finished(self) {
    let _ = self.task.await;
  }
}

/// Forward deliveries from a subscription into a callback subscriber.
pub(crate) fn drive(mut subscription: Subscription, subscriber: Arc<dyn Subscriber>) -> SubscriberHandle {
  let task = tokio::spawn(async move {
    while let Some(delivery) = subscription.next().await {
      match delivery {
        Delivery::Stale(snapshot) => subscriber.on_stale(&snapshot),
        Delivery::Fresh(snapshot) => subscriber.on_fresh(&snapshot),
        Delivery::Failed(err) => subscriber.on_error(&err),
      }
    }
  });
  SubscriberHandle { task }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn snapshot(stale: bool) -> Snapshot {
    Snapshot {
      key: "posts".into(),
      objects: Vec::new(),
      stale,
      has_more: false,
    }
  }

  #[tokio::test]
  async fn test_next_stops_after_final_delivery() {
    let (tx, mut sub) = Subscription::channel();
    tx.send(Delivery::Stale(snapshot(true))).unwrap();
    tx.send(Delivery::Fresh(snapshot(false))).unwrap();
    tx.send(Delivery::Fresh(snapshot(false))).unwrap();

    assert!(matches!(sub.next().await, Some(Delivery::Stale(_))));
    assert!(matches!(sub.next().await, Some(Delivery::Fresh(_))));
    assert_eq!(sub.next().await, None);
  }

  #[tokio::test]
  async fn test_fresh_skips_stale() {
    let (tx, sub) = Subscription::channel();
    tx.send(Delivery::Stale(snapshot(true))).unwrap();
    tx.send(Delivery::Fresh(snapshot(false))).unwrap();
    assert!(!sub.fresh().await.unwrap().stale);
  }

  #[tokio::test]
  async fn test_dropped_sender_is_cancellation() {
    let (tx, mut sub) = Subscription::channel();
    assert_eq!(sub.try_next(), None);
    drop(tx);
    assert!(matches!(sub.try_next(), Some(Delivery::Failed(_))));
    assert_eq!(sub.try_next(), None);
  }

  #[tokio::test]
  async fn test_cancel_closes_channel() {
    let (tx, sub) = Subscription::channel();
    sub.cancel();
    assert!(tx.send(Delivery::Fresh(snapshot(false))).is_err());
  }
}
