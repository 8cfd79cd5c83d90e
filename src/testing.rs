//! Test doubles shared by the unit tests.

use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::Semaphore;

use crate::error::TransportError;
use crate::transport::{Request, Response, Transport};

/// Transport that replays queued responses and records every request.
///
/// `hold` parks requests after they are recorded until `release`.
pub struct FakeTransport {
  responses: Mutex<VecDeque<Result<Response, TransportError>>>,
  requests: Mutex<Vec<Request>>,
  gate: Semaphore,
  held: AtomicBool,
}

impl FakeTransport {
  pub fn new() -> Self {
    Self {
      responses: Mutex::new(VecDeque::new()),
      requests: Mutex::new(Vec::new()),
      gate: Semaphore::new(0),
      held: AtomicBool::new(false),
    }
  }

  pub fn respond(&self, status: u16, body: Value) {
    self.respond_raw(status, body.to_string().into_bytes());
  }

  pub fn respond_raw(&self, status: u16, body: Vec<u8>) {
    self
      .responses
      .lock()
      .unwrap()
      .push_back(Ok(Response::new(status, body)));
  }

  pub fn fail(&self, message: &str) {
    self
      .responses
      .lock()
      .unwrap()
      .push_back(Err(TransportError(message.to_string())));
  }

  pub fn calls(&self) -> usize {
    self.requests.lock().unwrap().len()
  }

  pub fn requests(&self) -> Vec<Request> {
    self.requests.lock().unwrap().clone()
  }

  pub fn hold(&self) {
    self.held.store(true, Ordering::SeqCst);
  }

  pub fn release(&self) {
    self.held.store(false, Ordering::SeqCst);
    self.gate.add_permits(1024);
  }

  /// Yield until at least `count` requests have reached the transport.
  pub async fn wait_for_calls(&self, count: usize) {
    while self.calls() < count {
      tokio::task::yield_now().await;
    }
  }
}

impl Transport for FakeTransport {
  fn execute(&self, request: Request) -> BoxFuture<'_, Result<Response, TransportError>> {
    self.requests.lock().unwrap().push(request);
    let held = self.held.load(Ordering::SeqCst);

    Box::pin(async move {
      if held {
        let _permit = self
          .gate
          .acquire()
          .await
          .map_err(|e| TransportError(e.to_string()))?;
      }
      self
        .responses
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or_else(|| Err(TransportError("no response queued".to_string())))
    })
  }
}
