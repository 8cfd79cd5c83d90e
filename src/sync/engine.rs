//! The sync engine: coalesced fetches, stale-then-fresh delivery, mapping
//! and ledger updates.
//!
//! A fetch runs like this:
//! 1. Resolve the resource and fingerprint the params
//! 2. Join an in-flight request for the same (key, fingerprint), if any
//! 3. Deliver cached objects: as fresh when still within TTL (replace
//!    mode, no network), otherwise as stale
//! 4. Fetch, run the status hook, decode, map every item, save
//! 5. Update the ledger and deliver the fresh snapshot to every subscriber
//!
//! In-flight bookkeeping sits behind one mutex, held only to look up,
//! insert or remove a flight; the repository is read outside it. Every
//! delivery for a flight is sent while holding it, so each subscriber sees
//! stale before fresh and nothing twice.

use futures::FutureExt;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use super::delivery::{drive, Delivery, DeliverySender, Snapshot, Subscriber, SubscriberHandle, Subscription};
use super::hooks::{DefaultHooks, SyncHooks};
use crate::cache::{CacheLedger, Clock, Fingerprint, Params, SystemClock};
use crate::error::{SyncError, SyncResult};
use crate::mapping::Mapper;
use crate::registry::{ResourceDescriptor, ResourceRegistry};
use crate::repository::{Identity, ObjectRef, ObjectRepository};
use crate::transport::{endpoint_url, Decoder, JsonDecoder, Method, Request, Response, Transport};

/// How a collection fetch updates the ledger's identity list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FetchMode {
  /// The fetched identities become the list
  #[default]
  Replace,
  /// The fetched identities are added after the cached ones (set union).
  /// Always revalidates against the server.
  Append,
}

#[derive(Debug, Clone)]
enum Target {
  Many(FetchMode),
  One(Identity),
}

/// A response after the status hook.
enum Checked {
  Accepted(Value),
  Rejected(SyncError),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FlightKey {
  key: String,
  fingerprint: Fingerprint,
}

/// A request in progress and everyone waiting on it.
struct Flight {
  subscribers: Vec<DeliverySender>,
  stale: Option<Snapshot>,
}

impl Flight {
  fn attach(&mut self, subscriber: DeliverySender) {
    if let Some(stale) = &self.stale {
      let _ = subscriber.send(Delivery::Stale(stale.clone()));
    }
    self.subscribers.retain(|s| !s.is_closed());
    self.subscribers.push(subscriber);
  }
}

struct Inner {
  base_url: String,
  registry: Arc<ResourceRegistry>,
  repository: Arc<dyn ObjectRepository>,
  transport: Arc<dyn Transport>,
  decoder: Arc<dyn Decoder>,
  hooks: Arc<dyn SyncHooks>,
  ledger: CacheLedger,
  clock: Arc<dyn Clock>,
  flights: Mutex<HashMap<FlightKey, Flight>>,
  /// Serializes map + save so one flight's rollback never drops another's writes
  map_lock: Mutex<()>,
}

/// Builder for [`Engine`].
pub struct EngineBuilder {
  base_url: String,
  registry: Arc<ResourceRegistry>,
  repository: Arc<dyn ObjectRepository>,
  transport: Arc<dyn Transport>,
  decoder: Arc<dyn Decoder>,
  hooks: Arc<dyn SyncHooks>,
  ledger: Option<CacheLedger>,
  clock: Arc<dyn Clock>,
}

impl EngineBuilder {
  pub fn decoder(mut self, decoder: Arc<dyn Decoder>) -> Self {
    self.decoder = decoder;
    self
  }

  pub fn hooks(mut self, hooks: Arc<dyn SyncHooks>) -> Self {
    self.hooks = hooks;
    self
  }

  pub fn ledger(mut self, ledger: CacheLedger) -> Self {
    self.ledger = Some(ledger);
    self
  }

  pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  pub fn build(self) -> Engine {
    Engine {
      inner: Arc::new(Inner {
        base_url: self.base_url,
        registry: self.registry,
        repository: self.repository,
        transport: self.transport,
        decoder: self.decoder,
        hooks: self.hooks,
        ledger: self.ledger.unwrap_or_else(CacheLedger::in_memory),
        clock: self.clock,
        flights: Mutex::new(HashMap::new()),
        map_lock: Mutex::new(()),
      }),
    }
  }
}

/// Fetch/cache/mapping engine. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Engine {
  inner: Arc<Inner>,
}

impl Engine {
  /// Start building an engine. Defaults: JSON decoder, default hooks,
  /// in-memory ledger, system clock.
  pub fn builder(
    base_url: impl Into<String>,
    registry: Arc<ResourceRegistry>,
    repository: Arc<dyn ObjectRepository>,
    transport: Arc<dyn Transport>,
  ) -> EngineBuilder {
    EngineBuilder {
      base_url: base_url.into(),
      registry,
      repository,
      transport,
      decoder: Arc::new(JsonDecoder),
      hooks: Arc::new(DefaultHooks),
      ledger: None,
      clock: Arc::new(SystemClock),
    }
  }

  pub fn registry(&self) -> &ResourceRegistry {
    &self.inner.registry
  }

  pub fn repository(&self) -> &dyn ObjectRepository {
    self.inner.repository.as_ref()
  }

  pub fn ledger(&self) -> &CacheLedger {
    &self.inner.ledger
  }

  /// Number of requests currently on the network.
  pub fn in_flight(&self) -> usize {
    self.inner.lock_flights().len()
  }

  /// Fetch a collection. Fails immediately only for an unknown key; every
  /// other outcome arrives through the subscription.
  pub fn fetch_many(&self, key: &str, params: Params, mode: FetchMode) -> SyncResult<Subscription> {
    self.start(key, params, Target::Many(mode))
  }

  /// [`Engine::fetch_many`] with callbacks.
  pub fn fetch_many_with(
    &self,
    key: &str,
    params: Params,
    mode: FetchMode,
    subscriber: Arc<dyn Subscriber>,
  ) -> SyncResult<SubscriberHandle> {
    Ok(drive(self.fetch_many(key, params, mode)?, subscriber))
  }

  /// [`Engine::fetch_many`], waiting for the fresh result only.
  pub async fn fetch_many_fresh(
    &self,
    key: &str,
    params: Params,
    mode: FetchMode,
  ) -> SyncResult<Snapshot> {
    self.fetch_many(key, params, mode)?.fresh().await
  }

  /// Fetch a single object from `endpoint/id`.
  pub fn fetch_one(
    &self,
    key: &str,
    id: impl Into<Identity>,
    params: Params,
  ) -> SyncResult<Subscription> {
    self.start(key, params, Target::One(id.into()))
  }

  /// [`Engine::fetch_one`] with callbacks.
  pub fn fetch_one_with(
    &self,
    key: &str,
    id: impl Into<Identity>,
    params: Params,
    subscriber: Arc<dyn Subscriber>,
  ) -> SyncResult<SubscriberHandle> {
    Ok(drive(self.fetch_one(key, id, params)?, subscriber))
  }

  /// [`Engine::fetch_one`], waiting for the fresh result only.
  pub async fn fetch_one_fresh(
    &self,
    key: &str,
    id: impl Into<Identity>,
    params: Params,
  ) -> SyncResult<Snapshot> {
    self.fetch_one(key, id, params)?.fresh().await
  }

  /// Whether a collection request would be answered from the server.
  pub fn is_stale(&self, key: &str, params: &Params) -> SyncResult<bool> {
    let descriptor = self.inner.registry.resolve(key)?;
    Ok(self.inner.ledger.is_stale(
      key,
      &Fingerprint::of(params),
      descriptor.cache_ttl_secs,
      self.inner.clock.now(),
    ))
  }

  /// Forget cached requests for one key. Objects stay in the repository.
  pub async fn clear_cache_for_key(&self, key: &str) -> SyncResult<()> {
    self.inner.registry.resolve(key)?;
    self
      .inner
      .ledger
      .clear(key)
      .await
      .map_err(SyncError::storage)
  }

  /// Forget every cached request.
  pub async fn clear_cache(&self) -> SyncResult<()> {
    self
      .inner
      .ledger
      .clear_all()
      .await
      .map_err(SyncError::storage)
  }

  /// Miscellaneous API call through the same base URL, hooks and decoder.
  /// Nothing is mapped or cached.
  pub async fn request(&self, method: Method, endpoint: &str, params: Params) -> SyncResult<Value> {
    let url = endpoint_url(&self.inner.base_url, endpoint, None);
    let response = self.inner.send(method, url, params).await?;
    match self.inner.check(&response)? {
      Checked::Accepted(body) => Ok(body),
      Checked::Rejected(err) => Err(err),
    }
  }

  fn start(&self, key: &str, params: Params, target: Target) -> SyncResult<Subscription> {
    let inner = &self.inner;
    let descriptor = inner.registry.resolve(key)?;
    let fingerprint = match &target {
      Target::Many(_) => Fingerprint::of(&params),
      Target::One(id) => Fingerprint::of_item(id, &params),
    };
    let flight_key = FlightKey {
      key: key.to_string(),
      fingerprint,
    };
    let (sender, subscription) = Subscription::channel();

    if let Some(flight) = inner.lock_flights().get_mut(&flight_key) {
      debug!(key, fingerprint = %flight_key.fingerprint, "Joining in-flight request");
      flight.attach(sender);
      return Ok(subscription);
    }

    // The repository is read without holding the in-flight table
    let cached = inner
      .ledger
      .associated_identities(key, &flight_key.fingerprint);
    let stale = if cached.is_empty() {
      None
    } else {
      match inner.snapshot(&descriptor, &cached, true, false) {
        Ok(snapshot) => Some(snapshot),
        Err(err) => {
          warn!(key, error = %err, "Could not assemble cached snapshot");
          None
        }
      }
    };

    if let Some(snapshot) = &stale {
      let expired = inner.ledger.is_stale(
        key,
        &flight_key.fingerprint,
        descriptor.cache_ttl_secs,
        inner.clock.now(),
      );
      let revalidate = matches!(target, Target::Many(FetchMode::Append));
      // A cache hit needs every cached object still present
      if !expired && !revalidate && snapshot.len() == cached.len() {
        debug!(key, fingerprint = %flight_key.fingerprint, "Cache hit");
        let _ = sender.send(Delivery::Fresh(Snapshot {
          stale: false,
          ..snapshot.clone()
        }));
        return Ok(subscription);
      }
    }

    let mut flights = inner.lock_flights();
    if let Some(flight) = flights.get_mut(&flight_key) {
      // Started by another caller while the snapshot was read
      debug!(key, fingerprint = %flight_key.fingerprint, "Joining in-flight request");
      flight.attach(sender);
      return Ok(subscription);
    }
    if let Some(snapshot) = &stale {
      let _ = sender.send(Delivery::Stale(snapshot.clone()));
    }
    flights.insert(
      flight_key.clone(),
      Flight {
        subscribers: vec![sender],
        stale,
      },
    );
    drop(flights);

    let inner = Arc::clone(inner);
    tokio::spawn(async move {
      let outcome = AssertUnwindSafe(inner.run(&descriptor, &flight_key, params, target))
        .catch_unwind()
        .await
        .unwrap_or_else(|_| Err(SyncError::Internal("request task panicked".to_string())));
      inner.complete(&flight_key, outcome);
    });

    Ok(subscription)
  }
}

impl Inner {
  fn lock_flights(&self) -> MutexGuard<'_, HashMap<FlightKey, Flight>> {
    self.flights.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Build and send one request.
  async fn send(&self, method: Method, url: String, params: Params) -> SyncResult<Response> {
    let mut request = Request::new(method, url, params);
    self.hooks.will_send_request(&mut request);
    debug!(method = %request.method, url = %request.url, "Fetching");

    Ok(self.transport.execute(request).await?)
  }

  /// Status hook first, then decoding. The hook sees `null` when the body
  /// does not decode, so a non-JSON error page still maps to its status.
  fn check(&self, response: &Response) -> SyncResult<Checked> {
    let decoded = self.decoder.decode(&response.body);
    let null = Value::Null;
    let body = decoded.as_ref().unwrap_or(&null);
    if let Some(err) = self.hooks.on_result(body, response.status) {
      return Ok(Checked::Rejected(err));
    }
    decoded.map(Checked::Accepted)
  }

  async fn run(
    &self,
    descriptor: &ResourceDescriptor,
    flight: &FlightKey,
    params: Params,
    target: Target,
  ) -> SyncResult<Snapshot> {
    let id = match &target {
      Target::One(id) => Some(id),
      Target::Many(_) => None,
    };
    let url = endpoint_url(&self.base_url, &descriptor.endpoint, id);
    let response = self.send(Method::Get, url, params).await?;

    let body = match self.check(&response)? {
      Checked::Accepted(body) => body,
      Checked::Rejected(err) => {
        // Subscribers get the rejection; a failed miss write is only logged
        if let Err(e) = self
          .ledger
          .record_miss(&flight.key, &flight.fingerprint, self.clock.now())
          .await
        {
          warn!(key = %flight.key, error = %e, "Failed to persist cache miss");
        }
        return Err(err);
      }
    };

    let (items, has_more) = match &target {
      Target::Many(_) => {
        let has_more = self.hooks.server_has_more(&descriptor.key, &body);
        (self.hooks.items_from_result(&descriptor.key, body), has_more)
      }
      Target::One(_) => (vec![self.hooks.item_from_result(&descriptor.key, body)], false),
    };

    let mapped = self.map_and_save(descriptor, &items)?;
    let identities = match target {
      Target::Many(FetchMode::Append) => {
        let previous = self
          .ledger
          .associated_identities(&flight.key, &flight.fingerprint);
        merge_identities(previous, mapped)
      }
      _ => merge_identities(Vec::new(), mapped),
    };

    self
      .ledger
      .record_success(
        &flight.key,
        &flight.fingerprint,
        identities.clone(),
        self.clock.now(),
      )
      .await
      .map_err(SyncError::storage)?;

    self.snapshot(descriptor, &identities, false, has_more)
  }

  /// Map every item, then save. Any failure rolls back the whole batch.
  fn map_and_save(&self, descriptor: &ResourceDescriptor, items: &[Value]) -> SyncResult<Vec<ObjectRef>> {
    let _guard = self.map_lock.lock().unwrap_or_else(|e| e.into_inner());
    let mapper = Mapper::new(&self.registry, self.repository.as_ref(), self.hooks.as_ref());

    let mapped = items
      .iter()
      .map(|item| {
        let entity = mapper.resolve_entity(descriptor, item)?;
        mapper.map(item, &entity)
      })
      .collect::<SyncResult<Vec<_>>>()
      .and_then(|objects| {
        self.repository.save().map_err(SyncError::storage)?;
        Ok(objects)
      });

    if mapped.is_err() {
      if let Err(e) = self.repository.rollback() {
        warn!(key = %descriptor.key, error = %e, "Rollback failed");
      }
    }
    mapped
  }

  fn snapshot(
    &self,
    descriptor: &ResourceDescriptor,
    identities: &[ObjectRef],
    stale: bool,
    has_more: bool,
  ) -> SyncResult<Snapshot> {
    let objects = self
      .repository
      .query(identities, self.registry.sort_attribute(descriptor))
      .map_err(SyncError::storage)?;

    Ok(Snapshot {
      key: descriptor.key.clone(),
      objects,
      stale,
      has_more,
    })
  }

  /// Remove the flight and hand its outcome to every subscriber.
  fn complete(&self, flight_key: &FlightKey, outcome: SyncResult<Snapshot>) {
    let mut flights = self.lock_flights();
    let Some(flight) = flights.remove(flight_key) else {
      return;
    };

    let delivery = match outcome {
      Ok(snapshot) => {
        info!(
          key = %flight_key.key,
          fingerprint = %flight_key.fingerprint,
          objects = snapshot.len(),
          subscribers = flight.subscribers.len(),
          "Fetch complete"
        );
        Delivery::Fresh(snapshot)
      }
      Err(err) => {
        warn!(
          key = %flight_key.key,
          fingerprint = %flight_key.fingerprint,
          error = %err,
          "Fetch failed"
        );
        Delivery::Failed(err)
      }
    };

    for subscriber in flight.subscribers {
      // Detached subscribers have dropped their receiver
      let _ = subscriber.send(delivery.clone());
    }
  }
}

/// `previous` followed by the members of `fetched` not already in it,
/// without duplicates.
fn merge_identities(previous: Vec<ObjectRef>, fetched: Vec<ObjectRef>) -> Vec<ObjectRef> {
  let mut seen: HashSet<ObjectRef> = HashSet::new();
  previous
    .into_iter()
    .chain(fetched)
    .filter(|object| seen.insert(object.clone()))
    .collect()
}
