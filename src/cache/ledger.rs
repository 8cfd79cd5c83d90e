//! In-memory cache ledger with write-through persistence.

use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

use super::fingerprint::Fingerprint;
use super::storage::{LedgerStore, NoopLedgerStore};
use crate::repository::ObjectRef;

/// Bookkeeping for one (resource key, fingerprint) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
  pub key: String,
  pub fingerprint: Fingerprint,
  /// Unix time the server was last asked for this request
  pub last_miss: i64,
  /// Objects the last successful fetch produced, in order
  pub identities: Vec<ObjectRef>,
}

type EntryKey = (String, Fingerprint);

/// Per-request staleness and identity ledger.
///
/// Entries are replaced whole, so readers never observe a half-updated
/// entry. Writes are serialized and flushed to the store before returning.
pub struct CacheLedger {
  entries: RwLock<HashMap<EntryKey, Arc<LedgerEntry>>>,
  store: Arc<dyn LedgerStore>,
  write_lock: tokio::sync::Mutex<()>,
}

impl CacheLedger {
  /// Create a ledger backed by `store`, loading every persisted entry.
  pub fn load(store: Arc<dyn LedgerStore>) -> Result<Self> {
    let entries: HashMap<EntryKey, Arc<LedgerEntry>> = store
      .load_all()?
      .into_iter()
      .map(|entry| ((entry.key.clone(), entry.fingerprint.clone()), Arc::new(entry)))
      .collect();

    debug!(entries = entries.len(), "Loaded cache ledger");

    Ok(Self {
      entries: RwLock::new(entries),
      store,
      write_lock: tokio::sync::Mutex::new(()),
    })
  }

  /// A ledger that forgets everything when dropped.
  pub fn in_memory() -> Self {
    Self {
      entries: RwLock::new(HashMap::new()),
      store: Arc::new(NoopLedgerStore),
      write_lock: tokio::sync::Mutex::new(()),
    }
  }

  pub fn entry(&self, key: &str, fingerprint: &Fingerprint) -> Option<Arc<LedgerEntry>> {
    self
      .entries
      .read()
      .unwrap_or_else(|e| e.into_inner())
      .get(&(key.to_string(), fingerprint.clone()))
      .cloned()
  }

  /// True when no entry exists or the last miss is more than `ttl_secs`
  /// in the past. Exactly `ttl_secs` old is still fresh.
  pub fn is_stale(&self, key: &str, fingerprint: &Fingerprint, ttl_secs: u64, now: i64) -> bool {
    match self.entry(key, fingerprint) {
      Some(entry) => now - entry.last_miss > ttl_secs as i64,
      None => true,
    }
  }

  /// Identities cached for a request; empty when there is no entry.
  pub fn associated_identities(&self, key: &str, fingerprint: &Fingerprint) -> Vec<ObjectRef> {
    self
      .entry(key, fingerprint)
      .map(|entry| entry.identities.clone())
      .unwrap_or_default()
  }

  /// Move the miss timestamp, keeping any associated identities.
  pub async fn record_miss(&self, key: &str, fingerprint: &Fingerprint, now: i64) -> Result<()> {
    let _guard = self.write_lock.lock().await;
    let identities = self.associated_identities(key, fingerprint);
    self
      .replace(LedgerEntry {
        key: key.to_string(),
        fingerprint: fingerprint.clone(),
        last_miss: now,
        identities,
      })
      .await
  }

  /// Record a completed fetch: new miss timestamp and identity list.
  pub async fn record_success(
    &self,
    key: &str,
    fingerprint: &Fingerprint,
    identities: Vec<ObjectRef>,
    now: i64,
  ) -> Result<()> {
    let _guard = self.write_lock.lock().await;
    self
      .replace(LedgerEntry {
        key: key.to_string(),
        fingerprint: fingerprint.clone(),
        last_miss: now,
        identities,
      })
      .await
  }

  /// Forget every entry of one key. Repository objects are untouched.
  pub async fn clear(&self, key: &str) -> Result<()> {
    let _guard = self.write_lock.lock().await;
    let store = Arc::clone(&self.store);
    let owned = key.to_string();
    flush(move || store.remove_key(&owned)).await?;

    self
      .entries
      .write()
      .unwrap_or_else(|e| e.into_inner())
      .retain(|(entry_key, _), _| entry_key != key);
    Ok(())
  }

  /// Forget every entry.
  pub async fn clear_all(&self) -> Result<()> {
    let _guard = self.write_lock.lock().await;
    let store = Arc::clone(&self.store);
    flush(move || store.remove_all()).await?;

    self
      .entries
      .write()
      .unwrap_or_else(|e| e.into_inner())
      .clear();
    Ok(())
  }

  /// Persist `entry`, then publish it. A failed write leaves the previous
  /// entry visible, so memory never runs ahead of the store.
  async fn replace(&self, entry: LedgerEntry) -> Result<()> {
    let entry = Arc::new(entry);
    let store = Arc::clone(&self.store);
    let pending = Arc::clone(&entry);
    flush(move || store.save_entry(&pending)).await?;

    self
      .entries
      .write()
      .unwrap_or_else(|e| e.into_inner())
      .insert((entry.key.clone(), entry.fingerprint.clone()), entry);
    Ok(())
  }
}

async fn flush<F>(write: F) -> Result<()>
where
  F: FnOnce() -> Result<()> + Send + 'static,
{
  tokio::task::spawn_blocking(write)
    .await
    .map_err(|e| eyre!("Ledger flush task failed: {}", e))?
}
