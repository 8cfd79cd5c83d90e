//! Ledger persistence trait and SQLite implementation.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use super::fingerprint::Fingerprint;
use super::ledger::LedgerEntry;
use crate::repository::{Identity, ObjectRef};

/// Durable storage behind the cache ledger.
///
/// The ledger loads everything once at startup and writes through after
/// every change.
pub trait LedgerStore: Send + Sync {
  /// Load every persisted entry.
  fn load_all(&self) -> Result<Vec<LedgerEntry>>;

  /// Persist one entry, replacing any previous version of it.
  fn save_entry(&self, entry: &LedgerEntry) -> Result<()>;

  /// Remove every entry of one resource key.
  fn remove_key(&self, key: &str) -> Result<()>;

  /// Remove everything.
  fn remove_all(&self) -> Result<()>;
}

/// Store that persists nothing; the ledger starts empty every run.
pub struct NoopLedgerStore;

impl LedgerStore for NoopLedgerStore {
  fn load_all(&self) -> Result<Vec<LedgerEntry>> {
    Ok(Vec::new())
  }

  fn save_entry(&self, _entry: &LedgerEntry) -> Result<()> {
    Ok(()) // Discard
  }

  fn remove_key(&self, _key: &str) -> Result<()> {
    Ok(())
  }

  fn remove_all(&self) -> Result<()> {
    Ok(())
  }
}

/// SQLite-based ledger storage.
pub struct SqliteLedgerStore {
  conn: Mutex<Connection>,
}

/// Schema for ledger tables.
const LEDGER_SCHEMA: &str = r#"
-- Last time the server was asked, per request
CREATE TABLE IF NOT EXISTS ledger_misses (
    resource_key TEXT NOT NULL,
    fingerprint TEXT NOT NULL,
    last_miss INTEGER NOT NULL,
    PRIMARY KEY (resource_key, fingerprint)
);

-- Objects associated with each request (preserves order)
CREATE TABLE IF NOT EXISTS ledger_identities (
    resource_key TEXT NOT NULL,
    fingerprint TEXT NOT NULL,
    position INTEGER NOT NULL,
    entity_type TEXT NOT NULL,
    entity_key TEXT NOT NULL,
    PRIMARY KEY (resource_key, fingerprint, position)
);

CREATE INDEX IF NOT EXISTS idx_ledger_identities_key
    ON ledger_identities(resource_key, fingerprint);
"#;

impl SqliteLedgerStore {
  /// Open (or create) a ledger database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create ledger directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open ledger at {}: {}", path.display(), e))?;
    Self::with_connection(conn)
  }

  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory ledger: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(LEDGER_SCHEMA)
      .map_err(|e| eyre!("Failed to run ledger migrations: {}", e))?;

    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn in_transaction<F>(&self, work: F) -> Result<()>
  where
    F: FnOnce(&Connection) -> Result<()>,
  {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute("BEGIN TRANSACTION", [])
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    if let Err(e) = work(&conn) {
      let _ = conn.execute("ROLLBACK", []);
      return Err(e);
    }

    conn
      .execute("COMMIT", [])
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(())
  }
}

impl LedgerStore for SqliteLedgerStore {
  fn load_all(&self) -> Result<Vec<LedgerEntry>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT resource_key, fingerprint, last_miss FROM ledger_misses")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let mut entries: HashMap<(String, String), LedgerEntry> = stmt
      .query_map([], |row| {
        let key: String = row.get(0)?;
        let fingerprint: String = row.get(1)?;
        let last_miss: i64 = row.get(2)?;
        Ok((key, fingerprint, last_miss))
      })
      .map_err(|e| eyre!("Failed to query ledger misses: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read ledger misses: {}", e))?
      .into_iter()
      .map(|(key, fingerprint, last_miss)| {
        let entry = LedgerEntry {
          key: key.clone(),
          fingerprint: Fingerprint::from_stored(fingerprint.clone()),
          last_miss,
          identities: Vec::new(),
        };
        ((key, fingerprint), entry)
      })
      .collect();

    let mut stmt = conn
      .prepare(
        "SELECT resource_key, fingerprint, entity_type, entity_key FROM ledger_identities
         ORDER BY resource_key, fingerprint, position",
      )
      .map_err(|e| eyre!("Failed to prepare identity query: {}", e))?;

    let rows = stmt
      .query_map([], |row| {
        Ok((
          row.get::<_, String>(0)?,
          row.get::<_, String>(1)?,
          row.get::<_, String>(2)?,
          row.get::<_, String>(3)?,
        ))
      })
      .map_err(|e| eyre!("Failed to query ledger identities: {}", e))?;

    for row in rows {
      let (key, fingerprint, entity, identity) =
        row.map_err(|e| eyre!("Failed to read ledger identity: {}", e))?;
      // Identities without a miss row are leftovers from an interrupted clear
      if let Some(entry) = entries.get_mut(&(key, fingerprint)) {
        entry
          .identities
          .push(ObjectRef::new(entity, Identity::new(identity)));
      }
    }

    Ok(entries.into_values().collect())
  }

  fn save_entry(&self, entry: &LedgerEntry) -> Result<()> {
    self.in_transaction(|conn| {
      let fingerprint = entry.fingerprint.as_str();

      conn
        .execute(
          "INSERT OR REPLACE INTO ledger_misses (resource_key, fingerprint, last_miss)
           VALUES (?, ?, ?)",
          params![entry.key, fingerprint, entry.last_miss],
        )
        .map_err(|e| eyre!("Failed to store ledger miss: {}", e))?;

      conn
        .execute(
          "DELETE FROM ledger_identities WHERE resource_key = ? AND fingerprint = ?",
          params![entry.key, fingerprint],
        )
        .map_err(|e| eyre!("Failed to delete old ledger identities: {}", e))?;

      for (position, object) in entry.identities.iter().enumerate() {
        conn
          .execute(
            "INSERT INTO ledger_identities
               (resource_key, fingerprint, position, entity_type, entity_key)
             VALUES (?, ?, ?, ?, ?)",
            params![
              entry.key,
              fingerprint,
              position as i64,
              object.entity,
              object.identity.as_str()
            ],
          )
          .map_err(|e| eyre!("Failed to store ledger identity: {}", e))?;
      }
      Ok(())
    })
  }

  fn remove_key(&self, key: &str) -> Result<()> {
    self.in_transaction(|conn| {
      conn
        .execute(
          "DELETE FROM ledger_misses WHERE resource_key = ?",
          params![key],
        )
        .map_err(|e| eyre!("Failed to clear ledger misses for {}: {}", key, e))?;
      conn
        .execute(
          "DELETE FROM ledger_identities WHERE resource_key = ?",
          params![key],
        )
        .map_err(|e| eyre!("Failed to clear ledger identities for {}: {}", key, e))?;
      Ok(())
    })
  }

  fn remove_all(&self) -> Result<()> {
    self.in_transaction(|conn| {
      conn
        .execute_batch("DELETE FROM ledger_misses; DELETE FROM ledger_identities;")
        .map_err(|e| eyre!("Failed to clear ledger: {}", e))
    })
  }
}
