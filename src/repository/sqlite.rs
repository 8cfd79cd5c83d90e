//! SQLite-backed object repository.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Mutex;

use super::value::{sort_objects, AttrValue, DomainObject, Identity, ObjectRef};
use super::ObjectRepository;

type Attributes = BTreeMap<String, AttrValue>;

/// Repository persisting each object as a JSON attribute map in SQLite.
///
/// Writes are staged in memory and flushed in one transaction by `save`.
pub struct SqliteRepository {
  conn: Mutex<Connection>,
  pending: Mutex<HashMap<ObjectRef, Attributes>>,
}

/// Schema for the object table.
const OBJECT_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS objects (
    entity_type TEXT NOT NULL,
    entity_key TEXT NOT NULL,
    data BLOB NOT NULL,
    saved_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (entity_type, entity_key)
);
"#;

impl SqliteRepository {
  /// Open (or create) a repository database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create repository directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open repository at {}: {}", path.display(), e))?;
    Self::with_connection(conn)
  }

  /// Open a repository that lives only as long as this value.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory repository: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(OBJECT_SCHEMA)
      .map_err(|e| eyre!("Failed to run repository migrations: {}", e))?;

    Ok(Self {
      conn: Mutex::new(conn),
      pending: Mutex::new(HashMap::new()),
    })
  }

  fn load(conn: &Connection, object: &ObjectRef) -> Result<Option<Attributes>> {
    let data: Option<Vec<u8>> = conn
      .query_row(
        "SELECT data FROM objects WHERE entity_type = ? AND entity_key = ?",
        params![object.entity, object.identity.as_str()],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to load {}: {}", object, e))?;

    data
      .map(|data| {
        serde_json::from_slice(&data).map_err(|e| eyre!("Failed to deserialize {}: {}", object, e))
      })
      .transpose()
  }
}

impl ObjectRepository for SqliteRepository {
  fn find_or_create(&self, entity: &str, identity: &Identity) -> Result<ObjectRef> {
    let object = ObjectRef::new(entity, identity.clone());
    let mut pending = self
      .pending
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    if pending.contains_key(&object) {
      return Ok(object);
    }

    let conn = self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
    if Self::load(&conn, &object)?.is_none() {
      pending.insert(object.clone(), Attributes::new());
    }
    Ok(object)
  }

  fn find(&self, object: &ObjectRef) -> Result<Option<DomainObject>> {
    let pending = self
      .pending
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let attributes = match pending.get(object) {
      Some(attributes) => Some(attributes.clone()),
      None => {
        let conn = self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
        Self::load(&conn, object)?
      }
    };

    Ok(attributes.map(|attributes| DomainObject {
      attributes,
      ..DomainObject::new(object)
    }))
  }

  fn set(&self, object: &ObjectRef, attribute: &str, value: AttrValue) -> Result<()> {
    let mut pending = self
      .pending
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    if !pending.contains_key(object) {
      let conn = self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
      let base = Self::load(&conn, object)?.unwrap_or_default();
      pending.insert(object.clone(), base);
    }
    if let Some(attributes) = pending.get_mut(object) {
      attributes.insert(attribute.to_string(), value);
    }
    Ok(())
  }

  fn query(&self, objects: &[ObjectRef], sort: Option<&str>) -> Result<Vec<DomainObject>> {
    let conn = self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let mut result = Vec::with_capacity(objects.len());
    for object in objects {
      if let Some(attributes) = Self::load(&conn, object)? {
        result.push(DomainObject {
          attributes,
          ..DomainObject::new(object)
        });
      }
    }
    sort_objects(&mut result, sort);
    Ok(result)
  }

  fn list(&self, entity: &str) -> Result<Vec<DomainObject>> {
    let conn = self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let mut stmt = conn
      .prepare(
        "SELECT entity_key, data FROM objects
         WHERE entity_type = ?
         ORDER BY entity_key",
      )
      .map_err(|e| eyre!("Failed to prepare object listing: {}", e))?;

    let rows: Vec<(String, Vec<u8>)> = stmt
      .query_map(params![entity], |row| Ok((row.get(0)?, row.get(1)?)))
      .map_err(|e| eyre!("Failed to list {} objects: {}", entity, e))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| eyre!("Failed to read {} objects: {}", entity, e))?;

    rows
      .into_iter()
      .map(|(key, data)| {
        let attributes: Attributes = serde_json::from_slice(&data)
          .map_err(|e| eyre!("Failed to deserialize {}#{}: {}", entity, key, e))?;
        Ok(DomainObject {
          entity: entity.to_string(),
          identity: Identity::new(key),
          attributes,
        })
      })
      .collect()
  }

  fn save(&self) -> Result<()> {
    let mut pending = self
      .pending
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    if pending.is_empty() {
      return Ok(());
    }

    let conn = self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
    conn
      .execute("BEGIN TRANSACTION", [])
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let written = pending.iter().try_for_each(|(object, attributes)| {
      let data =
        serde_json::to_vec(attributes).map_err(|e| eyre!("Failed to serialize {}: {}", object, e))?;
      conn
        .execute(
          "INSERT OR REPLACE INTO objects (entity_type, entity_key, data, saved_at)
           VALUES (?, ?, ?, datetime('now'))",
          params![object.entity, object.identity.as_str(), data],
        )
        .map_err(|e| eyre!("Failed to store {}: {}", object, e))?;
      Ok::<_, color_eyre::Report>(())
    });

    if let Err(e) = written {
      let _ = conn.execute("ROLLBACK", []);
      return Err(e);
    }

    conn
      .execute("COMMIT", [])
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    pending.clear();
    Ok(())
  }

  fn rollback(&self) -> Result<()> {
    self
      .pending
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?
      .clear();
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::{TimeZone, Utc};

  #[test]
  fn test_save_and_query_sorted() {
    let repo = SqliteRepository::open_in_memory().unwrap();
    let refs: Vec<ObjectRef> = [(1, "b"), (2, "a"), (3, "c")]
      .iter()
      .map(|(id, title)| {
        let obj = repo.find_or_create("Post", &Identity::from(*id)).unwrap();
        repo
          .set(&obj, "title", AttrValue::String(title.to_string()))
          .unwrap();
        obj
      })
      .collect();

    assert!(repo.query(&refs, None).unwrap().is_empty());
    repo.save().unwrap();

    let sorted = repo.query(&refs, Some("title")).unwrap();
    let ids: Vec<_> = sorted.iter().map(|o| o.identity.to_string()).collect();
    assert_eq!(ids, vec!["2", "1", "3"]);
  }

  #[test]
  fn test_objects_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("objects.db");
    let when = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();

    {
      let repo = SqliteRepository::open(&path).unwrap();
      let obj = repo.find_or_create("Post", &Identity::from(9)).unwrap();
      repo.set(&obj, "published", AttrValue::Date(when)).unwrap();
      repo.set(&obj, "draft", AttrValue::Boolean(false)).unwrap();
      repo.save().unwrap();
    }

    let repo = SqliteRepository::open(&path).unwrap();
    let listed = repo.list("Post").unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].get("published"), Some(&AttrValue::Date(when)));
    assert_eq!(listed[0].get("draft"), Some(&AttrValue::Boolean(false)));
  }

  #[test]
  fn test_rollback_keeps_saved_values() {
    let repo = SqliteRepository::open_in_memory().unwrap();
    let obj = repo.find_or_create("Post", &Identity::from(1)).unwrap();
    repo.set(&obj, "n", AttrValue::Integer(1)).unwrap();
    repo.save().unwrap();

    repo.set(&obj, "n", AttrValue::Integer(2)).unwrap();
    assert_eq!(repo.get(&obj, "n").unwrap(), Some(AttrValue::Integer(2)));
    repo.rollback().unwrap();
    assert_eq!(repo.get(&obj, "n").unwrap(), Some(AttrValue::Integer(1)));
  }
}
