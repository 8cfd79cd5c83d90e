//! Object repository boundary.
//!
//! The engine never owns domain objects. It asks a repository to find or
//! create them by identity, sets attributes by name, and commits each batch
//! with a single [`ObjectRepository::save`]. Unsaved writes live in a
//! pending set until then; [`ObjectRepository::query`] only observes saved
//! state.

mod memory;
mod sqlite;
mod value;

use color_eyre::Result;

pub use memory::InMemoryRepository;
pub use sqlite::SqliteRepository;
pub use value::{sort_objects, AttrValue, DomainObject, Identity, ObjectRef};

/// Typed key-value store of domain objects.
pub trait ObjectRepository: Send + Sync {
  /// Return the object with this identity, creating an empty pending one
  /// if it does not exist. Never creates a duplicate.
  fn find_or_create(&self, entity: &str, identity: &Identity) -> Result<ObjectRef>;

  /// Look up an object, including unsaved writes.
  fn find(&self, object: &ObjectRef) -> Result<Option<DomainObject>>;

  /// Set an attribute on a (pending) object.
  fn set(&self, object: &ObjectRef, attribute: &str, value: AttrValue) -> Result<()>;

  /// Read an attribute, including unsaved writes.
  fn get(&self, object: &ObjectRef, attribute: &str) -> Result<Option<AttrValue>> {
    Ok(self.find(object)?.and_then(|o| o.attributes.get(attribute).cloned()))
  }

  /// Saved objects for the given references, in reference order, then
  /// stably sorted by `sort` when given. Unknown references are skipped.
  fn query(&self, objects: &[ObjectRef], sort: Option<&str>) -> Result<Vec<DomainObject>>;

  /// All saved objects of one entity type, in identity order.
  fn list(&self, entity: &str) -> Result<Vec<DomainObject>>;

  /// Saved objects of one entity type matching a predicate, sorted.
  fn enumerate(
    &self,
    entity: &str,
    predicate: &dyn Fn(&DomainObject) -> bool,
    sort: Option<&str>,
  ) -> Result<Vec<DomainObject>> {
    let mut objects: Vec<DomainObject> = self
      .list(entity)?
      .into_iter()
      .filter(|o| predicate(o))
      .collect();
    sort_objects(&mut objects, sort);
    Ok(objects)
  }

  /// Commit all pending writes atomically.
  fn save(&self) -> Result<()>;

  /// Discard all pending writes.
  fn rollback(&self) -> Result<()>;
}
