//! In-memory repository, used by tests and short-lived sessions.

use color_eyre::Result;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use super::value::{sort_objects, AttrValue, DomainObject, Identity, ObjectRef};
use super::ObjectRepository;

#[derive(Default)]
struct MemoryState {
  saved: HashMap<ObjectRef, BTreeMap<String, AttrValue>>,
  pending: HashMap<ObjectRef, BTreeMap<String, AttrValue>>,
}

/// Repository that keeps every object in a process-local map.
#[derive(Default)]
pub struct InMemoryRepository {
  state: Mutex<MemoryState>,
}

impl InMemoryRepository {
  pub fn new() -> Self {
    Self::default()
  }

  /// Number of saved objects.
  pub fn len(&self) -> usize {
    self.lock().saved.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  fn lock(&self) -> MutexGuard<'_, MemoryState> {
    self.state.lock().unwrap_or_else(|e| e.into_inner())
  }
}

impl ObjectRepository for InMemoryRepository {
  fn find_or_create(&self, entity: &str, identity: &Identity) -> Result<ObjectRef> {
    let object = ObjectRef::new(entity, identity.clone());
    let mut state = self.lock();
    if !state.saved.contains_key(&object) && !state.pending.contains_key(&object) {
      state.pending.insert(object.clone(), BTreeMap::new());
    }
    Ok(object)
  }

  fn find(&self, object: &ObjectRef) -> Result<Option<DomainObject>> {
    let state = self.lock();
    let attributes = state
      .pending
      .get(object)
      .or_else(|| state.saved.get(object));
    Ok(attributes.map(|attributes| DomainObject {
      attributes: attributes.clone(),
      ..DomainObject::new(object)
    }))
  }

  fn set(&self, object: &ObjectRef, attribute: &str, value: AttrValue) -> Result<()> {
    let mut state = self.lock();
    if !state.pending.contains_key(object) {
      let base = state.saved.get(object).cloned().unwrap_or_default();
      state.pending.insert(object.clone(), base);
    }
    if let Some(attributes) = state.pending.get_mut(object) {
      attributes.insert(attribute.to_string(), value);
    }
    Ok(())
  }

  fn query(&self, objects: &[ObjectRef], sort: Option<&str>) -> Result<Vec<DomainObject>> {
    let state = self.lock();
    let mut result: Vec<DomainObject> = objects
      .iter()
      .filter_map(|object| {
        state.saved.get(object).map(|attributes| DomainObject {
          attributes: attributes.clone(),
          ..DomainObject::new(object)
        })
      })
      .collect();
    sort_objects(&mut result, sort);
    Ok(result)
  }

  fn list(&self, entity: &str) -> Result<Vec<DomainObject>> {
    let state = self.lock();
    let mut result: Vec<DomainObject> = state
      .saved
      .iter()
      .filter(|(object, _)| object.entity == entity)
      .map(|(object, attributes)| DomainObject {
        attributes: attributes.clone(),
        ..DomainObject::new(object)
      })
      .collect();
    result.sort_by(|a, b| a.identity.cmp(&b.identity));
    Ok(result)
  }

  fn save(&self) -> Result<()> {
    let mut state = self.lock();
    let pending = std::mem::take(&mut state.pending);
    state.saved.extend(pending);
    Ok(())
  }

  fn rollback(&self) -> Result<()> {
    self.lock().pending.clear();
    Ok(())
  }
}
