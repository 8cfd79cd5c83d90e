//! Resource registry: resource keys, endpoints, target entity types and
//! the per-type attribute table the mapper works from.
//!
//! The registry is assembled once at startup and then shared read-only.

use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{SyncError, SyncResult};

/// Cache time used when a resource does not set one (seconds).
pub const DEFAULT_CACHE_TIME: u64 = 300;

/// Declared storage kind of an attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttributeKind {
  String,
  Number,
  Integer,
  Boolean,
  Date,
  /// Arbitrary JSON kept as-is
  Json,
  /// Relation or collection; never mapped automatically
  Relation,
}

/// One attribute of an entity type.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AttributeDescriptor {
  pub name: String,
  pub kind: AttributeKind,
  /// JSON key to read from when it differs from `name`
  #[serde(default)]
  pub json_key: Option<String>,
  /// Coercion failure on a required attribute fails the batch
  #[serde(default)]
  pub required: bool,
}

impl AttributeDescriptor {
  pub fn new(name: impl Into<String>, kind: AttributeKind) -> Self {
    Self {
      name: name.into(),
      kind,
      json_key: None,
      required: false,
    }
  }

  pub fn from_key(mut self, json_key: impl Into<String>) -> Self {
    self.json_key = Some(json_key.into());
    self
  }

  pub fn required(mut self) -> Self {
    self.required = true;
    self
  }

  pub fn json_key(&self) -> &str {
    self.json_key.as_deref().unwrap_or(&self.name)
  }

  pub fn is_relation(&self) -> bool {
    self.kind == AttributeKind::Relation
  }
}

/// Attribute table for one entity type.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EntitySchema {
  pub name: String,
  /// Name of the attribute holding the remote identity
  pub identity: String,
  #[serde(default)]
  pub attributes: Vec<AttributeDescriptor>,
}

impl EntitySchema {
  pub fn new(name: impl Into<String>, identity: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      identity: identity.into(),
      attributes: Vec::new(),
    }
  }

  pub fn attribute(mut self, attribute: AttributeDescriptor) -> Self {
    self.attributes.push(attribute);
    self
  }

  pub fn find_attribute(&self, name: &str) -> Option<&AttributeDescriptor> {
    self.attributes.iter().find(|a| a.name == name)
  }

  /// JSON key carrying the identity of an item of this type.
  pub fn identity_json_key(&self) -> &str {
    self
      .find_attribute(&self.identity)
      .map(AttributeDescriptor::json_key)
      .unwrap_or(&self.identity)
  }
}

/// Picks the entity type for a decoded item at runtime.
pub type EntitySelector = Arc<dyn Fn(&Value) -> Option<String> + Send + Sync>;

/// Entity types a resource maps into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetTypes {
  /// Every item maps into this type
  Single(String),
  /// Items map into one of these types, chosen per item. Empty means
  /// any registered type.
  Many(Vec<String>),
}

/// Static description of one resource key.
#[derive(Clone)]
pub struct ResourceDescriptor {
  pub key: String,
  pub endpoint: String,
  pub targets: TargetTypes,
  pub sort_attribute: Option<String>,
  pub cache_ttl_secs: u64,
  pub entity_selector: Option<EntitySelector>,
}

impl ResourceDescriptor {
  pub fn new(key: impl Into<String>, endpoint: impl Into<String>, entity: impl Into<String>) -> Self {
    Self {
      key: key.into(),
      endpoint: endpoint.into(),
      targets: TargetTypes::Single(entity.into()),
      sort_attribute: None,
      cache_ttl_secs: DEFAULT_CACHE_TIME,
      entity_selector: None,
    }
  }

  /// A resource whose items map into one of several types.
  pub fn polymorphic(
    key: impl Into<String>,
    endpoint: impl Into<String>,
    entities: Vec<String>,
  ) -> Self {
    Self {
      targets: TargetTypes::Many(entities),
      ..Self::new(key, endpoint, String::new())
    }
  }

  pub fn sorted_by(mut self, attribute: impl Into<String>) -> Self {
    self.sort_attribute = Some(attribute.into());
    self
  }

  pub fn cache_for(mut self, seconds: u64) -> Self {
    self.cache_ttl_secs = seconds;
    self
  }

  pub fn select_with<F>(mut self, selector: F) -> Self
  where
    F: Fn(&Value) -> Option<String> + Send + Sync + 'static,
  {
    self.entity_selector = Some(Arc::new(selector));
    self
  }

  /// Entity type for an item from the descriptor alone. `None` means the
  /// caller has to fall back to its own hook.
  pub fn select_entity(&self, item: &Value) -> Option<String> {
    match &self.targets {
      TargetTypes::Single(entity) => Some(entity.clone()),
      TargetTypes::Many(_) => self.entity_selector.as_ref().and_then(|select| select(item)),
    }
  }

  /// Whether `entity` is an allowed target for this resource.
  pub fn accepts(&self, entity: &str) -> bool {
    match &self.targets {
      TargetTypes::Single(single) => single == entity,
      TargetTypes::Many(many) => many.is_empty() || many.iter().any(|e| e == entity),
    }
  }
}

impl fmt::Debug for ResourceDescriptor {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ResourceDescriptor")
      .field("key", &self.key)
      .field("endpoint", &self.endpoint)
      .field("targets", &self.targets)
      .field("sort_attribute", &self.sort_attribute)
      .field("cache_ttl_secs", &self.cache_ttl_secs)
      .field("entity_selector", &self.entity_selector.is_some())
      .finish()
  }
}

/// Read-only table from resource key to descriptor.
#[derive(Debug, Default)]
pub struct ResourceRegistry {
  resources: HashMap<String, Arc<ResourceDescriptor>>,
  entities: HashMap<String, EntitySchema>,
  default_order: Option<String>,
}

impl ResourceRegistry {
  /// Create an empty registry. `default_order` is the sort attribute used
  /// by resources that do not name one; `None` disables sorting for them.
  pub fn new(default_order: Option<String>) -> Self {
    Self {
      default_order,
      ..Self::default()
    }
  }

  /// Add entity attribute tables. Must precede `register`.
  pub fn register_entities(
    &mut self,
    schemas: impl IntoIterator<Item = EntitySchema>,
  ) -> SyncResult<()> {
    for schema in schemas {
      if self.entities.contains_key(&schema.name) {
        return Err(SyncError::Config(format!(
          "entity {} registered twice",
          schema.name
        )));
      }
      self.entities.insert(schema.name.clone(), schema);
    }
    Ok(())
  }

  /// Add resource descriptors, validating their target types.
  pub fn register(
    &mut self,
    descriptors: impl IntoIterator<Item = ResourceDescriptor>,
  ) -> SyncResult<()> {
    for descriptor in descriptors {
      if self.resources.contains_key(&descriptor.key) {
        return Err(SyncError::Config(format!(
          "resource key {} registered twice",
          descriptor.key
        )));
      }

      let named: Vec<&String> = match &descriptor.targets {
        TargetTypes::Single(entity) => vec![entity],
        TargetTypes::Many(entities) => entities.iter().collect(),
      };
      if let Some(unknown) = named.iter().find(|e| !self.entities.contains_key(e.as_str())) {
        return Err(SyncError::Config(format!(
          "resource {} targets unknown entity {}",
          descriptor.key, unknown
        )));
      }

      self
        .resources
        .insert(descriptor.key.clone(), Arc::new(descriptor));
    }
    Ok(())
  }

  pub fn resolve(&self, key: &str) -> SyncResult<Arc<ResourceDescriptor>> {
    self
      .resources
      .get(key)
      .cloned()
      .ok_or_else(|| SyncError::UnknownKey(key.to_string()))
  }

  pub fn entity(&self, name: &str) -> Option<&EntitySchema> {
    self.entities.get(name)
  }

  pub fn default_order_attribute(&self) -> Option<&str> {
    self.default_order.as_deref()
  }

  /// Sort attribute for a resource, falling back to the registry default.
  pub fn sort_attribute<'a>(&'a self, descriptor: &'a ResourceDescriptor) -> Option<&'a str> {
    descriptor
      .sort_attribute
      .as_deref()
      .or_else(|| self.default_order_attribute())
  }

  /// Registered resource keys, in no particular order.
  pub fn keys(&self) -> impl Iterator<Item = &str> {
    self.resources.keys().map(String::as_str)
  }
}
