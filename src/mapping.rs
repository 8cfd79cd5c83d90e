//! JSON → repository object mapping.
//!
//! The mapper walks the attribute table of the target entity, reads each
//! attribute's JSON key from the item, coerces the scalar to the declared
//! kind and stores it. Relation attributes, and nested objects under any
//! non-JSON attribute, are handed to [`SyncHooks::set_special_property`]
//! instead, which usually recurses back into [`Mapper::map`].

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value;
use tracing::{trace, warn};

use crate::error::{SyncError, SyncResult};
use crate::registry::{AttributeKind, ResourceDescriptor, ResourceRegistry};
use crate::repository::{AttrValue, Identity, ObjectRef, ObjectRepository};
use crate::sync::SyncHooks;

/// Maps decoded items into repository objects.
pub struct Mapper<'a> {
  registry: &'a ResourceRegistry,
  repository: &'a dyn ObjectRepository,
  hooks: &'a dyn SyncHooks,
}

impl<'a> Mapper<'a> {
  pub fn new(
    registry: &'a ResourceRegistry,
    repository: &'a dyn ObjectRepository,
    hooks: &'a dyn SyncHooks,
  ) -> Self {
    Self {
      registry,
      repository,
      hooks,
    }
  }

  pub fn repository(&self) -> &'a dyn ObjectRepository {
    self.repository
  }

  pub fn registry(&self) -> &'a ResourceRegistry {
    self.registry
  }

  /// Concrete entity type for an item of `descriptor`'s resource.
  ///
  /// Tries the descriptor's fixed type or selector, then the
  /// `entity_name_for_key` hook. The result must be a registered type the
  /// resource accepts.
  pub fn resolve_entity(&self, descriptor: &ResourceDescriptor, item: &Value) -> SyncResult<String> {
    let entity = descriptor
      .select_entity(item)
      .or_else(|| self.hooks.entity_name_for_key(&descriptor.key, item))
      .ok_or_else(|| {
        SyncError::Mapping(format!(
          "cannot determine entity type for item of {}",
          descriptor.key
        ))
      })?;

    if self.registry.entity(&entity).is_none() || !descriptor.accepts(&entity) {
      return Err(SyncError::Mapping(format!(
        "resource {} cannot map into entity {}",
        descriptor.key, entity
      )));
    }
    Ok(entity)
  }

  /// Map one JSON object into the `entity` object with the same identity,
  /// creating it if needed. Returns the object's reference.
  pub fn map(&self, item: &Value, entity: &str) -> SyncResult<ObjectRef> {
    let schema = self
      .registry
      .entity(entity)
      .ok_or_else(|| SyncError::Mapping(format!("unknown entity {}", entity)))?;

    let fields = item
      .as_object()
      .ok_or_else(|| SyncError::Mapping(format!("{} item is not a JSON object", entity)))?;

    let identity = fields
      .get(schema.identity_json_key())
      .and_then(Identity::from_json)
      .ok_or_else(|| {
        SyncError::Mapping(format!(
          "{} item has no usable identity in \"{}\"",
          entity,
          schema.identity_json_key()
        ))
      })?;

    let object = self
      .repository
      .find_or_create(entity, &identity)
      .map_err(SyncError::storage)?;

    for attribute in &schema.attributes {
      let Some(value) = fields.get(attribute.json_key()) else {
        continue;
      };

      if attribute.is_relation() || (value.is_object() && attribute.kind != AttributeKind::Json) {
        self
          .hooks
          .set_special_property(self, &object, &attribute.name, value)?;
        continue;
      }

      if !self.hooks.will_set_value(&object, &attribute.name, value) {
        trace!(object = %object, attribute = %attribute.name, "Attribute handled by hook");
        continue;
      }

      match coerce(value, attribute.kind) {
        Some(AttrValue::Null) if attribute.required => {
          return Err(SyncError::Mapping(format!(
            "{}.{} is required but null",
            entity, attribute.name
          )));
        }
        Some(coerced) => self
          .repository
          .set(&object, &attribute.name, coerced)
          .map_err(SyncError::storage)?,
        None if attribute.required => {
          return Err(SyncError::Mapping(format!(
            "cannot read {}.{} as {:?} from {}",
            entity, attribute.name, attribute.kind, value
          )));
        }
        None => {
          warn!(
            object = %object,
            attribute = %attribute.name,
            kind = ?attribute.kind,
            "Skipping value that does not coerce"
          );
        }
      }
    }

    Ok(object)
  }
}

/// Coerce a JSON value to an attribute kind. `null` coerces to
/// [`AttrValue::Null`] for every kind; `None` means the value does not fit.
pub fn coerce(value: &Value, kind: AttributeKind) -> Option<AttrValue> {
  if value.is_null() {
    return Some(AttrValue::Null);
  }

  match kind {
    AttributeKind::String => match value {
      Value::String(s) => Some(AttrValue::String(s.clone())),
      Value::Number(n) => Some(AttrValue::String(n.to_string())),
      Value::Bool(b) => Some(AttrValue::String(b.to_string())),
      _ => None,
    },
    AttributeKind::Number => match value {
      Value::Number(n) => n.as_f64().map(AttrValue::Number),
      Value::String(s) => s.trim().parse::<f64>().ok().map(AttrValue::Number),
      _ => None,
    },
    AttributeKind::Integer => match value {
      Value::Number(n) => n
        .as_i64()
        .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
        .map(AttrValue::Integer),
      Value::String(s) => s.trim().parse::<i64>().ok().map(AttrValue::Integer),
      _ => None,
    },
    AttributeKind::Boolean => match value {
      Value::Bool(b) => Some(AttrValue::Boolean(*b)),
      Value::Number(n) => match n.as_i64() {
        Some(0) => Some(AttrValue::Boolean(false)),
        Some(1) => Some(AttrValue::Boolean(true)),
        _ => None,
      },
      Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Some(AttrValue::Boolean(true)),
        "false" | "no" | "0" => Some(AttrValue::Boolean(false)),
        _ => None,
      },
      _ => None,
    },
    AttributeKind::Date => match value {
      Value::String(s) => parse_date(s).map(AttrValue::Date),
      Value::Number(n) => {
        let secs = n.as_f64()?;
        let whole = secs.floor();
        let nanos = ((secs - whole) * 1e9).round() as u32;
        DateTime::from_timestamp(whole as i64, nanos.min(999_999_999)).map(AttrValue::Date)
      }
      _ => None,
    },
    AttributeKind::Json => Some(AttrValue::Json(value.clone())),
    AttributeKind::Relation => None,
  }
}

/// Parse the date formats commonly seen in JSON APIs.
fn parse_date(s: &str) -> Option<DateTime<Utc>> {
  let s = s.trim();
  if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
    return Some(dt.with_timezone(&Utc));
  }
  // SQL-style and zone-less ISO timestamps are taken as UTC
  for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f"] {
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, format) {
      return Some(dt.and_utc());
    }
  }
  NaiveDate::parse_from_str(s, "%Y-%m-%d")
    .ok()
    .and_then(|d| d.and_hms_opt(0, 0, 0))
    .map(|dt| dt.and_utc())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::registry::{AttributeDescriptor, EntitySchema};
  use crate::repository::InMemoryRepository;
  use crate::sync::DefaultHooks;
  use chrono::TimeZone;
  use serde_json::json;
  use std::sync::Mutex;

  fn registry() -> ResourceRegistry {
    let mut registry = ResourceRegistry::new(None);
    registry
      .register_entities([
        EntitySchema::new("Post", "id")
          .attribute(AttributeDescriptor::new("id", AttributeKind::Integer))
          .attribute(AttributeDescriptor::new("title", AttributeKind::String).required())
          .attribute(AttributeDescriptor::new("score", AttributeKind::Number))
          .attribute(AttributeDescriptor::new("published", AttributeKind::Boolean))
          .attribute(AttributeDescriptor::new("created", AttributeKind::Date))
          .attribute(AttributeDescriptor::new("body_text", AttributeKind::String).from_key("body"))
          .attribute(AttributeDescriptor::new("meta", AttributeKind::Json))
          .attribute(AttributeDescriptor::new("author", AttributeKind::Relation)),
        EntitySchema::new("User", "id")
          .attribute(AttributeDescriptor::new("id", AttributeKind::Integer))
          .attribute(AttributeDescriptor::new("name", AttributeKind::String)),
      ])
      .unwrap();
    registry
  }

  /// Hooks that map nested authors as `User` objects and refuse to touch
  /// the `score` attribute.
  #[derive(Default)]
  struct AuthorHooks {
    special: Mutex<Vec<String>>,
  }

  impl SyncHooks for AuthorHooks {
    fn will_set_value(&self, _object: &ObjectRef, attribute: &str, _value: &Value) -> bool {
      attribute != "score"
    }

    fn set_special_property(
      &self,
      mapper: &Mapper<'_>,
      object: &ObjectRef,
      attribute: &str,
      value: &Value,
    ) -> SyncResult<()> {
      self.special.lock().unwrap().push(attribute.to_string());
      if attribute == "author" {
        let author = mapper.map(value, "User")?;
        mapper
          .repository()
          .set(object, attribute, AttrValue::Ref(author))
          .map_err(SyncError::storage)?;
      }
      Ok(())
    }
  }

  #[test]
  fn test_scalars_round_trip() {
    let registry = registry();
    let repo = InMemoryRepository::new();
    let mapper = Mapper::new(&registry, &repo, &DefaultHooks);

    let item = json!({
      "id": 7,
      "title": "Hello",
      "score": 4.5,
      "published": true,
      "created": "2024-05-01T12:00:00Z",
      "body": "text",
      "ignored": "x"
    });
    let post = mapper.map(&item, "Post").unwrap();
    assert_eq!(post, ObjectRef::new("Post", 7));

    let get = |name: &str| repo.get(&post, name).unwrap();
    assert_eq!(get("id"), Some(AttrValue::Integer(7)));
    assert_eq!(get("title"), Some(AttrValue::String("Hello".into())));
    assert_eq!(get("score"), Some(AttrValue::Number(4.5)));
    assert_eq!(get("published"), Some(AttrValue::Boolean(true)));
    assert_eq!(
      get("created"),
      Some(AttrValue::Date(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()))
    );
    assert_eq!(get("body_text"), Some(AttrValue::String("text".into())));
    assert_eq!(get("ignored"), None);
  }

  #[test]
  fn test_mapping_twice_updates_same_object() {
    let registry = registry();
    let repo = InMemoryRepository::new();
    let mapper = Mapper::new(&registry, &repo, &DefaultHooks);

    mapper.map(&json!({"id": 1, "title": "first"}), "Post").unwrap();
    repo.save().unwrap();
    let post = mapper.map(&json!({"id": 1, "title": "second"}), "Post").unwrap();
    repo.save().unwrap();

    assert_eq!(repo.len(), 1);
    assert_eq!(
      repo.get(&post, "title").unwrap(),
      Some(AttrValue::String("second".into()))
    );
  }

  #[test]
  fn test_relations_and_nested_objects_go_to_hook() {
    let registry = registry();
    let repo = InMemoryRepository::new();
    let hooks = AuthorHooks::default();
    let mapper = Mapper::new(&registry, &repo, &hooks);

    let item = json!({
      "id": 1,
      "title": "t",
      "score": 9,
      "author": {"id": 42, "name": "Ada"},
      "body": {"html": "<p>"},
      "meta": {"views": 3}
    });
    let post = mapper.map(&item, "Post").unwrap();
    repo.save().unwrap();

    assert_eq!(*hooks.special.lock().unwrap(), vec!["body_text", "author"]);
    assert_eq!(
      repo.get(&post, "author").unwrap(),
      Some(AttrValue::Ref(ObjectRef::new("User", 42)))
    );
    let author = repo.find(&ObjectRef::new("User", 42)).unwrap().unwrap();
    assert_eq!(author.get("name"), Some(&AttrValue::String("Ada".into())));
    // will_set_value declined
    assert_eq!(repo.get(&post, "score").unwrap(), None);
    // JSON attributes keep nested objects
    assert_eq!(
      repo.get(&post, "meta").unwrap(),
      Some(AttrValue::Json(json!({"views": 3})))
    );
  }

  #[test]
  fn test_required_attribute_failures() {
    let registry = registry();
    let repo = InMemoryRepository::new();
    let mapper = Mapper::new(&registry, &repo, &DefaultHooks);

    let null_title = mapper.map(&json!({"id": 1, "title": null}), "Post");
    assert!(matches!(null_title, Err(SyncError::Mapping(_))));

    let array_title = mapper.map(&json!({"id": 2, "title": [1]}), "Post");
    assert!(matches!(array_title, Err(SyncError::Mapping(_))));

    // Optional attributes that do not coerce are skipped
    let post = mapper
      .map(&json!({"id": 3, "title": "ok", "published": "maybe"}), "Post")
      .unwrap();
    assert_eq!(repo.get(&post, "published").unwrap(), None);
  }

  #[test]
  fn test_identity_and_shape_errors() {
    let registry = registry();
    let repo = InMemoryRepository::new();
    let mapper = Mapper::new(&registry, &repo, &DefaultHooks);

    assert!(matches!(
      mapper.map(&json!({"title": "x"}), "Post"),
      Err(SyncError::Mapping(_))
    ));
    assert!(matches!(
      mapper.map(&json!([1, 2]), "Post"),
      Err(SyncError::Mapping(_))
    ));
    assert!(matches!(
      mapper.map(&json!({"id": 1}), "Comment"),
      Err(SyncError::Mapping(_))
    ));
  }

  #[test]
  fn test_coercions() {
    use AttributeKind::*;
    assert_eq!(coerce(&json!(12), String), Some(AttrValue::String("12".into())));
    assert_eq!(coerce(&json!("2.5"), Number), Some(AttrValue::Number(2.5)));
    assert_eq!(coerce(&json!(3.0), Integer), Some(AttrValue::Integer(3)));
    assert_eq!(coerce(&json!(3.2), Integer), None);
    assert_eq!(coerce(&json!(" 17 "), Integer), Some(AttrValue::Integer(17)));
    assert_eq!(coerce(&json!(0), Boolean), Some(AttrValue::Boolean(false)));
    assert_eq!(coerce(&json!("Yes"), Boolean), Some(AttrValue::Boolean(true)));
    assert_eq!(coerce(&json!(2), Boolean), None);
    assert_eq!(coerce(&json!(null), Date), Some(AttrValue::Null));
    assert_eq!(coerce(&json!({"a": 1}), Relation), None);

    let noon = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
    assert_eq!(coerce(&json!("2024-05-01 12:00:00"), Date), Some(AttrValue::Date(noon)));
    assert_eq!(
      coerce(&json!("2024-05-01T14:00:00+02:00"), Date),
      Some(AttrValue::Date(noon))
    );
    assert_eq!(coerce(&json!(noon.timestamp()), Date), Some(AttrValue::Date(noon)));
    assert_eq!(
      coerce(&json!("2024-05-01"), Date),
      Some(AttrValue::Date(Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()))
    );
    assert_eq!(coerce(&json!("yesterday"), Date), None);
  }
}
