//! Attribute values, object references and object snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// Stable identity of a domain object, e.g. the remote numeric id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
  pub fn new(id: impl Into<String>) -> Self {
    Self(id.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  /// Read an identity out of a JSON scalar.
  ///
  /// Integral numbers and non-empty strings qualify; anything else does not.
  pub fn from_json(value: &Value) -> Option<Self> {
    match value {
      Value::Number(n) => {
        if let Some(i) = n.as_i64() {
          Some(Self(i.to_string()))
        } else if let Some(u) = n.as_u64() {
          Some(Self(u.to_string()))
        } else {
          n.as_f64()
            .filter(|f| f.fract() == 0.0)
            .map(|f| Self(format!("{}", f as i64)))
        }
      }
      Value::String(s) if !s.is_empty() => Some(Self(s.clone())),
      _ => None,
    }
  }
}

impl fmt::Display for Identity {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<i64> for Identity {
  fn from(id: i64) -> Self {
    Self(id.to_string())
  }
}

impl From<&str> for Identity {
  fn from(id: &str) -> Self {
    Self(id.to_string())
  }
}

impl From<String> for Identity {
  fn from(id: String) -> Self {
    Self(id)
  }
}

/// Handle to an object in the repository: its entity type plus identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
  pub entity: String,
  pub identity: Identity,
}

impl ObjectRef {
  pub fn new(entity: impl Into<String>, identity: impl Into<Identity>) -> Self {
    Self {
      entity: entity.into(),
      identity: identity.into(),
    }
  }
}

impl fmt::Display for ObjectRef {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}#{}", self.entity, self.identity)
  }
}

/// A typed attribute value as stored in the repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum AttrValue {
  Null,
  String(String),
  Number(f64),
  Integer(i64),
  Boolean(bool),
  Date(DateTime<Utc>),
  /// To-one relation
  Ref(ObjectRef),
  /// To-many relation, in order
  Refs(Vec<ObjectRef>),
  /// Opaque JSON kept verbatim
  Json(Value),
}

impl AttrValue {
  pub fn as_str(&self) -> Option<&str> {
    match self {
      AttrValue::String(s) => Some(s),
      _ => None,
    }
  }

  pub fn as_i64(&self) -> Option<i64> {
    match self {
      AttrValue::Integer(i) => Some(*i),
      _ => None,
    }
  }

  pub fn as_f64(&self) -> Option<f64> {
    match self {
      AttrValue::Number(n) => Some(*n),
      AttrValue::Integer(i) => Some(*i as f64),
      _ => None,
    }
  }

  pub fn as_bool(&self) -> Option<bool> {
    match self {
      AttrValue::Boolean(b) => Some(*b),
      _ => None,
    }
  }

  pub fn as_date(&self) -> Option<DateTime<Utc>> {
    match self {
      AttrValue::Date(d) => Some(*d),
      _ => None,
    }
  }

  /// Ordering used for sorted queries. Nulls sort first; values of
  /// unrelated kinds compare equal so a stable sort keeps their order.
  pub fn sort_cmp(&self, other: &AttrValue) -> Ordering {
    use AttrValue::*;
    match (self, other) {
      (Null, Null) => Ordering::Equal,
      (Null, _) => Ordering::Less,
      (_, Null) => Ordering::Greater,
      (String(a), String(b)) => a.cmp(b),
      (Integer(a), Integer(b)) => a.cmp(b),
      (Boolean(a), Boolean(b)) => a.cmp(b),
      (Date(a), Date(b)) => a.cmp(b),
      (a, b) => match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        _ => Ordering::Equal,
      },
    }
  }

  /// Plain JSON rendering, used for printing snapshots.
  pub fn to_json(&self) -> Value {
    match self {
      AttrValue::Null => Value::Null,
      AttrValue::String(s) => Value::String(s.clone()),
      AttrValue::Number(n) => serde_json::Number::from_f64(*n)
        .map(Value::Number)
        .unwrap_or(Value::Null),
      AttrValue::Integer(i) => Value::from(*i),
      AttrValue::Boolean(b) => Value::Bool(*b),
      AttrValue::Date(d) => Value::String(d.to_rfc3339()),
      AttrValue::Ref(r) => Value::String(r.to_string()),
      AttrValue::Refs(refs) => Value::Array(
        refs
          .iter()
          .map(|r| Value::String(r.to_string()))
          .collect(),
      ),
      AttrValue::Json(v) => v.clone(),
    }
  }
}

/// Point-in-time copy of a repository object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainObject {
  pub entity: String,
  pub identity: Identity,
  pub attributes: BTreeMap<String, AttrValue>,
}

impl DomainObject {
  pub fn new(object: &ObjectRef) -> Self {
    Self {
      entity: object.entity.clone(),
      identity: object.identity.clone(),
      attributes: BTreeMap::new(),
    }
  }

  pub fn object_ref(&self) -> ObjectRef {
    ObjectRef::new(self.entity.clone(), self.identity.clone())
  }

  pub fn get(&self, attribute: &str) -> Option<&AttrValue> {
    self.attributes.get(attribute)
  }

  pub fn to_json(&self) -> Value {
    let mut map = Map::new();
    map.insert("_entity".to_string(), Value::String(self.entity.clone()));
    map.insert(
      "_identity".to_string(),
      Value::String(self.identity.to_string()),
    );
    for (name, value) in &self.attributes {
      map.insert(name.clone(), value.to_json());
    }
    Value::Object(map)
  }
}

/// Stable sort of objects by an attribute; missing attributes sort as null.
/// Ties keep the incoming order, which is the identity order of the query.
pub fn sort_objects(objects: &mut [DomainObject], attribute: Option<&str>) {
  let Some(attribute) = attribute else {
    return;
  };
  objects.sort_by(|a, b| {
    let left = a.get(attribute).unwrap_or(&AttrValue::Null);
    let right = b.get(attribute).unwrap_or(&AttrValue::Null);
    left.sort_cmp(right)
  });
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn object(id: i64, rank: Option<AttrValue>) -> DomainObject {
    let mut obj = DomainObject::new(&ObjectRef::new("Post", id));
    if let Some(rank) = rank {
      obj.attributes.insert("rank".to_string(), rank);
    }
    obj
  }

  #[test]
  fn test_identity_from_json() {
    assert_eq!(Identity::from_json(&json!(7)), Some(Identity::from(7)));
    assert_eq!(Identity::from_json(&json!("abc")), Some(Identity::from("abc")));
    assert_eq!(Identity::from_json(&json!(7.0)), Some(Identity::from(7)));
    assert_eq!(Identity::from_json(&json!(7.5)), None);
    assert_eq!(Identity::from_json(&json!("")), None);
    assert_eq!(Identity::from_json(&json!(null)), None);
  }

  #[test]
  fn test_sort_is_stable_with_nulls_first() {
    let mut objects = vec![
      object(1, Some(AttrValue::Integer(2))),
      object(2, Some(AttrValue::Integer(1))),
      object(3, None),
      object(4, Some(AttrValue::Integer(1))),
    ];
    sort_objects(&mut objects, Some("rank"));
    let ids: Vec<_> = objects.iter().map(|o| o.identity.to_string()).collect();
    assert_eq!(ids, vec!["3", "2", "4", "1"]);
  }

  #[test]
  fn test_sort_without_attribute_keeps_order() {
    let mut objects = vec![object(2, None), object(1, None)];
    sort_objects(&mut objects, None);
    assert_eq!(objects[0].identity, Identity::from(2));
  }

  #[test]
  fn test_mixed_numbers_compare() {
    assert_eq!(
      AttrValue::Integer(2).sort_cmp(&AttrValue::Number(1.5)),
      Ordering::Greater
    );
  }
}
