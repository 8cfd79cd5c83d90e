//! Override points of the sync engine.

use serde_json::Value;
use tracing::debug;

use crate::error::{SyncError, SyncResult};
use crate::mapping::Mapper;
use crate::repository::ObjectRef;
use crate::transport::Request;

/// Customization hooks. Every method has a working default, so an
/// implementation only overrides what its API needs.
pub trait SyncHooks: Send + Sync {
  /// Called before every request; the place to add authentication headers.
  fn will_send_request(&self, _request: &mut Request) {}

  /// Inspect the status code before mapping. Returning an error skips
  /// mapping and delivers that error. By default non-2xx is an error.
  fn on_result(&self, _body: &Value, status: u16) -> Option<SyncError> {
    if (200..300).contains(&status) {
      None
    } else {
      Some(SyncError::status(status))
    }
  }

  /// Extract the item list from a collection response. A list is taken
  /// as-is, `null` is empty, anything else is a single item.
  fn items_from_result(&self, _key: &str, body: Value) -> Vec<Value> {
    match body {
      Value::Array(items) => items,
      Value::Null => Vec::new(),
      other => vec![other],
    }
  }

  /// Locate the mapped object inside a single-object response.
  fn item_from_result(&self, _key: &str, body: Value) -> Value {
    body
  }

  /// Entity type for an item when the resource does not determine one.
  fn entity_name_for_key(&self, _key: &str, _item: &Value) -> Option<String> {
    None
  }

  /// Whether the server has more items after this collection response.
  fn server_has_more(&self, _key: &str, _body: &Value) -> bool {
    false
  }

  /// Return `false` when the hook stored the value itself and the mapper
  /// should leave this attribute alone.
  fn will_set_value(&self, _object: &ObjectRef, _attribute: &str, _value: &Value) -> bool {
    true
  }

  /// Handle a relation attribute or a nested object. The mapper never
  /// stores these itself.
  fn set_special_property(
    &self,
    _mapper: &Mapper<'_>,
    object: &ObjectRef,
    attribute: &str,
    _value: &Value,
  ) -> SyncResult<()> {
    debug!(object = %object, attribute, "No handler for special property");
    Ok(())
  }
}

/// Hooks with every default in place.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHooks;

impl SyncHooks for DefaultHooks {}

/// Default hooks plus a bearer token on every request.
#[derive(Debug, Clone)]
pub struct BearerAuth {
  token: String,
}

impl BearerAuth {
  pub fn new(token: impl Into<String>) -> Self {
    Self {
      token: token.into(),
    }
  }
}

impl SyncHooks for BearerAuth {
  fn will_send_request(&self, request: &mut Request) {
    request.set_header("Authorization", format!("Bearer {}", self.token));
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::Params;
  use crate::transport::Method;
  use serde_json::json;

  #[test]
  fn test_default_item_extraction() {
    let hooks = DefaultHooks;
    assert_eq!(hooks.items_from_result("k", json!([1, 2])).len(), 2);
    assert_eq!(
      hooks.items_from_result("k", json!({"id": 1})),
      vec![json!({"id": 1})]
    );
    assert!(hooks.items_from_result("k", Value::Null).is_empty());
    assert!(!hooks.server_has_more("k", &json!({})));
  }

  #[test]
  fn test_default_status_handling() {
    let hooks = DefaultHooks;
    assert_eq!(hooks.on_result(&Value::Null, 200), None);
    assert_eq!(hooks.on_result(&Value::Null, 204), None);
    assert_eq!(
      hooks.on_result(&Value::Null, 404),
      Some(SyncError::status(404))
    );
  }

  #[test]
  fn test_bearer_auth_sets_header() {
    let mut request = Request::new(Method::Get, "https://api.test", Params::new());
    BearerAuth::new("s3cret").will_send_request(&mut request);
    assert_eq!(request.header("Authorization"), Some("Bearer s3cret"));
  }
}
