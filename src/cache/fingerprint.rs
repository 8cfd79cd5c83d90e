//! Request parameters and their order-independent fingerprint.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

use crate::repository::Identity;

/// Request parameters. Always iterated in key order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Params(BTreeMap<String, String>);

impl Params {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    self.insert(key, value);
    self
  }

  pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
    self.0.insert(key.into(), value.into());
  }

  pub fn get(&self, key: &str) -> Option<&str> {
    self.0.get(key).map(String::as_str)
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
    self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
  }

  /// Parse a `key=value` pair as given on a command line.
  pub fn parse_pair(pair: &str) -> Option<(String, String)> {
    let (key, value) = pair.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
      return None;
    }
    Some((key.to_string(), value.to_string()))
  }

  /// `application/x-www-form-urlencoded` encoding, keys sorted.
  pub fn encode(&self) -> String {
    url::form_urlencoded::Serializer::new(String::new())
      .extend_pairs(self.iter())
      .finish()
  }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Params {
  fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
    Self(
      iter
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect(),
    )
  }
}

/// Stable, fixed-length key for a set of request parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
  /// Fingerprint of a collection request.
  pub fn of(params: &Params) -> Self {
    Self::hash(&format!("many?{}", params.encode()))
  }

  /// Fingerprint of a single-object request.
  pub fn of_item(identity: &Identity, params: &Params) -> Self {
    Self::hash(&format!("one/{}?{}", identity, params.encode()))
  }

  /// Rebuild a fingerprint read back from storage.
  pub fn from_stored(value: String) -> Self {
    Self(value)
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  // SHA256 hash for stable, fixed-length keys
  fn hash(input: &str) -> Self {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    Self(hex::encode(hasher.finalize()))
  }
}

impl fmt::Display for Fingerprint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    // Short form is enough to tell requests apart in logs
    f.write_str(&self.0[..self.0.len().min(12)])
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_fingerprint_ignores_insertion_order() {
    let a = Params::new().with("page", "2").with("tag", "rust");
    let b = Params::new().with("tag", "rust").with("page", "2");
    assert_eq!(Fingerprint::of(&a), Fingerprint::of(&b));
    assert_ne!(Fingerprint::of(&a), Fingerprint::of(&Params::new()));
  }

  #[test]
  fn test_item_fingerprint_differs_from_collection() {
    let params = Params::new();
    assert_ne!(
      Fingerprint::of(&params),
      Fingerprint::of_item(&Identity::from(7), &params)
    );
    assert_ne!(
      Fingerprint::of_item(&Identity::from(7), &params),
      Fingerprint::of_item(&Identity::from(8), &params)
    );
  }

  #[test]
  fn test_encode_sorts_and_escapes() {
    let params: Params = [("q", "a b&c"), ("after", "10")].into_iter().collect();
    assert_eq!(params.encode(), "after=10&q=a+b%26c");
  }

  #[test]
  fn test_parse_pair() {
    assert_eq!(
      Params::parse_pair("page=2"),
      Some(("page".into(), "2".into()))
    );
    assert_eq!(Params::parse_pair("q=a=b"), Some(("q".into(), "a=b".into())));
    assert_eq!(Params::parse_pair("=x"), None);
    assert_eq!(Params::parse_pair("flag"), None);
  }
}
