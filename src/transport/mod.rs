//! Transport and decoder boundaries.
//!
//! The engine builds a [`Request`], hands it to a [`Transport`] and decodes
//! the returned bytes with a [`Decoder`]. Both are traits so tests and
//! embedders can substitute their own.

mod http;

use futures::future::BoxFuture;
use serde_json::Value;
use std::fmt;
use url::Url;

use crate::cache::Params;
use crate::error::{SyncError, TransportError};
use crate::repository::Identity;

pub use http::HttpTransport;

/// HTTP method of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Method {
  #[default]
  Get,
  Post,
  Put,
  Patch,
  Delete,
}

impl Method {
  pub fn as_str(&self) -> &'static str {
    match self {
      Method::Get => "GET",
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Patch => "PATCH",
      Method::Delete => "DELETE",
    }
  }

  /// Whether params travel in the query string rather than the body.
  pub fn params_in_query(&self) -> bool {
    matches!(self, Method::Get | Method::Delete)
  }

  pub fn parse(method: &str) -> Option<Self> {
    match method.to_ascii_uppercase().as_str() {
      "GET" => Some(Method::Get),
      "POST" => Some(Method::Post),
      "PUT" => Some(Method::Put),
      "PATCH" => Some(Method::Patch),
      "DELETE" => Some(Method::Delete),
      _ => None,
    }
  }
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// An outbound request, before params are encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
  pub method: Method,
  pub url: String,
  pub params: Params,
  pub headers: Vec<(String, String)>,
}

impl Request {
  pub fn new(method: Method, url: impl Into<String>, params: Params) -> Self {
    Self {
      method,
      url: url.into(),
      params,
      headers: vec![("Accept".to_string(), "application/json".to_string())],
    }
  }

  /// Set a header, replacing any previous value of the same name.
  pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
    let name = name.into();
    self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(&name));
    self.headers.push((name, value.into()));
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }
}

/// Raw response: status code plus undecoded body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      body: body.into(),
    }
  }
}

/// Executes requests. Implementations enforce their own timeouts.
pub trait Transport: Send + Sync {
  fn execute(&self, request: Request) -> BoxFuture<'_, Result<Response, TransportError>>;
}

/// Turns response bytes into a generic JSON tree.
pub trait Decoder: Send + Sync {
  fn decode(&self, body: &[u8]) -> Result<Value, SyncError>;
}

/// `serde_json` decoder. An empty body decodes to `null`.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonDecoder;

impl Decoder for JsonDecoder {
  fn decode(&self, body: &[u8]) -> Result<Value, SyncError> {
    if body.iter().all(u8::is_ascii_whitespace) {
      return Ok(Value::Null);
    }
    serde_json::from_slice(body).map_err(|e| SyncError::Decode(e.to_string()))
  }
}

/// `base + endpoint [+ "/" + id]`, with exactly one slash at each joint.
/// The id is percent-encoded as a single path segment.
pub fn endpoint_url(base: &str, endpoint: &str, id: Option<&Identity>) -> String {
  let mut joined = base.trim_end_matches('/').to_string();
  let endpoint = endpoint.trim_end_matches('/');
  if !endpoint.is_empty() {
    if !endpoint.starts_with('/') {
      joined.push('/');
    }
    joined.push_str(endpoint);
  }

  let Some(id) = id else {
    return joined;
  };
  match Url::parse(&joined) {
    Ok(mut url) => {
      if let Ok(mut segments) = url.path_segments_mut() {
        segments.pop_if_empty().push(id.as_str());
      }
      url.into()
    }
    // Left for the transport to reject
    Err(_) => format!("{}/{}", joined, id),
  }
}
