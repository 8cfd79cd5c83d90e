//! reqwest-backed transport.

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::{Request, Response, Transport};
use crate::error::TransportError;

/// HTTP transport over a shared `reqwest::Client`.
#[derive(Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
}

impl HttpTransport {
  /// Create a transport with a 30 second request timeout.
  pub fn new() -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(30))
      .user_agent(concat!("refetch/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

/// Final URL of a request: params go into the query string for methods
/// that carry no body.
pub(crate) fn request_url(request: &Request) -> Result<Url, TransportError> {
  let mut url = Url::parse(&request.url)
    .map_err(|e| TransportError(format!("invalid URL {}: {}", request.url, e)))?;
  if request.method.params_in_query() && !request.params.is_empty() {
    url.query_pairs_mut().extend_pairs(request.params.iter());
  }
  Ok(url)
}

impl Transport for HttpTransport {
  fn execute(&self, request: Request) -> BoxFuture<'_, Result<Response, TransportError>> {
    Box::pin(async move {
      let url = request_url(&request)?;
      let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
        .map_err(|e| TransportError(format!("invalid method: {}", e)))?;

      debug!(method = %request.method, url = %url, "Sending request");

      let mut builder = self.client.request(method, url);
      for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
      }
      if !request.method.params_in_query() && !request.params.is_empty() {
        builder = builder
          .header("Content-Type", "application/x-www-form-urlencoded")
          .body(request.params.encode());
      }

      let response = builder.send().await?;
      let status = response.status().as_u16();
      let body = response.bytes().await?;

      Ok(Response::new(status, body.to_vec()))
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::Params;
  use crate::transport::Method;

  #[test]
  fn test_query_params_are_sorted() {
    let params = Params::new().with("tag", "rust lang").with("page", "2");
    let request = Request::new(Method::Get, "https://api.test/posts", params);
    let url = request_url(&request).unwrap();
    assert_eq!(url.as_str(), "https://api.test/posts?page=2&tag=rust+lang");
  }

  #[test]
  fn test_body_methods_keep_url_clean() {
    let params = Params::new().with("title", "hi");
    let request = Request::new(Method::Post, "https://api.test/posts", params);
    let url = request_url(&request).unwrap();
    assert_eq!(url.as_str(), "https://api.test/posts");
  }

  #[test]
  fn test_invalid_url_is_transport_error() {
    let request = Request::new(Method::Get, "not a url", Params::new());
    assert!(request_url(&request).is_err());
  }
}
