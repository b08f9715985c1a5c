//! Core traits and types for the caching system.

use async_trait::async_trait;
use reqwest::Method;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use url::Url;

use crate::error::NetworkError;

/// Network boundary for reads.
#[async_trait]
pub trait Fetch: Send + Sync {
  /// Perform the request. Any HTTP response, including error statuses, is
  /// `Ok`; `Err` means the network could not be reached.
  async fn fetch(&self, request: &ProxyRequest) -> Result<ProxyResponse, NetworkError>;
}

/// An outbound request seen by the proxy.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
  pub method: Method,
  pub url: Url,
  /// Page navigation (as opposed to a subresource or API call)
  pub navigation: bool,
}

impl ProxyRequest {
  pub fn get(url: Url) -> Self {
    Self {
      method: Method::GET,
      url,
      navigation: false,
    }
  }

  pub fn navigate(url: Url) -> Self {
    Self {
      method: Method::GET,
      url,
      navigation: true,
    }
  }

  /// Stable identity of the request, used as the cache key.
  ///
  /// The fragment never reaches the server and is ignored.
  pub fn cache_key(&self) -> String {
    let mut url = self.url.clone();
    url.set_fragment(None);

    // SHA256 hash for stable, fixed-length keys
    let mut hasher = Sha256::new();
    hasher.update(self.method.as_str().as_bytes());
    hasher.update(b" ");
    hasher.update(url.as_str().as_bytes());
    hex::encode(hasher.finalize())
  }
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  /// Fresh response from the network
  Network,
  /// Stored response served from the cache
  Cache,
  /// The designated offline page, served for a failed navigation
  OfflineFallback,
  /// Built locally because neither network nor cache could answer
  Synthesized,
}

/// A response handed back to the caller.
#[derive(Debug, Clone)]
pub struct ProxyResponse {
  pub status: u16,
  pub content_type: Option<String>,
  pub body: Vec<u8>,
  pub source: ResponseSource,
}

impl ProxyResponse {
  pub fn from_network(status: u16, content_type: Option<String>, body: Vec<u8>) -> Self {
    Self {
      status,
      content_type,
      body,
      source: ResponseSource::Network,
    }
  }

  /// 503 returned when a network-first request has no cached fallback.
  pub fn service_unavailable() -> Self {
    Self {
      status: 503,
      content_type: Some("text/plain".to_string()),
      body: b"Offline - resource not cached".to_vec(),
      source: ResponseSource::Synthesized,
    }
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }

  pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
    serde_json::from_slice(&self.body)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_cache_key_ignores_fragment_but_not_query() {
    let base = ProxyRequest::get(Url::parse("http://h/api/v1/crops?x=1").unwrap());
    let fragment = ProxyRequest::get(Url::parse("http://h/api/v1/crops?x=1#top").unwrap());
    let other = ProxyRequest::get(Url::parse("http://h/api/v1/crops?x=2").unwrap());

    assert_eq!(base.cache_key(), fragment.cache_key());
    assert_ne!(base.cache_key(), other.cache_key());
    assert_eq!(base.cache_key().len(), 64);
  }

  #[test]
  fn test_cache_key_depends_on_method() {
    let url = Url::parse("http://h/chat/message").unwrap();
    let get = ProxyRequest::get(url.clone());
    let post = ProxyRequest {
      method: Method::POST,
      url,
      navigation: false,
    };
    assert_ne!(get.cache_key(), post.cache_key());
  }
}
