//! reqwest-backed network boundary for reads.

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use std::time::Duration;

use crate::cache::{Fetch, ProxyRequest, ProxyResponse};
use crate::error::NetworkError;

/// Build the shared HTTP client. Every request is bounded by `timeout` so a
/// hung connection cannot stall a sync sweep.
pub fn build_client(timeout: Duration) -> Result<reqwest::Client, NetworkError> {
  reqwest::Client::builder()
    .timeout(timeout)
    .connect_timeout(timeout)
    .user_agent(concat!("agrisync/", env!("CARGO_PKG_VERSION")))
    .build()
    .map_err(|e| NetworkError::unreachable(format!("failed to build HTTP client: {}", e)))
}

/// [`Fetch`] over a reqwest client.
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
}

impl HttpFetcher {
  pub fn new(client: reqwest::Client) -> Self {
    Self { client }
  }
}

#[async_trait]
impl Fetch for HttpFetcher {
  async fn fetch(&self, request: &ProxyRequest) -> Result<ProxyResponse, NetworkError> {
    let response = self
      .client
      .request(request.method.clone(), request.url.clone())
      .send()
      .await?;

    let status = response.status().as_u16();
    let content_type = response
      .headers()
      .get(CONTENT_TYPE)
      .and_then(|v| v.to_str().ok())
      .map(String::from);
    let body = response.bytes().await?;

    tracing::trace!(url = %request.url, status, "Fetched");
    Ok(ProxyResponse::from_network(status, content_type, body.to_vec()))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::ResponseSource;
  use url::Url;
  use wiremock::matchers::{method, path};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  #[tokio::test]
  async fn test_fetch_returns_error_statuses_as_responses() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/api/v1/knowledge/crops"))
      .respond_with(
        ResponseTemplate::new(200).set_body_raw(r#"{"crops":["maize"]}"#, "application/json"),
      )
      .mount(&server)
      .await;
    Mock::given(method("GET"))
      .and(path("/broken"))
      .respond_with(ResponseTemplate::new(500))
      .mount(&server)
      .await;

    let fetcher = HttpFetcher::new(build_client(Duration::from_secs(5)).unwrap());
    let base = Url::parse(&server.uri()).unwrap();

    let ok = fetcher
      .fetch(&ProxyRequest::get(base.join("/api/v1/knowledge/crops").unwrap()))
      .await
      .unwrap();
    assert_eq!(ok.status, 200);
    assert_eq!(ok.source, ResponseSource::Network);
    assert_eq!(ok.content_type.as_deref(), Some("application/json"));
    assert_eq!(ok.json::<serde_json::Value>().unwrap()["crops"][0], "maize");

    let broken = fetcher
      .fetch(&ProxyRequest::get(base.join("/broken").unwrap()))
      .await
      .unwrap();
    assert_eq!(broken.status, 500);
  }

  #[tokio::test]
  async fn test_unreachable_host_is_network_error() {
    let fetcher = HttpFetcher::new(build_client(Duration::from_millis(500)).unwrap());
    // Port 9 (discard) on localhost is not expected to accept HTTP.
    let request = ProxyRequest::get(Url::parse("http://127.0.0.1:9/").unwrap());
    let err = fetcher.fetch(&request).await.unwrap_err();
    assert!(matches!(err, NetworkError::NetworkUnreachable(_)));
  }
}
