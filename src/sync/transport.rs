//! Outbound delivery of queued chat messages.

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde_json::{json, Value};
use url::Url;

use super::action::{Attachment, ChatMessage};
use crate::error::NetworkError;

/// Delivers one queued action to the server.
#[async_trait]
pub trait MessageSender: Send + Sync {
  async fn send(
    &self,
    content: &ChatMessage,
    attachment: Option<&Attachment>,
  ) -> Result<(), NetworkError>;
}

/// Posts to the chat server's message endpoints.
#[derive(Clone)]
pub struct HttpMessageSender {
  client: reqwest::Client,
  base_url: Url,
}

impl HttpMessageSender {
  pub fn new(client: reqwest::Client, base_url: Url) -> Self {
    Self { client, base_url }
  }

  fn endpoint(&self, path: &str) -> Result<Url, NetworkError> {
    self
      .base_url
      .join(path)
      .map_err(|e| NetworkError::unreachable(format!("invalid endpoint {}: {}", path, e)))
  }

  fn form(content: &ChatMessage, attachment: &Attachment) -> Result<Form, NetworkError> {
    let image = Part::bytes(attachment.data.clone())
      .file_name(attachment.file_name.clone())
      .mime_str(&attachment.mime_type)
      .map_err(|e| NetworkError::unreachable(format!("invalid attachment type: {}", e)))?;

    let mut form = Form::new().text("message", content.message.clone());
    for (name, value) in profile_fields(content) {
      form = form.text(name, value.to_string());
    }
    Ok(form.part("image", image))
  }
}

fn profile_fields(content: &ChatMessage) -> impl Iterator<Item = (&'static str, &str)> {
  [
    ("user_name", content.user_name.as_deref()),
    ("user_region", content.user_region.as_deref()),
    ("language", content.language.as_deref()),
  ]
  .into_iter()
  .filter_map(|(name, value)| value.map(|v| (name, v)))
}

#[async_trait]
impl MessageSender for HttpMessageSender {
  async fn send(
    &self,
    content: &ChatMessage,
    attachment: Option<&Attachment>,
  ) -> Result<(), NetworkError> {
    let request = match attachment {
      Some(attachment) => self
        .client
        .post(self.endpoint("/chat/message-with-image")?)
        .multipart(Self::form(content, attachment)?),
      None => {
        let mut body = json!({ "message": content.message });
        for (name, value) in profile_fields(content) {
          body[name] = Value::from(value);
        }
        self.client.post(self.endpoint("/chat/message")?).json(&body)
      }
    };

    let response = request.send().await?;

    let status = response.status();
    let body: Option<Value> = response.json().await.ok();
    let message = body
      .as_ref()
      .and_then(|b| b.get("error").or_else(|| b.get("message")))
      .and_then(Value::as_str)
      .map(String::from);

    if !status.is_success() {
      return Err(NetworkError::rejected(
        status.as_u16(),
        message.unwrap_or_else(|| status.to_string()),
      ));
    }

    let declined = body
      .as_ref()
      .and_then(|b| b.get("success"))
      .and_then(Value::as_bool)
      == Some(false);
    if declined {
      return Err(NetworkError::rejected(
        status.as_u16(),
        message.unwrap_or_else(|| "server reported failure".to_string()),
      ));
    }

    tracing::debug!(status = status.as_u16(), "Message delivered");
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::http::build_client;
  use std::time::Duration;
  use wiremock::matchers::{body_json, body_string_contains, header_regex, method, path};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  async fn sender(server: &MockServer) -> HttpMessageSender {
    HttpMessageSender::new(
      build_client(Duration::from_secs(5)).unwrap(),
      Url::parse(&server.uri()).unwrap(),
    )
  }

  #[tokio::test]
  async fn test_plain_message_posts_json() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/chat/message"))
      .and(body_json(json!({
        "message": "How do I treat leaf rust?",
        "user_region": "centre"
      })))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true, "data": {}})))
      .expect(1)
      .mount(&server)
      .await;

    let mut content = ChatMessage::new("How do I treat leaf rust?");
    content.user_region = Some("centre".to_string());
    sender(&server).await.send(&content, None).await.unwrap();
  }

  #[tokio::test]
  async fn test_attachment_posts_multipart() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/chat/message-with-image"))
      .and(header_regex("content-type", "^multipart/form-data"))
      .and(body_string_contains("filename=\"leaf.png\""))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
      .expect(1)
      .mount(&server)
      .await;

    // body_string_contains only matches bodies that are valid UTF-8
    let attachment = Attachment::new("leaf.png", b"fake-png".to_vec()).unwrap();
    sender(&server)
      .await
      .send(&ChatMessage::new("What is this spot?"), Some(&attachment))
      .await
      .unwrap();
  }

  #[tokio::test]
  async fn test_error_status_is_server_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .respond_with(ResponseTemplate::new(503).set_body_json(json!({"error": "overloaded"})))
      .mount(&server)
      .await;

    let err = sender(&server)
      .await
      .send(&ChatMessage::new("hello"), None)
      .await
      .unwrap_err();
    assert_eq!(err, NetworkError::rejected(503, "overloaded"));
  }

  #[tokio::test]
  async fn test_success_false_is_server_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .respond_with(
        ResponseTemplate::new(200)
          .set_body_json(json!({"success": false, "error": "empty message"})),
      )
      .mount(&server)
      .await;

    let err = sender(&server)
      .await
      .send(&ChatMessage::new(""), None)
      .await
      .unwrap_err();
    assert_eq!(err, NetworkError::rejected(200, "empty message"));
  }

  #[tokio::test]
  async fn test_unreachable_server() {
    let sender = HttpMessageSender::new(
      build_client(Duration::from_millis(500)).unwrap(),
      Url::parse("http://127.0.0.1:9").unwrap(),
    );
    let err = sender.send(&ChatMessage::new("hello"), None).await.unwrap_err();
    assert!(matches!(err, NetworkError::NetworkUnreachable(_)));
  }
}
