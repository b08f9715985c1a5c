//! Records persisted in the action queue.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::encoding::hex_bytes;
use crate::error::{Error, Result};

/// Largest attachment accepted by the chat server.
pub const MAX_ATTACHMENT_BYTES: usize = 10 * 1024 * 1024;

const ALLOWED_EXTENSIONS: &[(&str, &str)] = &[
  ("png", "image/png"),
  ("jpg", "image/jpeg"),
  ("jpeg", "image/jpeg"),
  ("gif", "image/gif"),
  ("webp", "image/webp"),
];

/// A chat message as typed by the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
  pub message: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub user_name: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub user_region: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub language: Option<String>,
}

impl ChatMessage {
  pub fn new(message: impl Into<String>) -> Self {
    Self {
      message: message.into(),
      user_name: None,
      user_region: None,
      language: None,
    }
  }
}

/// Image sent along with a chat message.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
  pub file_name: String,
  pub mime_type: String,
  #[serde(with = "hex_bytes")]
  pub data: Vec<u8>,
}

impl std::fmt::Debug for Attachment {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Attachment")
      .field("file_name", &self.file_name)
      .field("mime_type", &self.mime_type)
      .field("len", &self.data.len())
      .finish()
  }
}

impl Attachment {
  /// Build a validated attachment, deriving the MIME type from the file
  /// extension.
  pub fn new(file_name: impl Into<String>, data: Vec<u8>) -> Result<Self> {
    let file_name = file_name.into();
    let mime_type = mime_for(&file_name)
      .ok_or_else(|| unsupported_type(&file_name))?
      .to_string();
    let attachment = Self {
      file_name,
      mime_type,
      data,
    };
    attachment.validate()?;
    Ok(attachment)
  }

  pub async fn from_path(path: &Path) -> Result<Self> {
    let file_name = path
      .file_name()
      .and_then(|n| n.to_str())
      .ok_or_else(|| Error::InvalidAttachment(format!("{}: not a file", path.display())))?
      .to_string();
    let data = tokio::fs::read(path)
      .await
      .map_err(|e| Error::InvalidAttachment(format!("{}: {}", path.display(), e)))?;
    Self::new(file_name, data)
  }

  pub fn validate(&self) -> Result<()> {
    if self.data.is_empty() {
      return Err(Error::InvalidAttachment(format!("{} is empty", self.file_name)));
    }
    if self.data.len() > MAX_ATTACHMENT_BYTES {
      return Err(Error::InvalidAttachment(format!(
        "{} is {} bytes, limit is {}",
        self.file_name,
        self.data.len(),
        MAX_ATTACHMENT_BYTES
      )));
    }
    if mime_for(&self.file_name).is_none() {
      return Err(unsupported_type(&self.file_name));
    }
    Ok(())
  }
}

fn unsupported_type(file_name: &str) -> Error {
  Error::InvalidAttachment(format!(
    "{}: only png, jpg, jpeg, gif and webp are allowed",
    file_name
  ))
}

fn mime_for(file_name: &str) -> Option<&'static str> {
  let (_, extension) = file_name.rsplit_once('.')?;
  let extension = extension.to_ascii_lowercase();
  ALLOWED_EXTENSIONS
    .iter()
    .find(|(ext, _)| *ext == extension)
    .map(|(_, mime)| *mime)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
  Pending,
  Failed,
}

impl ActionStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      ActionStatus::Pending => "pending",
      ActionStatus::Failed => "failed",
    }
  }
}

/// A chat message waiting for server confirmation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedAction {
  /// Assigned by the store on first insert
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub id: Option<i64>,
  pub content: ChatMessage,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub attachment: Option<Attachment>,
  pub created_at: i64,
  pub status: ActionStatus,
  pub retry_count: u32,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub last_error: Option<String>,
}

impl QueuedAction {
  pub fn new(content: ChatMessage, attachment: Option<Attachment>, created_at: i64) -> Self {
    Self {
      id: None,
      content,
      attachment,
      created_at,
      status: ActionStatus::Pending,
      retry_count: 0,
      last_error: None,
    }
  }

  /// Record a failed attempt. Returns true when the retry budget is spent.
  pub fn record_failure(&mut self, error: impl Into<String>, max_retries: u32) -> bool {
    self.retry_count += 1;
    self.last_error = Some(error.into());
    if self.retry_count >= max_retries {
      self.status = ActionStatus::Failed;
      true
    } else {
      false
    }
  }

  pub fn reset(&mut self) {
    self.status = ActionStatus::Pending;
    self.retry_count = 0;
    self.last_error = None;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_attachment_validation() {
    let ok = Attachment::new("leaf.JPG", vec![0xff, 0xd8]).unwrap();
    assert_eq!(ok.mime_type, "image/jpeg");

    assert!(matches!(
      Attachment::new("leaf.png", Vec::new()),
      Err(Error::InvalidAttachment(_))
    ));
    assert!(matches!(
      Attachment::new("notes.pdf", vec![1]),
      Err(Error::InvalidAttachment(_))
    ));
    assert!(matches!(
      Attachment::new("leaf", vec![1]),
      Err(Error::InvalidAttachment(_))
    ));
    assert!(matches!(
      Attachment::new("huge.webp", vec![0; MAX_ATTACHMENT_BYTES + 1]),
      Err(Error::InvalidAttachment(_))
    ));
    assert!(Attachment::new("max.webp", vec![0; MAX_ATTACHMENT_BYTES]).is_ok());
  }

  #[test]
  fn test_record_layout() {
    let mut action = QueuedAction::new(
      ChatMessage::new("When should I plant maize?"),
      Some(Attachment::new("leaf.png", vec![0xab, 0x01]).unwrap()),
      1_717_228_800_000,
    );
    action.id = Some(7);

    assert_eq!(
      serde_json::to_value(&action).unwrap(),
      json!({
        "id": 7,
        "content": {"message": "When should I plant maize?"},
        "attachment": {"fileName": "leaf.png", "mimeType": "image/png", "data": "ab01"},
        "createdAt": 1_717_228_800_000i64,
        "status": "pending",
        "retryCount": 0
      })
    );
  }

  #[test]
  fn test_failure_becomes_terminal_at_budget() {
    let mut action = QueuedAction::new(ChatMessage::new("hi"), None, 0);
    assert!(!action.record_failure("timeout", 3));
    assert!(!action.record_failure("timeout", 3));
    assert_eq!(action.status, ActionStatus::Pending);
    assert!(action.record_failure("timeout", 3));
    assert_eq!(action.status, ActionStatus::Failed);
    assert_eq!(action.retry_count, 3);

    action.reset();
    assert_eq!(action.status, ActionStatus::Pending);
    assert_eq!(action.retry_count, 0);
    assert_eq!(action.last_error, None);
  }
}
