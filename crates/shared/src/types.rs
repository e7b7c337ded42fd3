//! Common types used across the help-desk coordinator

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

// =============================================================================
// ID Wrappers
// =============================================================================

/// Visitor ID wrapper
///
/// Opaque identity handed to an anonymous visitor when they join the queue.
/// This is the `userId` the client sees in `assigned_user` and token claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VisitorId(pub Uuid);

impl VisitorId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for VisitorId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for VisitorId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for VisitorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Chat session ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for SessionId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Uploaded file ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(pub Uuid);

impl FileId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for FileId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for FileId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

// =============================================================================
// Identities
// =============================================================================

/// Identity of an anonymous visitor, created when they submit a name to join
/// the queue (or restored from a queue-bypass token). Immutable after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisitorIdentity {
    #[serde(rename = "userId")]
    pub visitor_id: VisitorId,
    #[serde(rename = "firstName")]
    pub first_name: String,
    #[serde(rename = "lastName")]
    pub last_name: String,
}

impl VisitorIdentity {
    pub fn new(first_name: impl Into<String>, last_name: impl Into<String>) -> Self {
        Self {
            visitor_id: VisitorId::new(),
            first_name: first_name.into(),
            last_name: last_name.into(),
        }
    }
}

/// Identity of a support agent, sourced from the external auth collaborator.
/// The coordinator only holds the username as a foreign key plus presence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentIdentity {
    pub username: String,
    #[serde(rename = "firstName")]
    pub first_name: String,
    #[serde(rename = "lastName")]
    pub last_name: String,
    #[serde(rename = "isAdmin")]
    pub is_admin: bool,
}

// =============================================================================
// Messages
// =============================================================================

/// Which side of a session authored a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderKind {
    Visitor,
    Agent,
}

/// Reference to a stored file attachment.
///
/// The binary payload lives in the external blob store and is never part of
/// in-memory transcript state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    #[serde(rename = "fileId")]
    pub file_id: FileId,
    #[serde(rename = "fileName")]
    pub file_name: String,
    #[serde(rename = "fileType")]
    pub mime_type: String,
}

/// Message payload: plain text or a file reference
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageBody {
    Text(String),
    File(FileRef),
}

/// A single transcript entry. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub sender: SenderKind,
    pub body: MessageBody,
    /// Unix milliseconds, the client compares these numerically
    pub timestamp: i64,
}

impl Message {
    pub fn text(sender: SenderKind, body: impl Into<String>) -> Self {
        Self {
            sender,
            body: MessageBody::Text(body.into()),
            timestamp: now_millis(),
        }
    }

    pub fn file(sender: SenderKind, file: FileRef) -> Self {
        Self {
            sender,
            body: MessageBody::File(file),
            timestamp: now_millis(),
        }
    }
}

/// Current unix time in milliseconds
pub fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

// =============================================================================
// State machines
// =============================================================================

/// Lifecycle of a chat session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Created,
    Active,
    Ended,
    Transferred,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_visitor_identity_wire_names() {
        let identity = VisitorIdentity::new("Jane", "Doe");
        let json = serde_json::to_value(&identity).unwrap();
        assert!(json.get("userId").is_some());
        assert_eq!(json["firstName"], "Jane");
        assert_eq!(json["lastName"], "Doe");
    }

    #[test]
    fn test_message_body_untagged() {
        let msg = Message::text(SenderKind::Agent, "hi");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["body"], "hi");
        assert_eq!(json["sender"], "agent");

        let file_msg = Message::file(
            SenderKind::Visitor,
            FileRef {
                file_id: FileId::new(),
                file_name: "receipt.pdf".to_string(),
                mime_type: "application/pdf".to_string(),
            },
        );
        let json = serde_json::to_value(&file_msg).unwrap();
        assert_eq!(json["body"]["fileName"], "receipt.pdf");
    }

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(VisitorId::new(), VisitorId::new());
        assert_ne!(SessionId::new(), SessionId::new());
    }

    #[test]
    fn test_now_millis_monotonic_enough() {
        let a = now_millis();
        let b = now_millis();
        assert!(b >= a);
    }
}
