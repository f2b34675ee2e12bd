//! Core types for the notification hub.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Opaque user identity. Nothing validates it; any string is accepted.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        UserId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserId({})", self.0)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        UserId(s.to_string())
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        UserId(s)
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or_default();
        Timestamp(micros)
    }

    /// Build from whole seconds, as carried on the wire.
    pub fn from_unix_secs(secs: i64) -> Self {
        Timestamp(secs.saturating_mul(1_000_000))
    }

    /// Whole seconds, truncating sub-second precision.
    pub fn as_unix_secs(self) -> i64 {
        self.0.div_euclid(1_000_000)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Fields shared by every update.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct UpdateMeta {
    /// When the event happened (assigned by the producer).
    pub timestamp: Timestamp,
    /// Who must receive it. May be empty.
    pub audience: Vec<UserId>,
}

impl UpdateMeta {
    pub fn new(timestamp: Timestamp, audience: impl IntoIterator<Item = impl Into<UserId>>) -> Self {
        Self {
            timestamp,
            audience: audience.into_iter().map(Into::into).collect(),
        }
    }
}

/// A file attached to a message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileAttachment {
    pub file_id: String,
    pub mime_type: String,
}

/// A message was posted to a chat.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageSent {
    pub meta: UpdateMeta,
    pub message_id: String,
    pub from_user: UserId,
    pub chat_id: String,
    pub text: String,
    pub reply_to: Option<String>,
    pub attachments: Vec<FileAttachment>,
}

/// A chat was created.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChatCreated {
    pub meta: UpdateMeta,
    pub chat_id: String,
    pub is_direct: bool,
    pub members: Vec<UserId>,
}

/// A chat was deleted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChatDeleted {
    pub meta: UpdateMeta,
    pub chat_id: String,
}

/// Someone joined or left a chat.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MembershipChanged {
    pub meta: UpdateMeta,
    pub chat_id: String,
    pub user_id: UserId,
}

/// An immutable domain event describing chat activity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Update {
    MessageSent(MessageSent),
    ChatCreated(ChatCreated),
    ChatDeleted(ChatDeleted),
    MemberAdded(MembershipChanged),
    MemberRemoved(MembershipChanged),
    /// A variant this build does not understand. Routed nowhere.
    Unknown { meta: UpdateMeta, kind: String },
}

/// Updates are shared between listener queues, never copied per listener.
pub type SharedUpdate = Arc<Update>;

impl Update {
    pub fn meta(&self) -> &UpdateMeta {
        match self {
            Update::MessageSent(u) => &u.meta,
            Update::ChatCreated(u) => &u.meta,
            Update::ChatDeleted(u) => &u.meta,
            Update::MemberAdded(u) | Update::MemberRemoved(u) => &u.meta,
            Update::Unknown { meta, .. } => meta,
        }
    }

    pub fn timestamp(&self) -> Timestamp {
        self.meta().timestamp
    }

    pub fn audience(&self) -> &[UserId] {
        &self.meta().audience
    }

    /// Short name used in logs and on the wire.
    pub fn kind(&self) -> &str {
        match self {
            Update::MessageSent(_) => "message",
            Update::ChatCreated(_) => "created_chat",
            Update::ChatDeleted(_) => "deleted_chat",
            Update::MemberAdded(_) => "member_added",
            Update::MemberRemoved(_) => "member_removed",
            Update::Unknown { kind, .. } => kind,
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Update::Unknown { .. })
    }
}

impl From<MessageSent> for Update {
    fn from(u: MessageSent) -> Self {
        Update::MessageSent(u)
    }
}

impl From<ChatCreated> for Update {
    fn from(u: ChatCreated) -> Self {
        Update::ChatCreated(u)
    }
}

impl From<ChatDeleted> for Update {
    fn from(u: ChatDeleted) -> Self {
        Update::ChatDeleted(u)
    }
}

/// Unique identifier for an attached listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
