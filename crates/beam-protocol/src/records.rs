//! Event and entity records carried by Beam frames.
//!
//! Records are immutable once constructed. Each one stamps its own id and
//! creation timestamp, so the point of construction decides the times that
//! ordering guarantees are made against: system notices built inside the
//! dispatch path carry dispatch time, not caller-supplied time.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Current time as Unix milliseconds.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}

/// A stable user identity. Survives reconnects; only `purge` removes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub Uuid);

impl UserId {
    /// Sentinel identity for coordinator-generated system notices.
    pub const SYSTEM: UserId = UserId(Uuid::nil());

    /// Generate a fresh identity.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A session identity, distinct from the join key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Generate a fresh identity.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a user is allowed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// May create sessions and push data frames.
    Publisher,
    /// May join sessions and consume broadcasts.
    Subscriber,
}

/// Session lifecycle. `Ended` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Live,
    Ended,
}

/// Outbound description of a registered user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: UserId,
    pub name: String,
    pub role: Role,
    pub created_at: u64,
}

/// Discriminant for chat-channel records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Chat,
    System,
}

/// A chat message or coordinator-inserted system notice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub session: SessionId,
    pub sender: UserId,
    pub sender_name: String,
    pub kind: MessageKind,
    pub content: String,
    pub timestamp: u64,
}

impl ChatMessage {
    /// Build a user-authored chat message.
    #[must_use]
    pub fn user(
        session: SessionId,
        sender: UserId,
        sender_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            session,
            sender,
            sender_name: sender_name.into(),
            kind: MessageKind::Chat,
            content: content.into(),
            timestamp: now_millis(),
        }
    }

    /// Build a system notice attributed to the coordinator.
    #[must_use]
    pub fn system(session: SessionId, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            session,
            sender: UserId::SYSTEM,
            sender_name: "system".to_string(),
            kind: MessageKind::System,
            content: content.into(),
            timestamp: now_millis(),
        }
    }
}

/// An emoji reaction to a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reaction {
    pub id: Uuid,
    pub session: SessionId,
    pub sender: UserId,
    pub sender_name: String,
    pub emoji: String,
    pub timestamp: u64,
}

impl Reaction {
    /// Build a reaction record.
    #[must_use]
    pub fn new(
        session: SessionId,
        sender: UserId,
        sender_name: impl Into<String>,
        emoji: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            session,
            sender,
            sender_name: sender_name.into(),
            emoji: emoji.into(),
            timestamp: now_millis(),
        }
    }
}

/// One opaque media frame from the publisher.
///
/// The payload is shared (`Bytes`), so buffering and per-member broadcast
/// clones are reference-counted rather than copied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataFrame {
    pub payload: Bytes,
    pub timestamp: u64,
}

impl DataFrame {
    /// Build a data frame stamped with the current time.
    #[must_use]
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            timestamp: now_millis(),
        }
    }
}

/// Outbound description of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub key: String,
    pub publisher: UserId,
    pub publisher_name: String,
    pub status: SessionStatus,
    pub members: usize,
    pub created_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<u64>,
}

/// Why a follower is being notified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    Started,
    Ended,
}

/// Push notification delivered to connected followers of a publisher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowNotice {
    pub kind: NoticeKind,
    pub summary: SessionSummary,
}

/// One row of the users-list query: who exists, whether the caller follows
/// them, and where to join them if they are live.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: UserId,
    pub name: String,
    pub role: Role,
    pub followed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub live_session_key: Option<String>,
}
