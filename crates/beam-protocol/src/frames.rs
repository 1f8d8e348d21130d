//! Frame types for the Beam protocol.
//!
//! Inbound and outbound messages are closed tagged enums: every kind of
//! message carries its own typed payload, and both the coordinator and the
//! connection loop are total matches over them. Frames are serialized with
//! MessagePack (see [`crate::codec`]).

use crate::records::{
    ChatMessage, DataFrame, FollowNotice, Reaction, Role, SessionSummary, UserId, UserProfile,
    UserSummary,
};
use crate::version::Version;
use serde::{Deserialize, Serialize};

/// Signaling message kinds relayed between two connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

/// A request from a connection to the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Bind this connection to a user identity, creating it if the display
    /// name is new (case-insensitive).
    Register { name: String, role: Role },

    /// Create a new pending session owned by the calling publisher.
    CreateSession,

    /// Pending -> Live transition for the caller's session.
    StartSession { key: String },

    /// Join a session by key.
    JoinSession { key: String },

    /// Leave a session. Leaving a session you are not in is a no-op.
    LeaveSession { key: String },

    /// End the caller's session. Terminal.
    EndSession { key: String },

    /// Send a chat message to a session.
    Chat { key: String, content: String },

    /// Send an emoji reaction to a session.
    React { key: String, emoji: String },

    /// Push one opaque media frame. Publisher-only.
    Data {
        key: String,
        #[serde(with = "serde_bytes")]
        payload: Vec<u8>,
    },

    /// Follow a user: be notified when their sessions start or end.
    Follow { user: UserId },

    /// Stop following a user.
    Unfollow { user: UserId },

    /// List all other users, with follow state and live-session keys.
    ListUsers,

    /// List the users the caller follows.
    ListFollowing,

    /// Relay an opaque signaling payload to another connection.
    Signal {
        kind: SignalKind,
        target: String,
        payload: serde_json::Value,
    },

    /// Keepalive.
    Ping {
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl ClientFrame {
    /// Short name of the frame kind, for logs and metrics labels.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ClientFrame::Register { .. } => "register",
            ClientFrame::CreateSession => "create_session",
            ClientFrame::StartSession { .. } => "start_session",
            ClientFrame::JoinSession { .. } => "join_session",
            ClientFrame::LeaveSession { .. } => "leave_session",
            ClientFrame::EndSession { .. } => "end_session",
            ClientFrame::Chat { .. } => "chat",
            ClientFrame::React { .. } => "react",
            ClientFrame::Data { .. } => "data",
            ClientFrame::Follow { .. } => "follow",
            ClientFrame::Unfollow { .. } => "unfollow",
            ClientFrame::ListUsers => "list_users",
            ClientFrame::ListFollowing => "list_following",
            ClientFrame::Signal { .. } => "signal",
            ClientFrame::Ping { .. } => "ping",
        }
    }
}

/// A message pushed from the coordinator to one connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Connection greeting: assigned connection id and heartbeat interval.
    Connected {
        connection_id: String,
        version: Version,
        heartbeat: u32,
    },

    /// Registration succeeded.
    Registered { profile: UserProfile },

    /// Session created; the key is the join credential.
    SessionCreated { summary: SessionSummary },

    /// Join succeeded. `buffered` is the catch-up replay for this
    /// connection only; it is never broadcast.
    SessionJoined {
        summary: SessionSummary,
        buffered: Vec<DataFrame>,
    },

    /// The session went live.
    SessionStarted { summary: SessionSummary },

    /// The session ended.
    SessionEnded {
        summary: SessionSummary,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// A member joined the session.
    MemberJoined { name: String, count: usize },

    /// A member left the session.
    MemberLeft { name: String, count: usize },

    /// Membership count changed.
    MemberCount { count: usize },

    /// One live data frame.
    Data { frame: DataFrame },

    /// A chat message or system notice.
    ChatBroadcast { message: ChatMessage },

    /// An emoji reaction.
    ReactionBroadcast { reaction: Reaction },

    /// A followed publisher's session started or ended.
    FollowNotification { notice: FollowNotice },

    /// Follow confirmation (`user` is the followee).
    Followed { user: UserId, name: String },

    /// Unfollow confirmation.
    Unfollowed { user: UserId },

    /// Users-list response.
    Users { users: Vec<UserSummary> },

    /// Following-list response.
    Following { users: Vec<UserSummary> },

    /// Relayed signaling payload. `from` is the sender's connection id.
    Signal {
        kind: SignalKind,
        from: String,
        payload: serde_json::Value,
    },

    /// Keepalive reply.
    Pong {
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// A recoverable error, reported only to the connection that caused it.
    Error { code: u16, message: String },
}

impl ServerFrame {
    /// Build an error frame.
    #[must_use]
    pub fn error(code: u16, message: impl Into<String>) -> Self {
        ServerFrame::Error {
            code,
            message: message.into(),
        }
    }

    /// Short name of the frame kind, for logs and metrics labels.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ServerFrame::Connected { .. } => "connected",
            ServerFrame::Registered { .. } => "registered",
            ServerFrame::SessionCreated { .. } => "session_created",
            ServerFrame::SessionJoined { .. } => "session_joined",
            ServerFrame::SessionStarted { .. } => "session_started",
            ServerFrame::SessionEnded { .. } => "session_ended",
            ServerFrame::MemberJoined { .. } => "member_joined",
            ServerFrame::MemberLeft { .. } => "member_left",
            ServerFrame::MemberCount { .. } => "member_count",
            ServerFrame::Data { .. } => "data",
            ServerFrame::ChatBroadcast { .. } => "chat_broadcast",
            ServerFrame::ReactionBroadcast { .. } => "reaction_broadcast",
            ServerFrame::FollowNotification { .. } => "follow_notification",
            ServerFrame::Followed { .. } => "followed",
            ServerFrame::Unfollowed { .. } => "unfollowed",
            ServerFrame::Users { .. } => "users",
            ServerFrame::Following { .. } => "following",
            ServerFrame::Signal { .. } => "signal",
            ServerFrame::Pong { .. } => "pong",
            ServerFrame::Error { .. } => "error",
        }
    }
}
