//! # beam-protocol
//!
//! Wire protocol definitions for the Beam broadcast coordinator.
//!
//! This crate defines the messages exchanged between Beam clients and the
//! coordinator, the event records they carry, a length-prefixed MessagePack
//! codec, and protocol versioning.
//!
//! ## Frame Types
//!
//! - `ClientFrame` - everything a connection can ask the coordinator to do
//!   (register, create/join/start/end sessions, chat, reactions, data
//!   frames, follow/unfollow, signaling relay)
//! - `ServerFrame` - everything the coordinator pushes back (confirmations,
//!   session broadcasts, catch-up replay, follower notifications, errors)
//!
//! ## Example
//!
//! ```rust
//! use beam_protocol::{codec, ClientFrame};
//!
//! let frame = ClientFrame::Chat {
//!     key: "4be1f7a1c09f4d2daa2ed7c337a9c2bd".into(),
//!     content: "hello".into(),
//! };
//!
//! let encoded = codec::encode(&frame).unwrap();
//! let decoded: ClientFrame = codec::decode(&encoded).unwrap();
//! ```

pub mod codec;
pub mod frames;
pub mod records;
pub mod version;

pub use codec::{decode, encode, ProtocolError};
pub use frames::{ClientFrame, ServerFrame, SignalKind};
pub use records::{
    ChatMessage, DataFrame, FollowNotice, MessageKind, NoticeKind, Reaction, Role, SessionId,
    SessionStatus, SessionSummary, UserId, UserProfile, UserSummary,
};
pub use version::{Version, PROTOCOL_VERSION};
