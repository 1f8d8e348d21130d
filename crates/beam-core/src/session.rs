//! Session entity, state machine, join keys, and the catch-up buffer.
//!
//! A session is one publisher's broadcast instance. Its key is the sole
//! join credential - no separate subscriber authentication exists - so keys
//! are 128 bits of OS randomness rendered as a fixed-width hex token.

use crate::error::CoreError;
use beam_protocol::records::now_millis;
use beam_protocol::{DataFrame, SessionId, SessionStatus, SessionSummary, UserId};
use rand::rngs::OsRng;
use rand::RngCore;
use std::collections::VecDeque;

/// A session join key: 32 lowercase hex characters.
pub type SessionKey = String;

/// Number of random bytes behind a session key.
const SESSION_KEY_BYTES: usize = 16;

/// Generate an unguessable session key.
#[must_use]
pub fn generate_session_key() -> SessionKey {
    let mut bytes = [0u8; SESSION_KEY_BYTES];
    OsRng.fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Default catch-up buffer capacity, in frames.
pub const DEFAULT_CATCH_UP_CAPACITY: usize = 30;

/// One broadcast session.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub key: SessionKey,
    pub publisher: UserId,
    pub status: SessionStatus,
    pub created_at: u64,
    pub started_at: Option<u64>,
    pub ended_at: Option<u64>,
}

impl Session {
    /// Create a pending session.
    #[must_use]
    pub fn new(publisher: UserId, key: SessionKey) -> Self {
        Self {
            id: SessionId::generate(),
            key,
            publisher,
            status: SessionStatus::Pending,
            created_at: now_millis(),
            started_at: None,
            ended_at: None,
        }
    }

    /// Whether the session reached its terminal state.
    #[must_use]
    pub fn is_ended(&self) -> bool {
        self.status == SessionStatus::Ended
    }

    /// Pending -> Live transition.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` from any other state.
    pub fn start(&mut self) -> Result<(), CoreError> {
        if self.status != SessionStatus::Pending {
            return Err(CoreError::InvalidTransition {
                from: self.status,
                to: SessionStatus::Live,
            });
        }
        self.status = SessionStatus::Live;
        self.started_at = Some(now_millis());
        Ok(())
    }

    /// Pending | Live -> Ended transition. Terminal.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` if already ended.
    pub fn end(&mut self) -> Result<(), CoreError> {
        if self.is_ended() {
            return Err(CoreError::InvalidTransition {
                from: self.status,
                to: SessionStatus::Ended,
            });
        }
        self.status = SessionStatus::Ended;
        self.ended_at = Some(now_millis());
        Ok(())
    }

    /// Outbound description of this session.
    #[must_use]
    pub fn summary(&self, publisher_name: impl Into<String>, members: usize) -> SessionSummary {
        SessionSummary {
            id: self.id,
            key: self.key.clone(),
            publisher: self.publisher,
            publisher_name: publisher_name.into(),
            status: self.status,
            members,
            created_at: self.created_at,
            started_at: self.started_at,
            ended_at: self.ended_at,
        }
    }
}

/// Bounded ring of the most recent data frames, replayed to new joiners.
///
/// Insertion-ordered; once full, the oldest frame is evicted first. Never
/// persisted - the buffer is discarded with its session.
#[derive(Debug)]
pub struct CatchUpBuffer {
    frames: VecDeque<DataFrame>,
    capacity: usize,
}

impl CatchUpBuffer {
    /// Create a buffer holding at most `capacity` frames.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a frame, evicting the oldest if the buffer is full.
    pub fn push(&mut self, frame: DataFrame) {
        if self.frames.len() == self.capacity {
            self.frames.pop_front();
        }
        self.frames.push_back(frame);
    }

    /// The buffered frames, oldest first.
    #[must_use]
    pub fn replay(&self) -> Vec<DataFrame> {
        self.frames.iter().cloned().collect()
    }

    /// Number of buffered frames.
    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether the buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Maximum number of buffered frames.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
