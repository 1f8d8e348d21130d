//! Session registry for Beam.
//!
//! Owns every session's lifecycle, its membership set, and its catch-up
//! buffer. Lookups go through three indexes: session id, join key (live and
//! pending sessions only), and owning publisher. A reverse index from
//! connection to session makes disconnect cleanup O(1). Nothing outside
//! this registry mutates membership or buffers.

use crate::dispatch::ConnectionId;
use crate::error::CoreError;
use crate::session::{generate_session_key, CatchUpBuffer, Session, SessionKey};
use beam_protocol::records::now_millis;
use beam_protocol::{DataFrame, SessionId, SessionStatus, UserId};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::{debug, info};

/// Registry counters for the health endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    pub total: usize,
    pub live: usize,
}

/// In-memory session registry.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: HashMap<SessionId, Session>,
    /// Join key -> session, for non-ended sessions only. Ending a session
    /// retires its key, so a key identifies exactly one session for its
    /// whole pending/live lifetime.
    by_key: HashMap<SessionKey, SessionId>,
    /// Publisher -> their current non-ended session.
    by_publisher: HashMap<UserId, SessionId>,
    members: HashMap<SessionId, HashSet<ConnectionId>>,
    /// Connection -> session it is a member of, for O(1) cleanup.
    member_session: HashMap<ConnectionId, SessionId>,
    buffers: HashMap<SessionId, CatchUpBuffer>,
    catch_up_capacity: usize,
}

impl SessionRegistry {
    /// Create a registry whose catch-up buffers hold `catch_up_capacity`
    /// frames each.
    #[must_use]
    pub fn new(catch_up_capacity: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            by_key: HashMap::new(),
            by_publisher: HashMap::new(),
            members: HashMap::new(),
            member_session: HashMap::new(),
            buffers: HashMap::new(),
            catch_up_capacity,
        }
    }

    /// Create a pending session for a publisher.
    ///
    /// # Errors
    ///
    /// Returns `PublisherBusy` if the publisher already owns a non-ended
    /// session.
    pub fn create(&mut self, publisher: UserId) -> Result<&Session, CoreError> {
        if let Some(existing) = self.by_publisher.get(&publisher) {
            if self.sessions.get(existing).is_some_and(|s| !s.is_ended()) {
                return Err(CoreError::PublisherBusy);
            }
        }

        // Collision on 128 random bits is a theoretical case; retry anyway
        // since the key is the sole join credential.
        let key = loop {
            let candidate = generate_session_key();
            if !self.by_key.contains_key(&candidate) {
                break candidate;
            }
        };

        let session = Session::new(publisher, key.clone());
        let id = session.id;
        info!(session = %id, publisher = %publisher, "Session created");

        self.by_key.insert(key, id);
        self.by_publisher.insert(publisher, id);
        self.members.insert(id, HashSet::new());
        self.buffers.insert(id, CatchUpBuffer::new(self.catch_up_capacity));
        self.sessions.insert(id, session);

        Ok(&self.sessions[&id])
    }

    /// Pending -> Live.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown or already-ended key, `InvalidTransition`
    /// if the session is not pending.
    pub fn start(&mut self, key: &str) -> Result<&Session, CoreError> {
        let id = self.lookup(key)?;
        let session = self.sessions.get_mut(&id).expect("key index out of sync");
        session.start()?;
        info!(session = %id, "Session live");
        Ok(&self.sessions[&id])
    }

    /// End a session and tear down its membership and buffer.
    ///
    /// Returns the ended session and the connections that were members, so
    /// the caller can notify them. The key and publisher indexes, member
    /// set, reverse index entries, and catch-up buffer are all cleared in
    /// this single call.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown or already-ended key.
    pub fn end(&mut self, key: &str) -> Result<(Session, Vec<ConnectionId>), CoreError> {
        let id = self.lookup(key)?;
        let session = self.sessions.get_mut(&id).expect("key index out of sync");
        session.end()?;

        self.by_key.remove(key);
        self.by_publisher.remove(&session.publisher);
        self.buffers.remove(&id);

        let members: Vec<ConnectionId> = self
            .members
            .remove(&id)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();
        for conn in &members {
            self.member_session.remove(conn);
        }

        info!(session = %id, members = members.len(), "Session ended");
        Ok((self.sessions[&id].clone(), members))
    }

    /// Add a connection to a session's membership and return the catch-up
    /// replay for that connection only.
    ///
    /// A connection already in another session is moved out of it first: a
    /// connection is a member of at most one session at a time.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown or already-ended key.
    pub fn join(
        &mut self,
        key: &str,
        conn: ConnectionId,
    ) -> Result<(&Session, Vec<DataFrame>), CoreError> {
        let id = self.lookup(key)?;

        if let Some(previous) = self.member_session.get(&conn).copied() {
            if previous != id {
                if let Some(set) = self.members.get_mut(&previous) {
                    set.remove(&conn);
                }
            }
        }

        self.members
            .get_mut(&id)
            .expect("member set out of sync")
            .insert(conn.clone());
        self.member_session.insert(conn, id);

        let replay = self.buffers.get(&id).map(CatchUpBuffer::replay).unwrap_or_default();
        debug!(session = %id, buffered = replay.len(), "Member joined");
        Ok((&self.sessions[&id], replay))
    }

    /// Remove a connection from a session's membership.
    ///
    /// Idempotent: removing a non-member is a no-op. Returns the current
    /// member count and whether anything was actually removed.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown or already-ended key.
    pub fn leave(&mut self, key: &str, conn: &ConnectionId) -> Result<(usize, bool), CoreError> {
        let id = self.lookup(key)?;
        let set = self.members.get_mut(&id).expect("member set out of sync");
        let removed = set.remove(conn);
        if removed {
            self.member_session.remove(conn);
            debug!(session = %id, remaining = set.len(), "Member left");
        }
        Ok((set.len(), removed))
    }

    /// Append a data frame to a session's catch-up buffer.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown or already-ended key.
    pub fn buffer_frame(&mut self, key: &str, frame: DataFrame) -> Result<(), CoreError> {
        let id = self.lookup(key)?;
        self.buffers
            .get_mut(&id)
            .expect("buffer out of sync")
            .push(frame);
        Ok(())
    }

    /// Current members of a session.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown or already-ended key.
    pub fn members(&self, key: &str) -> Result<Vec<ConnectionId>, CoreError> {
        let id = self.lookup(key)?;
        Ok(self
            .members
            .get(&id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    /// Current member count of a session (0 for unknown keys).
    #[must_use]
    pub fn member_count(&self, key: &str) -> usize {
        self.by_key
            .get(key)
            .and_then(|id| self.members.get(id))
            .map_or(0, HashSet::len)
    }

    /// Look up a non-ended session by its join key.
    #[must_use]
    pub fn by_key(&self, key: &str) -> Option<&Session> {
        self.by_key.get(key).and_then(|id| self.sessions.get(id))
    }

    /// A publisher's current non-ended session.
    #[must_use]
    pub fn by_publisher(&self, publisher: UserId) -> Option<&Session> {
        self.by_publisher
            .get(&publisher)
            .and_then(|id| self.sessions.get(id))
    }

    /// All currently live sessions.
    #[must_use]
    pub fn list_live(&self) -> Vec<&Session> {
        self.sessions
            .values()
            .filter(|s| s.status == SessionStatus::Live)
            .collect()
    }

    /// The session a connection is currently a member of.
    #[must_use]
    pub fn session_of_connection(&self, conn: &ConnectionId) -> Option<&Session> {
        self.member_session
            .get(conn)
            .and_then(|id| self.sessions.get(id))
    }

    /// Drop ended sessions older than `max_age`. Returns how many were
    /// removed. Garbage collection only: live state is never touched.
    pub fn sweep_stale(&mut self, max_age: Duration) -> usize {
        let cutoff = now_millis().saturating_sub(max_age.as_millis() as u64);
        let before = self.sessions.len();
        self.sessions
            .retain(|_, s| !(s.is_ended() && s.ended_at.is_some_and(|t| t < cutoff)));
        let swept = before - self.sessions.len();
        if swept > 0 {
            info!(swept, "Swept stale sessions");
        }
        swept
    }

    /// Registry counters.
    #[must_use]
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            total: self.sessions.len(),
            live: self
                .sessions
                .values()
                .filter(|s| s.status == SessionStatus::Live)
                .count(),
        }
    }

    fn lookup(&self, key: &str) -> Result<SessionId, CoreError> {
        self.by_key
            .get(key)
            .copied()
            .ok_or_else(|| CoreError::not_found("session", key))
    }
}
