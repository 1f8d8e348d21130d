//! Identity registry for Beam.
//!
//! Maps connection identities to stable user identities. Display names are
//! unique case-insensitively: registering an existing name rebinds that
//! identity's connection instead of creating a duplicate, which is how
//! reconnection works. Disconnecting clears the connection handle but keeps
//! the identity (and its follow edges) for later reconnection; only `purge`
//! removes an identity permanently.

use crate::dispatch::ConnectionId;
use crate::error::CoreError;
use beam_protocol::records::now_millis;
use beam_protocol::{Role, UserId, UserProfile};
use std::collections::HashMap;
use tracing::debug;

/// A registered user.
#[derive(Debug, Clone)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub role: Role,
    /// Live connection handle; `None` while disconnected.
    pub connection: Option<ConnectionId>,
    pub created_at: u64,
}

impl User {
    /// Outbound description of this user.
    #[must_use]
    pub fn profile(&self) -> UserProfile {
        UserProfile {
            id: self.id,
            name: self.name.clone(),
            role: self.role,
            created_at: self.created_at,
        }
    }

    /// Whether the user currently has a live connection.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }
}

/// Registry counters for the health endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserStats {
    pub total: usize,
    pub connected: usize,
    pub disconnected: usize,
}

/// In-memory user registry.
#[derive(Debug, Default)]
pub struct UserRegistry {
    users: HashMap<UserId, User>,
    /// Lowercased display name -> identity.
    by_name: HashMap<String, UserId>,
    /// Live connection -> identity, for O(1) resolution.
    by_connection: HashMap<ConnectionId, UserId>,
}

impl UserRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user, or rebind an existing identity on reconnection.
    ///
    /// A display name that already exists (case-insensitively) names the
    /// same identity: its connection handle is replaced with the new one
    /// and the stored role is kept. A brand-new name creates an identity.
    /// The second value is the handle this rebinding displaced, if any, so
    /// the caller can close it out.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if the name is empty after trimming.
    pub fn register(
        &mut self,
        name: &str,
        role: Role,
        conn: ConnectionId,
    ) -> Result<(&User, Option<ConnectionId>), CoreError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(CoreError::InvalidInput(
                "display name cannot be empty".to_string(),
            ));
        }
        let lower = name.to_lowercase();

        // If this connection was bound to some other identity, unbind it
        // first so a handle never resolves to two users.
        if let Some(previous) = self.by_connection.remove(&conn) {
            if let Some(user) = self.users.get_mut(&previous) {
                user.connection = None;
            }
        }

        let mut displaced = None;
        let id = match self.by_name.get(&lower) {
            Some(&id) => {
                let user = self.users.get_mut(&id).expect("name index out of sync");
                // Reconnection: drop the stale handle mapping, bind the new one.
                if let Some(old) = user.connection.take() {
                    self.by_connection.remove(&old);
                    if old != conn {
                        displaced = Some(old);
                    }
                }
                user.connection = Some(conn.clone());
                debug!(user = %id, name = %user.name, "User reconnected");
                id
            }
            None => {
                let user = User {
                    id: UserId::generate(),
                    name: name.to_string(),
                    role,
                    connection: Some(conn.clone()),
                    created_at: now_millis(),
                };
                let id = user.id;
                debug!(user = %id, name = %user.name, role = ?role, "User registered");
                self.by_name.insert(lower, id);
                self.users.insert(id, user);
                id
            }
        };

        self.by_connection.insert(conn, id);
        Ok((&self.users[&id], displaced))
    }

    /// Look up a user by identity.
    #[must_use]
    pub fn get(&self, id: UserId) -> Option<&User> {
        self.users.get(&id)
    }

    /// O(1) lookup of the user bound to a connection.
    #[must_use]
    pub fn resolve_by_connection(&self, conn: &ConnectionId) -> Option<&User> {
        self.by_connection.get(conn).and_then(|id| self.users.get(id))
    }

    /// Clear a user's connection handle, keeping the identity. Idempotent.
    pub fn disconnect(&mut self, id: UserId) {
        if let Some(user) = self.users.get_mut(&id) {
            if let Some(conn) = user.connection.take() {
                self.by_connection.remove(&conn);
                debug!(user = %id, "User disconnected");
            }
        }
    }

    /// Permanently remove an identity.
    ///
    /// The caller is responsible for dropping the user's follow edges.
    pub fn purge(&mut self, id: UserId) -> Option<User> {
        let user = self.users.remove(&id)?;
        self.by_name.remove(&user.name.to_lowercase());
        if let Some(conn) = &user.connection {
            self.by_connection.remove(conn);
        }
        debug!(user = %id, name = %user.name, "User purged");
        Some(user)
    }

    /// All registered users.
    #[must_use]
    pub fn all(&self) -> Vec<&User> {
        self.users.values().collect()
    }

    /// Users with the given role.
    #[must_use]
    pub fn by_role(&self, role: Role) -> Vec<&User> {
        self.users.values().filter(|u| u.role == role).collect()
    }

    /// Registry counters.
    #[must_use]
    pub fn stats(&self) -> UserStats {
        let connected = self.users.values().filter(|u| u.is_connected()).count();
        UserStats {
            total: self.users.len(),
            connected,
            disconnected: self.users.len() - connected,
        }
    }
}
