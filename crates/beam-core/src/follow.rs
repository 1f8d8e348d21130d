//! Follow graph for Beam.
//!
//! Directed edges between user identities: an edge A -> B means A wants to
//! be notified when B's sessions start or end. The reverse index is
//! maintained alongside the forward one because followers-of lookups run on
//! every session start and end.

use beam_protocol::UserId;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Edge counters for one user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FollowStats {
    pub following: usize,
    pub followers: usize,
}

/// Directed follow edges with a forward and a reverse index.
#[derive(Debug, Default)]
pub struct FollowGraph {
    /// follower -> set of followees.
    following: HashMap<UserId, HashSet<UserId>>,
    /// followee -> set of followers.
    followers: HashMap<UserId, HashSet<UserId>>,
}

impl FollowGraph {
    /// Create an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an edge follower -> followee.
    ///
    /// Returns `false` without touching the graph for a self-follow or an
    /// edge that already exists; neither is an error.
    pub fn follow(&mut self, follower: UserId, followee: UserId) -> bool {
        if follower == followee {
            return false;
        }

        let inserted = self.following.entry(follower).or_default().insert(followee);
        if inserted {
            self.followers.entry(followee).or_default().insert(follower);
            debug!(follower = %follower, followee = %followee, "Follow edge added");
        }
        inserted
    }

    /// Remove an edge. Returns `false` if it did not exist.
    pub fn unfollow(&mut self, follower: UserId, followee: UserId) -> bool {
        let removed = match self.following.get_mut(&follower) {
            Some(set) => set.remove(&followee),
            None => false,
        };

        if removed {
            if let Some(set) = self.followers.get_mut(&followee) {
                set.remove(&follower);
                if set.is_empty() {
                    self.followers.remove(&followee);
                }
            }
            if self.following[&follower].is_empty() {
                self.following.remove(&follower);
            }
            debug!(follower = %follower, followee = %followee, "Follow edge removed");
        }
        removed
    }

    /// Whether follower -> followee exists.
    #[must_use]
    pub fn is_following(&self, follower: UserId, followee: UserId) -> bool {
        self.following
            .get(&follower)
            .is_some_and(|set| set.contains(&followee))
    }

    /// Everyone following `id`. Reverse-index lookup, O(followers).
    #[must_use]
    pub fn followers_of(&self, id: UserId) -> Vec<UserId> {
        self.followers
            .get(&id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Everyone `id` follows.
    #[must_use]
    pub fn following_of(&self, id: UserId) -> Vec<UserId> {
        self.following
            .get(&id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Remove every edge touching `id`. Called when a user is purged,
    /// not on mere disconnection.
    pub fn drop_edges_for(&mut self, id: UserId) {
        if let Some(followees) = self.following.remove(&id) {
            for followee in followees {
                if let Some(set) = self.followers.get_mut(&followee) {
                    set.remove(&id);
                    if set.is_empty() {
                        self.followers.remove(&followee);
                    }
                }
            }
        }
        if let Some(follower_ids) = self.followers.remove(&id) {
            for follower in follower_ids {
                if let Some(set) = self.following.get_mut(&follower) {
                    set.remove(&id);
                    if set.is_empty() {
                        self.following.remove(&follower);
                    }
                }
            }
        }
        debug!(user = %id, "Dropped all follow edges");
    }

    /// Edge counters for one user.
    #[must_use]
    pub fn stats(&self, id: UserId) -> FollowStats {
        FollowStats {
            following: self.following.get(&id).map_or(0, HashSet::len),
            followers: self.followers.get(&id).map_or(0, HashSet::len),
        }
    }
}
