//! The coordination hub.
//!
//! One `Hub` owns the identity registry, the session registry, and the
//! follow graph behind a single lock, plus the dispatcher. Every inbound
//! frame is one atomic unit of work: the hub locks, mutates, and emits the
//! resulting frames before releasing, so no connection ever observes a
//! half-updated session and broadcast order equals call order. Emission is
//! queue-pushing only - nothing under the lock blocks on I/O.

use crate::dispatch::{ConnectionId, Dispatcher, OutboundSender};
use crate::error::CoreError;
use crate::follow::FollowGraph;
use crate::registry::{SessionRegistry, SessionStats};
use crate::session::DEFAULT_CATCH_UP_CAPACITY;
use crate::user::{User, UserRegistry, UserStats};
use beam_protocol::{
    ChatMessage, ClientFrame, DataFrame, FollowNotice, NoticeKind, Reaction, Role, ServerFrame,
    SessionStatus, SessionSummary, UserId, UserSummary,
};
use parking_lot::Mutex;
use std::time::Duration;
use tracing::{debug, info, trace};

/// Hub tuning knobs.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Frames kept per session for join-time replay.
    pub catch_up_capacity: usize,
    /// Age past which ended sessions are swept.
    pub sweep_max_age: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            catch_up_capacity: DEFAULT_CATCH_UP_CAPACITY,
            sweep_max_age: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Counters for the health endpoint.
#[derive(Debug, Clone, Copy)]
pub struct HubStats {
    pub users: UserStats,
    pub sessions: SessionStats,
}

/// Mutable coordination state, serialized as one unit.
struct Registries {
    users: UserRegistry,
    sessions: SessionRegistry,
    follows: FollowGraph,
}

/// The coordinator. Constructed once at startup and shared by handle;
/// there is no global instance.
pub struct Hub {
    state: Mutex<Registries>,
    dispatcher: Dispatcher,
    config: HubConfig,
}

impl Hub {
    /// Create a hub with the given configuration.
    #[must_use]
    pub fn new(config: HubConfig) -> Self {
        info!(
            catch_up_capacity = config.catch_up_capacity,
            "Creating hub"
        );
        Self {
            state: Mutex::new(Registries {
                users: UserRegistry::new(),
                sessions: SessionRegistry::new(config.catch_up_capacity),
                follows: FollowGraph::new(),
            }),
            dispatcher: Dispatcher::new(),
            config,
        }
    }

    /// Attach a connection's outbound queue.
    pub fn connect(&self, conn: ConnectionId, sender: OutboundSender) {
        self.dispatcher.attach(conn, sender);
    }

    /// Number of attached connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.dispatcher.connection_count()
    }

    /// Process one inbound frame from a connection.
    ///
    /// Errors are recoverable by construction: they are reported to the
    /// originating connection only and never disturb other sessions.
    pub fn handle(&self, conn: &ConnectionId, frame: ClientFrame) {
        trace!(connection = %conn, kind = frame.name(), "Handling frame");

        let result = {
            let mut state = self.state.lock();
            match frame {
                ClientFrame::Register { name, role } => {
                    self.register(&mut state, conn, &name, role)
                }
                ClientFrame::CreateSession => self.create_session(&mut state, conn),
                ClientFrame::StartSession { key } => self.start_session(&mut state, conn, &key),
                ClientFrame::JoinSession { key } => self.join_session(&mut state, conn, &key),
                ClientFrame::LeaveSession { key } => self.leave_session(&mut state, conn, &key),
                ClientFrame::EndSession { key } => self.end_session(&mut state, conn, &key),
                ClientFrame::Chat { key, content } => self.chat(&mut state, conn, &key, content),
                ClientFrame::React { key, emoji } => self.react(&mut state, conn, &key, emoji),
                ClientFrame::Data { key, payload } => self.data(&mut state, conn, &key, payload),
                ClientFrame::Follow { user } => self.follow(&mut state, conn, user),
                ClientFrame::Unfollow { user } => self.unfollow(&mut state, conn, user),
                ClientFrame::ListUsers => self.list_users(&state, conn),
                ClientFrame::ListFollowing => self.list_following(&state, conn),
                ClientFrame::Signal {
                    kind,
                    target,
                    payload,
                } => {
                    let frame = ServerFrame::Signal {
                        kind,
                        from: conn.to_string(),
                        payload,
                    };
                    self.dispatcher.forward(&ConnectionId::from(target), frame);
                    Ok(())
                }
                ClientFrame::Ping { timestamp } => {
                    self.dispatcher.send(conn, ServerFrame::Pong { timestamp });
                    Ok(())
                }
            }
        };

        if let Err(err) = result {
            debug!(connection = %conn, error = %err, "Request failed");
            self.dispatcher
                .send(conn, ServerFrame::error(err.wire_code(), err.to_string()));
        }
    }

    /// Transport-layer disconnection signal.
    ///
    /// A publisher's non-ended session is ended with a reason; a member is
    /// removed from its session with the usual membership broadcasts. The
    /// identity is marked disconnected, never purged.
    pub fn disconnect(&self, conn: &ConnectionId) {
        {
            let mut state = self.state.lock();
            if let Some(user) = state.users.resolve_by_connection(conn) {
                let (user_id, name) = (user.id, user.name.clone());

                if let Some(session) = state.sessions.by_publisher(user_id) {
                    let key = session.key.clone();
                    let _ = self.end_and_notify(
                        &mut state,
                        &key,
                        Some("publisher disconnected".to_string()),
                        None,
                    );
                }

                if let Some(session) = state.sessions.session_of_connection(conn) {
                    let key = session.key.clone();
                    let _ = self.do_leave(&mut state, conn, &key, &name);
                }

                state.users.disconnect(user_id);
                info!(connection = %conn, user = %user_id, "Connection closed");
            }
        }
        self.dispatcher.detach(conn);
    }

    /// Permanently remove a user: identity, connection binding, follow
    /// edges, and any session they still own.
    pub fn purge_user(&self, id: UserId) -> bool {
        let mut state = self.state.lock();
        let Some(user) = state.users.purge(id) else {
            return false;
        };

        if let Some(session) = state.sessions.by_publisher(id) {
            let key = session.key.clone();
            let _ = self.end_and_notify(&mut state, &key, Some("publisher removed".to_string()), None);
        }
        state.follows.drop_edges_for(id);

        if let Some(conn) = &user.connection {
            self.dispatcher.detach(conn);
        }
        true
    }

    /// Drop ended sessions older than the configured threshold.
    pub fn sweep_stale(&self) -> usize {
        self.state.lock().sessions.sweep_stale(self.config.sweep_max_age)
    }

    /// Counters for the health endpoint.
    #[must_use]
    pub fn stats(&self) -> HubStats {
        let state = self.state.lock();
        HubStats {
            users: state.users.stats(),
            sessions: state.sessions.stats(),
        }
    }

    /// Summaries of all live sessions.
    #[must_use]
    pub fn live_sessions(&self) -> Vec<SessionSummary> {
        let state = self.state.lock();
        state
            .sessions
            .list_live()
            .into_iter()
            .map(|s| {
                let name = state
                    .users
                    .get(s.publisher)
                    .map(|u| u.name.clone())
                    .unwrap_or_default();
                s.summary(name, state.sessions.member_count(&s.key))
            })
            .collect()
    }

    // ---- operations ------------------------------------------------------

    fn register(
        &self,
        state: &mut Registries,
        conn: &ConnectionId,
        name: &str,
        role: Role,
    ) -> Result<(), CoreError> {
        let (profile, displaced) = {
            let (user, displaced) = state.users.register(name, role, conn.clone())?;
            (user.profile(), displaced)
        };

        // A reconnection replaces the prior handle: close out its session
        // membership and its outbound queue.
        if let Some(old) = displaced {
            if let Some(session) = state.sessions.session_of_connection(&old) {
                let key = session.key.clone();
                let _ = self.do_leave(state, &old, &key, &profile.name);
            }
            self.dispatcher.detach(&old);
        }

        self.dispatcher.send(conn, ServerFrame::Registered { profile });
        Ok(())
    }

    fn create_session(&self, state: &mut Registries, conn: &ConnectionId) -> Result<(), CoreError> {
        let user = Self::require_user(&state.users, conn)?;
        if user.role != Role::Publisher {
            return Err(CoreError::RoleConflict(
                "only publishers can create sessions".to_string(),
            ));
        }
        let (user_id, name) = (user.id, user.name.clone());

        let summary = state.sessions.create(user_id)?.summary(name, 0);
        info!(session = %summary.id, key = %summary.key, "Session created");
        self.dispatcher.send(conn, ServerFrame::SessionCreated { summary });
        Ok(())
    }

    fn start_session(
        &self,
        state: &mut Registries,
        conn: &ConnectionId,
        key: &str,
    ) -> Result<(), CoreError> {
        let user_id = Self::require_owner(state, conn, key)?;

        let session = state.sessions.start(key)?.clone();
        let name = Self::display_name(&state.users, user_id);
        let members = state.sessions.members(key)?;
        let summary = session.summary(name, members.len());

        let frame = ServerFrame::SessionStarted {
            summary: summary.clone(),
        };
        self.dispatcher.broadcast(members.iter(), &frame);
        self.dispatcher.send(conn, frame);

        self.notify_followers(state, NoticeKind::Started, &summary);
        Ok(())
    }

    fn end_session(
        &self,
        state: &mut Registries,
        conn: &ConnectionId,
        key: &str,
    ) -> Result<(), CoreError> {
        Self::require_owner(state, conn, key)?;
        self.end_and_notify(state, key, None, Some(conn))
    }

    /// End a session, notify its members and the publisher's followers.
    /// One atomic step from the caller's point of view: membership and the
    /// catch-up buffer are gone before any frame is emitted.
    fn end_and_notify(
        &self,
        state: &mut Registries,
        key: &str,
        reason: Option<String>,
        caller: Option<&ConnectionId>,
    ) -> Result<(), CoreError> {
        let (session, members) = state.sessions.end(key)?;
        let name = Self::display_name(&state.users, session.publisher);
        let summary = session.summary(name, 0);

        let frame = ServerFrame::SessionEnded {
            summary: summary.clone(),
            reason,
        };
        self.dispatcher.broadcast(members.iter(), &frame);
        if let Some(conn) = caller {
            self.dispatcher.send(conn, frame);
        }

        self.notify_followers(state, NoticeKind::Ended, &summary);
        Ok(())
    }

    fn join_session(
        &self,
        state: &mut Registries,
        conn: &ConnectionId,
        key: &str,
    ) -> Result<(), CoreError> {
        let user = Self::require_user(&state.users, conn)?;
        let (user_id, name) = (user.id, user.name.clone());

        let session = state
            .sessions
            .by_key(key)
            .ok_or_else(|| CoreError::not_found("session", key))?;
        if session.publisher == user_id {
            return Err(CoreError::RoleConflict(
                "publishers cannot join their own session".to_string(),
            ));
        }

        // A connection views one session at a time: moving to a new session
        // leaves the previous one with the usual broadcasts.
        if let Some(previous) = state.sessions.session_of_connection(conn) {
            let previous_key = previous.key.clone();
            if previous_key != key {
                self.do_leave(state, conn, &previous_key, &name)?;
            }
        }

        let (session, buffered) = state.sessions.join(key, conn.clone())?;
        let session = session.clone();
        let count = state.sessions.member_count(key);
        let publisher_name = Self::display_name(&state.users, session.publisher);
        let summary = session.summary(publisher_name, count);

        // Replay goes to the joiner only, before any broadcast it is part of.
        self.dispatcher
            .send(conn, ServerFrame::SessionJoined { summary, buffered });

        let recipients = self.session_audience(state, key)?;
        self.dispatcher.broadcast(
            recipients.iter(),
            &ServerFrame::MemberJoined {
                name: name.clone(),
                count,
            },
        );
        self.dispatcher
            .broadcast(recipients.iter(), &ServerFrame::MemberCount { count });

        let notice = ChatMessage::system(session.id, format!("{name} joined the session"));
        self.dispatcher.broadcast(
            recipients.iter(),
            &ServerFrame::ChatBroadcast { message: notice },
        );
        Ok(())
    }

    fn leave_session(
        &self,
        state: &mut Registries,
        conn: &ConnectionId,
        key: &str,
    ) -> Result<(), CoreError> {
        let name = Self::require_user(&state.users, conn)?.name.clone();
        self.do_leave(state, conn, key, &name)
    }

    fn do_leave(
        &self,
        state: &mut Registries,
        conn: &ConnectionId,
        key: &str,
        name: &str,
    ) -> Result<(), CoreError> {
        let (count, removed) = state.sessions.leave(key, conn)?;
        if !removed {
            // Leaving a session you are not in is a no-op, not an error.
            return Ok(());
        }

        let session_id = state
            .sessions
            .by_key(key)
            .map(|s| s.id)
            .ok_or_else(|| CoreError::not_found("session", key))?;

        let recipients = self.session_audience(state, key)?;
        self.dispatcher.broadcast(
            recipients.iter(),
            &ServerFrame::MemberLeft {
                name: name.to_string(),
                count,
            },
        );
        self.dispatcher
            .broadcast(recipients.iter(), &ServerFrame::MemberCount { count });

        let notice = ChatMessage::system(session_id, format!("{name} left the session"));
        self.dispatcher.broadcast(
            recipients.iter(),
            &ServerFrame::ChatBroadcast { message: notice },
        );
        Ok(())
    }

    fn chat(
        &self,
        state: &mut Registries,
        conn: &ConnectionId,
        key: &str,
        content: String,
    ) -> Result<(), CoreError> {
        let user = Self::require_user(&state.users, conn)?;
        let (user_id, name) = (user.id, user.name.clone());
        let session_id = state
            .sessions
            .by_key(key)
            .map(|s| s.id)
            .ok_or_else(|| CoreError::not_found("session", key))?;

        let message = ChatMessage::user(session_id, user_id, name, content);
        let recipients = self.session_audience(state, key)?;
        self.dispatcher
            .broadcast(recipients.iter(), &ServerFrame::ChatBroadcast { message });
        Ok(())
    }

    fn react(
        &self,
        state: &mut Registries,
        conn: &ConnectionId,
        key: &str,
        emoji: String,
    ) -> Result<(), CoreError> {
        let user = Self::require_user(&state.users, conn)?;
        let (user_id, name) = (user.id, user.name.clone());
        let session_id = state
            .sessions
            .by_key(key)
            .map(|s| s.id)
            .ok_or_else(|| CoreError::not_found("session", key))?;

        let reaction = Reaction::new(session_id, user_id, name, emoji);
        let recipients = self.session_audience(state, key)?;
        self.dispatcher
            .broadcast(recipients.iter(), &ServerFrame::ReactionBroadcast { reaction });
        Ok(())
    }

    fn data(
        &self,
        state: &mut Registries,
        conn: &ConnectionId,
        key: &str,
        payload: Vec<u8>,
    ) -> Result<(), CoreError> {
        let user_id = Self::require_user(&state.users, conn)?.id;
        let session = state
            .sessions
            .by_key(key)
            .ok_or_else(|| CoreError::not_found("session", key))?;
        if session.publisher != user_id {
            return Err(CoreError::RoleConflict(
                "only the session publisher can send data frames".to_string(),
            ));
        }

        let frame = DataFrame::new(payload);
        // Only raw data frames enter the catch-up buffer; chat and
        // reactions are never replayed to late joiners.
        state.sessions.buffer_frame(key, frame.clone())?;

        let members = state.sessions.members(key)?;
        let delivered = self
            .dispatcher
            .broadcast(members.iter(), &ServerFrame::Data { frame });
        trace!(session_key = key, delivered, "Data frame distributed");
        Ok(())
    }

    fn follow(
        &self,
        state: &mut Registries,
        conn: &ConnectionId,
        target: UserId,
    ) -> Result<(), CoreError> {
        let user_id = Self::require_user(&state.users, conn)?.id;
        let target_name = state
            .users
            .get(target)
            .map(|u| u.name.clone())
            .ok_or_else(|| CoreError::not_found("user", target))?;

        if user_id == target {
            return Err(CoreError::InvalidInput("cannot follow yourself".to_string()));
        }

        // An existing edge is a benign no-op; the confirmation is the same.
        state.follows.follow(user_id, target);
        self.dispatcher.send(
            conn,
            ServerFrame::Followed {
                user: target,
                name: target_name,
            },
        );
        Ok(())
    }

    fn unfollow(
        &self,
        state: &mut Registries,
        conn: &ConnectionId,
        target: UserId,
    ) -> Result<(), CoreError> {
        let user_id = Self::require_user(&state.users, conn)?.id;
        state.follows.unfollow(user_id, target);
        self.dispatcher
            .send(conn, ServerFrame::Unfollowed { user: target });
        Ok(())
    }

    fn list_users(&self, state: &Registries, conn: &ConnectionId) -> Result<(), CoreError> {
        let user_id = Self::require_user(&state.users, conn)?.id;
        let mut users: Vec<UserSummary> = state
            .users
            .all()
            .into_iter()
            .filter(|u| u.id != user_id)
            .map(|u| Self::user_summary(state, user_id, u))
            .collect();
        users.sort_by(|a, b| a.name.cmp(&b.name));

        self.dispatcher.send(conn, ServerFrame::Users { users });
        Ok(())
    }

    fn list_following(&self, state: &Registries, conn: &ConnectionId) -> Result<(), CoreError> {
        let user_id = Self::require_user(&state.users, conn)?.id;
        let mut users: Vec<UserSummary> = state
            .follows
            .following_of(user_id)
            .into_iter()
            .filter_map(|id| state.users.get(id))
            .map(|u| Self::user_summary(state, user_id, u))
            .collect();
        users.sort_by(|a, b| a.name.cmp(&b.name));

        self.dispatcher.send(conn, ServerFrame::Following { users });
        Ok(())
    }

    // ---- helpers ---------------------------------------------------------

    /// Deliver a follow notification to every *connected* follower of the
    /// summarized session's publisher. Offline followers are skipped; no
    /// queued notification exists.
    fn notify_followers(&self, state: &Registries, kind: NoticeKind, summary: &SessionSummary) {
        let mut notified = 0;
        for follower in state.follows.followers_of(summary.publisher) {
            if let Some(conn) = state.users.get(follower).and_then(|u| u.connection.as_ref()) {
                let notice = FollowNotice {
                    kind,
                    summary: summary.clone(),
                };
                if self.dispatcher.send(conn, ServerFrame::FollowNotification { notice }) {
                    notified += 1;
                }
            }
        }
        debug!(publisher = %summary.publisher, kind = ?kind, notified, "Notified followers");
    }

    /// Everyone who should see a session broadcast: current members plus
    /// the publisher's own connection.
    fn session_audience(
        &self,
        state: &Registries,
        key: &str,
    ) -> Result<Vec<ConnectionId>, CoreError> {
        let mut recipients = state.sessions.members(key)?;
        if let Some(session) = state.sessions.by_key(key) {
            if let Some(conn) = state
                .users
                .get(session.publisher)
                .and_then(|u| u.connection.clone())
            {
                recipients.push(conn);
            }
        }
        Ok(recipients)
    }

    fn require_user<'a>(
        users: &'a UserRegistry,
        conn: &ConnectionId,
    ) -> Result<&'a User, CoreError> {
        users
            .resolve_by_connection(conn)
            .ok_or_else(|| CoreError::not_found("user", conn.as_str()))
    }

    /// Resolve the caller and check they own the session behind `key`.
    fn require_owner(
        state: &Registries,
        conn: &ConnectionId,
        key: &str,
    ) -> Result<UserId, CoreError> {
        let user_id = Self::require_user(&state.users, conn)?.id;
        let session = state
            .sessions
            .by_key(key)
            .ok_or_else(|| CoreError::not_found("session", key))?;
        if session.publisher != user_id {
            return Err(CoreError::RoleConflict(
                "only the session publisher can do that".to_string(),
            ));
        }
        Ok(user_id)
    }

    fn display_name(users: &UserRegistry, id: UserId) -> String {
        users.get(id).map(|u| u.name.clone()).unwrap_or_default()
    }

    fn user_summary(state: &Registries, viewer: UserId, user: &User) -> UserSummary {
        UserSummary {
            id: user.id,
            name: user.name.clone(),
            role: user.role,
            followed: state.follows.is_following(viewer, user.id),
            live_session_key: state
                .sessions
                .by_publisher(user.id)
                .filter(|s| s.status == SessionStatus::Live)
                .map(|s| s.key.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    fn hub() -> Hub {
        Hub::new(HubConfig::default())
    }

    fn attach(hub: &Hub, id: &str) -> (ConnectionId, UnboundedReceiver<ServerFrame>) {
        let conn = ConnectionId::from(id);
        let (tx, rx) = mpsc::unbounded_channel();
        hub.connect(conn.clone(), tx);
        (conn, rx)
    }

    fn recv(rx: &mut UnboundedReceiver<ServerFrame>) -> ServerFrame {
        rx.try_recv().expect("expected a frame")
    }

    fn drain(rx: &mut UnboundedReceiver<ServerFrame>) -> Vec<ServerFrame> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    /// Register a user and return their id, swallowing the confirmation.
    fn register(
        hub: &Hub,
        conn: &ConnectionId,
        rx: &mut UnboundedReceiver<ServerFrame>,
        name: &str,
        role: Role,
    ) -> UserId {
        hub.handle(
            conn,
            ClientFrame::Register {
                name: name.to_string(),
                role,
            },
        );
        match recv(rx) {
            ServerFrame::Registered { profile } => profile.id,
            other => panic!("expected Registered, got {other:?}"),
        }
    }

    /// Create a session and return its key, swallowing the confirmation.
    fn create_session(
        hub: &Hub,
        conn: &ConnectionId,
        rx: &mut UnboundedReceiver<ServerFrame>,
    ) -> String {
        hub.handle(conn, ClientFrame::CreateSession);
        match recv(rx) {
            ServerFrame::SessionCreated { summary } => summary.key,
            other => panic!("expected SessionCreated, got {other:?}"),
        }
    }

    #[test]
    fn test_register_and_empty_name() {
        let hub = hub();
        let (conn, mut rx) = attach(&hub, "c1");

        let id = register(&hub, &conn, &mut rx, "Ana", Role::Publisher);
        assert_ne!(id, UserId::SYSTEM);

        hub.handle(
            &conn,
            ClientFrame::Register {
                name: "   ".into(),
                role: Role::Subscriber,
            },
        );
        match recv(&mut rx) {
            ServerFrame::Error { code, .. } => assert_eq!(code, 1003),
            other => panic!("expected Error, got {other:?}"),
        }
    }

    #[test]
    fn test_only_publishers_create_sessions() {
        let hub = hub();
        let (conn, mut rx) = attach(&hub, "c1");
        register(&hub, &conn, &mut rx, "Vic", Role::Subscriber);

        hub.handle(&conn, ClientFrame::CreateSession);
        match recv(&mut rx) {
            ServerFrame::Error { code, .. } => assert_eq!(code, 1007),
            other => panic!("expected RoleConflict error, got {other:?}"),
        }
    }

    #[test]
    fn test_publisher_busy_until_session_ends() {
        let hub = hub();
        let (conn, mut rx) = attach(&hub, "c1");
        register(&hub, &conn, &mut rx, "Pia", Role::Publisher);
        let key = create_session(&hub, &conn, &mut rx);

        hub.handle(&conn, ClientFrame::CreateSession);
        match recv(&mut rx) {
            ServerFrame::Error { code, .. } => assert_eq!(code, 1006),
            other => panic!("expected PublisherBusy error, got {other:?}"),
        }

        hub.handle(&conn, ClientFrame::EndSession { key });
        assert!(matches!(recv(&mut rx), ServerFrame::SessionEnded { .. }));
        create_session(&hub, &conn, &mut rx);
    }

    #[test]
    fn test_publisher_cannot_join_own_session() {
        let hub = hub();
        let (conn, mut rx) = attach(&hub, "c1");
        register(&hub, &conn, &mut rx, "Pia", Role::Publisher);
        let key = create_session(&hub, &conn, &mut rx);

        hub.handle(&conn, ClientFrame::JoinSession { key });
        match recv(&mut rx) {
            ServerFrame::Error { code, .. } => assert_eq!(code, 1007),
            other => panic!("expected RoleConflict error, got {other:?}"),
        }
    }

    #[test]
    fn test_broadcast_scenario_with_catch_up() {
        let hub = hub();
        let (publisher, mut publisher_rx) = attach(&hub, "pub");
        register(&hub, &publisher, &mut publisher_rx, "Pia", Role::Publisher);
        let key = create_session(&hub, &publisher, &mut publisher_rx);

        // First viewer joins the pending session.
        let (viewer, mut viewer_rx) = attach(&hub, "v1");
        register(&hub, &viewer, &mut viewer_rx, "Vic", Role::Subscriber);
        hub.handle(&viewer, ClientFrame::JoinSession { key: key.clone() });

        match recv(&mut viewer_rx) {
            ServerFrame::SessionJoined { summary, buffered } => {
                assert_eq!(summary.members, 1);
                assert!(buffered.is_empty());
            }
            other => panic!("expected SessionJoined, got {other:?}"),
        }
        assert!(matches!(
            recv(&mut viewer_rx),
            ServerFrame::MemberJoined { count: 1, .. }
        ));

        hub.handle(&publisher, ClientFrame::StartSession { key: key.clone() });

        // 31 data frames against a 30-frame buffer.
        for n in 1..=31u8 {
            hub.handle(
                &publisher,
                ClientFrame::Data {
                    key: key.clone(),
                    payload: vec![n],
                },
            );
        }

        // The first viewer saw every frame live.
        let live_frames: Vec<u8> = drain(&mut viewer_rx)
            .into_iter()
            .filter_map(|f| match f {
                ServerFrame::Data { frame } => Some(frame.payload[0]),
                _ => None,
            })
            .collect();
        assert_eq!(live_frames.len(), 31);
        assert_eq!(live_frames[0], 1);

        // A late joiner gets frames 2..=31 replayed, not frame 1.
        let (late, mut late_rx) = attach(&hub, "v2");
        register(&hub, &late, &mut late_rx, "Lena", Role::Subscriber);
        hub.handle(&late, ClientFrame::JoinSession { key: key.clone() });
        match recv(&mut late_rx) {
            ServerFrame::SessionJoined { buffered, .. } => {
                assert_eq!(buffered.len(), 30);
                assert_eq!(buffered[0].payload[0], 2);
                assert_eq!(buffered[29].payload[0], 31);
            }
            other => panic!("expected SessionJoined, got {other:?}"),
        }

        // Ending tears membership down and retires the key.
        hub.handle(&publisher, ClientFrame::EndSession { key: key.clone() });
        assert!(drain(&mut viewer_rx)
            .iter()
            .any(|f| matches!(f, ServerFrame::SessionEnded { reason: None, .. })));

        hub.handle(&viewer, ClientFrame::JoinSession { key });
        let frames = drain(&mut viewer_rx);
        match frames.last() {
            Some(ServerFrame::Error { code, .. }) => assert_eq!(*code, 1004),
            other => panic!("expected NotFound error, got {other:?}"),
        }
    }

    #[test]
    fn test_member_count_tracks_leaves() {
        let hub = hub();
        let (publisher, mut publisher_rx) = attach(&hub, "pub");
        register(&hub, &publisher, &mut publisher_rx, "Pia", Role::Publisher);
        let key = create_session(&hub, &publisher, &mut publisher_rx);

        let (v1, mut v1_rx) = attach(&hub, "v1");
        register(&hub, &v1, &mut v1_rx, "Vic", Role::Subscriber);
        let (v2, mut v2_rx) = attach(&hub, "v2");
        register(&hub, &v2, &mut v2_rx, "Lena", Role::Subscriber);

        hub.handle(&v1, ClientFrame::JoinSession { key: key.clone() });
        hub.handle(&v2, ClientFrame::JoinSession { key: key.clone() });
        hub.handle(&v1, ClientFrame::LeaveSession { key: key.clone() });

        let counts: Vec<usize> = drain(&mut publisher_rx)
            .into_iter()
            .filter_map(|f| match f {
                ServerFrame::MemberCount { count } => Some(count),
                _ => None,
            })
            .collect();
        assert_eq!(counts, vec![1, 2, 1]);

        // Leaving again is a silent no-op.
        hub.handle(&v1, ClientFrame::LeaveSession { key });
        assert!(drain(&mut publisher_rx).is_empty());
        assert!(drain(&mut v1_rx)
            .iter()
            .all(|f| !matches!(f, ServerFrame::Error { .. })));
    }

    #[test]
    fn test_only_publisher_sends_data() {
        let hub = hub();
        let (publisher, mut publisher_rx) = attach(&hub, "pub");
        register(&hub, &publisher, &mut publisher_rx, "Pia", Role::Publisher);
        let key = create_session(&hub, &publisher, &mut publisher_rx);

        let (viewer, mut viewer_rx) = attach(&hub, "v1");
        register(&hub, &viewer, &mut viewer_rx, "Vic", Role::Subscriber);
        hub.handle(&viewer, ClientFrame::JoinSession { key: key.clone() });
        drain(&mut viewer_rx);

        hub.handle(
            &viewer,
            ClientFrame::Data {
                key,
                payload: vec![1],
            },
        );
        match recv(&mut viewer_rx) {
            ServerFrame::Error { code, .. } => assert_eq!(code, 1007),
            other => panic!("expected RoleConflict error, got {other:?}"),
        }
    }

    #[test]
    fn test_chat_reaches_members_and_publisher() {
        let hub = hub();
        let (publisher, mut publisher_rx) = attach(&hub, "pub");
        register(&hub, &publisher, &mut publisher_rx, "Pia", Role::Publisher);
        let key = create_session(&hub, &publisher, &mut publisher_rx);

        let (viewer, mut viewer_rx) = attach(&hub, "v1");
        register(&hub, &viewer, &mut viewer_rx, "Vic", Role::Subscriber);
        hub.handle(&viewer, ClientFrame::JoinSession { key: key.clone() });
        drain(&mut viewer_rx);
        drain(&mut publisher_rx);

        hub.handle(
            &viewer,
            ClientFrame::Chat {
                key: key.clone(),
                content: "hello".into(),
            },
        );

        for rx in [&mut publisher_rx, &mut viewer_rx] {
            match recv(rx) {
                ServerFrame::ChatBroadcast { message } => {
                    assert_eq!(message.content, "hello");
                    assert_eq!(message.sender_name, "Vic");
                }
                other => panic!("expected ChatBroadcast, got {other:?}"),
            }
        }

        hub.handle(
            &viewer,
            ClientFrame::React {
                key,
                emoji: "🔥".into(),
            },
        );
        assert!(matches!(
            recv(&mut publisher_rx),
            ServerFrame::ReactionBroadcast { .. }
        ));
    }

    #[test]
    fn test_follower_notified_on_start_and_end() {
        let hub = hub();
        let (publisher, mut publisher_rx) = attach(&hub, "pub");
        let publisher_id = register(&hub, &publisher, &mut publisher_rx, "Pia", Role::Publisher);

        let (fan, mut fan_rx) = attach(&hub, "fan");
        register(&hub, &fan, &mut fan_rx, "Fay", Role::Subscriber);
        hub.handle(&fan, ClientFrame::Follow { user: publisher_id });
        assert!(matches!(recv(&mut fan_rx), ServerFrame::Followed { .. }));

        let key = create_session(&hub, &publisher, &mut publisher_rx);
        hub.handle(&publisher, ClientFrame::StartSession { key: key.clone() });

        match recv(&mut fan_rx) {
            ServerFrame::FollowNotification { notice } => {
                assert_eq!(notice.kind, NoticeKind::Started);
                assert_eq!(notice.summary.key, key);
            }
            other => panic!("expected FollowNotification, got {other:?}"),
        }

        hub.handle(&publisher, ClientFrame::EndSession { key });
        match recv(&mut fan_rx) {
            ServerFrame::FollowNotification { notice } => {
                assert_eq!(notice.kind, NoticeKind::Ended);
            }
            other => panic!("expected FollowNotification, got {other:?}"),
        }
    }

    #[test]
    fn test_disconnected_follower_is_skipped() {
        let hub = hub();
        let (publisher, mut publisher_rx) = attach(&hub, "pub");
        let publisher_id = register(&hub, &publisher, &mut publisher_rx, "Pia", Role::Publisher);

        let (fan, mut fan_rx) = attach(&hub, "fan");
        register(&hub, &fan, &mut fan_rx, "Fay", Role::Subscriber);
        hub.handle(&fan, ClientFrame::Follow { user: publisher_id });
        drain(&mut fan_rx);

        hub.disconnect(&fan);

        let key = create_session(&hub, &publisher, &mut publisher_rx);
        hub.handle(&publisher, ClientFrame::StartSession { key });
        assert!(drain(&mut fan_rx).is_empty());
    }

    #[test]
    fn test_unfollowed_publisher_stops_notifying() {
        let hub = hub();
        let (publisher, mut publisher_rx) = attach(&hub, "pub");
        let publisher_id = register(&hub, &publisher, &mut publisher_rx, "Pia", Role::Publisher);

        let (fan, mut fan_rx) = attach(&hub, "fan");
        register(&hub, &fan, &mut fan_rx, "Fay", Role::Subscriber);
        hub.handle(&fan, ClientFrame::Follow { user: publisher_id });
        hub.handle(&fan, ClientFrame::Unfollow { user: publisher_id });
        drain(&mut fan_rx);

        let key = create_session(&hub, &publisher, &mut publisher_rx);
        hub.handle(&publisher, ClientFrame::StartSession { key });
        assert!(drain(&mut fan_rx).is_empty());
    }

    #[test]
    fn test_self_follow_is_rejected() {
        let hub = hub();
        let (conn, mut rx) = attach(&hub, "c1");
        let id = register(&hub, &conn, &mut rx, "Ana", Role::Subscriber);

        hub.handle(&conn, ClientFrame::Follow { user: id });
        match recv(&mut rx) {
            ServerFrame::Error { code, .. } => assert_eq!(code, 1003),
            other => panic!("expected InvalidInput error, got {other:?}"),
        }
    }

    #[test]
    fn test_reconnection_preserves_identity_and_edges() {
        let hub = hub();
        let (publisher, mut publisher_rx) = attach(&hub, "pub");
        let publisher_id = register(&hub, &publisher, &mut publisher_rx, "Pia", Role::Publisher);

        let (conn1, mut rx1) = attach(&hub, "c1");
        let ana_id = register(&hub, &conn1, &mut rx1, "Ana", Role::Subscriber);
        hub.handle(&conn1, ClientFrame::Follow { user: publisher_id });
        drain(&mut rx1);

        hub.disconnect(&conn1);

        // Re-register with different casing: same identity comes back.
        let (conn2, mut rx2) = attach(&hub, "c2");
        let again = register(&hub, &conn2, &mut rx2, "ana", Role::Subscriber);
        assert_eq!(again, ana_id);

        // The preserved follow edge notifies the new connection.
        let key = create_session(&hub, &publisher, &mut publisher_rx);
        hub.handle(&publisher, ClientFrame::StartSession { key });
        assert!(matches!(
            recv(&mut rx2),
            ServerFrame::FollowNotification { .. }
        ));
    }

    #[test]
    fn test_reregistration_displaces_old_connection() {
        let hub = hub();
        let (publisher, mut publisher_rx) = attach(&hub, "pub");
        register(&hub, &publisher, &mut publisher_rx, "Pia", Role::Publisher);
        let key = create_session(&hub, &publisher, &mut publisher_rx);

        let (conn1, mut rx1) = attach(&hub, "c1");
        register(&hub, &conn1, &mut rx1, "Ana", Role::Subscriber);
        hub.handle(&conn1, ClientFrame::JoinSession { key: key.clone() });
        drain(&mut publisher_rx);

        // Same identity comes back on a fresh connection while the old one
        // is still a session member: the old handle is closed out.
        let (conn2, mut rx2) = attach(&hub, "c2");
        register(&hub, &conn2, &mut rx2, "Ana", Role::Subscriber);

        let frames = drain(&mut publisher_rx);
        assert!(frames
            .iter()
            .any(|f| matches!(f, ServerFrame::MemberLeft { count: 0, .. })));

        // The new connection can join cleanly.
        hub.handle(&conn2, ClientFrame::JoinSession { key });
        assert!(matches!(
            recv(&mut rx2),
            ServerFrame::SessionJoined { .. }
        ));
    }

    #[test]
    fn test_publisher_disconnect_ends_session_with_reason() {
        let hub = hub();
        let (publisher, mut publisher_rx) = attach(&hub, "pub");
        register(&hub, &publisher, &mut publisher_rx, "Pia", Role::Publisher);
        let key = create_session(&hub, &publisher, &mut publisher_rx);

        let (viewer, mut viewer_rx) = attach(&hub, "v1");
        register(&hub, &viewer, &mut viewer_rx, "Vic", Role::Subscriber);
        hub.handle(&viewer, ClientFrame::JoinSession { key: key.clone() });
        drain(&mut viewer_rx);

        hub.disconnect(&publisher);

        let frames = drain(&mut viewer_rx);
        assert!(frames.iter().any(|f| matches!(
            f,
            ServerFrame::SessionEnded { reason: Some(r), .. } if r == "publisher disconnected"
        )));

        // The identity is disconnected, not purged.
        let stats = hub.stats();
        assert_eq!(stats.users.total, 2);
        assert_eq!(stats.users.disconnected, 1);
    }

    #[test]
    fn test_viewer_disconnect_leaves_session() {
        let hub = hub();
        let (publisher, mut publisher_rx) = attach(&hub, "pub");
        register(&hub, &publisher, &mut publisher_rx, "Pia", Role::Publisher);
        let key = create_session(&hub, &publisher, &mut publisher_rx);

        let (viewer, mut viewer_rx) = attach(&hub, "v1");
        register(&hub, &viewer, &mut viewer_rx, "Vic", Role::Subscriber);
        hub.handle(&viewer, ClientFrame::JoinSession { key: key.clone() });
        drain(&mut publisher_rx);
        drain(&mut viewer_rx);

        hub.disconnect(&viewer);

        let frames = drain(&mut publisher_rx);
        assert!(frames
            .iter()
            .any(|f| matches!(f, ServerFrame::MemberLeft { count: 0, .. })));
    }

    #[test]
    fn test_users_list_shows_follow_state_and_live_key() {
        let hub = hub();
        let (publisher, mut publisher_rx) = attach(&hub, "pub");
        let publisher_id = register(&hub, &publisher, &mut publisher_rx, "Pia", Role::Publisher);
        let key = create_session(&hub, &publisher, &mut publisher_rx);
        hub.handle(&publisher, ClientFrame::StartSession { key: key.clone() });
        drain(&mut publisher_rx);

        let (viewer, mut viewer_rx) = attach(&hub, "v1");
        register(&hub, &viewer, &mut viewer_rx, "Vic", Role::Subscriber);
        hub.handle(&viewer, ClientFrame::Follow { user: publisher_id });
        drain(&mut viewer_rx);

        hub.handle(&viewer, ClientFrame::ListUsers);
        match recv(&mut viewer_rx) {
            ServerFrame::Users { users } => {
                assert_eq!(users.len(), 1);
                assert_eq!(users[0].id, publisher_id);
                assert!(users[0].followed);
                assert_eq!(users[0].live_session_key.as_deref(), Some(key.as_str()));
            }
            other => panic!("expected Users, got {other:?}"),
        }

        hub.handle(&viewer, ClientFrame::ListFollowing);
        match recv(&mut viewer_rx) {
            ServerFrame::Following { users } => {
                assert_eq!(users.len(), 1);
                assert_eq!(users[0].name, "Pia");
            }
            other => panic!("expected Following, got {other:?}"),
        }
    }

    #[test]
    fn test_signal_relay_is_opaque() {
        let hub = hub();
        let (a, _a_rx) = attach(&hub, "conn-a");
        let (_b, mut b_rx) = attach(&hub, "conn-b");

        let payload = serde_json::json!({"sdp": "v=0", "nested": {"x": 1}});
        hub.handle(
            &a,
            ClientFrame::Signal {
                kind: beam_protocol::SignalKind::Offer,
                target: "conn-b".into(),
                payload: payload.clone(),
            },
        );

        match recv(&mut b_rx) {
            ServerFrame::Signal {
                kind,
                from,
                payload: received,
            } => {
                assert_eq!(kind, beam_protocol::SignalKind::Offer);
                assert_eq!(from, "conn-a");
                assert_eq!(received, payload);
            }
            other => panic!("expected Signal, got {other:?}"),
        }
    }

    #[test]
    fn test_purge_drops_edges_permanently() {
        let hub = hub();
        let (publisher, mut publisher_rx) = attach(&hub, "pub");
        let publisher_id = register(&hub, &publisher, &mut publisher_rx, "Pia", Role::Publisher);

        let (fan, mut fan_rx) = attach(&hub, "fan");
        let fan_id = register(&hub, &fan, &mut fan_rx, "Fay", Role::Subscriber);
        hub.handle(&fan, ClientFrame::Follow { user: publisher_id });
        drain(&mut fan_rx);

        assert!(hub.purge_user(fan_id));
        assert!(!hub.purge_user(fan_id), "second purge finds nothing");

        let key = create_session(&hub, &publisher, &mut publisher_rx);
        hub.handle(&publisher, ClientFrame::StartSession { key });
        assert!(drain(&mut fan_rx).is_empty());
        assert_eq!(hub.stats().users.total, 1);
    }

    #[test]
    fn test_ping_pong() {
        let hub = hub();
        let (conn, mut rx) = attach(&hub, "c1");
        hub.handle(&conn, ClientFrame::Ping { timestamp: Some(42) });
        assert_eq!(recv(&mut rx), ServerFrame::Pong { timestamp: Some(42) });
    }
}
