//! Per-connection session state and the session table
//!
//! This module covers the server-side view of each connected peer:
//! - Connection lifecycle (accept, authenticate, disconnect, idle timeout)
//! - The coarse connection-state machine and its command whitelist
//! - A FIFO outbound queue drained by exactly one writer task
//! - Capacity enforcement and id allocation for new connections
//!
//! Room membership is owned by the registry; a session only mirrors its
//! current room id so the dispatcher can authorize commands cheaply.

use crate::room::RoomId;
use log::{info, warn};
use shared::CommandKind;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};

pub type SessionId = u64;

/// Frames a session may have queued but not yet written before it is cut off.
pub const DEFAULT_MAX_QUEUED_FRAMES: usize = 1024;
pub type SessionHandle = Arc<Session>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Connected,
    InLobby,
    InRoom,
    InGame,
    Disconnected,
}

impl ConnectionState {
    /// Whether `kind` may be issued from this state.
    pub fn allows(self, kind: CommandKind) -> bool {
        use CommandKind::*;
        match self {
            ConnectionState::Connected => matches!(kind, Ping | Auth | Register | Guest | Validate),
            ConnectionState::InLobby => matches!(
                kind,
                Ping | Logout
                    | Validate
                    | RoomCreate
                    | RoomJoin
                    | RoomList
                    | LobbyList
                    | UserStats
                    | Chat
            ),
            ConnectionState::InRoom => matches!(
                kind,
                Ping | RoomLeave
                    | RoomList
                    | RoomReady
                    | RoomStart
                    | RoomTransfer
                    | RoomKick
                    | RoomAddAi
                    | RoomRemoveAi
                    | RoomInfo
                    | LobbyList
                    | UserStats
                    | Chat
            ),
            ConnectionState::InGame => matches!(
                kind,
                Ping | RoomLeave | RoomEnd | RoomInfo | GameMove | UserStats | Chat
            ),
            ConnectionState::Disconnected => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Connected => "connected",
            ConnectionState::InLobby => "lobby",
            ConnectionState::InRoom => "room",
            ConnectionState::InGame => "game",
            ConnectionState::Disconnected => "disconnected",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub display_name: String,
    pub token: String,
}

/// Work items for a session's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Frame(String),
    /// Flush what is queued, then close the socket.
    Close,
}

/// State changes a room applies to member sessions as part of a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    EnterGame(RoomId),
    LeaveGame(RoomId),
    ReturnToLobby(RoomId),
}

#[derive(Debug)]
struct SessionState {
    identity: Option<Identity>,
    connection: ConnectionState,
    room: Option<RoomId>,
    last_activity: Instant,
    violations: u32,
}

#[derive(Debug)]
pub struct Session {
    id: SessionId,
    peer: SocketAddr,
    outbound: mpsc::UnboundedSender<Outbound>,
    /// Frames queued and not yet written by the writer task.
    queued: AtomicUsize,
    queue_limit: usize,
    overflowed: AtomicBool,
    disconnected: AtomicBool,
    shutdown: Notify,
    state: Mutex<SessionState>,
}

impl Session {
    /// Creates a session and the receiving end of its outbound queue.
    pub fn new(id: SessionId, peer: SocketAddr) -> (SessionHandle, mpsc::UnboundedReceiver<Outbound>) {
        Self::with_queue_limit(id, peer, DEFAULT_MAX_QUEUED_FRAMES)
    }

    /// Like [`new`](Self::new), but the session is closed once more than
    /// `queue_limit` frames are waiting for the writer.
    ///
    /// The channel itself is unbounded. The limit is enforced by counting
    /// frames in [`send`](Self::send) and [`frame_written`](Self::frame_written).
    pub fn with_queue_limit(
        id: SessionId,
        peer: SocketAddr,
        queue_limit: usize,
    ) -> (SessionHandle, mpsc::UnboundedReceiver<Outbound>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let session = Arc::new(Self {
            id,
            peer,
            outbound,
            queued: AtomicUsize::new(0),
            queue_limit,
            overflowed: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
            shutdown: Notify::new(),
            state: Mutex::new(SessionState {
                identity: None,
                connection: ConnectionState::Connected,
                room: None,
                last_activity: Instant::now(),
                violations: 0,
            }),
        });
        (session, rx)
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Queues a frame. Returns false once the writer has gone away or the
    /// peer has stopped draining its queue.
    pub fn send(&self, message: impl Into<String>) -> bool {
        if self.is_disconnected() || self.overflowed.load(Ordering::SeqCst) {
            return false;
        }
        if self.queued.fetch_add(1, Ordering::SeqCst) >= self.queue_limit {
            self.queued.fetch_sub(1, Ordering::SeqCst);
            if !self.overflowed.swap(true, Ordering::SeqCst) {
                warn!(
                    "Session {} has {} unwritten frames, closing",
                    self.id, self.queue_limit
                );
                self.shutdown.notify_one();
            }
            return false;
        }
        if self.outbound.send(Outbound::Frame(message.into())).is_err() {
            self.queued.fetch_sub(1, Ordering::SeqCst);
            return false;
        }
        true
    }

    /// Called by the writer after each frame hits the socket.
    pub fn frame_written(&self) {
        self.queued.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn queued_frames(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    /// True once the outbound queue hit its limit.
    pub fn is_overflowed(&self) -> bool {
        self.overflowed.load(Ordering::SeqCst)
    }

    /// Asks the writer to flush and close, and wakes the reader.
    pub fn close(&self) {
        let _ = self.outbound.send(Outbound::Close);
        self.shutdown.notify_one();
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub async fn closed(&self) {
        self.shutdown.notified().await;
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().connection
    }

    pub fn identity(&self) -> Option<Identity> {
        self.lock().identity.clone()
    }

    pub fn user_id(&self) -> Option<String> {
        self.lock().identity.as_ref().map(|id| id.user_id.clone())
    }

    pub fn display_name(&self) -> Option<String> {
        self.lock().identity.as_ref().map(|id| id.display_name.clone())
    }

    pub fn room_id(&self) -> Option<RoomId> {
        self.lock().room
    }

    /// Connected -> InLobby.
    pub fn authenticate(&self, identity: Identity) {
        let mut state = self.lock();
        state.identity = Some(identity);
        state.connection = ConnectionState::InLobby;
    }

    /// InLobby -> Connected.
    pub fn logout(&self) {
        let mut state = self.lock();
        state.identity = None;
        state.room = None;
        state.connection = ConnectionState::Connected;
    }

    /// InLobby -> InRoom.
    pub fn enter_room(&self, room_id: RoomId) {
        let mut state = self.lock();
        state.room = Some(room_id);
        if state.connection != ConnectionState::Disconnected {
            state.connection = ConnectionState::InRoom;
        }
    }

    /// InRoom/InGame -> InLobby.
    pub fn leave_room(&self) {
        let mut state = self.lock();
        state.room = None;
        if state.connection != ConnectionState::Disconnected {
            state.connection = ConnectionState::InLobby;
        }
    }

    /// Applies a room-driven transition if the session is still in that room.
    pub fn apply(&self, transition: Transition) -> bool {
        let mut state = self.lock();
        let (room_id, from, to) = match transition {
            Transition::EnterGame(id) => (id, ConnectionState::InRoom, ConnectionState::InGame),
            Transition::LeaveGame(id) => (id, ConnectionState::InGame, ConnectionState::InRoom),
            Transition::ReturnToLobby(id) => {
                if state.room != Some(id) || state.connection == ConnectionState::Disconnected {
                    return false;
                }
                state.room = None;
                state.connection = ConnectionState::InLobby;
                return true;
            }
        };
        if state.room != Some(room_id) || state.connection != from {
            return false;
        }
        state.connection = to;
        true
    }

    pub fn touch(&self) {
        self.lock().last_activity = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.lock().last_activity.elapsed()
    }

    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.idle_for() > timeout
    }

    /// Bumps the consecutive-violation counter and returns the new value.
    pub fn record_violation(&self) -> u32 {
        let mut state = self.lock();
        state.violations += 1;
        state.violations
    }

    pub fn clear_violations(&self) {
        self.lock().violations = 0;
    }

    /// Flags the session as gone. Only the first caller gets `true`, so
    /// cleanup runs exactly once whichever path noticed the disconnect.
    pub fn mark_disconnected(&self) -> bool {
        let first = !self.disconnected.swap(true, Ordering::SeqCst);
        if first {
            self.lock().connection = ConnectionState::Disconnected;
        }
        first
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    /// False once the writer task has dropped its receiver.
    pub fn is_link_alive(&self) -> bool {
        !self.outbound.is_closed()
    }
}

/// Owns every live session, enforces capacity and hands out ids
pub struct SessionManager {
    /// Live sessions indexed by id
    sessions: HashMap<SessionId, SessionHandle>,
    /// Next id to hand out; ids are never reused
    next_session_id: SessionId,
    /// Maximum number of concurrent sessions
    max_sessions: usize,
    /// Outbound frame limit handed to each new session
    queue_limit: usize,
}

impl SessionManager {
    /// Creates an empty table with the given capacity. Ids start at 1.
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            next_session_id: 1,
            max_sessions,
            queue_limit: DEFAULT_MAX_QUEUED_FRAMES,
        }
    }

    /// Sets the outbound frame limit for sessions added from now on.
    pub fn with_queue_limit(mut self, queue_limit: usize) -> Self {
        self.queue_limit = queue_limit;
        self
    }

    /// Registers a new connection
    ///
    /// Returns `None` when the server is at capacity. The caller owns the
    /// returned receiver and must hand it to the connection's writer task.
    pub fn add_session(
        &mut self,
        peer: SocketAddr,
    ) -> Option<(SessionHandle, mpsc::UnboundedReceiver<Outbound>)> {
        if self.sessions.len() >= self.max_sessions {
            return None;
        }

        let session_id = self.next_session_id;
        self.next_session_id += 1;

        let (session, rx) = Session::with_queue_limit(session_id, peer, self.queue_limit);
        info!("Session {} connected from {}", session_id, peer);
        self.sessions.insert(session_id, Arc::clone(&session));
        Some((session, rx))
    }

    /// Drops a session from the table, returning it if it was present.
    pub fn remove_session(&mut self, session_id: &SessionId) -> Option<SessionHandle> {
        let removed = self.sessions.remove(session_id);
        if let Some(session) = &removed {
            info!("Session {} removed ({})", session.id(), session.peer());
        }
        removed
    }

    pub fn get(&self, session_id: &SessionId) -> Option<SessionHandle> {
        self.sessions.get(session_id).cloned()
    }

    /// Live session currently authenticated as `user_id`.
    pub fn find_by_user(&self, user_id: &str) -> Option<SessionHandle> {
        self.sessions
            .values()
            .find(|s| !s.is_disconnected() && s.user_id().as_deref() == Some(user_id))
            .cloned()
    }

    /// Authenticated sessions sitting in the lobby.
    pub fn lobby_sessions(&self) -> Vec<SessionHandle> {
        let mut lobby: Vec<SessionHandle> = self
            .sessions
            .values()
            .filter(|s| s.state() == ConnectionState::InLobby)
            .cloned()
            .collect();
        lobby.sort_by_key(|s| s.id());
        lobby
    }

    /// Every session in the table, oldest first.
    pub fn all_sessions(&self) -> Vec<SessionHandle> {
        let mut sessions: Vec<SessionHandle> = self.sessions.values().cloned().collect();
        sessions.sort_by_key(|s| s.id());
        sessions
    }

    /// Every authenticated session, oldest connection first.
    pub fn authenticated_sessions(&self) -> Vec<SessionHandle> {
        let mut sessions: Vec<SessionHandle> = self
            .sessions
            .values()
            .filter(|s| !s.is_disconnected() && s.identity().is_some())
            .cloned()
            .collect();
        sessions.sort_by_key(|s| s.id());
        sessions
    }

    /// Sessions silent for longer than `timeout`
    ///
    /// They stay in the table; the caller runs the normal disconnect path,
    /// which removes them.
    pub fn check_timeouts(&self, timeout: Duration) -> Vec<SessionHandle> {
        self.sessions
            .values()
            .filter(|s| s.is_timed_out(timeout))
            .cloned()
            .collect()
    }

    /// Sessions whose writer is gone or that were flagged but never removed.
    pub fn dead_sessions(&self) -> Vec<SessionHandle> {
        self.sessions
            .values()
            .filter(|s| s.is_disconnected() || !s.is_link_alive())
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port)
    }

    fn identity(name: &str) -> Identity {
        Identity {
            user_id: format!("user_{name}"),
            display_name: name.to_string(),
            token: "t".to_string(),
        }
    }

    #[test]
    fn test_whitelist_per_state() {
        use ConnectionState::*;
        assert!(Connected.allows(CommandKind::Auth));
        assert!(!Connected.allows(CommandKind::RoomCreate));
        assert!(InLobby.allows(CommandKind::RoomJoin));
        assert!(!InLobby.allows(CommandKind::GameMove));
        assert!(InRoom.allows(CommandKind::RoomStart));
        assert!(!InRoom.allows(CommandKind::GameMove));
        assert!(InGame.allows(CommandKind::GameMove));
        assert!(!InGame.allows(CommandKind::RoomStart));
        assert!(!InGame.allows(CommandKind::Auth));
        for kind in CommandKind::ALL {
            assert!(!Disconnected.allows(kind));
        }
        for state in [Connected, InLobby, InRoom, InGame] {
            assert!(state.allows(CommandKind::Ping));
        }
    }

    #[test]
    fn test_session_lifecycle() {
        let (session, _rx) = Session::new(1, addr(1000));
        assert_eq!(session.state(), ConnectionState::Connected);
        assert!(session.identity().is_none());

        session.authenticate(identity("alice"));
        assert_eq!(session.state(), ConnectionState::InLobby);
        assert_eq!(session.user_id().as_deref(), Some("user_alice"));

        session.enter_room(1001);
        assert_eq!(session.state(), ConnectionState::InRoom);
        assert_eq!(session.room_id(), Some(1001));

        assert!(session.apply(Transition::EnterGame(1001)));
        assert_eq!(session.state(), ConnectionState::InGame);
        assert!(session.apply(Transition::LeaveGame(1001)));
        assert_eq!(session.state(), ConnectionState::InRoom);

        session.leave_room();
        assert_eq!(session.state(), ConnectionState::InLobby);
        assert_eq!(session.room_id(), None);

        session.logout();
        assert_eq!(session.state(), ConnectionState::Connected);
        assert!(session.identity().is_none());
    }

    #[test]
    fn test_transitions_ignore_other_rooms() {
        let (session, _rx) = Session::new(1, addr(1000));
        session.authenticate(identity("bob"));
        session.enter_room(1001);
        assert!(!session.apply(Transition::EnterGame(1002)));
        assert!(!session.apply(Transition::LeaveGame(1001)));
        assert_eq!(session.state(), ConnectionState::InRoom);
        assert!(session.apply(Transition::ReturnToLobby(1001)));
        assert_eq!(session.state(), ConnectionState::InLobby);
    }

    #[test]
    fn test_outbound_queue_is_fifo() {
        let (session, mut rx) = Session::new(1, addr(1000));
        assert!(session.send("one"));
        assert!(session.send("two"));
        session.close();
        assert_eq!(rx.try_recv().unwrap(), Outbound::Frame("one".into()));
        assert_eq!(rx.try_recv().unwrap(), Outbound::Frame("two".into()));
        assert_eq!(rx.try_recv().unwrap(), Outbound::Close);
    }

    #[test]
    fn test_close_wakes_reader() {
        let (session, _rx) = Session::new(1, addr(1000));
        let mut closed = tokio_test::task::spawn(session.closed());
        tokio_test::assert_pending!(closed.poll());
        session.close();
        assert!(closed.is_woken());
        tokio_test::assert_ready!(closed.poll());
    }

    #[test]
    fn test_queue_limit_closes_slow_reader() {
        let (session, _rx) = Session::with_queue_limit(1, addr(1000), 2);
        let mut closed = tokio_test::task::spawn(session.closed());
        tokio_test::assert_pending!(closed.poll());

        assert!(session.send("pong"));
        assert!(session.send("pong"));
        assert!(!session.is_overflowed());
        assert!(!session.send("pong"));
        assert!(session.is_overflowed());
        assert_eq!(session.queued_frames(), 2);

        assert!(closed.is_woken());
        tokio_test::assert_ready!(closed.poll());
        assert!(!session.send("pong"));
    }

    #[test]
    fn test_written_frames_free_queue_space() {
        let (session, mut rx) = Session::with_queue_limit(1, addr(1000), 2);
        for i in 0..10 {
            assert!(session.send(format!("frame {i}")));
            assert_eq!(rx.try_recv().unwrap(), Outbound::Frame(format!("frame {i}")));
            session.frame_written();
        }
        assert_eq!(session.queued_frames(), 0);
        assert!(!session.is_overflowed());
    }

    #[test]
    fn test_manager_applies_queue_limit() {
        let mut manager = SessionManager::new(4).with_queue_limit(1);
        let (session, _rx) = manager.add_session(addr(1000)).unwrap();
        assert!(session.send("first"));
        assert!(!session.send("second"));
        assert!(session.is_overflowed());
    }

    #[test]
    fn test_send_fails_after_receiver_dropped() {
        let (session, rx) = Session::new(1, addr(1000));
        drop(rx);
        assert!(!session.is_link_alive());
        assert!(!session.send("lost"));
    }

    #[test]
    fn test_mark_disconnected_only_once() {
        let (session, _rx) = Session::new(1, addr(1000));
        assert!(session.mark_disconnected());
        assert!(!session.mark_disconnected());
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(!session.send("late"));
    }

    #[test]
    fn test_mark_disconnected_races() {
        let (session, _rx) = Session::new(1, addr(1000));
        let winners: usize = (0..8)
            .map(|_| {
                let s = Arc::clone(&session);
                std::thread::spawn(move || s.mark_disconnected())
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| usize::from(h.join().unwrap()))
            .sum();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_violation_counter() {
        let (session, _rx) = Session::new(1, addr(1000));
        assert_eq!(session.record_violation(), 1);
        assert_eq!(session.record_violation(), 2);
        session.clear_violations();
        assert_eq!(session.record_violation(), 1);
    }

    #[tokio::test]
    async fn test_close_wakes_waiter() {
        let (session, _rx) = Session::new(1, addr(1000));
        let waiter = {
            let s = Arc::clone(&session);
            tokio::spawn(async move { s.closed().await })
        };
        session.close();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("closed() resolved")
            .unwrap();
    }

    #[test]
    fn test_manager_capacity_and_ids() {
        let mut manager = SessionManager::new(2);
        let (a, _ra) = manager.add_session(addr(1)).unwrap();
        let (b, _rb) = manager.add_session(addr(2)).unwrap();
        assert!(manager.add_session(addr(3)).is_none());
        assert_eq!((a.id(), b.id()), (1, 2));

        assert!(manager.remove_session(&a.id()).is_some());
        assert!(manager.remove_session(&a.id()).is_none());
        let (c, _rc) = manager.add_session(addr(3)).unwrap();
        assert_eq!(c.id(), 3, "ids are never reused");
        assert_eq!(manager.len(), 2);
    }

    #[test]
    fn test_manager_lookup_and_lobby() {
        let mut manager = SessionManager::new(10);
        let (a, _ra) = manager.add_session(addr(1)).unwrap();
        let (b, _rb) = manager.add_session(addr(2)).unwrap();
        let (_c, _rc) = manager.add_session(addr(3)).unwrap();
        a.authenticate(identity("alice"));
        b.authenticate(identity("bob"));
        b.enter_room(1001);

        assert_eq!(manager.find_by_user("user_bob").map(|s| s.id()), Some(b.id()));
        assert!(manager.find_by_user("user_nobody").is_none());

        let lobby: Vec<SessionId> = manager.lobby_sessions().iter().map(|s| s.id()).collect();
        assert_eq!(lobby, vec![a.id()]);
    }

    #[test]
    fn test_manager_timeouts_and_dead_sessions() {
        let mut manager = SessionManager::new(10);
        let (a, _ra) = manager.add_session(addr(1)).unwrap();
        let (b, rb) = manager.add_session(addr(2)).unwrap();

        assert!(manager.check_timeouts(Duration::from_secs(60)).is_empty());
        std::thread::sleep(Duration::from_millis(20));
        a.touch();
        let idle = manager.check_timeouts(Duration::from_millis(10));
        assert_eq!(idle.iter().map(|s| s.id()).collect::<Vec<_>>(), vec![b.id()]);

        drop(rb);
        let dead = manager.dead_sessions();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].id(), b.id());
    }
}
