//! Command dispatch: parse, authorize against the session state, run the
//! handler, reply.
//!
//! Handlers return `Result<(), CommandError>`; this module is the only
//! place failures become `ERROR:` replies. Collaborator calls happen here,
//! never while a room lock is held.

use crate::error::{CommandError, ErrorKind};
use crate::registry::{RegistryError, RoomRegistry};
use crate::room::{GameSummary, Room, RoomId};
use crate::services::{AuthGrant, CredentialService, PersistenceService};
use crate::session::{ConnectionState, Identity, SessionHandle, SessionManager};
use log::{debug, error, info, warn};
use shared::protocol::{Command, CommandKind};
use shared::{Flip, PieceKind, Rotation};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

pub const MAX_CHAT_LEN: usize = 200;

/// Whether the connection should stay open after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

pub struct Dispatcher {
    registry: Arc<RoomRegistry>,
    sessions: Arc<RwLock<SessionManager>>,
    credentials: Arc<dyn CredentialService>,
    persistence: Arc<dyn PersistenceService>,
    max_violations: u32,
}

fn identity_of(session: &SessionHandle) -> Result<Identity, CommandError> {
    session
        .identity()
        .ok_or_else(|| CommandError::unauthorized("log in first"))
}

fn required<'a>(command: &'a Command, index: usize, what: &str) -> Result<&'a str, CommandError> {
    command
        .arg(index)
        .ok_or_else(|| CommandError::bad_request(format!("missing {what}")))
}

fn parsed<T: FromStr>(command: &Command, index: usize, what: &str) -> Result<T, CommandError> {
    required(command, index, what)?
        .trim()
        .parse()
        .map_err(|_| CommandError::bad_request(format!("invalid {what}")))
}

fn flag(command: &Command, index: usize, what: &str) -> Result<Option<bool>, CommandError> {
    match command.arg(index) {
        None => Ok(None),
        Some("1") => Ok(Some(true)),
        Some("0") => Ok(Some(false)),
        Some(_) => Err(CommandError::bad_request(format!("{what} must be 0 or 1"))),
    }
}

impl Dispatcher {
    pub fn new(
        registry: Arc<RoomRegistry>,
        sessions: Arc<RwLock<SessionManager>>,
        credentials: Arc<dyn CredentialService>,
        persistence: Arc<dyn PersistenceService>,
        max_violations: u32,
    ) -> Self {
        Self {
            registry,
            sessions,
            credentials,
            persistence,
            max_violations,
        }
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    pub fn sessions(&self) -> &Arc<RwLock<SessionManager>> {
        &self.sessions
    }

    /// Handles one inbound frame and queues every reply it produces.
    pub async fn dispatch(&self, session: &SessionHandle, raw: &str) -> Flow {
        session.touch();
        let result = match Command::parse(raw) {
            Ok(command) => self.route(session, &command).await,
            Err(err) => Err(err.into()),
        };

        let err = match result {
            Ok(()) => {
                session.clear_violations();
                return Flow::Continue;
            }
            Err(err) => err,
        };

        if err.kind == ErrorKind::Internal {
            error!("Session {} command failed: {}", session.id(), err);
        } else {
            debug!("Session {} rejected: {}", session.id(), err);
        }
        session.send(err.to_reply());

        if err.is_violation() {
            let count = session.record_violation();
            if count > self.max_violations {
                warn!(
                    "Session {} closed after {} consecutive violations",
                    session.id(),
                    count
                );
                return Flow::Close;
            }
        }
        Flow::Continue
    }

    async fn route(&self, session: &SessionHandle, command: &Command) -> Result<(), CommandError> {
        let state = session.state();
        if !state.allows(command.kind) {
            return Err(CommandError::unauthorized(format!(
                "{} is not allowed while {}",
                command.kind.as_str(),
                state.as_str()
            )));
        }

        match command.kind {
            CommandKind::Ping => {
                session.send("pong");
                Ok(())
            }
            CommandKind::Auth => self.handle_auth(session, command).await,
            CommandKind::Register => self.handle_register(session, command).await,
            CommandKind::Guest => self.handle_guest(session, command).await,
            CommandKind::Logout => self.handle_logout(session),
            CommandKind::Validate => self.handle_validate(session, command).await,
            CommandKind::RoomCreate => self.handle_room_create(session, command).await,
            CommandKind::RoomJoin => self.handle_room_join(session, command).await,
            CommandKind::RoomLeave => self.handle_room_leave(session).await,
            CommandKind::RoomList => self.handle_room_list(session).await,
            CommandKind::RoomInfo => self.handle_room_info(session).await,
            CommandKind::RoomReady => self.handle_room_ready(session, command).await,
            CommandKind::RoomStart => self.handle_room_start(session).await,
            CommandKind::RoomEnd => self.handle_room_end(session).await,
            CommandKind::RoomTransfer => self.handle_room_transfer(session, command).await,
            CommandKind::RoomKick => self.handle_room_kick(session, command).await,
            CommandKind::RoomAddAi => self.handle_room_add_ai(session, command).await,
            CommandKind::RoomRemoveAi => self.handle_room_remove_ai(session, command).await,
            CommandKind::GameMove => self.handle_game_move(session, command).await,
            CommandKind::Chat => self.handle_chat(session, command).await,
            CommandKind::LobbyList => self.handle_lobby_list(session).await,
            CommandKind::UserStats => self.handle_user_stats(session, command).await,
        }
    }

    /// Binds `grant` to the session unless that user is already online
    /// elsewhere. The session table lock makes the check and bind atomic.
    async fn bind_identity(
        &self,
        session: &SessionHandle,
        grant: AuthGrant,
    ) -> Result<Identity, CommandError> {
        let sessions = self.sessions.write().await;
        if let Some(other) = sessions.find_by_user(&grant.user_id) {
            if other.id() != session.id() {
                return Err(CommandError::new(
                    ErrorKind::Validation,
                    "already_online",
                    "user is already connected",
                ));
            }
        }
        let identity = Identity {
            user_id: grant.user_id,
            display_name: grant.display_name,
            token: grant.token,
        };
        session.authenticate(identity.clone());
        info!(
            "Session {} authenticated as {}",
            session.id(),
            identity.user_id
        );
        Ok(identity)
    }

    async fn handle_auth(&self, session: &SessionHandle, command: &Command) -> Result<(), CommandError> {
        let username = required(command, 0, "username")?;
        let password = required(command, 1, "password")?;
        let grant = self.credentials.login(username, password).await?;
        let identity = self.bind_identity(session, grant).await?;
        session.send(format!(
            "AUTH_SUCCESS:{}:{}",
            identity.display_name, identity.token
        ));
        Ok(())
    }

    async fn handle_register(
        &self,
        session: &SessionHandle,
        command: &Command,
    ) -> Result<(), CommandError> {
        let username = required(command, 0, "username")?;
        let password = required(command, 1, "password")?;
        self.credentials.register(username, password).await?;
        session.send(format!("REGISTER_SUCCESS:{username}"));

        let grant = self.credentials.login(username, password).await?;
        let identity = self.bind_identity(session, grant).await?;
        session.send(format!(
            "AUTH_SUCCESS:{}:{}",
            identity.display_name, identity.token
        ));
        Ok(())
    }

    async fn handle_guest(&self, session: &SessionHandle, command: &Command) -> Result<(), CommandError> {
        let grant = self.credentials.guest(command.arg(0)).await?;
        let identity = self.bind_identity(session, grant).await?;
        session.send(format!(
            "GUEST_LOGIN_SUCCESS:{}:{}",
            identity.display_name, identity.token
        ));
        Ok(())
    }

    fn handle_logout(&self, session: &SessionHandle) -> Result<(), CommandError> {
        if session.room_id().is_some() {
            return Err(CommandError::from(RegistryError::AlreadyInRoom));
        }
        let user_id = identity_of(session)?.user_id;
        session.logout();
        info!("Session {} logged out {}", session.id(), user_id);
        session.send("LOGOUT_SUCCESS");
        Ok(())
    }

    /// Checks a token. From a fresh connection it also resumes that identity.
    async fn handle_validate(
        &self,
        session: &SessionHandle,
        command: &Command,
    ) -> Result<(), CommandError> {
        let token = required(command, 0, "token")?;
        let grant = self.credentials.validate(token).await?;
        let (display_name, user_id) = (grant.display_name.clone(), grant.user_id.clone());
        if session.state() == ConnectionState::Connected {
            self.bind_identity(session, grant).await?;
        }
        session.send(format!("SESSION_VALID:{display_name}:{user_id}"));
        Ok(())
    }

    /// Caller's identity and the room the registry has them in.
    async fn current_room(
        &self,
        session: &SessionHandle,
    ) -> Result<(Identity, Arc<Room>), CommandError> {
        let identity = identity_of(session)?;
        let room = self
            .registry
            .room_of(&identity.user_id)
            .await
            .ok_or(RegistryError::NotInRoom)?;
        Ok((identity, room))
    }

    async fn handle_room_create(
        &self,
        session: &SessionHandle,
        command: &Command,
    ) -> Result<(), CommandError> {
        let identity = identity_of(session)?;
        let name = required(command, 0, "room name")?;
        let is_private = flag(command, 1, "private")?.unwrap_or(false);
        let password = command.arg(2).map(str::to_string);

        let room = self
            .registry
            .create_room(session, &identity, name, is_private, password)
            .await?;
        session.send(format!("ROOM_CREATED:{}:{}", room.id(), room.name()));
        session.send(room.info_line());
        Ok(())
    }

    async fn handle_room_join(
        &self,
        session: &SessionHandle,
        command: &Command,
    ) -> Result<(), CommandError> {
        let identity = identity_of(session)?;
        let room_id: RoomId = parsed(command, 0, "room id")?;
        let room = self
            .registry
            .join_room(room_id, session, &identity, command.arg(1))
            .await?;
        session.send(format!(
            "ROOM_JOIN_SUCCESS:{}:{}:{}/{}",
            room.id(),
            room.name(),
            room.player_count(),
            shared::MAX_PLAYERS
        ));
        Ok(())
    }

    async fn handle_room_leave(&self, session: &SessionHandle) -> Result<(), CommandError> {
        let identity = identity_of(session)?;
        let leave = self.registry.leave_room(&identity.user_id).await?;
        session.leave_room();
        self.record(leave.departure.finished).await;
        session.send("ROOM_LEFT:OK");
        Ok(())
    }

    async fn handle_room_list(&self, session: &SessionHandle) -> Result<(), CommandError> {
        let rooms = self.registry.list().await;
        let mut reply = format!("ROOM_LIST:{}", rooms.len());
        for room in &rooms {
            reply.push(':');
            reply.push_str(&room.list_entry());
        }
        session.send(reply);
        Ok(())
    }

    async fn handle_room_info(&self, session: &SessionHandle) -> Result<(), CommandError> {
        let (_, room) = self.current_room(session).await?;
        session.send(room.info_line());
        Ok(())
    }

    async fn handle_room_ready(
        &self,
        session: &SessionHandle,
        command: &Command,
    ) -> Result<(), CommandError> {
        let ready = flag(command, 0, "ready")?.unwrap_or(true);
        let (identity, room) = self.current_room(session).await?;
        room.set_ready(&identity.user_id, ready)?;
        Ok(())
    }

    async fn handle_room_start(&self, session: &SessionHandle) -> Result<(), CommandError> {
        let (identity, room) = self.current_room(session).await?;
        let finished = room.start_game(&identity.user_id)?;
        self.record(finished).await;
        session.send("GAME_START_SUCCESS");
        Ok(())
    }

    /// Host abort. Aborted games are not recorded.
    async fn handle_room_end(&self, session: &SessionHandle) -> Result<(), CommandError> {
        let (identity, room) = self.current_room(session).await?;
        let summary = room.end_game(&identity.user_id)?;
        debug!(
            "Room {} ended by host with {} results",
            room.id(),
            summary.results.len()
        );
        session.send("GAME_END_SUCCESS");
        Ok(())
    }

    async fn handle_room_transfer(
        &self,
        session: &SessionHandle,
        command: &Command,
    ) -> Result<(), CommandError> {
        let target = required(command, 0, "user id")?;
        let (identity, room) = self.current_room(session).await?;
        room.transfer_host(&identity.user_id, target)?;
        session.send(format!("HOST_TRANSFER_SUCCESS:{target}"));
        Ok(())
    }

    async fn handle_room_kick(
        &self,
        session: &SessionHandle,
        command: &Command,
    ) -> Result<(), CommandError> {
        let target = required(command, 0, "user id")?;
        let (identity, room) = self.current_room(session).await?;
        let (_, kicked) = self
            .registry
            .kick(room.id(), &identity.user_id, target)
            .await?;
        session.send(format!("KICK_SUCCESS:{}", kicked.user_id));
        Ok(())
    }

    async fn handle_room_add_ai(
        &self,
        session: &SessionHandle,
        command: &Command,
    ) -> Result<(), CommandError> {
        let difficulty = match command.arg(0) {
            Some(_) => parsed::<u8>(command, 0, "difficulty")?,
            None => 1,
        };
        let (identity, room) = self.current_room(session).await?;
        let ai = room.add_ai(&identity.user_id, difficulty)?;
        debug!("Room {} added {} ({})", room.id(), ai.user_id, ai.display_name);
        Ok(())
    }

    async fn handle_room_remove_ai(
        &self,
        session: &SessionHandle,
        command: &Command,
    ) -> Result<(), CommandError> {
        let target = required(command, 0, "user id")?;
        let (identity, room) = self.current_room(session).await?;
        room.remove_ai(&identity.user_id, target)?;
        Ok(())
    }

    /// `game:move:piece:col:row:rotation[:flip]`
    async fn handle_game_move(
        &self,
        session: &SessionHandle,
        command: &Command,
    ) -> Result<(), CommandError> {
        let piece = PieceKind::from_id(parsed(command, 0, "piece id")?)
            .ok_or_else(|| CommandError::bad_request("unknown piece"))?;
        let col: i32 = parsed(command, 1, "column")?;
        let row: i32 = parsed(command, 2, "row")?;
        let rotation = Rotation::from_wire(parsed(command, 3, "rotation")?)
            .ok_or_else(|| CommandError::bad_request("rotation must be 0-3"))?;
        let flip = match command.arg(4) {
            Some(_) => Flip::from_wire(parsed(command, 4, "flip")?)
                .ok_or_else(|| CommandError::bad_request("flip must be 0-3"))?,
            None => Flip::Normal,
        };

        let (identity, room) = self.current_room(session).await?;
        let outcome = room.make_move(&identity.user_id, piece, (row, col), rotation, flip)?;
        self.record(outcome.finished).await;
        session.send("GAME_MOVE_SUCCESS");
        Ok(())
    }

    async fn handle_chat(&self, session: &SessionHandle, command: &Command) -> Result<(), CommandError> {
        let text = command.text_from(0);
        let text = text.trim();
        if text.is_empty() {
            return Err(CommandError::bad_request("empty message"));
        }
        if text.chars().count() > MAX_CHAT_LEN {
            return Err(CommandError::bad_request("message too long"));
        }

        if session.state() == ConnectionState::InLobby {
            let identity = identity_of(session)?;
            let lobby = self.sessions.read().await.lobby_sessions();
            let line = format!("CHAT:{}:{}", identity.display_name, text);
            for peer in lobby {
                peer.send(line.as_str());
            }
            return Ok(());
        }

        let (identity, room) = self.current_room(session).await?;
        room.chat(&identity.user_id, text)?;
        Ok(())
    }

    async fn handle_lobby_list(&self, session: &SessionHandle) -> Result<(), CommandError> {
        let online = self.sessions.read().await.authenticated_sessions();
        let mut reply = format!("LOBBY_USER_LIST:{}", online.len());
        for peer in &online {
            if let Some(name) = peer.display_name() {
                let status = match peer.state() {
                    ConnectionState::InRoom => "room",
                    ConnectionState::InGame => "game",
                    _ => "lobby",
                };
                reply.push_str(&format!(":{name},{status}"));
            }
        }
        session.send(reply);
        Ok(())
    }

    async fn handle_user_stats(
        &self,
        session: &SessionHandle,
        command: &Command,
    ) -> Result<(), CommandError> {
        let user_id = match command.arg(0) {
            Some(user_id) => user_id.to_string(),
            None => identity_of(session)?.user_id,
        };
        let profile = self.persistence.fetch_profile(&user_id).await?;
        let json = serde_json::to_string(&profile).map_err(|e| {
            error!("Failed to serialize profile for {}: {}", user_id, e);
            CommandError::internal()
        })?;
        session.send(format!("USER_STATS:{json}"));
        Ok(())
    }

    /// Stores a finished game before the triggering command is acknowledged.
    /// Failures are logged and never reach the player.
    async fn record(&self, summary: Option<GameSummary>) {
        let Some(summary) = summary else {
            return;
        };
        match self.persistence.record_game_result(&summary).await {
            Ok(()) => info!(
                "Recorded result for room {} (winners: {})",
                summary.room_id,
                summary.winners.join(", ")
            ),
            Err(e) => error!(
                "Failed to record result for room {}: {}",
                summary.room_id, e
            ),
        }
    }

    /// Tears a session down. Safe to call from any path; only the first
    /// call does anything.
    pub async fn disconnect(&self, session: &SessionHandle, reason: &str) {
        if !session.mark_disconnected() {
            return;
        }
        info!("Session {} disconnecting: {}", session.id(), reason);

        // The room mirror can lag a join that is still in flight, so ask the
        // registry directly.
        if let Some(user_id) = session.user_id() {
            match self.registry.leave_room(&user_id).await {
                Ok(leave) => self.record(leave.departure.finished).await,
                Err(RegistryError::NotInRoom) => {}
                Err(e) => warn!("Session {} failed to leave its room: {}", session.id(), e),
            }
        }

        self.sessions.write().await.remove_session(&session.id());
        session.close();
    }

    /// Periodic maintenance: idle and dead sessions, then the room registry.
    /// Returns how many sessions were dropped.
    pub async fn sweep(&self, idle_timeout: Duration, room_idle_timeout: Duration) -> usize {
        let (idle, dead) = {
            let sessions = self.sessions.read().await;
            (sessions.check_timeouts(idle_timeout), sessions.dead_sessions())
        };

        let mut dropped = 0;
        for session in idle {
            if !session.is_disconnected() {
                self.disconnect(&session, "idle timeout").await;
                dropped += 1;
            }
        }
        for session in dead {
            if session.is_disconnected() {
                if self.sessions.write().await.remove_session(&session.id()).is_some() {
                    dropped += 1;
                }
            } else {
                self.disconnect(&session, "connection lost").await;
                dropped += 1;
            }
        }

        let report = self.registry.sweep(room_idle_timeout).await;
        if !report.is_empty() {
            info!(
                "Sweep pruned {} members, closed {} idle rooms, removed {} rooms",
                report.pruned.len(),
                report.idle_closed.len(),
                report.removed.len()
            );
        }
        for summary in report.finished {
            self.record(Some(summary)).await;
        }
        dropped
    }

    /// Disconnects every session.
    pub async fn shutdown(&self) {
        let sessions = self.sessions.read().await.all_sessions();
        info!("Closing {} sessions", sessions.len());
        for session in sessions {
            self.disconnect(&session, "server shutdown").await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::FirstLegalMove;
    use crate::services::{InMemoryCredentials, InMemoryPersistence};
    use crate::session::Outbound;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Harness {
        dispatcher: Dispatcher,
        persistence: Arc<InMemoryPersistence>,
    }

    struct Client {
        session: SessionHandle,
        rx: UnboundedReceiver<Outbound>,
    }

    impl Client {
        fn drain(&mut self) -> Vec<String> {
            let mut out = Vec::new();
            while let Ok(Outbound::Frame(msg)) = self.rx.try_recv() {
                out.push(msg);
            }
            out
        }
    }

    fn harness() -> Harness {
        let persistence = Arc::new(InMemoryPersistence::new());
        let dispatcher = Dispatcher::new(
            Arc::new(RoomRegistry::new(10, 10, Arc::new(FirstLegalMove))),
            Arc::new(RwLock::new(SessionManager::new(16))),
            Arc::new(InMemoryCredentials::new()),
            Arc::clone(&persistence) as Arc<dyn PersistenceService>,
            3,
        );
        Harness {
            dispatcher,
            persistence,
        }
    }

    impl Harness {
        async fn connect(&self) -> Client {
            let peer = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9000);
            let (session, rx) = self
                .dispatcher
                .sessions()
                .write()
                .await
                .add_session(peer)
                .unwrap();
            Client { session, rx }
        }

        async fn send(&self, client: &mut Client, raw: &str) -> Vec<String> {
            self.dispatcher.dispatch(&client.session, raw).await;
            client.drain()
        }

        async fn guest(&self, name: &str) -> Client {
            let mut client = self.connect().await;
            let replies = self.send(&mut client, &format!("guest:{name}")).await;
            assert!(replies[0].starts_with(&format!("GUEST_LOGIN_SUCCESS:{name}:")));
            client
        }
    }

    #[tokio::test]
    async fn test_ping_and_unknown_command() {
        let h = harness();
        let mut c = h.connect().await;
        assert_eq!(h.send(&mut c, "ping").await, vec!["pong"]);
        assert_eq!(
            h.send(&mut c, "dance").await,
            vec!["ERROR:unrecognized_command:dance"]
        );
    }

    #[tokio::test]
    async fn test_commands_gated_by_state() {
        let h = harness();
        let mut c = h.connect().await;
        let replies = h.send(&mut c, "room:create:Arena").await;
        assert!(replies[0].starts_with("ERROR:unauthorized:"));

        let mut c = h.guest("alice").await;
        let replies = h.send(&mut c, "game:move:1:0:0:0").await;
        assert!(replies[0].starts_with("ERROR:unauthorized:"));
        let replies = h.send(&mut c, "auth:alice:pw").await;
        assert!(replies[0].starts_with("ERROR:unauthorized:"));
    }

    #[tokio::test]
    async fn test_register_logs_in() {
        let h = harness();
        let mut c = h.connect().await;
        let replies = h.send(&mut c, "register:alice:secret").await;
        assert_eq!(replies[0], "REGISTER_SUCCESS:alice");
        assert!(replies[1].starts_with("AUTH_SUCCESS:alice:"));
        assert_eq!(c.session.state(), ConnectionState::InLobby);

        let mut again = h.connect().await;
        let replies = h.send(&mut again, "auth:alice:secret").await;
        assert!(replies[0].starts_with("ERROR:already_online:"));

        let mut wrong = h.connect().await;
        let replies = h.send(&mut wrong, "auth:alice:nope").await;
        assert!(replies[0].starts_with("ERROR:auth_failed:"));
    }

    #[tokio::test]
    async fn test_validate_resumes_identity() {
        let h = harness();
        let mut first = h.guest("erin").await;
        let token = first.session.identity().unwrap().token;
        assert_eq!(h.send(&mut first, "logout").await, vec!["LOGOUT_SUCCESS"]);

        let mut second = h.connect().await;
        let replies = h.send(&mut second, &format!("validate:{token}")).await;
        let user_id = second.session.user_id().unwrap();
        assert_eq!(replies, vec![format!("SESSION_VALID:erin:{user_id}")]);
        assert_eq!(second.session.state(), ConnectionState::InLobby);
    }

    #[tokio::test]
    async fn test_host_and_guests_start_game() {
        let h = harness();
        let mut alice = h.guest("alice").await;
        let mut bob = h.guest("bob").await;
        let mut carol = h.guest("carol").await;

        let replies = h.send(&mut alice, "room:create:Arena").await;
        assert_eq!(replies[0], "ROOM_CREATED:1001:Arena");
        assert!(replies[1].starts_with("ROOM_INFO:1001:Arena:alice:1:4:0:0"));

        let replies = h.send(&mut bob, "room:join:1001").await;
        assert_eq!(replies[0], "PLAYER_JOINED:bob");
        assert!(replies[1].starts_with("ROOM_INFO:1001:Arena:alice:2:4:0:0"));
        assert_eq!(replies[2], "ROOM_JOIN_SUCCESS:1001:Arena:2/4");
        let replies = h.send(&mut carol, "room:join:1001").await;
        assert_eq!(replies[2], "ROOM_JOIN_SUCCESS:1001:Arena:3/4");

        h.send(&mut bob, "room:ready:1").await;
        h.send(&mut carol, "room:ready:1").await;
        let host_view = alice.drain();
        assert!(host_view[1].starts_with("ROOM_INFO:1001:Arena:alice:2:4"));
        assert!(host_view[3].starts_with("ROOM_INFO:1001:Arena:alice:3:4"));
        let roster_events: Vec<&String> = host_view
            .iter()
            .filter(|m| m.starts_with("PLAYER_"))
            .collect();
        assert_eq!(
            roster_events,
            vec![
                "PLAYER_JOINED:bob",
                "PLAYER_JOINED:carol",
                "PLAYER_READY:bob:1",
                "PLAYER_READY:carol:1"
            ]
        );

        let replies = h.send(&mut alice, "room:start").await;
        assert_eq!(replies[0], "GAME_STARTED");
        assert_eq!(replies[1], "GAME_PLAYER_INFO:alice,1:bob,2:carol,3");
        assert!(replies[2].starts_with("TURN_CHANGED:"));
        assert!(replies[3].starts_with("GAME_STATE_UPDATE:"));
        assert_eq!(replies.last().unwrap(), "GAME_START_SUCCESS");
        for client in [&alice, &bob, &carol] {
            assert_eq!(client.session.state(), ConnectionState::InGame);
        }
    }

    #[tokio::test]
    async fn test_join_rejections() {
        let h = harness();
        let mut host = h.guest("host").await;
        h.send(&mut host, "room:create:Vault:1:pw").await;

        let mut others = Vec::new();
        for name in ["b", "c", "d"] {
            let mut c = h.guest(&format!("{name}{name}{name}")).await;
            let replies = h.send(&mut c, "room:join:1001").await;
            assert!(replies[0].starts_with("ERROR:wrong_password:"));
            let replies = h.send(&mut c, "room:join:1001:pw").await;
            assert!(replies.iter().any(|r| r.starts_with("ROOM_JOIN_SUCCESS:")));
            others.push(c);
        }

        let mut late = h.guest("late").await;
        let replies = h.send(&mut late, "room:join:1001:pw").await;
        assert!(replies[0].starts_with("ERROR:room_full:"));
        let replies = h.send(&mut late, "room:join:4242").await;
        assert!(replies[0].starts_with("ERROR:not_found:"));
        let replies = h.send(&mut late, "room:join:abc").await;
        assert!(replies[0].starts_with("ERROR:bad_request:"));
        assert_eq!(late.session.state(), ConnectionState::InLobby);
    }

    #[tokio::test]
    async fn test_illegal_move_keeps_turn() {
        let h = harness();
        let mut alice = h.guest("alice").await;
        let mut bob = h.guest("bob").await;
        h.send(&mut alice, "room:create:Arena").await;
        h.send(&mut bob, "room:join:1001").await;
        h.send(&mut bob, "room:ready").await;
        h.send(&mut alice, "room:start").await;
        bob.drain();

        let replies = h.send(&mut bob, "game:move:1:19:0:0").await;
        assert!(replies[0].starts_with("ERROR:not_your_turn:"));
        let replies = h.send(&mut alice, "game:move:1:5:5:0").await;
        assert!(replies[0].starts_with("ERROR:illegal_move:"));
        let replies = h.send(&mut alice, "game:move:1:0:0:7").await;
        assert!(replies[0].starts_with("ERROR:bad_request:"));

        let replies = h.send(&mut alice, "game:move:1:0:0:0").await;
        assert!(replies[0].starts_with("BLOCK_PLACED:"));
        assert_eq!(replies.last().unwrap(), "GAME_MOVE_SUCCESS");
        let seen = bob.drain();
        assert!(seen.iter().any(|m| m.starts_with("BLOCK_PLACED:")));
        assert!(seen.iter().any(|m| m.starts_with("TURN_CHANGED:")));
    }

    #[tokio::test]
    async fn test_disconnect_mid_game_ends_and_records() {
        let h = harness();
        let mut alice = h.guest("alice").await;
        let mut bob = h.guest("bob").await;
        h.send(&mut alice, "room:create:Arena").await;
        h.send(&mut bob, "room:join:1001").await;
        h.send(&mut bob, "room:ready").await;
        h.send(&mut alice, "room:start").await;
        alice.drain();

        h.dispatcher.disconnect(&bob.session, "test").await;
        h.dispatcher.disconnect(&bob.session, "test again").await;

        let seen = alice.drain();
        assert_eq!(seen[0], "PLAYER_LEFT:bob");
        assert!(seen.iter().any(|m| m.starts_with("GAME_RESULT:")));
        assert!(seen.contains(&"GAME_ENDED".to_string()));
        assert!(seen.last().unwrap().starts_with("ROOM_INFO:1001:Arena:alice:1:4:0:0"));
        assert_eq!(alice.session.state(), ConnectionState::InRoom);
        assert_eq!(h.persistence.recorded_rooms(), vec![1001]);
        assert_eq!(h.dispatcher.sessions().read().await.len(), 1);
        assert!(h.dispatcher.registry().is_consistent().await);

        let stats = h.send(&mut alice, "user:stats").await;
        assert!(stats[0].starts_with("USER_STATS:{"));
        assert!(stats[0].contains("\"games_played\":1"));
    }

    #[tokio::test]
    async fn test_disconnect_clears_membership_before_mirror_is_set() {
        let h = harness();
        let mut alice = h.guest("alice").await;
        let bob = h.guest("bob").await;
        h.send(&mut alice, "room:create:Arena").await;

        // Seat bob, then clear his room mirror to stand in for a join that
        // has not been reflected on the session yet.
        let identity = bob.session.identity().unwrap();
        h.dispatcher
            .registry()
            .join_room(1001, &bob.session, &identity, None)
            .await
            .unwrap();
        bob.session.leave_room();
        assert_eq!(bob.session.room_id(), None);

        h.dispatcher.disconnect(&bob.session, "test").await;
        let room = h.dispatcher.registry().get(1001).await.unwrap();
        assert_eq!(room.player_count(), 1);
        assert!(h.dispatcher.registry().room_of(&identity.user_id).await.is_none());
        assert!(h.dispatcher.registry().is_consistent().await);
    }

    #[tokio::test]
    async fn test_disconnected_session_cannot_join() {
        let h = harness();
        let mut alice = h.guest("alice").await;
        h.send(&mut alice, "room:create:Arena").await;

        let mut ghosts = Vec::new();
        for name in ["ghost1", "ghost2", "ghost3"] {
            let ghost = h.guest(name).await;
            ghost.session.mark_disconnected();
            let identity = ghost.session.identity().unwrap();
            let joined = h
                .dispatcher
                .registry()
                .join_room(1001, &ghost.session, &identity, None)
                .await;
            assert!(joined.is_err());
            ghosts.push(ghost);
        }

        let mut dave = h.guest("dave").await;
        let replies = h.send(&mut dave, "room:join:1001").await;
        assert!(replies.iter().any(|r| r == "ROOM_JOIN_SUCCESS:1001:Arena:2/4"));
        assert!(h.dispatcher.registry().is_consistent().await);
    }

    #[tokio::test]
    async fn test_leave_returns_to_lobby() {
        let h = harness();
        let mut alice = h.guest("alice").await;
        h.send(&mut alice, "room:create:Solo").await;
        assert_eq!(h.send(&mut alice, "room:leave").await, vec!["ROOM_LEFT:OK"]);
        assert_eq!(alice.session.state(), ConnectionState::InLobby);
        assert_eq!(h.send(&mut alice, "room:list").await, vec!["ROOM_LIST:0"]);
    }

    #[tokio::test]
    async fn test_room_list_and_lobby_list() {
        let h = harness();
        let mut alice = h.guest("alice").await;
        let mut bob = h.guest("bob").await;
        h.send(&mut alice, "room:create:Arena").await;

        assert_eq!(
            h.send(&mut bob, "room:list").await,
            vec!["ROOM_LIST:1:1001,Arena,alice,1,4,0,0"]
        );
        assert_eq!(
            h.send(&mut bob, "lobby:list").await,
            vec!["LOBBY_USER_LIST:2:alice,room:bob,lobby"]
        );
    }

    #[tokio::test]
    async fn test_lobby_and_room_chat() {
        let h = harness();
        let mut alice = h.guest("alice").await;
        let mut bob = h.guest("bob").await;
        let mut carol = h.guest("carol").await;
        h.send(&mut carol, "room:create:Den").await;

        h.send(&mut alice, "chat:hi:there").await;
        assert_eq!(bob.drain(), vec!["CHAT:alice:hi:there"]);
        assert!(carol.drain().is_empty());

        let replies = h.send(&mut carol, "chat:anyone?").await;
        assert_eq!(replies, vec!["CHAT:carol:anyone?"]);
        let replies = h.send(&mut alice, "chat:").await;
        assert!(replies[0].starts_with("ERROR:bad_request:"));
    }

    #[tokio::test]
    async fn test_repeated_violations_close_connection() {
        let h = harness();
        let c = h.connect().await;
        for _ in 0..3 {
            assert_eq!(h.dispatcher.dispatch(&c.session, "bogus").await, Flow::Continue);
        }
        assert_eq!(h.dispatcher.dispatch(&c.session, "bogus").await, Flow::Close);
    }

    #[tokio::test]
    async fn test_success_resets_violations() {
        let h = harness();
        let c = h.connect().await;
        for _ in 0..10 {
            assert_eq!(h.dispatcher.dispatch(&c.session, "bogus").await, Flow::Continue);
            assert_eq!(h.dispatcher.dispatch(&c.session, "bogus").await, Flow::Continue);
            assert_eq!(h.dispatcher.dispatch(&c.session, "ping").await, Flow::Continue);
        }
    }

    #[tokio::test]
    async fn test_host_controls() {
        let h = harness();
        let mut alice = h.guest("alice").await;
        let mut bob = h.guest("bob").await;
        h.send(&mut alice, "room:create:Arena").await;
        h.send(&mut bob, "room:join:1001").await;
        let bob_id = bob.session.user_id().unwrap();

        let replies = h.send(&mut bob, &format!("room:kick:{bob_id}")).await;
        assert!(replies[0].starts_with("ERROR:not_host:"));

        h.send(&mut alice, "room:addai:2").await;
        let info = h.send(&mut alice, "room:info").await;
        assert!(info[0].starts_with("ROOM_INFO:1001:Arena:alice:3:4:0:0"));

        let replies = h.send(&mut alice, &format!("room:kick:{bob_id}")).await;
        assert_eq!(replies.last().unwrap(), &format!("KICK_SUCCESS:{bob_id}"));
        assert!(bob.drain().contains(&"KICKED".to_string()));
        assert_eq!(bob.session.state(), ConnectionState::InLobby);

        let replies = h.send(&mut alice, "room:start").await;
        assert_eq!(replies.last().unwrap(), "GAME_START_SUCCESS");
        assert_eq!(alice.session.state(), ConnectionState::InGame);

        let replies = h.send(&mut alice, "room:end").await;
        assert!(replies.iter().any(|m| m == "GAME_ENDED"));
        assert_eq!(replies.last().unwrap(), "GAME_END_SUCCESS");
        assert_eq!(alice.session.state(), ConnectionState::InRoom);
        assert!(h.persistence.recorded_rooms().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_drops_idle_sessions() {
        let h = harness();
        let mut alice = h.guest("alice").await;
        h.send(&mut alice, "room:create:Arena").await;

        let dropped = h
            .dispatcher
            .sweep(Duration::ZERO, Duration::from_secs(600))
            .await;
        assert_eq!(dropped, 1);
        assert!(alice.session.is_disconnected());
        assert_eq!(h.dispatcher.registry().room_count().await, 0);
        assert!(h.dispatcher.sessions().read().await.is_empty());
    }
}
