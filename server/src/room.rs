//! One lobby/match: roster, host, ready flags and the rule engine.
//!
//! Every mutation runs inside [`Room::mutate`], which holds the room mutex for
//! the state change only. Messages and session transitions produced by the
//! change are collected into a [`Fanout`] and delivered after the mutex is
//! released. A second `outbox` mutex is taken before the state mutex is let
//! go, so fan-outs leave the room in the order their mutations completed.

use crate::ai::MoveChooser;
use crate::session::{Identity, Session, SessionHandle, Transition};
use log::{debug, info};
use serde::Serialize;
use serde_json::json;
use shared::{
    Color, Flip, PieceKind, Placement, PlacementError, Position, Rotation, RuleEngine, BOARD_SIZE,
    MAX_PLAYERS, MIN_PLAYERS_TO_START, PIECES_PER_COLOR,
};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Numeric room identifier handed out by the registry, starting at 1001.
pub type RoomId = u32;

/// Longest accepted room name, in characters, after trimming.
pub const MAX_ROOM_NAME_LEN: usize = 30;
const MAX_AI_DIFFICULTY: u8 = 3;

/// Lifecycle of a room
///
/// A room accepts members only while `Waiting`. `Playing` returns to
/// `Waiting` once a game finishes, while `Disbanded` is terminal: the
/// registry drops the room and any late request sees `not_found`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomState {
    Waiting,
    Playing,
    Disbanded,
}

/// One seat in a room, human or AI
///
/// Players hold only a weak reference to their session so that a dropped
/// connection never keeps room state alive. Snapshots returned by [`Room`]
/// are clones and do not track later changes.
#[derive(Debug, Clone)]
pub struct Player {
    pub user_id: String,
    pub display_name: String,
    pub color: Option<Color>,
    pub is_host: bool,
    pub is_ready: bool,
    pub is_ai: bool,
    pub ai_difficulty: u8,
    /// Cells placed during play, final score afterwards.
    pub score: i32,
    pub remaining_pieces: usize,
    session: Weak<Session>,
}

// Field-wise equality (session compared by pointer identity); only needed
// so tests can `assert_eq!` on `Result<Player, RoomError>`.
#[cfg(test)]
impl PartialEq for Player {
    fn eq(&self, other: &Self) -> bool {
        self.user_id == other.user_id
            && self.display_name == other.display_name
            && self.color == other.color
            && self.is_host == other.is_host
            && self.is_ready == other.is_ready
            && self.is_ai == other.is_ai
            && self.ai_difficulty == other.ai_difficulty
            && self.score == other.score
            && self.remaining_pieces == other.remaining_pieces
            && self.session.ptr_eq(&other.session)
    }
}

impl Player {
    fn human(identity: &Identity, session: &SessionHandle) -> Self {
        Self {
            user_id: identity.user_id.clone(),
            display_name: identity.display_name.clone(),
            color: None,
            is_host: false,
            is_ready: false,
            is_ai: false,
            ai_difficulty: 0,
            score: 0,
            remaining_pieces: PIECES_PER_COLOR,
            session: Arc::downgrade(session),
        }
    }

    fn ai(room_id: RoomId, seq: u32, difficulty: u8) -> Self {
        Self {
            user_id: format!("ai_{room_id}_{seq}"),
            display_name: format!("AI{seq}"),
            color: None,
            is_host: false,
            is_ready: true,
            is_ai: true,
            ai_difficulty: difficulty,
            score: 0,
            remaining_pieces: PIECES_PER_COLOR,
            session: Weak::new(),
        }
    }

    /// The live session behind this seat, if any.
    pub fn session(&self) -> Option<SessionHandle> {
        self.session.upgrade()
    }

    fn info_field(&self) -> String {
        format!(
            "{},{},{},{},{},{}",
            self.user_id,
            self.display_name,
            self.color.map_or(0, Color::id),
            u8::from(self.is_host),
            u8::from(self.is_ready),
            u8::from(self.is_ai)
        )
    }
}

/// Final standing of one color in a finished game.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlayerResult {
    pub user_id: String,
    pub display_name: String,
    pub color: Color,
    pub score: i32,
    pub is_winner: bool,
    pub is_ai: bool,
}

/// Outcome of a game, passed to the persistence service
///
/// `winners` holds the display names tied for the highest score.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GameSummary {
    pub room_id: RoomId,
    pub results: Vec<PlayerResult>,
    pub winners: Vec<String>,
}

/// Snapshot used for the lobby room list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSummary {
    pub id: RoomId,
    pub name: String,
    pub host_name: String,
    pub player_count: usize,
    pub is_private: bool,
    pub is_playing: bool,
}

impl RoomSummary {
    /// `id,name,host,n,4,private,playing`
    pub fn list_entry(&self) -> String {
        format!(
            "{},{},{},{},{},{},{}",
            self.id,
            self.name,
            self.host_name,
            self.player_count,
            MAX_PLAYERS,
            u8::from(self.is_private),
            u8::from(self.is_playing)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatLine {
    /// Display name at the time the line was sent.
    pub author: String,
    pub text: String,
}

/// Reasons a room operation is refused
///
/// Every variant leaves the room untouched. The dispatcher turns them into
/// `ERROR:<code>:<message>` replies using [`RoomError::code`] and the
/// display text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoomError {
    #[error("room is full")]
    Full,
    #[error("game already in progress")]
    MidGame,
    #[error("already in this room")]
    AlreadyPresent,
    #[error("not a member of this room")]
    NotMember,
    #[error("only the host can do that")]
    NotHost,
    #[error("room is not waiting for players")]
    NotWaiting,
    #[error("no game in progress")]
    NotPlaying,
    #[error("need at least {need} players, have {have}")]
    NotEnoughPlayers { have: usize, need: usize },
    #[error("players not ready: {0}")]
    NotReady(String),
    #[error("the host is always ready")]
    HostAlwaysReady,
    #[error("no such player")]
    UnknownPlayer,
    #[error("invalid target player")]
    InvalidTarget,
    #[error("it is not your turn")]
    NotYourTurn,
    #[error("illegal move: {0}")]
    IllegalMove(PlacementError),
    #[error("room has been disbanded")]
    Disbanded,
    #[error("connection is closing")]
    SessionClosed,
}

impl RoomError {
    /// Stable snake_case reason code for the wire.
    pub fn code(&self) -> &'static str {
        match self {
            RoomError::Full => "room_full",
            RoomError::MidGame => "mid_game",
            RoomError::AlreadyPresent => "already_in_room",
            RoomError::NotMember => "not_in_room",
            RoomError::NotHost => "not_host",
            RoomError::NotWaiting
            | RoomError::NotPlaying
            | RoomError::HostAlwaysReady
            | RoomError::SessionClosed => "invalid_state",
            RoomError::NotEnoughPlayers { .. } => "not_enough_players",
            RoomError::NotReady(_) => "not_ready",
            RoomError::UnknownPlayer | RoomError::Disbanded => "not_found",
            RoomError::InvalidTarget => "bad_request",
            RoomError::NotYourTurn => "not_your_turn",
            RoomError::IllegalMove(_) => "illegal_move",
        }
    }
}

/// What happened when a player left.
#[derive(Debug, Clone)]
pub struct Departure {
    pub player: Player,
    /// Display name of the promoted host.
    pub new_host: Option<String>,
    pub disbanded: bool,
    /// Set when the departure ended a running game.
    pub finished: Option<GameSummary>,
}

/// Result of an accepted move
///
/// `cells` are the absolute board cells the piece now covers. `finished` is
/// set when this move, or the AI turns it triggered, ended the game.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveOutcome {
    pub cells: Vec<Position>,
    pub finished: Option<GameSummary>,
}

/// Messages and session transitions produced by one room mutation.
#[derive(Default)]
struct Fanout {
    transitions: Vec<(SessionHandle, Transition)>,
    deliveries: Vec<(SessionHandle, String)>,
}

impl Fanout {
    fn send(&mut self, player: &Player, message: impl Into<String>) {
        if let Some(session) = player.session() {
            self.deliveries.push((session, message.into()));
        }
    }

    fn broadcast(&mut self, players: &[Player], message: &str) {
        for player in players {
            self.send(player, message);
        }
    }

    fn transition(&mut self, player: &Player, transition: Transition) {
        if let Some(session) = player.session() {
            self.transitions.push((session, transition));
        }
    }

    /// Transitions first, so a peer never sees an event before its session
    /// is in the state that event implies.
    fn deliver(self) {
        for (session, transition) in self.transitions {
            session.apply(transition);
        }
        for (session, message) in self.deliveries {
            session.send(message);
        }
    }
}

struct RoomInner {
    state: RoomState,
    players: Vec<Player>,
    engine: RuleEngine,
    last_activity: Instant,
    chat: VecDeque<ChatLine>,
    chat_capacity: usize,
    next_ai: u32,
    last_result: Option<GameSummary>,
}

/// A lobby that becomes a match once the host starts it
///
/// All state lives behind one mutex and every operation is a short,
/// synchronous critical section. Broadcasts are queued on the members'
/// sessions after the lock is released, so callers never wait on a slow
/// peer. The registry owns rooms through `Arc<Room>` and is responsible for
/// the user to room mapping; a room only tracks who is seated.
pub struct Room {
    id: RoomId,
    name: String,
    is_private: bool,
    password: Option<String>,
    created_at: Instant,
    chooser: Arc<dyn MoveChooser>,
    inner: Mutex<RoomInner>,
    outbox: Mutex<()>,
}

impl fmt::Debug for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Room")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("is_private", &self.is_private)
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Non-empty after trimming, at most [`MAX_ROOM_NAME_LEN`] characters, and
/// free of the `,` and `:` separators used on the wire.
pub fn is_valid_room_name(name: &str) -> bool {
    let trimmed = name.trim();
    !trimmed.is_empty()
        && trimmed.chars().count() <= MAX_ROOM_NAME_LEN
        && !trimmed.contains([',', ':'])
}

impl Room {
    /// Creates an empty room in the `Waiting` state
    ///
    /// The name is trimmed and an empty password is treated as none. The
    /// first player added becomes host. `chat_capacity` bounds the kept
    /// chat history; zero disables it. `chooser` picks moves for AI seats.
    pub fn new(
        id: RoomId,
        name: &str,
        is_private: bool,
        password: Option<String>,
        chat_capacity: usize,
        chooser: Arc<dyn MoveChooser>,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            name: name.trim().to_string(),
            is_private,
            password: password.filter(|p| !p.is_empty()),
            created_at: now,
            chooser,
            inner: Mutex::new(RoomInner {
                state: RoomState::Waiting,
                players: Vec::with_capacity(MAX_PLAYERS),
                engine: RuleEngine::new(),
                last_activity: now,
                chat: VecDeque::with_capacity(chat_capacity),
                chat_capacity,
                next_ai: 1,
                last_result: None,
            }),
            outbox: Mutex::new(()),
        }
    }

    /// Registry-assigned identifier.
    pub fn id(&self) -> RoomId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_private(&self) -> bool {
        self.is_private
    }

    /// Time since the room was created.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Rooms without a password accept any candidate.
    pub fn check_password(&self, candidate: Option<&str>) -> bool {
        match &self.password {
            Some(expected) => candidate == Some(expected.as_str()),
            None => true,
        }
    }

    /// Runs `change` under the room lock, then delivers its fan-out.
    fn mutate<T>(
        &self,
        change: impl FnOnce(&mut RoomInner, &mut Fanout) -> Result<T, RoomError>,
    ) -> Result<T, RoomError> {
        let mut inner = lock(&self.inner);
        let mut fanout = Fanout::default();
        let result = change(&mut inner, &mut fanout);
        if result.is_ok() {
            inner.last_activity = Instant::now();
        }
        let _order = lock(&self.outbox);
        drop(inner);
        fanout.deliver();
        result
    }

    fn read<T>(&self, view: impl FnOnce(&RoomInner) -> T) -> T {
        view(&lock(&self.inner))
    }

    pub fn state(&self) -> RoomState {
        self.read(|inner| inner.state)
    }

    /// Seated players, AI included.
    pub fn player_count(&self) -> usize {
        self.read(|inner| inner.players.len())
    }

    pub fn is_empty(&self) -> bool {
        self.player_count() == 0
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.read(|inner| inner.index_of(user_id).is_some())
    }

    /// Roster snapshot in join order.
    pub fn players(&self) -> Vec<Player> {
        self.read(|inner| inner.players.clone())
    }

    pub fn player(&self, user_id: &str) -> Option<Player> {
        self.read(|inner| inner.index_of(user_id).map(|i| inner.players[i].clone()))
    }

    /// User id of the current host. `None` only once the room is empty.
    pub fn host_id(&self) -> Option<String> {
        self.read(|inner| inner.host().map(|p| p.user_id.clone()))
    }

    /// Time since the last successful mutation
    ///
    /// Failed commands do not count as activity, so a room that only sees
    /// rejected requests still ages out in the registry sweep.
    pub fn idle_for(&self) -> Duration {
        self.read(|inner| inner.last_activity.elapsed())
    }

    /// Recent chat, oldest first.
    pub fn chat_history(&self) -> Vec<ChatLine> {
        self.read(|inner| inner.chat.iter().cloned().collect())
    }

    /// Summary of the most recently finished game, cleared on the next start.
    pub fn last_result(&self) -> Option<GameSummary> {
        self.read(|inner| inner.last_result.clone())
    }

    /// Read-only access to the board, for inspection and tests.
    pub fn with_engine<T>(&self, view: impl FnOnce(&RuleEngine) -> T) -> T {
        self.read(|inner| view(&inner.engine))
    }

    /// Listing entry for `room:list`.
    pub fn summary(&self) -> RoomSummary {
        self.read(|inner| self.summary_of(inner))
    }

    /// Full room snapshot as sent to members.
    ///
    /// Format: `ROOM_INFO:id:name:host:n:4:private:playing[:player...]`, where
    /// each player is `userId,name,color,host,ready,ai`.
    pub fn info_line(&self) -> String {
        self.read(|inner| self.info_line_of(inner))
    }

    fn summary_of(&self, inner: &RoomInner) -> RoomSummary {
        RoomSummary {
            id: self.id,
            name: self.name.clone(),
            host_name: inner
                .host()
                .map(|p| p.display_name.clone())
                .unwrap_or_default(),
            player_count: inner.players.len(),
            is_private: self.is_private,
            is_playing: inner.state == RoomState::Playing,
        }
    }

    fn info_line_of(&self, inner: &RoomInner) -> String {
        let summary = self.summary_of(inner);
        let mut line = format!(
            "ROOM_INFO:{}:{}:{}:{}:{}:{}:{}",
            summary.id,
            summary.name,
            summary.host_name,
            summary.player_count,
            MAX_PLAYERS,
            u8::from(summary.is_private),
            u8::from(summary.is_playing)
        );
        for player in &inner.players {
            line.push(':');
            line.push_str(&player.info_field());
        }
        line
    }

    /// Resends the roster to every member after it changed.
    fn broadcast_info(&self, inner: &RoomInner, fanout: &mut Fanout) {
        inner.broadcast(fanout, &self.info_line_of(inner));
    }

    /// Human members whose connection is gone.
    pub fn orphaned_members(&self) -> Vec<String> {
        self.read(|inner| {
            inner
                .players
                .iter()
                .filter(|p| !p.is_ai)
                .filter(|p| p.session().map_or(true, |s| s.is_disconnected()))
                .map(|p| p.user_id.clone())
                .collect()
        })
    }

    /// Seats a human in the next free color
    ///
    /// The session's room mirror is updated inside the same critical section.
    /// The first player becomes host and is implicitly ready. Later joiners
    /// trigger `PLAYER_JOINED` and a fresh `ROOM_INFO` for everyone, the
    /// joiner included. Sessions already marked disconnected are refused, so
    /// a join racing with teardown can never leave a ghost seat behind.
    pub fn add_player(&self, session: &SessionHandle, identity: &Identity) -> Result<(), RoomError> {
        self.mutate(|inner, fanout| {
            if session.is_disconnected() {
                return Err(RoomError::SessionClosed);
            }
            match inner.state {
                RoomState::Disbanded => return Err(RoomError::Disbanded),
                RoomState::Playing => return Err(RoomError::MidGame),
                RoomState::Waiting => {}
            }
            if inner.index_of(&identity.user_id).is_some() {
                return Err(RoomError::AlreadyPresent);
            }
            if inner.players.len() >= MAX_PLAYERS {
                return Err(RoomError::Full);
            }

            let mut player = Player::human(identity, session);
            player.color = inner.free_color();
            if inner.players.is_empty() {
                player.is_host = true;
                player.is_ready = true;
            }
            let first = player.is_host;
            inner.players.push(player);
            session.enter_room(self.id);

            if !first {
                inner.broadcast(fanout, &format!("PLAYER_JOINED:{}", identity.display_name));
                self.broadcast_info(inner, fanout);
            }
            info!(
                "{} joined room {} ({}/{})",
                identity.user_id,
                self.id,
                inner.players.len(),
                MAX_PLAYERS
            );
            Ok(())
        })
    }

    /// Removes a member and repairs the room around the gap
    ///
    /// A departing host hands over to the earliest remaining human. When no
    /// human is left the room is disbanded. Mid-game, the leaver's color
    /// drops out of the turn order; the game ends if fewer than two players
    /// remain, otherwise the turn moves on if it was theirs. Remaining
    /// members receive the updated roster and, while playing, a fresh game
    /// state snapshot.
    pub fn remove_player(&self, user_id: &str) -> Result<Departure, RoomError> {
        let room_id = self.id;
        let chooser = Arc::clone(&self.chooser);
        self.mutate(|inner, fanout| {
            let index = inner.index_of(user_id).ok_or(RoomError::NotMember)?;
            let player = inner.players.remove(index);
            inner.broadcast(fanout, &format!("PLAYER_LEFT:{}", player.display_name));
            info!("{} left room {}", user_id, room_id);

            if !inner.players.iter().any(|p| !p.is_ai) {
                inner.players.clear();
                inner.state = RoomState::Disbanded;
                info!("Room {} disbanded", room_id);
                return Ok(Departure {
                    player,
                    new_host: None,
                    disbanded: true,
                    finished: None,
                });
            }

            let mut new_host = None;
            if player.is_host {
                new_host = inner.promote_first_human();
                if let Some(name) = &new_host {
                    inner.broadcast(fanout, &format!("HOST_CHANGED:{name}"));
                    info!("Room {} host is now {}", room_id, name);
                }
            }

            let mut finished = None;
            if inner.state == RoomState::Playing {
                let had_turn = player.color.is_some() && inner.engine.current_turn() == player.color;
                if let Some(color) = player.color {
                    inner.engine.remove_from_turn_order(color);
                }
                if inner.players.len() < MIN_PLAYERS_TO_START {
                    finished = Some(inner.finish_game(room_id, fanout));
                } else if had_turn {
                    finished = inner.settle_turn(room_id, chooser.as_ref(), fanout);
                } else {
                    inner.broadcast_game_state(fanout);
                }
            }
            self.broadcast_info(inner, fanout);

            Ok(Departure {
                player,
                new_host,
                disbanded: false,
                finished,
            })
        })
    }

    /// Toggles a non-host member's ready flag while waiting.
    pub fn set_ready(&self, user_id: &str, ready: bool) -> Result<(), RoomError> {
        self.mutate(|inner, fanout| {
            if inner.state != RoomState::Waiting {
                return Err(RoomError::NotWaiting);
            }
            let index = inner.index_of(user_id).ok_or(RoomError::NotMember)?;
            if inner.players[index].is_host {
                return Err(RoomError::HostAlwaysReady);
            }
            inner.players[index].is_ready = ready;
            let name = inner.players[index].display_name.clone();
            inner.broadcast(fanout, &format!("PLAYER_READY:{}:{}", name, u8::from(ready)));
            Ok(())
        })
    }

    /// Seats colors by join order, resets the board and starts play
    ///
    /// Requires the host, at least two players and every other human ready.
    /// Returns a summary if the opening turns already ended the game.
    pub fn start_game(&self, requester: &str) -> Result<Option<GameSummary>, RoomError> {
        let room_id = self.id;
        let chooser = Arc::clone(&self.chooser);
        self.mutate(|inner, fanout| {
            inner.require_host(requester)?;
            if inner.state != RoomState::Waiting {
                return Err(RoomError::NotWaiting);
            }
            if inner.players.len() < MIN_PLAYERS_TO_START {
                return Err(RoomError::NotEnoughPlayers {
                    have: inner.players.len(),
                    need: MIN_PLAYERS_TO_START,
                });
            }
            let unready: Vec<&str> = inner
                .players
                .iter()
                .filter(|p| !p.is_host && !p.is_ai && !p.is_ready)
                .map(|p| p.display_name.as_str())
                .collect();
            if !unready.is_empty() {
                return Err(RoomError::NotReady(unready.join(",")));
            }

            for (player, color) in inner.players.iter_mut().zip(Color::ALL) {
                player.color = Some(color);
                player.score = 0;
                player.remaining_pieces = PIECES_PER_COLOR;
            }
            let order: Vec<Color> = inner.players.iter().filter_map(|p| p.color).collect();
            inner.engine.start(&order);
            inner.state = RoomState::Playing;
            inner.last_result = None;

            for player in &inner.players {
                fanout.transition(player, Transition::EnterGame(room_id));
            }
            inner.broadcast(fanout, "GAME_STARTED");
            let seating: Vec<String> = inner
                .players
                .iter()
                .filter_map(|p| p.color.map(|c| format!("{},{}", p.display_name, c.id())))
                .collect();
            inner.broadcast(fanout, &format!("GAME_PLAYER_INFO:{}", seating.join(":")));
            info!("Room {} started with {} players", room_id, order.len());

            Ok(inner.settle_turn(room_id, chooser.as_ref(), fanout))
        })
    }

    /// Host stops a running game; the board stays as it was.
    pub fn end_game(&self, requester: &str) -> Result<GameSummary, RoomError> {
        let room_id = self.id;
        self.mutate(|inner, fanout| {
            inner.require_host(requester)?;
            if inner.state != RoomState::Playing {
                return Err(RoomError::NotPlaying);
            }
            info!("Room {} ended by host", room_id);
            Ok(inner.finish_game(room_id, fanout))
        })
    }

    /// Makes another human the host and returns their display name
    ///
    /// While waiting, the outgoing host loses the implicit ready flag and
    /// has to ready up like anyone else.
    pub fn transfer_host(&self, requester: &str, target: &str) -> Result<String, RoomError> {
        self.mutate(|inner, fanout| {
            let from = inner.require_host(requester)?;
            let to = inner.index_of(target).ok_or(RoomError::UnknownPlayer)?;
            if to == from || inner.players[to].is_ai {
                return Err(RoomError::InvalidTarget);
            }
            let waiting = inner.state == RoomState::Waiting;
            let old = &mut inner.players[from];
            old.is_host = false;
            if waiting {
                old.is_ready = false;
            }
            let new = &mut inner.players[to];
            new.is_host = true;
            new.is_ready = true;
            let name = new.display_name.clone();
            inner.broadcast(fanout, &format!("HOST_CHANGED:{name}"));
            self.broadcast_info(inner, fanout);
            Ok(name)
        })
    }

    /// Removes a member before the game starts. The caller clears the
    /// registry mapping.
    pub fn kick(&self, requester: &str, target: &str) -> Result<Player, RoomError> {
        let room_id = self.id;
        self.mutate(|inner, fanout| {
            let host = inner.require_host(requester)?;
            if inner.state != RoomState::Waiting {
                return Err(RoomError::NotWaiting);
            }
            let index = inner.index_of(target).ok_or(RoomError::UnknownPlayer)?;
            if index == host {
                return Err(RoomError::InvalidTarget);
            }
            let kicked = inner.players.remove(index);
            fanout.transition(&kicked, Transition::ReturnToLobby(room_id));
            fanout.send(&kicked, "KICKED");
            inner.broadcast(fanout, &format!("PLAYER_LEFT:{}", kicked.display_name));
            self.broadcast_info(inner, fanout);
            info!("{} kicked from room {}", kicked.user_id, room_id);
            Ok(kicked)
        })
    }

    /// Host fills a free seat with an AI. Difficulty is clamped to 1..=3.
    pub fn add_ai(&self, requester: &str, difficulty: u8) -> Result<Player, RoomError> {
        let room_id = self.id;
        self.mutate(|inner, fanout| {
            inner.require_host(requester)?;
            if inner.state != RoomState::Waiting {
                return Err(RoomError::NotWaiting);
            }
            if inner.players.len() >= MAX_PLAYERS {
                return Err(RoomError::Full);
            }
            let seq = inner.next_ai;
            inner.next_ai += 1;
            let mut player = Player::ai(room_id, seq, difficulty.clamp(1, MAX_AI_DIFFICULTY));
            player.color = inner.free_color();
            inner.players.push(player.clone());
            inner.broadcast(fanout, &format!("PLAYER_JOINED:{}", player.display_name));
            self.broadcast_info(inner, fanout);
            Ok(player)
        })
    }

    pub fn remove_ai(&self, requester: &str, target: &str) -> Result<Player, RoomError> {
        self.mutate(|inner, fanout| {
            inner.require_host(requester)?;
            if inner.state != RoomState::Waiting {
                return Err(RoomError::NotWaiting);
            }
            let index = inner.index_of(target).ok_or(RoomError::UnknownPlayer)?;
            if !inner.players[index].is_ai {
                return Err(RoomError::InvalidTarget);
            }
            let removed = inner.players.remove(index);
            inner.broadcast(fanout, &format!("PLAYER_LEFT:{}", removed.display_name));
            self.broadcast_info(inner, fanout);
            Ok(removed)
        })
    }

    /// Places a piece for the player whose turn it is
    ///
    /// Illegal moves are rejected without touching the board or the turn.
    /// An accepted move is broadcast as `BLOCK_PLACED`, then the turn
    /// advances past stuck colors and through any AI seats before
    /// `TURN_CHANGED` and a `GAME_STATE_UPDATE` snapshot go out.
    pub fn make_move(
        &self,
        user_id: &str,
        piece: PieceKind,
        position: Position,
        rotation: Rotation,
        flip: Flip,
    ) -> Result<MoveOutcome, RoomError> {
        let room_id = self.id;
        let chooser = Arc::clone(&self.chooser);
        self.mutate(|inner, fanout| {
            if inner.state != RoomState::Playing {
                return Err(RoomError::NotPlaying);
            }
            let index = inner.index_of(user_id).ok_or(RoomError::NotMember)?;
            let color = inner.players[index].color.ok_or(RoomError::NotPlaying)?;
            if inner.engine.current_turn() != Some(color) {
                return Err(RoomError::NotYourTurn);
            }

            let placement = Placement::new(piece, position, rotation, flip, color);
            let cells = inner
                .engine
                .try_place(&placement)
                .map_err(RoomError::IllegalMove)?;
            inner.announce_placement(index, &placement, &cells, fanout);

            inner.engine.advance_turn();
            let finished = inner.settle_turn(room_id, chooser.as_ref(), fanout);
            Ok(MoveOutcome { cells, finished })
        })
    }

    /// Broadcasts a chat line to the room and records it in the history.
    pub fn chat(&self, user_id: &str, text: &str) -> Result<(), RoomError> {
        self.mutate(|inner, fanout| {
            let index = inner.index_of(user_id).ok_or(RoomError::NotMember)?;
            let author = inner.players[index].display_name.clone();
            if inner.chat.len() >= inner.chat_capacity {
                inner.chat.pop_front();
            }
            if inner.chat_capacity > 0 {
                inner.chat.push_back(ChatLine {
                    author: author.clone(),
                    text: text.to_string(),
                });
            }
            inner.broadcast(fanout, &format!("CHAT:{author}:{text}"));
            Ok(())
        })
    }

    /// Empties the room, sending every member back to the lobby. Returns the
    /// user ids that were removed.
    pub fn disband(&self, reason: &str) -> Vec<String> {
        let room_id = self.id;
        let removed = self.mutate(|inner, fanout| {
            for player in &inner.players {
                fanout.transition(player, Transition::ReturnToLobby(room_id));
                fanout.send(player, format!("ROOM_CLOSED:{reason}"));
            }
            inner.state = RoomState::Disbanded;
            let players = std::mem::take(&mut inner.players);
            Ok(players
                .into_iter()
                .filter(|p| !p.is_ai)
                .map(|p| p.user_id)
                .collect())
        });
        removed.unwrap_or_default()
    }
}

impl RoomInner {
    fn index_of(&self, user_id: &str) -> Option<usize> {
        self.players.iter().position(|p| p.user_id == user_id)
    }

    fn host(&self) -> Option<&Player> {
        self.players.iter().find(|p| p.is_host)
    }

    fn require_host(&self, user_id: &str) -> Result<usize, RoomError> {
        let index = self.index_of(user_id).ok_or(RoomError::NotMember)?;
        if self.players[index].is_host {
            Ok(index)
        } else {
            Err(RoomError::NotHost)
        }
    }

    fn free_color(&self) -> Option<Color> {
        Color::ALL
            .into_iter()
            .find(|color| self.players.iter().all(|p| p.color != Some(*color)))
    }

    fn promote_first_human(&mut self) -> Option<String> {
        let player = self.players.iter_mut().find(|p| !p.is_ai)?;
        player.is_host = true;
        player.is_ready = true;
        Some(player.display_name.clone())
    }

    fn broadcast(&self, fanout: &mut Fanout, message: &str) {
        fanout.broadcast(&self.players, message);
    }

    fn seat_of(&self, color: Color) -> Option<usize> {
        self.players.iter().position(|p| p.color == Some(color))
    }

    fn announce_placement(
        &mut self,
        index: usize,
        placement: &Placement,
        cells: &[Position],
        fanout: &mut Fanout,
    ) {
        let color = placement.color;
        let player = &mut self.players[index];
        player.score = self.engine.placed_cells(color) as i32;
        player.remaining_pieces = self.engine.remaining_count(color);

        let payload = json!({
            "player": player.display_name,
            "userId": player.user_id,
            "pieceId": placement.piece.id(),
            "row": placement.row,
            "col": placement.col,
            "rotation": placement.orientation.rotation.index(),
            "flip": placement.orientation.flip.index(),
            "color": color.id(),
            "cells": cells,
            "scoreGained": cells.len(),
            "remainingPieces": player.remaining_pieces,
        });
        self.broadcast(fanout, &format!("BLOCK_PLACED:{payload}"));
    }

    /// Hands the turn to the next color that can act. Stuck colors are
    /// skipped, AI seats move immediately. Returns the summary if nobody in
    /// the turn order can move any more.
    fn settle_turn(
        &mut self,
        room_id: RoomId,
        chooser: &dyn MoveChooser,
        fanout: &mut Fanout,
    ) -> Option<GameSummary> {
        let mut passes = 0;
        let max_steps = self.engine.turn_order().len() * (PIECES_PER_COLOR + 1) + 1;

        for _ in 0..max_steps {
            let color = self.engine.current_turn()?;
            if passes >= self.engine.turn_order().len() {
                return Some(self.finish_game(room_id, fanout));
            }
            let Some(seat) = self.seat_of(color) else {
                self.engine.remove_from_turn_order(color);
                continue;
            };

            if self.engine.is_stuck(color) {
                passes += 1;
                let name = self.players[seat].display_name.clone();
                self.broadcast(fanout, &format!("TURN_SKIPPED:{}:{}", name, color.id()));
                self.engine.advance_turn();
                continue;
            }

            if !self.players[seat].is_ai {
                let player = &self.players[seat];
                let payload = json!({
                    "player": player.display_name,
                    "userId": player.user_id,
                    "color": color.id(),
                    "turnNumber": self.engine.turn_number(),
                });
                self.broadcast(fanout, &format!("TURN_CHANGED:{payload}"));
                self.broadcast_game_state(fanout);
                return None;
            }

            let difficulty = self.players[seat].ai_difficulty;
            let choice = chooser
                .choose(&self.engine, color, difficulty)
                .and_then(|p| self.engine.try_place(&p).ok().map(|cells| (p, cells)));
            match choice {
                Some((placement, cells)) => {
                    passes = 0;
                    self.announce_placement(seat, &placement, &cells, fanout);
                }
                None => {
                    passes += 1;
                    debug!("AI {} passed in room {}", self.players[seat].user_id, room_id);
                    let name = self.players[seat].display_name.clone();
                    self.broadcast(fanout, &format!("TURN_SKIPPED:{}:{}", name, color.id()));
                }
            }
            self.engine.advance_turn();
        }
        None
    }

    /// Whole-board snapshot sent alongside incremental events, so a peer that
    /// missed one can resync. Only sent while a game is running.
    fn broadcast_game_state(&self, fanout: &mut Fanout) {
        if self.state != RoomState::Playing {
            return;
        }
        let board: Vec<Vec<u8>> = (0..BOARD_SIZE)
            .map(|row| {
                (0..BOARD_SIZE)
                    .map(|col| self.engine.cell((row, col)).map_or(0, Color::id))
                    .collect()
            })
            .collect();
        let mut scores = BTreeMap::new();
        let mut remaining = BTreeMap::new();
        for color in self.players.iter().filter_map(|p| p.color) {
            scores.insert(color.id().to_string(), self.engine.score(color));
            remaining.insert(color.id().to_string(), self.engine.remaining_count(color));
        }
        let payload = json!({
            "currentPlayer": self.engine.current_turn().map_or(0, Color::id),
            "turnNumber": self.engine.turn_number(),
            "boardState": board,
            "scores": scores,
            "remainingBlocks": remaining,
        });
        self.broadcast(fanout, &format!("GAME_STATE_UPDATE:{payload}"));
    }

    /// Scores the board, announces the result and returns to Waiting.
    fn finish_game(&mut self, room_id: RoomId, fanout: &mut Fanout) -> GameSummary {
        let scores = self.engine.scores();
        for player in &mut self.players {
            if let Some(color) = player.color {
                player.score = scores.get(&color).copied().unwrap_or_default();
                player.remaining_pieces = self.engine.remaining_count(color);
            }
        }

        let best = self
            .players
            .iter()
            .filter(|p| p.color.is_some())
            .map(|p| p.score)
            .max();
        let results: Vec<PlayerResult> = self
            .players
            .iter()
            .filter_map(|p| {
                p.color.map(|color| PlayerResult {
                    user_id: p.user_id.clone(),
                    display_name: p.display_name.clone(),
                    color,
                    score: p.score,
                    is_winner: Some(p.score) == best,
                    is_ai: p.is_ai,
                })
            })
            .collect();
        let winners: Vec<String> = results
            .iter()
            .filter(|r| r.is_winner)
            .map(|r| r.display_name.clone())
            .collect();

        let payload = json!({ "results": results, "winners": winners });
        self.broadcast(fanout, &format!("GAME_RESULT:{payload}"));

        self.state = RoomState::Waiting;
        for player in &mut self.players {
            if !player.is_host && !player.is_ai {
                player.is_ready = false;
            }
        }
        for player in &self.players {
            fanout.transition(player, Transition::LeaveGame(room_id));
        }
        self.broadcast(fanout, "GAME_ENDED");
        info!("Room {} game finished, winners: {}", room_id, winners.join(","));

        let summary = GameSummary {
            room_id,
            results,
            winners,
        };
        self.last_result = Some(summary.clone());
        summary
    }
}
