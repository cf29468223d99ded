//! Room registry: owns every room and the user → room membership map.
//!
//! The two maps live behind one `tokio::sync::RwLock` so a membership entry
//! and the room seat it points at always change together. Room methods are
//! synchronous and never await, so calling them under the registry lock
//! keeps the lock order registry → room → session.

use crate::ai::MoveChooser;
use crate::room::{
    is_valid_room_name, Departure, GameSummary, Player, Room, RoomError, RoomId, RoomState,
    RoomSummary,
};
use crate::session::{Identity, SessionHandle};
use log::{debug, info};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;

pub const FIRST_ROOM_ID: RoomId = 1001;

/// Reasons a registry request is refused
///
/// Registry-level checks (name, capacity, membership, password) come first.
/// Anything the room itself rejects is wrapped in `Room` and keeps the
/// room's reason code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("room name must be 1-30 characters without ',' or ':'")]
    InvalidName,
    #[error("already in a room")]
    AlreadyInRoom,
    #[error("room limit reached")]
    RegistryFull,
    #[error("room not found")]
    NotFound,
    #[error("wrong password")]
    WrongPassword,
    #[error("not in a room")]
    NotInRoom,
    #[error(transparent)]
    Room(#[from] RoomError),
}

impl RegistryError {
    /// Stable snake_case reason code for the wire.
    pub fn code(&self) -> &'static str {
        match self {
            RegistryError::InvalidName => "invalid_name",
            RegistryError::AlreadyInRoom => "already_in_room",
            RegistryError::RegistryFull => "registry_full",
            RegistryError::NotFound => "not_found",
            RegistryError::WrongPassword => "wrong_password",
            RegistryError::NotInRoom => "not_in_room",
            RegistryError::Room(err) => err.code(),
        }
    }
}

/// Result of a successful leave.
#[derive(Debug)]
pub struct Leave {
    pub room: Arc<Room>,
    pub departure: Departure,
}

/// What one maintenance pass cleaned up.
#[derive(Debug, Default)]
pub struct SweepReport {
    /// (room, user) pairs removed because the user's connection was gone.
    pub pruned: Vec<(RoomId, String)>,
    /// Waiting rooms closed for inactivity.
    pub idle_closed: Vec<RoomId>,
    /// Rooms dropped from the registry.
    pub removed: Vec<RoomId>,
    /// Games that ended because pruning left too few players.
    pub finished: Vec<GameSummary>,
}

impl SweepReport {
    /// True when the pass changed nothing.
    pub fn is_empty(&self) -> bool {
        self.pruned.is_empty()
            && self.idle_closed.is_empty()
            && self.removed.is_empty()
            && self.finished.is_empty()
    }
}

struct RegistryMaps {
    rooms: HashMap<RoomId, Arc<Room>>,
    memberships: HashMap<String, RoomId>,
    next_room_id: RoomId,
}

impl RegistryMaps {
    fn drop_if_dead(&mut self, room: &Room) -> bool {
        if room.is_empty() || room.state() == RoomState::Disbanded {
            self.rooms.remove(&room.id());
            info!("Room {} removed after {:?}", room.id(), room.age());
            true
        } else {
            false
        }
    }
}

/// Owns every live room and knows which room each user is in
///
/// Rooms are shared out as `Arc<Room>` so handlers can act on a room without
/// holding the registry lock. Anything that changes membership (create, join,
/// leave, kick, sweep) goes through the registry's write lock, which keeps
/// the membership map and the room rosters in agreement.
pub struct RoomRegistry {
    maps: RwLock<RegistryMaps>,
    max_rooms: usize,
    chat_history: usize,
    chooser: Arc<dyn MoveChooser>,
}

impl RoomRegistry {
    /// Creates an empty registry
    ///
    /// `max_rooms` caps concurrent rooms, `chat_history` is passed to every
    /// new room, and `chooser` drives AI seats in all of them.
    pub fn new(max_rooms: usize, chat_history: usize, chooser: Arc<dyn MoveChooser>) -> Self {
        Self {
            maps: RwLock::new(RegistryMaps {
                rooms: HashMap::new(),
                memberships: HashMap::new(),
                next_room_id: FIRST_ROOM_ID,
            }),
            max_rooms,
            chat_history,
            chooser,
        }
    }

    /// Creates a room and seats the creator as its host.
    pub async fn create_room(
        &self,
        session: &SessionHandle,
        identity: &Identity,
        name: &str,
        is_private: bool,
        password: Option<String>,
    ) -> Result<Arc<Room>, RegistryError> {
        if !is_valid_room_name(name) {
            return Err(RegistryError::InvalidName);
        }

        let mut maps = self.maps.write().await;
        if maps.memberships.contains_key(&identity.user_id) {
            return Err(RegistryError::AlreadyInRoom);
        }
        if maps.rooms.len() >= self.max_rooms {
            return Err(RegistryError::RegistryFull);
        }

        let room_id = maps.next_room_id;
        maps.next_room_id += 1;
        let room = Arc::new(Room::new(
            room_id,
            name.trim(),
            is_private,
            password.filter(|p| !p.is_empty()),
            self.chat_history,
            Arc::clone(&self.chooser),
        ));
        room.add_player(session, identity)?;

        maps.rooms.insert(room_id, Arc::clone(&room));
        maps.memberships.insert(identity.user_id.clone(), room_id);
        info!(
            "Room {} '{}' created by {} ({} rooms)",
            room_id,
            room.name(),
            identity.user_id,
            maps.rooms.len()
        );
        Ok(room)
    }

    /// Seats a user in an existing room
    ///
    /// The room seat and the membership entry are written under one registry
    /// write lock. A room that was disbanded between lookup and seating
    /// reports `NotFound`. Other room-level refusals, such as a session that
    /// is already closing, come back as `RegistryError::Room`.
    pub async fn join_room(
        &self,
        room_id: RoomId,
        session: &SessionHandle,
        identity: &Identity,
        password: Option<&str>,
    ) -> Result<Arc<Room>, RegistryError> {
        let mut maps = self.maps.write().await;
        let room = maps
            .rooms
            .get(&room_id)
            .cloned()
            .ok_or(RegistryError::NotFound)?;
        if maps.memberships.contains_key(&identity.user_id) {
            return Err(RegistryError::AlreadyInRoom);
        }
        if !room.check_password(password) {
            return Err(RegistryError::WrongPassword);
        }

        room.add_player(session, identity).map_err(|err| match err {
            RoomError::Disbanded => RegistryError::NotFound,
            other => RegistryError::Room(other),
        })?;
        maps.memberships.insert(identity.user_id.clone(), room_id);
        Ok(room)
    }

    /// Removes `user_id` from its room, dropping the room if nobody human
    /// is left.
    pub async fn leave_room(&self, user_id: &str) -> Result<Leave, RegistryError> {
        let mut maps = self.maps.write().await;
        let room_id = maps
            .memberships
            .remove(user_id)
            .ok_or(RegistryError::NotInRoom)?;
        let room = maps
            .rooms
            .get(&room_id)
            .cloned()
            .ok_or(RegistryError::NotInRoom)?;

        let departure = room.remove_player(user_id).map_err(|err| match err {
            RoomError::NotMember => RegistryError::NotInRoom,
            other => RegistryError::Room(other),
        })?;
        maps.drop_if_dead(&room);
        Ok(Leave { room, departure })
    }

    /// Host removes `target` from `room_id`; the kicked user's membership is
    /// cleared in the same step.
    pub async fn kick(
        &self,
        room_id: RoomId,
        requester: &str,
        target: &str,
    ) -> Result<(Arc<Room>, Player), RegistryError> {
        let mut maps = self.maps.write().await;
        let room = maps
            .rooms
            .get(&room_id)
            .cloned()
            .ok_or(RegistryError::NotFound)?;
        let kicked = room.kick(requester, target)?;
        if !kicked.is_ai {
            maps.memberships.remove(&kicked.user_id);
        }
        Ok((room, kicked))
    }

    /// Room the user is currently seated in, if any.
    pub async fn room_of(&self, user_id: &str) -> Option<Arc<Room>> {
        let maps = self.maps.read().await;
        maps.memberships
            .get(user_id)
            .and_then(|id| maps.rooms.get(id))
            .cloned()
    }

    pub async fn get(&self, room_id: RoomId) -> Option<Arc<Room>> {
        self.maps.read().await.rooms.get(&room_id).cloned()
    }

    /// Snapshot of every room, ordered by id.
    pub async fn list(&self) -> Vec<RoomSummary> {
        let rooms: Vec<Arc<Room>> = self.maps.read().await.rooms.values().cloned().collect();
        let mut summaries: Vec<RoomSummary> = rooms.iter().map(|room| room.summary()).collect();
        summaries.sort_by_key(|s| s.id);
        summaries
    }

    /// Number of live rooms.
    pub async fn room_count(&self) -> usize {
        self.maps.read().await.rooms.len()
    }

    /// Number of users currently seated, AI excluded.
    pub async fn membership_count(&self) -> usize {
        self.maps.read().await.memberships.len()
    }

    /// Periodic maintenance.
    ///
    /// Drops members whose connection is gone, closes Waiting rooms idle for
    /// longer than `room_idle_timeout`, then forgets empty or disbanded rooms.
    pub async fn sweep(&self, room_idle_timeout: Duration) -> SweepReport {
        let mut report = SweepReport::default();
        let mut maps = self.maps.write().await;
        let rooms: Vec<Arc<Room>> = maps.rooms.values().cloned().collect();

        for room in &rooms {
            for user_id in room.orphaned_members() {
                if maps.memberships.get(&user_id) == Some(&room.id()) {
                    maps.memberships.remove(&user_id);
                }
                if let Ok(departure) = room.remove_player(&user_id) {
                    debug!("Pruned {} from room {}", user_id, room.id());
                    report.pruned.push((room.id(), user_id));
                    report.finished.extend(departure.finished);
                }
            }

            if room.state() == RoomState::Waiting && room.idle_for() >= room_idle_timeout {
                for user_id in room.disband("idle") {
                    maps.memberships.remove(&user_id);
                }
                info!("Room {} closed after {:?} idle", room.id(), room_idle_timeout);
                report.idle_closed.push(room.id());
            }

            if maps.drop_if_dead(room) {
                report.removed.push(room.id());
            }
        }
        report
    }

    /// Every membership points at a room seating that user, and every human
    /// seat has a membership pointing back.
    pub async fn is_consistent(&self) -> bool {
        let maps = self.maps.read().await;
        let forward = maps.memberships.iter().all(|(user_id, room_id)| {
            maps.rooms
                .get(room_id)
                .map_or(false, |room| room.contains(user_id))
        });
        let backward = maps.rooms.iter().all(|(room_id, room)| {
            room.players()
                .iter()
                .filter(|p| !p.is_ai)
                .all(|p| maps.memberships.get(&p.user_id) == Some(room_id))
        });
        forward && backward
    }
}
