#![forbid(unsafe_code)]

// Room module - Room state, admission control, producer directory and moderation

pub mod names;
pub mod reaper;

use crate::error::{SignalError, SignalResult};
use crate::media::types::MediaKind;
use crate::metrics::ServerMetrics;
use crate::signaling::hub::ConnectionHub;
use crate::signaling::protocol::{JoinRole, ProducerSummary, ServerMessage};
use names::{NameReservation, Reservation};
use reaper::{DisconnectReaper, RoomPhase};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Media tag whose producers announce `screen-stopped` when closed
pub const SCREEN_TAG: &str = "screen";

/// A producer published into a room
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerRecord {
    pub owner_peer_id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub media_tag: String,
}

impl ProducerRecord {
    fn summary(&self) -> ProducerSummary {
        ProducerSummary {
            peer_id: self.owner_peer_id.clone(),
            producer_id: self.producer_id.clone(),
            kind: self.kind,
            media_tag: self.media_tag.clone(),
        }
    }
}

/// Room state
struct Room {
    id: String,
    owner_id: String,
    /// Join order
    participants: Vec<String>,
    /// Request order; disjoint from `participants`
    waiting: Vec<String>,
    producers: Vec<ProducerRecord>,
    muted: HashSet<String>,
    /// Collaborative text buffer
    code: String,
    phase: RoomPhase,
}

impl Room {
    fn new(id: &str, owner_id: &str) -> Self {
        Self {
            id: id.to_string(),
            owner_id: owner_id.to_string(),
            participants: vec![owner_id.to_string()],
            waiting: Vec::new(),
            producers: Vec::new(),
            muted: HashSet::new(),
            code: String::new(),
            phase: RoomPhase::Stable,
        }
    }

    fn is_participant(&self, peer_id: &str) -> bool {
        self.participants.iter().any(|p| p == peer_id)
    }

    fn is_waiting(&self, peer_id: &str) -> bool {
        self.waiting.iter().any(|p| p == peer_id)
    }

    /// Drops every producer record owned by `peer_id`, returning their ids
    fn prune_producers(&mut self, peer_id: &str) -> Vec<String> {
        let mut removed = Vec::new();
        self.producers.retain(|p| {
            if p.owner_peer_id == peer_id {
                removed.push(p.producer_id.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    fn require_owner(&self, peer_id: &str, action: &str) -> SignalResult<()> {
        if self.owner_id == peer_id {
            Ok(())
        } else {
            Err(SignalError::Unauthorized(format!("only the room owner may {action}")))
        }
    }
}

/// Read-only view of a room
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSnapshot {
    pub id: String,
    pub owner_id: String,
    pub participants: Vec<String>,
    pub waiting: Vec<String>,
    pub producers: Vec<ProducerRecord>,
    /// Sorted
    pub muted: Vec<String>,
    pub code: String,
    pub in_grace_period: bool,
}

/// Result of `create_or_join`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    pub role: JoinRole,
    /// Peers the (new) owner still has to decide on
    pub pending: Vec<String>,
}

/// How a connection is leaving its room
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Departure {
    /// The connection closed; an owner gets a grace period
    Disconnected,
    /// The client asked to leave; an owner leaving closes the room
    Left,
}

/// Secrets carried by a join request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JoinCredentials {
    /// Token of the requesting connection; kept so a later connection can
    /// resume an ownership this one holds
    pub session_token: Option<String>,
    /// Token of an earlier connection whose room ownership is being resumed
    pub reconnect_token: Option<String>,
}

impl JoinCredentials {
    pub fn session(token: &str) -> Self {
        Self {
            session_token: Some(token.to_string()),
            reconnect_token: None,
        }
    }

    pub fn resuming(mut self, token: &str) -> Self {
        self.reconnect_token = Some(token.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Departed {
    Left(String),
    GraceStarted(String),
    Closed(String),
}

struct Membership {
    room_id: String,
    session_token: Option<String>,
}

impl Membership {
    fn new(room_id: &str, credentials: &JoinCredentials) -> Self {
        Self {
            room_id: room_id.to_string(),
            session_token: credentials.session_token.clone(),
        }
    }
}

#[derive(Default)]
struct RegistryState {
    rooms: HashMap<String, Room>,
    /// peer id → membership, for every participant and waiting peer
    memberships: HashMap<String, Membership>,
}

impl RegistryState {
    fn room_of(&self, peer_id: &str) -> SignalResult<&Room> {
        self.memberships
            .get(peer_id)
            .and_then(|m| self.rooms.get(&m.room_id))
            .ok_or_else(|| SignalError::not_in_room(peer_id))
    }

    fn room_of_mut(&mut self, peer_id: &str) -> SignalResult<&mut Room> {
        let membership = self
            .memberships
            .get(peer_id)
            .ok_or_else(|| SignalError::not_in_room(peer_id))?;
        self.rooms
            .get_mut(&membership.room_id)
            .ok_or_else(|| SignalError::not_in_room(peer_id))
    }

    /// True if `token` is the session token of the peer
    fn holds_session(&self, peer_id: &str, token: Option<&str>) -> bool {
        token.is_some_and(|token| {
            self.memberships
                .get(peer_id)
                .and_then(|m| m.session_token.as_deref())
                == Some(token)
        })
    }

    /// The room `peer_id` is an admitted participant of
    fn joined_room_mut(&mut self, peer_id: &str, room_id: &str) -> SignalResult<&mut Room> {
        self.rooms
            .get_mut(room_id)
            .filter(|room| room.is_participant(peer_id))
            .ok_or_else(|| SignalError::NotInRoom(format!("peer {peer_id} is not in room {room_id}")))
    }
}

/// Owns every room on this instance.
///
/// All room and membership mutation happens under one `std::sync::RwLock`,
/// which is never held across an await point. Notifications caused by a
/// mutation are handed to the connection hub before the lock is released, so
/// each peer observes them in the order the mutations happened.
pub struct RoomRegistry {
    state: StdRwLock<RegistryState>,
    names: Arc<dyn NameReservation>,
    instance_token: String,
    reaper: DisconnectReaper,
    hub: Arc<ConnectionHub>,
    metrics: ServerMetrics,
}

impl RoomRegistry {
    pub fn new(
        names: Arc<dyn NameReservation>,
        instance_token: String,
        grace_period: Duration,
        hub: Arc<ConnectionHub>,
        metrics: ServerMetrics,
    ) -> Self {
        Self {
            state: StdRwLock::new(RegistryState::default()),
            names,
            instance_token,
            reaper: DisconnectReaper::new(grace_period),
            hub,
            metrics,
        }
    }

    /// Joins `room_id`, creating it (with `requester_id` as owner) if this
    /// instance does not know it.
    ///
    /// A peer already in another room leaves it only once the target is
    /// known to be joinable, so a failed join changes nothing.
    ///
    /// # Errors
    /// `RoomNameTaken` if another instance holds the name, or
    /// `NameStoreUnavailable` if the reservation store cannot be reached.
    pub async fn create_or_join(
        self: &Arc<Self>,
        room_id: &str,
        requester_id: &str,
        credentials: &JoinCredentials,
    ) -> SignalResult<JoinOutcome> {
        // Fast path: room is live here
        if let Some(joined) = self.join_existing(room_id, requester_id, credentials) {
            return Ok(self.settle(joined).await);
        }

        // Slow path: reserve the name (no lock held during the store round trip)
        let reservation = if self.names.exists(room_id).await? {
            Reservation::AlreadyTaken
        } else {
            self.names.reserve(room_id, &self.instance_token).await?
        };

        if reservation == Reservation::AlreadyTaken {
            // A concurrent join on this instance may have created it meanwhile
            let joined = self
                .join_existing(room_id, requester_id, credentials)
                .ok_or_else(|| SignalError::RoomNameTaken(room_id.to_string()))?;
            return Ok(self.settle(joined).await);
        }

        let created = {
            let mut guard = self.state.write().unwrap_or_else(|e| e.into_inner());
            let state = &mut *guard;
            if state.rooms.contains_key(room_id) {
                None
            } else {
                let vacated = self.vacate_locked(state, requester_id, room_id);
                state.rooms.insert(room_id.to_string(), Room::new(room_id, requester_id));
                state
                    .memberships
                    .insert(requester_id.to_string(), Membership::new(room_id, credentials));
                Some(vacated)
            }
        };

        let Some(vacated) = created else {
            let joined = self
                .join_existing(room_id, requester_id, credentials)
                .ok_or_else(|| SignalError::RoomNameTaken(room_id.to_string()))?;
            return Ok(self.settle(joined).await);
        };

        self.metrics.inc_rooms_created();
        info!("Created room {} owned by {}", room_id, requester_id);
        let outcome = JoinOutcome {
            role: JoinRole::Owner,
            pending: Vec::new(),
        };
        Ok(self.settle((outcome, vacated)).await)
    }

    /// Releases the name of a room the requester closed by switching away
    async fn settle(&self, (outcome, vacated): (JoinOutcome, Option<String>)) -> JoinOutcome {
        if let Some(closed) = vacated {
            self.release_name(&closed).await;
        }
        outcome
    }

    /// Takes the peer out of any room other than `target_room`.
    ///
    /// An owner switching away closes its room; the closed room's id is
    /// returned so its name can be released once the lock is dropped.
    fn vacate_locked(&self, state: &mut RegistryState, peer_id: &str, target_room: &str) -> Option<String> {
        let current = state.memberships.get(peer_id)?.room_id.clone();
        if current == target_room {
            return None;
        }

        let owns = state.rooms.get(&current).is_some_and(|r| r.owner_id == peer_id);
        if owns {
            info!("Owner {} switched to room {}, closing room {}", peer_id, target_room, current);
            self.close_locked(state, &current).then_some(current)
        } else {
            self.leave_locked(state, peer_id);
            None
        }
    }

    /// Join path for a room this instance already tracks
    fn join_existing(
        &self,
        room_id: &str,
        requester_id: &str,
        credentials: &JoinCredentials,
    ) -> Option<(JoinOutcome, Option<String>)> {
        let mut guard = self.state.write().unwrap_or_else(|e| e.into_inner());
        let state = &mut *guard;
        if !state.rooms.contains_key(room_id) {
            return None;
        }
        let vacated = self.vacate_locked(state, requester_id, room_id);

        if state.rooms.get(room_id).is_some_and(|r| r.phase.is_grace_period()) {
            if let Some(outcome) = self.reclaim_locked(state, room_id, requester_id, credentials) {
                return Some((outcome, vacated));
            }
        }

        let room = state.rooms.get_mut(room_id)?;
        if room.is_participant(requester_id) {
            let is_owner = room.owner_id == requester_id;
            let outcome = JoinOutcome {
                role: if is_owner { JoinRole::Owner } else { JoinRole::Member },
                pending: if is_owner { room.waiting.clone() } else { Vec::new() },
            };
            return Some((outcome, vacated));
        }

        if !room.is_waiting(requester_id) {
            room.waiting.push(requester_id.to_string());
            state
                .memberships
                .insert(requester_id.to_string(), Membership::new(room_id, credentials));
            self.hub.send_to(
                &room.owner_id,
                &ServerMessage::JoinRequest {
                    room_id: room_id.to_string(),
                    peer_id: requester_id.to_string(),
                },
            );
            self.metrics.inc_join_requests();
            info!("Peer {} is waiting for approval in room {}", requester_id, room_id);
        }

        let outcome = JoinOutcome {
            role: JoinRole::Pending,
            pending: Vec::new(),
        };
        Some((outcome, vacated))
    }

    /// Ends the grace period of `room_id` on a join and hands ownership on.
    ///
    /// The heir is the requester when it presents the absent owner's session
    /// token or when nobody else is admitted; otherwise it is the earliest
    /// admitted participant. Returns the requester's outcome when the
    /// requester is the heir; otherwise the requester goes through normal
    /// admission under the new owner.
    fn reclaim_locked(
        &self,
        state: &mut RegistryState,
        room_id: &str,
        requester_id: &str,
        credentials: &JoinCredentials,
    ) -> Option<JoinOutcome> {
        let previous_owner = state.rooms.get(room_id)?.owner_id.clone();
        let resumes = state.holds_session(&previous_owner, credentials.reconnect_token.as_deref());
        let room = state.rooms.get_mut(room_id)?;
        room.phase.cancel();

        let heir = if resumes {
            requester_id.to_string()
        } else {
            room.participants
                .iter()
                .find(|p| **p != previous_owner)
                .cloned()
                .unwrap_or_else(|| requester_id.to_string())
        };

        room.owner_id = heir.clone();
        if previous_owner != heir {
            room.participants.retain(|p| *p != previous_owner);
            room.prune_producers(&previous_owner);
            room.muted.remove(&previous_owner);
            state.memberships.remove(&previous_owner);
        }
        room.waiting.retain(|p| *p != heir);
        room.muted.remove(&heir);
        self.metrics.inc_grace_reclaimed();

        if heir != requester_id {
            // A participant already in the room takes over
            self.hub.send_to(
                &heir,
                &ServerMessage::Joined {
                    room_id: room_id.to_string(),
                    role: JoinRole::Owner,
                    wait_for_approval: false,
                },
            );
            for waiting in &room.waiting {
                self.hub.send_to(
                    &heir,
                    &ServerMessage::JoinRequest {
                        room_id: room_id.to_string(),
                        peer_id: waiting.clone(),
                    },
                );
            }
            info!(
                "Room {} passed to participant {} (previous owner {}), grace period cancelled",
                room_id, heir, previous_owner
            );
            return None;
        }

        if !room.is_participant(requester_id) {
            room.participants.push(requester_id.to_string());
            self.hub.broadcast_except(
                &room.participants,
                requester_id,
                &ServerMessage::ParticipantJoined {
                    peer_id: requester_id.to_string(),
                },
            );
        }
        state
            .memberships
            .insert(requester_id.to_string(), Membership::new(room_id, credentials));

        info!(
            "Room {} reclaimed by {} (previous owner {}), grace period cancelled",
            room_id, requester_id, previous_owner
        );
        Some(JoinOutcome {
            role: JoinRole::Owner,
            pending: room.waiting.clone(),
        })
    }

    /// Admits a waiting peer. Returns false (no-op) if `target_id` was not waiting.
    ///
    /// The target receives `join-approved` with every producer in the room not
    /// owned by the target itself; it receives nothing media-related before this.
    pub fn approve(&self, owner_id: &str, target_id: &str) -> SignalResult<bool> {
        let mut guard = self.state.write().unwrap_or_else(|e| e.into_inner());
        let state = &mut *guard;
        let room = state.room_of_mut(owner_id)?;
        room.require_owner(owner_id, "approve joins")?;

        if !room.is_waiting(target_id) {
            debug!("approve: {} is not waiting in room {}", target_id, room.id);
            return Ok(false);
        }

        room.waiting.retain(|p| p != target_id);
        if !room.is_participant(target_id) {
            room.participants.push(target_id.to_string());
        }

        let producers: Vec<ProducerSummary> = room
            .producers
            .iter()
            .filter(|p| p.owner_peer_id != target_id)
            .map(ProducerRecord::summary)
            .collect();

        self.hub.send_to(
            target_id,
            &ServerMessage::JoinApproved {
                room_id: room.id.clone(),
                producers,
            },
        );
        self.hub.broadcast_except(
            &room.participants,
            target_id,
            &ServerMessage::ParticipantJoined {
                peer_id: target_id.to_string(),
            },
        );

        self.metrics.inc_approvals();
        info!("approve: {} admitted {} to room {}", owner_id, target_id, room.id);
        Ok(true)
    }

    /// Rejects a waiting peer. Returns false (no-op) if `target_id` was not waiting.
    pub fn deny(&self, owner_id: &str, target_id: &str) -> SignalResult<bool> {
        let mut guard = self.state.write().unwrap_or_else(|e| e.into_inner());
        let state = &mut *guard;
        let room = state.room_of_mut(owner_id)?;
        room.require_owner(owner_id, "deny joins")?;

        if !room.is_waiting(target_id) {
            return Ok(false);
        }

        room.waiting.retain(|p| p != target_id);
        let room_id = room.id.clone();
        state.memberships.remove(target_id);
        self.hub.send_to(target_id, &ServerMessage::JoinDenied { room_id: room_id.clone() });

        self.metrics.inc_denials();
        info!("deny: {} denied {} from room {}", owner_id, target_id, room_id);
        Ok(true)
    }

    /// Removes a non-owner peer from its room (participants or waiting),
    /// pruning its producer records and telling the remaining participants.
    ///
    /// Returns the room left, or `None` if the peer has no room or owns it;
    /// owners go through [`RoomRegistry::depart`].
    pub fn leave(&self, peer_id: &str) -> Option<String> {
        let mut guard = self.state.write().unwrap_or_else(|e| e.into_inner());
        self.leave_locked(&mut guard, peer_id)
    }

    fn leave_locked(&self, state: &mut RegistryState, peer_id: &str) -> Option<String> {
        let room_id = state.memberships.get(peer_id)?.room_id.clone();
        let Some(room) = state.rooms.get_mut(&room_id) else {
            state.memberships.remove(peer_id);
            return None;
        };
        if room.owner_id == peer_id {
            return None;
        }

        state.memberships.remove(peer_id);

        if room.is_waiting(peer_id) {
            room.waiting.retain(|p| p != peer_id);
            debug!("Waiting peer {} withdrew from room {}", peer_id, room_id);
            return Some(room_id);
        }

        room.participants.retain(|p| p != peer_id);
        room.muted.remove(peer_id);
        let producer_ids = room.prune_producers(peer_id);
        self.hub.broadcast(
            &room.participants,
            &ServerMessage::ParticipantLeft {
                peer_id: peer_id.to_string(),
                producer_ids,
            },
        );

        info!("Peer {} left room {}", peer_id, room_id);
        Some(room_id)
    }

    /// Handles a peer leaving its room for any reason.
    ///
    /// Non-owners leave immediately. An owner whose connection closed starts
    /// the room's grace period; an owner who asked to leave closes the room.
    pub async fn depart(self: &Arc<Self>, peer_id: &str, how: Departure) -> Option<Departed> {
        let departed = {
            let mut guard = self.state.write().unwrap_or_else(|e| e.into_inner());
            let state = &mut *guard;
            let room_id = state.memberships.get(peer_id)?.room_id.clone();
            let is_owner = state.rooms.get(&room_id).is_some_and(|r| r.owner_id == peer_id);

            if !is_owner {
                self.leave_locked(state, peer_id).map(Departed::Left)
            } else if how == Departure::Disconnected {
                self.begin_grace_locked(state, &room_id, peer_id);
                Some(Departed::GraceStarted(room_id))
            } else {
                self.close_locked(state, &room_id);
                Some(Departed::Closed(room_id))
            }
        };

        if let Some(Departed::Closed(room_id)) = &departed {
            self.release_name(room_id).await;
        }
        departed
    }

    fn begin_grace_locked(self: &Arc<Self>, state: &mut RegistryState, room_id: &str, owner_id: &str) {
        let Some(room) = state.rooms.get_mut(room_id) else {
            return;
        };

        // The owner's media handles are being released; drop their records
        let producer_ids = room.prune_producers(owner_id);
        self.hub.broadcast_except(
            &room.participants,
            owner_id,
            &ServerMessage::ParticipantLeft {
                peer_id: owner_id.to_string(),
                producer_ids,
            },
        );

        let registry = Arc::downgrade(self);
        let expiring_room = room_id.to_string();
        let grace = self.reaper.start(room_id, move |epoch| async move {
            if let Some(registry) = registry.upgrade() {
                registry.expire_grace(&expiring_room, epoch).await;
            }
        });
        room.phase.cancel();
        room.phase = RoomPhase::GracePeriod(grace);

        self.metrics.inc_grace_started();
        info!(
            "Owner {} disconnected from room {}, starting {}s grace period",
            owner_id,
            room_id,
            self.reaper.delay().as_secs()
        );
    }

    /// Timer callback: destroys the room if it is still in grace period `epoch`
    async fn expire_grace(&self, room_id: &str, epoch: u64) {
        let destroyed = {
            let mut guard = self.state.write().unwrap_or_else(|e| e.into_inner());
            let state = &mut *guard;
            let current = state
                .rooms
                .get(room_id)
                .is_some_and(|room| room.phase.is_current(epoch));
            current && self.close_locked(state, room_id)
        };

        if destroyed {
            self.metrics.inc_grace_expired();
            info!("Grace period expired for room {}, room destroyed", room_id);
            self.release_name(room_id).await;
        } else {
            debug!("Grace timer {} for room {} lost to a rejoin", epoch, room_id);
        }
    }

    /// Removes the room and tells everyone in it. True if the room existed.
    fn close_locked(&self, state: &mut RegistryState, room_id: &str) -> bool {
        let Some(mut room) = state.rooms.remove(room_id) else {
            return false;
        };
        room.phase.cancel();

        for peer_id in room.participants.iter().chain(room.waiting.iter()) {
            state.memberships.remove(peer_id);
        }

        let message = ServerMessage::RoomClosed {
            room_id: room_id.to_string(),
        };
        self.hub.broadcast(&room.participants, &message);
        self.hub.broadcast(&room.waiting, &message);

        self.metrics.inc_rooms_closed();
        info!(
            "Closed room {} ({} participants, {} waiting)",
            room_id,
            room.participants.len(),
            room.waiting.len()
        );
        true
    }

    /// Explicitly destroys the owner's room. Returns the room id.
    pub async fn close(&self, owner_id: &str) -> SignalResult<String> {
        let room_id = {
            let mut guard = self.state.write().unwrap_or_else(|e| e.into_inner());
            let state = &mut *guard;
            let room = state.room_of(owner_id)?;
            room.require_owner(owner_id, "close the room")?;
            let room_id = room.id.clone();
            self.close_locked(state, &room_id);
            room_id
        };

        self.release_name(&room_id).await;
        Ok(room_id)
    }

    async fn release_name(&self, room_id: &str) {
        if let Err(e) = self.names.release(room_id).await {
            warn!("Failed to release reservation for room {}: {}", room_id, e);
        }
    }

    /// Records a producer and announces it to every other participant
    pub fn register_producer(
        &self,
        peer_id: &str,
        producer_id: &str,
        kind: MediaKind,
        media_tag: &str,
    ) -> SignalResult<()> {
        let mut guard = self.state.write().unwrap_or_else(|e| e.into_inner());
        let room = guard.room_of_mut(peer_id)?;
        if !room.is_participant(peer_id) {
            return Err(SignalError::NotInRoom(format!(
                "peer {peer_id} has not been admitted to room {}",
                room.id
            )));
        }

        room.producers.push(ProducerRecord {
            owner_peer_id: peer_id.to_string(),
            producer_id: producer_id.to_string(),
            kind,
            media_tag: media_tag.to_string(),
        });
        self.hub.broadcast_except(
            &room.participants,
            peer_id,
            &ServerMessage::NewProducer {
                peer_id: peer_id.to_string(),
                producer_id: producer_id.to_string(),
                kind,
                media_tag: media_tag.to_string(),
            },
        );

        self.metrics.inc_producers_created();
        info!(
            "Registered {:?} producer {} ({}) for {} in room {}",
            kind, producer_id, media_tag, peer_id, room.id
        );
        Ok(())
    }

    /// Removes one of the peer's producer records and announces it
    pub fn remove_producer(&self, peer_id: &str, producer_id: &str) -> SignalResult<ProducerRecord> {
        let mut guard = self.state.write().unwrap_or_else(|e| e.into_inner());
        let room = guard.room_of_mut(peer_id)?;
        let index = room
            .producers
            .iter()
            .position(|p| p.producer_id == producer_id && p.owner_peer_id == peer_id)
            .ok_or_else(|| SignalError::TransportNotFound(format!("producer {producer_id}")))?;
        let record = room.producers.remove(index);

        let message = if record.media_tag == SCREEN_TAG {
            ServerMessage::ScreenStopped {
                peer_id: peer_id.to_string(),
                producer_id: producer_id.to_string(),
            }
        } else {
            ServerMessage::ProducerClosed {
                peer_id: peer_id.to_string(),
                producer_id: producer_id.to_string(),
            }
        };
        self.hub.broadcast_except(&room.participants, peer_id, &message);

        debug!("Removed producer {} of {} from room {}", producer_id, peer_id, room.id);
        Ok(record)
    }

    /// Grants (`muted == false`) or revokes a participant's chat permission
    pub fn set_mute(&self, owner_id: &str, target_id: &str, muted: bool) -> SignalResult<()> {
        let mut guard = self.state.write().unwrap_or_else(|e| e.into_inner());
        let room = guard.room_of_mut(owner_id)?;
        room.require_owner(owner_id, "change chat permissions")?;
        if !room.is_participant(target_id) {
            return Err(SignalError::NotInRoom(format!(
                "peer {target_id} is not a participant of room {}",
                room.id
            )));
        }

        if muted {
            room.muted.insert(target_id.to_string());
        } else {
            room.muted.remove(target_id);
        }
        self.hub.send_to(
            target_id,
            &ServerMessage::ChatPerm {
                room_id: room.id.clone(),
                enabled: !muted,
            },
        );

        info!("set_mute: {} set muted={} for {} in room {}", owner_id, muted, target_id, room.id);
        Ok(())
    }

    /// Relays a chat message to every participant, sender included.
    ///
    /// Returns false when the sender is muted: the message is dropped and the
    /// sender is told nothing.
    pub fn chat(&self, peer_id: &str, room_id: &str, text: &str) -> SignalResult<bool> {
        let mut guard = self.state.write().unwrap_or_else(|e| e.into_inner());
        let room = guard.joined_room_mut(peer_id, room_id)?;

        if room.muted.contains(peer_id) {
            self.metrics.inc_chat_dropped();
            debug!("Dropped chat from muted peer {} in room {}", peer_id, room_id);
            return Ok(false);
        }

        self.hub.broadcast(
            &room.participants,
            &ServerMessage::ChatRecv {
                room_id: room_id.to_string(),
                peer_id: peer_id.to_string(),
                text: text.to_string(),
            },
        );
        self.metrics.inc_chat_relayed();
        Ok(true)
    }

    /// Current collaborative text of the room
    pub fn code(&self, peer_id: &str, room_id: &str) -> SignalResult<String> {
        let mut guard = self.state.write().unwrap_or_else(|e| e.into_inner());
        let room = guard.joined_room_mut(peer_id, room_id)?;
        Ok(room.code.clone())
    }

    /// Replaces the collaborative text and pushes it to the other participants
    pub fn set_code(&self, peer_id: &str, room_id: &str, text: &str) -> SignalResult<()> {
        let mut guard = self.state.write().unwrap_or_else(|e| e.into_inner());
        let room = guard.joined_room_mut(peer_id, room_id)?;
        room.code = text.to_string();
        self.hub.broadcast_except(
            &room.participants,
            peer_id,
            &ServerMessage::CodeUpdate {
                room_id: room_id.to_string(),
                peer_id: peer_id.to_string(),
                text: text.to_string(),
            },
        );
        Ok(())
    }

    /// Room the peer participates in or waits for
    pub fn room_id_of(&self, peer_id: &str) -> Option<String> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.memberships.get(peer_id).map(|m| m.room_id.clone())
    }

    /// Room the peer has been admitted to
    ///
    /// # Errors
    /// `NotInRoom` if the peer has no room or is still waiting for approval.
    pub fn require_participant(&self, peer_id: &str) -> SignalResult<String> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        let room = state.room_of(peer_id)?;
        if room.is_participant(peer_id) {
            Ok(room.id.clone())
        } else {
            Err(SignalError::NotInRoom(format!(
                "peer {peer_id} has not been admitted to room {}",
                room.id
            )))
        }
    }

    /// Producer record in `room_id`, if still present
    pub fn producer(&self, room_id: &str, producer_id: &str) -> Option<ProducerRecord> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state
            .rooms
            .get(room_id)?
            .producers
            .iter()
            .find(|p| p.producer_id == producer_id)
            .cloned()
    }

    pub fn snapshot(&self, room_id: &str) -> Option<RoomSnapshot> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        let room = state.rooms.get(room_id)?;
        let mut muted: Vec<String> = room.muted.iter().cloned().collect();
        muted.sort();
        Some(RoomSnapshot {
            id: room.id.clone(),
            owner_id: room.owner_id.clone(),
            participants: room.participants.clone(),
            waiting: room.waiting.clone(),
            producers: room.producers.clone(),
            muted,
            code: room.code.clone(),
            in_grace_period: room.phase.is_grace_period(),
        })
    }

    pub fn room_count(&self) -> usize {
        self.state.read().unwrap_or_else(|e| e.into_inner()).rooms.len()
    }

    pub fn participant_count(&self) -> usize {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.rooms.values().map(|r| r.participants.len()).sum()
    }

    /// Closes every room and releases every reservation
    pub async fn shutdown(&self) {
        let closed: Vec<String> = {
            let mut guard = self.state.write().unwrap_or_else(|e| e.into_inner());
            let state = &mut *guard;
            let room_ids: Vec<String> = state.rooms.keys().cloned().collect();
            room_ids
                .into_iter()
                .filter(|room_id| self.close_locked(state, room_id))
                .collect()
        };

        for room_id in &closed {
            self.release_name(room_id).await;
        }
        info!("All rooms shut down ({} total)", closed.len());
    }
}
