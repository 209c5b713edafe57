//! Registered Room
//!
//! Master-side model of one running game server. Brokers client access to it:
//! a round trip to the owning peer mints a time-boxed token, which the game
//! server later confirms when the client actually connects.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{watch, RwLock};
use tracing::{debug, info};

use crate::network::peer::{Peer, PeerId};
use crate::network::protocol::{
    option_keys, OpCode, ProvideAccessCheck, ResponseStatus, RoomAccess, RoomOptions,
};

/// Unique room identifier.
pub type RoomId = u32;

/// Access-broker failures surfaced to the requesting client.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RoomError {
    #[error("You've already requested access to this room")]
    AlreadyRequested,

    #[error("You are already in this room")]
    AlreadyJoined,

    #[error("Room is already full")]
    RoomFull,

    #[error("Failed to confirm the access")]
    InvalidToken,

    #[error("Requester is no longer connected")]
    RequesterGone,

    /// The owning peer rejected (or never answered) the access check.
    #[error("Failed to get access: {0}")]
    AccessCheckFailed(String),
}

/// A token waiting to be claimed at the room's real endpoint.
struct UnconfirmedAccess {
    access: RoomAccess,
    peer: Arc<Peer>,
    expires_at: Instant,
}

/// A running game server known to the master.
pub struct RegisteredRoom {
    id: RoomId,
    peer: Arc<Peer>,
    options: RoomOptions,
    unconfirmed: HashMap<String, UnconfirmedAccess>,
    confirmed: HashMap<PeerId, (Arc<Peer>, RoomAccess)>,
    requests_in_progress: HashSet<PeerId>,
    destroyed_tx: watch::Sender<bool>,
}

impl RegisteredRoom {
    pub fn new(id: RoomId, peer: Arc<Peer>, options: RoomOptions) -> Self {
        let (destroyed_tx, _) = watch::channel(false);
        let mut room = Self {
            id,
            peer,
            options,
            unconfirmed: HashMap::new(),
            confirmed: HashMap::new(),
            requests_in_progress: HashSet::new(),
            destroyed_tx,
        };
        room.override_options_with_properties();
        room
    }

    pub fn id(&self) -> RoomId {
        self.id
    }

    pub fn peer(&self) -> &Arc<Peer> {
        &self.peer
    }

    pub fn options(&self) -> &RoomOptions {
        &self.options
    }

    /// Players with a confirmed access.
    pub fn online_count(&self) -> usize {
        self.confirmed.len()
    }

    /// Well-known properties override the registered flags.
    fn override_options_with_properties(&mut self) {
        if let Some(value) = self.options.properties.get(option_keys::IS_PUBLIC) {
            if let Ok(is_public) = value.parse() {
                self.options.is_public = is_public;
            }
        }
    }

    /// Replace the room's options.
    pub fn change_options(&mut self, options: RoomOptions) {
        self.options = options;
        self.override_options_with_properties();
    }

    /// First phase of the access flow, under the room lock.
    ///
    /// `Ok(Some(_))` re-issues a still-pending grant with a refreshed expiry;
    /// `Ok(None)` marks the requester in progress and tells the caller to go
    /// round-trip to the owner.
    pub fn begin_access_request(
        &mut self,
        peer: &Arc<Peer>,
    ) -> Result<Option<RoomAccess>, RoomError> {
        let peer_id = peer.id();

        if self.requests_in_progress.contains(&peer_id) {
            return Err(RoomError::AlreadyRequested);
        }

        if self.confirmed.contains_key(&peer_id) {
            return Err(RoomError::AlreadyJoined);
        }

        // An unclaimed grant is handed back instead of minting a second one.
        let timeout = self.access_timeout();
        if let Some(existing) = self
            .unconfirmed
            .values_mut()
            .find(|entry| entry.peer.id() == peer_id)
        {
            existing.expires_at = Instant::now() + timeout;
            return Ok(Some(existing.access.clone()));
        }

        if self.options.max_players != 0 {
            let slots_taken = self.requests_in_progress.len()
                + self.unconfirmed.len()
                + self.confirmed.len();
            if slots_taken >= self.options.max_players {
                return Err(RoomError::RoomFull);
            }
        }

        self.requests_in_progress.insert(peer_id);
        Ok(None)
    }

    /// Store the grant the owner just issued.
    pub fn complete_access_request(&mut self, peer: Arc<Peer>, access: RoomAccess) -> RoomAccess {
        self.requests_in_progress.remove(&peer.id());
        self.unconfirmed.insert(
            access.token.clone(),
            UnconfirmedAccess {
                access: access.clone(),
                peer,
                expires_at: Instant::now() + self.access_timeout(),
            },
        );
        access
    }

    /// Clear the reentrancy guard after a failed owner round trip.
    pub fn fail_access_request(&mut self, peer_id: PeerId) {
        self.requests_in_progress.remove(&peer_id);
    }

    /// Consume an unconfirmed grant. Succeeds at most once per token.
    pub fn validate_access(&mut self, token: &str) -> Result<Arc<Peer>, RoomError> {
        let entry = self
            .unconfirmed
            .remove(token)
            .ok_or(RoomError::InvalidToken)?;

        if !entry.peer.is_connected() {
            return Err(RoomError::RequesterGone);
        }

        let peer = Arc::clone(&entry.peer);
        self.confirmed.insert(peer.id(), (Arc::clone(&peer), entry.access));

        info!(room_id = self.id, peer_id = peer.id(), "Player joined room");
        Ok(peer)
    }

    /// Purge grants whose expiry has passed. The requester is not notified.
    pub fn clear_timed_out_accesses(&mut self) -> usize {
        let now = Instant::now();
        let before = self.unconfirmed.len();
        self.unconfirmed.retain(|_, entry| entry.expires_at > now);
        let purged = before - self.unconfirmed.len();
        if purged > 0 {
            debug!(room_id = self.id, purged, "Purged expired room accesses");
        }
        purged
    }

    /// Release the confirmed slot of a departed player.
    pub fn on_player_left(&mut self, peer_id: PeerId) -> Option<Arc<Peer>> {
        let (peer, _) = self.confirmed.remove(&peer_id)?;
        info!(room_id = self.id, peer_id, "Player left room");
        Some(peer)
    }

    /// Observe room destruction (used by lobbies holding this room).
    pub fn on_destroyed(&self) -> watch::Receiver<bool> {
        self.destroyed_tx.subscribe()
    }

    /// Tear the room down and signal observers.
    pub fn destroy(&mut self) {
        self.unconfirmed.clear();
        self.requests_in_progress.clear();
        let _ = self.destroyed_tx.send(true);
    }

    fn access_timeout(&self) -> Duration {
        Duration::from_secs(self.options.access_timeout_secs)
    }
}

impl std::fmt::Debug for RegisteredRoom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredRoom")
            .field("id", &self.id)
            .field("name", &self.options.name)
            .field("online", &self.confirmed.len())
            .finish()
    }
}

/// Full access flow: admission checks, the owner round trip, token storage.
///
/// The room lock is released while the owner is consulted; the in-progress
/// guard keeps concurrent requests from the same peer out in the meantime.
pub async fn get_access(
    room: &Arc<RwLock<RegisteredRoom>>,
    peer: &Arc<Peer>,
    properties: HashMap<String, String>,
    request_timeout: Duration,
) -> Result<RoomAccess, RoomError> {
    let (owner, packet) = {
        let mut guard = room.write().await;
        if let Some(existing) = guard.begin_access_request(peer)? {
            return Ok(existing);
        }
        let packet = ProvideAccessCheck {
            peer_id: peer.id(),
            room_id: guard.id(),
            username: peer.username().unwrap_or_default(),
            properties,
        };
        (Arc::clone(guard.peer()), packet)
    };

    let response = owner
        .request(OpCode::ProvideRoomAccessCheck, &packet, request_timeout)
        .await;

    let mut guard = room.write().await;
    if response.status != ResponseStatus::Success {
        guard.fail_access_request(peer.id());
        return Err(RoomError::AccessCheckFailed(
            response.as_str("Unknown error"),
        ));
    }

    match response.parse::<RoomAccess>() {
        Ok(access) => Ok(guard.complete_access_request(Arc::clone(peer), access)),
        Err(_) => {
            guard.fail_access_request(peer.id());
            Err(RoomError::AccessCheckFailed(
                "Malformed access payload".to_string(),
            ))
        }
    }
}
