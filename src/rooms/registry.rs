//! Room Registry
//!
//! Owns every registered room, the peer ownership index used for disconnect
//! cascades, and the periodic sweep of expired access grants. All room-side
//! opcodes are handled here.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::info;

use crate::network::peer::{IncomingMessage, Peer, PeerId};
use crate::network::protocol::{
    PlayerLeftRoom, ResponseStatus, RoomAccessRequest, RoomOptions, SaveRoomOptions,
    UsernameAndPeerId, ValidateRoomAccess,
};
use crate::rooms::room::{self, RegisteredRoom, RoomId};

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RoomsConfig {
    /// Minimum permission level required to register a room.
    pub register_room_permission_level: i32,
    /// How often expired unconfirmed accesses are purged.
    pub access_sweep_interval: Duration,
    /// Timeout for access-check round trips to room owners.
    pub request_timeout: Duration,
}

impl Default for RoomsConfig {
    fn default() -> Self {
        Self {
            register_room_permission_level: 0,
            access_sweep_interval: Duration::from_secs(1),
            request_timeout: Duration::from_secs(5),
        }
    }
}

/// All rooms the master can broker access to.
pub struct RoomRegistry {
    config: RoomsConfig,
    rooms: RwLock<BTreeMap<RoomId, Arc<RwLock<RegisteredRoom>>>>,
    /// Ownership index consulted on peer disconnect.
    peer_rooms: RwLock<BTreeMap<PeerId, Vec<RoomId>>>,
    next_room_id: AtomicU32,
}

impl RoomRegistry {
    pub fn new(config: RoomsConfig) -> Self {
        Self {
            config,
            rooms: RwLock::new(BTreeMap::new()),
            peer_rooms: RwLock::new(BTreeMap::new()),
            next_room_id: AtomicU32::new(0),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        self.config.request_timeout
    }

    // =========================================================================
    // REGISTRY
    // =========================================================================

    pub async fn register_room(
        &self,
        peer: Arc<Peer>,
        options: RoomOptions,
    ) -> Arc<RwLock<RegisteredRoom>> {
        let id = self.next_room_id.fetch_add(1, Ordering::SeqCst);
        let peer_id = peer.id();
        let room = Arc::new(RwLock::new(RegisteredRoom::new(id, peer, options)));

        self.rooms.write().await.insert(id, Arc::clone(&room));
        self.peer_rooms
            .write()
            .await
            .entry(peer_id)
            .or_default()
            .push(id);

        info!(room_id = id, "Room registered");
        room
    }

    pub async fn destroy_room(&self, id: RoomId) {
        let removed = self.rooms.write().await.remove(&id);
        if let Some(room) = removed {
            let mut guard = room.write().await;
            let peer_id = guard.peer().id();
            guard.destroy();
            drop(guard);

            if let Some(owned) = self.peer_rooms.write().await.get_mut(&peer_id) {
                owned.retain(|owned_id| *owned_id != id);
            }
            info!(room_id = id, "Room destroyed");
        }
    }

    /// Cascade-destroy every room this peer owned.
    pub async fn on_peer_disconnected(&self, peer_id: PeerId) {
        let owned = self.peer_rooms.write().await.remove(&peer_id);
        if let Some(owned) = owned {
            for id in owned {
                let removed = self.rooms.write().await.remove(&id);
                if let Some(room) = removed {
                    room.write().await.destroy();
                    info!(room_id = id, "Room destroyed (peer disconnected)");
                }
            }
        }
    }

    pub async fn get_room(&self, id: RoomId) -> Option<Arc<RwLock<RegisteredRoom>>> {
        self.rooms.read().await.get(&id).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    // =========================================================================
    // SWEEP
    // =========================================================================

    /// One pass over every room's unconfirmed grants.
    pub async fn sweep_once(&self) {
        let rooms: Vec<Arc<RwLock<RegisteredRoom>>> =
            self.rooms.read().await.values().cloned().collect();
        for room in rooms {
            room.write().await.clear_timed_out_accesses();
        }
    }

    /// Periodic expiry sweep.
    pub fn run_access_sweep(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.config.access_sweep_interval);
            loop {
                ticker.tick().await;
                self.sweep_once().await;
            }
        })
    }

    // =========================================================================
    // MESSAGE HANDLERS
    // =========================================================================

    /// `RegisterRoom`: game server -> master.
    pub async fn handle_register_room(&self, message: IncomingMessage) {
        if message.peer.permission_level() < self.config.register_room_permission_level {
            message.respond_error(ResponseStatus::Unauthorized, "Insufficient permissions");
            return;
        }

        let options: RoomOptions = match message.parse() {
            Ok(options) => options,
            Err(_) => {
                message.respond_error(ResponseStatus::Failed, "Invalid request");
                return;
            }
        };

        let room = self.register_room(Arc::clone(&message.peer), options).await;
        let id = room.read().await.id();
        message.respond_ok(&id);
    }

    /// `DestroyRoom`: game server -> master.
    pub async fn handle_destroy_room(&self, message: IncomingMessage) {
        let room_id: RoomId = match message.parse() {
            Ok(id) => id,
            Err(_) => {
                message.respond_error(ResponseStatus::Failed, "Invalid request");
                return;
            }
        };

        let room = match self.get_room(room_id).await {
            Some(room) => room,
            None => {
                message.respond_error(ResponseStatus::Failed, "Room does not exist");
                return;
            }
        };

        if room.read().await.peer().id() != message.peer.id() {
            message.respond_error(ResponseStatus::Unauthorized, "You're not the creator of the room");
            return;
        }

        self.destroy_room(room_id).await;
        message.respond_ok(&room_id);
    }

    /// `SaveRoomOptions`: game server -> master.
    pub async fn handle_save_room_options(&self, message: IncomingMessage) {
        let data: SaveRoomOptions = match message.parse() {
            Ok(data) => data,
            Err(_) => {
                message.respond_error(ResponseStatus::Failed, "Invalid request");
                return;
            }
        };

        let room = match self.get_room(data.room_id).await {
            Some(room) => room,
            None => {
                message.respond_error(ResponseStatus::Failed, "Room does not exist");
                return;
            }
        };

        let mut guard = room.write().await;
        if guard.peer().id() != message.peer.id() {
            drop(guard);
            message.respond_error(ResponseStatus::Unauthorized, "You're not the creator of the room");
            return;
        }

        guard.change_options(data.options);
        drop(guard);
        message.respond_ok(&data.room_id);
    }

    /// `GetRoomAccess`: client -> master.
    pub async fn handle_get_room_access(&self, message: IncomingMessage) {
        let data: RoomAccessRequest = match message.parse() {
            Ok(data) => data,
            Err(_) => {
                message.respond_error(ResponseStatus::Failed, "Invalid request");
                return;
            }
        };

        let room = match self.get_room(data.room_id).await {
            Some(room) => room,
            None => {
                message.respond_error(ResponseStatus::Failed, "Room does not exist");
                return;
            }
        };

        {
            let guard = room.read().await;
            let password = &guard.options().password;
            if !password.is_empty() && *password != data.password {
                drop(guard);
                message.respond_error(ResponseStatus::Unauthorized, "Invalid password");
                return;
            }
        }

        match room::get_access(&room, &message.peer, data.properties, self.config.request_timeout)
            .await
        {
            Ok(access) => message.respond_ok(&access),
            Err(error) => message.respond_error(ResponseStatus::Unauthorized, error.to_string()),
        }
    }

    /// `ValidateRoomAccess`: game server -> master.
    pub async fn handle_validate_room_access(&self, message: IncomingMessage) {
        let data: ValidateRoomAccess = match message.parse() {
            Ok(data) => data,
            Err(_) => {
                message.respond_error(ResponseStatus::Failed, "Invalid request");
                return;
            }
        };

        let room = match self.get_room(data.room_id).await {
            Some(room) => room,
            None => {
                message.respond_error(ResponseStatus::Failed, "Room does not exist");
                return;
            }
        };

        let mut guard = room.write().await;
        if guard.peer().id() != message.peer.id() {
            drop(guard);
            message.respond_error(ResponseStatus::Unauthorized, "You're not the creator of the room");
            return;
        }

        match guard.validate_access(&data.token) {
            Ok(player) => {
                drop(guard);
                let packet = UsernameAndPeerId {
                    username: player.username().unwrap_or_default(),
                    peer_id: player.id(),
                };
                message.respond_ok(&packet);
            }
            Err(error) => {
                drop(guard);
                message.respond_error(ResponseStatus::Unauthorized, error.to_string());
            }
        }
    }

    /// `PlayerLeftRoom`: game server -> master.
    pub async fn handle_player_left_room(&self, message: IncomingMessage) {
        let data: PlayerLeftRoom = match message.parse() {
            Ok(data) => data,
            Err(_) => {
                message.respond_error(ResponseStatus::Failed, "Invalid request");
                return;
            }
        };

        let room = match self.get_room(data.room_id).await {
            Some(room) => room,
            None => {
                message.respond_error(ResponseStatus::Failed, "Room does not exist");
                return;
            }
        };

        let mut guard = room.write().await;
        if guard.peer().id() != message.peer.id() {
            drop(guard);
            message.respond_error(ResponseStatus::Unauthorized, "You're not the creator of the room");
            return;
        }

        guard.on_player_left(data.peer_id);
        drop(guard);
        message.respond_ok(&data.room_id);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::network::peer::{OutgoingRequest, Response};
    use crate::network::protocol::{OpCode, ProvideAccessCheck, RoomAccess};
    use crate::rooms::room::RoomError;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn registry() -> Arc<RoomRegistry> {
        Arc::new(RoomRegistry::new(RoomsConfig {
            request_timeout: Duration::from_millis(200),
            ..Default::default()
        }))
    }

    /// Owner side granting every access check with a deterministic token.
    fn granting_owner(mut rx: UnboundedReceiver<OutgoingRequest>) {
        tokio::spawn(async move {
            let mut counter = 0u32;
            while let Some(outgoing) = rx.recv().await {
                counter += 1;
                let check: ProvideAccessCheck =
                    serde_json::from_value(outgoing.payload).unwrap();
                let access = RoomAccess {
                    token: format!("token-{counter}"),
                    room_id: check.room_id,
                    room_ip: "10.0.0.4".to_string(),
                    room_port: 7777,
                    properties: HashMap::new(),
                };
                if let Some(responder) = outgoing.responder {
                    let _ = responder.send(Response::ok(&access));
                }
            }
        });
    }

    async fn request_access(
        registry: &RoomRegistry,
        peer: &Arc<Peer>,
        room_id: RoomId,
    ) -> Response {
        let (message, response_rx) = IncomingMessage::request(
            Arc::clone(peer),
            OpCode::GetRoomAccess,
            &RoomAccessRequest {
                room_id,
                password: String::new(),
                properties: HashMap::new(),
            },
        );
        registry.handle_get_room_access(message).await;
        response_rx.await.unwrap()
    }

    #[tokio::test]
    async fn room_capacity_one_blocks_second_peer_until_slot_frees() {
        // End-to-end over the handlers: grant A, reject B, confirm A,
        // reject A's re-request.
        let registry = registry();
        let (owner, owner_rx) = Peer::channel(1);
        let room = registry
            .register_room(
                Arc::clone(&owner),
                RoomOptions {
                    max_players: 1,
                    ..Default::default()
                },
            )
            .await;
        let room_id = room.read().await.id();
        granting_owner(owner_rx);

        let (peer_a, _arx) = Peer::channel(10);
        let (peer_b, _brx) = Peer::channel(11);

        let granted = request_access(&registry, &peer_a, room_id).await;
        assert_eq!(granted.status, ResponseStatus::Success);
        let access: RoomAccess = granted.parse().unwrap();

        let rejected = request_access(&registry, &peer_b, room_id).await;
        assert_eq!(rejected.status, ResponseStatus::Unauthorized);
        assert_eq!(rejected.as_str(""), "Room is already full");

        // Owner confirms the token.
        let (message, response_rx) = IncomingMessage::request(
            Arc::clone(&owner),
            OpCode::ValidateRoomAccess,
            &ValidateRoomAccess {
                room_id,
                token: access.token.clone(),
            },
        );
        registry.handle_validate_room_access(message).await;
        let confirmed = response_rx.await.unwrap();
        assert_eq!(confirmed.status, ResponseStatus::Success);
        let identity: UsernameAndPeerId = confirmed.parse().unwrap();
        assert_eq!(identity.peer_id, peer_a.id());

        let again = request_access(&registry, &peer_a, room_id).await;
        assert_eq!(again.status, ResponseStatus::Unauthorized);
        assert_eq!(again.as_str(""), "You are already in this room");
    }

    #[tokio::test]
    async fn wrong_password_is_rejected_before_the_owner_is_asked() {
        let registry = registry();
        let (owner, _owner_rx) = Peer::channel(1);
        let room = registry
            .register_room(
                owner,
                RoomOptions {
                    password: "sesame".to_string(),
                    ..Default::default()
                },
            )
            .await;
        let room_id = room.read().await.id();

        let (client, _crx) = Peer::channel(10);
        let response = request_access(&registry, &client, room_id).await;
        assert_eq!(response.status, ResponseStatus::Unauthorized);
        assert_eq!(response.as_str(""), "Invalid password");
    }

    #[tokio::test]
    async fn only_the_owner_may_validate_or_destroy() {
        let registry = registry();
        let (owner, owner_rx) = Peer::channel(1);
        let room = registry.register_room(owner, RoomOptions::default()).await;
        let room_id = room.read().await.id();
        granting_owner(owner_rx);

        let (impostor, _irx) = Peer::channel(66);
        let (message, response_rx) = IncomingMessage::request(
            Arc::clone(&impostor),
            OpCode::ValidateRoomAccess,
            &ValidateRoomAccess {
                room_id,
                token: "whatever".to_string(),
            },
        );
        registry.handle_validate_room_access(message).await;
        assert_eq!(
            response_rx.await.unwrap().status,
            ResponseStatus::Unauthorized
        );

        let (message, response_rx) =
            IncomingMessage::request(impostor, OpCode::DestroyRoom, &room_id);
        registry.handle_destroy_room(message).await;
        assert_eq!(
            response_rx.await.unwrap().status,
            ResponseStatus::Unauthorized
        );
        assert_eq!(registry.room_count().await, 1);
    }

    #[tokio::test]
    async fn disconnect_cascades_to_owned_rooms() {
        let registry = registry();
        let (owner, _rx) = Peer::channel(1);
        let room = registry
            .register_room(Arc::clone(&owner), RoomOptions::default())
            .await;
        registry
            .register_room(Arc::clone(&owner), RoomOptions::default())
            .await;
        assert_eq!(registry.room_count().await, 2);

        let mut destroyed_rx = room.read().await.on_destroyed();

        owner.mark_disconnected();
        registry.on_peer_disconnected(owner.id()).await;
        assert_eq!(registry.room_count().await, 0);

        // Observers saw the destruction signal.
        destroyed_rx.changed().await.unwrap();
        assert!(*destroyed_rx.borrow());
    }

    #[tokio::test]
    async fn sweep_purges_expired_grants_across_rooms() {
        let registry = registry();
        let (owner, owner_rx) = Peer::channel(1);
        let room = registry
            .register_room(
                owner,
                RoomOptions {
                    access_timeout_secs: 0,
                    ..Default::default()
                },
            )
            .await;
        let room_id = room.read().await.id();
        granting_owner(owner_rx);

        let (client, _crx) = Peer::channel(10);
        let granted = request_access(&registry, &client, room_id).await;
        let access: RoomAccess = granted.parse().unwrap();

        registry.sweep_once().await;

        let result = room.write().await.validate_access(&access.token);
        assert!(matches!(result, Err(RoomError::InvalidToken)));
    }
}
