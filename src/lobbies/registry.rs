//! Lobby Registry
//!
//! Owns the lobby table and factories, routes every lobby opcode, couples
//! lobbies to the spawn orchestrator when a game starts and to the room
//! registry once the spawned server finalizes.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::lobbies::auto;
use crate::lobbies::factory::{default_factories, LobbyFactory};
use crate::lobbies::lobby::{Lobby, LobbyError, LobbyId};
use crate::network::peer::{IncomingMessage, Peer, PeerId};
use crate::network::protocol::{
    option_keys, JoinTeamRequest, LobbyMemberLookup, ResponseStatus, SetLobbyProperties,
};
use crate::rooms::room;
use crate::rooms::RoomRegistry;
use crate::spawners::task::SpawnTask;
use crate::spawners::SpawnOrchestrator;

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct LobbiesConfig {
    /// Minimum permission level required to create a lobby.
    pub create_lobby_permission_level: i32,
    /// Refuse creation while the creator sits in a lobby.
    pub dont_allow_creating_if_joined: bool,
    /// Tick of the per-lobby auto-start loop.
    pub automation_tick: Duration,
}

impl Default for LobbiesConfig {
    fn default() -> Self {
        Self {
            create_lobby_permission_level: 0,
            dont_allow_creating_if_joined: true,
            automation_tick: Duration::from_secs(1),
        }
    }
}

/// All lobbies the master hosts.
pub struct LobbyRegistry {
    config: LobbiesConfig,
    spawners: Arc<SpawnOrchestrator>,
    rooms: Arc<RoomRegistry>,
    factories: RwLock<BTreeMap<String, LobbyFactory>>,
    lobbies: RwLock<BTreeMap<LobbyId, Arc<RwLock<Lobby>>>>,
    /// The one lobby each peer may sit in.
    peer_lobbies: RwLock<BTreeMap<PeerId, LobbyId>>,
    next_lobby_id: AtomicU32,
}

impl LobbyRegistry {
    /// Build a registry wired to the orchestrator and room registry, with
    /// the stock factories installed.
    pub fn new(
        config: LobbiesConfig,
        spawners: Arc<SpawnOrchestrator>,
        rooms: Arc<RoomRegistry>,
    ) -> Self {
        let mut factories = BTreeMap::new();
        for factory in default_factories() {
            factories.insert(factory.id().to_string(), factory);
        }

        Self {
            config,
            spawners,
            rooms,
            factories: RwLock::new(factories),
            lobbies: RwLock::new(BTreeMap::new()),
            peer_lobbies: RwLock::new(BTreeMap::new()),
            next_lobby_id: AtomicU32::new(0),
        }
    }

    pub async fn add_factory(&self, factory: LobbyFactory) {
        let mut factories = self.factories.write().await;
        if factories.contains_key(factory.id()) {
            warn!(factory_id = factory.id(), "Overriding a lobby factory");
        }
        factories.insert(factory.id().to_string(), factory);
    }

    pub async fn get_lobby(&self, id: LobbyId) -> Option<Arc<RwLock<Lobby>>> {
        self.lobbies.read().await.get(&id).cloned()
    }

    pub async fn lobby_count(&self) -> usize {
        self.lobbies.read().await.len()
    }

    pub async fn lobby_of_peer(&self, peer_id: PeerId) -> Option<Arc<RwLock<Lobby>>> {
        let lobby_id = *self.peer_lobbies.read().await.get(&peer_id)?;
        self.get_lobby(lobby_id).await
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// Create a lobby through a named factory. The creator does not join
    /// automatically.
    pub async fn create_lobby(
        self: &Arc<Self>,
        factory_id: &str,
        properties: &HashMap<String, String>,
        creator: &Arc<Peer>,
    ) -> Result<Arc<RwLock<Lobby>>, LobbyError> {
        let factory = self
            .factories
            .read()
            .await
            .get(factory_id)
            .cloned()
            .ok_or(LobbyError::UnknownFactory)?;

        let id = self.next_lobby_id.fetch_add(1, Ordering::SeqCst);
        let lobby = factory.create(id, properties, creator);
        let auto_policy = lobby.auto_start_policy();
        let lobby = Arc::new(RwLock::new(lobby));

        self.lobbies.write().await.insert(id, Arc::clone(&lobby));
        info!(lobby_id = id, factory_id, "Lobby created");

        if let Some(policy) = auto_policy {
            let registry = Arc::clone(self);
            let automation_lobby = Arc::clone(&lobby);
            let tick = self.config.automation_tick;
            tokio::spawn(async move {
                auto::run_automation(registry, automation_lobby, policy, tick).await;
            });
        }

        Ok(lobby)
    }

    /// Explicitly tear a lobby down and drop every member's index entry.
    pub async fn destroy_lobby(&self, id: LobbyId) {
        let removed = self.lobbies.write().await.remove(&id);
        if let Some(lobby) = removed {
            let mut guard = lobby.write().await;
            let peers = guard.member_peers();
            guard.destroy();
            drop(guard);

            let mut index = self.peer_lobbies.write().await;
            for peer in peers {
                index.remove(&peer.id());
            }
        }
    }

    /// A member's peer went away: drop them from their lobby.
    pub async fn on_peer_disconnected(&self, peer_id: PeerId) {
        let lobby_id = self.peer_lobbies.write().await.remove(&peer_id);
        let lobby_id = match lobby_id {
            Some(id) => id,
            None => return,
        };

        if let Some(lobby) = self.get_lobby(lobby_id).await {
            let destroyed = lobby.write().await.remove_player(peer_id);
            if destroyed {
                self.lobbies.write().await.remove(&lobby_id);
            }
        }
    }

    // =========================================================================
    // GAME START & SPAWN COUPLING
    // =========================================================================

    /// Spawn the lobby's game server and wire the status observer.
    ///
    /// No eligible spawner leaves the lobby in `Preparations` with a
    /// chat-style error broadcast to its members.
    pub async fn start_game(self: &Arc<Self>, lobby: &Arc<RwLock<Lobby>>) -> Result<(), LobbyError> {
        let (properties, region, custom_args) = {
            let mut guard = lobby.write().await;
            if guard.is_destroyed() {
                return Err(LobbyError::LobbyDestroyed);
            }
            guard.prepare_spawn_request()
        };

        let task = match self.spawners.spawn(properties, &region, custom_args).await {
            Some(task) => task,
            None => {
                lobby.read().await.broadcast_chat("Servers are busy", true);
                return Err(LobbyError::NoSpawnersAvailable);
            }
        };

        lobby.write().await.attach_spawn_task(Arc::clone(&task));
        self.observe_spawn_task(Arc::clone(lobby), task);
        Ok(())
    }

    /// Follow a task's status stream, mirroring it into the lobby state.
    fn observe_spawn_task(self: &Arc<Self>, lobby: Arc<RwLock<Lobby>>, task: Arc<SpawnTask>) {
        let registry = Arc::clone(self);
        let mut status_rx = task.subscribe_status();

        tokio::spawn(async move {
            while status_rx.changed().await.is_ok() {
                let status = *status_rx.borrow();
                let finalized = lobby.write().await.apply_spawn_status(status);
                if finalized {
                    registry.resolve_room(&lobby, &task).await;
                }
                if status.is_terminal() {
                    break;
                }
            }
        });
    }

    /// Look up the room named in the finalization payload and hand it to
    /// the lobby, watching for its destruction.
    async fn resolve_room(&self, lobby: &Arc<RwLock<Lobby>>, task: &Arc<SpawnTask>) {
        let data = match task.finalization_data() {
            Some(data) => data,
            None => return,
        };

        let room_id: Option<u32> = data
            .get(option_keys::ROOM_ID)
            .and_then(|value| value.parse().ok());
        let room_id = match room_id {
            Some(id) => id,
            None => {
                lobby
                    .read()
                    .await
                    .broadcast_chat("Game server finalized, but room ID cannot be found", true);
                return;
            }
        };

        let room = match self.rooms.get_room(room_id).await {
            Some(room) => room,
            None => return,
        };

        let (ip, port, mut destroyed_rx) = {
            let guard = room.read().await;
            (
                guard.options().room_ip.clone(),
                guard.options().room_port,
                guard.on_destroyed(),
            )
        };

        lobby.write().await.set_room(Arc::clone(&room), ip, port);
        info!(room_id, "Lobby resolved its game room");

        let lobby = Arc::clone(lobby);
        tokio::spawn(async move {
            while destroyed_rx.changed().await.is_ok() {
                if *destroyed_rx.borrow() {
                    lobby.write().await.on_room_destroyed();
                    break;
                }
            }
        });
    }

    // =========================================================================
    // MESSAGE HANDLERS
    // =========================================================================

    /// `CreateLobby`: client -> master.
    pub async fn handle_create_lobby(self: &Arc<Self>, message: IncomingMessage) {
        if message.peer.permission_level() < self.config.create_lobby_permission_level {
            message.respond_error(ResponseStatus::Unauthorized, "Insufficient permissions");
            return;
        }

        if self.config.dont_allow_creating_if_joined
            && self.peer_lobbies.read().await.contains_key(&message.peer.id())
        {
            message.respond_error(ResponseStatus::Failed, "You are already in a lobby");
            return;
        }

        let properties: HashMap<String, String> = match message.parse() {
            Ok(properties) => properties,
            Err(_) => {
                message.respond_error(ResponseStatus::Failed, "Invalid request");
                return;
            }
        };

        let factory_id = match properties.get(option_keys::LOBBY_FACTORY_ID) {
            Some(id) => id.clone(),
            None => {
                message.respond_error(
                    ResponseStatus::Failed,
                    "Invalid request (undefined factory)",
                );
                return;
            }
        };

        match self
            .create_lobby(&factory_id, &properties, &message.peer)
            .await
        {
            Ok(lobby) => {
                let id = lobby.read().await.id();
                message.respond_ok(&id);
            }
            Err(error) => message.respond_error(ResponseStatus::Failed, error.to_string()),
        }
    }

    /// `JoinLobby`: client -> master.
    pub async fn handle_join_lobby(&self, message: IncomingMessage) {
        if self.peer_lobbies.read().await.contains_key(&message.peer.id()) {
            message.respond_error(ResponseStatus::Failed, "You're already in a lobby");
            return;
        }

        let lobby_id: LobbyId = match message.parse() {
            Ok(id) => id,
            Err(_) => {
                message.respond_error(ResponseStatus::Failed, "Invalid request");
                return;
            }
        };

        let lobby = match self.get_lobby(lobby_id).await {
            Some(lobby) => lobby,
            None => {
                message.respond_error(ResponseStatus::Failed, "Lobby was not found");
                return;
            }
        };

        let mut guard = lobby.write().await;
        match guard.add_player(&message.peer) {
            Ok(()) => {
                let username = message.peer.username().unwrap_or_default();
                let data = guard.generate_lobby_data(Some(&username));
                drop(guard);
                self.peer_lobbies
                    .write()
                    .await
                    .insert(message.peer.id(), lobby_id);
                message.respond_ok(&data);
            }
            Err(error) => {
                drop(guard);
                message.respond_error(ResponseStatus::Failed, error.to_string());
            }
        }
    }

    /// `LeaveLobby`: client -> master.
    pub async fn handle_leave_lobby(&self, message: IncomingMessage) {
        let lobby_id: LobbyId = match message.parse() {
            Ok(id) => id,
            Err(_) => {
                message.respond_error(ResponseStatus::Failed, "Invalid request");
                return;
            }
        };

        if let Some(lobby) = self.get_lobby(lobby_id).await {
            let destroyed = lobby.write().await.remove_player(message.peer.id());
            self.peer_lobbies.write().await.remove(&message.peer.id());
            if destroyed {
                self.lobbies.write().await.remove(&lobby_id);
            }
        }

        message.respond_ok(&lobby_id);
    }

    /// `SetLobbyProperties`: client -> master.
    pub async fn handle_set_lobby_properties(&self, message: IncomingMessage) {
        let data: SetLobbyProperties = match message.parse() {
            Ok(data) => data,
            Err(_) => {
                message.respond_error(ResponseStatus::Failed, "Invalid request");
                return;
            }
        };

        let lobby = match self.get_lobby(data.lobby_id).await {
            Some(lobby) => lobby,
            None => {
                message.respond_error(ResponseStatus::Failed, "Lobby was not found");
                return;
            }
        };

        let mut guard = lobby.write().await;
        for (key, value) in &data.properties {
            if guard
                .set_lobby_property(message.peer.id(), key, value)
                .is_err()
            {
                drop(guard);
                message.respond_error(
                    ResponseStatus::Failed,
                    format!("Failed to set the property: {key}"),
                );
                return;
            }
        }
        drop(guard);
        message.respond_ok(&data.lobby_id);
    }

    /// `SetMyLobbyProperties`: client -> master.
    pub async fn handle_set_my_properties(&self, message: IncomingMessage) {
        let lobby = match self.lobby_of_peer(message.peer.id()).await {
            Some(lobby) => lobby,
            None => {
                message.respond_error(ResponseStatus::Failed, "Lobby was not found");
                return;
            }
        };

        let properties: HashMap<String, String> = match message.parse() {
            Ok(properties) => properties,
            Err(_) => {
                message.respond_error(ResponseStatus::Failed, "Invalid request");
                return;
            }
        };

        let mut guard = lobby.write().await;
        for (key, value) in &properties {
            if guard
                .set_player_property(message.peer.id(), key, value)
                .is_err()
            {
                drop(guard);
                message.respond_error(
                    ResponseStatus::Failed,
                    format!("Failed to set property: {key}"),
                );
                return;
            }
        }
        drop(guard);
        message.respond_ok(&true);
    }

    /// `JoinLobbyTeam`: client -> master.
    pub async fn handle_join_team(&self, message: IncomingMessage) {
        let data: JoinTeamRequest = match message.parse() {
            Ok(data) => data,
            Err(_) => {
                message.respond_error(ResponseStatus::Failed, "Invalid request");
                return;
            }
        };

        let lobby = match self.lobby_of_peer(message.peer.id()).await {
            Some(lobby) => lobby,
            None => {
                message.respond_error(ResponseStatus::Failed, "You're not in a lobby");
                return;
            }
        };

        let result = lobby
            .write()
            .await
            .try_join_team(message.peer.id(), &data.team_name);
        match result {
            Ok(()) => message.respond_ok(&data.team_name),
            Err(error) => message.respond_error(ResponseStatus::Failed, error.to_string()),
        }
    }

    /// `LobbySendChatMessage`: client -> master (notification).
    pub async fn handle_send_chat_message(&self, message: IncomingMessage) {
        let text: String = match message.parse() {
            Ok(text) => text,
            Err(_) => return,
        };

        if let Some(lobby) = self.lobby_of_peer(message.peer.id()).await {
            let _ = lobby.read().await.handle_chat_message(message.peer.id(), &text);
        }
    }

    /// `LobbySetReady`: client -> master.
    pub async fn handle_set_ready(self: &Arc<Self>, message: IncomingMessage) {
        let is_ready: bool = match message.parse() {
            Ok(flag) => flag,
            Err(_) => {
                message.respond_error(ResponseStatus::Failed, "Invalid request");
                return;
            }
        };

        let lobby = match self.lobby_of_peer(message.peer.id()).await {
            Some(lobby) => lobby,
            None => {
                message.respond_error(ResponseStatus::Failed, "You're not in a lobby");
                return;
            }
        };

        let result = lobby.write().await.set_ready_state(message.peer.id(), is_ready);
        match result {
            Ok(should_start) => {
                if should_start {
                    // Configured to start once everyone is ready.
                    let _ = self.start_game(&lobby).await;
                }
                message.respond_ok(&is_ready);
            }
            Err(error) => message.respond_error(ResponseStatus::Failed, error.to_string()),
        }
    }

    /// `LobbyStartGame`: client -> master.
    pub async fn handle_start_game(self: &Arc<Self>, message: IncomingMessage) {
        let lobby = match self.lobby_of_peer(message.peer.id()).await {
            Some(lobby) => lobby,
            None => {
                message.respond_error(ResponseStatus::Failed, "You're not in a lobby");
                return;
            }
        };

        let validation = lobby.read().await.validate_manual_start(message.peer.id());
        if let Err(error) = validation {
            message.respond_error(ResponseStatus::Failed, error.to_string());
            return;
        }

        match self.start_game(&lobby).await {
            Ok(()) => message.respond_ok(&true),
            Err(error) => message.respond_error(ResponseStatus::Failed, error.to_string()),
        }
    }

    /// `GetLobbyRoomAccess`: client -> master.
    pub async fn handle_get_lobby_room_access(&self, message: IncomingMessage) {
        let lobby = match self.lobby_of_peer(message.peer.id()).await {
            Some(lobby) => lobby,
            None => {
                message.respond_error(ResponseStatus::Failed, "Invalid request");
                return;
            }
        };

        let properties: HashMap<String, String> = message.parse().unwrap_or_default();

        let room = match lobby.read().await.room() {
            Some(room) => room,
            None => {
                message.respond_error(ResponseStatus::Failed, "Game is not running");
                return;
            }
        };

        match room::get_access(
            &room,
            &message.peer,
            properties,
            self.rooms.request_timeout(),
        )
        .await
        {
            Ok(access) => message.respond_ok(&access),
            Err(error) => message.respond_error(
                ResponseStatus::Failed,
                format!("Failed to get access to game: {error}"),
            ),
        }
    }

    /// `GetLobbyInfo`: client -> master.
    pub async fn handle_get_lobby_info(&self, message: IncomingMessage) {
        let lobby_id: LobbyId = match message.parse() {
            Ok(id) => id,
            Err(_) => {
                message.respond_error(ResponseStatus::Failed, "Invalid request");
                return;
            }
        };

        let lobby = match self.get_lobby(lobby_id).await {
            Some(lobby) => lobby,
            None => {
                message.respond_error(ResponseStatus::Failed, "Lobby not found");
                return;
            }
        };

        let data = lobby.read().await.generate_lobby_data(None);
        message.respond_ok(&data);
    }

    /// `GetLobbyMemberData`: client -> master.
    pub async fn handle_get_lobby_member_data(&self, message: IncomingMessage) {
        let lookup: LobbyMemberLookup = match message.parse() {
            Ok(lookup) => lookup,
            Err(_) => {
                message.respond_error(ResponseStatus::Failed, "Invalid request");
                return;
            }
        };

        let lobby = match self.get_lobby(lookup.lobby_id).await {
            Some(lobby) => lobby,
            None => {
                message.respond_error(ResponseStatus::Failed, "Lobby not found");
                return;
            }
        };

        let guard = lobby.read().await;
        match guard.member_by_peer(lookup.peer_id) {
            Some(member) => {
                let data = member.generate_data();
                drop(guard);
                message.respond_ok(&data);
            }
            None => {
                drop(guard);
                message.respond_error(ResponseStatus::Failed, "Player is not in the lobby");
            }
        }
    }
}
