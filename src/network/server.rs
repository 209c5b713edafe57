//! Master Server
//!
//! Top-level wiring: builds the spawn orchestrator, room registry and lobby
//! registry, routes inbound messages by opcode, runs the periodic background
//! loops and fans peer disconnects out to every registry.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::lobbies::{LobbiesConfig, LobbyRegistry};
use crate::network::peer::{IncomingMessage, Peer};
use crate::network::protocol::{OpCode, ResponseStatus};
use crate::rooms::{RoomRegistry, RoomsConfig};
use crate::spawners::{SpawnOrchestrator, SpawnerConfig};

/// Master server configuration.
#[derive(Debug, Clone)]
pub struct MasterConfig {
    /// Tick of the spawn dispatch pump.
    pub queue_update_interval: Duration,
    /// Tick of the unconfirmed-access expiry sweep.
    pub access_sweep_interval: Duration,
    /// Tick of per-lobby auto-start loops.
    pub automation_tick: Duration,
    /// Timeout applied to every cross-peer round trip.
    pub request_timeout: Duration,
    /// Whether plain clients may request spawns.
    pub enable_client_spawn_requests: bool,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            queue_update_interval: Duration::from_millis(100),
            access_sweep_interval: Duration::from_secs(1),
            automation_tick: Duration::from_secs(1),
            request_timeout: Duration::from_secs(5),
            enable_client_spawn_requests: true,
        }
    }
}

impl MasterConfig {
    /// Read overrides from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        fn millis(var: &str, fallback: Duration) -> Duration {
            std::env::var(var)
                .ok()
                .and_then(|value| value.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(fallback)
        }

        Self {
            queue_update_interval: millis(
                "FLEETMASTER_QUEUE_UPDATE_MS",
                defaults.queue_update_interval,
            ),
            access_sweep_interval: millis(
                "FLEETMASTER_ACCESS_SWEEP_MS",
                defaults.access_sweep_interval,
            ),
            automation_tick: millis("FLEETMASTER_AUTOMATION_TICK_MS", defaults.automation_tick),
            request_timeout: millis("FLEETMASTER_REQUEST_TIMEOUT_MS", defaults.request_timeout),
            enable_client_spawn_requests: std::env::var("FLEETMASTER_CLIENT_SPAWNS")
                .map(|value| value != "false" && value != "0")
                .unwrap_or(defaults.enable_client_spawn_requests),
        }
    }
}

/// The master node: spawn brokering, room access and lobbies behind one
/// message-dispatch surface.
pub struct MasterServer {
    spawners: Arc<SpawnOrchestrator>,
    rooms: Arc<RoomRegistry>,
    lobbies: Arc<LobbyRegistry>,
}

impl MasterServer {
    pub fn new(config: MasterConfig) -> Self {
        let spawners = Arc::new(SpawnOrchestrator::new(SpawnerConfig {
            queue_update_interval: config.queue_update_interval,
            enable_client_spawn_requests: config.enable_client_spawn_requests,
            request_timeout: config.request_timeout,
            ..Default::default()
        }));

        let rooms = Arc::new(RoomRegistry::new(RoomsConfig {
            access_sweep_interval: config.access_sweep_interval,
            request_timeout: config.request_timeout,
            ..Default::default()
        }));

        let lobbies = Arc::new(LobbyRegistry::new(
            LobbiesConfig {
                automation_tick: config.automation_tick,
                ..Default::default()
            },
            Arc::clone(&spawners),
            Arc::clone(&rooms),
        ));

        Self {
            spawners,
            rooms,
            lobbies,
        }
    }

    pub fn spawners(&self) -> &Arc<SpawnOrchestrator> {
        &self.spawners
    }

    pub fn rooms(&self) -> &Arc<RoomRegistry> {
        &self.rooms
    }

    pub fn lobbies(&self) -> &Arc<LobbyRegistry> {
        &self.lobbies
    }

    /// Launch the dispatch pump and the access sweep.
    pub fn start_background_tasks(&self) -> Vec<JoinHandle<()>> {
        info!("Starting master background tasks");
        vec![
            Arc::clone(&self.spawners).run_queue_pump(),
            Arc::clone(&self.rooms).run_access_sweep(),
        ]
    }

    /// Route one inbound message to its handler.
    pub async fn handle_message(&self, message: IncomingMessage) {
        debug!(opcode = ?message.opcode, peer_id = message.peer.id(), "Handling message");

        match message.opcode {
            // Spawner flow
            OpCode::RegisterSpawner => self.spawners.handle_register_spawner(message).await,
            OpCode::ClientsSpawnRequest => {
                self.spawners.handle_clients_spawn_request(message).await
            }
            OpCode::RegisterSpawnedProcess => {
                self.spawners.handle_register_spawned_process(message).await
            }
            OpCode::CompleteSpawnProcess => {
                self.spawners.handle_complete_spawn_process(message).await
            }
            OpCode::ProcessStarted => self.spawners.handle_process_started(message).await,
            OpCode::ProcessKilled => self.spawners.handle_process_killed(message).await,
            OpCode::AbortSpawnRequest => self.spawners.handle_abort_spawn_request(message).await,
            OpCode::GetSpawnFinalizationData => {
                self.spawners.handle_get_finalization_data(message).await
            }
            OpCode::UpdateSpawnerProcessCount => {
                self.spawners.handle_update_process_count(message).await
            }

            // Room flow
            OpCode::RegisterRoom => self.rooms.handle_register_room(message).await,
            OpCode::DestroyRoom => self.rooms.handle_destroy_room(message).await,
            OpCode::SaveRoomOptions => self.rooms.handle_save_room_options(message).await,
            OpCode::GetRoomAccess => self.rooms.handle_get_room_access(message).await,
            OpCode::ValidateRoomAccess => self.rooms.handle_validate_room_access(message).await,
            OpCode::PlayerLeftRoom => self.rooms.handle_player_left_room(message).await,

            // Lobby flow
            OpCode::CreateLobby => self.lobbies.handle_create_lobby(message).await,
            OpCode::JoinLobby => self.lobbies.handle_join_lobby(message).await,
            OpCode::LeaveLobby => self.lobbies.handle_leave_lobby(message).await,
            OpCode::SetLobbyProperties => {
                self.lobbies.handle_set_lobby_properties(message).await
            }
            OpCode::SetMyLobbyProperties => self.lobbies.handle_set_my_properties(message).await,
            OpCode::JoinLobbyTeam => self.lobbies.handle_join_team(message).await,
            OpCode::LobbySendChatMessage => {
                self.lobbies.handle_send_chat_message(message).await
            }
            OpCode::LobbySetReady => self.lobbies.handle_set_ready(message).await,
            OpCode::LobbyStartGame => self.lobbies.handle_start_game(message).await,
            OpCode::GetLobbyRoomAccess => {
                self.lobbies.handle_get_lobby_room_access(message).await
            }
            OpCode::GetLobbyInfo => self.lobbies.handle_get_lobby_info(message).await,
            OpCode::GetLobbyMemberData => {
                self.lobbies.handle_get_lobby_member_data(message).await
            }

            // Everything else is master -> peer only.
            _ => message.respond_error(ResponseStatus::NotHandled, "Unknown request"),
        }
    }

    /// Cascade a peer disconnect through every registry, dependents first.
    pub async fn on_peer_disconnected(&self, peer: &Arc<Peer>) {
        peer.mark_disconnected();
        info!(peer_id = peer.id(), "Peer disconnected");

        self.lobbies.on_peer_disconnected(peer.id()).await;
        self.rooms.on_peer_disconnected(peer.id()).await;
        self.spawners.on_peer_disconnected(peer.id()).await;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::network::peer::{OutgoingRequest, Response};
    use crate::network::protocol::{
        option_keys, ClientsSpawnRequest, LobbyState, RegisterSpawnedProcess, RoomAccess,
        RoomOptions, SpawnFinalization, SpawnRequest, SpawnStatus, SpawnerOptions,
        UsernameAndPeerId, ValidateRoomAccess,
    };
    use tokio::sync::mpsc::UnboundedReceiver;

    fn master() -> MasterServer {
        MasterServer::new(MasterConfig {
            request_timeout: Duration::from_millis(300),
            ..Default::default()
        })
    }

    async fn send(
        master: &MasterServer,
        peer: &Arc<Peer>,
        opcode: OpCode,
        payload: &impl serde::Serialize,
    ) -> Response {
        let (message, response_rx) = IncomingMessage::request(Arc::clone(peer), opcode, payload);
        master.handle_message(message).await;
        response_rx.await.expect("handler must respond")
    }

    async fn notify(
        master: &MasterServer,
        peer: &Arc<Peer>,
        opcode: OpCode,
        payload: &impl serde::Serialize,
    ) {
        let message = IncomingMessage::notification(Arc::clone(peer), opcode, payload);
        master.handle_message(message).await;
    }

    fn named_peer(id: u64, username: &str) -> (Arc<Peer>, UnboundedReceiver<OutgoingRequest>) {
        let (peer, rx) = Peer::channel(id);
        peer.set_username(username);
        (peer, rx)
    }

    #[tokio::test]
    async fn scenario_spawn_flow_end_to_end() {
        let master = master();

        // A node registers one EU spawner with a single slot.
        let (node, mut node_rx) = Peer::channel(1);
        let response = send(
            &master,
            &node,
            OpCode::RegisterSpawner,
            &SpawnerOptions {
                max_processes: 1,
                region: "EU".to_string(),
                properties: HashMap::new(),
            },
        )
        .await;
        assert_eq!(response.status, ResponseStatus::Success);

        // A client asks for a spawn in that region.
        let (client, _client_rx) = named_peer(10, "alice");
        let response = send(
            &master,
            &client,
            OpCode::ClientsSpawnRequest,
            &ClientsSpawnRequest {
                region: "EU".to_string(),
                options: HashMap::new(),
            },
        )
        .await;
        assert_eq!(response.status, ResponseStatus::Success);
        let spawn_id: u32 = response.parse().unwrap();

        // The pump hands the node exactly one dispatch.
        master.spawners().update_queues().await;
        let outgoing = node_rx.recv().await.unwrap();
        assert_eq!(outgoing.opcode, OpCode::SpawnRequest);
        let request: SpawnRequest = serde_json::from_value(outgoing.payload).unwrap();
        assert_eq!(request.spawn_id, spawn_id);
        outgoing.responder.unwrap().send(Response::ok(&true)).unwrap();

        master.spawners().update_queues().await;
        assert!(node_rx.try_recv().is_err());

        // Node reports the process up; the process claims its task.
        notify(&master, &node, OpCode::ProcessStarted, &spawn_id).await;
        let task = master.spawners().get_task(spawn_id).await.unwrap();
        assert_eq!(task.status(), SpawnStatus::WaitingForProcess);

        let (process, _process_rx) = Peer::channel(2);
        let response = send(
            &master,
            &process,
            OpCode::RegisterSpawnedProcess,
            &RegisterSpawnedProcess {
                spawn_id,
                spawn_code: request.spawn_code.clone(),
            },
        )
        .await;
        assert_eq!(response.status, ResponseStatus::Success);
        assert_eq!(task.status(), SpawnStatus::ProcessRegistered);

        // Finalization carries the room id.
        let response = send(
            &master,
            &process,
            OpCode::CompleteSpawnProcess,
            &SpawnFinalization {
                spawn_id,
                data: HashMap::from([(option_keys::ROOM_ID.to_string(), "7".to_string())]),
            },
        )
        .await;
        assert_eq!(response.status, ResponseStatus::Success);
        assert_eq!(task.status(), SpawnStatus::Finalized);

        // The requester can read the payload back.
        let response = send(&master, &client, OpCode::GetSpawnFinalizationData, &spawn_id).await;
        assert_eq!(response.status, ResponseStatus::Success);
        let data: HashMap<String, String> = response.parse().unwrap();
        assert_eq!(data.get(option_keys::ROOM_ID).unwrap(), "7");
    }

    #[tokio::test]
    async fn scenario_lobby_start_requires_a_spawner() {
        let master = master();

        // Alice creates a 1v1 lobby and both players join and ready up.
        let (alice, _alice_rx) = named_peer(10, "alice");
        let (bob, _bob_rx) = named_peer(11, "bob");

        let properties = HashMap::from([(
            option_keys::LOBBY_FACTORY_ID.to_string(),
            "1v1".to_string(),
        )]);
        let response = send(&master, &alice, OpCode::CreateLobby, &properties).await;
        assert_eq!(response.status, ResponseStatus::Success);
        let lobby_id: u32 = response.parse().unwrap();

        for peer in [&alice, &bob] {
            let response = send(&master, peer, OpCode::JoinLobby, &lobby_id).await;
            assert_eq!(response.status, ResponseStatus::Success);
        }
        for peer in [&alice, &bob] {
            let response = send(&master, peer, OpCode::LobbySetReady, &true).await;
            assert_eq!(response.status, ResponseStatus::Success);
        }

        // With zero spawners the start fails and the lobby stays put.
        let response = send(&master, &alice, OpCode::LobbyStartGame, &true).await;
        assert_eq!(response.status, ResponseStatus::Failed);
        assert_eq!(response.as_str(""), "Servers are busy");

        let lobby = master.lobbies().get_lobby(lobby_id).await.unwrap();
        assert_eq!(lobby.read().await.state(), LobbyState::Preparations);

        // A spawner arrives; the same start succeeds.
        let (node, node_rx) = Peer::channel(1);
        let response = send(
            &master,
            &node,
            OpCode::RegisterSpawner,
            &SpawnerOptions::default(),
        )
        .await;
        assert_eq!(response.status, ResponseStatus::Success);
        drop(node_rx);

        let response = send(&master, &alice, OpCode::LobbyStartGame, &true).await;
        assert_eq!(response.status, ResponseStatus::Success);
        assert_eq!(lobby.read().await.state(), LobbyState::StartingGameServer);
    }

    #[tokio::test]
    async fn scenario_lobby_hands_members_off_to_the_room() {
        let master = master();

        // Lobby with two ready members and a spawner.
        let (alice, _alice_rx) = named_peer(10, "alice");
        let (bob, _bob_rx) = named_peer(11, "bob");
        let (node, mut node_rx) = Peer::channel(1);

        send(
            &master,
            &node,
            OpCode::RegisterSpawner,
            &SpawnerOptions::default(),
        )
        .await;

        let properties = HashMap::from([(
            option_keys::LOBBY_FACTORY_ID.to_string(),
            "1v1".to_string(),
        )]);
        let lobby_id: u32 = send(&master, &alice, OpCode::CreateLobby, &properties)
            .await
            .parse()
            .unwrap();
        for peer in [&alice, &bob] {
            send(&master, peer, OpCode::JoinLobby, &lobby_id).await;
            send(&master, peer, OpCode::LobbySetReady, &true).await;
        }

        let response = send(&master, &alice, OpCode::LobbyStartGame, &true).await;
        assert_eq!(response.status, ResponseStatus::Success);

        // The node accepts the dispatch and plays the game-server side:
        // register the room first, then finalize the task with its id.
        master.spawners().update_queues().await;
        let outgoing = node_rx.recv().await.unwrap();
        let request: SpawnRequest = serde_json::from_value(outgoing.payload).unwrap();
        outgoing.responder.unwrap().send(Response::ok(&true)).unwrap();

        let (game_server, mut game_server_rx) = Peer::channel(2);
        let room_id: u32 = send(
            &master,
            &game_server,
            OpCode::RegisterRoom,
            &RoomOptions {
                room_ip: "10.1.1.5".to_string(),
                room_port: 7777,
                max_players: 2,
                ..Default::default()
            },
        )
        .await
        .parse()
        .unwrap();

        send(
            &master,
            &game_server,
            OpCode::RegisterSpawnedProcess,
            &RegisterSpawnedProcess {
                spawn_id: request.spawn_id,
                spawn_code: request.spawn_code.clone(),
            },
        )
        .await;
        send(
            &master,
            &game_server,
            OpCode::CompleteSpawnProcess,
            &SpawnFinalization {
                spawn_id: request.spawn_id,
                data: HashMap::from([(option_keys::ROOM_ID.to_string(), room_id.to_string())]),
            },
        )
        .await;

        // The status observer flips the lobby and resolves the room.
        let lobby = master.lobbies().get_lobby(lobby_id).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if lobby.read().await.state() == LobbyState::GameInProgress
                    && lobby.read().await.room().is_some()
                {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("lobby should reach GameInProgress with a room");

        // The game server grants alice's lobby-scoped access request.
        tokio::spawn(async move {
            while let Some(outgoing) = game_server_rx.recv().await {
                if outgoing.opcode == OpCode::ProvideRoomAccessCheck {
                    let access = RoomAccess {
                        token: "tok-1".to_string(),
                        room_id,
                        room_ip: "10.1.1.5".to_string(),
                        room_port: 7777,
                        properties: HashMap::new(),
                    };
                    if let Some(responder) = outgoing.responder {
                        let _ = responder.send(Response::ok(&access));
                    }
                }
            }
        });

        let response = send(
            &master,
            &alice,
            OpCode::GetLobbyRoomAccess,
            &HashMap::<String, String>::new(),
        )
        .await;
        assert_eq!(response.status, ResponseStatus::Success);
        let access: RoomAccess = response.parse().unwrap();
        assert_eq!(access.room_ip, "10.1.1.5");

        // The game server confirms the token when alice connects.
        let response = send(
            &master,
            &game_server,
            OpCode::ValidateRoomAccess,
            &ValidateRoomAccess {
                room_id,
                token: access.token.clone(),
            },
        )
        .await;
        assert_eq!(response.status, ResponseStatus::Success);
        let identity: UsernameAndPeerId = response.parse().unwrap();
        assert_eq!(identity.username, "alice");
        assert_eq!(identity.peer_id, alice.id());
    }

    #[tokio::test]
    async fn unroutable_opcode_is_not_handled() {
        let master = master();
        let (peer, _rx) = Peer::channel(1);
        let response = send(&master, &peer, OpCode::LobbyChatMessage, &"hi").await;
        assert_eq!(response.status, ResponseStatus::NotHandled);
    }

    #[tokio::test]
    async fn disconnect_cascades_across_registries() {
        let master = master();

        // One peer owns a spawner and a room, and sits in a lobby.
        let (peer, _rx) = named_peer(5, "carol");
        send(
            &master,
            &peer,
            OpCode::RegisterSpawner,
            &SpawnerOptions::default(),
        )
        .await;
        send(&master, &peer, OpCode::RegisterRoom, &RoomOptions::default()).await;

        let properties = HashMap::from([(
            option_keys::LOBBY_FACTORY_ID.to_string(),
            "deathmatch".to_string(),
        )]);
        let lobby_id: u32 = send(&master, &peer, OpCode::CreateLobby, &properties)
            .await
            .parse()
            .unwrap();
        send(&master, &peer, OpCode::JoinLobby, &lobby_id).await;

        master.on_peer_disconnected(&peer).await;

        assert_eq!(master.spawners().spawner_count().await, 0);
        assert_eq!(master.rooms().room_count().await, 0);
        // The lobby emptied out and destroyed itself.
        assert_eq!(master.lobbies().lobby_count().await, 0);
    }
}
