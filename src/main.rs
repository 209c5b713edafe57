//! Fleetmaster Server
//!
//! Master node for multiplayer game sessions: brokers game-server processes
//! across spawner nodes, hands clients off to rooms through short-lived
//! access tokens, and hosts matchmaking lobbies.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::Serialize;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use uuid::Uuid;

use fleetmaster::network::protocol::{
    option_keys, OpCode, ProvideAccessCheck, RegisterSpawnedProcess, ResponseStatus, RoomAccess,
    RoomOptions, SpawnFinalization, SpawnRequest, SpawnerOptions, UsernameAndPeerId,
    ValidateRoomAccess,
};
use fleetmaster::network::{IncomingMessage, OutgoingRequest, Peer, Response};
use fleetmaster::{MasterConfig, MasterServer, VERSION};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set tracing subscriber");

    info!("Fleetmaster v{}", VERSION);

    let config = MasterConfig::from_env();
    info!(?config, "Configuration loaded");

    let master = MasterServer::new(config);
    let _background = master.start_background_tasks();

    // Demo: walk the full spawn -> room -> lobby -> access flow with
    // simulated peers standing in for the transport.
    demo_session(&master).await
}

/// One end-to-end session: a spawner node comes online, two players run a
/// 1v1 lobby, the spawned game server registers its room and both players
/// are handed off to it.
async fn demo_session(master: &MasterServer) -> anyhow::Result<()> {
    info!("=== Registering a spawner node ===");

    let (node, mut node_rx) = Peer::channel(1);
    let spawner_id: u32 = request(
        master,
        &node,
        OpCode::RegisterSpawner,
        &SpawnerOptions {
            max_processes: 4,
            region: "EU".to_string(),
            properties: HashMap::new(),
        },
    )
    .await?
    .parse()?;
    info!(spawner_id, "Spawner online in region EU");

    info!("=== Creating a 1v1 lobby ===");

    let (alice, _alice_rx) = client_peer(10, "alice");
    let (bob, _bob_rx) = client_peer(11, "bob");

    let properties = HashMap::from([
        (
            option_keys::LOBBY_FACTORY_ID.to_string(),
            "1v1".to_string(),
        ),
        (option_keys::LOBBY_NAME.to_string(), "Demo Arena".to_string()),
        (option_keys::REGION.to_string(), "EU".to_string()),
    ]);
    let lobby_id: u32 = request(master, &alice, OpCode::CreateLobby, &properties)
        .await?
        .parse()?;

    for peer in [&alice, &bob] {
        request(master, peer, OpCode::JoinLobby, &lobby_id).await?;
        request(master, peer, OpCode::LobbySetReady, &true).await?;
    }
    info!(lobby_id, "Both players joined and readied up");

    info!("=== Starting the game ===");

    request(master, &alice, OpCode::LobbyStartGame, &true).await?;

    // The dispatch pump hands the node the queued spawn request.
    let spawn_request = loop {
        let outgoing = node_rx.recv().await.context("node queue closed")?;
        let is_spawn = outgoing.opcode == OpCode::SpawnRequest;
        let payload = outgoing.payload.clone();
        if let Some(responder) = outgoing.responder {
            let _ = responder.send(Response::ok(&true));
        }
        if is_spawn {
            break serde_json::from_value::<SpawnRequest>(payload)?;
        }
    };
    info!(spawn_id = spawn_request.spawn_id, "Node accepted the spawn request");
    notify(master, &node, OpCode::ProcessStarted, &spawn_request.spawn_id).await;

    info!("=== Simulating the spawned game server ===");

    let (game_server, game_server_rx) = Peer::channel(2);
    let room_id: u32 = request(
        master,
        &game_server,
        OpCode::RegisterRoom,
        &RoomOptions {
            name: "Demo Arena".to_string(),
            room_ip: "127.0.0.1".to_string(),
            room_port: 7777,
            max_players: 2,
            ..Default::default()
        },
    )
    .await?
    .parse()?;
    run_game_server_side(game_server_rx);
    info!(room_id, "Room registered");

    request(
        master,
        &game_server,
        OpCode::RegisterSpawnedProcess,
        &RegisterSpawnedProcess {
            spawn_id: spawn_request.spawn_id,
            spawn_code: spawn_request.spawn_code.clone(),
        },
    )
    .await?;
    request(
        master,
        &game_server,
        OpCode::CompleteSpawnProcess,
        &SpawnFinalization {
            spawn_id: spawn_request.spawn_id,
            data: HashMap::from([(option_keys::ROOM_ID.to_string(), room_id.to_string())]),
        },
    )
    .await?;
    info!("Game server registered and finalized its spawn task");

    // The lobby's status observer flips it into GameInProgress and resolves
    // the room from the finalization payload.
    let lobby = master
        .lobbies()
        .get_lobby(lobby_id)
        .await
        .context("lobby vanished")?;
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if lobby.read().await.room().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .context("lobby never resolved its room")?;
    info!(state = ?lobby.read().await.state(), "Lobby resolved its game room");

    info!("=== Handing players off to the room ===");

    for peer in [&alice, &bob] {
        let access: RoomAccess = request(
            master,
            peer,
            OpCode::GetLobbyRoomAccess,
            &HashMap::<String, String>::new(),
        )
        .await?
        .parse()?;
        info!(
            peer_id = peer.id(),
            endpoint = format!("{}:{}", access.room_ip, access.room_port),
            "Access token issued"
        );

        // The client connects to the endpoint; the game server confirms
        // the token against the master.
        let identity: UsernameAndPeerId = request(
            master,
            &game_server,
            OpCode::ValidateRoomAccess,
            &ValidateRoomAccess {
                room_id,
                token: access.token.clone(),
            },
        )
        .await?
        .parse()?;
        info!(username = %identity.username, "Token confirmed, player is in the room");
    }

    info!("=== Demo session complete ===");
    Ok(())
}

fn client_peer(id: u64, username: &str) -> (Arc<Peer>, UnboundedReceiver<OutgoingRequest>) {
    let (peer, rx) = Peer::channel(id);
    peer.set_username(username);
    (peer, rx)
}

/// Round trip through the master's dispatch, failing on a non-success reply.
async fn request<T: Serialize>(
    master: &MasterServer,
    peer: &Arc<Peer>,
    opcode: OpCode,
    payload: &T,
) -> anyhow::Result<Response> {
    let (message, response_rx) = IncomingMessage::request(Arc::clone(peer), opcode, payload);
    master.handle_message(message).await;
    let response = response_rx.await.context("handler dropped the request")?;
    if response.status != ResponseStatus::Success {
        anyhow::bail!(
            "{opcode:?} failed: {}",
            response.as_str("unknown reason")
        );
    }
    Ok(response)
}

async fn notify<T: Serialize>(master: &MasterServer, peer: &Arc<Peer>, opcode: OpCode, payload: &T) {
    let message = IncomingMessage::notification(Arc::clone(peer), opcode, payload);
    master.handle_message(message).await;
}

/// Play the game-server side of the access broker: grant every access check
/// with a freshly minted token, acknowledge everything else.
fn run_game_server_side(mut rx: UnboundedReceiver<OutgoingRequest>) {
    tokio::spawn(async move {
        while let Some(outgoing) = rx.recv().await {
            match outgoing.opcode {
                OpCode::ProvideRoomAccessCheck => {
                    let check: ProvideAccessCheck = match serde_json::from_value(outgoing.payload)
                    {
                        Ok(check) => check,
                        Err(_) => continue,
                    };
                    let access = RoomAccess {
                        token: Uuid::new_v4().to_string(),
                        room_id: check.room_id,
                        room_ip: "127.0.0.1".to_string(),
                        room_port: 7777,
                        properties: HashMap::new(),
                    };
                    info!(username = %check.username, "Game server granted an access check");
                    if let Some(responder) = outgoing.responder {
                        let _ = responder.send(Response::ok(&access));
                    }
                }
                _ => {
                    if let Some(responder) = outgoing.responder {
                        let _ = responder.send(Response::ok(&true));
                    }
                }
            }
        }
    });
}
