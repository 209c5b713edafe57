//! # Fleetmaster
//!
//! Master server brokering game-server processes, rooms and lobbies for
//! multiplayer games.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       FLEETMASTER                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  network/          - Messaging boundary                      │
//! │  ├── peer.rs       - Peer facade (request/response, notify)  │
//! │  ├── protocol.rs   - Opcodes, statuses, packet types         │
//! │  └── server.rs     - Opcode dispatch and background loops    │
//! │                                                              │
//! │  spawners/         - Spawn orchestration                     │
//! │  ├── task.rs       - Spawn task lifecycle state machine      │
//! │  ├── spawner.rs    - Worker-node capacity and FIFO queue     │
//! │  └── orchestrator.rs - Fleet registry and dispatch pump      │
//! │                                                              │
//! │  rooms/            - Room access brokering                   │
//! │  ├── room.rs       - Token issuance and confirmation         │
//! │  └── registry.rs   - Room table and expiry sweep             │
//! │                                                              │
//! │  lobbies/          - Matchmaking lobbies                     │
//! │  ├── lobby.rs      - Lobby state machine                     │
//! │  ├── team.rs / member.rs - Teams and admitted players        │
//! │  ├── auto.rs       - Auto-start countdown policy             │
//! │  ├── factory.rs    - Named lobby builders                    │
//! │  └── registry.rs   - Lobby table and control surface         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Control Flow
//!
//! A client starts a lobby; the lobby asks the spawn orchestrator for a
//! game-server process; the orchestrator queues the request on the least
//! loaded spawner node; the spawned process registers back with its
//! confirmation code, finalizes with a room id, and the lobby hands its
//! members off to that room through short-lived access tokens.
//!
//! The wire transport is out of scope: everything above the [`network::Peer`]
//! facade only ever sees opaque request/response exchanges with timeouts.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod lobbies;
pub mod network;
pub mod rooms;
pub mod spawners;

// Re-export commonly used types
pub use lobbies::{Lobby, LobbyRegistry};
pub use network::{MasterConfig, MasterServer, Peer};
pub use rooms::{RegisteredRoom, RoomRegistry};
pub use spawners::{SpawnOrchestrator, SpawnTask};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
