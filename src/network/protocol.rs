//! Protocol Messages
//!
//! Opcodes, status codes and payload types exchanged between the master,
//! clients, spawner nodes and spawned game-server processes.
//! Payloads are serialized as JSON; the transport framing itself is owned
//! by the peer messaging layer.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// =============================================================================
// OPCODES
// =============================================================================

/// Message opcodes understood by the master server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpCode {
    // Spawner flow
    /// Node registers itself as a spawner.
    RegisterSpawner,
    /// Client asks the master to spawn a game server.
    ClientsSpawnRequest,
    /// Master dispatches a queued spawn task to a spawner node.
    SpawnRequest,
    /// Spawned process claims its task with a confirmation code.
    RegisterSpawnedProcess,
    /// Spawned process reports its startup completion data.
    CompleteSpawnProcess,
    /// Node reports that a process has started.
    ProcessStarted,
    /// Node reports that a process has died.
    ProcessKilled,
    /// Client cancels an unfinished spawn request.
    AbortSpawnRequest,
    /// Client fetches the finalization payload of its spawn task.
    GetSpawnFinalizationData,
    /// Master pushes a spawn status change to the requester.
    SpawnStatusUpdate,
    /// Master asks a spawner node to kill a spawned process.
    KillProcess,
    /// Node corrects the master's view of its live process count.
    UpdateSpawnerProcessCount,

    // Room flow
    /// Game server registers a running room.
    RegisterRoom,
    /// Game server unregisters its room.
    DestroyRoom,
    /// Game server updates its room options.
    SaveRoomOptions,
    /// Client requests access to a room.
    GetRoomAccess,
    /// Master asks the room's owner to approve an access request.
    ProvideRoomAccessCheck,
    /// Game server confirms a token presented by a connecting client.
    ValidateRoomAccess,
    /// Game server reports that a player left the room.
    PlayerLeftRoom,

    // Lobby flow
    CreateLobby,
    JoinLobby,
    LeaveLobby,
    SetLobbyProperties,
    SetMyLobbyProperties,
    JoinLobbyTeam,
    LobbySendChatMessage,
    LobbySetReady,
    LobbyStartGame,
    /// Lobby-scoped alias of the room access round trip.
    GetLobbyRoomAccess,
    GetLobbyInfo,
    GetLobbyMemberData,

    // Lobby broadcasts (master -> members, no response expected)
    LobbyMemberJoined,
    LobbyMemberLeft,
    LobbyStateChange,
    LobbyStatusTextChange,
    LobbyPropertyChanged,
    LobbyMemberPropertyChanged,
    LobbyMemberChangedTeam,
    LobbyMemberReadyStatusChange,
    LobbyMasterChange,
    LobbyChatMessage,
    /// Sent to a peer that has been removed from a lobby.
    LeftLobby,
}

/// Status code attached to every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    /// Request succeeded.
    Success,
    /// Request was understood but refused.
    Failed,
    /// Requester lacks the rights for this operation.
    Unauthorized,
    /// Internal error while handling the request.
    Error,
    /// Nobody handled the request.
    NotHandled,
    /// The remote side did not answer in time.
    Timeout,
}

// =============================================================================
// SPAWN STATUS
// =============================================================================

/// Lifecycle status of a spawn task.
///
/// Declaration order matters: `Ord` is derived from it, and everything below
/// `None` counts as aborted. The happy path only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpawnStatus {
    /// Abort completed (kill request settled).
    Aborted,
    /// Abort requested, kill request in flight.
    Aborting,
    /// The spawner reported the process as dead.
    Killed,
    /// Task created, not yet queued.
    None,
    /// Task sits in a spawner's queue.
    InQueue,
    /// Dispatch sent to the spawner node.
    StartingProcess,
    /// The node started the process; waiting for it to call back.
    WaitingForProcess,
    /// The process claimed the task with its confirmation code.
    ProcessRegistered,
    /// The process reported its completion data.
    Finalized,
}

impl SpawnStatus {
    /// True for any status on the abort/failure branch.
    pub fn is_aborted(self) -> bool {
        self < SpawnStatus::None
    }

    /// True once the task can no longer make progress.
    pub fn is_terminal(self) -> bool {
        self >= SpawnStatus::Finalized || self.is_aborted()
    }

    /// True while the process is being brought up.
    pub fn is_starting(self) -> bool {
        self > SpawnStatus::None && self < SpawnStatus::Finalized
    }
}

/// Lobby lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LobbyState {
    /// Game-server startup failed and play-again is disabled.
    FailedToStart,
    /// Members gather, pick teams and ready up.
    Preparations,
    /// A spawn task is bringing the game server up.
    StartingGameServer,
    /// The game server is live and brokering access.
    GameInProgress,
    /// The game ended and the lobby does not loop back.
    GameOver,
}

// =============================================================================
// WELL-KNOWN PROPERTY KEYS
// =============================================================================

/// Property keys with cross-component meaning.
pub mod option_keys {
    /// Room id reported in a spawn finalization payload.
    pub const ROOM_ID: &str = "roomId";
    /// Region a spawn request or spawner belongs to.
    pub const REGION: &str = "region";
    /// Public visibility flag.
    pub const IS_PUBLIC: &str = "isPublic";
    /// Factory id used when creating a lobby.
    pub const LOBBY_FACTORY_ID: &str = "lobbyFactoryId";
    /// Requested lobby display name.
    pub const LOBBY_NAME: &str = "lobbyName";
    /// Custom-args key carrying the lobby id to a spawned process.
    pub const LOBBY_ID: &str = "lobbyId";
}

// =============================================================================
// SPAWNER PACKETS
// =============================================================================

/// Static options a spawner node registers with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnerOptions {
    /// Max concurrent processes. 0 means unlimited.
    pub max_processes: usize,
    /// Region this spawner serves.
    pub region: String,
    /// Arbitrary node properties.
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

impl Default for SpawnerOptions {
    fn default() -> Self {
        Self {
            max_processes: 0,
            region: "International".to_string(),
            properties: HashMap::new(),
        }
    }
}

/// Client request for a new game-server process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientsSpawnRequest {
    /// Preferred region; empty means any.
    #[serde(default)]
    pub region: String,
    /// Request metadata forwarded to the spawned process.
    #[serde(default)]
    pub options: HashMap<String, String>,
}

/// Dispatch of a queued task to its spawner node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnRequest {
    pub spawner_id: u32,
    pub spawn_id: u32,
    /// Code the spawned process must present to claim the task.
    pub spawn_code: String,
    pub properties: HashMap<String, String>,
    pub custom_args: String,
}

/// A spawned process claiming its task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterSpawnedProcess {
    pub spawn_id: u32,
    pub spawn_code: String,
}

/// Completion data reported by a spawned process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnFinalization {
    pub spawn_id: u32,
    /// Key/value startup results; `roomId` points at the registered room.
    pub data: HashMap<String, String>,
}

/// Status push to the peer that requested a spawn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnStatusUpdate {
    pub spawn_id: u32,
    pub status: SpawnStatus,
}

/// Kill order for a spawned (or starting) process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillProcess {
    pub spawner_id: u32,
    pub spawn_id: u32,
}

/// Node-side correction of the live process count.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnerProcessCount {
    pub spawner_id: u32,
    pub count: usize,
}

// =============================================================================
// ROOM PACKETS
// =============================================================================

/// Options a game server registers its room with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomOptions {
    pub name: String,
    /// Network endpoint clients connect to directly.
    pub room_ip: String,
    pub room_port: u16,
    pub is_public: bool,
    /// Empty string means no password.
    #[serde(default)]
    pub password: String,
    /// Player cap. 0 means unlimited.
    #[serde(default)]
    pub max_players: usize,
    /// Seconds an unconfirmed access grant stays valid.
    pub access_timeout_secs: u64,
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

impl Default for RoomOptions {
    fn default() -> Self {
        Self {
            name: "Unnamed Room".to_string(),
            room_ip: "127.0.0.1".to_string(),
            room_port: 0,
            is_public: true,
            password: String::new(),
            max_players: 0,
            access_timeout_secs: 10,
            properties: HashMap::new(),
        }
    }
}

/// Access grant issued by a room's owning process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomAccess {
    pub token: String,
    pub room_id: u32,
    pub room_ip: String,
    pub room_port: u16,
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

/// Client request for access to a room.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomAccessRequest {
    pub room_id: u32,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

/// Master -> room owner: approve (and mint a token for) this requester.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvideAccessCheck {
    pub peer_id: u64,
    pub room_id: u32,
    /// Requester's username when authenticated.
    #[serde(default)]
    pub username: String,
    /// Extra request metadata supplied by the client.
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

/// Room owner confirming a token presented by a connecting client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidateRoomAccess {
    pub room_id: u32,
    pub token: String,
}

/// Room owner reporting a player departure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerLeftRoom {
    pub room_id: u32,
    pub peer_id: u64,
}

/// Room owner replacing its registered options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveRoomOptions {
    pub room_id: u32,
    pub options: RoomOptions,
}

/// Identity of a confirmed player, returned to the room owner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsernameAndPeerId {
    #[serde(default)]
    pub username: String,
    pub peer_id: u64,
}

// =============================================================================
// LOBBY PACKETS
// =============================================================================

/// Full lobby snapshot sent to joiners and info requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LobbyData {
    pub lobby_id: u32,
    pub lobby_type: String,
    pub name: String,
    /// Username of the game master, empty if none.
    pub game_master: String,
    pub state: LobbyState,
    pub status_text: String,
    pub max_players: usize,
    pub properties: HashMap<String, String>,
    pub members: HashMap<String, LobbyMemberData>,
    pub teams: HashMap<String, LobbyTeamData>,
    pub controls: Vec<LobbyControl>,
    pub enable_team_switching: bool,
    pub enable_ready_system: bool,
    pub enable_manual_start: bool,
    /// Username of the receiving member, empty for anonymous snapshots.
    pub current_user: String,
}

/// Per-member lobby data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LobbyMemberData {
    pub username: String,
    pub is_ready: bool,
    /// Team name, empty if unassigned.
    pub team: String,
    pub properties: HashMap<String, String>,
}

/// Per-team lobby data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LobbyTeamData {
    pub name: String,
    pub min_players: usize,
    pub max_players: usize,
    pub properties: HashMap<String, String>,
}

/// A labelled, option-enumerated lobby setting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LobbyControl {
    pub key: String,
    pub label: String,
    pub options: Vec<String>,
}

/// Request to move the sender to another team.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinTeamRequest {
    pub team_name: String,
}

/// Batch update of lobby properties.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetLobbyProperties {
    pub lobby_id: u32,
    pub properties: HashMap<String, String>,
}

/// Chat line relayed to lobby members.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LobbyChatMessage {
    pub sender: String,
    pub message: String,
    #[serde(default)]
    pub is_error: bool,
}

/// Broadcast of a member's ready flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadyStatusUpdate {
    pub username: String,
    pub is_ready: bool,
}

/// Broadcast of a member switching teams.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberTeamChange {
    pub username: String,
    pub team_name: String,
}

/// Broadcast of a member property change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberPropertyChange {
    pub lobby_id: u32,
    pub username: String,
    pub key: String,
    pub value: String,
}

/// Broadcast of a lobby property change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LobbyPropertyChange {
    pub key: String,
    pub value: String,
}

/// Lookup of one member's data by lobby and peer id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LobbyMemberLookup {
    pub lobby_id: u32,
    pub peer_id: u64,
}
