//! Lobby State Machine
//!
//! A matchmaking group with teams, properties, controls and a game master.
//! Drives the pre-game flow: members gather and ready up, a spawn task brings
//! a game server up, the finalization payload resolves the room members then
//! get access to.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;

use crate::lobbies::auto::AutoStartPolicy;
use crate::lobbies::member::LobbyMember;
use crate::lobbies::team::LobbyTeam;
use crate::network::peer::{Peer, PeerId};
use crate::network::protocol::{
    option_keys, LobbyChatMessage, LobbyControl, LobbyData, LobbyState, MemberPropertyChange,
    MemberTeamChange, OpCode, ReadyStatusUpdate, LobbyPropertyChange,
};
use crate::rooms::room::RegisteredRoom;
use crate::spawners::task::SpawnTask;

/// Unique lobby identifier.
pub type LobbyId = u32;

/// Sender name used for system chat lines.
const SYSTEM_SENDER: &str = "System";

/// Pluggable admission check consulted before a player is let in.
pub type AdmissionCheck = Arc<dyn Fn(&str, &Arc<Peer>) -> bool + Send + Sync>;

/// Lobby failures, surfaced verbatim to clients.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LobbyError {
    #[error("You're already in a lobby")]
    AlreadyInLobby,

    #[error("Invalid username")]
    InvalidUsername,

    #[error("Already in the lobby")]
    AlreadyMember,

    #[error("Lobby is destroyed")]
    LobbyDestroyed,

    #[error("You're not allowed")]
    NotAllowed,

    #[error("Lobby is full")]
    LobbyFull,

    #[error("Game is already in progress")]
    GameLive,

    #[error("Invalid lobby team")]
    NoSuitableTeam,

    #[error("Not allowed to join a team")]
    TeamJoinRefused,

    #[error("Team switching is disabled")]
    TeamSwitchingDisabled,

    #[error("Team is full")]
    TeamFull,

    #[error("Unknown team")]
    UnknownTeam,

    #[error("You're not in this lobby")]
    NotMember,

    #[error("You cannot start the game manually")]
    ManualStartDisabled,

    #[error("You're not the master of this game")]
    NotGameMaster,

    #[error("Invalid lobby state")]
    InvalidState,

    #[error("Not all players are ready")]
    NotAllReady,

    #[error("Not enough players. Need {0} more")]
    NotEnoughPlayers(usize),

    #[error("Team {0} does not have enough players")]
    TeamLacksPlayers(String),

    #[error("Servers are busy")]
    NoSpawnersAvailable,

    #[error("Game is not running")]
    GameNotRunning,

    #[error("Failed to set the property: {0}")]
    PropertyRejected(String),

    #[error("Unavailable lobby factory")]
    UnknownFactory,
}

/// Behaviour switches of a lobby.
#[derive(Debug, Clone)]
pub struct LobbyConfig {
    pub enable_ready_system: bool,
    pub enable_manual_start: bool,
    pub enable_team_switching: bool,
    pub enable_game_masters: bool,
    /// Whether game over / failure loops back to preparations.
    pub play_again_enabled: bool,
    pub keep_alive_with_zero_players: bool,
    pub allow_joining_when_game_is_live: bool,
    pub allow_players_change_lobby_properties: bool,
    /// Start as soon as everyone is ready and team minimums hold.
    pub start_game_when_all_ready: bool,
}

impl Default for LobbyConfig {
    fn default() -> Self {
        Self {
            enable_ready_system: true,
            enable_manual_start: true,
            enable_team_switching: true,
            enable_game_masters: true,
            play_again_enabled: true,
            keep_alive_with_zero_players: false,
            allow_joining_when_game_is_live: false,
            allow_players_change_lobby_properties: true,
            start_game_when_all_ready: false,
        }
    }
}

/// A matchmaking group.
pub struct Lobby {
    id: LobbyId,
    pub name: String,
    pub lobby_type: String,
    config: LobbyConfig,
    auto_start: Option<AutoStartPolicy>,
    admission: Option<AdmissionCheck>,
    /// Insertion order is meaningful: team picks break ties by it.
    teams: Vec<LobbyTeam>,
    members: BTreeMap<String, LobbyMember>,
    members_by_peer: BTreeMap<PeerId, String>,
    properties: HashMap<String, String>,
    controls: Vec<LobbyControl>,
    state: LobbyState,
    status_text: String,
    game_master: Option<String>,
    spawn_task: Option<Arc<SpawnTask>>,
    room: Option<Arc<RwLock<RegisteredRoom>>>,
    game_endpoint: Option<(String, u16)>,
    destroyed: bool,
    max_players: usize,
    min_players: usize,
}

impl Lobby {
    pub fn new(id: LobbyId, teams: Vec<LobbyTeam>, config: LobbyConfig) -> Self {
        let max_players = teams.iter().map(|t| t.max_players).sum();
        let min_players = teams.iter().map(|t| t.min_players).sum();

        Self {
            id,
            name: "Untitled Lobby".to_string(),
            lobby_type: String::new(),
            config,
            auto_start: None,
            admission: None,
            teams,
            members: BTreeMap::new(),
            members_by_peer: BTreeMap::new(),
            properties: HashMap::new(),
            controls: Vec::new(),
            state: LobbyState::Preparations,
            status_text: "Waiting for players".to_string(),
            game_master: None,
            spawn_task: None,
            room: None,
            game_endpoint: None,
            destroyed: false,
            max_players,
            min_players,
        }
    }

    /// Attach an auto-start policy; such lobbies never use game masters and
    /// never loop back after a game.
    pub fn with_auto_start(mut self, policy: AutoStartPolicy) -> Self {
        self.config.enable_manual_start = true;
        self.config.enable_game_masters = false;
        self.config.play_again_enabled = false;
        self.auto_start = Some(policy);
        self
    }

    pub fn with_admission_check(mut self, check: AdmissionCheck) -> Self {
        self.admission = Some(check);
        self
    }

    pub fn id(&self) -> LobbyId {
        self.id
    }

    pub fn config(&self) -> &LobbyConfig {
        &self.config
    }

    pub fn auto_start_policy(&self) -> Option<AutoStartPolicy> {
        self.auto_start
    }

    pub fn state(&self) -> LobbyState {
        self.state
    }

    pub fn status_text(&self) -> &str {
        &self.status_text
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn player_count(&self) -> usize {
        self.members.len()
    }

    pub fn max_players(&self) -> usize {
        self.max_players
    }

    pub fn min_players(&self) -> usize {
        self.min_players
    }

    pub fn game_master(&self) -> Option<&str> {
        self.game_master.as_deref()
    }

    pub fn room(&self) -> Option<Arc<RwLock<RegisteredRoom>>> {
        self.room.clone()
    }

    pub fn spawn_task(&self) -> Option<Arc<SpawnTask>> {
        self.spawn_task.clone()
    }

    pub fn member_peers(&self) -> Vec<Arc<Peer>> {
        self.members.values().map(|m| Arc::clone(&m.peer)).collect()
    }

    pub fn member_by_peer(&self, peer_id: PeerId) -> Option<&LobbyMember> {
        let username = self.members_by_peer.get(&peer_id)?;
        self.members.get(username)
    }

    pub fn member_by_username(&self, username: &str) -> Option<&LobbyMember> {
        self.members.get(username)
    }

    // =========================================================================
    // MEMBERSHIP
    // =========================================================================

    /// Admit a peer. The caller guarantees the peer is in no other lobby.
    pub fn add_player(&mut self, peer: &Arc<Peer>) -> Result<(), LobbyError> {
        let username = peer.username().ok_or(LobbyError::InvalidUsername)?;

        if self.members.contains_key(&username) {
            return Err(LobbyError::AlreadyMember);
        }
        if self.destroyed {
            return Err(LobbyError::LobbyDestroyed);
        }
        if let Some(check) = &self.admission {
            if !check(&username, peer) {
                return Err(LobbyError::NotAllowed);
            }
        }
        if self.members.len() >= self.max_players {
            return Err(LobbyError::LobbyFull);
        }
        if !self.config.allow_joining_when_game_is_live && self.state != LobbyState::Preparations {
            return Err(LobbyError::GameLive);
        }

        // Least occupied team wins; ties go to the earliest declared team.
        let team_name = {
            let mut best: Option<&LobbyTeam> = None;
            for team in self.teams.iter().filter(|t| t.can_add_player()) {
                match best {
                    Some(current) if current.player_count() <= team.player_count() => {}
                    _ => best = Some(team),
                }
            }
            best.map(|t| t.name.clone())
                .ok_or(LobbyError::NoSuitableTeam)?
        };

        let team = self
            .teams
            .iter_mut()
            .find(|t| t.name == team_name)
            .ok_or(LobbyError::UnknownTeam)?;
        if !team.add_member(&username) {
            return Err(LobbyError::TeamJoinRefused);
        }

        let mut member = LobbyMember::new(username.clone(), Arc::clone(peer));
        member.team = Some(team_name);
        let member_data = member.generate_data();

        self.members.insert(username.clone(), member);
        self.members_by_peer.insert(peer.id(), username.clone());

        if self.game_master.is_none() {
            self.pick_new_game_master(false);
        }

        // Everyone else learns about the newcomer.
        self.broadcast_except(OpCode::LobbyMemberJoined, &member_data, peer.id());
        info!(lobby_id = self.id, username, "Player joined lobby");
        Ok(())
    }

    /// Remove a peer. A no-op when the peer was never a member. Returns true
    /// when the removal destroyed the (now empty) lobby.
    pub fn remove_player(&mut self, peer_id: PeerId) -> bool {
        let username = match self.members_by_peer.remove(&peer_id) {
            Some(username) => username,
            None => return false,
        };

        let member = match self.members.remove(&username) {
            Some(member) => member,
            None => return false,
        };

        if let Some(team_name) = &member.team {
            if let Some(team) = self.teams.iter_mut().find(|t| &t.name == team_name) {
                team.remove_member(&username);
            }
        }

        if self.game_master.as_deref() == Some(username.as_str()) {
            self.pick_new_game_master(true);
        }

        member.peer.notify(OpCode::LeftLobby, &self.id);
        self.broadcast(OpCode::LobbyMemberLeft, &username);
        info!(lobby_id = self.id, username, "Player left lobby");

        if self.members.is_empty() && !self.config.keep_alive_with_zero_players && !self.destroyed
        {
            self.destroy();
            return true;
        }
        false
    }

    fn pick_new_game_master(&mut self, broadcast: bool) {
        if !self.config.enable_game_masters {
            return;
        }
        self.game_master = self.members.keys().next().cloned();
        if broadcast {
            let name = self.game_master.clone().unwrap_or_default();
            self.broadcast(OpCode::LobbyMasterChange, &name);
        }
    }

    /// Tear the lobby down exactly once, detaching every member.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;

        let members: Vec<String> = self.members.keys().cloned().collect();
        for username in members {
            if let Some(member) = self.members.remove(&username) {
                self.members_by_peer.remove(&member.peer.id());
                if let Some(team_name) = &member.team {
                    if let Some(team) = self.teams.iter_mut().find(|t| &t.name == team_name) {
                        team.remove_member(&username);
                    }
                }
                member.peer.notify(OpCode::LeftLobby, &self.id);
            }
        }

        if let Some(task) = self.spawn_task.take() {
            task.kill_spawned_process();
        }
        self.room = None;
        self.game_endpoint = None;

        info!(lobby_id = self.id, "Lobby destroyed");
    }

    // =========================================================================
    // READY / TEAMS / PROPERTIES
    // =========================================================================

    /// Set a member's ready flag. Returns true when this flipped the lobby
    /// into the "everyone ready, minimums met" condition that auto-starts
    /// configured lobbies.
    pub fn set_ready_state(&mut self, peer_id: PeerId, is_ready: bool) -> Result<bool, LobbyError> {
        let username = self
            .members_by_peer
            .get(&peer_id)
            .cloned()
            .ok_or(LobbyError::NotMember)?;

        if let Some(member) = self.members.get_mut(&username) {
            member.is_ready = is_ready;
        }

        self.broadcast(
            OpCode::LobbyMemberReadyStatusChange,
            &ReadyStatusUpdate { username, is_ready },
        );

        let all_ready = !self.members.is_empty() && self.members.values().all(|m| m.is_ready);
        Ok(all_ready
            && self.config.start_game_when_all_ready
            && self.lacking_team().is_none()
            && self.members.len() >= self.min_players)
    }

    /// Move a member to another team.
    pub fn try_join_team(&mut self, peer_id: PeerId, team_name: &str) -> Result<(), LobbyError> {
        if !self.config.enable_team_switching {
            return Err(LobbyError::TeamSwitchingDisabled);
        }

        let username = self
            .members_by_peer
            .get(&peer_id)
            .cloned()
            .ok_or(LobbyError::NotMember)?;
        let current_team = self
            .members
            .get(&username)
            .and_then(|m| m.team.clone())
            .ok_or(LobbyError::UnknownTeam)?;

        if current_team == team_name {
            return Ok(());
        }

        {
            let target = self
                .teams
                .iter()
                .find(|t| t.name == team_name)
                .ok_or(LobbyError::UnknownTeam)?;
            if target.is_full() {
                return Err(LobbyError::TeamFull);
            }
        }

        for team in self.teams.iter_mut() {
            if team.name == team_name {
                if !team.add_member(&username) {
                    return Err(LobbyError::TeamJoinRefused);
                }
            } else if team.name == current_team {
                team.remove_member(&username);
            }
        }

        if let Some(member) = self.members.get_mut(&username) {
            member.team = Some(team_name.to_string());
        }

        self.broadcast(
            OpCode::LobbyMemberChangedTeam,
            &MemberTeamChange {
                username,
                team_name: team_name.to_string(),
            },
        );
        Ok(())
    }

    /// Member-initiated lobby property change, game-master-gated when
    /// masters are enabled.
    pub fn set_lobby_property(
        &mut self,
        setter_peer_id: PeerId,
        key: &str,
        value: &str,
    ) -> Result<(), LobbyError> {
        if !self.config.allow_players_change_lobby_properties {
            return Err(LobbyError::PropertyRejected(key.to_string()));
        }

        if self.config.enable_game_masters {
            let username = self
                .members_by_peer
                .get(&setter_peer_id)
                .ok_or(LobbyError::NotMember)?;
            if self.game_master.as_deref() != Some(username.as_str()) {
                return Err(LobbyError::NotGameMaster);
            }
        }

        self.set_property(key, value);
        Ok(())
    }

    /// Unchecked property write plus broadcast.
    pub fn set_property(&mut self, key: &str, value: &str) {
        self.properties.insert(key.to_string(), value.to_string());
        self.broadcast(
            OpCode::LobbyPropertyChanged,
            &LobbyPropertyChange {
                key: key.to_string(),
                value: value.to_string(),
            },
        );
    }

    pub fn get_property(&self, key: &str) -> Option<&String> {
        self.properties.get(key)
    }

    /// Member-scoped property change.
    pub fn set_player_property(
        &mut self,
        peer_id: PeerId,
        key: &str,
        value: &str,
    ) -> Result<(), LobbyError> {
        let username = self
            .members_by_peer
            .get(&peer_id)
            .cloned()
            .ok_or(LobbyError::NotMember)?;

        if let Some(member) = self.members.get_mut(&username) {
            member.set_property(key, value);
        }

        self.broadcast(
            OpCode::LobbyMemberPropertyChanged,
            &MemberPropertyChange {
                lobby_id: self.id,
                username,
                key: key.to_string(),
                value: value.to_string(),
            },
        );
        Ok(())
    }

    /// Register a settable control; its property defaults to the first
    /// enumerated option.
    pub fn add_control(&mut self, control: LobbyControl) {
        let default_value = control.options.first().cloned().unwrap_or_default();
        self.set_property(&control.key, &default_value);
        self.controls.push(control);
    }

    // =========================================================================
    // CHAT
    // =========================================================================

    pub fn handle_chat_message(&self, peer_id: PeerId, text: &str) -> Result<(), LobbyError> {
        let member = self.member_by_peer(peer_id).ok_or(LobbyError::NotMember)?;
        self.broadcast(
            OpCode::LobbyChatMessage,
            &LobbyChatMessage {
                sender: member.username.clone(),
                message: text.to_string(),
                is_error: false,
            },
        );
        Ok(())
    }

    pub fn broadcast_chat(&self, message: &str, is_error: bool) {
        self.broadcast(
            OpCode::LobbyChatMessage,
            &LobbyChatMessage {
                sender: SYSTEM_SENDER.to_string(),
                message: message.to_string(),
                is_error,
            },
        );
    }

    // =========================================================================
    // STATE MACHINE
    // =========================================================================

    /// Enter a new state: ready flags drop, everyone hears about it.
    pub fn set_state(&mut self, state: LobbyState) {
        if self.state == state {
            return;
        }
        self.state = state;

        let status = match state {
            LobbyState::FailedToStart => "Failed to start server",
            LobbyState::Preparations => "Waiting for players",
            LobbyState::StartingGameServer => "Starting game server",
            LobbyState::GameInProgress => "Game in progress",
            LobbyState::GameOver => "Game is over",
        };

        let usernames: Vec<String> = self.members.keys().cloned().collect();
        for username in usernames {
            if let Some(member) = self.members.get_mut(&username) {
                member.is_ready = false;
            }
            self.broadcast(
                OpCode::LobbyMemberReadyStatusChange,
                &ReadyStatusUpdate {
                    username,
                    is_ready: false,
                },
            );
        }

        self.broadcast(OpCode::LobbyStateChange, &state);
        self.set_status_text(status);
    }

    pub fn set_status_text(&mut self, text: &str) {
        if self.status_text == text {
            return;
        }
        self.status_text = text.to_string();
        self.broadcast(OpCode::LobbyStatusTextChange, &self.status_text);
    }

    /// Checks a member must pass to start the game by hand.
    pub fn validate_manual_start(&self, peer_id: PeerId) -> Result<(), LobbyError> {
        let username = self
            .members_by_peer
            .get(&peer_id)
            .ok_or(LobbyError::NotMember)?;

        if !self.config.enable_manual_start {
            return Err(LobbyError::ManualStartDisabled);
        }
        if self.config.enable_game_masters && self.game_master.as_deref() != Some(username.as_str())
        {
            return Err(LobbyError::NotGameMaster);
        }
        if self.state != LobbyState::Preparations {
            return Err(LobbyError::InvalidState);
        }
        if self.destroyed {
            return Err(LobbyError::LobbyDestroyed);
        }

        let someone_not_ready = self
            .members
            .values()
            .any(|m| !m.is_ready && self.game_master.as_deref() != Some(m.username.as_str()));
        if someone_not_ready {
            return Err(LobbyError::NotAllReady);
        }

        if self.members.len() < self.min_players {
            return Err(LobbyError::NotEnoughPlayers(
                self.min_players - self.members.len(),
            ));
        }

        if let Some(team) = self.lacking_team() {
            return Err(LobbyError::TeamLacksPlayers(team.name.clone()));
        }

        Ok(())
    }

    /// Snapshot used to spawn the game server: the lobby goes private and
    /// hands its public properties plus region/args to the orchestrator.
    pub fn prepare_spawn_request(&mut self) -> (HashMap<String, String>, String, String) {
        self.set_property(option_keys::IS_PUBLIC, "false");
        let region = self
            .properties
            .get(option_keys::REGION)
            .cloned()
            .unwrap_or_default();
        let custom_args = format!("{} {}", option_keys::LOBBY_ID, self.id);
        (self.properties.clone(), region, custom_args)
    }

    /// Attach the spawn task backing the current game, replacing (and
    /// aborting) any previous one.
    pub fn attach_spawn_task(&mut self, task: Arc<SpawnTask>) {
        if let Some(previous) = &self.spawn_task {
            if Arc::ptr_eq(previous, &task) {
                return;
            }
            previous.abort();
        }
        self.spawn_task = Some(task);
        self.set_state(LobbyState::StartingGameServer);
    }

    /// Map a spawn-task status onto the lobby state. Returns true when the
    /// task finalized and the caller should resolve the room.
    pub fn apply_spawn_status(&mut self, status: crate::network::protocol::SpawnStatus) -> bool {
        use crate::network::protocol::SpawnStatus;

        if status.is_starting() && self.state != LobbyState::StartingGameServer {
            self.set_state(LobbyState::StartingGameServer);
            return false;
        }

        if status == SpawnStatus::Finalized {
            self.set_state(LobbyState::GameInProgress);
            return true;
        }

        if status.is_aborted() {
            if self.state == LobbyState::StartingGameServer {
                let next = if self.config.play_again_enabled {
                    LobbyState::Preparations
                } else {
                    LobbyState::FailedToStart
                };
                self.set_state(next);
                self.broadcast_chat("Failed to start a game server", true);
            } else {
                let next = if self.config.play_again_enabled {
                    LobbyState::Preparations
                } else {
                    LobbyState::GameOver
                };
                self.set_state(next);
            }
        }
        false
    }

    /// Record the room the finalized game server registered.
    pub fn set_room(&mut self, room: Arc<RwLock<RegisteredRoom>>, ip: String, port: u16) {
        self.game_endpoint = Some((ip, port));
        self.room = Some(room);
    }

    /// The game's room went away: drop the handle and loop or finish.
    pub fn on_room_destroyed(&mut self) {
        self.room = None;
        self.game_endpoint = None;
        self.spawn_task = None;

        let next = if self.config.play_again_enabled {
            LobbyState::Preparations
        } else {
            LobbyState::GameOver
        };
        self.set_state(next);
    }

    /// First team below its minimum, if any.
    pub fn lacking_team(&self) -> Option<&LobbyTeam> {
        self.teams.iter().find(|t| t.player_count() < t.min_players)
    }

    pub fn all_teams_full(&self) -> bool {
        self.teams.iter().all(|t| t.is_full())
    }

    // =========================================================================
    // SNAPSHOTS & BROADCAST
    // =========================================================================

    pub fn generate_lobby_data(&self, current_user: Option<&str>) -> LobbyData {
        LobbyData {
            lobby_id: self.id,
            lobby_type: self.lobby_type.clone(),
            name: self.name.clone(),
            game_master: self.game_master.clone().unwrap_or_default(),
            state: self.state,
            status_text: self.status_text.clone(),
            max_players: self.max_players,
            properties: self.properties.clone(),
            members: self
                .members
                .values()
                .map(|m| (m.username.clone(), m.generate_data()))
                .collect(),
            teams: self
                .teams
                .iter()
                .map(|t| (t.name.clone(), t.generate_data()))
                .collect(),
            controls: self.controls.clone(),
            enable_team_switching: self.config.enable_team_switching,
            enable_ready_system: self.config.enable_ready_system,
            enable_manual_start: self.config.enable_manual_start,
            current_user: current_user.unwrap_or_default().to_string(),
        }
    }

    fn broadcast<T: serde::Serialize>(&self, opcode: OpCode, payload: &T) {
        for member in self.members.values() {
            member.peer.notify(opcode, payload);
        }
    }

    fn broadcast_except<T: serde::Serialize>(&self, opcode: OpCode, payload: &T, skip: PeerId) {
        for member in self.members.values() {
            if member.peer.id() != skip {
                member.peer.notify(opcode, payload);
            }
        }
    }
}

impl std::fmt::Debug for Lobby {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lobby")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state)
            .field("players", &self.members.len())
            .finish()
    }
}
