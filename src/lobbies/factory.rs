//! Lobby Factories
//!
//! Named builders clients pick from when creating a lobby. Each factory
//! fixes the team layout and configuration; the creator's properties only
//! fill in cosmetics like the display name.

use std::collections::HashMap;
use std::sync::Arc;

use crate::lobbies::auto::AutoStartPolicy;
use crate::lobbies::lobby::{Lobby, LobbyConfig, LobbyId};
use crate::lobbies::team::LobbyTeam;
use crate::network::peer::Peer;
use crate::network::protocol::option_keys;

const DEFAULT_LOBBY_NAME: &str = "Untitled Lobby";

type BuilderFn = Arc<dyn Fn(LobbyId, &HashMap<String, String>, &Arc<Peer>) -> Lobby + Send + Sync>;

/// A registered lobby builder, keyed by its id.
#[derive(Clone)]
pub struct LobbyFactory {
    id: String,
    builder: BuilderFn,
}

impl LobbyFactory {
    pub fn new(
        id: impl Into<String>,
        builder: impl Fn(LobbyId, &HashMap<String, String>, &Arc<Peer>) -> Lobby
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            builder: Arc::new(builder),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn create(
        &self,
        lobby_id: LobbyId,
        properties: &HashMap<String, String>,
        creator: &Arc<Peer>,
    ) -> Lobby {
        (self.builder)(lobby_id, properties, creator)
    }
}

fn requested_name(properties: &HashMap<String, String>) -> String {
    properties
        .get(option_keys::LOBBY_NAME)
        .cloned()
        .unwrap_or_else(|| DEFAULT_LOBBY_NAME.to_string())
}

/// Two single-player teams facing each other.
pub fn one_vs_one() -> LobbyFactory {
    LobbyFactory::new("1v1", |lobby_id, properties, _creator| {
        let mut team_a = LobbyTeam::new("Team Blue").with_limits(1, 1);
        let mut team_b = LobbyTeam::new("Team Red").with_limits(1, 1);
        team_a.set_property("color", "0000FF");
        team_b.set_property("color", "FF0000");

        let mut lobby = Lobby::new(lobby_id, vec![team_a, team_b], LobbyConfig::default());
        lobby.name = requested_name(properties);
        lobby.lobby_type = "1v1".to_string();
        lobby
    })
}

/// Two teams of two.
pub fn two_vs_two() -> LobbyFactory {
    LobbyFactory::new("2v2", |lobby_id, properties, _creator| {
        let mut team_a = LobbyTeam::new("Team Blue").with_limits(2, 2);
        let mut team_b = LobbyTeam::new("Team Red").with_limits(2, 2);
        team_a.set_property("color", "0000FF");
        team_b.set_property("color", "FF0000");

        let mut lobby = Lobby::new(lobby_id, vec![team_a, team_b], LobbyConfig::default());
        lobby.name = requested_name(properties);
        lobby.lobby_type = "2v2".to_string();
        lobby
    })
}

/// Free-for-all: one wide team, no ready requirement pressure.
pub fn deathmatch() -> LobbyFactory {
    LobbyFactory::new("deathmatch", |lobby_id, properties, _creator| {
        let team = LobbyTeam::new("Players").with_limits(2, 10);

        let mut lobby = Lobby::new(lobby_id, vec![team], LobbyConfig::default());
        lobby.name = requested_name(properties);
        lobby.lobby_type = "deathmatch".to_string();
        lobby
    })
}

/// A 1v1 that counts itself down and starts without a game master.
pub fn one_vs_one_auto() -> LobbyFactory {
    LobbyFactory::new("1v1-auto", |lobby_id, properties, _creator| {
        let team_a = LobbyTeam::new("Team Blue").with_limits(1, 1);
        let team_b = LobbyTeam::new("Team Red").with_limits(1, 1);

        let mut lobby = Lobby::new(lobby_id, vec![team_a, team_b], LobbyConfig::default())
            .with_auto_start(AutoStartPolicy::default());
        lobby.name = requested_name(properties);
        lobby.lobby_type = "1v1-auto".to_string();
        lobby
    })
}

/// The factories a freshly built registry knows about.
pub fn default_factories() -> Vec<LobbyFactory> {
    vec![one_vs_one(), two_vs_two(), deathmatch(), one_vs_one_auto()]
}
