//! Lobby Member
//!
//! One admitted player. Owned exclusively by its lobby; dropped when the
//! player is removed.

use std::collections::HashMap;
use std::sync::Arc;

use crate::network::peer::Peer;
use crate::network::protocol::LobbyMemberData;

/// A player inside a lobby.
#[derive(Debug)]
pub struct LobbyMember {
    pub username: String,
    pub peer: Arc<Peer>,
    pub is_ready: bool,
    /// Name of the team the member currently sits on.
    pub team: Option<String>,
    properties: HashMap<String, String>,
}

impl LobbyMember {
    pub fn new(username: impl Into<String>, peer: Arc<Peer>) -> Self {
        Self {
            username: username.into(),
            peer,
            is_ready: false,
            team: None,
            properties: HashMap::new(),
        }
    }

    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.properties.insert(key.into(), value.into());
    }

    pub fn get_property(&self, key: &str) -> Option<&String> {
        self.properties.get(key)
    }

    pub fn generate_data(&self) -> LobbyMemberData {
        LobbyMemberData {
            username: self.username.clone(),
            is_ready: self.is_ready,
            team: self.team.clone().unwrap_or_default(),
            properties: self.properties.clone(),
        }
    }
}
