//! Matchmaking lobbies: teams, members, the lobby state machine, factories
//! and the registry routing the lobby control surface.

pub mod auto;
pub mod factory;
pub mod lobby;
pub mod member;
pub mod registry;
pub mod team;

pub use auto::AutoStartPolicy;
pub use lobby::{Lobby, LobbyConfig, LobbyError, LobbyId};
pub use member::LobbyMember;
pub use registry::{LobbiesConfig, LobbyRegistry};
pub use team::LobbyTeam;
