//! Lobby Auto-Start
//!
//! Optional policy that starts a lobby's game once its requirements have
//! held for a grace window. A plain debounce: the window re-arms whenever
//! requirements break, and shrinks once every team is full.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::interval;
use tracing::{debug, info};

use crate::lobbies::lobby::Lobby;
use crate::lobbies::registry::LobbyRegistry;
use crate::network::protocol::LobbyState;

/// Grace windows of the auto-start countdown.
#[derive(Debug, Clone, Copy)]
pub struct AutoStartPolicy {
    /// Window armed once the minimum player requirements are met.
    pub wait_after_min_players: Duration,
    /// Shorter window applied when every team is full.
    pub wait_after_full_teams: Duration,
}

impl Default for AutoStartPolicy {
    fn default() -> Self {
        Self {
            wait_after_min_players: Duration::from_secs(10),
            wait_after_full_teams: Duration::from_secs(5),
        }
    }
}

enum Tick {
    /// Requirements unmet; window re-armed.
    Rearm,
    /// Counting down.
    Counting,
    /// Window elapsed; try to start.
    Start,
    /// Lobby left preparations or died; automation ends.
    Stop,
}

/// Drive one auto lobby until it starts its game or goes away.
pub async fn run_automation(
    registry: Arc<LobbyRegistry>,
    lobby: Arc<RwLock<Lobby>>,
    policy: AutoStartPolicy,
    tick: Duration,
) {
    let mut ticker = interval(tick);
    let mut time_left = policy.wait_after_min_players;

    loop {
        ticker.tick().await;

        let decision = {
            let mut guard = lobby.write().await;

            if guard.is_destroyed() || guard.state() != LobbyState::Preparations {
                Tick::Stop
            } else if guard.player_count() < guard.min_players() {
                time_left = policy.wait_after_min_players;
                let needed = guard.min_players() - guard.player_count();
                guard.set_status_text(&format!("Waiting for players: {needed} more"));
                Tick::Rearm
            } else if let Some(team) = guard.lacking_team() {
                let team_name = team.name.clone();
                time_left = policy.wait_after_min_players;
                guard.set_status_text(&format!("Not enough players in team '{team_name}'"));
                Tick::Rearm
            } else {
                time_left = time_left.saturating_sub(tick);
                if guard.all_teams_full() {
                    time_left = time_left.min(policy.wait_after_full_teams);
                }
                guard.set_status_text(&format!("Starting game in {}", time_left.as_secs()));
                if time_left.is_zero() {
                    Tick::Start
                } else {
                    Tick::Counting
                }
            }
        };

        match decision {
            Tick::Stop => break,
            Tick::Rearm | Tick::Counting => continue,
            Tick::Start => {
                let lobby_id = lobby.read().await.id();
                match registry.start_game(&lobby).await {
                    Ok(()) => {
                        info!(lobby_id, "Auto-start triggered");
                        break;
                    }
                    Err(error) => {
                        // No capacity right now; re-arm and keep trying.
                        debug!(lobby_id, %error, "Auto-start failed, re-arming");
                        time_left = policy.wait_after_min_players;
                    }
                }
            }
        }
    }
}
