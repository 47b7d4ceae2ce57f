// Copyright (C) 2026 BiscaArena
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::collections::HashMap;
use std::sync::Arc;

use bisca_common::{
    GameListing, GameMode, GameStatus, HAND_SIZES, MAX_TARGET_MARKS, MIN_TARGET_MARKS, PlayerId,
    TiePolicy,
};
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::info;

use crate::engine::{GameError, GameInstance, Participant};

#[derive(Debug, Clone, Copy)]
pub struct GameOptions {
    pub mode: GameMode,
    pub hand_size: usize,
    pub target_marks: u32,
    pub tie_policy: TiePolicy,
    pub turn_timeout_seconds: u64,
}

struct RegistryInner {
    games: HashMap<String, Arc<Mutex<GameInstance>>>,
    player_index: HashMap<PlayerId, String>,
}

/// All live games in this process. The registry lock covers only the maps;
/// each game carries its own mutex so one match's plays never stall another.
/// Lock order is registry before game, never the reverse.
pub struct GameRegistry {
    inner: Mutex<RegistryInner>,
}

impl Default for GameRegistry {
    fn default() -> Self {
        GameRegistry::new()
    }
}

impl GameRegistry {
    pub fn new() -> Self {
        GameRegistry {
            inner: Mutex::new(RegistryInner {
                games: HashMap::new(),
                player_index: HashMap::new(),
            }),
        }
    }

    /// Validate and register a fresh game with the creator seated. The
    /// creator must not already be in a game; one active game per player.
    pub async fn create_game(
        &self,
        creator: Participant,
        options: GameOptions,
        now: DateTime<Utc>,
    ) -> Result<Arc<Mutex<GameInstance>>, GameError> {
        if !HAND_SIZES.contains(&options.hand_size) {
            return Err(GameError::IllegalMove("INVALID_HAND_SIZE"));
        }
        if !(MIN_TARGET_MARKS..=MAX_TARGET_MARKS).contains(&options.target_marks) {
            return Err(GameError::IllegalMove("INVALID_TARGET_MARKS"));
        }

        let mut inner = self.inner.lock().await;
        if inner.player_index.contains_key(&creator.player_id) {
            return Err(GameError::IllegalMove("ALREADY_IN_GAME"));
        }

        let creator_id = creator.player_id.clone();
        let game = GameInstance::create(
            creator,
            options.mode,
            options.hand_size,
            options.target_marks,
            options.tie_policy,
            options.turn_timeout_seconds,
            now,
        );
        let game_id = game.game_id.clone();
        let handle = Arc::new(Mutex::new(game));
        inner.games.insert(game_id.clone(), handle.clone());
        inner.player_index.insert(creator_id, game_id.clone());
        info!(game_id = %game_id, "registered game");
        Ok(handle)
    }

    /// Seat a second player into a pending game.
    pub async fn join_game(
        &self,
        game_id: &str,
        seat: Participant,
        now: DateTime<Utc>,
    ) -> Result<Arc<Mutex<GameInstance>>, GameError> {
        let mut inner = self.inner.lock().await;
        if inner.player_index.contains_key(&seat.player_id) {
            return Err(GameError::IllegalMove("ALREADY_IN_GAME"));
        }
        let handle = inner
            .games
            .get(game_id)
            .cloned()
            .ok_or(GameError::IllegalMove("GAME_NOT_FOUND"))?;

        let player_id = seat.player_id.clone();
        {
            let mut game = handle.lock().await;
            // Bot games fill their second seat internally.
            if game.mode != GameMode::Pvp {
                return Err(GameError::IllegalMove("GAME_NOT_JOINABLE"));
            }
            game.add_opponent(seat, now)?;
        }
        inner.player_index.insert(player_id, game_id.to_string());
        Ok(handle)
    }

    pub async fn get(&self, game_id: &str) -> Option<Arc<Mutex<GameInstance>>> {
        self.inner.lock().await.games.get(game_id).cloned()
    }

    pub async fn game_for_player(
        &self,
        player_id: &str,
    ) -> Option<(String, Arc<Mutex<GameInstance>>)> {
        let inner = self.inner.lock().await;
        let game_id = inner.player_index.get(player_id)?.clone();
        let handle = inner.games.get(&game_id)?.clone();
        Some((game_id, handle))
    }

    /// Drop a game and free both seats.
    pub async fn remove(&self, game_id: &str) {
        let mut inner = self.inner.lock().await;
        if inner.games.remove(game_id).is_some() {
            inner.player_index.retain(|_, id| id != game_id);
            info!(game_id = %game_id, "removed game");
        }
    }

    /// Re-register a game restored from a snapshot, reclaiming the human
    /// seats in the player index.
    pub async fn adopt(&self, game: GameInstance) -> Arc<Mutex<GameInstance>> {
        let mut inner = self.inner.lock().await;
        let game_id = game.game_id.clone();
        for seat in game.participants.iter().filter(|p| !p.is_bot) {
            inner
                .player_index
                .insert(seat.player_id.clone(), game_id.clone());
        }
        let handle = Arc::new(Mutex::new(game));
        inner.games.insert(game_id, handle.clone());
        handle
    }

    /// Open seats for the lobby list.
    pub async fn pending_listings(&self) -> Vec<GameListing> {
        let handles: Vec<Arc<Mutex<GameInstance>>> = {
            let inner = self.inner.lock().await;
            inner.games.values().cloned().collect()
        };

        let mut listings = Vec::new();
        for handle in handles {
            let game = handle.lock().await;
            if game.mode == GameMode::Pvp
                && game.status == GameStatus::Pending
                && game.participants.len() < 2
            {
                listings.push(game.listing());
            }
        }
        listings.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        listings
    }

    /// Snapshot of every registered game handle, for the watchdog scan and
    /// the periodic persistence sweep.
    pub async fn live_handles(&self) -> Vec<(String, Arc<Mutex<GameInstance>>)> {
        let inner = self.inner.lock().await;
        inner
            .games
            .iter()
            .map(|(id, handle)| (id.clone(), handle.clone()))
            .collect()
    }

    pub async fn game_count(&self) -> usize {
        self.inner.lock().await.games.len()
    }
}
