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

#[cfg(test)]
use std::collections::HashMap;
use std::sync::Arc;
#[cfg(test)]
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bisca_common::GameStatus;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::engine::GameInstance;
use crate::manager::GameRegistry;

const GAME_KEY_PREFIX: &str = "bisca:game:";

/// Durable standby copy of every live game, keyed by game id. It never
/// overrides live in-memory state: a restart adopts from it, and a reconnect
/// that finds no local game replays it read-only.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn put(&self, game: &GameInstance) -> anyhow::Result<()>;
    async fn fetch(&self, game_id: &str) -> anyhow::Result<Option<GameInstance>>;
    async fn remove(&self, game_id: &str) -> anyhow::Result<()>;
    async fn list_live(&self) -> anyhow::Result<Vec<GameInstance>>;
}

fn game_key(game_id: &str) -> String {
    format!("{GAME_KEY_PREFIX}{game_id}")
}

pub struct RedisSnapshotStore {
    conn: Mutex<ConnectionManager>,
    ttl_seconds: u64,
}

impl RedisSnapshotStore {
    pub async fn connect(redis_url: &str, ttl_seconds: u64) -> anyhow::Result<Self> {
        let client = Client::open(redis_url).context("invalid REDIS_URL")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("unable to initialize Redis connection manager")?;
        Ok(RedisSnapshotStore {
            conn: Mutex::new(conn),
            ttl_seconds,
        })
    }
}

#[async_trait]
impl SnapshotStore for RedisSnapshotStore {
    async fn put(&self, game: &GameInstance) -> anyhow::Result<()> {
        let blob = serde_json::to_string(game).context("failed to serialize game snapshot")?;
        let mut conn = self.conn.lock().await;
        conn.set_ex::<_, _, ()>(game_key(&game.game_id), blob, self.ttl_seconds)
            .await
            .context("redis SETEX failed")?;
        Ok(())
    }

    async fn fetch(&self, game_id: &str) -> anyhow::Result<Option<GameInstance>> {
        let mut conn = self.conn.lock().await;
        let blob: Option<String> = conn
            .get(game_key(game_id))
            .await
            .context("redis GET failed")?;
        match blob {
            Some(blob) => Ok(Some(
                serde_json::from_str(&blob).context("corrupt game snapshot")?,
            )),
            None => Ok(None),
        }
    }

    async fn remove(&self, game_id: &str) -> anyhow::Result<()> {
        let mut conn = self.conn.lock().await;
        conn.del::<_, ()>(game_key(game_id))
            .await
            .context("redis DEL failed")?;
        Ok(())
    }

    async fn list_live(&self) -> anyhow::Result<Vec<GameInstance>> {
        let mut conn = self.conn.lock().await;
        let keys: Vec<String> = conn
            .keys(format!("{GAME_KEY_PREFIX}*"))
            .await
            .context("redis KEYS failed")?;

        let mut games = Vec::new();
        for key in keys {
            let blob: Option<String> = conn.get(&key).await.context("redis GET failed")?;
            let Some(blob) = blob else { continue };
            match serde_json::from_str::<GameInstance>(&blob) {
                Ok(game) => games.push(game),
                Err(error) => {
                    warn!(key = %key, error = %error, "skipping corrupt game snapshot");
                }
            }
        }
        Ok(games)
    }
}

/// Process-local stand-in for tests. Keeps the serialized form so the
/// round trip matches the real store.
#[cfg(test)]
#[derive(Default)]
pub struct MemorySnapshotStore {
    games: StdMutex<HashMap<String, String>>,
}

#[cfg(test)]
impl MemorySnapshotStore {
    pub fn new() -> Self {
        MemorySnapshotStore::default()
    }
}

#[cfg(test)]
#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn put(&self, game: &GameInstance) -> anyhow::Result<()> {
        let blob = serde_json::to_string(game).context("failed to serialize game snapshot")?;
        self.games
            .lock()
            .unwrap()
            .insert(game.game_id.clone(), blob);
        Ok(())
    }

    async fn fetch(&self, game_id: &str) -> anyhow::Result<Option<GameInstance>> {
        let blob = self.games.lock().unwrap().get(game_id).cloned();
        match blob {
            Some(blob) => Ok(Some(
                serde_json::from_str(&blob).context("corrupt game snapshot")?,
            )),
            None => Ok(None),
        }
    }

    async fn remove(&self, game_id: &str) -> anyhow::Result<()> {
        self.games.lock().unwrap().remove(game_id);
        Ok(())
    }

    async fn list_live(&self) -> anyhow::Result<Vec<GameInstance>> {
        let blobs: Vec<(String, String)> = self
            .games
            .lock()
            .unwrap()
            .iter()
            .map(|(id, blob)| (id.clone(), blob.clone()))
            .collect();

        let mut games = Vec::new();
        for (game_id, blob) in blobs {
            match serde_json::from_str::<GameInstance>(&blob) {
                Ok(game) => games.push(game),
                Err(error) => {
                    warn!(game_id = %game_id, error = %error, "skipping corrupt game snapshot");
                }
            }
        }
        Ok(games)
    }
}

/// Write the snapshot off the gameplay path. A slow or failing store write
/// must never delay a move being applied.
pub fn persist_snapshot(store: &Option<Arc<dyn SnapshotStore>>, game: &GameInstance) {
    let Some(store) = store else { return };
    let store = store.clone();
    let game = game.clone();
    tokio::spawn(async move {
        if let Err(error) = store.put(&game).await {
            warn!(game_id = %game.game_id, error = %error, "failed to persist game snapshot");
        }
    });
}

pub fn discard_snapshot(store: &Option<Arc<dyn SnapshotStore>>, game_id: &str) {
    let Some(store) = store else { return };
    let store = store.clone();
    let game_id = game_id.to_string();
    tokio::spawn(async move {
        if let Err(error) = store.remove(&game_id).await {
            warn!(game_id = %game_id, error = %error, "failed to discard game snapshot");
        }
    });
}

/// Periodic full sweep backing up every registered game, catching anything
/// the per-event writes missed.
pub async fn run_sync_loop(
    registry: Arc<GameRegistry>,
    store: Arc<dyn SnapshotStore>,
    interval_seconds: u64,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_seconds.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        for (game_id, handle) in registry.live_handles().await {
            let snapshot = { handle.lock().await.clone() };
            if let Err(error) = store.put(&snapshot).await {
                warn!(game_id = %game_id, error = %error, "periodic snapshot sync failed");
            }
        }
    }
}

/// Reload every snapshot the store still considers live and put it back in
/// the registry. Deadlines that lapsed while the process was down are
/// re-armed with a fresh budget rather than instantly forfeited. Dead
/// snapshots are purged. Returns the adopted handles so the caller can
/// restart bot workers.
pub async fn reinstate_live_games(
    registry: &GameRegistry,
    store: &Arc<dyn SnapshotStore>,
    now: DateTime<Utc>,
) -> anyhow::Result<Vec<Arc<Mutex<GameInstance>>>> {
    let snapshots = store.list_live().await?;
    let mut adopted = Vec::new();

    for mut game in snapshots {
        // Interrupted games are gone for good; a decided match only left a
        // snapshot behind because its deletion failed.
        if game.status == GameStatus::Interrupted || game.match_over {
            if let Err(error) = store.remove(&game.game_id).await {
                warn!(game_id = %game.game_id, error = %error, "failed to purge dead snapshot");
            }
            continue;
        }

        if game.status == GameStatus::Playing
            && let Some(deadline) = game.turn_deadline
            && deadline <= now
        {
            game.rearm_turn(now);
        }

        let game_id = game.game_id.clone();
        let handle = registry.adopt(game).await;
        info!(game_id = %game_id, "reinstated game from snapshot");
        adopted.push(handle);
    }

    if !adopted.is_empty() {
        info!(count = adopted.len(), "recovery complete");
    }
    Ok(adopted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Participant;
    use bisca_common::{CardRef, GameMode, TiePolicy};
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn live_game(seed: u64) -> GameInstance {
        let now = Utc::now();
        let mut game = GameInstance::create(
            Participant::seat("alice", "Alice", false),
            GameMode::Pvp,
            3,
            4,
            TiePolicy::NoMark,
            30,
            now,
        );
        game.add_opponent(Participant::seat("bruno", "Bruno", false), now)
            .unwrap();
        let mut rng = StdRng::seed_from_u64(seed);
        game.start(&mut rng, now).unwrap();
        game
    }

    #[tokio::test]
    async fn memory_store_round_trips_snapshots() {
        let store = MemorySnapshotStore::new();
        let game = live_game(4);

        store.put(&game).await.unwrap();
        let fetched = store.fetch(&game.game_id).await.unwrap().unwrap();
        assert_eq!(fetched, game);

        let live = store.list_live().await.unwrap();
        assert_eq!(live.len(), 1);

        store.remove(&game.game_id).await.unwrap();
        assert!(store.fetch(&game.game_id).await.unwrap().is_none());
        assert!(store.list_live().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn corrupt_snapshots_are_skipped_not_fatal() {
        let store = MemorySnapshotStore::new();
        let game = live_game(5);
        store.put(&game).await.unwrap();
        store
            .games
            .lock()
            .unwrap()
            .insert("broken".to_string(), "{not json".to_string());

        let live = store.list_live().await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].game_id, game.game_id);
    }

    #[tokio::test]
    async fn reinstated_games_match_the_pre_crash_state() {
        let store: Arc<dyn SnapshotStore> = Arc::new(MemorySnapshotStore::new());
        let mut game = live_game(6);
        // Advance a few plays so the snapshot is mid-game.
        for _ in 0..3 {
            let turn = game.current_turn.clone().unwrap();
            let pos = game.legal_positions(&turn)[0];
            game.play_card(&turn, &CardRef::Index(pos), Utc::now())
                .unwrap();
        }
        store.put(&game).await.unwrap();

        let registry = GameRegistry::new();
        let adopted = reinstate_live_games(&registry, &store, Utc::now())
            .await
            .unwrap();
        assert_eq!(adopted.len(), 1);

        let restored = adopted[0].lock().await;
        assert_eq!(*restored, game);
        assert_eq!(
            registry.game_for_player("alice").await.unwrap().0,
            game.game_id
        );
    }

    #[tokio::test]
    async fn lapsed_deadlines_are_rearmed_on_recovery() {
        let store: Arc<dyn SnapshotStore> = Arc::new(MemorySnapshotStore::new());
        let mut game = live_game(7);
        game.turn_deadline = Some(Utc::now() - chrono::Duration::seconds(90));
        let old_generation = game.turn_generation;
        store.put(&game).await.unwrap();

        let registry = GameRegistry::new();
        let now = Utc::now();
        let adopted = reinstate_live_games(&registry, &store, now)
            .await
            .unwrap();

        let restored = adopted[0].lock().await;
        assert!(restored.turn_deadline.unwrap() > now);
        assert!(restored.turn_generation > old_generation);
    }

    #[tokio::test]
    async fn dead_snapshots_are_purged_instead_of_adopted() {
        let store: Arc<dyn SnapshotStore> = Arc::new(MemorySnapshotStore::new());
        let mut interrupted = live_game(8);
        interrupted.interrupt(Some("alice"), Utc::now());
        store.put(&interrupted).await.unwrap();

        // A decided match whose deletion failed lingers as a snapshot too.
        let mut settled = live_game(10);
        settled.status = GameStatus::Ended;
        settled.match_over = true;
        settled.match_winner = Some("alice".to_string());
        store.put(&settled).await.unwrap();

        let registry = GameRegistry::new();
        let adopted = reinstate_live_games(&registry, &store, Utc::now())
            .await
            .unwrap();

        assert!(adopted.is_empty());
        assert_eq!(registry.game_count().await, 0);
        assert!(store.fetch(&interrupted.game_id).await.unwrap().is_none());
        assert!(store.fetch(&settled.game_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn persist_runs_off_the_gameplay_path() {
        let store: Arc<dyn SnapshotStore> = Arc::new(MemorySnapshotStore::new());
        let maybe_store = Some(store.clone());
        let game = live_game(9);

        persist_snapshot(&maybe_store, &game);
        let mut persisted = false;
        for _ in 0..50 {
            tokio::task::yield_now().await;
            if store.fetch(&game.game_id).await.unwrap().is_some() {
                persisted = true;
                break;
            }
        }
        assert!(persisted);

        discard_snapshot(&maybe_store, &game.game_id);
        let mut discarded = false;
        for _ in 0..50 {
            tokio::task::yield_now().await;
            if store.fetch(&game.game_id).await.unwrap().is_none() {
                discarded = true;
                break;
            }
        }
        assert!(discarded);

        // No store configured: both are quiet no-ops.
        persist_snapshot(&None, &game);
        discard_snapshot(&None, &game.game_id);
    }

    #[tokio::test]
    async fn registry_adoption_does_not_duplicate_games() {
        let store: Arc<dyn SnapshotStore> = Arc::new(MemorySnapshotStore::new());
        let game = live_game(10);
        store.put(&game).await.unwrap();

        let registry = GameRegistry::new();
        reinstate_live_games(&registry, &store, Utc::now())
            .await
            .unwrap();
        reinstate_live_games(&registry, &store, Utc::now())
            .await
            .unwrap();
        assert_eq!(registry.game_count().await, 1);
    }
}
