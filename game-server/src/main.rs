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

//! Realtime Bisca engine: axum WebSocket surface over the in-memory game
//! registry, with Redis-backed crash recovery and cross-node event
//! mirroring, house-bot workers, and platform callbacks for identity and
//! match settlement.

mod api;
mod bot;
mod engine;
mod gateway;
mod manager;
mod recovery;
mod watchdog;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bisca_common::{
    DEFAULT_BOT_MAX_RETRIES, DEFAULT_BOT_RETRY_BASE_MS, DEFAULT_BOT_RETRY_CAP_MS,
    DEFAULT_BOT_THINK_DELAY_MS, DEFAULT_BOT_TIMEOUT_SECONDS, DEFAULT_SNAPSHOT_SYNC_SECONDS,
    DEFAULT_SNAPSHOT_TTL_SECONDS, DEFAULT_TURN_TIMEOUT_SECONDS,
    DEFAULT_WATCHDOG_INTERVAL_SECONDS, GameStatus, TiePolicy, TimeoutAction,
};
use chrono::Utc;
use tracing::{info, warn};

use crate::api::{HttpPlatformClient, IdentityVerifier, MatchRecorder};
use crate::bot::{BotDriver, BotSettings, BotSupervisor, HeuristicBot, Scheduler, TokioScheduler};
use crate::gateway::{AppState, Broadcaster, GameCore, GameRules, build_router, spawn_mirror_consumer};
use crate::manager::GameRegistry;
use crate::recovery::{RedisSnapshotStore, SnapshotStore, reinstate_live_games, run_sync_loop};
use crate::watchdog::run_watchdog;

struct EngineConfig {
    bind_addr: SocketAddr,
    redis_url: Option<String>,
    api_base_url: Option<String>,
    rules: GameRules,
    bot_settings: BotSettings,
    snapshot_sync_seconds: u64,
    snapshot_ttl_seconds: u64,
    watchdog_interval_seconds: u64,
}

impl EngineConfig {
    fn from_env() -> anyhow::Result<EngineConfig> {
        Ok(EngineConfig {
            bind_addr: parse_bind_addr("GAME_SERVER_BIND_ADDR", "0.0.0.0:8090")?,
            redis_url: std::env::var("REDIS_URL").ok(),
            api_base_url: std::env::var("API_BASE_URL").ok(),
            rules: GameRules {
                tie_policy: parse_tie_policy(),
                timeout_action: parse_timeout_action(),
                turn_timeout_seconds: env_parsed(
                    "TURN_TIMEOUT_SECONDS",
                    DEFAULT_TURN_TIMEOUT_SECONDS,
                ),
            },
            bot_settings: BotSettings {
                think_delay: Duration::from_millis(env_parsed(
                    "BOT_THINK_DELAY_MS",
                    DEFAULT_BOT_THINK_DELAY_MS,
                )),
                response_timeout: Duration::from_secs(env_parsed(
                    "BOT_RESPONSE_TIMEOUT_SECONDS",
                    DEFAULT_BOT_TIMEOUT_SECONDS,
                )),
                max_retries: env_parsed("BOT_MAX_RETRIES", DEFAULT_BOT_MAX_RETRIES),
                retry_base_ms: env_parsed("BOT_RETRY_BASE_MS", DEFAULT_BOT_RETRY_BASE_MS),
                retry_cap_ms: env_parsed("BOT_RETRY_CAP_MS", DEFAULT_BOT_RETRY_CAP_MS),
            },
            snapshot_sync_seconds: env_parsed(
                "SNAPSHOT_SYNC_SECONDS",
                DEFAULT_SNAPSHOT_SYNC_SECONDS,
            ),
            snapshot_ttl_seconds: env_parsed("SNAPSHOT_TTL_SECONDS", DEFAULT_SNAPSHOT_TTL_SECONDS),
            watchdog_interval_seconds: env_parsed(
                "WATCHDOG_INTERVAL_SECONDS",
                DEFAULT_WATCHDOG_INTERVAL_SECONDS,
            ),
        })
    }
}

fn env_parsed<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn parse_tie_policy() -> TiePolicy {
    match std::env::var("TIE_POLICY") {
        Ok(name) => TiePolicy::from_name(&name).unwrap_or_else(|| {
            warn!(value = %name, "unknown TIE_POLICY; using no_mark");
            TiePolicy::NoMark
        }),
        Err(_) => TiePolicy::NoMark,
    }
}

fn parse_timeout_action() -> TimeoutAction {
    match std::env::var("TIMEOUT_ACTION") {
        Ok(name) => TimeoutAction::from_name(&name).unwrap_or_else(|| {
            warn!(value = %name, "unknown TIMEOUT_ACTION; using auto_play");
            TimeoutAction::AutoPlay
        }),
        Err(_) => TimeoutAction::AutoPlay,
    }
}

fn parse_bind_addr(var_name: &str, default: &str) -> anyhow::Result<SocketAddr> {
    let value = std::env::var(var_name)
        .ok()
        .unwrap_or_else(|| default.to_string());
    value.parse().context(format!("invalid {var_name}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "game_server=info,bisca_common=info,tower_http=info".to_string()),
        )
        .init();

    let config = EngineConfig::from_env()?;
    let registry = Arc::new(GameRegistry::new());

    let (broadcaster, snapshots) = match &config.redis_url {
        Some(redis_url) => {
            let broadcaster = Arc::new(Broadcaster::with_mirror(redis_url).await?);
            let store =
                RedisSnapshotStore::connect(redis_url, config.snapshot_ttl_seconds).await?;
            (broadcaster, Some(Arc::new(store) as Arc<dyn SnapshotStore>))
        }
        None => {
            info!("REDIS_URL not set; running single-node without snapshot recovery");
            (Arc::new(Broadcaster::new()), None)
        }
    };

    let (verifier, recorder) = match &config.api_base_url {
        Some(base_url) => {
            let client = Arc::new(HttpPlatformClient::new(base_url.clone()));
            (
                Some(client.clone() as Arc<dyn IdentityVerifier>),
                Some(client as Arc<dyn MatchRecorder>),
            )
        }
        None => {
            info!("API_BASE_URL not set; sessions are guests and matches go unrecorded");
            (None, None)
        }
    };

    let scheduler: Arc<dyn Scheduler> = Arc::new(TokioScheduler);
    let core = Arc::new(GameCore {
        registry: registry.clone(),
        broadcaster: broadcaster.clone(),
        snapshots: snapshots.clone(),
        recorder,
        scheduler: scheduler.clone(),
        rules: config.rules,
    });
    let bots = Arc::new(BotSupervisor::new(
        Arc::new(HeuristicBot),
        core.clone() as Arc<dyn BotDriver>,
        scheduler,
        config.bot_settings,
    ));

    if let Some(store) = &snapshots {
        let restored = reinstate_live_games(&registry, store, Utc::now()).await?;
        // Bot turns frozen by the restart resume where they left off, and
        // every reclaimed game announces itself to its players.
        for handle in restored {
            let game = handle.lock().await;
            core.announce_recovery(&game).await;
            if game.status == GameStatus::Playing
                && let (Some(turn), Some(bot_id)) = (&game.current_turn, game.bot_id())
                && *turn == bot_id
            {
                bots.nudge(&game.game_id, game.turn_generation).await;
            }
        }
        tokio::spawn(run_sync_loop(
            registry.clone(),
            store.clone(),
            config.snapshot_sync_seconds,
        ));
    }

    if let Some(redis_url) = &config.redis_url {
        spawn_mirror_consumer(redis_url.clone(), broadcaster.clone());
    }

    tokio::spawn(run_watchdog(
        core.clone(),
        bots.clone(),
        config.watchdog_interval_seconds,
    ));

    let app = build_router(AppState {
        core,
        bots,
        verifier,
    });
    info!(bind_addr = %config.bind_addr, "game-server listening");
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
