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

//! Turn watchdog: periodically sweeps every live game for an overrun turn
//! deadline and makes the overdue side act, whoever it is. A stalled bot is
//! forced into its fallback play; a stalled human gets the configured
//! consequence (forced lowest card or forfeit).

use std::sync::Arc;
use std::time::Duration;

use bisca_common::GameStatus;
use tokio::time::{MissedTickBehavior, interval};
use tracing::info;

use crate::bot::BotSupervisor;
use crate::gateway::{GameCore, TimeoutOutcome};

/// One sweep over all live games. Deadlines are sampled under a short lock;
/// the consequence runs through [`GameCore::expire_turn`], which re-validates
/// everything, so a play landing mid-sweep is never clobbered.
pub async fn scan_expired_turns(core: &GameCore, bots: &BotSupervisor) {
    let now = core.scheduler.now();
    for (game_id, handle) in core.registry.live_handles().await {
        let expired = {
            let game = handle.lock().await;
            if game.status == GameStatus::Playing
                && let Some(deadline) = game.turn_deadline
                && deadline <= now
            {
                Some(game.turn_generation)
            } else {
                None
            }
        };
        let Some(generation) = expired else {
            continue;
        };

        match core.expire_turn(&game_id, generation).await {
            TimeoutOutcome::BotFallback { generation } => {
                bots.request_fallback(&game_id, generation).await;
            }
            TimeoutOutcome::AutoPlayed { report } => {
                if report.removed {
                    bots.stop(&game_id).await;
                } else if let Some(generation) = report.bot_turn {
                    bots.nudge(&game_id, generation).await;
                }
            }
            TimeoutOutcome::Forfeited => {
                bots.stop(&game_id).await;
            }
            TimeoutOutcome::Skip => {}
        }
    }
}

pub async fn run_watchdog(core: Arc<GameCore>, bots: Arc<BotSupervisor>, interval_seconds: u64) {
    let mut ticker = interval(Duration::from_secs(interval_seconds.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(interval_seconds, "turn watchdog running");
    loop {
        ticker.tick().await;
        scan_expired_turns(&core, &bots).await;
        bots.reap().await;
    }
}
