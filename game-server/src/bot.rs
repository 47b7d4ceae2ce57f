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
use std::time::Duration;

use async_trait::async_trait;
use bisca_common::{
    ALL_SUITS, Card, DEFAULT_BOT_MAX_RETRIES, DEFAULT_BOT_RETRY_BASE_MS, DEFAULT_BOT_RETRY_CAP_MS,
    DEFAULT_BOT_THINK_DELAY_MS, DEFAULT_BOT_TIMEOUT_SECONDS, PlayerId, Suit,
};
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, info, warn};

/// Clock and sleep source for everything time-driven on the bot and watchdog
/// paths, so tests run without real wall-clock waits.
#[async_trait]
pub trait Scheduler: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
    async fn sleep(&self, duration: Duration);
}

pub struct TokioScheduler;

#[async_trait]
impl Scheduler for TokioScheduler {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// What the bot sees when asked to move: the led card (if following), the
/// legal subset of its hand, and the trump suit. `generation` pins the play
/// to one specific turn so stale decisions are dropped instead of applied.
#[derive(Debug, Clone, PartialEq)]
pub struct BotSeat {
    pub game_id: String,
    pub player_id: PlayerId,
    pub generation: u64,
    pub trump: Suit,
    pub led: Option<Card>,
    pub legal: Vec<(usize, Card)>,
}

/// A move source. The production implementation is the fixed heuristic
/// below; tests substitute scripted and unresponsive ones.
#[async_trait]
pub trait BotPlayer: Send + Sync {
    async fn choose(&self, seat: &BotSeat) -> anyhow::Result<usize>;
}

pub struct HeuristicBot;

#[async_trait]
impl BotPlayer for HeuristicBot {
    async fn choose(&self, seat: &BotSeat) -> anyhow::Result<usize> {
        choose_play(seat).ok_or_else(|| anyhow::anyhow!("no legal card to choose from"))
    }
}

/// Everything a bot play needs from the rest of the engine. The worker never
/// touches a game directly; all reads and mutations go through here so turn
/// validation stays behind the game lock.
#[async_trait]
pub trait BotDriver: Send + Sync {
    /// Current seat snapshot, or `None` when it is not the bot's turn.
    async fn bot_seat(&self, game_id: &str) -> Option<BotSeat>;

    /// Apply the chosen hand position. `Ok(false)` means the turn moved on
    /// and the play was dropped; `Err` means the game rejected it outright.
    async fn apply_bot_play(
        &self,
        game_id: &str,
        generation: u64,
        position: usize,
    ) -> anyhow::Result<bool>;

    /// Abandon the game after the bot failed beyond recovery.
    async fn escalate(&self, game_id: &str, detail: &str);

    async fn game_alive(&self, game_id: &str) -> bool;
}

fn suit_order(suit: Suit) -> usize {
    ALL_SUITS.iter().position(|s| *s == suit).unwrap_or(0)
}

// Lowest point value first, then lowest rank, then fixed suit order, so
// "cheapest card" is a total order and the strategy stays deterministic.
fn discard_key(card: Card) -> (u32, u8, usize) {
    (card.points(), card.rank(), suit_order(card.suit))
}

fn beats_lead(card: Card, led: Card) -> bool {
    card.suit == led.suit && card.rank() > led.rank()
}

/// Response priority cascade, applied to the legal subset of the hand:
/// 1. take a non-trump lead with the highest same-suit winner;
/// 2. on a worthless lead, shed the cheapest non-winning non-trump card;
/// 3. overtrump with the smallest trump that still wins;
/// 4. steal a non-trump lead with the smallest trump;
/// 5. otherwise dump the cheapest non-trump card;
/// 6. with only trumps left, play the lowest-ranked one.
pub fn choose_response(led: Card, legal: &[(usize, Card)], trump: Suit) -> Option<usize> {
    if led.suit != trump
        && let Some((pos, _)) = legal
            .iter()
            .filter(|(_, c)| beats_lead(*c, led))
            .max_by_key(|(_, c)| c.rank())
    {
        return Some(*pos);
    }

    if led.points() == 0
        && let Some((pos, _)) = legal
            .iter()
            .filter(|(_, c)| c.suit != trump && !beats_lead(*c, led))
            .min_by_key(|(_, c)| discard_key(*c))
    {
        return Some(*pos);
    }

    if led.suit == trump
        && let Some((pos, _)) = legal
            .iter()
            .filter(|(_, c)| c.suit == trump && c.rank() > led.rank())
            .min_by_key(|(_, c)| c.rank())
    {
        return Some(*pos);
    }

    if led.suit != trump
        && let Some((pos, _)) = legal
            .iter()
            .filter(|(_, c)| c.suit == trump)
            .min_by_key(|(_, c)| c.rank())
    {
        return Some(*pos);
    }

    if let Some((pos, _)) = legal
        .iter()
        .filter(|(_, c)| c.suit != trump)
        .min_by_key(|(_, c)| discard_key(*c))
    {
        return Some(*pos);
    }

    legal
        .iter()
        .min_by_key(|(_, c)| c.rank())
        .map(|(pos, _)| *pos)
}

/// Leading, the bot opens cheap: lowest-value non-trump if it holds one,
/// otherwise its lowest trump.
pub fn choose_lead(legal: &[(usize, Card)], trump: Suit) -> Option<usize> {
    if let Some((pos, _)) = legal
        .iter()
        .filter(|(_, c)| c.suit != trump)
        .min_by_key(|(_, c)| discard_key(*c))
    {
        return Some(*pos);
    }
    legal
        .iter()
        .min_by_key(|(_, c)| c.rank())
        .map(|(pos, _)| *pos)
}

pub fn choose_play(seat: &BotSeat) -> Option<usize> {
    match seat.led {
        Some(led) => choose_response(led, &seat.legal, seat.trump),
        None => choose_lead(&seat.legal, seat.trump),
    }
}

/// Last-resort play when the strategy is unusable: the lowest-ranked legal
/// card.
pub fn fallback_position(legal: &[(usize, Card)]) -> Option<usize> {
    legal
        .iter()
        .min_by_key(|(_, c)| (c.rank(), suit_order(c.suit)))
        .map(|(pos, _)| *pos)
}

#[derive(Debug, Clone, Copy)]
pub struct BotSettings {
    pub think_delay: Duration,
    pub response_timeout: Duration,
    pub max_retries: u32,
    pub retry_base_ms: u64,
    pub retry_cap_ms: u64,
}

impl Default for BotSettings {
    fn default() -> Self {
        BotSettings {
            think_delay: Duration::from_millis(DEFAULT_BOT_THINK_DELAY_MS),
            response_timeout: Duration::from_secs(DEFAULT_BOT_TIMEOUT_SECONDS),
            max_retries: DEFAULT_BOT_MAX_RETRIES,
            retry_base_ms: DEFAULT_BOT_RETRY_BASE_MS,
            retry_cap_ms: DEFAULT_BOT_RETRY_CAP_MS,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum WorkerMsg {
    Nudge { generation: u64 },
    Fallback { generation: u64 },
}

struct BotWorkerHandle {
    stop_tx: Option<oneshot::Sender<()>>,
    update_tx: mpsc::UnboundedSender<WorkerMsg>,
    join: tokio::task::JoinHandle<()>,
}

/// Owns one worker task per live bot game. Workers are nudged when the turn
/// passes to the bot and told to force a fallback when the watchdog sees the
/// bot overrun its own deadline.
pub struct BotSupervisor {
    workers: Mutex<HashMap<String, BotWorkerHandle>>,
    bot: Arc<dyn BotPlayer>,
    driver: Arc<dyn BotDriver>,
    scheduler: Arc<dyn Scheduler>,
    settings: BotSettings,
}

impl BotSupervisor {
    pub fn new(
        bot: Arc<dyn BotPlayer>,
        driver: Arc<dyn BotDriver>,
        scheduler: Arc<dyn Scheduler>,
        settings: BotSettings,
    ) -> Self {
        BotSupervisor {
            workers: Mutex::new(HashMap::new()),
            bot,
            driver,
            scheduler,
            settings,
        }
    }

    pub async fn nudge(&self, game_id: &str, generation: u64) {
        self.send(game_id, WorkerMsg::Nudge { generation }).await;
    }

    pub async fn request_fallback(&self, game_id: &str, generation: u64) {
        self.send(game_id, WorkerMsg::Fallback { generation }).await;
    }

    async fn send(&self, game_id: &str, msg: WorkerMsg) {
        let mut workers = self.workers.lock().await;
        let handle = workers
            .entry(game_id.to_string())
            .or_insert_with(|| self.spawn(game_id));
        if handle.update_tx.send(msg).is_err() {
            let fresh = self.spawn(game_id);
            let _ = fresh.update_tx.send(msg);
            workers.insert(game_id.to_string(), fresh);
        }
    }

    fn spawn(&self, game_id: &str) -> BotWorkerHandle {
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let (update_tx, update_rx) = mpsc::unbounded_channel::<WorkerMsg>();
        let worker = BotWorker {
            game_id: game_id.to_string(),
            bot: self.bot.clone(),
            driver: self.driver.clone(),
            scheduler: self.scheduler.clone(),
            settings: self.settings,
        };
        let join = tokio::spawn(async move {
            worker.run(stop_rx, update_rx).await;
        });
        info!(game_id = %game_id, "started bot worker");
        BotWorkerHandle {
            stop_tx: Some(stop_tx),
            update_tx,
            join,
        }
    }

    pub async fn stop(&self, game_id: &str) {
        let maybe_worker = {
            let mut workers = self.workers.lock().await;
            workers.remove(game_id)
        };

        if let Some(mut worker) = maybe_worker {
            if let Some(stop_tx) = worker.stop_tx.take() {
                let _ = stop_tx.send(());
            }
            worker.join.abort();
            info!(game_id = %game_id, "stopped bot worker");
        }
    }

    /// Drop handles whose task already exited (the game is gone). Called
    /// from the watchdog tick.
    pub async fn reap(&self) {
        let mut workers = self.workers.lock().await;
        workers.retain(|_, handle| !handle.join.is_finished());
    }

    #[cfg(test)]
    pub async fn worker_count(&self) -> usize {
        self.workers.lock().await.len()
    }
}

struct BotWorker {
    game_id: String,
    bot: Arc<dyn BotPlayer>,
    driver: Arc<dyn BotDriver>,
    scheduler: Arc<dyn Scheduler>,
    settings: BotSettings,
}

impl BotWorker {
    async fn run(
        self,
        mut stop_rx: oneshot::Receiver<()>,
        mut update_rx: mpsc::UnboundedReceiver<WorkerMsg>,
    ) {
        loop {
            tokio::select! {
                _ = &mut stop_rx => {
                    break;
                }
                msg = update_rx.recv() => {
                    match msg {
                        None => break,
                        Some(WorkerMsg::Nudge { generation }) => {
                            self.handle_nudge(generation).await;
                        }
                        Some(WorkerMsg::Fallback { generation }) => {
                            self.handle_fallback(generation).await;
                        }
                    }
                    if !self.driver.game_alive(&self.game_id).await {
                        debug!(game_id = %self.game_id, "bot worker exiting; game is gone");
                        break;
                    }
                }
            }
        }
    }

    /// Play the turn the nudge was armed for, then keep playing for as long
    /// as the turn stays with the bot (a trick win leads straight into the
    /// next lead).
    async fn handle_nudge(&self, generation: u64) {
        let mut expected = generation;
        loop {
            self.scheduler.sleep(self.settings.think_delay).await;
            let Some(seat) = self.driver.bot_seat(&self.game_id).await else {
                return;
            };
            if seat.generation != expected {
                debug!(
                    game_id = %self.game_id,
                    expected,
                    current = seat.generation,
                    "bot nudge superseded"
                );
                return;
            }

            match self.confirm_play(&seat).await {
                Ok(position) => {
                    if !self.apply_strategy_play(&seat, position).await {
                        return;
                    }
                }
                Err(error) => {
                    warn!(
                        game_id = %self.game_id,
                        error = %error,
                        "bot strategy failed after retries; forcing fallback play"
                    );
                    self.force_fallback(&seat).await;
                    return;
                }
            }

            let Some(next) = self.driver.bot_seat(&self.game_id).await else {
                return;
            };
            expected = next.generation;
        }
    }

    async fn handle_fallback(&self, generation: u64) {
        let Some(seat) = self.driver.bot_seat(&self.game_id).await else {
            return;
        };
        if seat.generation != generation {
            debug!(
                game_id = %self.game_id,
                expected = generation,
                current = seat.generation,
                "bot fallback request superseded"
            );
            return;
        }
        warn!(game_id = %self.game_id, generation, "forcing bot fallback play on watchdog expiry");
        self.force_fallback(&seat).await;
    }

    /// One confirmed strategy decision: each attempt races the bot against
    /// the response timeout, failures back off exponentially, and the retry
    /// budget is hard.
    async fn confirm_play(&self, seat: &BotSeat) -> anyhow::Result<usize> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let outcome = tokio::select! {
                biased;
                result = self.bot.choose(seat) => result,
                _ = self.scheduler.sleep(self.settings.response_timeout) => {
                    Err(anyhow::anyhow!(
                        "bot response timed out after {:?}",
                        self.settings.response_timeout
                    ))
                }
            };

            match outcome {
                Ok(position) => return Ok(position),
                Err(error) => {
                    if attempt >= self.settings.max_retries {
                        return Err(
                            error.context(format!("bot gave no usable play in {attempt} attempts"))
                        );
                    }
                    let backoff = self
                        .settings
                        .retry_base_ms
                        .saturating_mul(2_u64.pow(attempt - 1))
                        .min(self.settings.retry_cap_ms);
                    warn!(
                        game_id = %self.game_id,
                        attempt,
                        backoff_ms = backoff,
                        error = %error,
                        "bot attempt failed; backing off"
                    );
                    self.scheduler.sleep(Duration::from_millis(backoff)).await;
                }
            }
        }
    }

    async fn apply_strategy_play(&self, seat: &BotSeat, position: usize) -> bool {
        match self
            .driver
            .apply_bot_play(&self.game_id, seat.generation, position)
            .await
        {
            Ok(true) => true,
            Ok(false) => {
                debug!(game_id = %self.game_id, "bot play dropped; turn moved on");
                false
            }
            Err(error) => {
                warn!(
                    game_id = %self.game_id,
                    position,
                    error = %error,
                    "bot strategy play rejected; forcing fallback play"
                );
                self.force_fallback(seat).await;
                false
            }
        }
    }

    async fn force_fallback(&self, seat: &BotSeat) {
        let Some(position) = fallback_position(&seat.legal) else {
            self.driver
                .escalate(&self.game_id, "bot has no legal card to fall back on")
                .await;
            return;
        };
        match self
            .driver
            .apply_bot_play(&self.game_id, seat.generation, position)
            .await
        {
            Ok(true) => {
                info!(game_id = %self.game_id, position, "bot fallback play applied");
            }
            Ok(false) => {
                debug!(game_id = %self.game_id, "bot fallback dropped; turn moved on");
            }
            Err(error) => {
                warn!(
                    game_id = %self.game_id,
                    position,
                    error = %error,
                    "bot fallback play rejected; interrupting game"
                );
                self.driver
                    .escalate(&self.game_id, "bot fallback play rejected")
                    .await;
            }
        }
    }
}
