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

//! Realtime surface of the engine: the `/ws` endpoint, per-session event
//! channels, cross-node frame mirroring over Redis pub/sub, and the game
//! core that every action funnels through, whether it came from a socket,
//! a bot worker or the watchdog.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use bisca_common::{
    CardRef, ClientEvent, DEFAULT_TURN_TIMEOUT_SECONDS, GameMode, GameStateView, GameStatus,
    PlayerId, ServerEvent, TiePolicy, TimeoutAction,
};
use redis::aio::{ConnectionManager, PubSub};
use redis::{AsyncCommands, Client};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio_stream::StreamExt;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::api::{IdentityVerifier, MatchRecorder, MatchReport, SeatResult};
use crate::bot::{BotDriver, BotSeat, BotSupervisor, Scheduler, fallback_position};
use crate::engine::{GameError, GameInstance, Participant};
use crate::manager::{GameOptions, GameRegistry};
use crate::recovery::{SnapshotStore, discard_snapshot, persist_snapshot};

const BOT_DISPLAY_NAME: &str = "Bisca Bot";
const GUEST_NAME: &str = "Guest";
const MIRROR_CHANNEL_PREFIX: &str = "game:";
const MIRROR_PATTERN: &str = "game:*";

/// Envelope for frames relayed between nodes. `origin` identifies the
/// publishing process so it can skip the echo of its own frames.
#[derive(Debug, Serialize, Deserialize)]
struct MirrorFrame {
    origin: String,
    player_id: PlayerId,
    event: ServerEvent,
}

/// Fan-out for server events. Players connected to this node receive frames
/// through their session channel; everyone else is reached by mirroring the
/// frame over Redis pub/sub on the game's channel.
pub struct Broadcaster {
    origin: String,
    sessions: RwLock<HashMap<PlayerId, mpsc::UnboundedSender<ServerEvent>>>,
    publisher: Option<Mutex<ConnectionManager>>,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Broadcaster::new()
    }
}

impl Broadcaster {
    /// In-process delivery only; single-node deployments and tests.
    pub fn new() -> Self {
        Broadcaster {
            origin: Uuid::new_v4().to_string(),
            sessions: RwLock::new(HashMap::new()),
            publisher: None,
        }
    }

    /// Delivery with the publishing half of the Redis mirror attached. The
    /// consuming half is started separately via [`spawn_mirror_consumer`].
    pub async fn with_mirror(redis_url: &str) -> anyhow::Result<Self> {
        let client = Client::open(redis_url).context("invalid REDIS_URL")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("unable to initialize Redis connection manager")?;
        Ok(Broadcaster {
            origin: Uuid::new_v4().to_string(),
            sessions: RwLock::new(HashMap::new()),
            publisher: Some(Mutex::new(conn)),
        })
    }

    /// Register (or replace) the session channel for a player. A reconnect
    /// supersedes the previous socket.
    pub async fn register(&self, player_id: &str, tx: mpsc::UnboundedSender<ServerEvent>) {
        let replaced = self
            .sessions
            .write()
            .await
            .insert(player_id.to_string(), tx)
            .is_some();
        if replaced {
            info!(player_id = %player_id, "session channel replaced by reconnect");
        }
    }

    /// Drop the session channel, but only while it still belongs to the
    /// closing socket; a reconnect may already have replaced it.
    pub async fn unregister(&self, player_id: &str, tx: &mpsc::UnboundedSender<ServerEvent>) {
        let mut sessions = self.sessions.write().await;
        if let Some(current) = sessions.get(player_id)
            && current.same_channel(tx)
        {
            sessions.remove(player_id);
        }
    }

    /// Deliver to a locally connected session. Returns `false` when the
    /// player has no live channel on this node.
    pub async fn send_local(&self, player_id: &str, event: &ServerEvent) -> bool {
        let dead = {
            let sessions = self.sessions.read().await;
            let Some(tx) = sessions.get(player_id) else {
                return false;
            };
            if tx.send(event.clone()).is_ok() {
                return true;
            }
            tx.clone()
        };
        // Prune the closed channel unless a reconnect already replaced it.
        let mut sessions = self.sessions.write().await;
        if let Some(current) = sessions.get(player_id)
            && current.same_channel(&dead)
        {
            sessions.remove(player_id);
        }
        false
    }

    /// Deliver to a player wherever they are connected: locally when this
    /// node holds their session, otherwise mirrored to the other nodes.
    pub async fn send_to_player(&self, game_id: &str, player_id: &str, event: &ServerEvent) {
        if self.send_local(player_id, event).await {
            return;
        }
        let Some(publisher) = &self.publisher else {
            debug!(player_id = %player_id, "player has no session here and no mirror is configured");
            return;
        };
        let frame = MirrorFrame {
            origin: self.origin.clone(),
            player_id: player_id.to_string(),
            event: event.clone(),
        };
        let payload = match serde_json::to_string(&frame) {
            Ok(payload) => payload,
            Err(error) => {
                warn!(error = %error, "failed to encode mirror frame");
                return;
            }
        };
        let mut conn = publisher.lock().await.clone();
        let channel = format!("{MIRROR_CHANNEL_PREFIX}{game_id}");
        // Publishing happens off the gameplay path; a slow Redis must not
        // delay the move that triggered the frame.
        tokio::spawn(async move {
            if let Err(error) = conn.publish::<_, _, ()>(channel.clone(), payload).await {
                warn!(channel = %channel, error = %error, "failed to publish mirror frame");
            }
        });
    }
}

/// Subscribe to every game channel and deliver mirrored frames to sessions
/// on this node. Runs until the process exits, resubscribing with backoff
/// whenever the connection drops.
pub fn spawn_mirror_consumer(redis_url: String, broadcaster: Arc<Broadcaster>) {
    tokio::spawn(async move {
        let mut attempt: u32 = 0;
        loop {
            let started = std::time::Instant::now();
            match run_mirror_loop(&redis_url, &broadcaster).await {
                Ok(()) => {
                    warn!("mirror subscription ended; resubscribing");
                    attempt = 0;
                }
                Err(error) => {
                    // A subscription that held for a while earns a fresh
                    // backoff schedule.
                    if started.elapsed() > Duration::from_secs(60) {
                        attempt = 0;
                    }
                    attempt = attempt.saturating_add(1);
                    let delay = mirror_retry_delay(attempt);
                    warn!(
                        error = %error,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "mirror subscription failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    });
}

fn mirror_retry_delay(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(6);
    Duration::from_millis(500_u64.saturating_mul(1_u64 << exponent))
}

async fn run_mirror_loop(redis_url: &str, broadcaster: &Broadcaster) -> anyhow::Result<()> {
    let client = Client::open(redis_url).context("invalid REDIS_URL")?;
    let conn_info = client.get_connection_info();

    let addr = match conn_info.addr().clone() {
        redis::ConnectionAddr::Tcp(host, port) => (host, port),
        _ => anyhow::bail!("only TCP Redis addresses are supported for pub/sub"),
    };
    let stream = tokio::net::TcpStream::connect((addr.0.clone(), addr.1))
        .await
        .with_context(|| format!("unable to reach Redis at {}:{}", addr.0, addr.1))?;
    let mut pubsub = PubSub::new(conn_info.redis_settings(), stream)
        .await
        .context("unable to establish Redis pub/sub connection")?;
    pubsub
        .psubscribe(MIRROR_PATTERN)
        .await
        .context("pattern subscribe failed")?;
    info!(pattern = MIRROR_PATTERN, "event mirror subscription established");

    let mut messages = pubsub.into_on_message();
    while let Some(message) = messages.next().await {
        let Ok(payload) = message.get_payload::<String>() else {
            warn!("mirror frame with unreadable payload");
            continue;
        };
        match serde_json::from_str::<MirrorFrame>(&payload) {
            Ok(frame) => {
                if frame.origin == broadcaster.origin {
                    continue;
                }
                broadcaster.send_local(&frame.player_id, &frame.event).await;
            }
            Err(error) => warn!(error = %error, "failed to decode mirror frame"),
        }
    }
    Ok(())
}

/// Table rules fixed at deployment rather than per game.
#[derive(Debug, Clone, Copy)]
pub struct GameRules {
    pub tie_policy: TiePolicy,
    pub timeout_action: TimeoutAction,
    pub turn_timeout_seconds: u64,
}

impl Default for GameRules {
    fn default() -> Self {
        GameRules {
            tie_policy: TiePolicy::NoMark,
            timeout_action: TimeoutAction::AutoPlay,
            turn_timeout_seconds: DEFAULT_TURN_TIMEOUT_SECONDS,
        }
    }
}

/// What a successfully applied action implies for the caller: whether the
/// bot now holds the turn (at which generation), and whether the game was
/// settled and removed.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PlayReport {
    pub bot_turn: Option<u64>,
    pub removed: bool,
}

/// Consequence of an expired turn deadline.
#[derive(Debug, PartialEq)]
pub enum TimeoutOutcome {
    /// The deadline no longer applies; nothing was done.
    Skip,
    /// The bot overran its own turn; the supervisor should force a fallback.
    BotFallback { generation: u64 },
    /// A lowest-card play was forced for the overdue human.
    AutoPlayed { report: PlayReport },
    /// The overdue human forfeited the match.
    Forfeited,
}

#[derive(Debug, Clone, Copy)]
enum PlayActor<'a> {
    Player(&'a str),
    Bot,
}

/// Everything needed to run a game end to end. Socket frames, bot plays and
/// watchdog expirations all funnel through this one struct so validation,
/// persistence and fan-out happen identically no matter who moved.
pub struct GameCore {
    pub registry: Arc<GameRegistry>,
    pub broadcaster: Arc<Broadcaster>,
    pub snapshots: Option<Arc<dyn SnapshotStore>>,
    pub recorder: Option<Arc<dyn MatchRecorder>>,
    pub scheduler: Arc<dyn Scheduler>,
    pub rules: GameRules,
}

impl GameCore {
    fn base_options(&self, mode: GameMode, hand_size: usize, target_marks: u32) -> GameOptions {
        GameOptions {
            mode,
            hand_size,
            target_marks,
            tie_policy: self.rules.tie_policy,
            turn_timeout_seconds: self.rules.turn_timeout_seconds,
        }
    }

    /// Send every human participant their own redacted view of the game.
    async fn broadcast_views(&self, game: &GameInstance) {
        for seat in game.participants.iter().filter(|seat| !seat.is_bot) {
            if let Some(view) = game.view_for(&seat.player_id) {
                self.broadcaster
                    .send_to_player(
                        &game.game_id,
                        &seat.player_id,
                        &ServerEvent::GameState { state: view },
                    )
                    .await;
            }
        }
    }

    /// Tell every human participant their game survived a restart. Sockets
    /// to this process died with it; the mirror carries the frames to any
    /// node still holding one.
    pub async fn announce_recovery(&self, game: &GameInstance) {
        for seat in game.participants.iter().filter(|seat| !seat.is_bot) {
            if let Some(view) = game.view_for(&seat.player_id) {
                self.broadcaster
                    .send_to_player(
                        &game.game_id,
                        &seat.player_id,
                        &ServerEvent::GameRecovered { state: view },
                    )
                    .await;
            }
        }
    }

    /// Create a game for `creator`. Bot games seat the house bot and start
    /// immediately; pvp games stay pending until someone joins.
    pub async fn create_game(
        &self,
        creator_id: &str,
        creator_name: &str,
        mode: GameMode,
        hand_size: usize,
        target_marks: u32,
    ) -> Result<GameInstance, GameError> {
        let now = self.scheduler.now();
        let creator = Participant::seat(creator_id, creator_name, false);
        let handle = self
            .registry
            .create_game(creator, self.base_options(mode, hand_size, target_marks), now)
            .await?;

        let (game_id, seeded) = {
            let mut game = handle.lock().await;
            let seeded = if mode == GameMode::Bot {
                let bot = Participant::seat(
                    format!("bot-{}", Uuid::new_v4()),
                    BOT_DISPLAY_NAME,
                    true,
                );
                let mut rng = rand::rng();
                game.add_opponent(bot, now)
                    .and_then(|()| game.start(&mut rng, now))
            } else {
                Ok(())
            };
            (game.game_id.clone(), seeded.map(|()| game.clone()))
        };
        let snapshot = match seeded {
            Ok(snapshot) => snapshot,
            Err(error) => {
                self.registry.remove(&game_id).await;
                return Err(error);
            }
        };

        persist_snapshot(&self.snapshots, &snapshot);
        info!(
            game_id = %snapshot.game_id,
            player_id = %creator_id,
            mode = ?mode,
            hand_size,
            target_marks,
            "game created"
        );
        Ok(snapshot)
    }

    /// Seat `player` into a pending pvp game and deal the first hands.
    pub async fn join_game(
        &self,
        game_id: &str,
        player_id: &str,
        player_name: &str,
    ) -> Result<GameInstance, GameError> {
        let now = self.scheduler.now();
        let seat = Participant::seat(player_id, player_name, false);
        let handle = self.registry.join_game(game_id, seat, now).await?;
        let snapshot = {
            let mut game = handle.lock().await;
            let mut rng = rand::rng();
            game.start(&mut rng, now)?;
            game.clone()
        };
        persist_snapshot(&self.snapshots, &snapshot);
        info!(game_id = %game_id, player_id = %player_id, "player joined game");
        Ok(snapshot)
    }

    /// Apply a human play. A rejected play changes nothing about the game;
    /// the error maps to a frame for the sender.
    pub async fn apply_play(
        &self,
        game_id: &str,
        player_id: &str,
        card_ref: &CardRef,
    ) -> Result<PlayReport, GameError> {
        match self
            .play_for_turn(game_id, PlayActor::Player(player_id), None, card_ref)
            .await?
        {
            Some(report) => Ok(report),
            // Without a generation pin the stale branch cannot trigger.
            None => Err(GameError::IllegalMove("NOT_YOUR_TURN")),
        }
    }

    /// Validate and apply one play, then fan out the results. `Ok(None)`
    /// means the action was dropped as stale: the turn it was armed for is
    /// already gone. Only generation-pinned plays can be dropped that way.
    async fn play_for_turn(
        &self,
        game_id: &str,
        actor: PlayActor<'_>,
        expected_generation: Option<u64>,
        card_ref: &CardRef,
    ) -> Result<Option<PlayReport>, GameError> {
        let handle = self
            .registry
            .get(game_id)
            .await
            .ok_or(GameError::IllegalMove("GAME_NOT_FOUND"))?;
        let now = self.scheduler.now();

        // Mutate under the game lock; all I/O happens after it is released.
        let (snapshot, outcome) = {
            let mut game = handle.lock().await;
            if let Some(expected) = expected_generation
                && game.turn_generation != expected
            {
                debug!(
                    game_id = %game_id,
                    expected,
                    current = game.turn_generation,
                    "dropping stale play"
                );
                return Ok(None);
            }
            let player_id = match actor {
                PlayActor::Player(player_id) => player_id.to_string(),
                PlayActor::Bot => match game.bot_id() {
                    Some(bot_id) => bot_id,
                    None => return Ok(None),
                },
            };
            match game.play_card(&player_id, card_ref, now) {
                Ok(outcome) => (game.clone(), outcome),
                Err(error @ GameError::Integrity(_)) => {
                    error!(game_id = %game_id, error = %error, "integrity violation; interrupting game");
                    game.interrupt(None, now);
                    let snapshot = game.clone();
                    drop(game);
                    self.annul_game(&snapshot, "INTEGRITY_VIOLATION").await;
                    return Err(error);
                }
                Err(error) => return Err(error),
            }
        };

        persist_snapshot(&self.snapshots, &snapshot);
        self.broadcast_views(&snapshot).await;

        let mut report = PlayReport::default();
        if let Some(trick) = &outcome.trick {
            debug!(game_id = %game_id, winner = %trick.winner, points = trick.points, "trick resolved");
        }
        if let Some(result) = &outcome.finished {
            info!(
                game_id = %game_id,
                winner = ?result.winner,
                match_over = result.match_over,
                "game finished"
            );
            if result.match_over {
                self.settle_match(&snapshot, false).await;
                self.registry.remove(game_id).await;
                discard_snapshot(&self.snapshots, game_id);
                report.removed = true;
            }
        }

        if !report.removed
            && snapshot.status == GameStatus::Playing
            && let (Some(turn), Some(bot_id)) = (&snapshot.current_turn, snapshot.bot_id())
            && *turn == bot_id
        {
            report.bot_turn = Some(snapshot.turn_generation);
        }

        Ok(Some(report))
    }

    /// Redeal for the next game of the match at a player's request.
    pub async fn continue_match(
        &self,
        game_id: &str,
        player_id: &str,
    ) -> Result<PlayReport, GameError> {
        let handle = self
            .registry
            .get(game_id)
            .await
            .ok_or(GameError::IllegalMove("GAME_NOT_FOUND"))?;
        let now = self.scheduler.now();
        let snapshot = {
            let mut game = handle.lock().await;
            let mut rng = rand::rng();
            game.next_round(player_id, &mut rng, now)?;
            game.clone()
        };
        persist_snapshot(&self.snapshots, &snapshot);
        self.broadcast_views(&snapshot).await;
        info!(game_id = %game_id, game_number = snapshot.game_number, "next game dealt");

        let mut report = PlayReport::default();
        if let (Some(turn), Some(bot_id)) = (&snapshot.current_turn, snapshot.bot_id())
            && *turn == bot_id
        {
            report.bot_turn = Some(snapshot.turn_generation);
        }
        Ok(report)
    }

    /// A player abandoning a live game forfeits the match to the opponent.
    /// Pending games are simply withdrawn.
    pub async fn leave_game(&self, game_id: &str, player_id: &str) -> Result<(), GameError> {
        let handle = self
            .registry
            .get(game_id)
            .await
            .ok_or(GameError::IllegalMove("GAME_NOT_FOUND"))?;
        let now = self.scheduler.now();
        let snapshot = {
            let mut game = handle.lock().await;
            if !game.is_participant(player_id) {
                return Err(GameError::IllegalMove("NOT_A_PARTICIPANT"));
            }
            game.interrupt(Some(player_id), now);
            game.clone()
        };
        info!(game_id = %game_id, player_id = %player_id, "player left game");
        self.settle_match(&snapshot, true).await;
        self.annul_game(&snapshot, "PLAYER_LEFT").await;
        Ok(())
    }

    /// Decide and perform the consequence of an expired turn deadline.
    /// Everything is re-validated under the lock first: the player may have
    /// moved between the watchdog's scan and this call.
    pub async fn expire_turn(&self, game_id: &str, generation: u64) -> TimeoutOutcome {
        let Some(handle) = self.registry.get(game_id).await else {
            return TimeoutOutcome::Skip;
        };
        let now = self.scheduler.now();

        let (holder, holder_is_bot, humans) = {
            let game = handle.lock().await;
            if game.status != GameStatus::Playing || game.turn_generation != generation {
                return TimeoutOutcome::Skip;
            }
            let Some(deadline) = game.turn_deadline else {
                return TimeoutOutcome::Skip;
            };
            if deadline > now {
                return TimeoutOutcome::Skip;
            }
            let Some(holder) = game.current_turn.clone() else {
                return TimeoutOutcome::Skip;
            };
            let is_bot = game.participant(&holder).is_some_and(|seat| seat.is_bot);
            let humans: Vec<PlayerId> = game
                .participants
                .iter()
                .filter(|seat| !seat.is_bot)
                .map(|seat| seat.player_id.clone())
                .collect();
            (holder, is_bot, humans)
        };

        if holder_is_bot {
            return TimeoutOutcome::BotFallback { generation };
        }

        warn!(game_id = %game_id, player_id = %holder, "turn deadline expired");
        let notice = ServerEvent::GameTimeout {
            game_id: game_id.to_string(),
            reason: "TURN_TIMEOUT".to_string(),
            player_id: Some(holder.clone()),
        };
        for player_id in &humans {
            self.broadcaster
                .send_to_player(game_id, player_id, &notice)
                .await;
        }

        match self.rules.timeout_action {
            TimeoutAction::AutoPlay => {
                let position = {
                    let game = handle.lock().await;
                    if game.turn_generation != generation {
                        return TimeoutOutcome::Skip;
                    }
                    fallback_position(&game.legal_cards(&holder))
                };
                let Some(position) = position else {
                    return TimeoutOutcome::Skip;
                };
                match self
                    .play_for_turn(
                        game_id,
                        PlayActor::Player(&holder),
                        Some(generation),
                        &CardRef::Index(position),
                    )
                    .await
                {
                    Ok(Some(report)) => TimeoutOutcome::AutoPlayed { report },
                    Ok(None) => TimeoutOutcome::Skip,
                    Err(error) => {
                        warn!(game_id = %game_id, error = %error, "forced play rejected");
                        TimeoutOutcome::Skip
                    }
                }
            }
            TimeoutAction::Forfeit => {
                let snapshot = {
                    let mut game = handle.lock().await;
                    if game.turn_generation != generation {
                        return TimeoutOutcome::Skip;
                    }
                    game.interrupt(Some(&holder), now);
                    game.clone()
                };
                self.settle_match(&snapshot, true).await;
                self.annul_game(&snapshot, "TURN_TIMEOUT").await;
                TimeoutOutcome::Forfeited
            }
        }
    }

    /// Report a decided or forfeited match to the platform and forward the
    /// resulting balance changes. A recording failure is logged, never
    /// fatal: the game itself is already decided.
    async fn settle_match(&self, game: &GameInstance, forfeit: bool) {
        let Some(recorder) = &self.recorder else {
            return;
        };
        if game.participants.len() < 2 {
            return;
        }
        let report = MatchReport {
            match_id: game.match_id.clone(),
            game_id: game.game_id.clone(),
            winner: game.match_winner.clone(),
            forfeit,
            games_played: game.game_number,
            seats: game
                .participants
                .iter()
                .map(|seat| SeatResult {
                    player_id: seat.player_id.clone(),
                    name: seat.name.clone(),
                    is_bot: seat.is_bot,
                    score: seat.score,
                    marks: seat.marks,
                })
                .collect(),
        };
        match recorder.record_match(&report).await {
            Ok(changes) => {
                for change in changes {
                    self.broadcaster
                        .send_to_player(
                            &game.game_id,
                            &change.user_id,
                            &ServerEvent::BalanceUpdate {
                                user_id: change.user_id.clone(),
                                balance: change.balance,
                            },
                        )
                        .await;
                }
            }
            Err(error) => {
                warn!(game_id = %game.game_id, error = %error, "failed to record match result");
            }
        }
    }

    /// Tell the humans the game is gone, then drop it from the registry and
    /// the snapshot store.
    async fn annul_game(&self, game: &GameInstance, reason: &str) {
        let event = ServerEvent::GameAnnulled {
            game_id: game.game_id.clone(),
            reason: reason.to_string(),
        };
        for seat in game.participants.iter().filter(|seat| !seat.is_bot) {
            self.broadcaster
                .send_to_player(&game.game_id, &seat.player_id, &event)
                .await;
        }
        self.registry.remove(&game.game_id).await;
        discard_snapshot(&self.snapshots, &game.game_id);
        info!(game_id = %game.game_id, reason, "game annulled");
    }
}

#[async_trait]
impl BotDriver for GameCore {
    async fn bot_seat(&self, game_id: &str) -> Option<BotSeat> {
        let handle = self.registry.get(game_id).await?;
        let game = handle.lock().await;
        if game.status != GameStatus::Playing {
            return None;
        }
        let bot_id = game.bot_id()?;
        if game.current_turn.as_deref() != Some(bot_id.as_str()) {
            return None;
        }
        let trump = game.trump_suit()?;
        Some(BotSeat {
            game_id: game.game_id.clone(),
            player_id: bot_id.clone(),
            generation: game.turn_generation,
            trump,
            led: game.table.first().map(|play| play.card),
            legal: game.legal_cards(&bot_id),
        })
    }

    async fn apply_bot_play(
        &self,
        game_id: &str,
        generation: u64,
        position: usize,
    ) -> anyhow::Result<bool> {
        match self
            .play_for_turn(
                game_id,
                PlayActor::Bot,
                Some(generation),
                &CardRef::Index(position),
            )
            .await
        {
            Ok(Some(_)) => Ok(true),
            Ok(None) => Ok(false),
            Err(error) => Err(anyhow::Error::new(error)),
        }
    }

    async fn escalate(&self, game_id: &str, detail: &str) {
        error!(game_id = %game_id, detail, "abandoning game after bot failure");
        let Some(handle) = self.registry.get(game_id).await else {
            return;
        };
        let now = self.scheduler.now();
        let snapshot = {
            let mut game = handle.lock().await;
            let offender = game.bot_id();
            game.interrupt(offender.as_deref(), now);
            game.clone()
        };
        self.settle_match(&snapshot, true).await;
        self.annul_game(&snapshot, "BOT_FAILURE").await;
    }

    async fn game_alive(&self, game_id: &str) -> bool {
        self.registry.get(game_id).await.is_some()
    }
}

/// An authenticated (or guest) socket identity.
#[derive(Debug, Clone)]
struct Session {
    player_id: PlayerId,
    name: String,
}

#[derive(Clone)]
pub struct AppState {
    pub core: Arc<GameCore>,
    pub bots: Arc<BotSupervisor>,
    pub verifier: Option<Arc<dyn IdentityVerifier>>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"ok": true, "service": "game-server"}))
}

async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<ServerEvent>();
    let mut session: Option<Session> = None;

    loop {
        tokio::select! {
            inbound = socket.recv() => {
                let message = match inbound {
                    Some(Ok(message)) => message,
                    Some(Err(error)) => {
                        debug!(error = %error, "websocket receive failed");
                        break;
                    }
                    None => break,
                };
                match message {
                    Message::Text(text) => match serde_json::from_str::<ClientEvent>(&text) {
                        Ok(event) => dispatch_event(&state, &mut session, &events_tx, event).await,
                        Err(error) => {
                            debug!(error = %error, "rejecting unparseable client frame");
                            send_error(&events_tx, "INVALID_EVENT", "could not parse event frame");
                        }
                    },
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            outbound = events_rx.recv() => {
                // The sender half lives on this stack; the channel cannot
                // close while the loop runs.
                let Some(event) = outbound else {
                    break;
                };
                if send_event(&mut socket, &event).await.is_err() {
                    break;
                }
            }
        }
    }

    if let Some(session) = &session {
        state
            .core
            .broadcaster
            .unregister(&session.player_id, &events_tx)
            .await;
        info!(player_id = %session.player_id, "session closed");
    }
}

async fn send_event(socket: &mut WebSocket, event: &ServerEvent) -> Result<(), ()> {
    let payload = match serde_json::to_string(event) {
        Ok(payload) => payload,
        Err(error) => {
            warn!(error = %error, "failed to encode server event");
            return Ok(());
        }
    };
    socket
        .send(Message::Text(payload.into()))
        .await
        .map_err(|error| {
            debug!(error = %error, "websocket send failed; dropping session");
        })
}

fn send_error(reply: &mpsc::UnboundedSender<ServerEvent>, code: &str, message: &str) {
    let _ = reply.send(ServerEvent::Error {
        code: code.to_string(),
        message: message.to_string(),
    });
}

fn send_game_error(reply: &mpsc::UnboundedSender<ServerEvent>, error: &GameError) {
    send_error(reply, error.code(), &error.to_string());
}

/// Route one inbound frame. Replies and errors go back through the session
/// channel; events for other players go through the broadcaster.
async fn dispatch_event(
    state: &AppState,
    session: &mut Option<Session>,
    reply: &mpsc::UnboundedSender<ServerEvent>,
    event: ClientEvent,
) {
    match event {
        ClientEvent::Join { token, name } => {
            handle_join(state, session, reply, token, name).await;
        }
        event => {
            let Some(session) = session.clone() else {
                send_error(reply, "NOT_AUTHENTICATED", "join before sending game events");
                return;
            };
            handle_session_event(state, &session, reply, event).await;
        }
    }
}

async fn handle_session_event(
    state: &AppState,
    session: &Session,
    reply: &mpsc::UnboundedSender<ServerEvent>,
    event: ClientEvent,
) {
    match event {
        // `join` is dispatched before a session exists.
        ClientEvent::Join { .. } => {}
        ClientEvent::CreateGame {
            hand_size,
            mode,
            target_marks,
        } => {
            handle_create_game(state, session, reply, mode, hand_size, target_marks).await;
        }
        ClientEvent::GetGames => {
            let games = state.core.registry.pending_listings().await;
            let _ = reply.send(ServerEvent::Games { games });
        }
        ClientEvent::JoinGame { game_id } => {
            handle_join_game(state, session, reply, &game_id).await;
        }
        ClientEvent::PlayCard {
            game_id,
            card_index_or_face,
        } => {
            handle_play_card(state, session, reply, &game_id, &card_index_or_face).await;
        }
        ClientEvent::LeaveGame { game_id } => {
            handle_leave_game(state, session, reply, &game_id).await;
        }
        ClientEvent::NextRound { game_id } => {
            handle_next_round(state, session, reply, &game_id).await;
        }
    }
}

async fn handle_join(
    state: &AppState,
    session: &mut Option<Session>,
    reply: &mpsc::UnboundedSender<ServerEvent>,
    token: Option<String>,
    name: Option<String>,
) {
    let identity = match (&state.verifier, token) {
        (Some(verifier), Some(token)) => match verifier.verify(&token).await {
            Ok(identity) => Some(identity),
            Err(error) => {
                warn!(error = %error, "token verification failed");
                send_error(reply, "AUTH_FAILED", "token could not be verified");
                return;
            }
        },
        _ => None,
    };

    let (player_id, display_name, balance) = match identity {
        Some(identity) => (identity.user_id, identity.name, Some(identity.balance)),
        None => (
            format!("guest-{}", Uuid::new_v4()),
            name.unwrap_or_else(|| GUEST_NAME.to_string()),
            None,
        ),
    };

    // A repeated join replaces the socket's identity; the old registration
    // must go with it or its events would land on the wrong player.
    if let Some(previous) = session.take()
        && previous.player_id != player_id
    {
        state
            .core
            .broadcaster
            .unregister(&previous.player_id, reply)
            .await;
    }

    state
        .core
        .broadcaster
        .register(&player_id, reply.clone())
        .await;
    *session = Some(Session {
        player_id: player_id.clone(),
        name: display_name,
    });
    info!(player_id = %player_id, "session joined");

    if let Some(balance) = balance {
        let _ = reply.send(ServerEvent::BalanceUpdate {
            user_id: player_id.clone(),
            balance,
        });
    }

    // A player with a live game goes straight back into it; a player whose
    // game lives elsewhere gets the durable copy; everyone else the lobby.
    if let Some((game_id, handle)) = state.core.registry.game_for_player(&player_id).await {
        let view = handle.lock().await.view_for(&player_id);
        match view {
            Some(view) => {
                let _ = reply.send(ServerEvent::GameRecovered { state: view });
                info!(game_id = %game_id, player_id = %player_id, "session rejoined live game");
            }
            None => {
                error!(game_id = %game_id, player_id = %player_id, "indexed player has no seat in game");
                let _ = reply.send(ServerEvent::RecoveryError {
                    detail: "your game could not be restored".to_string(),
                    redirect: "/lobby".to_string(),
                });
            }
        }
    } else if let Some(view) = recover_from_snapshot(state, &player_id).await {
        info!(game_id = %view.game_id, player_id = %player_id, "session resumed from a durable snapshot");
        let _ = reply.send(ServerEvent::GameRecovered { state: view });
    } else {
        let games = state.core.registry.pending_listings().await;
        let _ = reply.send(ServerEvent::Games { games });
    }
}

/// A session with no game in this process may still own one: another node
/// may hold it, or this process may have failed to adopt its snapshot on
/// startup. The durable copy is replayed read-only; ownership stays put.
async fn recover_from_snapshot(state: &AppState, player_id: &str) -> Option<GameStateView> {
    let snapshots = state.core.snapshots.as_ref()?;
    let games = match snapshots.list_live().await {
        Ok(games) => games,
        Err(error) => {
            warn!(player_id = %player_id, error = %error, "snapshot lookup on reconnect failed");
            return None;
        }
    };
    games
        .into_iter()
        .filter(|game| {
            game.status != GameStatus::Interrupted
                && !game.match_over
                && game.is_participant(player_id)
        })
        .max_by_key(|game| game.updated_at)
        .and_then(|game| game.view_for(player_id))
}

async fn handle_create_game(
    state: &AppState,
    session: &Session,
    reply: &mpsc::UnboundedSender<ServerEvent>,
    mode: GameMode,
    hand_size: usize,
    target_marks: u32,
) {
    match state
        .core
        .create_game(
            &session.player_id,
            &session.name,
            mode,
            hand_size,
            target_marks,
        )
        .await
    {
        Ok(snapshot) => {
            if let Some(view) = snapshot.view_for(&session.player_id) {
                let _ = reply.send(ServerEvent::GameJoined { state: view });
            }
        }
        Err(error) => send_game_error(reply, &error),
    }
}

async fn handle_join_game(
    state: &AppState,
    session: &Session,
    reply: &mpsc::UnboundedSender<ServerEvent>,
    game_id: &str,
) {
    match state
        .core
        .join_game(game_id, &session.player_id, &session.name)
        .await
    {
        Ok(snapshot) => {
            if let Some(view) = snapshot.view_for(&session.player_id) {
                let _ = reply.send(ServerEvent::GameJoined { state: view });
            }
            if let Some(opponent) = snapshot.opponent_of(&session.player_id)
                && let Some(view) = snapshot.view_for(&opponent.player_id)
            {
                state
                    .core
                    .broadcaster
                    .send_to_player(
                        game_id,
                        &opponent.player_id,
                        &ServerEvent::GameState { state: view },
                    )
                    .await;
            }
        }
        Err(error) => send_game_error(reply, &error),
    }
}

async fn handle_play_card(
    state: &AppState,
    session: &Session,
    reply: &mpsc::UnboundedSender<ServerEvent>,
    game_id: &str,
    card_ref: &CardRef,
) {
    match state
        .core
        .apply_play(game_id, &session.player_id, card_ref)
        .await
    {
        Ok(report) => {
            if report.removed {
                state.bots.stop(game_id).await;
            } else if let Some(generation) = report.bot_turn {
                state.bots.nudge(game_id, generation).await;
            }
        }
        Err(error) => {
            if matches!(error, GameError::Integrity(_)) {
                state.bots.stop(game_id).await;
            }
            send_game_error(reply, &error);
        }
    }
}

async fn handle_leave_game(
    state: &AppState,
    session: &Session,
    reply: &mpsc::UnboundedSender<ServerEvent>,
    game_id: &str,
) {
    match state.core.leave_game(game_id, &session.player_id).await {
        Ok(()) => state.bots.stop(game_id).await,
        Err(error) => send_game_error(reply, &error),
    }
}

async fn handle_next_round(
    state: &AppState,
    session: &Session,
    reply: &mpsc::UnboundedSender<ServerEvent>,
    game_id: &str,
) {
    match state.core.continue_match(game_id, &session.player_id).await {
        Ok(report) => {
            if let Some(generation) = report.bot_turn {
                state.bots.nudge(game_id, generation).await;
            }
        }
        Err(error) => send_game_error(reply, &error),
    }
}
