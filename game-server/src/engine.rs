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

use std::collections::VecDeque;
use std::fmt;

use bisca_common::{
    Card, CardRef, DECK_SIZE, GameListing, GameMode, GameStateView, GameStatus, OpponentView,
    PlayerId, SeatView, Suit, TablePlayView, TiePolicy, TrickWinner, hand_has_suit, new_deck,
    parse_face, resolve_trick,
};
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Rejections carry a SCREAMING_SNAKE_CASE reason code that goes back to the
/// offending client verbatim. Integrity faults are fatal to the one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GameError {
    IllegalMove(&'static str),
    Integrity(String),
}

impl GameError {
    pub fn code(&self) -> &str {
        match self {
            GameError::IllegalMove(reason) => reason,
            GameError::Integrity(_) => "INTEGRITY_VIOLATION",
        }
    }
}

impl fmt::Display for GameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GameError::IllegalMove(reason) => write!(f, "illegal move: {reason}"),
            GameError::Integrity(detail) => write!(f, "integrity violation: {detail}"),
        }
    }
}

impl std::error::Error for GameError {}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Participant {
    pub player_id: PlayerId,
    pub name: String,
    pub is_bot: bool,
    pub hand: Vec<Card>,
    pub collected: Vec<Card>,
    pub score: u32,
    pub marks: u32,
}

impl Participant {
    pub fn seat(player_id: impl Into<PlayerId>, name: impl Into<String>, is_bot: bool) -> Self {
        Participant {
            player_id: player_id.into(),
            name: name.into(),
            is_bot,
            hand: Vec::new(),
            collected: Vec::new(),
            score: 0,
            marks: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TablePlay {
    pub player_id: PlayerId,
    pub card: Card,
}

/// A completed trick, surfaced so callers can log and notify.
#[derive(Debug, Clone, PartialEq)]
pub struct TrickSummary {
    pub winner: PlayerId,
    pub points: u32,
}

/// A finished game within the match.
#[derive(Debug, Clone, PartialEq)]
pub struct GameResult {
    pub winner: Option<PlayerId>,
    pub match_over: bool,
    pub match_winner: Option<PlayerId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlayOutcome {
    pub trick: Option<TrickSummary>,
    pub finished: Option<GameResult>,
}

/// One match's authoritative state. Holds no transport or task handles, so
/// the whole struct is the persisted snapshot. All mutation goes through the
/// operations below, behind the registry's per-game lock.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GameInstance {
    pub game_id: String,
    pub match_id: String,
    pub status: GameStatus,
    pub mode: GameMode,
    pub hand_size: usize,
    pub target_marks: u32,
    pub tie_policy: TiePolicy,
    pub turn_timeout_seconds: u64,
    pub participants: Vec<Participant>,
    pub deck: VecDeque<Card>,
    pub trump_card: Option<Card>,
    pub table: Vec<TablePlay>,
    pub current_turn: Option<PlayerId>,
    pub turn_deadline: Option<DateTime<Utc>>,
    pub turn_generation: u64,
    pub game_number: u32,
    pub last_game_winner: Option<PlayerId>,
    pub winner: Option<PlayerId>,
    pub match_winner: Option<PlayerId>,
    pub match_over: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GameInstance {
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        creator: Participant,
        mode: GameMode,
        hand_size: usize,
        target_marks: u32,
        tie_policy: TiePolicy,
        turn_timeout_seconds: u64,
        now: DateTime<Utc>,
    ) -> GameInstance {
        GameInstance {
            game_id: Uuid::new_v4().to_string(),
            match_id: Uuid::new_v4().to_string(),
            status: GameStatus::Pending,
            mode,
            hand_size,
            target_marks,
            tie_policy,
            turn_timeout_seconds,
            participants: vec![creator],
            deck: VecDeque::new(),
            trump_card: None,
            table: Vec::new(),
            current_turn: None,
            turn_deadline: None,
            turn_generation: 0,
            game_number: 1,
            last_game_winner: None,
            winner: None,
            match_winner: None,
            match_over: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_participant(&self, player_id: &str) -> bool {
        self.participants.iter().any(|p| p.player_id == player_id)
    }

    pub fn participant(&self, player_id: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.player_id == player_id)
    }

    fn participant_index(&self, player_id: &str) -> Option<usize> {
        self.participants.iter().position(|p| p.player_id == player_id)
    }

    pub fn opponent_of(&self, player_id: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.player_id != player_id)
    }

    pub fn bot_id(&self) -> Option<PlayerId> {
        self.participants
            .iter()
            .find(|p| p.is_bot)
            .map(|p| p.player_id.clone())
    }

    pub fn trump_suit(&self) -> Option<Suit> {
        self.trump_card.map(|c| c.suit)
    }

    /// Whoever leads the next deal: the most recent decided game's winner
    /// (ties keep it unchanged), or the creator before any game is decided.
    fn leader_id(&self) -> Option<PlayerId> {
        self.last_game_winner
            .clone()
            .or_else(|| self.participants.first().map(|p| p.player_id.clone()))
    }

    pub fn add_opponent(&mut self, seat: Participant, now: DateTime<Utc>) -> Result<(), GameError> {
        if self.status != GameStatus::Pending {
            return Err(GameError::IllegalMove("GAME_NOT_JOINABLE"));
        }
        if self.participants.len() >= 2 {
            return Err(GameError::IllegalMove("GAME_FULL"));
        }
        if self.is_participant(&seat.player_id) {
            return Err(GameError::IllegalMove("ALREADY_SEATED"));
        }
        self.participants.push(seat);
        self.updated_at = now;
        Ok(())
    }

    /// Deal the first game: full shuffled deck, initial hands, trump revealed
    /// at the bottom of the stock, creator on lead.
    pub fn start(&mut self, rng: &mut impl Rng, now: DateTime<Utc>) -> Result<(), GameError> {
        if self.status != GameStatus::Pending {
            return Err(GameError::IllegalMove("ALREADY_STARTED"));
        }
        if self.participants.len() != 2 {
            return Err(GameError::IllegalMove("GAME_NOT_READY"));
        }
        self.deal_new_game(rng, now);
        self.verify_census()
    }

    /// Continue the match after an ended game. Either participant may ask;
    /// bots implicitly consent.
    pub fn next_round(
        &mut self,
        player_id: &str,
        rng: &mut impl Rng,
        now: DateTime<Utc>,
    ) -> Result<(), GameError> {
        if !self.is_participant(player_id) {
            return Err(GameError::IllegalMove("NOT_A_PARTICIPANT"));
        }
        if self.status != GameStatus::Ended {
            return Err(GameError::IllegalMove("GAME_NOT_ENDED"));
        }
        if self.match_over {
            return Err(GameError::IllegalMove("MATCH_OVER"));
        }
        self.game_number += 1;
        self.deal_new_game(rng, now);
        self.verify_census()
    }

    fn deal_new_game(&mut self, rng: &mut impl Rng, now: DateTime<Utc>) {
        for seat in &mut self.participants {
            seat.hand.clear();
            seat.collected.clear();
            seat.score = 0;
        }
        self.table.clear();
        self.winner = None;
        self.deck = VecDeque::from(new_deck(rng));
        self.trump_card = self.deck.back().copied();

        let leader = self.leader_id();
        let lead_idx = leader
            .as_deref()
            .and_then(|id| self.participant_index(id))
            .unwrap_or(0);
        for _ in 0..self.hand_size {
            for offset in 0..self.participants.len() {
                let idx = (lead_idx + offset) % self.participants.len();
                if let Some(card) = self.deck.pop_front() {
                    self.participants[idx].hand.push(card);
                }
            }
        }

        self.status = GameStatus::Playing;
        self.current_turn = leader;
        self.arm_turn(now);
    }

    fn arm_turn(&mut self, now: DateTime<Utc>) {
        self.turn_deadline = Some(now + Duration::seconds(self.turn_timeout_seconds as i64));
        self.turn_generation += 1;
        self.updated_at = now;
    }

    /// Grant the current turn-holder a fresh time budget. Used when a
    /// restored snapshot carries a deadline that expired while the process
    /// was down.
    pub fn rearm_turn(&mut self, now: DateTime<Utc>) {
        if self.status == GameStatus::Playing {
            self.arm_turn(now);
        }
    }

    /// Resolve a wire card reference to a position in the player's hand.
    pub fn resolve_card(&self, player_id: &str, card_ref: &CardRef) -> Result<usize, GameError> {
        let seat = self
            .participant(player_id)
            .ok_or(GameError::IllegalMove("NOT_A_PARTICIPANT"))?;
        match card_ref {
            CardRef::Index(pos) => {
                if *pos < seat.hand.len() {
                    Ok(*pos)
                } else {
                    Err(GameError::IllegalMove("CARD_NOT_IN_HAND"))
                }
            }
            CardRef::Face(face) => {
                let card = parse_face(face).ok_or(GameError::IllegalMove("INVALID_CARD"))?;
                seat.hand
                    .iter()
                    .position(|c| *c == card)
                    .ok_or(GameError::IllegalMove("CARD_NOT_IN_HAND"))
            }
        }
    }

    /// Hand positions the player may legally play right now. Suit-following
    /// binds only once the stock is exhausted.
    pub fn legal_positions(&self, player_id: &str) -> Vec<usize> {
        let Some(seat) = self.participant(player_id) else {
            return Vec::new();
        };
        if let Some(lead) = self.table.first()
            && self.deck.is_empty()
            && hand_has_suit(&seat.hand, lead.card.suit)
        {
            return seat
                .hand
                .iter()
                .enumerate()
                .filter(|(_, c)| c.suit == lead.card.suit)
                .map(|(pos, _)| pos)
                .collect();
        }
        (0..seat.hand.len()).collect()
    }

    pub fn legal_cards(&self, player_id: &str) -> Vec<(usize, Card)> {
        let Some(seat) = self.participant(player_id) else {
            return Vec::new();
        };
        self.legal_positions(player_id)
            .into_iter()
            .map(|pos| (pos, seat.hand[pos]))
            .collect()
    }

    /// Apply one play for the turn holder. Illegal moves reject without any
    /// state change; a broken card census surfaces as `Integrity` and the
    /// caller interrupts the instance.
    pub fn play_card(
        &mut self,
        player_id: &str,
        card_ref: &CardRef,
        now: DateTime<Utc>,
    ) -> Result<PlayOutcome, GameError> {
        if self.status != GameStatus::Playing {
            return Err(GameError::IllegalMove("GAME_NOT_RUNNING"));
        }
        let seat_idx = self
            .participant_index(player_id)
            .ok_or(GameError::IllegalMove("NOT_A_PARTICIPANT"))?;
        if self.current_turn.as_deref() != Some(player_id) {
            return Err(GameError::IllegalMove("NOT_YOUR_TURN"));
        }
        let pos = self.resolve_card(player_id, card_ref)?;
        if !self.legal_positions(player_id).contains(&pos) {
            return Err(GameError::IllegalMove("MUST_FOLLOW_SUIT"));
        }

        let card = self.participants[seat_idx].hand.remove(pos);
        self.table.push(TablePlay {
            player_id: player_id.to_string(),
            card,
        });

        let outcome = if self.table.len() == 2 {
            self.resolve_completed_trick(now)?
        } else {
            let follower = self
                .opponent_of(player_id)
                .map(|p| p.player_id.clone())
                .ok_or_else(|| GameError::Integrity("lone participant on a live game".into()))?;
            self.current_turn = Some(follower);
            self.arm_turn(now);
            PlayOutcome {
                trick: None,
                finished: None,
            }
        };

        self.verify_census()?;
        self.updated_at = now;
        Ok(outcome)
    }

    fn resolve_completed_trick(&mut self, now: DateTime<Utc>) -> Result<PlayOutcome, GameError> {
        let lead = self.table[0].clone();
        let follow = self.table[1].clone();
        let trump = self
            .trump_suit()
            .ok_or_else(|| GameError::Integrity("no trump on a live game".into()))?;

        let winner_id = match resolve_trick(lead.card, follow.card, trump) {
            TrickWinner::Leader => lead.player_id,
            TrickWinner::Follower => follow.player_id,
        };
        let points = lead.card.points() + follow.card.points();

        let winner_idx = self
            .participant_index(&winner_id)
            .ok_or_else(|| GameError::Integrity("trick winner is not seated".into()))?;
        let loser_idx = 1 - winner_idx;

        let taken: Vec<Card> = self.table.drain(..).map(|p| p.card).collect();
        self.participants[winner_idx].collected.extend(taken);
        self.participants[winner_idx].score += points;
        self.current_turn = Some(winner_id.clone());

        // Loser draws first; the trick winner draws last and so takes the
        // trump card on the final draw.
        if let Some(card) = self.deck.pop_front() {
            self.participants[loser_idx].hand.push(card);
        }
        if let Some(card) = self.deck.pop_front() {
            self.participants[winner_idx].hand.push(card);
        }

        let finished = if self.deck.is_empty() && self.participants.iter().all(|p| p.hand.is_empty())
        {
            Some(self.finish_game(now))
        } else {
            self.arm_turn(now);
            None
        };

        Ok(PlayOutcome {
            trick: Some(TrickSummary {
                winner: winner_id,
                points,
            }),
            finished,
        })
    }

    fn finish_game(&mut self, now: DateTime<Utc>) -> GameResult {
        self.status = GameStatus::Ended;
        self.current_turn = None;
        self.turn_deadline = None;
        self.turn_generation += 1;
        self.updated_at = now;

        let (a, b) = (self.participants[0].score, self.participants[1].score);
        let winner_idx = if a > b {
            Some(0)
        } else if b > a {
            Some(1)
        } else {
            None
        };

        match winner_idx {
            Some(idx) => {
                self.participants[idx].marks += 1;
                let id = self.participants[idx].player_id.clone();
                self.winner = Some(id.clone());
                self.last_game_winner = Some(id);
            }
            None => {
                self.winner = None;
                if self.tie_policy == TiePolicy::SplitMark {
                    for seat in &mut self.participants {
                        seat.marks += 1;
                    }
                }
            }
        }

        if self.participants.iter().any(|p| p.marks >= self.target_marks) {
            self.match_over = true;
            let (ma, mb) = (self.participants[0].marks, self.participants[1].marks);
            self.match_winner = if ma > mb {
                Some(self.participants[0].player_id.clone())
            } else if mb > ma {
                Some(self.participants[1].player_id.clone())
            } else {
                None
            };
        }

        GameResult {
            winner: self.winner.clone(),
            match_over: self.match_over,
            match_winner: self.match_winner.clone(),
        }
    }

    /// Force the instance dead. With an offender (resignation, timeout
    /// forfeit) the opponent takes the match. Idempotent; bumps the
    /// generation so in-flight timers and bot retries turn into no-ops.
    pub fn interrupt(&mut self, offender: Option<&str>, now: DateTime<Utc>) {
        if self.status == GameStatus::Interrupted {
            return;
        }
        self.status = GameStatus::Interrupted;
        self.current_turn = None;
        self.turn_deadline = None;
        self.turn_generation += 1;
        self.match_over = true;
        if let Some(off) = offender
            && let Some(opponent) = self.opponent_of(off)
        {
            self.match_winner = Some(opponent.player_id.clone());
        }
        self.updated_at = now;
    }

    pub fn card_census(&self) -> usize {
        self.deck.len()
            + self.table.len()
            + self
                .participants
                .iter()
                .map(|p| p.hand.len() + p.collected.len())
                .sum::<usize>()
    }

    fn verify_census(&self) -> Result<(), GameError> {
        if self.status != GameStatus::Playing && self.status != GameStatus::Ended {
            return Ok(());
        }
        let total = self.card_census();
        if total == DECK_SIZE {
            Ok(())
        } else {
            Err(GameError::Integrity(format!(
                "card census {total} != {DECK_SIZE}"
            )))
        }
    }

    pub fn listing(&self) -> GameListing {
        GameListing {
            game_id: self.game_id.clone(),
            created_by: self
                .participants
                .first()
                .map(|p| p.name.clone())
                .unwrap_or_default(),
            hand_size: self.hand_size,
            target_marks: self.target_marks,
            created_at: self.created_at,
        }
    }

    /// Project the state for one participant: own hand in full, opponent
    /// reduced to counts, stock reduced to a count plus the revealed trump.
    pub fn view_for(&self, viewer: &str) -> Option<GameStateView> {
        let seat = self.participant(viewer)?;
        let opponent = self.opponent_of(viewer).map(|p| OpponentView {
            player_id: p.player_id.clone(),
            name: p.name.clone(),
            is_bot: p.is_bot,
            hand_count: p.hand.len(),
            score: p.score,
            marks: p.marks,
            collected_count: p.collected.len(),
        });

        Some(GameStateView {
            game_id: self.game_id.clone(),
            match_id: self.match_id.clone(),
            status: self.status,
            mode: self.mode,
            hand_size: self.hand_size,
            target_marks: self.target_marks,
            game_number: self.game_number,
            trump_card: self.trump_card,
            trump_suit: self.trump_suit(),
            deck_count: self.deck.len(),
            table: self
                .table
                .iter()
                .map(|p| TablePlayView {
                    player_id: p.player_id.clone(),
                    card: p.card,
                })
                .collect(),
            current_turn: self.current_turn.clone(),
            turn_deadline: self.turn_deadline,
            you: SeatView {
                player_id: seat.player_id.clone(),
                name: seat.name.clone(),
                is_bot: seat.is_bot,
                hand: seat.hand.clone(),
                score: seat.score,
                marks: seat.marks,
                collected_count: seat.collected.len(),
            },
            opponent,
            winner: self.winner.clone(),
            match_winner: self.match_winner.clone(),
            match_over: self.match_over,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bisca_common::{ALL_FIGURES, ALL_SUITS, Figure, TOTAL_POINTS};
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn card(suit: Suit, figure: Figure) -> Card {
        Card::new(suit, figure)
    }

    fn fresh_game(tie_policy: TiePolicy, target_marks: u32) -> GameInstance {
        let now = Utc::now();
        let mut game = GameInstance::create(
            Participant::seat("alice", "Alice", false),
            GameMode::Pvp,
            3,
            target_marks,
            tie_policy,
            30,
            now,
        );
        game.add_opponent(Participant::seat("bruno", "Bruno", false), now)
            .unwrap();
        game
    }

    fn started_game(seed: u64) -> GameInstance {
        let mut game = fresh_game(TiePolicy::NoMark, 4);
        let mut rng = StdRng::seed_from_u64(seed);
        game.start(&mut rng, Utc::now()).unwrap();
        game
    }

    /// Hand-crafted endgame: given hands and stock, park every remaining card
    /// in the collected piles so the census stays honest.
    fn crafted(
        hand_a: Vec<Card>,
        hand_b: Vec<Card>,
        deck: Vec<Card>,
        trump: Card,
        turn: &str,
    ) -> GameInstance {
        let mut game = fresh_game(TiePolicy::NoMark, 4);
        let used: Vec<Card> = hand_a.iter().chain(&hand_b).chain(&deck).copied().collect();
        game.participants[0].hand = hand_a;
        game.participants[1].hand = hand_b;
        game.deck = VecDeque::from(deck);
        game.trump_card = Some(trump);
        game.status = GameStatus::Playing;
        game.current_turn = Some(turn.to_string());
        game.turn_deadline = Some(Utc::now() + Duration::seconds(30));
        game.turn_generation = 1;

        let mut filler: Vec<Card> = Vec::new();
        for suit in ALL_SUITS {
            for figure in ALL_FIGURES {
                let c = card(suit, figure);
                if !used.contains(&c) {
                    filler.push(c);
                }
            }
        }
        for (i, c) in filler.into_iter().enumerate() {
            game.participants[i % 2].collected.push(c);
        }
        for seat in &mut game.participants {
            seat.score = seat.collected.iter().map(|c| c.points()).sum();
        }
        assert_eq!(game.card_census(), DECK_SIZE);
        game
    }

    #[test]
    fn start_deals_hands_and_reveals_trump() {
        let game = started_game(11);
        assert_eq!(game.status, GameStatus::Playing);
        assert_eq!(game.participants[0].hand.len(), 3);
        assert_eq!(game.participants[1].hand.len(), 3);
        assert_eq!(game.deck.len(), 34);
        assert_eq!(game.trump_card, game.deck.back().copied());
        assert_eq!(game.current_turn.as_deref(), Some("alice"));
        assert!(game.turn_deadline.is_some());
        assert_eq!(game.card_census(), DECK_SIZE);
    }

    #[test]
    fn start_requires_two_seats() {
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
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(
            game.start(&mut rng, now),
            Err(GameError::IllegalMove("GAME_NOT_READY"))
        );
    }

    #[test]
    fn out_of_turn_play_rejects_without_mutation() {
        let game = started_game(3);
        let mut copy = game.clone();
        let err = copy
            .play_card("bruno", &CardRef::Index(0), Utc::now())
            .unwrap_err();
        assert_eq!(err, GameError::IllegalMove("NOT_YOUR_TURN"));
        assert_eq!(copy, game);
    }

    #[test]
    fn unknown_player_is_rejected() {
        let mut game = started_game(3);
        let err = game
            .play_card("mallory", &CardRef::Index(0), Utc::now())
            .unwrap_err();
        assert_eq!(err, GameError::IllegalMove("NOT_A_PARTICIPANT"));
    }

    #[test]
    fn card_references_resolve_by_index_and_face() {
        let game = started_game(5);
        let third = game.participants[0].hand[2];
        assert_eq!(game.resolve_card("alice", &CardRef::Index(2)), Ok(2));
        assert_eq!(
            game.resolve_card("alice", &CardRef::Face(third.face())),
            Ok(2)
        );
        assert_eq!(
            game.resolve_card("alice", &CardRef::Index(3)),
            Err(GameError::IllegalMove("CARD_NOT_IN_HAND"))
        );
        assert_eq!(
            game.resolve_card("alice", &CardRef::Face("swordsX".into())),
            Err(GameError::IllegalMove("INVALID_CARD"))
        );
    }

    #[test]
    fn trick_awards_points_and_turn_to_winner() {
        // Trump hearts; Alice leads clubs-7, Bruno takes it with hearts-2.
        let mut game = crafted(
            vec![card(Suit::Clubs, Figure::Seven), card(Suit::Spades, Figure::Two)],
            vec![card(Suit::Hearts, Figure::Two), card(Suit::Clubs, Figure::King)],
            vec![card(Suit::Diamonds, Figure::Two), card(Suit::Hearts, Figure::Ace)],
            card(Suit::Hearts, Figure::Ace),
            "alice",
        );

        game.play_card("alice", &CardRef::Face("clubs7".into()), Utc::now())
            .unwrap();
        assert_eq!(game.current_turn.as_deref(), Some("bruno"));
        assert_eq!(game.table.len(), 1);

        let outcome = game
            .play_card("bruno", &CardRef::Face("hearts2".into()), Utc::now())
            .unwrap();
        let trick = outcome.trick.unwrap();
        assert_eq!(trick.winner, "bruno");
        assert_eq!(trick.points, 10);
        assert!(game.table.is_empty());
        assert_eq!(game.current_turn.as_deref(), Some("bruno"));
        assert!(game.participants[1]
            .collected
            .contains(&card(Suit::Clubs, Figure::Seven)));
    }

    #[test]
    fn loser_draws_first_winner_draws_last() {
        let first = card(Suit::Diamonds, Figure::Three);
        let second = card(Suit::Diamonds, Figure::Four);
        let mut game = crafted(
            vec![card(Suit::Spades, Figure::Ace), card(Suit::Spades, Figure::Two)],
            vec![card(Suit::Spades, Figure::King), card(Suit::Clubs, Figure::Two)],
            vec![first, second],
            card(Suit::Hearts, Figure::Ace),
            "alice",
        );

        game.play_card("alice", &CardRef::Face("spadesA".into()), Utc::now())
            .unwrap();
        game.play_card("bruno", &CardRef::Face("spadesK".into()), Utc::now())
            .unwrap();

        // Alice won; Bruno (loser) drew the first stock card, Alice the next.
        assert!(game.participants[1].hand.contains(&first));
        assert!(game.participants[0].hand.contains(&second));
        assert!(game.deck.is_empty());
    }

    #[test]
    fn suit_following_binds_only_once_stock_is_empty() {
        // Stock still has cards: off-suit response is fine.
        let mut game = crafted(
            vec![card(Suit::Clubs, Figure::Ace), card(Suit::Clubs, Figure::Two)],
            vec![card(Suit::Clubs, Figure::King), card(Suit::Spades, Figure::Two)],
            vec![card(Suit::Diamonds, Figure::Five), card(Suit::Diamonds, Figure::Six)],
            card(Suit::Hearts, Figure::Ace),
            "alice",
        );
        game.play_card("alice", &CardRef::Face("clubsA".into()), Utc::now())
            .unwrap();
        game.play_card("bruno", &CardRef::Face("spades2".into()), Utc::now())
            .unwrap();

        // Empty stock: holding the led suit forces following it.
        let mut endgame = crafted(
            vec![card(Suit::Clubs, Figure::Ace), card(Suit::Clubs, Figure::Two)],
            vec![card(Suit::Clubs, Figure::King), card(Suit::Spades, Figure::Two)],
            Vec::new(),
            card(Suit::Hearts, Figure::Ace),
            "alice",
        );
        endgame
            .play_card("alice", &CardRef::Face("clubsA".into()), Utc::now())
            .unwrap();
        let before = endgame.clone();
        let err = endgame
            .play_card("bruno", &CardRef::Face("spades2".into()), Utc::now())
            .unwrap_err();
        assert_eq!(err, GameError::IllegalMove("MUST_FOLLOW_SUIT"));
        assert_eq!(endgame, before);

        endgame
            .play_card("bruno", &CardRef::Face("clubsK".into()), Utc::now())
            .unwrap();
        assert_eq!(endgame.participants[0].hand.len(), 1);
    }

    #[test]
    fn full_playout_keeps_census_and_point_total() {
        for seed in [2_u64, 19, 77] {
            let mut game = started_game(seed);
            let mut guard = 0;
            while game.status == GameStatus::Playing {
                let turn = game.current_turn.clone().unwrap();
                let pos = game.legal_positions(&turn)[0];
                let before_turn = turn.clone();
                let outcome = game
                    .play_card(&turn, &CardRef::Index(pos), Utc::now())
                    .unwrap();
                assert_eq!(game.card_census(), DECK_SIZE);
                if let Some(trick) = &outcome.trick {
                    assert_eq!(game.status == GameStatus::Playing, outcome.finished.is_none());
                    if game.status == GameStatus::Playing {
                        assert_eq!(game.current_turn.as_deref(), Some(trick.winner.as_str()));
                    }
                } else {
                    assert_ne!(game.current_turn.as_deref(), Some(before_turn.as_str()));
                }
                guard += 1;
                assert!(guard <= 40, "playout did not terminate");
            }

            assert_eq!(game.status, GameStatus::Ended);
            let total: u32 = game.participants.iter().map(|p| p.score).sum();
            assert_eq!(total, TOTAL_POINTS);
            let collected: usize = game.participants.iter().map(|p| p.collected.len()).sum();
            assert_eq!(collected, DECK_SIZE);
            let piles: u32 = game
                .participants
                .iter()
                .flat_map(|p| p.collected.iter())
                .map(|c| c.points())
                .sum();
            assert_eq!(piles, TOTAL_POINTS);
        }
    }

    #[test]
    fn nine_card_variant_plays_out() {
        let now = Utc::now();
        let mut game = GameInstance::create(
            Participant::seat("alice", "Alice", false),
            GameMode::Pvp,
            9,
            4,
            TiePolicy::NoMark,
            30,
            now,
        );
        game.add_opponent(Participant::seat("bruno", "Bruno", false), now)
            .unwrap();
        let mut rng = StdRng::seed_from_u64(8);
        game.start(&mut rng, now).unwrap();
        assert_eq!(game.deck.len(), 22);

        while game.status == GameStatus::Playing {
            let turn = game.current_turn.clone().unwrap();
            let pos = game.legal_positions(&turn)[0];
            game.play_card(&turn, &CardRef::Index(pos), Utc::now())
                .unwrap();
            assert_eq!(game.card_census(), DECK_SIZE);
        }
        let total: u32 = game.participants.iter().map(|p| p.score).sum();
        assert_eq!(total, TOTAL_POINTS);
    }

    // Last trick of a rigged endgame that lands exactly on 60-60: Alice's
    // pile holds diamonds + clubs minus the two cards in play (49 points),
    // Bruno's holds hearts + spades (60); Alice takes the final 11.
    fn sixty_sixty(policy: TiePolicy) -> GameInstance {
        let mut game = crafted(
            vec![card(Suit::Clubs, Figure::Ace)],
            vec![card(Suit::Clubs, Figure::Two)],
            Vec::new(),
            card(Suit::Diamonds, Figure::Two),
            "alice",
        );
        game.tie_policy = policy;
        game.participants[0].collected.clear();
        game.participants[1].collected.clear();
        for suit in ALL_SUITS {
            for figure in ALL_FIGURES {
                let c = card(suit, figure);
                if c == card(Suit::Clubs, Figure::Ace) || c == card(Suit::Clubs, Figure::Two) {
                    continue;
                }
                if suit == Suit::Hearts || suit == Suit::Spades {
                    game.participants[1].collected.push(c);
                } else {
                    game.participants[0].collected.push(c);
                }
            }
        }
        for seat in &mut game.participants {
            seat.score = seat.collected.iter().map(|c| c.points()).sum();
        }
        assert_eq!(game.participants[0].score, 49);
        assert_eq!(game.participants[1].score, 60);
        assert_eq!(game.card_census(), DECK_SIZE);

        game.play_card("alice", &CardRef::Face("clubsA".into()), Utc::now())
            .unwrap();
        game.play_card("bruno", &CardRef::Face("clubs2".into()), Utc::now())
            .unwrap();
        game
    }

    #[test]
    fn sixty_sixty_with_no_mark_policy_awards_nobody() {
        let game = sixty_sixty(TiePolicy::NoMark);
        assert_eq!(game.status, GameStatus::Ended);
        assert_eq!(game.participants[0].score, 60);
        assert_eq!(game.participants[1].score, 60);
        assert_eq!(game.winner, None);
        assert_eq!(game.participants[0].marks, 0);
        assert_eq!(game.participants[1].marks, 0);
        assert!(!game.match_over);
    }

    #[test]
    fn sixty_sixty_with_split_mark_policy_awards_both() {
        let game = sixty_sixty(TiePolicy::SplitMark);
        assert_eq!(game.winner, None);
        assert_eq!(game.participants[0].marks, 1);
        assert_eq!(game.participants[1].marks, 1);
    }

    #[test]
    fn reaching_target_marks_decides_the_match() {
        let mut game = crafted(
            vec![card(Suit::Clubs, Figure::Ace)],
            vec![card(Suit::Clubs, Figure::Two)],
            Vec::new(),
            card(Suit::Diamonds, Figure::Two),
            "alice",
        );
        game.target_marks = 1;

        game.play_card("alice", &CardRef::Face("clubsA".into()), Utc::now())
            .unwrap();
        let outcome = game
            .play_card("bruno", &CardRef::Face("clubs2".into()), Utc::now())
            .unwrap();

        let result = outcome.finished.unwrap();
        assert_eq!(game.status, GameStatus::Ended);
        assert!(result.match_over);
        assert_eq!(result.winner.as_deref(), result.match_winner.as_deref());
        assert_eq!(
            game.participants
                .iter()
                .find(|p| Some(p.player_id.as_str()) == result.winner.as_deref())
                .map(|p| p.marks),
            Some(1)
        );
    }

    #[test]
    fn next_round_redeals_with_previous_winner_on_lead() {
        let mut game = crafted(
            vec![card(Suit::Clubs, Figure::Ace)],
            vec![card(Suit::Clubs, Figure::Two)],
            Vec::new(),
            card(Suit::Diamonds, Figure::Two),
            "alice",
        );
        game.target_marks = 3;
        game.play_card("alice", &CardRef::Face("clubsA".into()), Utc::now())
            .unwrap();
        game.play_card("bruno", &CardRef::Face("clubs2".into()), Utc::now())
            .unwrap();
        assert_eq!(game.status, GameStatus::Ended);
        let first_winner = game.winner.clone().unwrap();

        let mut rng = StdRng::seed_from_u64(21);
        game.next_round("bruno", &mut rng, Utc::now()).unwrap();
        assert_eq!(game.status, GameStatus::Playing);
        assert_eq!(game.game_number, 2);
        assert_eq!(game.current_turn.as_deref(), Some(first_winner.as_str()));
        assert_eq!(game.card_census(), DECK_SIZE);
        assert_eq!(game.participants[0].score, 0);
        assert_eq!(game.participants[0].hand.len(), 3);

        // Marks carry across deals.
        let winner_marks = game
            .participants
            .iter()
            .find(|p| p.player_id == first_winner)
            .unwrap()
            .marks;
        assert_eq!(winner_marks, 1);
    }

    #[test]
    fn next_round_rejects_while_playing_or_after_match() {
        let mut live = started_game(9);
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(
            live.next_round("alice", &mut rng, Utc::now()),
            Err(GameError::IllegalMove("GAME_NOT_ENDED"))
        );

        let mut done = crafted(
            vec![card(Suit::Clubs, Figure::Ace)],
            vec![card(Suit::Clubs, Figure::Two)],
            Vec::new(),
            card(Suit::Diamonds, Figure::Two),
            "alice",
        );
        done.target_marks = 1;
        done.play_card("alice", &CardRef::Face("clubsA".into()), Utc::now())
            .unwrap();
        done.play_card("bruno", &CardRef::Face("clubs2".into()), Utc::now())
            .unwrap();
        assert!(done.match_over);
        assert_eq!(
            done.next_round("alice", &mut rng, Utc::now()),
            Err(GameError::IllegalMove("MATCH_OVER"))
        );
    }

    #[test]
    fn interrupt_awards_the_opponent_and_blocks_late_plays() {
        let mut game = started_game(13);
        let generation = game.turn_generation;
        game.interrupt(Some("alice"), Utc::now());

        assert_eq!(game.status, GameStatus::Interrupted);
        assert_eq!(game.match_winner.as_deref(), Some("bruno"));
        assert!(game.match_over);
        assert_eq!(game.turn_deadline, None);
        assert!(game.turn_generation > generation);

        let err = game
            .play_card("bruno", &CardRef::Index(0), Utc::now())
            .unwrap_err();
        assert_eq!(err, GameError::IllegalMove("GAME_NOT_RUNNING"));

        // Idempotent: a second interrupt changes nothing.
        let frozen = game.clone();
        game.interrupt(Some("bruno"), Utc::now());
        assert_eq!(game, frozen);
    }

    #[test]
    fn census_break_surfaces_as_integrity_error() {
        let mut game = started_game(17);
        game.deck.pop_front();
        let turn = game.current_turn.clone().unwrap();
        let err = game
            .play_card(&turn, &CardRef::Index(0), Utc::now())
            .unwrap_err();
        assert!(matches!(err, GameError::Integrity(_)));
    }

    #[test]
    fn views_redact_the_opponent_hand() {
        let game = started_game(23);
        let view = game.view_for("alice").unwrap();
        assert_eq!(view.you.player_id, "alice");
        assert_eq!(view.you.hand.len(), 3);
        let opponent = view.opponent.unwrap();
        assert_eq!(opponent.player_id, "bruno");
        assert_eq!(opponent.hand_count, 3);
        assert_eq!(view.deck_count, 34);
        assert_eq!(view.trump_card, game.trump_card);

        assert!(game.view_for("mallory").is_none());
    }

    #[test]
    fn snapshot_round_trip_is_lossless() {
        let mut game = started_game(29);
        let turn = game.current_turn.clone().unwrap();
        let pos = game.legal_positions(&turn)[0];
        game.play_card(&turn, &CardRef::Index(pos), Utc::now())
            .unwrap();

        let blob = serde_json::to_string(&game).unwrap();
        let restored: GameInstance = serde_json::from_str(&blob).unwrap();
        assert_eq!(restored, game);
    }
}
