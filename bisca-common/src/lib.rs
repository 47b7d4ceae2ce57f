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

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

pub const DECK_SIZE: usize = 40;
pub const TOTAL_POINTS: u32 = 120;
pub const HAND_SIZES: [usize; 2] = [3, 9];
pub const MIN_TARGET_MARKS: u32 = 1;
pub const MAX_TARGET_MARKS: u32 = 10;

pub const DEFAULT_TURN_TIMEOUT_SECONDS: u64 = 30;
pub const DEFAULT_BOT_TIMEOUT_SECONDS: u64 = 10;
pub const DEFAULT_BOT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BOT_RETRY_BASE_MS: u64 = 500;
pub const DEFAULT_BOT_RETRY_CAP_MS: u64 = 4_000;
pub const DEFAULT_BOT_THINK_DELAY_MS: u64 = 750;
pub const DEFAULT_SNAPSHOT_SYNC_SECONDS: u64 = 10;
pub const DEFAULT_SNAPSHOT_TTL_SECONDS: u64 = 86_400;
pub const DEFAULT_WATCHDOG_INTERVAL_SECONDS: u64 = 2;

pub type PlayerId = String;

pub const ALL_SUITS: [Suit; 4] = [Suit::Hearts, Suit::Spades, Suit::Diamonds, Suit::Clubs];

/// All figures in ascending trick-taking order: 2,3,4,5,6,Q,J,K,7,A.
/// The 7 and the Ace outrank the face cards; this is the defining rule
/// of the Bisca point system.
pub const ALL_FIGURES: [Figure; 10] = [
    Figure::Two,
    Figure::Three,
    Figure::Four,
    Figure::Five,
    Figure::Six,
    Figure::Queen,
    Figure::Jack,
    Figure::King,
    Figure::Seven,
    Figure::Ace,
];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Suit {
    Hearts,
    Spades,
    Diamonds,
    Clubs,
}

impl Suit {
    pub fn name(self) -> &'static str {
        match self {
            Suit::Hearts => "hearts",
            Suit::Spades => "spades",
            Suit::Diamonds => "diamonds",
            Suit::Clubs => "clubs",
        }
    }

    pub fn from_name(name: &str) -> Option<Suit> {
        ALL_SUITS.into_iter().find(|s| s.name() == name)
    }
}

// Declared in ascending trick order so the derived `Ord` matches `rank()`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Figure {
    #[serde(rename = "2")]
    Two,
    #[serde(rename = "3")]
    Three,
    #[serde(rename = "4")]
    Four,
    #[serde(rename = "5")]
    Five,
    #[serde(rename = "6")]
    Six,
    #[serde(rename = "Q")]
    Queen,
    #[serde(rename = "J")]
    Jack,
    #[serde(rename = "K")]
    King,
    #[serde(rename = "7")]
    Seven,
    #[serde(rename = "A")]
    Ace,
}

impl Figure {
    /// Strict trick-comparison rank, 1 (lowest) to 10 (highest).
    pub fn rank(self) -> u8 {
        match self {
            Figure::Two => 1,
            Figure::Three => 2,
            Figure::Four => 3,
            Figure::Five => 4,
            Figure::Six => 5,
            Figure::Queen => 6,
            Figure::Jack => 7,
            Figure::King => 8,
            Figure::Seven => 9,
            Figure::Ace => 10,
        }
    }

    /// Point value counted toward the 120-point game total.
    pub fn points(self) -> u32 {
        match self {
            Figure::Two | Figure::Three | Figure::Four | Figure::Five | Figure::Six => 0,
            Figure::Queen => 2,
            Figure::Jack => 3,
            Figure::King => 4,
            Figure::Seven => 10,
            Figure::Ace => 11,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Figure::Two => "2",
            Figure::Three => "3",
            Figure::Four => "4",
            Figure::Five => "5",
            Figure::Six => "6",
            Figure::Queen => "Q",
            Figure::Jack => "J",
            Figure::King => "K",
            Figure::Seven => "7",
            Figure::Ace => "A",
        }
    }

    pub fn from_symbol(symbol: &str) -> Option<Figure> {
        ALL_FIGURES.into_iter().find(|f| f.symbol() == symbol)
    }
}

/// A single card of the 40-card Portuguese deck. Plain data; every derived
/// attribute (rank, points, face) is a pure lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "CardWire", from = "CardWire")]
pub struct Card {
    pub suit: Suit,
    pub figure: Figure,
}

impl Card {
    pub fn new(suit: Suit, figure: Figure) -> Card {
        Card { suit, figure }
    }

    pub fn rank(self) -> u8 {
        self.figure.rank()
    }

    pub fn points(self) -> u32 {
        self.figure.points()
    }

    /// Canonical wire identifier, e.g. `"heartsA"` or `"clubs7"`.
    pub fn face(self) -> String {
        format!("{}{}", self.suit.name(), self.figure.symbol())
    }
}

/// Parse a face string back into a card. Suit names are prefix-free, so a
/// single prefix strip per suit is unambiguous.
pub fn parse_face(face: &str) -> Option<Card> {
    for suit in ALL_SUITS {
        if let Some(rest) = face.strip_prefix(suit.name())
            && let Some(figure) = Figure::from_symbol(rest)
        {
            return Some(Card { suit, figure });
        }
    }
    None
}

/// The five-field wire form clients consume: `face = suit + cardFigure`.
/// `rank`/`value`/`face` are derived and ignored on the way back in.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardWire {
    pub suit: Suit,
    pub card_figure: Figure,
    #[serde(default)]
    pub rank: u8,
    #[serde(default)]
    pub value: u32,
    #[serde(default)]
    pub face: String,
}

impl From<Card> for CardWire {
    fn from(card: Card) -> CardWire {
        CardWire {
            suit: card.suit,
            card_figure: card.figure,
            rank: card.rank(),
            value: card.points(),
            face: card.face(),
        }
    }
}

impl From<CardWire> for Card {
    fn from(wire: CardWire) -> Card {
        Card {
            suit: wire.suit,
            figure: wire.card_figure,
        }
    }
}

/// Build the full 40-card deck, uniformly shuffled (Fisher-Yates).
pub fn new_deck(rng: &mut impl Rng) -> Vec<Card> {
    let mut deck = Vec::with_capacity(DECK_SIZE);
    for suit in ALL_SUITS {
        for figure in ALL_FIGURES {
            deck.push(Card { suit, figure });
        }
    }
    for i in (1..deck.len()).rev() {
        let j = rng.random_range(0..=i);
        deck.swap(i, j);
    }
    deck
}

pub fn hand_has_suit(hand: &[Card], suit: Suit) -> bool {
    hand.iter().any(|c| c.suit == suit)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrickWinner {
    Leader,
    Follower,
}

/// Decide a completed trick. Rules, in order: trump beats non-trump (either
/// direction), same suit compares rank, and a follower who left the lead's
/// non-trump suit without trumping loses by default.
pub fn resolve_trick(lead: Card, follow: Card, trump: Suit) -> TrickWinner {
    if lead.suit == trump && follow.suit != trump {
        return TrickWinner::Leader;
    }
    if follow.suit == trump && lead.suit != trump {
        return TrickWinner::Follower;
    }
    if lead.suit == follow.suit {
        if follow.rank() > lead.rank() {
            TrickWinner::Follower
        } else {
            TrickWinner::Leader
        }
    } else {
        TrickWinner::Leader
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GameStatus {
    Pending,
    Playing,
    Ended,
    Interrupted,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GameMode {
    Bot,
    Pvp,
}

/// What happens to the mark on an exact 60-60 final score.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TiePolicy {
    NoMark,
    SplitMark,
}

impl TiePolicy {
    pub fn from_name(name: &str) -> Option<TiePolicy> {
        match name {
            "no_mark" => Some(TiePolicy::NoMark),
            "split_mark" => Some(TiePolicy::SplitMark),
            _ => None,
        }
    }
}

/// How the watchdog treats a human who overruns the turn timer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutAction {
    AutoPlay,
    Forfeit,
}

impl TimeoutAction {
    pub fn from_name(name: &str) -> Option<TimeoutAction> {
        match name {
            "auto_play" => Some(TimeoutAction::AutoPlay),
            "forfeit" => Some(TimeoutAction::Forfeit),
            _ => None,
        }
    }
}

/// A played card submitted either by position in the sender's hand or by
/// canonical face string.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum CardRef {
    Index(usize),
    Face(String),
}

/// Inbound realtime frames: `{"event": <name>, "data": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    Join {
        #[serde(default)]
        token: Option<String>,
        #[serde(default)]
        name: Option<String>,
    },
    #[serde(rename = "create-game", rename_all = "camelCase")]
    CreateGame {
        hand_size: usize,
        mode: GameMode,
        target_marks: u32,
    },
    #[serde(rename = "get-games")]
    GetGames,
    #[serde(rename = "join-game", rename_all = "camelCase")]
    JoinGame { game_id: String },
    #[serde(rename_all = "camelCase")]
    PlayCard {
        game_id: String,
        card_index_or_face: CardRef,
    },
    #[serde(rename_all = "camelCase")]
    LeaveGame { game_id: String },
    #[serde(rename_all = "camelCase")]
    NextRound { game_id: String },
}

/// Outbound realtime frames, same envelope shape as [`ClientEvent`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    Games {
        games: Vec<GameListing>,
    },
    #[serde(rename = "game-joined")]
    GameJoined {
        state: GameStateView,
    },
    GameState {
        state: GameStateView,
    },
    #[serde(rename_all = "camelCase")]
    GameAnnulled {
        game_id: String,
        reason: String,
    },
    #[serde(rename_all = "camelCase")]
    GameTimeout {
        game_id: String,
        reason: String,
        #[serde(default)]
        player_id: Option<PlayerId>,
    },
    RecoveryError {
        detail: String,
        redirect: String,
    },
    GameRecovered {
        state: GameStateView,
    },
    #[serde(rename_all = "camelCase")]
    BalanceUpdate {
        user_id: PlayerId,
        balance: i64,
    },
    Error {
        code: String,
        message: String,
    },
}

/// One joinable lobby entry (`Pending` pvp games only).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GameListing {
    pub game_id: String,
    pub created_by: String,
    pub hand_size: usize,
    pub target_marks: u32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TablePlayView {
    pub player_id: PlayerId,
    pub card: Card,
}

/// The viewer's own seat: full hand.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SeatView {
    pub player_id: PlayerId,
    pub name: String,
    pub is_bot: bool,
    pub hand: Vec<Card>,
    pub score: u32,
    pub marks: u32,
    pub collected_count: usize,
}

/// The other seat, redacted to a card count.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OpponentView {
    pub player_id: PlayerId,
    pub name: String,
    pub is_bot: bool,
    pub hand_count: usize,
    pub score: u32,
    pub marks: u32,
    pub collected_count: usize,
}

/// Per-viewer projection of a live game carried by `game_state`,
/// `game-joined` and `game_recovered`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GameStateView {
    pub game_id: String,
    pub match_id: String,
    pub status: GameStatus,
    pub mode: GameMode,
    pub hand_size: usize,
    pub target_marks: u32,
    pub game_number: u32,
    pub trump_card: Option<Card>,
    pub trump_suit: Option<Suit>,
    pub deck_count: usize,
    pub table: Vec<TablePlayView>,
    pub current_turn: Option<PlayerId>,
    pub turn_deadline: Option<DateTime<Utc>>,
    pub you: SeatView,
    pub opponent: Option<OpponentView>,
    pub winner: Option<PlayerId>,
    pub match_winner: Option<PlayerId>,
    pub match_over: bool,
}
