use serde::{Deserialize, Serialize};

use crate::models::challenge::{Player, TimeControl};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Color {
    White,
    Black,
}

impl Color {
    pub fn other(&self) -> Color {
        match self {
            Color::White => Color::Black,
            Color::Black => Color::White,
        }
    }
}

/// Lifecycle tag of a game. Anything past `Started` freezes the state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameStatus {
    Created,
    Started,
    Aborted,
    Mate,
    Resign,
    Stalemate,
    Timeout,
    Draw,
    Outoftime,
    Cheat,
    NoStart,
    VariantEnd,
    UnknownFinish,
}

impl GameStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, GameStatus::Created | GameStatus::Started)
    }

    /// Statuses not in the documented set degrade to `UnknownFinish`.
    pub fn from_tag(tag: &str) -> GameStatus {
        match tag {
            "created" => GameStatus::Created,
            "started" => GameStatus::Started,
            "aborted" => GameStatus::Aborted,
            "mate" => GameStatus::Mate,
            "resign" => GameStatus::Resign,
            "stalemate" => GameStatus::Stalemate,
            "timeout" => GameStatus::Timeout,
            "draw" => GameStatus::Draw,
            "outoftime" => GameStatus::Outoftime,
            "cheat" => GameStatus::Cheat,
            "noStart" | "nostart" => GameStatus::NoStart,
            "variantEnd" => GameStatus::VariantEnd,
            _ => GameStatus::UnknownFinish,
        }
    }

    pub fn as_tag(&self) -> &'static str {
        match self {
            GameStatus::Created => "created",
            GameStatus::Started => "started",
            GameStatus::Aborted => "aborted",
            GameStatus::Mate => "mate",
            GameStatus::Resign => "resign",
            GameStatus::Stalemate => "stalemate",
            GameStatus::Timeout => "timeout",
            GameStatus::Draw => "draw",
            GameStatus::Outoftime => "outoftime",
            GameStatus::Cheat => "cheat",
            GameStatus::NoStart => "noStart",
            GameStatus::VariantEnd => "variantEnd",
            GameStatus::UnknownFinish => "unknownFinish",
        }
    }
}

impl Serialize for GameStatus {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_tag())
    }
}

impl<'de> Deserialize<'de> for GameStatus {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let tag = String::deserialize(deserializer)?;
        Ok(GameStatus::from_tag(&tag))
    }
}

/// A `gameState` frame as it arrives on the per-game stream. Clock values
/// are milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameStateFrame {
    #[serde(default)]
    pub moves: String,
    #[serde(default)]
    pub wtime: u64,
    #[serde(default)]
    pub btime: u64,
    #[serde(default)]
    pub winc: u64,
    #[serde(default)]
    pub binc: u64,
    #[serde(default = "started")]
    pub status: GameStatus,
    #[serde(default)]
    pub winner: Option<Color>,
    #[serde(default)]
    pub wdraw: bool,
    #[serde(default)]
    pub bdraw: bool,
    #[serde(default)]
    pub wtakeback: bool,
    #[serde(default)]
    pub btakeback: bool,
}

fn started() -> GameStatus {
    GameStatus::Started
}

impl GameStateFrame {
    pub fn move_list(&self) -> Vec<String> {
        self.moves.split_whitespace().map(str::to_string).collect()
    }
}

/// Immutable facts about a game, derived from the `gameFull` frame.
#[derive(Debug, Clone)]
pub struct GameDescriptor {
    pub id: String,
    pub our_color: Color,
    pub us: Player,
    pub opponent: Player,
    pub variant: String,
    pub time_control: TimeControl,
    pub rated: bool,
    pub initial_fen: Option<String>,
}

impl GameDescriptor {
    pub fn is_standard_variant(&self) -> bool {
        self.variant == "standard" || self.variant == "fromPosition"
    }
}

/// How a freshly observed move list relates to the one we already hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveListTransition {
    Unchanged,
    /// Extended by this many half-moves.
    Extended(usize),
    /// Truncated by this many half-moves; only legitimate right after a
    /// takeback acknowledgement.
    Truncated(usize),
    /// Neither a prefix nor an extension of what we hold.
    Diverged,
}

/// Mutable per-game state, updated from `gameState` frames.
#[derive(Debug, Clone)]
pub struct GameState {
    pub moves: Vec<String>,
    pub wtime_ms: u64,
    pub btime_ms: u64,
    pub winc_ms: u64,
    pub binc_ms: u64,
    pub status: GameStatus,
    pub winner: Option<Color>,
    pub white_offers_draw: bool,
    pub black_offers_draw: bool,
    pub white_asks_takeback: bool,
    pub black_asks_takeback: bool,
}

impl GameState {
    pub fn from_frame(frame: &GameStateFrame) -> Self {
        GameState {
            moves: frame.move_list(),
            wtime_ms: frame.wtime,
            btime_ms: frame.btime,
            winc_ms: frame.winc,
            binc_ms: frame.binc,
            status: frame.status,
            winner: frame.winner,
            white_offers_draw: frame.wdraw,
            black_offers_draw: frame.bdraw,
            white_asks_takeback: frame.wtakeback,
            black_asks_takeback: frame.btakeback,
        }
    }

    /// Compare an incoming move list against the current one without
    /// mutating anything. The caller decides whether a truncation was an
    /// acknowledged takeback or a protocol violation.
    pub fn classify(&self, incoming: &[String]) -> MoveListTransition {
        let held = &self.moves;
        if incoming.len() >= held.len() {
            if incoming[..held.len()] == held[..] {
                if incoming.len() == held.len() {
                    MoveListTransition::Unchanged
                } else {
                    MoveListTransition::Extended(incoming.len() - held.len())
                }
            } else {
                MoveListTransition::Diverged
            }
        } else if held[..incoming.len()] == incoming[..] {
            MoveListTransition::Truncated(held.len() - incoming.len())
        } else {
            MoveListTransition::Diverged
        }
    }

    pub fn apply(&mut self, frame: &GameStateFrame) {
        *self = GameState::from_frame(frame);
    }

    /// Whose turn it is, by move-list parity.
    pub fn side_to_move(&self) -> Color {
        if self.moves.len() % 2 == 0 {
            Color::White
        } else {
            Color::Black
        }
    }

    pub fn is_our_turn(&self, our_color: Color) -> bool {
        !self.status.is_terminal() && self.side_to_move() == our_color
    }

    pub fn opponent_offers_draw(&self, our_color: Color) -> bool {
        match our_color {
            Color::White => self.black_offers_draw,
            Color::Black => self.white_offers_draw,
        }
    }

    pub fn opponent_asks_takeback(&self, our_color: Color) -> bool {
        match our_color {
            Color::White => self.black_asks_takeback,
            Color::Black => self.white_asks_takeback,
        }
    }

    pub fn our_clock_ms(&self, our_color: Color) -> u64 {
        match our_color {
            Color::White => self.wtime_ms,
            Color::Black => self.btime_ms,
        }
    }
}
