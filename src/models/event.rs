use serde::{Deserialize, Serialize};

use crate::models::challenge::{variant_tag, Challenge, Player};
use crate::models::game::GameStateFrame;

/// Minimal reference to a game, as carried by account-stream frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameRef {
    pub id: String,
}

/// Frames on the account-wide event stream.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AccountEvent {
    Challenge { challenge: Challenge },
    ChallengeCanceled { challenge: Challenge },
    ChallengeDeclined { challenge: Challenge },
    GameStart { game: GameRef },
    GameFinish { game: GameRef },
}

/// Clock section of a `gameFull` frame; values are milliseconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GameClock {
    pub initial: u64,
    pub increment: u64,
}

/// First frame on a per-game stream: the full descriptor plus the state so
/// far (non-empty when resuming a game already in progress).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameFull {
    pub id: String,
    #[serde(default = "standard", deserialize_with = "variant_tag")]
    pub variant: String,
    #[serde(default)]
    pub rated: bool,
    #[serde(default)]
    pub clock: Option<GameClock>,
    #[serde(default)]
    pub days_per_turn: Option<u32>,
    pub white: Player,
    pub black: Player,
    #[serde(default)]
    pub initial_fen: Option<String>,
    pub state: GameStateFrame,
}

fn standard() -> String {
    "standard".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRoom {
    Player,
    Spectator,
}

impl ChatRoom {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRoom::Player => "player",
            ChatRoom::Spectator => "spectator",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatLine {
    pub room: ChatRoom,
    pub username: String,
    pub text: String,
}

/// Frames on a per-game stream after the initial `gameFull`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum GameEvent {
    GameFull(GameFull),
    GameState(GameStateFrame),
    ChatLine(ChatLine),
    #[serde(rename_all = "camelCase")]
    OpponentGone {
        #[serde(default)]
        gone: bool,
        #[serde(default)]
        claim_win_in_seconds: Option<u64>,
    },
}
