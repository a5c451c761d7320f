use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::models::TimeControlCategory;

#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(msg) => write!(f, "Failed to read configuration: {}", msg),
            ConfigError::Parse(msg) => write!(f, "Failed to parse configuration: {}", msg),
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Which single search-limit mode is passed to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeMode {
    Clock,
    Movetime,
    Depth,
    Nodes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineProtocol {
    Auto,
    Uci,
    Xboard,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct EngineConfig {
    pub path: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default = "default_protocol")]
    pub protocol: EngineProtocol,
    #[serde(default)]
    pub options: HashMap<String, String>,
    #[serde(default = "default_time_mode")]
    pub time_mode: TimeMode,
    /// Let the engine think on the opponent's time (UCI only).
    #[serde(default)]
    pub ponder: bool,
    /// Fixed search time when time-mode is movetime.
    #[serde(default = "default_movetime_ms")]
    pub movetime_ms: u64,
    #[serde(default = "default_depth")]
    pub depth: u32,
    #[serde(default = "default_nodes")]
    pub nodes: u64,
    /// Safety margin deducted from our clock before each search.
    #[serde(default = "default_move_overhead_ms")]
    pub move_overhead_ms: u64,
    /// Hard cap on any single search, regardless of clock.
    #[serde(default = "default_max_search_ms")]
    pub max_search_ms: u64,
}

fn default_protocol() -> EngineProtocol {
    EngineProtocol::Auto
}

fn default_time_mode() -> TimeMode {
    TimeMode::Clock
}

fn default_movetime_ms() -> u64 {
    5_000
}

fn default_depth() -> u32 {
    12
}

fn default_nodes() -> u64 {
    2_000_000
}

fn default_move_overhead_ms() -> u64 {
    100
}

fn default_max_search_ms() -> u64 {
    60_000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GameMode {
    Rated,
    Casual,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ChallengeConfig {
    #[serde(default = "default_variants")]
    pub variants: Vec<String>,
    #[serde(default = "default_time_controls")]
    pub time_controls: Vec<TimeControlCategory>,
    #[serde(default)]
    pub min_initial: u32,
    #[serde(default = "default_max_initial")]
    pub max_initial: u32,
    #[serde(default)]
    pub min_increment: u32,
    #[serde(default = "default_max_increment")]
    pub max_increment: u32,
    #[serde(default = "default_modes")]
    pub modes: Vec<GameMode>,
    #[serde(default = "default_true")]
    pub accept_bot: bool,
    #[serde(default)]
    pub only_bot: bool,
    /// Refuse games that start from an arbitrary position.
    #[serde(default)]
    pub standard_start_only: bool,
    #[serde(default)]
    pub block_list: Vec<String>,
}

fn default_variants() -> Vec<String> {
    vec!["standard".to_string()]
}

fn default_time_controls() -> Vec<TimeControlCategory> {
    vec![
        TimeControlCategory::Bullet,
        TimeControlCategory::Blitz,
        TimeControlCategory::Rapid,
        TimeControlCategory::Classical,
    ]
}

fn default_max_initial() -> u32 {
    10_800
}

fn default_max_increment() -> u32 {
    180
}

fn default_modes() -> Vec<GameMode> {
    vec![GameMode::Rated, GameMode::Casual]
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct MatchmakingTimeControl {
    #[serde(default = "default_mm_initial")]
    pub initial: u32,
    #[serde(default)]
    pub increment: u32,
}

impl Default for MatchmakingTimeControl {
    fn default() -> Self {
        MatchmakingTimeControl {
            initial: default_mm_initial(),
            increment: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MatchmakingConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_variant")]
    pub variant: String,
    #[serde(default)]
    pub time_control: MatchmakingTimeControl,
    #[serde(default)]
    pub rated: bool,
    #[serde(default)]
    pub opponents: Vec<String>,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,
}

fn default_variant() -> String {
    "standard".to_string()
}

fn default_mm_initial() -> u32 {
    180
}

fn default_poll_interval() -> u64 {
    60
}

fn default_cooldown() -> u64 {
    3_600
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DrawConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_score_window")]
    pub score_window_cp: u32,
    #[serde(default = "default_draw_min_moves")]
    pub min_moves: u32,
}

fn default_score_window() -> u32 {
    10
}

fn default_draw_min_moves() -> u32 {
    20
}

#[derive(Debug, Clone, Deserialize)]
pub struct TakebackConfig {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArchiveConfig {
    #[serde(default = "default_archive_path")]
    pub path: String,
}

fn default_archive_path() -> String {
    "games.pgn".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ChatConfig {
    #[serde(default)]
    pub ai_enabled: bool,
    #[serde(default = "default_ai_url")]
    pub ai_url: String,
    #[serde(default = "default_ai_model")]
    pub ai_model: String,
}

fn default_ai_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_ai_model() -> String {
    "llama3".to_string()
}

impl Default for ChatConfig {
    fn default() -> Self {
        ChatConfig {
            ai_enabled: false,
            ai_url: default_ai_url(),
            ai_model: default_ai_model(),
        }
    }
}

/// Whole-process configuration, loaded once at startup and immutable from
/// then on.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_url")]
    pub url: String,
    pub engine: EngineConfig,
    pub challenge: ChallengeConfig,
    #[serde(default = "default_max_games")]
    pub max_games: usize,
    pub matchmaking: MatchmakingConfig,
    pub draw: DrawConfig,
    pub takeback: TakebackConfig,
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default = "default_watchdog")]
    pub stream_watchdog_secs: u64,
    #[serde(default = "default_drain")]
    pub shutdown_drain_secs: u64,
}

fn default_url() -> String {
    "https://lichess.org".to_string()
}

fn default_max_games() -> usize {
    1
}

fn default_watchdog() -> u64 {
    60
}

fn default_drain() -> u64 {
    20
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
        let mut config: Config =
            serde_json::from_str(&raw).map_err(|e| ConfigError::Parse(e.to_string()))?;

        // The token may come from the environment instead of the file, so
        // that the file can be committed without the credential.
        if let Ok(token) = std::env::var("SERVICE_TOKEN") {
            config.token = token;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.token.is_empty() {
            return Err(ConfigError::Invalid(
                "token is required (file key `token` or SERVICE_TOKEN)".to_string(),
            ));
        }
        if self.engine.path.is_empty() {
            return Err(ConfigError::Invalid("engine.path is required".to_string()));
        }
        if self.max_games == 0 {
            return Err(ConfigError::Invalid(
                "max-games must be at least 1".to_string(),
            ));
        }
        if self.challenge.min_initial > self.challenge.max_initial {
            return Err(ConfigError::Invalid(
                "challenge.min-initial exceeds challenge.max-initial".to_string(),
            ));
        }
        if self.challenge.min_increment > self.challenge.max_increment {
            return Err(ConfigError::Invalid(
                "challenge.min-increment exceeds challenge.max-increment".to_string(),
            ));
        }
        if self.matchmaking.enabled && self.matchmaking.opponents.is_empty() {
            return Err(ConfigError::Invalid(
                "matchmaking.enabled requires a non-empty matchmaking.opponents pool".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_json() -> &'static str {
        r#"{
            "token": "xyz",
            "engine": {"path": "/usr/bin/stockfish"},
            "challenge": {},
            "matchmaking": {},
            "draw": {},
            "takeback": {},
            "archive": {}
        }"#
    }

    #[test]
    fn test_minimal_config_gets_defaults() {
        let config: Config = serde_json::from_str(minimal_json()).unwrap();
        config.validate().unwrap();

        assert_eq!(config.url, "https://lichess.org");
        assert_eq!(config.max_games, 1);
        assert_eq!(config.engine.protocol, EngineProtocol::Auto);
        assert_eq!(config.engine.time_mode, TimeMode::Clock);
        assert!(!config.engine.ponder);
        assert_eq!(config.engine.move_overhead_ms, 100);
        assert_eq!(config.challenge.variants, vec!["standard"]);
        assert!(!config.matchmaking.enabled);
        assert_eq!(config.stream_watchdog_secs, 60);
    }

    #[test]
    fn test_kebab_case_keys_parse() {
        let raw = r#"{
            "token": "xyz",
            "max-games": 4,
            "engine": {
                "path": "/opt/engine",
                "time-mode": "movetime",
                "movetime-ms": 2500,
                "move-overhead-ms": 250,
                "ponder": true
            },
            "challenge": {
                "min-initial": 60,
                "max-initial": 600,
                "time-controls": ["blitz", "rapid"],
                "only-bot": true
            },
            "matchmaking": {
                "enabled": true,
                "time-control": {"initial": 300, "increment": 3},
                "opponents": ["OtherBot"]
            },
            "draw": {"score-window-cp": 25, "min-moves": 40},
            "takeback": {"enabled": true},
            "archive": {"path": "/var/games/bot.pgn"}
        }"#;

        let config: Config = serde_json::from_str(raw).unwrap();
        config.validate().unwrap();

        assert_eq!(config.max_games, 4);
        assert_eq!(config.engine.time_mode, TimeMode::Movetime);
        assert_eq!(config.engine.movetime_ms, 2500);
        assert!(config.engine.ponder);
        assert_eq!(config.challenge.min_initial, 60);
        assert!(config.challenge.only_bot);
        assert_eq!(
            config.challenge.time_controls,
            vec![TimeControlCategory::Blitz, TimeControlCategory::Rapid]
        );
        assert_eq!(config.matchmaking.time_control.initial, 300);
        assert_eq!(config.matchmaking.time_control.increment, 3);
        assert_eq!(config.draw.score_window_cp, 25);
        assert!(config.takeback.enabled);
        assert_eq!(config.archive.path, "/var/games/bot.pgn");
    }

    #[test]
    fn test_missing_token_is_invalid() {
        let raw = minimal_json().replace(r#""token": "xyz","#, "");
        let config: Config = serde_json::from_str(&raw).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_inverted_bounds_are_invalid() {
        let mut config: Config = serde_json::from_str(minimal_json()).unwrap();
        config.challenge.min_initial = 600;
        config.challenge.max_initial = 60;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_matchmaking_requires_opponents() {
        let mut config: Config = serde_json::from_str(minimal_json()).unwrap();
        config.matchmaking.enabled = true;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
