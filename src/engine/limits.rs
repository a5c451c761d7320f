use std::time::Duration;

use crate::config::{EngineConfig, TimeMode};
use crate::models::{Color, GameState};

/// Fraction of our remaining clock a single search may consume before the
/// adapter forces a stop.
const SAFETY_FRACTION: f64 = 0.5;
/// No search deadline is ever shorter than this.
const DEADLINE_FLOOR: Duration = Duration::from_millis(100);
/// Extra room on top of a fixed movetime before the stop is sent.
const MOVETIME_GRACE: Duration = Duration::from_millis(500);

/// Limits for one search call. All clock fields are always populated;
/// exactly one limit mode (chosen by configuration) decides what is sent to
/// the engine, and `deadline` bounds the call regardless of mode.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchLimits {
    pub wtime: Duration,
    pub btime: Duration,
    pub winc: Duration,
    pub binc: Duration,
    pub moves_to_go: Option<u32>,
    pub depth: Option<u32>,
    pub nodes: Option<u64>,
    pub movetime: Option<Duration>,
    pub ponder: bool,
    /// Hard wall-clock bound on the search, stop included.
    pub deadline: Duration,
}

impl SearchLimits {
    /// Derive limits for our next move from the game clocks and the
    /// configured time mode. The move overhead is deducted from our own
    /// clock so network latency never runs us out of time.
    pub fn from_game(state: &GameState, our_color: Color, config: &EngineConfig) -> SearchLimits {
        let overhead = Duration::from_millis(config.move_overhead_ms);
        let mut wtime = Duration::from_millis(state.wtime_ms);
        let mut btime = Duration::from_millis(state.btime_ms);
        match our_color {
            Color::White => wtime = wtime.saturating_sub(overhead),
            Color::Black => btime = btime.saturating_sub(overhead),
        }

        let (depth, nodes, movetime) = match config.time_mode {
            TimeMode::Clock => (None, None, None),
            TimeMode::Depth => (Some(config.depth), None, None),
            TimeMode::Nodes => (None, Some(config.nodes), None),
            TimeMode::Movetime => (None, None, Some(Duration::from_millis(config.movetime_ms))),
        };

        let our_remaining = match our_color {
            Color::White => wtime,
            Color::Black => btime,
        };
        let has_clock = state.wtime_ms != 0 || state.btime_ms != 0;
        let cap = Duration::from_millis(config.max_search_ms);
        let deadline = Self::derive_deadline(our_remaining, movetime, cap, has_clock);

        SearchLimits {
            wtime,
            btime,
            winc: Duration::from_millis(state.winc_ms),
            binc: Duration::from_millis(state.binc_ms),
            moves_to_go: None,
            depth,
            nodes,
            movetime,
            ponder: config.ponder,
            deadline,
        }
    }

    fn derive_deadline(
        our_remaining: Duration,
        movetime: Option<Duration>,
        cap: Duration,
        has_clock: bool,
    ) -> Duration {
        let budget = match movetime {
            Some(movetime) => movetime + MOVETIME_GRACE,
            // No clock at all (unlimited or correspondence): the cap is the
            // only bound.
            None if !has_clock => cap,
            None => our_remaining.mul_f64(SAFETY_FRACTION),
        };
        budget.min(cap).max(DEADLINE_FLOOR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::GameStatus;

    fn engine_config(time_mode: TimeMode) -> EngineConfig {
        serde_json::from_value(serde_json::json!({
            "path": "/usr/bin/stockfish",
            "time-mode": match time_mode {
                TimeMode::Clock => "clock",
                TimeMode::Movetime => "movetime",
                TimeMode::Depth => "depth",
                TimeMode::Nodes => "nodes",
            },
        }))
        .unwrap()
    }

    fn state(wtime_ms: u64, btime_ms: u64, inc_ms: u64) -> GameState {
        GameState {
            moves: vec![],
            wtime_ms,
            btime_ms,
            winc_ms: inc_ms,
            binc_ms: inc_ms,
            status: GameStatus::Started,
            winner: None,
            white_offers_draw: false,
            black_offers_draw: false,
            white_asks_takeback: false,
            black_asks_takeback: false,
        }
    }

    #[test]
    fn test_overhead_is_deducted_from_our_clock_only() {
        let config = engine_config(TimeMode::Clock);
        let limits = SearchLimits::from_game(&state(10_000, 8_000, 0), Color::White, &config);
        assert_eq!(limits.wtime, Duration::from_millis(9_900));
        assert_eq!(limits.btime, Duration::from_millis(8_000));
    }

    #[test]
    fn test_overhead_never_goes_negative() {
        let config = engine_config(TimeMode::Clock);
        let limits = SearchLimits::from_game(&state(50, 8_000, 0), Color::White, &config);
        assert_eq!(limits.wtime, Duration::ZERO);
        // And the deadline still respects its floor.
        assert_eq!(limits.deadline, Duration::from_millis(100));
    }

    #[test]
    fn test_deadline_floor_applies_on_tiny_clocks() {
        let config = engine_config(TimeMode::Clock);
        let limits = SearchLimits::from_game(&state(150, 150, 0), Color::White, &config);
        assert_eq!(limits.deadline, Duration::from_millis(100));
    }

    #[test]
    fn test_deadline_is_half_the_remaining_clock() {
        let config = engine_config(TimeMode::Clock);
        let limits = SearchLimits::from_game(&state(60_100, 60_000, 0), Color::White, &config);
        assert_eq!(limits.deadline, Duration::from_secs(30));
    }

    #[test]
    fn test_deadline_is_capped() {
        let config = engine_config(TimeMode::Clock);
        let limits =
            SearchLimits::from_game(&state(1_000_000_000, 1_000_000, 0), Color::White, &config);
        assert_eq!(limits.deadline, Duration::from_millis(config.max_search_ms));
    }

    #[test]
    fn test_movetime_mode_sets_movetime_and_grace() {
        let config = engine_config(TimeMode::Movetime);
        let limits = SearchLimits::from_game(&state(60_000, 60_000, 0), Color::Black, &config);
        assert_eq!(limits.movetime, Some(Duration::from_millis(5_000)));
        assert_eq!(limits.deadline, Duration::from_millis(5_500));
        assert_eq!(limits.depth, None);
        assert_eq!(limits.nodes, None);
    }

    #[test]
    fn test_depth_and_nodes_modes_pick_one_limit() {
        let depth = SearchLimits::from_game(
            &state(60_000, 60_000, 0),
            Color::White,
            &engine_config(TimeMode::Depth),
        );
        assert!(depth.depth.is_some() && depth.nodes.is_none() && depth.movetime.is_none());

        let nodes = SearchLimits::from_game(
            &state(60_000, 60_000, 0),
            Color::White,
            &engine_config(TimeMode::Nodes),
        );
        assert!(nodes.nodes.is_some() && nodes.depth.is_none() && nodes.movetime.is_none());
    }

    #[test]
    fn test_unlimited_clock_uses_the_cap() {
        let config = engine_config(TimeMode::Clock);
        let limits = SearchLimits::from_game(&state(0, 0, 0), Color::White, &config);
        assert_eq!(limits.deadline, Duration::from_millis(config.max_search_ms));
    }

    #[test]
    fn test_ponder_flag_follows_the_config() {
        let mut config = engine_config(TimeMode::Clock);
        let limits = SearchLimits::from_game(&state(60_000, 60_000, 0), Color::White, &config);
        assert!(!limits.ponder);

        config.ponder = true;
        let limits = SearchLimits::from_game(&state(60_000, 60_000, 0), Color::White, &config);
        assert!(limits.ponder);
    }
}
