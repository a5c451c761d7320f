use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{info, warn};

use crate::engine::errors::EngineError;
use crate::engine::limits::SearchLimits;
use crate::engine::process::EngineProcess;
use crate::engine::{looks_like_uci_move, Engine, SearchResult};
use crate::models::Color;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const MOVE_NOW_GRACE: Duration = Duration::from_secs(2);

pub struct XBoardEngine {
    process: EngineProcess,
    name: String,
    /// The engine announced `feature usermove=1`.
    usermove_prefix: bool,
    /// Side the engine will play when `go` is sent; kept in sync by
    /// `set_position`.
    side_to_move: Color,
}

impl XBoardEngine {
    /// Probe with `xboard` + `protover 2`. Seeing at least one `feature`
    /// line within the handshake interval counts as speaking the dialect.
    pub(crate) async fn handshake(
        mut process: EngineProcess,
        options: &HashMap<String, String>,
        ponder: bool,
    ) -> Result<Self, EngineError> {
        process.send_line("xboard").await?;
        process.send_line("protover 2").await?;

        let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
        let mut name = "unknown engine".to_string();
        let mut usermove_prefix = false;
        let mut saw_feature = false;

        loop {
            match process.read_line_until(deadline).await? {
                None => break,
                Some(line) => {
                    let line = line.trim();
                    if let Some(features) = line.strip_prefix("feature ") {
                        saw_feature = true;
                        for feature in features.split_whitespace() {
                            if let Some(value) = feature.strip_prefix("myname=") {
                                name = value.trim_matches('"').to_string();
                            } else if feature == "usermove=1" {
                                usermove_prefix = true;
                            }
                        }
                        if features.contains("done=1") {
                            break;
                        }
                    }
                }
            }
        }

        if !saw_feature {
            return Err(EngineError::Unsupported);
        }

        for (key, value) in sorted(options) {
            process.send_line(&format!("option {}={}", key, value)).await?;
        }
        process.send_line("post").await?;
        // Pondering is a session toggle in this dialect.
        process
            .send_line(if ponder { "hard" } else { "easy" })
            .await?;
        process.send_line("new").await?;
        process.send_line("force").await?;

        info!("XBoard engine ready: {}", name);
        Ok(XBoardEngine {
            process,
            name,
            usermove_prefix,
            side_to_move: Color::White,
        })
    }
}

fn sorted(options: &HashMap<String, String>) -> Vec<(&String, &String)> {
    let mut entries: Vec<(&String, &String)> = options.iter().collect();
    entries.sort_by_key(|(k, _)| k.as_str());
    entries
}

#[async_trait]
impl Engine for XBoardEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn dialect(&self) -> &'static str {
        "xboard"
    }

    /// The dialect has no incremental position command, so the game is
    /// rebuilt from scratch: `new`/`force`, an optional `setboard`, then
    /// every move so far.
    async fn set_position(
        &mut self,
        initial_fen: Option<&str>,
        moves: &[String],
    ) -> Result<(), EngineError> {
        self.process.send_line("new").await?;
        self.process.send_line("force").await?;

        let mut to_move = Color::White;
        if let Some(fen) = initial_fen {
            self.process.send_line(&format!("setboard {}", fen)).await?;
            if fen.split_whitespace().nth(1) == Some("b") {
                to_move = Color::Black;
            }
        }

        for mv in moves {
            let line = if self.usermove_prefix {
                format!("usermove {}", mv)
            } else {
                mv.clone()
            };
            self.process.send_line(&line).await?;
            to_move = to_move.other();
        }

        self.side_to_move = to_move;
        Ok(())
    }

    async fn search(&mut self, limits: &SearchLimits) -> Result<SearchResult, EngineError> {
        let (own, opponent) = match self.side_to_move {
            Color::White => (limits.wtime, limits.btime),
            Color::Black => (limits.btime, limits.wtime),
        };
        // XBoard clocks are centiseconds.
        self.process
            .send_line(&format!("time {}", own.as_millis() / 10))
            .await?;
        self.process
            .send_line(&format!("otim {}", opponent.as_millis() / 10))
            .await?;

        if let Some(depth) = limits.depth {
            self.process.send_line(&format!("sd {}", depth)).await?;
        }
        if let Some(movetime) = limits.movetime {
            self.process
                .send_line(&format!("st {}", movetime.as_secs().max(1)))
                .await?;
        }
        // The dialect has no node-count limit; the clock fields already
        // bound the search in that mode.

        self.process.send_line("go").await?;

        let mut deadline = Instant::now() + limits.deadline;
        let mut nudged = false;
        let mut last_score: Option<i32> = None;

        loop {
            match self.process.read_line_until(deadline).await? {
                Some(line) => {
                    let line = line.trim();
                    if let Some(mv) = line.strip_prefix("move ") {
                        let mv = mv.trim().to_string();
                        // Stop the engine from playing on by itself once
                        // the opponent answers.
                        self.process.send_line("force").await?;
                        self.side_to_move = self.side_to_move.other();
                        if !looks_like_uci_move(&mv) {
                            return Err(EngineError::BadMove(line.to_string()));
                        }
                        return Ok(SearchResult {
                            best_move: mv,
                            score_cp: last_score,
                        });
                    }
                    if let Some(score) = parse_thinking_score(line) {
                        last_score = Some(score);
                    }
                }
                None if !nudged => {
                    warn!("Search deadline hit after {:?}, sending move-now", limits.deadline);
                    self.process.send_line("?").await?;
                    nudged = true;
                    deadline = Instant::now() + MOVE_NOW_GRACE;
                }
                None => {
                    return Err(EngineError::Protocol(
                        "no move after move-now".to_string(),
                    ))
                }
            }
        }
    }

    /// The dialect has no ponder-hit exchange; `hard`/`easy` at handshake
    /// is the whole story.
    async fn ponder_hit(&mut self) -> Result<(), EngineError> {
        Ok(())
    }

    async fn stop_ponder(&mut self) -> Result<(), EngineError> {
        Ok(())
    }

    async fn quit(&mut self) {
        self.process.shutdown("quit").await;
    }
}

/// Thinking output has the shape `<ply> <score> <time> <nodes> <pv...>`,
/// with the score in centipawns.
fn parse_thinking_score(line: &str) -> Option<i32> {
    let mut tokens = line.split_whitespace();
    let ply = tokens.next()?;
    if ply.parse::<u32>().is_err() {
        return None;
    }
    let score = tokens.next()?.parse().ok()?;
    // Require the time and node fields so bare numbers are not mistaken
    // for thinking lines.
    tokens.next()?.parse::<i64>().ok()?;
    tokens.next()?.parse::<i64>().ok()?;
    Some(score)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thinking_line_score() {
        assert_eq!(parse_thinking_score("9 156 1042 205324 d2d4 d7d5"), Some(156));
        assert_eq!(parse_thinking_score("12 -38 2500 1000000 e7e5"), Some(-38));
    }

    #[test]
    fn test_non_thinking_lines_are_ignored() {
        assert_eq!(parse_thinking_score("move e2e4"), None);
        assert_eq!(parse_thinking_score("# debug chatter"), None);
        assert_eq!(parse_thinking_score("42"), None);
    }
}
