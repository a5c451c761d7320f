use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{info, warn};

use crate::engine::errors::EngineError;
use crate::engine::limits::SearchLimits;
use crate::engine::process::EngineProcess;
use crate::engine::{looks_like_uci_move, Engine, SearchResult};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const READY_TIMEOUT: Duration = Duration::from_secs(30);
/// Extra time the engine gets to answer `stop` with its bestmove.
const STOP_GRACE: Duration = Duration::from_secs(2);

pub struct UciEngine {
    process: EngineProcess,
    name: String,
    ponder_enabled: bool,
}

impl UciEngine {
    /// Probe the process with `uci`. An engine that does not identify
    /// itself within the handshake interval is reported as unsupported so
    /// the caller can try the other dialect on a fresh process.
    pub(crate) async fn handshake(
        mut process: EngineProcess,
        options: &HashMap<String, String>,
        ponder: bool,
    ) -> Result<Self, EngineError> {
        process.send_line("uci").await?;

        let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
        let mut name = "unknown engine".to_string();
        loop {
            match process.read_line_until(deadline).await? {
                None => return Err(EngineError::Unsupported),
                Some(line) => {
                    if let Some(id) = line.strip_prefix("id name ") {
                        name = id.trim().to_string();
                    } else if line.trim() == "uciok" {
                        break;
                    }
                }
            }
        }

        // Deterministic option order keeps engine logs reproducible.
        let mut keys: Vec<&String> = options.keys().collect();
        keys.sort();
        for key in keys {
            process
                .send_line(&format!("setoption name {} value {}", key, options[key]))
                .await?;
        }
        if ponder {
            process.send_line("setoption name Ponder value true").await?;
        }

        process.send_line("isready").await?;
        let ready_deadline = Instant::now() + READY_TIMEOUT;
        loop {
            match process.read_line_until(ready_deadline).await? {
                None => {
                    return Err(EngineError::Protocol(
                        "no readyok after isready".to_string(),
                    ))
                }
                Some(line) if line.trim() == "readyok" => break,
                Some(_) => continue,
            }
        }

        process.send_line("ucinewgame").await?;

        info!("UCI engine ready: {}", name);
        Ok(UciEngine {
            process,
            name,
            ponder_enabled: ponder,
        })
    }
}

#[async_trait]
impl Engine for UciEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn dialect(&self) -> &'static str {
        "uci"
    }

    async fn set_position(
        &mut self,
        initial_fen: Option<&str>,
        moves: &[String],
    ) -> Result<(), EngineError> {
        let mut command = match initial_fen {
            Some(fen) => format!("position fen {}", fen),
            None => "position startpos".to_string(),
        };
        if !moves.is_empty() {
            command.push_str(" moves ");
            command.push_str(&moves.join(" "));
        }
        self.process.send_line(&command).await
    }

    async fn search(&mut self, limits: &SearchLimits) -> Result<SearchResult, EngineError> {
        self.process.send_line(&go_command(limits)).await?;

        let mut deadline = Instant::now() + limits.deadline;
        let mut stopped = false;
        let mut last_score: Option<i32> = None;

        loop {
            match self.process.read_line_until(deadline).await? {
                Some(line) => {
                    if line.starts_with("info ") {
                        if let Some(score) = parse_info_score(&line) {
                            last_score = Some(score);
                        }
                    } else if let Some(rest) = line.strip_prefix("bestmove") {
                        let best_move = rest
                            .split_whitespace()
                            .next()
                            .unwrap_or_default()
                            .to_string();
                        if !looks_like_uci_move(&best_move) {
                            return Err(EngineError::BadMove(line));
                        }
                        return Ok(SearchResult {
                            best_move,
                            score_cp: last_score,
                        });
                    }
                }
                None if !stopped => {
                    // Deadline reached: force the engine to conclude.
                    warn!("Search deadline hit after {:?}, stopping", limits.deadline);
                    self.process.send_line("stop").await?;
                    stopped = true;
                    deadline = Instant::now() + STOP_GRACE;
                }
                None => {
                    return Err(EngineError::Protocol(
                        "no bestmove after stop".to_string(),
                    ))
                }
            }
        }
    }

    async fn ponder_hit(&mut self) -> Result<(), EngineError> {
        if !self.ponder_enabled {
            return Ok(());
        }
        self.process.send_line("ponderhit").await
    }

    async fn stop_ponder(&mut self) -> Result<(), EngineError> {
        if !self.ponder_enabled {
            return Ok(());
        }
        self.process.send_line("stop").await
    }

    async fn quit(&mut self) {
        self.process.shutdown("quit").await;
    }
}

fn go_command(limits: &SearchLimits) -> String {
    if let Some(movetime) = limits.movetime {
        return format!("go movetime {}", movetime.as_millis());
    }
    if let Some(depth) = limits.depth {
        return format!("go depth {}", depth);
    }
    if let Some(nodes) = limits.nodes {
        return format!("go nodes {}", nodes);
    }
    let mut command = format!(
        "go wtime {} btime {} winc {} binc {}",
        limits.wtime.as_millis(),
        limits.btime.as_millis(),
        limits.winc.as_millis(),
        limits.binc.as_millis()
    );
    if let Some(moves_to_go) = limits.moves_to_go {
        command.push_str(&format!(" movestogo {}", moves_to_go));
    }
    command
}

/// Extract the centipawn score from an `info` line. Mate scores collapse to
/// ±10000 so the draw window and chat eval can treat them uniformly.
fn parse_info_score(line: &str) -> Option<i32> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let pos = tokens.iter().position(|t| *t == "score")?;
    match tokens.get(pos + 1) {
        Some(&"cp") => tokens.get(pos + 2)?.parse().ok(),
        Some(&"mate") => {
            let mate: i32 = tokens.get(pos + 2)?.parse().ok()?;
            Some(if mate >= 0 { 10_000 } else { -10_000 })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> SearchLimits {
        SearchLimits {
            wtime: Duration::from_millis(178_000),
            btime: Duration::from_millis(180_000),
            winc: Duration::from_millis(2_000),
            binc: Duration::from_millis(2_000),
            moves_to_go: None,
            depth: None,
            nodes: None,
            movetime: None,
            ponder: false,
            deadline: Duration::from_secs(30),
        }
    }

    #[test]
    fn test_go_command_clock_mode() {
        assert_eq!(
            go_command(&limits()),
            "go wtime 178000 btime 180000 winc 2000 binc 2000"
        );
    }

    #[test]
    fn test_go_command_single_limit_modes() {
        let mut fixed = limits();
        fixed.movetime = Some(Duration::from_millis(2_500));
        assert_eq!(go_command(&fixed), "go movetime 2500");

        let mut fixed = limits();
        fixed.depth = Some(10);
        assert_eq!(go_command(&fixed), "go depth 10");

        let mut fixed = limits();
        fixed.nodes = Some(500_000);
        assert_eq!(go_command(&fixed), "go nodes 500000");
    }

    #[test]
    fn test_info_score_parsing() {
        assert_eq!(
            parse_info_score("info depth 12 score cp 35 nodes 100000 pv e2e4"),
            Some(35)
        );
        assert_eq!(
            parse_info_score("info depth 20 score cp -250 time 1000"),
            Some(-250)
        );
        assert_eq!(
            parse_info_score("info depth 25 score mate 3 pv h7h8q"),
            Some(10_000)
        );
        assert_eq!(
            parse_info_score("info depth 25 score mate -2"),
            Some(-10_000)
        );
        assert_eq!(parse_info_score("info depth 12 nodes 4000"), None);
    }
}
