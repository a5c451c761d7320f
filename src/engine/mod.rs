pub mod errors;
pub mod limits;
pub mod process;
pub mod uci;
pub mod xboard;

use async_trait::async_trait;
use tracing::info;

use crate::config::{EngineConfig, EngineProtocol};
use crate::engine::errors::EngineError;
use crate::engine::limits::SearchLimits;
use crate::engine::process::EngineProcess;
use crate::engine::uci::UciEngine;
use crate::engine::xboard::XBoardEngine;

#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    /// Best move in coordinate notation, e.g. "e7e8q".
    pub best_move: String,
    /// Last score the engine reported for this search, centipawns from its
    /// own point of view. Mate scores collapse to ±10000.
    pub score_cp: Option<i32>,
}

/// Capability surface of one engine dialect. One instance drives one
/// subprocess and belongs to exactly one game worker.
#[async_trait]
pub trait Engine: Send {
    fn name(&self) -> &str;

    fn dialect(&self) -> &'static str;

    /// Bring the engine to the given position: an optional FEN start plus
    /// the moves played since.
    async fn set_position(
        &mut self,
        initial_fen: Option<&str>,
        moves: &[String],
    ) -> Result<(), EngineError>;

    async fn search(&mut self, limits: &SearchLimits) -> Result<SearchResult, EngineError>;

    /// The pondered move was played. Only meaningful in UCI mode with
    /// pondering enabled; other dialects treat this as a no-op.
    async fn ponder_hit(&mut self) -> Result<(), EngineError>;

    /// Cancel any ongoing ponder search. Same UCI-only caveat as
    /// `ponder_hit`.
    async fn stop_ponder(&mut self) -> Result<(), EngineError>;

    async fn quit(&mut self);
}

/// Spawn the configured engine binary and run the dialect handshake.
/// `Auto` probes UCI first and falls back to XBoard on a fresh process,
/// since a failed probe can leave an engine in an undefined state.
pub async fn spawn(config: &EngineConfig) -> Result<Box<dyn Engine>, EngineError> {
    match config.protocol {
        EngineProtocol::Uci => {
            let process = spawn_process(config).await?;
            Ok(Box::new(
                UciEngine::handshake(process, &config.options, config.ponder).await?,
            ))
        }
        EngineProtocol::Xboard => {
            let process = spawn_process(config).await?;
            Ok(Box::new(
                XBoardEngine::handshake(process, &config.options, config.ponder).await?,
            ))
        }
        EngineProtocol::Auto => {
            let process = spawn_process(config).await?;
            match UciEngine::handshake(process, &config.options, config.ponder).await {
                Ok(engine) => Ok(Box::new(engine)),
                Err(EngineError::Unsupported) | Err(EngineError::Dead) => {
                    info!("Engine did not answer the UCI probe, trying XBoard");
                    let process = spawn_process(config).await?;
                    Ok(Box::new(
                        XBoardEngine::handshake(process, &config.options, config.ponder).await?,
                    ))
                }
                Err(other) => Err(other),
            }
        }
    }
}

async fn spawn_process(config: &EngineConfig) -> Result<EngineProcess, EngineError> {
    EngineProcess::spawn(&config.path, &config.args, config.working_dir.as_deref()).await
}

/// Syntactic shape of a coordinate-notation move: from-square, to-square,
/// optional promotion piece. Legality is the position model's concern.
pub fn looks_like_uci_move(mv: &str) -> bool {
    let bytes = mv.as_bytes();
    if bytes.len() != 4 && bytes.len() != 5 {
        return false;
    }
    let square = |file: u8, rank: u8| (b'a'..=b'h').contains(&file) && (b'1'..=b'8').contains(&rank);
    if !square(bytes[0], bytes[1]) || !square(bytes[2], bytes[3]) {
        return false;
    }
    bytes.len() == 4 || matches!(bytes[4], b'q' | b'r' | b'b' | b'n')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_move_shapes() {
        assert!(looks_like_uci_move("e2e4"));
        assert!(looks_like_uci_move("e7e8q"));
        assert!(looks_like_uci_move("a1h8"));
        assert!(!looks_like_uci_move("e2"));
        assert!(!looks_like_uci_move("e2e9"));
        assert!(!looks_like_uci_move("i2e4"));
        assert!(!looks_like_uci_move("e7e8k"));
        assert!(!looks_like_uci_move("O-O"));
        assert!(!looks_like_uci_move("(none)"));
    }
}
