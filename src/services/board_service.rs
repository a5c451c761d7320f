use std::str::FromStr;

use chess::{Board, ChessMove, MoveGen, Piece, Square};

use crate::services::errors::board_service_errors::BoardServiceError;

/// Local position model for standard-rules games. The service is the final
/// arbiter of legality; this is the gate that keeps us from ever submitting
/// a move we can already see is impossible.
pub struct BoardService;

impl BoardService {
    /// Rebuild the position from an optional FEN start and the moves played
    /// since.
    pub fn replay(initial_fen: Option<&str>, moves: &[String]) -> Result<Board, BoardServiceError> {
        let mut board = match initial_fen {
            None => Board::default(),
            Some(fen) => Board::from_str(fen)
                .map_err(|e| BoardServiceError::InvalidPosition(format!("bad FEN: {}", e)))?,
        };

        for mv in moves {
            let chess_move = Self::parse_uci_move(mv)?;
            if !Self::is_legal(&board, chess_move) {
                return Err(BoardServiceError::IllegalMove(format!(
                    "{} is not legal in the replayed position",
                    mv
                )));
            }
            let mut next = board;
            board.make_move(chess_move, &mut next);
            board = next;
        }

        Ok(board)
    }

    /// Parse coordinate notation into a move. Castling arrives as a king
    /// move of two squares, which is exactly how the move generator encodes
    /// it, so no special casing is needed.
    pub fn parse_uci_move(mv: &str) -> Result<ChessMove, BoardServiceError> {
        if mv.len() != 4 && mv.len() != 5 {
            return Err(BoardServiceError::InvalidMove(mv.to_string()));
        }

        let from = Square::from_str(&mv[0..2])
            .map_err(|_| BoardServiceError::InvalidMove(mv.to_string()))?;
        let to = Square::from_str(&mv[2..4])
            .map_err(|_| BoardServiceError::InvalidMove(mv.to_string()))?;

        let promotion = match mv.get(4..5) {
            None => None,
            Some("q") => Some(Piece::Queen),
            Some("r") => Some(Piece::Rook),
            Some("b") => Some(Piece::Bishop),
            Some("n") => Some(Piece::Knight),
            Some(_) => return Err(BoardServiceError::InvalidMove(mv.to_string())),
        };

        Ok(ChessMove::new(from, to, promotion))
    }

    pub fn is_legal(board: &Board, chess_move: ChessMove) -> bool {
        let legal_moves: Vec<ChessMove> = MoveGen::new_legal(board).collect();
        legal_moves.contains(&chess_move)
    }

    /// Full gate for an engine move: rebuild the position and check the
    /// move against it.
    pub fn check_move(
        initial_fen: Option<&str>,
        moves: &[String],
        uci: &str,
    ) -> Result<(), BoardServiceError> {
        let board = Self::replay(initial_fen, moves)?;
        let chess_move = Self::parse_uci_move(uci)?;
        if Self::is_legal(&board, chess_move) {
            Ok(())
        } else {
            Err(BoardServiceError::IllegalMove(uci.to_string()))
        }
    }
}
