use chess::{Board, ChessMove, MoveGen, Piece};
use chrono::{DateTime, Utc};

use crate::models::{Color, GameStatus};
use crate::services::board_service::BoardService;

/// Everything the archiver needs to write one finished game.
#[derive(Debug, Clone)]
pub struct GameRecord {
    pub game_id: String,
    pub site: String,
    pub white: String,
    pub black: String,
    pub variant: String,
    pub time_control: String,
    pub rated: bool,
    pub initial_fen: Option<String>,
    pub moves: Vec<String>,
    /// Remaining clock after each half-move, where the stream supplied one.
    pub clocks_ms: Vec<Option<u64>>,
    pub status: GameStatus,
    pub winner: Option<Color>,
    pub finished_at: DateTime<Utc>,
}

impl GameRecord {
    pub fn result_token(&self) -> &'static str {
        match self.winner {
            Some(Color::White) => "1-0",
            Some(Color::Black) => "0-1",
            None => match self.status {
                GameStatus::Draw | GameStatus::Stalemate => "1/2-1/2",
                _ => "*",
            },
        }
    }
}

/// Render a finished game as PGN: the seven required tag pairs first, in
/// order, then ours, then the movetext with clock annotations.
pub fn format_pgn(record: &GameRecord) -> String {
    let mut out = String::new();

    let event = format!(
        "{} {} game",
        if record.rated { "Rated" } else { "Casual" },
        record.variant
    );
    push_tag(&mut out, "Event", &event);
    push_tag(&mut out, "Site", &record.site);
    push_tag(
        &mut out,
        "Date",
        &record.finished_at.format("%Y.%m.%d").to_string(),
    );
    push_tag(&mut out, "Round", "-");
    push_tag(&mut out, "White", &record.white);
    push_tag(&mut out, "Black", &record.black);
    push_tag(&mut out, "Result", record.result_token());
    push_tag(&mut out, "Variant", &record.variant);
    push_tag(&mut out, "TimeControl", &record.time_control);
    push_tag(&mut out, "Termination", record.status.as_tag());
    if let Some(fen) = nonstandard_fen(record) {
        push_tag(&mut out, "SetUp", "1");
        push_tag(&mut out, "FEN", fen);
    }
    out.push('\n');

    let tokens = movetext_tokens(record);
    let mut line_len = 0usize;
    for token in tokens.iter().chain(std::iter::once(&record.result_token().to_string())) {
        if line_len > 0 && line_len + token.len() + 1 > 80 {
            out.push('\n');
            line_len = 0;
        } else if line_len > 0 {
            out.push(' ');
            line_len += 1;
        }
        out.push_str(token);
        line_len += token.len();
    }
    out.push_str("\n\n");
    out
}

fn push_tag(out: &mut String, tag: &str, value: &str) {
    out.push_str(&format!("[{} \"{}\"]\n", tag, value));
}

fn nonstandard_fen(record: &GameRecord) -> Option<&str> {
    match record.initial_fen.as_deref() {
        None | Some("startpos") => None,
        Some(fen) => Some(fen),
    }
}

/// Movetext as numbered SAN with `[%clk]` comments. Positions the local
/// rules model cannot replay (non-standard variants) fall back to bare
/// coordinate moves, which remains valid-enough PGN for the archive.
fn movetext_tokens(record: &GameRecord) -> Vec<String> {
    san_tokens(record).unwrap_or_else(|| raw_tokens(record))
}

fn san_tokens(record: &GameRecord) -> Option<Vec<String>> {
    if record.variant != "standard" && record.variant != "fromPosition" {
        return None;
    }

    let fen = nonstandard_fen(record);
    let mut board = BoardService::replay(fen, &[]).ok()?;
    let mut move_number: u32 = fen
        .and_then(|f| f.split_whitespace().nth(5))
        .and_then(|n| n.parse().ok())
        .unwrap_or(1);

    let mut tokens = Vec::new();
    for (i, mv) in record.moves.iter().enumerate() {
        let chess_move = BoardService::parse_uci_move(mv).ok()?;
        if !BoardService::is_legal(&board, chess_move) {
            return None;
        }

        match board.side_to_move() {
            chess::Color::White => tokens.push(format!("{}.", move_number)),
            chess::Color::Black => {
                if i == 0 {
                    tokens.push(format!("{}...", move_number));
                }
            }
        }

        let mut next = board;
        board.make_move(chess_move, &mut next);
        tokens.push(san(&board, &next, chess_move));
        if board.side_to_move() == chess::Color::Black {
            move_number += 1;
        }
        board = next;

        if let Some(Some(clock)) = record.clocks_ms.get(i) {
            tokens.push(format!("{{[%clk {}]}}", clock_comment(*clock)));
        }
    }
    Some(tokens)
}

fn raw_tokens(record: &GameRecord) -> Vec<String> {
    record.moves.clone()
}

fn clock_comment(ms: u64) -> String {
    let total_secs = ms / 1000;
    format!(
        "{}:{:02}:{:02}",
        total_secs / 3600,
        (total_secs % 3600) / 60,
        total_secs % 60
    )
}

/// Standard algebraic notation for a move that is known to be legal on
/// `board`; `next` is the position after it.
fn san(board: &Board, next: &Board, chess_move: ChessMove) -> String {
    let from = chess_move.get_source();
    let to = chess_move.get_dest();
    let piece = match board.piece_on(from) {
        Some(piece) => piece,
        None => return format!("{}", chess_move),
    };

    let mut san = String::new();

    let from_file = from.get_file().to_index();
    let to_file = to.get_file().to_index();
    if piece == Piece::King && (from_file as i32 - to_file as i32).abs() == 2 {
        san.push_str(if to_file > from_file { "O-O" } else { "O-O-O" });
    } else {
        if piece != Piece::Pawn {
            san.push(piece_letter(piece));
            san.push_str(&disambiguation(board, piece, chess_move));
        }

        // En passant shows up as a pawn capture onto an empty square.
        let is_capture = board.piece_on(to).is_some()
            || (piece == Piece::Pawn && from_file != to_file);
        if is_capture {
            if piece == Piece::Pawn {
                san.push(file_char(from_file));
            }
            san.push('x');
        }

        san.push(file_char(to_file));
        san.push(rank_char(to.get_rank().to_index()));

        if let Some(promotion) = chess_move.get_promotion() {
            san.push('=');
            san.push(piece_letter(promotion));
        }
    }

    if next.checkers().popcnt() > 0 {
        if MoveGen::new_legal(next).len() == 0 {
            san.push('#');
        } else {
            san.push('+');
        }
    }
    san
}

/// File or rank qualifier when another piece of the same kind could also
/// reach the destination.
fn disambiguation(board: &Board, piece: Piece, chess_move: ChessMove) -> String {
    let from = chess_move.get_source();
    let to = chess_move.get_dest();

    let rivals: Vec<ChessMove> = MoveGen::new_legal(board)
        .filter(|other| {
            other.get_dest() == to
                && other.get_source() != from
                && board.piece_on(other.get_source()) == Some(piece)
        })
        .collect();
    if rivals.is_empty() {
        return String::new();
    }

    let same_file = rivals
        .iter()
        .any(|other| other.get_source().get_file() == from.get_file());
    if !same_file {
        file_char(from.get_file().to_index()).to_string()
    } else {
        let same_rank = rivals
            .iter()
            .any(|other| other.get_source().get_rank() == from.get_rank());
        if !same_rank {
            rank_char(from.get_rank().to_index()).to_string()
        } else {
            format!(
                "{}{}",
                file_char(from.get_file().to_index()),
                rank_char(from.get_rank().to_index())
            )
        }
    }
}

fn piece_letter(piece: Piece) -> char {
    match piece {
        Piece::King => 'K',
        Piece::Queen => 'Q',
        Piece::Rook => 'R',
        Piece::Bishop => 'B',
        Piece::Knight => 'N',
        Piece::Pawn => 'P',
    }
}

fn file_char(file: usize) -> char {
    (b'a' + file as u8) as char
}

fn rank_char(rank: usize) -> char {
    (b'1' + rank as u8) as char
}
