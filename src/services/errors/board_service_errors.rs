#[derive(Debug)]
pub enum BoardServiceError {
    InvalidPosition(String),
    InvalidMove(String),
    IllegalMove(String),
}

impl std::fmt::Display for BoardServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BoardServiceError::InvalidPosition(msg) => write!(f, "Invalid position: {}", msg),
            BoardServiceError::InvalidMove(msg) => write!(f, "Invalid move: {}", msg),
            BoardServiceError::IllegalMove(msg) => write!(f, "Illegal move: {}", msg),
        }
    }
}

impl std::error::Error for BoardServiceError {}
