#[derive(Debug)]
pub enum EngineError {
    /// The subprocess could not be started.
    Spawn(String),
    /// The binary answered neither the UCI nor the XBoard probe.
    Unsupported,
    /// The engine spoke, but not the dialect we expected.
    Protocol(String),
    /// The subprocess is gone; every further operation fails the same way.
    Dead,
    /// The engine produced output that is not a move.
    BadMove(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Spawn(msg) => write!(f, "Failed to spawn engine: {}", msg),
            EngineError::Unsupported => write!(f, "Engine speaks neither UCI nor XBoard"),
            EngineError::Protocol(msg) => write!(f, "Engine protocol error: {}", msg),
            EngineError::Dead => write!(f, "Engine process is dead"),
            EngineError::BadMove(output) => write!(f, "Engine produced a non-move: {}", output),
        }
    }
}

impl std::error::Error for EngineError {}
