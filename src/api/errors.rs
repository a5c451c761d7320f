use std::time::Duration;

/// Error kinds surfaced by the remote client. Everything the rest of the
/// program needs to know about a failed call is the kind; the payload is
/// context for logs.
#[derive(Debug)]
pub enum ApiError {
    Transport(String),
    /// 429 with the parsed Retry-After hint, when one was supplied.
    RateLimited(Option<Duration>),
    Unauthorized,
    NotFound,
    /// The service refused the action in its current state (move already
    /// played, illegal move, challenge no longer open).
    Conflict,
    Server(u16),
    /// The stream idle watchdog fired.
    Stalled,
    Cancelled,
    /// Unexpected frame or body shape.
    Protocol(String),
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::Transport(msg) => write!(f, "Transport error: {}", msg),
            ApiError::RateLimited(Some(d)) => {
                write!(f, "Rate limited, retry after {}s", d.as_secs())
            }
            ApiError::RateLimited(None) => write!(f, "Rate limited"),
            ApiError::Unauthorized => write!(f, "Unauthorized"),
            ApiError::NotFound => write!(f, "Not found"),
            ApiError::Conflict => write!(f, "Conflict"),
            ApiError::Server(code) => write!(f, "Server error: {}", code),
            ApiError::Stalled => write!(f, "Stream stalled"),
            ApiError::Cancelled => write!(f, "Cancelled"),
            ApiError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
        }
    }
}

impl std::error::Error for ApiError {}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        ApiError::Transport(err.to_string())
    }
}
