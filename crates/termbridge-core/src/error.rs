use thiserror::Error;

/// Errors produced by termbridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// A mutating operation was attempted on a connection that never
    /// authenticated.
    #[error("not authorized")]
    Unauthorized,

    #[error("terminal not found: {0}")]
    TerminalNotFound(String),

    #[error("failed to start shell: {0}")]
    Spawn(String),

    #[error("token error: {0}")]
    Token(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("timeout")]
    Timeout,

    /// Input was refused because the terminal's pending-input queue is full.
    #[error("input queue full: {0}")]
    Backlog(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl BridgeError {
    /// Whether this error means the caller lacked authorization.
    pub fn is_auth(&self) -> bool {
        matches!(self, BridgeError::Unauthorized | BridgeError::AuthFailed(_))
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(e: serde_json::Error) -> Self {
        BridgeError::Codec(e.to_string())
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;
