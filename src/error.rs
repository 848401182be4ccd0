use thiserror::Error;

#[derive(Error, Debug)]
pub enum GridError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("subprocess error: {0}")]
    Subprocess(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("socket closed during shutdown")]
    Shutdown,
}

impl GridError {
    /// A message variant arrived on a channel that cannot carry it.
    pub fn invalid_context(variant: &str, channel: &str) -> Self {
        GridError::Protocol(format!("invalid context: {variant} on {channel} channel"))
    }
}

pub type Result<T> = std::result::Result<T, GridError>;
