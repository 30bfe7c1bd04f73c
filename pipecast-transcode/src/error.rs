use thiserror::Error;

#[derive(Error, Debug)]
pub enum TranscodeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Encoder executable not found: {0}")]
    EncoderNotFound(String),

    #[error("Failed to spawn encoder: {0}")]
    SpawnFailed(String),

    #[error("Invalid output target: {0}")]
    InvalidTarget(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Input pipe closed: {0}")]
    PipeClosed(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

pub type TranscodeResult<T> = Result<T, TranscodeError>;
