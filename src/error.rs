use podlens_agent::AgentError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PodlensError {
    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("Invalid capture event on line {line}: {reason}")]
    InvalidEvent { line: usize, reason: String },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PodlensError>;
