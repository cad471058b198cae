use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Interface enumeration failed: {0}")]
    InterfaceEnumeration(String),

    #[error("Invalid CNI subnet {subnet}: {reason}")]
    InvalidSubnet { subnet: String, reason: String },

    #[error("Malformed record: expected {expected} bytes, got {actual}")]
    Decode { expected: usize, actual: usize },

    #[error("Missing event parameter: {0}")]
    MissingParam(&'static str),

    #[error("Ring cursor out of range: head={head}, tail={tail}, capacity={capacity}")]
    RingCursor {
        head: usize,
        tail: usize,
        capacity: usize,
    },

    #[error("Unknown focus pod operation: {0}")]
    UnknownFocusOp(u8),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AgentError>;
