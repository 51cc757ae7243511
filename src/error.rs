use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("Invalid input: {reason}")]
    InvalidInput { reason: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Shard {shard} failed: {message}")]
    Shard { shard: String, message: String },

    #[error("Shard {shard} timed out after {timeout_ms}ms")]
    Timeout { shard: String, timeout_ms: u64 },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Runtime error: {message}")]
    Runtime { message: String },
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    pub fn invalid_input(reason: &str) -> Self {
        Self::InvalidInput {
            reason: reason.to_string(),
        }
    }

    pub fn config(message: &str) -> Self {
        Self::Config {
            message: message.to_string(),
        }
    }

    pub fn shard(shard: &str, message: impl std::fmt::Display) -> Self {
        Self::Shard {
            shard: shard.to_string(),
            message: message.to_string(),
        }
    }

    pub fn runtime(message: impl std::fmt::Display) -> Self {
        Self::Runtime {
            message: message.to_string(),
        }
    }

    pub fn is_invalid_input(&self) -> bool {
        matches!(self, Self::InvalidInput { .. })
    }

    /// The shard this error is attributed to, when it came from one.
    pub fn shard_name(&self) -> Option<&str> {
        match self {
            Self::Shard { shard, .. } | Self::Timeout { shard, .. } => Some(shard),
            _ => None,
        }
    }
}
