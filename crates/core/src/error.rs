/// Errors from reading or writing fleet state.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Invalid bot id: {0:?}")]
    InvalidBotId(String),
    #[error("Config error: {0}")]
    ConfigError(String),
}
