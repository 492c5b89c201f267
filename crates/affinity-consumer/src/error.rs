// Error types surfaced to callers of the engine.
// Only configuration problems reach `start`; runtime failures are absorbed by the
// error policy and reported through the sink.
use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("invalid option {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("read consumer config {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse consumer config yaml")]
    Parse(#[from] serde_yaml::Error),
    #[error("no message handler registered")]
    MissingHandler,
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),
    #[error("engine already started")]
    AlreadyStarted,
    #[error("pipeline task failed: {0}")]
    Join(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
