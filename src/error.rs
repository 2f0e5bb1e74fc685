//! Error types for the phone policy engine

use thiserror::Error;

/// Failures on the crate's non-input surfaces (config, handler loop, replay)
#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("config error: {0}")]
    Config(String),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("handler loop failed: {0}")]
    HandlerLoop(String),

    #[error("replay script error: {0}")]
    Script(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error returned by every collaborator call
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("service unavailable")]
    Unavailable,

    #[error("remote process died")]
    Died,

    #[error("remote call failed: {0}")]
    Failed(String),
}

/// Failure to start an activity from a key action
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LaunchError {
    #[error("no activity found to handle intent")]
    ActivityNotFound,

    #[error("invalid intent URI: {0}")]
    InvalidUri(String),

    #[error(transparent)]
    Remote(#[from] RemoteError),
}

pub type RemoteResult<T> = std::result::Result<T, RemoteError>;
pub type Result<T> = std::result::Result<T, PolicyError>;
