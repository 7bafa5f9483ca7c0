use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("action not found: {0}")]
    ActionNotFound(String),

    #[error("invalid action request: {0}")]
    InvalidAction(String),

    #[error("action store error: {0}")]
    Db(String),

    #[error(
        "action store {0} is locked by another process; while `cloudops serve` is running, \
         use its HTTP API instead (POST /api/dispatch, /api/actions)"
    )]
    StoreLocked(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid transition for {operation} from {from} to {to}")]
    InvalidTransition {
        operation: String,
        from: String,
        to: String,
    },

    #[error("platform client error: {0}")]
    PlatformClient(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
