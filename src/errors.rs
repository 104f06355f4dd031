use std::io;

use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("no active session; run `owid-importer login <session-id>` first")]
    NoSession,
    #[error("{0}")]
    Api(String),
    #[error("{0}")]
    Config(String),
    #[error("rejected import links: {0}")]
    Links(String),
    #[error("invalid import draft: {0}")]
    Draft(String),
    #[error("{0}")]
    State(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Keychain(#[from] keyring::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Channel(#[from] tokio_tungstenite::tungstenite::Error),
}
