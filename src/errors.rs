use std::io;

use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("geocoding request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("geocoding provider returned status \"{status}\": \"{message}\"")]
    Upstream { status: String, message: String },
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Database(#[from] rusqlite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Config(String),
    #[error("geocoding cancelled")]
    Cancelled,
}

impl AppError {
    /// Network, timeout or undecodable responses from the provider.
    pub fn is_transport(&self) -> bool {
        matches!(self, AppError::Transport(_))
    }
}
