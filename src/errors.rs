use std::io;

use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Config(String),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("host store rejected request with status {status}: {body}")]
    Host { status: u16, body: String },
    #[error(transparent)]
    Geocode(#[from] GeocodeError),
}

/// Outcome of a single address lookup that did not yield a coordinate.
#[derive(Debug, Error)]
pub enum GeocodeError {
    #[error("no result for address {0:?}")]
    NoResult(String),
    #[error("provider returned an unusable coordinate: {0}")]
    InvalidCoordinate(String),
    #[error("provider responded with status {0}")]
    Status(u16),
    #[error("failed to decode provider response: {0}")]
    Decode(String),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}
