use thiserror::Error;

use crate::link::LinkError;
use crate::relay::RelayError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),
    #[error("data table error: {0}")]
    Data(String),
    #[error("link adapter error: {0}")]
    Link(#[from] LinkError),
    #[error("relay error: {0}")]
    Relay(#[from] RelayError),
    #[error("peer did not respond within {0} seconds")]
    PeerTimeout(u64),
    #[error("trade stopped by user")]
    Stopped,
}
