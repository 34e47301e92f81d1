//! Simulator errors

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid address: {0}")]
    Address(String),
}

pub type SimResult<T> = Result<T, SimError>;
