use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DapperError>;

#[derive(Error, Debug)]
pub enum DapperError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] slimproto::ProtocolError),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Endpoint registry full ({capacity} endpoints)")]
    RegistryFull { capacity: usize },

    #[error("Endpoint {0} is gone")]
    EndpointGone(String),

    #[error("No format profile for {0}")]
    UnknownFormat(PathBuf),

    #[error("Transcoder error: {0}")]
    Transcoder(String),

    #[error("Invalid command: {0}")]
    InvalidCommand(String),
}
