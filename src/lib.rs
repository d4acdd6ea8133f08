pub mod config;
pub mod control;
pub mod endpoint;
pub mod error;
pub mod formats;
pub mod heartbeat;
pub mod http_server;
pub mod playlist;
pub mod registry;
pub mod server;
pub mod slim_server;
pub mod streaming;

pub use config::ServerConfig;
pub use error::{DapperError, Result};
pub use server::{AppState, Server};
