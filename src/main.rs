use anyhow::Context;
use clap::Parser;
use dapper::formats::FormatRegistry;
use dapper::{Server, ServerConfig};
use std::net::SocketAddr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "dapper", about = "Media server for SlimProto playback devices")]
struct Args {
    /// Address devices connect to
    #[arg(long, env = "DAPPER_SLIMPROTO_ADDR", default_value = "0.0.0.0:3483")]
    slimproto_addr: SocketAddr,

    /// Address of the streaming and control HTTP listener
    #[arg(long, env = "DAPPER_HTTP_ADDR", default_value = "0.0.0.0:9000")]
    http_addr: SocketAddr,

    /// Port advertised to devices for audio streams (defaults to the HTTP port)
    #[arg(long, env = "DAPPER_STREAM_PORT")]
    stream_port: Option<u16>,

    /// Maximum number of connected devices
    #[arg(long, env = "DAPPER_MAX_ENDPOINTS", default_value_t = 3)]
    max_endpoints: usize,

    /// Seconds between status polls
    #[arg(long, env = "DAPPER_HEARTBEAT_SECS", default_value_t = 5)]
    heartbeat_secs: u64,

    /// Device buffer fullness above which direct streams pause
    #[arg(long, env = "DAPPER_THROTTLE_PERCENT", default_value_t = 90.0)]
    throttle_percent: f64,
}

impl Args {
    fn into_config(self) -> ServerConfig {
        ServerConfig {
            slimproto_addr: self.slimproto_addr,
            http_addr: self.http_addr,
            stream_port: self.stream_port,
            max_endpoints: self.max_endpoints,
            heartbeat_interval: Duration::from_secs(self.heartbeat_secs),
            throttle_percent: self.throttle_percent,
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    env_logger::init();

    let config = Args::parse().into_config();
    log::info!("🚀 Starting dapper");

    let shutdown = CancellationToken::new();
    let server = Server::bind(config, FormatRegistry::builtin(), shutdown.clone())
        .await
        .context("failed to start server")?;
    log::info!(
        "🎧 Devices: {} | HTTP: {} | stream port {}",
        server.slimproto_addr()?,
        server.http_addr()?,
        server.state().stream_port
    );

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("🛑 Received Ctrl+C, shutting down...");
        }
        signal_token.cancel();
    });

    server.run().await.context("server failed")?;
    log::info!("👋 Goodbye");
    Ok(())
}
