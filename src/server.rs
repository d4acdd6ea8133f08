use crate::config::ServerConfig;
use crate::error::Result;
use crate::formats::FormatRegistry;
use crate::heartbeat;
use crate::http_server::HttpServer;
use crate::registry::EndpointRegistry;
use crate::slim_server::SlimServer;
use log::info;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Shared by the SlimProto listener, the HTTP layer and the heartbeat
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub registry: Arc<EndpointRegistry>,
    pub formats: &'static FormatRegistry,
    /// Port devices are told to fetch audio from
    pub stream_port: u16,
    pub shutdown: CancellationToken,
}

/// Bound but not yet running server
pub struct Server {
    state: AppState,
    slim: SlimServer,
    http: HttpServer,
}

impl Server {
    pub async fn bind(
        config: ServerConfig,
        formats: &'static FormatRegistry,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        config.validate()?;

        let slim_listener = TcpListener::bind(config.slimproto_addr).await?;
        let http_listener = TcpListener::bind(config.http_addr).await?;
        let stream_port = match config.stream_port {
            Some(port) => port,
            None => http_listener.local_addr()?.port(),
        };

        let state = AppState {
            registry: Arc::new(EndpointRegistry::new(config.max_endpoints)),
            config: Arc::new(config),
            formats,
            stream_port,
            shutdown,
        };

        Ok(Self {
            slim: SlimServer::new(slim_listener, state.clone()),
            http: HttpServer::new(http_listener, state.clone()),
            state,
        })
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn slimproto_addr(&self) -> Result<SocketAddr> {
        self.slim.local_addr()
    }

    pub fn http_addr(&self) -> Result<SocketAddr> {
        self.http.local_addr()
    }

    /// Run until the shutdown token is cancelled
    pub async fn run(self) -> Result<()> {
        let state = self.state;
        let heartbeat = tokio::spawn(heartbeat::run(
            state.registry.clone(),
            state.config.heartbeat_interval,
            state.shutdown.clone(),
        ));

        let (slim, http) = tokio::join!(self.slim.run(), self.http.run());
        let _ = heartbeat.await;
        slim?;
        http?;

        info!("✅ Server stopped");
        Ok(())
    }
}
