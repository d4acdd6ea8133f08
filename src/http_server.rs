use crate::control;
use crate::error::Result;
use crate::server::AppState;
use crate::streaming;
use axum::routing::{get, post};
use axum::Router;
use log::info;
use std::net::SocketAddr;
use tokio::net::TcpListener;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/stream/{id}", get(streaming::stream_track))
        .route("/control", post(control::post_control))
        .route("/controlsocket", get(control::control_socket))
        .route("/status", get(control::status))
        .with_state(state)
}

/// Audio streaming and control plane on one listener
pub struct HttpServer {
    listener: TcpListener,
    state: AppState,
}

impl HttpServer {
    pub fn new(listener: TcpListener, state: AppState) -> Self {
        Self { listener, state }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self) -> Result<()> {
        info!("🌐 HTTP server listening on {}", self.local_addr()?);
        let shutdown = self.state.shutdown.clone();
        axum::serve(self.listener, router(self.state))
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;
        info!("🛑 HTTP server stopped");
        Ok(())
    }
}
