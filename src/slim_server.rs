use crate::endpoint::{self, Endpoint};
use crate::error::{DapperError, Result};
use crate::server::AppState;
use log::{error, info, warn};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};

/// Accepts device control connections, one endpoint actor per connection
pub struct SlimServer {
    listener: TcpListener,
    state: AppState,
}

impl SlimServer {
    pub fn new(listener: TcpListener, state: AppState) -> Self {
        Self { listener, state }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self) -> Result<()> {
        info!(
            "🎛️  SlimProto server listening on {} (max {} endpoints)",
            self.local_addr()?,
            self.state.registry.capacity()
        );

        loop {
            tokio::select! {
                _ = self.state.shutdown.cancelled() => {
                    info!("🛑 SlimProto listener stopping");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.accept(stream, peer),
                    Err(e) => error!("❌ Failed to accept connection: {}", e),
                },
            }
        }
        Ok(())
    }

    fn accept(&self, stream: TcpStream, peer: SocketAddr) {
        let registry = &self.state.registry;
        let (handle, inbox) = match registry.register_with(endpoint::channel) {
            Ok(registered) => registered,
            Err(DapperError::RegistryFull { capacity }) => {
                warn!(
                    "⚠️  Rejecting connection from {}: too many endpoints ({}/{})",
                    peer,
                    registry.len(),
                    capacity
                );
                // Dropping the stream closes it before any handshake
                return;
            }
            Err(e) => {
                error!("❌ Failed to register {}: {}", peer, e);
                return;
            }
        };

        let id = handle.id().to_string();
        info!(
            "🔗 Device {} connected as {} ({}/{})",
            peer,
            id,
            registry.len(),
            registry.capacity()
        );
        if let Err(e) = stream.set_nodelay(true) {
            warn!("⚠️  {}: failed to set TCP_NODELAY: {}", id, e);
        }

        let endpoint = Endpoint::new(inbox, self.state.stream_port, self.state.formats);
        let registry = self.state.registry.clone();
        let shutdown = self.state.shutdown.clone();
        tokio::spawn(async move {
            let (reader, writer) = slimproto::split(stream);
            endpoint.run(reader, writer, shutdown).await;
            registry.remove(&id);
            info!(
                "📴 Endpoint {} deregistered ({}/{})",
                id,
                registry.len(),
                registry.capacity()
            );
        });
    }
}
