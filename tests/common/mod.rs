#![allow(dead_code)]

use dapper::formats::FormatRegistry;
use dapper::{AppState, Server, ServerConfig};
use slimproto::{DeviceClient, Helo, ServerCommand, StreamCommand, Strm};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

pub type Device = DeviceClient<OwnedReadHalf, OwnedWriteHalf>;

pub const WAIT: Duration = Duration::from_secs(5);

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn leak(formats: FormatRegistry) -> &'static FormatRegistry {
    Box::leak(Box::new(formats))
}

pub struct TestServer {
    pub slim_addr: SocketAddr,
    pub http_addr: SocketAddr,
    pub state: AppState,
    shutdown: CancellationToken,
    task: JoinHandle<dapper::Result<()>>,
}

impl TestServer {
    pub async fn start(max_endpoints: usize, formats: &'static FormatRegistry) -> Self {
        Self::start_with_heartbeat(max_endpoints, formats, Duration::from_secs(3600)).await
    }

    pub async fn start_with_heartbeat(
        max_endpoints: usize,
        formats: &'static FormatRegistry,
        heartbeat_interval: Duration,
    ) -> Self {
        init_logging();
        let config = ServerConfig {
            slimproto_addr: "127.0.0.1:0".parse().unwrap(),
            http_addr: "127.0.0.1:0".parse().unwrap(),
            max_endpoints,
            heartbeat_interval,
            ..Default::default()
        };
        let shutdown = CancellationToken::new();
        let server = Server::bind(config, formats, shutdown.clone()).await.unwrap();

        let slim_addr = server.slimproto_addr().unwrap();
        let http_addr = server.http_addr().unwrap();
        let state = server.state().clone();
        let task = tokio::spawn(server.run());

        Self {
            slim_addr,
            http_addr,
            state,
            shutdown,
            task,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.http_addr, path)
    }

    pub async fn connect(&self) -> Device {
        DeviceClient::connect(self.slim_addr).await.unwrap()
    }

    /// Connect, send HELO and consume the five setup frames
    pub async fn connect_and_handshake(&self) -> Device {
        let mut device = self.connect().await;
        let setup = handshake(&mut device).await;
        assert_eq!(setup.len(), 5);
        device
    }

    pub async fn wait_for_endpoints(&self, count: usize) {
        timeout(WAIT, async {
            while self.state.registry.len() != count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        timeout(WAIT, self.task).await.unwrap().unwrap().unwrap();
    }
}

pub fn helo() -> Helo {
    Helo {
        device_id: 12,
        revision: 1,
        mac: [0x00, 0x04, 0x20, 0x12, 0x34, 0x56],
        codecs: vec!["flc".to_string(), "mp3".to_string()],
        ..Default::default()
    }
}

pub async fn handshake(device: &mut Device) -> Vec<ServerCommand> {
    device.send_helo(&helo()).await.unwrap();
    let mut setup = Vec::new();
    for _ in 0..5 {
        setup.push(next_command(device).await);
    }
    setup
}

pub async fn next_command(device: &mut Device) -> ServerCommand {
    timeout(WAIT, device.read_command())
        .await
        .expect("timed out waiting for server command")
        .unwrap()
        .expect("server closed the connection")
}

/// Read until the next `strm` with the given sub-command, returning it
pub async fn next_strm(device: &mut Device, command: StreamCommand) -> Strm {
    loop {
        if let ServerCommand::Strm(strm) = next_command(device).await {
            if strm.command == command {
                return strm;
            }
        }
    }
}

/// Endpoint id from the request line of a `strm` start
pub fn stream_id(strm: &Strm) -> String {
    strm.stream_path()
        .and_then(|path| path.strip_prefix("/stream/"))
        .unwrap()
        .to_string()
}
