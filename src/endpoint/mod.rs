//! One actor per connected device.
//!
//! The actor task owns the [`EndpointMachine`] and the socket's write half. A reader
//! task turns inbound frames into events on the actor's mailbox, so frames are handled
//! strictly in arrival order and interleave cleanly with control commands.

pub mod machine;
pub mod stream_slot;

use crate::error::{DapperError, Result};
use crate::formats::FormatRegistry;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use machine::{Effect, EndpointMachine, Input, Phase};
use rand::Rng;
use serde::Serialize;
use slimproto::{DeviceMessage, FrameReader, FrameWriter, ServerCommand};
use std::path::PathBuf;
use std::sync::Arc;
use stream_slot::{StreamKind, StreamSlot};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

const MAILBOX_CAPACITY: usize = 64;
const ID_LEN: usize = 10;

/// Random identifier of uppercase ASCII letters
pub fn generate_id() -> String {
    let mut rng = rand::thread_rng();
    (0..ID_LEN)
        .map(|_| rng.gen_range(b'A'..=b'Z') as char)
        .collect()
}

#[derive(Debug)]
pub enum EndpointEvent {
    Frame(DeviceMessage),
    ConnectionLost(String),
    Heartbeat,
    Command(Input),
    CurrentTrack(oneshot::Sender<Option<PathBuf>>),
    Snapshot(oneshot::Sender<EndpointStatus>),
}

/// Diagnostic view of an endpoint
#[derive(Debug, Clone, Serialize)]
pub struct EndpointStatus {
    pub id: String,
    pub phase: Phase,
    pub model: Option<String>,
    pub mac: Option<String>,
    pub codecs: Vec<String>,
    pub playlist: Vec<PathBuf>,
    pub current_index: Option<usize>,
    pub fullness_percent: f64,
    pub stream: StreamKind,
    pub connected_at: DateTime<Utc>,
}

/// Cloneable reference to a running endpoint
#[derive(Debug, Clone)]
pub struct EndpointHandle {
    id: String,
    tx: mpsc::Sender<EndpointEvent>,
    fullness: watch::Receiver<f64>,
    stream: Arc<StreamSlot>,
}

/// The actor's half of the channels created by [`channel`]
#[derive(Debug)]
pub struct EndpointInbox {
    id: String,
    tx: mpsc::Sender<EndpointEvent>,
    rx: mpsc::Receiver<EndpointEvent>,
    fullness: watch::Sender<f64>,
    stream: Arc<StreamSlot>,
}

/// Create the handle and inbox for a new endpoint without starting it
pub fn channel(id: String) -> (EndpointHandle, EndpointInbox) {
    let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
    let (fullness_tx, fullness_rx) = watch::channel(0.0);
    let stream = Arc::new(StreamSlot::new());

    let handle = EndpointHandle {
        id: id.clone(),
        tx: tx.clone(),
        fullness: fullness_rx,
        stream: Arc::clone(&stream),
    };
    let inbox = EndpointInbox {
        id,
        tx,
        rx,
        fullness: fullness_tx,
        stream,
    };
    (handle, inbox)
}

impl EndpointInbox {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub(crate) async fn recv(&mut self) -> Option<EndpointEvent> {
        self.rx.recv().await
    }
}

impl EndpointHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Last buffer fullness reported by the device
    pub fn fullness_percent(&self) -> f64 {
        *self.fullness.borrow()
    }

    pub fn fullness_watch(&self) -> watch::Receiver<f64> {
        self.fullness.clone()
    }

    pub fn stream_slot(&self) -> &Arc<StreamSlot> {
        &self.stream
    }

    pub async fn send(&self, input: Input) -> Result<()> {
        self.deliver(EndpointEvent::Command(input)).await
    }

    pub async fn queue(&self, tracks: Vec<PathBuf>) -> Result<()> {
        self.send(Input::Queue(tracks)).await
    }

    pub async fn play(&self, delta: i64, pos: Option<i64>, flush: bool) -> Result<()> {
        self.send(Input::Play { delta, pos, flush }).await
    }

    pub async fn flush(&self) -> Result<()> {
        self.send(Input::Flush).await
    }

    /// Non-blocking; a full mailbox just skips this beat
    pub fn heartbeat(&self) -> bool {
        self.tx.try_send(EndpointEvent::Heartbeat).is_ok()
    }

    pub async fn current_track(&self) -> Result<Option<PathBuf>> {
        let (tx, rx) = oneshot::channel();
        self.deliver(EndpointEvent::CurrentTrack(tx)).await?;
        rx.await.map_err(|_| self.gone())
    }

    pub async fn snapshot(&self) -> Result<EndpointStatus> {
        let (tx, rx) = oneshot::channel();
        self.deliver(EndpointEvent::Snapshot(tx)).await?;
        rx.await.map_err(|_| self.gone())
    }

    async fn deliver(&self, event: EndpointEvent) -> Result<()> {
        self.tx.send(event).await.map_err(|_| self.gone())
    }

    fn gone(&self) -> DapperError {
        DapperError::EndpointGone(self.id.clone())
    }
}

pub struct Endpoint {
    inbox: EndpointInbox,
    machine: EndpointMachine,
    connected_at: DateTime<Utc>,
}

impl Endpoint {
    pub fn new(inbox: EndpointInbox, stream_port: u16, formats: &'static FormatRegistry) -> Self {
        let machine = EndpointMachine::new(inbox.id.clone(), stream_port, formats);
        Self {
            inbox,
            machine,
            connected_at: Utc::now(),
        }
    }

    /// Drive the endpoint until the connection ends or `shutdown` fires
    pub async fn run<R, W>(
        mut self,
        reader: FrameReader<R>,
        mut writer: FrameWriter<W>,
        shutdown: CancellationToken,
    ) where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin,
    {
        let id = self.inbox.id.clone();
        let reader_task = tokio::spawn(read_frames(id.clone(), reader, self.inbox.tx.clone()));

        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => EndpointEvent::ConnectionLost("server shutting down".to_string()),
                event = self.inbox.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            let input = match event {
                EndpointEvent::Frame(message) => match self.frame_input(message) {
                    Some(input) => input,
                    None => continue,
                },
                EndpointEvent::ConnectionLost(reason) => {
                    info!("🔌 {}: connection lost ({})", id, reason);
                    Input::ConnectionLost
                }
                EndpointEvent::Heartbeat => Input::Heartbeat,
                EndpointEvent::Command(input) => input,
                EndpointEvent::CurrentTrack(reply) => {
                    let _ = reply.send(self.machine.current_track().map(PathBuf::from));
                    continue;
                }
                EndpointEvent::Snapshot(reply) => {
                    let _ = reply.send(self.status());
                    continue;
                }
            };

            let mut pending = Some(input);
            while let Some(input) = pending.take() {
                let effects = self.machine.handle(input);
                if let Err(e) = self.apply(effects, &mut writer).await {
                    warn!("⚠️  {}: write failed: {}", id, e);
                    let effects = self.machine.handle(Input::ConnectionLost);
                    let _ = self.apply(effects, &mut writer).await;
                } else if self.machine.phase() == Phase::Provisioning {
                    pending = Some(Input::SetupSent);
                }
            }
            self.inbox
                .fullness
                .send_if_modified(|current| {
                    let fullness = self.machine.fullness_percent();
                    let changed = *current != fullness;
                    *current = fullness;
                    changed
                });

            if self.machine.phase() == Phase::Disconnected {
                break;
            }
        }

        reader_task.abort();
        self.inbox.stream.cancel();
        if let Err(e) = writer.shutdown().await {
            debug!("{}: socket shutdown: {}", id, e);
        }
        info!("👋 {}: endpoint finished", id);
    }

    fn frame_input(&self, message: DeviceMessage) -> Option<Input> {
        let id = self.machine.id();
        match message {
            DeviceMessage::Helo(helo) => {
                info!(
                    "🤝 {}: HELO from {} {} rev {} ({} codecs)",
                    id,
                    helo.model(),
                    helo.mac_string(),
                    helo.revision,
                    helo.codecs.len()
                );
                Some(Input::Helo(helo))
            }
            DeviceMessage::Stat(stat) => Some(Input::Stat(stat)),
            DeviceMessage::Bye(upgrade) => {
                info!("👋 {}: device said goodbye (upgrade={})", id, upgrade);
                Some(Input::ConnectionLost)
            }
            DeviceMessage::Resp(headers) => {
                debug!("{}: device stream response: {}", id, headers.trim());
                None
            }
            DeviceMessage::Dsco(reason) => {
                info!("{}: device closed stream (reason {})", id, reason);
                None
            }
            DeviceMessage::Unknown { command, len } => {
                warn!(
                    "⚠️  {}: ignoring unknown command {:?} ({} bytes)",
                    id,
                    String::from_utf8_lossy(&command),
                    len
                );
                None
            }
        }
    }

    async fn apply<W>(&self, effects: Vec<Effect>, writer: &mut FrameWriter<W>) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        for effect in effects {
            match effect {
                Effect::Send(command) => self.send_command(&command, writer).await?,
                Effect::CancelStream => {
                    if self.inbox.stream.cancel() {
                        debug!("{}: cancelled active stream", self.inbox.id);
                    }
                }
            }
        }
        Ok(())
    }

    async fn send_command<W>(&self, command: &ServerCommand, writer: &mut FrameWriter<W>) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        debug!("📤 {}: {}", self.inbox.id, command);
        writer.write_command(command).await?;
        Ok(())
    }

    fn status(&self) -> EndpointStatus {
        let helo = self.machine.helo();
        let playlist = self.machine.playlist();
        EndpointStatus {
            id: self.inbox.id.clone(),
            phase: self.machine.phase(),
            model: helo.map(|h| h.model().to_string()),
            mac: helo.map(|h| h.mac_string()),
            codecs: helo.map(|h| h.codecs.clone()).unwrap_or_default(),
            playlist: playlist.tracks().to_vec(),
            current_index: playlist.current_index(),
            fullness_percent: self.machine.fullness_percent(),
            stream: self.inbox.stream.kind(),
            connected_at: self.connected_at,
        }
    }
}

async fn read_frames<R>(id: String, mut reader: FrameReader<R>, tx: mpsc::Sender<EndpointEvent>)
where
    R: AsyncRead + Unpin,
{
    let reason = loop {
        match reader.read_frame().await {
            Ok(Some(frame)) => match frame.decode() {
                Ok(message) => {
                    if tx.send(EndpointEvent::Frame(message)).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    warn!(
                        "⚠️  {}: dropping malformed {} frame: {}",
                        id,
                        frame.command_str(),
                        e
                    );
                }
            },
            Ok(None) => break "closed by device".to_string(),
            Err(e) => {
                error!("❌ {}: read failed: {}", id, e);
                break e.to_string();
            }
        }
    };
    let _ = tx.send(EndpointEvent::ConnectionLost(reason)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use slimproto::{DeviceClient, Helo, StreamCommand, Strm};
    use std::time::Duration;
    use tokio::time::timeout;

    #[test]
    fn test_generated_ids() {
        let id = generate_id();
        assert_eq!(id.len(), 10);
        assert!(id.chars().all(|c| c.is_ascii_uppercase()));
    }

    #[tokio::test]
    async fn test_actor_runs_setup_and_answers_queries() {
        let (device_end, server_end) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server_end);
        let (device_read, device_write) = tokio::io::split(device_end);

        let (handle, inbox) = channel("ACTORTESTS".to_string());
        let endpoint = Endpoint::new(inbox, 9000, FormatRegistry::builtin());
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(endpoint.run(
            FrameReader::new(server_read),
            FrameWriter::new(server_write),
            shutdown.clone(),
        ));

        let mut device = DeviceClient::new(device_read, device_write);
        device.send_helo(&Helo::default()).await.unwrap();
        for _ in 0..5 {
            timeout(Duration::from_secs(5), device.read_command())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
        }

        handle.queue(vec!["/a.flac".into()]).await.unwrap();
        let command = timeout(Duration::from_secs(5), device.read_command())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            command,
            Some(ServerCommand::Strm(Strm { command: StreamCommand::Start, .. }))
        ));

        assert_eq!(
            handle.current_track().await.unwrap(),
            Some(PathBuf::from("/a.flac"))
        );
        let status = handle.snapshot().await.unwrap();
        assert_eq!(status.phase, Phase::Playing);
        assert_eq!(status.current_index, Some(0));

        shutdown.cancel();
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert!(matches!(
            handle.current_track().await,
            Err(DapperError::EndpointGone(_))
        ));
    }
}
