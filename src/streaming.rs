use crate::endpoint::stream_slot::StreamTicket;
use crate::endpoint::EndpointHandle;
use crate::error::DapperError;
use crate::formats::FormatProfile;
use crate::server::AppState;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use log::{debug, error, info, warn};
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

type Chunk = Result<Bytes, io::Error>;

/// Pause direct-file reads while the device buffer is too full
#[derive(Debug, Clone)]
pub struct Throttle {
    pub fullness: watch::Receiver<f64>,
    pub threshold: f64,
    pub pause: Duration,
}

#[derive(Debug)]
pub enum PumpOutcome {
    Completed { bytes: u64 },
    Cancelled { bytes: u64 },
    ClientGone { bytes: u64 },
    ReadFailed { bytes: u64, error: io::Error },
}

impl PumpOutcome {
    pub fn bytes(&self) -> u64 {
        match self {
            PumpOutcome::Completed { bytes }
            | PumpOutcome::Cancelled { bytes }
            | PumpOutcome::ClientGone { bytes }
            | PumpOutcome::ReadFailed { bytes, .. } => *bytes,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, PumpOutcome::Completed { .. })
    }
}

impl fmt::Display for PumpOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PumpOutcome::Completed { bytes } => write!(f, "completed after {bytes} bytes"),
            PumpOutcome::Cancelled { bytes } => write!(f, "cancelled after {bytes} bytes"),
            PumpOutcome::ClientGone { bytes } => write!(f, "client gone after {bytes} bytes"),
            PumpOutcome::ReadFailed { bytes, error } => {
                write!(f, "read failed after {bytes} bytes: {error}")
            }
        }
    }
}

/// Copy `source` into `tx` chunk by chunk until EOF, cancellation or a closed receiver.
///
/// Cancellation is checked before every read and raced against every read and send,
/// so at most one chunk goes out after the token fires.
pub async fn pump<R>(
    mut source: R,
    chunk_size: usize,
    tx: mpsc::Sender<Chunk>,
    token: CancellationToken,
    mut throttle: Option<Throttle>,
) -> PumpOutcome
where
    R: AsyncRead + Unpin,
{
    let mut bytes = 0u64;
    loop {
        if token.is_cancelled() {
            return PumpOutcome::Cancelled { bytes };
        }

        if let Some(throttle) = throttle.as_mut() {
            while *throttle.fullness.borrow_and_update() > throttle.threshold {
                tokio::select! {
                    _ = token.cancelled() => return PumpOutcome::Cancelled { bytes },
                    _ = tokio::time::sleep(throttle.pause) => {}
                }
            }
        }

        let mut buf = vec![0u8; chunk_size];
        let read = tokio::select! {
            _ = token.cancelled() => return PumpOutcome::Cancelled { bytes },
            read = source.read(&mut buf) => read,
        };
        let n = match read {
            Ok(0) => return PumpOutcome::Completed { bytes },
            Ok(n) => n,
            Err(error) => return PumpOutcome::ReadFailed { bytes, error },
        };
        buf.truncate(n);

        tokio::select! {
            _ = token.cancelled() => return PumpOutcome::Cancelled { bytes },
            sent = tx.send(Ok(Bytes::from(buf))) => {
                if sent.is_err() {
                    return PumpOutcome::ClientGone { bytes };
                }
            }
        }
        bytes += n as u64;
    }
}

fn empty(status: StatusCode) -> Response {
    status.into_response()
}

/// Status line for a stream that could not be started
pub fn error_status(error: &DapperError) -> StatusCode {
    match error {
        DapperError::UnknownFormat(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
        DapperError::Io(_) | DapperError::EndpointGone(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// `GET /stream/{id}`: the endpoint's current track, passed through or transcoded
pub async fn stream_track(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Some(handle) = state.registry.get(&id) else {
        debug!("Stream request for unknown endpoint {}", id);
        return empty(StatusCode::NOT_FOUND);
    };

    let track = match handle.current_track().await {
        Ok(Some(track)) => track,
        Ok(None) => {
            debug!("{}: stream requested while idle", id);
            return empty(StatusCode::NOT_FOUND);
        }
        Err(e) => {
            debug!("{}: {}", id, e);
            return empty(StatusCode::NOT_FOUND);
        }
    };

    let (tx, rx) = mpsc::channel::<Chunk>(1);
    let started = match state.formats.lookup(&track) {
        None => Err(DapperError::UnknownFormat(track)),
        Some(profile) => match &profile.transcoder {
            None => start_direct(&state, &handle, track, tx).await,
            Some(_) => start_transcode(&state, &handle, profile, track, tx),
        }
        .map(|()| profile),
    };
    let profile = match started {
        Ok(profile) => profile,
        Err(e) => {
            warn!("⚠️  {}: {}", id, e);
            return empty(error_status(&e));
        }
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, profile.mime.as_str())
        .header(header::CONNECTION, "close")
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .unwrap_or_else(|e| {
            error!("❌ {}: failed to build stream response: {}", id, e);
            empty(StatusCode::INTERNAL_SERVER_ERROR)
        })
}

async fn start_direct(
    state: &AppState,
    handle: &EndpointHandle,
    track: PathBuf,
    tx: mpsc::Sender<Chunk>,
) -> crate::Result<()> {
    let file = tokio::fs::File::open(&track).await.map_err(|e| {
        DapperError::Io(io::Error::new(
            e.kind(),
            format!("cannot open {}: {}", track.display(), e),
        ))
    })?;

    let slot = handle.stream_slot().clone();
    let StreamTicket { generation, token } = slot.begin_direct();
    let throttle = Throttle {
        fullness: handle.fullness_watch(),
        threshold: state.config.throttle_percent,
        pause: state.config.throttle_pause,
    };
    let chunk_size = state.config.direct_chunk_size;
    let id = handle.id().to_string();

    info!("🎵 {}: streaming {} directly", id, track.display());
    tokio::spawn(async move {
        let outcome = pump(file, chunk_size, tx, token, Some(throttle)).await;
        slot.finish(generation);
        info!("🎵 {}: {} {}", id, track.display(), outcome);
    });
    Ok(())
}

fn start_transcode(
    state: &AppState,
    handle: &EndpointHandle,
    profile: &FormatProfile,
    track: PathBuf,
    tx: mpsc::Sender<Chunk>,
) -> crate::Result<()> {
    let Some(transcoder) = profile.transcoder.as_ref() else {
        return Err(DapperError::Transcoder(format!(
            "no transcoder configured for {}",
            track.display()
        )));
    };

    let mut child = transcoder.command_for(&track).spawn().map_err(|e| {
        error!("❌ {}: failed to start {}: {}", handle.id(), transcoder.program, e);
        DapperError::Transcoder(format!(
            "failed to start {} for {}: {}",
            transcoder.program,
            track.display(),
            e
        ))
    })?;
    let Some(stdout) = child.stdout.take() else {
        return Err(DapperError::Transcoder(format!(
            "{} stdout not captured",
            transcoder.program
        )));
    };

    let slot = handle.stream_slot().clone();
    let StreamTicket { generation, token } = slot.begin_transcode(child);
    let chunk_size = state.config.transcode_chunk_size;
    let id = handle.id().to_string();
    let program = transcoder.program.clone();

    info!("🎛️  {}: transcoding {} with {}", id, track.display(), program);
    tokio::spawn(async move {
        // The pipe is the only flow control on this path
        let outcome = pump(stdout, chunk_size, tx, token, None).await;
        info!("🎵 {}: {} {}", id, track.display(), outcome);

        let Some(mut child) = slot.finish(generation) else {
            debug!("{}: transcoder already reclaimed by cancel", id);
            return;
        };
        if !outcome.is_completed() {
            let _ = child.start_kill();
        }
        match child.wait().await {
            Ok(status) if status.success() => info!("✅ {}: {} exited cleanly", id, program),
            Ok(status) => warn!("⚠️  {}: {} exited with {}", id, program, status),
            Err(e) => warn!("⚠️  {}: failed to reap {}: {}", id, program, e),
        }
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    async fn collect(mut rx: mpsc::Receiver<Chunk>) -> Vec<Vec<u8>> {
        let mut chunks = Vec::new();
        while let Some(chunk) = rx.recv().await {
            chunks.push(chunk.unwrap().to_vec());
        }
        chunks
    }

    #[test]
    fn test_start_errors_map_to_status() {
        assert_eq!(
            error_status(&DapperError::UnknownFormat("/a.xyz".into())),
            StatusCode::UNSUPPORTED_MEDIA_TYPE
        );
        assert_eq!(
            error_status(&DapperError::Io(io::Error::from(io::ErrorKind::NotFound))),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            error_status(&DapperError::Transcoder("sox missing".to_string())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn test_pump_copies_everything_in_chunks() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let (tx, rx) = mpsc::channel(1);
        let reader = tokio::spawn(collect(rx));

        let outcome = pump(data.as_slice(), 4096, tx, CancellationToken::new(), None).await;
        assert!(outcome.is_completed());
        assert_eq!(outcome.bytes(), 10_000);

        let chunks = reader.await.unwrap();
        assert!(chunks.iter().all(|c| c.len() <= 4096));
        assert_eq!(chunks.concat(), data);
    }

    #[tokio::test]
    async fn test_pump_stops_when_cancelled() {
        let token = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(1);
        let source = tokio::io::repeat(7);

        let task = tokio::spawn(pump(source, 1024, tx, token.clone(), None));
        assert!(rx.recv().await.is_some());

        token.cancel();
        let outcome = timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert!(matches!(outcome, PumpOutcome::Cancelled { .. }));

        let mut after_cancel = 0;
        while rx.recv().await.is_some() {
            after_cancel += 1;
        }
        assert!(after_cancel <= 1);
    }

    #[tokio::test]
    async fn test_pump_notices_closed_client() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let outcome = pump(
            tokio::io::repeat(1),
            512,
            tx,
            CancellationToken::new(),
            None,
        )
        .await;
        assert!(matches!(outcome, PumpOutcome::ClientGone { bytes: 0 }));
    }

    #[tokio::test]
    async fn test_pump_waits_while_buffer_is_full() {
        let (fullness_tx, fullness_rx) = watch::channel(95.0);
        let throttle = Throttle {
            fullness: fullness_rx,
            threshold: 90.0,
            pause: Duration::from_millis(10),
        };
        let (tx, mut rx) = mpsc::channel(1);
        let data = vec![3u8; 100];
        let task = tokio::spawn(async move {
            pump(data.as_slice(), 64, tx, CancellationToken::new(), Some(throttle)).await
        });

        assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());

        fullness_tx.send(40.0).unwrap();
        let first = timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(first.len(), 64);

        while rx.recv().await.is_some() {}
        let outcome = task.await.unwrap();
        assert_eq!(outcome.bytes(), 100);
    }
}
