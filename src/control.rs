use crate::endpoint::machine::Input;
use crate::endpoint::EndpointStatus;
use crate::error::{DapperError, Result};
use crate::registry::EndpointRegistry;
use crate::server::AppState;
use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::future::join_all;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::PathBuf;

/// Transport command applied to every connected endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum ControlCommand {
    Queue { tracks: Vec<PathBuf> },
    Flush,
    Next,
    Prev,
    Restart,
    Goto { pos: i64 },
}

impl ControlCommand {
    pub fn parse(text: &[u8]) -> Result<Self> {
        serde_json::from_slice(text).map_err(|e| DapperError::InvalidCommand(e.to_string()))
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    fn into_input(self) -> Input {
        match self {
            ControlCommand::Queue { tracks } => Input::Queue(tracks),
            ControlCommand::Flush => Input::Flush,
            ControlCommand::Next => Input::Play {
                delta: 1,
                pos: None,
                flush: true,
            },
            ControlCommand::Prev => Input::Play {
                delta: -1,
                pos: None,
                flush: true,
            },
            ControlCommand::Restart => Input::Play {
                delta: 0,
                pos: None,
                flush: true,
            },
            ControlCommand::Goto { pos } => Input::Play {
                delta: 0,
                pos: Some(pos),
                flush: true,
            },
        }
    }
}

/// Keep the tracks that exist as regular files
pub async fn existing_tracks(tracks: Vec<PathBuf>) -> Vec<PathBuf> {
    let mut existing = Vec::with_capacity(tracks.len());
    for track in tracks {
        match tokio::fs::metadata(&track).await {
            Ok(meta) if meta.is_file() => existing.push(track),
            _ => warn!("⚠️  Skipping missing track {}", track.display()),
        }
    }
    existing
}

/// Apply `command` to every registered endpoint; returns how many accepted it.
///
/// Endpoints are fed concurrently, so one with a full mailbox only delays its own delivery.
pub async fn dispatch(registry: &EndpointRegistry, command: ControlCommand) -> usize {
    let command = match command {
        ControlCommand::Queue { tracks } => ControlCommand::Queue {
            tracks: existing_tracks(tracks).await,
        },
        other => other,
    };
    info!("🎮 Control command {}", command.to_json());

    let input = command.into_input();
    let sends = registry.handles().into_iter().map(|handle| {
        let input = input.clone();
        async move { handle.send(input).await }
    });

    join_all(sends)
        .await
        .into_iter()
        .filter(|sent| match sent {
            Ok(()) => true,
            Err(e) => {
                debug!("{}", e);
                false
            }
        })
        .count()
}

/// `POST /control`
pub async fn post_control(State(state): State<AppState>, body: Bytes) -> Response {
    let command = match ControlCommand::parse(&body) {
        Ok(command) => command,
        Err(e) => {
            warn!("⚠️  Rejected control request: {}", e);
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "success": false, "error": e.to_string() })),
            )
                .into_response();
        }
    };

    let endpoints = dispatch(&state.registry, command).await;
    Json(json!({ "success": true, "endpoints": endpoints })).into_response()
}

/// `GET /controlsocket`
pub async fn control_socket(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| serve_socket(socket, state))
}

async fn serve_socket(mut socket: WebSocket, state: AppState) {
    info!("🔌 Control socket opened");
    loop {
        let message = tokio::select! {
            _ = state.shutdown.cancelled() => break,
            message = socket.recv() => message,
        };

        match message {
            Some(Ok(Message::Text(text))) => match ControlCommand::parse(text.as_str().as_bytes()) {
                Ok(command) => {
                    dispatch(&state.registry, command).await;
                }
                Err(_) => debug!("Dropping control socket message {:?}", text.as_str()),
            },
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!("Control socket error: {}", e);
                break;
            }
        }
    }
    info!("🔌 Control socket closed");
}

/// `GET /status`
pub async fn status(State(state): State<AppState>) -> Json<Vec<EndpointStatus>> {
    let mut statuses = Vec::new();
    for handle in state.registry.handles() {
        if let Ok(status) = handle.snapshot().await {
            statuses.push(status);
        }
    }
    statuses.sort_by(|a, b| a.connected_at.cmp(&b.connected_at));
    Json(statuses)
}
