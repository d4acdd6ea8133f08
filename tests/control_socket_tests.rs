mod common;

use common::{next_command, next_strm, stream_id, TestServer, WAIT};
use dapper::formats::FormatRegistry;
use futures_util::SinkExt;
use serde_json::json;
use slimproto::{ServerCommand, StreamCommand};
use tokio_tungstenite::tungstenite::Message;

#[tokio::test]
async fn test_commands_over_control_socket() {
    let server = TestServer::start(3, FormatRegistry::builtin()).await;
    let dir = tempfile::tempdir().unwrap();
    let tracks: Vec<_> = ["a.flac", "b.flac", "c.flac"]
        .iter()
        .map(|name| {
            let path = dir.path().join(name);
            std::fs::write(&path, b"fLaC").unwrap();
            path
        })
        .collect();

    let mut device = server.connect_and_handshake().await;
    let url = format!("ws://{}/controlsocket", server.http_addr);
    let (mut socket, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();

    // Keep-alive pings are not commands and get dropped
    socket.send(Message::text("keep alive")).await.unwrap();
    socket
        .send(Message::text(
            json!({ "command": "queue", "tracks": tracks }).to_string(),
        ))
        .await
        .unwrap();

    let start = next_strm(&mut device, StreamCommand::Start).await;
    let id = stream_id(&start);
    assert!(matches!(next_command(&mut device).await, ServerCommand::Audg(_)));

    socket
        .send(Message::text(json!({ "command": "goto", "pos": 3 }).to_string()))
        .await
        .unwrap();
    next_strm(&mut device, StreamCommand::Stop).await;
    next_strm(&mut device, StreamCommand::Start).await;

    let handle = server.state.registry.get(&id).unwrap();
    let status = handle.snapshot().await.unwrap();
    assert_eq!(status.current_index, Some(2));

    socket
        .send(Message::text(json!({ "command": "next" }).to_string()))
        .await
        .unwrap();
    next_strm(&mut device, StreamCommand::Start).await;
    assert_eq!(handle.snapshot().await.unwrap().current_index, Some(0));

    socket
        .send(Message::text(json!({ "command": "prev" }).to_string()))
        .await
        .unwrap();
    next_strm(&mut device, StreamCommand::Start).await;
    assert_eq!(handle.snapshot().await.unwrap().current_index, Some(2));

    // Malformed messages are dropped and the socket stays usable
    socket.send(Message::text("{\"command\":")).await.unwrap();
    socket
        .send(Message::text(json!({ "command": "restart" }).to_string()))
        .await
        .unwrap();
    next_strm(&mut device, StreamCommand::Start).await;
    assert_eq!(handle.snapshot().await.unwrap().current_index, Some(2));

    tokio::time::timeout(WAIT, socket.close(None)).await.unwrap().unwrap();
    server.stop().await;
}
