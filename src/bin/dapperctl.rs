use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use dapper::control::ControlCommand;
use futures_util::{SinkExt, StreamExt};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_tungstenite::tungstenite::Message;
use url::Url;

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(20);

#[derive(Parser, Debug)]
#[command(name = "dapperctl", about = "Control a running dapper server")]
struct Args {
    /// Base URL of the server's HTTP listener
    #[arg(long, global = true, env = "DAPPER_SERVER", default_value = "http://localhost:9000")]
    server: Url,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Append files to the playlist of every connected device
    Queue {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Interactive transport control over the control socket
    Shell,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    match args.command {
        Command::Queue { files } => queue(&args.server, files).await,
        Command::Shell => shell(&args.server).await,
    }
}

async fn queue(server: &Url, files: Vec<PathBuf>) -> anyhow::Result<()> {
    let mut tracks = Vec::with_capacity(files.len());
    for file in files {
        match tokio::fs::canonicalize(&file).await {
            Ok(path) => tracks.push(path),
            Err(e) => log::warn!("⚠️  Skipping {}: {}", file.display(), e),
        }
    }
    if tracks.is_empty() {
        bail!("no playable files given");
    }

    let url = server.join("control").context("invalid server URL")?;
    let count = tracks.len();
    let response: serde_json::Value = reqwest::Client::new()
        .post(url)
        .json(&ControlCommand::Queue { tracks })
        .send()
        .await
        .context("failed to reach server")?
        .json()
        .await
        .context("invalid response from server")?;

    if response["success"].as_bool() != Some(true) {
        bail!("server rejected queue request: {}", response);
    }
    println!(
        "✅ Queued {} tracks on {} endpoints",
        count, response["endpoints"]
    );
    Ok(())
}

/// Parse one shell line; `Ok(None)` means quit
fn parse_line(line: &str) -> anyhow::Result<Option<ControlCommand>> {
    let mut words = line.split_whitespace();
    let command = match (words.next(), words.next()) {
        (Some("quit" | "exit"), _) => return Ok(None),
        (Some("next"), None) => ControlCommand::Next,
        (Some("prev"), None) => ControlCommand::Prev,
        (Some("restart"), None) => ControlCommand::Restart,
        (Some("flush"), None) => ControlCommand::Flush,
        (Some("goto"), Some(pos)) => ControlCommand::Goto {
            pos: pos.parse().context("goto needs a track number")?,
        },
        _ => bail!("commands: next, prev, restart, flush, goto N, quit"),
    };
    Ok(Some(command))
}

fn socket_url(server: &Url) -> anyhow::Result<Url> {
    let mut url = server.join("controlsocket").context("invalid server URL")?;
    let scheme = match url.scheme() {
        "https" => "wss",
        _ => "ws",
    };
    if url.set_scheme(scheme).is_err() {
        bail!("cannot derive WebSocket URL from {}", server);
    }
    Ok(url)
}

async fn prompt(stdout: &mut tokio::io::Stdout) -> std::io::Result<()> {
    stdout.write_all(b"dapper> ").await?;
    stdout.flush().await
}

async fn shell(server: &Url) -> anyhow::Result<()> {
    let url = socket_url(server)?;
    let (socket, _) = tokio_tungstenite::connect_async(url.as_str())
        .await
        .with_context(|| format!("failed to connect to {url}"))?;
    let (mut sink, mut stream) = socket.split();
    println!("🔗 Connected to {}", url);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let mut keep_alive = tokio::time::interval(KEEP_ALIVE_INTERVAL);
    keep_alive.tick().await;

    prompt(&mut stdout).await?;
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if !line.trim().is_empty() {
                    match parse_line(&line) {
                        Ok(Some(command)) => sink.send(Message::text(command.to_json())).await?,
                        Ok(None) => break,
                        Err(e) => println!("{e}"),
                    }
                }
                prompt(&mut stdout).await?;
            }
            _ = keep_alive.tick() => {
                sink.send(Message::text("keep alive")).await?;
            }
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => {
                    println!("🔌 Server closed the connection");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e).context("control socket failed"),
            }
        }
    }

    let _ = sink.send(Message::Close(None)).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_shell_lines() {
        assert_eq!(parse_line("next").unwrap(), Some(ControlCommand::Next));
        assert_eq!(
            parse_line("goto 4").unwrap(),
            Some(ControlCommand::Goto { pos: 4 })
        );
        assert_eq!(parse_line("quit").unwrap(), None);
        assert!(parse_line("goto four").is_err());
        assert!(parse_line("dance").is_err());
    }

    #[test]
    fn test_socket_url() {
        let url = socket_url(&Url::parse("http://localhost:9000").unwrap()).unwrap();
        assert_eq!(url.as_str(), "ws://localhost:9000/controlsocket");
    }
}
