//! Device side of the protocol, used to drive a server without real hardware

use crate::protocol::{Helo, InboundFrame, ProtocolError, ServerCommand, Stat};
use log::debug;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};

pub struct DeviceClient<R, W> {
    reader: BufReader<R>,
    writer: W,
}

impl DeviceClient<OwnedReadHalf, OwnedWriteHalf> {
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self, ProtocolError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (read, write) = stream.into_split();
        Ok(Self::new(read, write))
    }
}

impl<R, W> DeviceClient<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    pub async fn send_frame(&mut self, frame: &InboundFrame) -> Result<(), ProtocolError> {
        debug!("📤 Device sending {} ({} bytes)", frame.command_str(), frame.payload.len());
        self.writer.write_all(&frame.to_bytes()?).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn send_helo(&mut self, helo: &Helo) -> Result<(), ProtocolError> {
        self.send_frame(&InboundFrame::new(*b"HELO", helo.to_payload()))
            .await
    }

    pub async fn send_stat(&mut self, stat: &Stat) -> Result<(), ProtocolError> {
        self.send_frame(&InboundFrame::new(*b"STAT", stat.to_payload()))
            .await
    }

    pub async fn send_bye(&mut self) -> Result<(), ProtocolError> {
        self.send_frame(&InboundFrame::new(*b"BYE!", vec![0])).await
    }

    /// Next command from the server, `Ok(None)` once the server has closed the connection
    pub async fn read_command(&mut self) -> Result<Option<ServerCommand>, ProtocolError> {
        let mut len = [0u8; 2];
        match self.reader.read_exact(&mut len).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let mut payload = vec![0u8; u16::from_be_bytes(len) as usize];
        self.reader.read_exact(&mut payload).await?;

        let command = ServerCommand::from_payload(&payload)?;
        debug!("📥 Device received {}", command);
        Ok(Some(command))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{FrameReader, FrameWriter};
    use crate::protocol::{DeviceMessage, StatEvent, Strm, StreamCommand};

    #[tokio::test]
    async fn test_device_and_server_halves_talk() {
        let (device_end, server_end) = tokio::io::duplex(4096);
        let (device_read, device_write) = tokio::io::split(device_end);
        let (server_read, server_write) = tokio::io::split(server_end);

        let mut device = DeviceClient::new(device_read, device_write);
        let mut reader = FrameReader::new(server_read);
        let mut writer = FrameWriter::new(server_write);

        let helo = Helo {
            device_id: 12,
            mac: [1, 2, 3, 4, 5, 6],
            codecs: vec!["flc".to_string()],
            ..Default::default()
        };
        device.send_helo(&helo).await.unwrap();

        let frame = reader.read_frame().await.unwrap().unwrap();
        match frame.decode().unwrap() {
            DeviceMessage::Helo(parsed) => {
                assert_eq!(parsed.device_id, 12);
                assert_eq!(parsed.mac, [1, 2, 3, 4, 5, 6]);
                assert_eq!(parsed.codecs, vec!["flc"]);
            }
            other => panic!("expected HELO, got {other:?}"),
        }

        let mut stat = Stat::new(StatEvent::DecoderReady);
        stat.buffer_size = 100;
        device.send_stat(&stat).await.unwrap();
        let frame = reader.read_frame().await.unwrap().unwrap();
        assert!(matches!(
            frame.decode().unwrap(),
            DeviceMessage::Stat(s) if s.event == StatEvent::DecoderReady
        ));

        writer
            .write_command(&ServerCommand::Strm(Strm::stop()))
            .await
            .unwrap();
        match device.read_command().await.unwrap() {
            Some(ServerCommand::Strm(strm)) => assert_eq!(strm.command, StreamCommand::Stop),
            other => panic!("expected strm q, got {other:?}"),
        }

        drop(writer);
        drop(reader);
        assert!(device.read_command().await.unwrap().is_none());
    }
}
