use crate::protocol::{
    InboundFrame, ProtocolError, ServerCommand, INBOUND_HEADER_LEN, MAX_INBOUND_PAYLOAD,
};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// Reads device frames from the control connection
pub struct FrameReader<R> {
    reader: BufReader<R>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
        }
    }

    /// Read the next frame. `Ok(None)` means the peer closed cleanly between frames;
    /// a close in the middle of a frame is an `Io(UnexpectedEof)` error.
    pub async fn read_frame(&mut self) -> Result<Option<InboundFrame>, ProtocolError> {
        let mut header = [0u8; INBOUND_HEADER_LEN];
        let mut filled = 0;
        while filled < header.len() {
            let n = self.reader.read(&mut header[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(ProtocolError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed inside frame header",
                )));
            }
            filled += n;
        }

        let (command, len) = InboundFrame::parse_header(&header);
        if len > MAX_INBOUND_PAYLOAD {
            return Err(ProtocolError::InvalidPayloadSize(len));
        }

        let mut payload = vec![0u8; len as usize];
        self.reader.read_exact(&mut payload).await?;

        Ok(Some(InboundFrame::new(command, payload)))
    }
}

/// Writes length-prefixed server commands to a device
pub struct FrameWriter<W> {
    writer: BufWriter<W>,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            writer: BufWriter::new(inner),
        }
    }

    pub async fn write_command(&mut self, command: &ServerCommand) -> Result<(), ProtocolError> {
        let frame = command.to_frame()?;
        self.writer.write_all(&frame).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), ProtocolError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

/// Split an accepted device socket into its framed halves
pub fn split(stream: TcpStream) -> (FrameReader<OwnedReadHalf>, FrameWriter<OwnedWriteHalf>) {
    let (read, write) = stream.into_split();
    (FrameReader::new(read), FrameWriter::new(write))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{DeviceMessage, Strm};

    #[tokio::test]
    async fn test_reads_frames_in_sequence() {
        let mut bytes = InboundFrame::new(*b"BYE!", vec![0]).to_bytes().unwrap();
        bytes.extend(InboundFrame::new(*b"RESP", b"HTTP/1.0 200 OK".to_vec()).to_bytes().unwrap());

        let mut reader = FrameReader::new(bytes.as_slice());
        let first = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(first.decode().unwrap(), DeviceMessage::Bye(0));

        let second = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(
            second.decode().unwrap(),
            DeviceMessage::Resp("HTTP/1.0 200 OK".to_string())
        );

        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_truncated_payload_is_an_error() {
        let mut bytes = b"STAT".to_vec();
        bytes.extend_from_slice(&41u32.to_be_bytes());
        bytes.extend_from_slice(&[0u8; 10]);

        let mut reader = FrameReader::new(bytes.as_slice());
        let err = reader.read_frame().await.unwrap_err();
        assert!(matches!(err, ProtocolError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof));
    }

    #[tokio::test]
    async fn test_oversized_payload_is_rejected() {
        let mut bytes = b"HELO".to_vec();
        bytes.extend_from_slice(&(MAX_INBOUND_PAYLOAD + 1).to_be_bytes());

        let mut reader = FrameReader::new(bytes.as_slice());
        let err = reader.read_frame().await.unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPayloadSize(_)));
    }

    #[tokio::test]
    async fn test_writer_emits_length_prefixed_frames() {
        let mut out = Vec::new();
        {
            let mut writer = FrameWriter::new(&mut out);
            writer
                .write_command(&ServerCommand::Strm(Strm::status()))
                .await
                .unwrap();
        }
        assert_eq!(&out[..2], &[0, 28]);
        assert_eq!(&out[2..7], b"strmt");
    }
}
