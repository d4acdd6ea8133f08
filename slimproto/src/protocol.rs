use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use thiserror::Error;

/// Port devices connect to by convention
pub const SLIMPROTO_PORT: u16 = 3483;

/// Inbound header: 4-byte ASCII command + 4-byte big-endian payload length
pub const INBOUND_HEADER_LEN: usize = 8;

/// Largest inbound payload we are willing to buffer
pub const MAX_INBOUND_PAYLOAD: u32 = 1024 * 1024;

/// Bytes of a `strm` command between the command code and the HTTP request
pub const STRM_HEADER_LEN: usize = 24;

/// Fixed part of a STAT payload, up to and including elapsed seconds
pub const STAT_MIN_LEN: usize = 41;

/// STAT payload length when the optional tail is present
pub const STAT_FULL_LEN: usize = 53;

/// HELO payload offset where the comma separated capability list starts
pub const HELO_CAPABILITIES_OFFSET: usize = 36;

/// `setd` parameter asking the device for its player name
pub const SETD_PLAYER_NAME: u8 = 0;

/// `setd` parameter asking the device for its device id
pub const SETD_DEVICE_ID: u8 = 4;

pub type CommandCode = [u8; 4];

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid payload size: {0}")]
    InvalidPayloadSize(u32),

    #[error("{command} payload too short: {len} bytes (need {min})")]
    PayloadTooShort {
        command: String,
        len: usize,
        min: usize,
    },

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),
}

fn code_str(code: &[u8]) -> String {
    String::from_utf8_lossy(code).into_owned()
}

fn too_short(command: &str, len: usize, min: usize) -> ProtocolError {
    ProtocolError::PayloadTooShort {
        command: command.to_string(),
        len,
        min,
    }
}

fn be_u16(data: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([data[at], data[at + 1]])
}

fn be_u32(data: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

fn be_uint(data: &[u8]) -> u64 {
    data.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
}

// ---------------------------------------------------------------------------
// Device -> server
// ---------------------------------------------------------------------------

/// One raw device frame: `[command:4][length:u32 BE][payload]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame {
    pub command: CommandCode,
    pub payload: Vec<u8>,
}

impl InboundFrame {
    pub fn new(command: CommandCode, payload: Vec<u8>) -> Self {
        Self { command, payload }
    }

    pub fn command_str(&self) -> String {
        code_str(&self.command)
    }

    /// Split an inbound header into command code and declared payload length
    pub fn parse_header(header: &[u8; INBOUND_HEADER_LEN]) -> (CommandCode, u32) {
        let command = [header[0], header[1], header[2], header[3]];
        (command, be_u32(header, 4))
    }

    /// Serialize as the device would put it on the wire
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        let len = u32::try_from(self.payload.len())
            .map_err(|_| ProtocolError::FrameTooLarge(self.payload.len()))?;

        let mut bytes = Vec::with_capacity(INBOUND_HEADER_LEN + self.payload.len());
        bytes.extend_from_slice(&self.command);
        bytes.extend_from_slice(&len.to_be_bytes());
        bytes.extend_from_slice(&self.payload);
        Ok(bytes)
    }

    /// Interpret the payload according to the command code
    pub fn decode(&self) -> Result<DeviceMessage, ProtocolError> {
        match &self.command {
            b"HELO" => Ok(DeviceMessage::Helo(Helo::parse(&self.payload)?)),
            b"STAT" => Ok(DeviceMessage::Stat(Stat::parse(&self.payload)?)),
            b"BYE!" => Ok(DeviceMessage::Bye(
                self.payload.first().copied().unwrap_or_default(),
            )),
            b"RESP" => Ok(DeviceMessage::Resp(
                String::from_utf8_lossy(&self.payload).into_owned(),
            )),
            b"DSCO" => Ok(DeviceMessage::Dsco(
                self.payload.first().copied().unwrap_or_default(),
            )),
            _ => Ok(DeviceMessage::Unknown {
                command: self.command,
                len: self.payload.len(),
            }),
        }
    }
}

/// Decoded device message
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceMessage {
    Helo(Helo),
    Stat(Stat),
    /// Device is going away; the byte is the upgrade flag
    Bye(u8),
    /// HTTP response headers the device received from the stream server
    Resp(String),
    /// Device side stream disconnect, with reason code
    Dsco(u8),
    Unknown { command: CommandCode, len: usize },
}

/// Handshake sent once after the device connects
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Helo {
    pub device_id: u8,
    pub revision: u8,
    pub mac: [u8; 6],
    pub uuid: Option<[u8; 16]>,
    pub wlan_channels: Option<u16>,
    pub bytes_received: Option<u64>,
    pub language: Option<String>,
    pub codecs: Vec<String>,
    pub capabilities: BTreeMap<String, String>,
}

impl Helo {
    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < 8 {
            return Err(too_short("HELO", data.len(), 8));
        }

        let mut helo = Helo {
            device_id: data[0],
            revision: data[1],
            ..Default::default()
        };
        helo.mac.copy_from_slice(&data[2..8]);

        if data.len() >= 24 {
            let mut uuid = [0u8; 16];
            uuid.copy_from_slice(&data[8..24]);
            helo.uuid = Some(uuid);
        }
        if data.len() >= 26 {
            helo.wlan_channels = Some(be_u16(data, 24));
        }
        if data.len() >= 32 {
            helo.bytes_received = Some(be_uint(&data[26..32]));
        }
        if data.len() >= 34 {
            helo.language = Some(String::from_utf8_lossy(&data[32..34]).into_owned());
        }
        if data.len() > HELO_CAPABILITIES_OFFSET {
            let list = String::from_utf8_lossy(&data[HELO_CAPABILITIES_OFFSET..]);
            for entry in list.split(',').map(str::trim).filter(|e| !e.is_empty()) {
                match entry.split_once('=') {
                    Some((key, value)) if !value.contains('=') => {
                        helo.capabilities.insert(key.to_string(), value.to_string());
                    }
                    _ => helo.codecs.push(entry.to_string()),
                }
            }
        }

        Ok(helo)
    }

    /// Encode the full 36-byte header plus capability list
    pub fn to_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HELO_CAPABILITIES_OFFSET + 64);
        out.push(self.device_id);
        out.push(self.revision);
        out.extend_from_slice(&self.mac);
        out.extend_from_slice(&self.uuid.unwrap_or_default());
        out.extend_from_slice(&self.wlan_channels.unwrap_or_default().to_be_bytes());
        out.extend_from_slice(&self.bytes_received.unwrap_or_default().to_be_bytes()[2..]);
        let language = self.language.as_deref().unwrap_or("en").as_bytes();
        out.extend_from_slice(&[
            language.first().copied().unwrap_or(b' '),
            language.get(1).copied().unwrap_or(b' '),
        ]);
        out.extend_from_slice(&[0, 0]);

        let entries: Vec<String> = self
            .capabilities
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .chain(self.codecs.iter().cloned())
            .collect();
        out.extend_from_slice(entries.join(",").as_bytes());
        out
    }

    pub fn mac_string(&self) -> String {
        self.mac
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(":")
    }

    /// Model name for the reported device id
    pub fn model(&self) -> &'static str {
        match self.device_id {
            2 => "squeezebox",
            3 => "softsqueeze",
            4 => "squeezebox2",
            5 => "transporter",
            6 => "softsqueeze3",
            7 => "receiver",
            8 => "squeezeslave",
            9 => "controller",
            10 => "boom",
            11 => "softboom",
            12 => "squeezeplay",
            _ => "unknown",
        }
    }
}

/// Event code carried in the first four bytes of a STAT payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StatEvent {
    Connected,
    /// Decoder has consumed the whole stream; the track is drained
    DecoderReady,
    StreamEstablished,
    Flushed,
    HeadersReceived,
    ThresholdReached,
    NotSupported,
    OutputUnderrun,
    Paused,
    Resumed,
    TrackStarted,
    Heartbeat,
    Underrun,
    Other(CommandCode),
}

impl StatEvent {
    pub fn from_code(code: CommandCode) -> Self {
        match &code {
            b"STMc" => StatEvent::Connected,
            b"STMd" => StatEvent::DecoderReady,
            b"STMe" => StatEvent::StreamEstablished,
            b"STMf" => StatEvent::Flushed,
            b"STMh" => StatEvent::HeadersReceived,
            b"STMl" => StatEvent::ThresholdReached,
            b"STMn" => StatEvent::NotSupported,
            b"STMo" => StatEvent::OutputUnderrun,
            b"STMp" => StatEvent::Paused,
            b"STMr" => StatEvent::Resumed,
            b"STMs" => StatEvent::TrackStarted,
            b"STMt" => StatEvent::Heartbeat,
            b"STMu" => StatEvent::Underrun,
            _ => StatEvent::Other(code),
        }
    }

    pub fn code(&self) -> CommandCode {
        match self {
            StatEvent::Connected => *b"STMc",
            StatEvent::DecoderReady => *b"STMd",
            StatEvent::StreamEstablished => *b"STMe",
            StatEvent::Flushed => *b"STMf",
            StatEvent::HeadersReceived => *b"STMh",
            StatEvent::ThresholdReached => *b"STMl",
            StatEvent::NotSupported => *b"STMn",
            StatEvent::OutputUnderrun => *b"STMo",
            StatEvent::Paused => *b"STMp",
            StatEvent::Resumed => *b"STMr",
            StatEvent::TrackStarted => *b"STMs",
            StatEvent::Heartbeat => *b"STMt",
            StatEvent::Underrun => *b"STMu",
            StatEvent::Other(code) => *code,
        }
    }
}

impl fmt::Display for StatEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&code_str(&self.code()))
    }
}

/// Optional trailing STAT fields sent by newer firmware
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatTail {
    pub voltage: u16,
    pub elapsed_ms: u32,
    pub server_timestamp: u32,
    pub error_code: u16,
}

/// Periodic device status report
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Stat {
    pub event: StatEvent,
    pub crlf_count: u8,
    pub mas_initialized: u8,
    pub mas_mode: u8,
    pub buffer_size: u32,
    pub fullness: u32,
    pub bytes_received: u64,
    pub signal_strength: u16,
    pub jiffies: u32,
    pub output_buffer_size: u32,
    pub output_buffer_fullness: u32,
    pub elapsed_seconds: u32,
    pub tail: Option<StatTail>,
}

impl Stat {
    pub fn new(event: StatEvent) -> Self {
        Self {
            event,
            crlf_count: 0,
            mas_initialized: 0,
            mas_mode: 0,
            buffer_size: 0,
            fullness: 0,
            bytes_received: 0,
            signal_strength: 0,
            jiffies: 0,
            output_buffer_size: 0,
            output_buffer_fullness: 0,
            elapsed_seconds: 0,
            tail: None,
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < STAT_MIN_LEN {
            return Err(too_short("STAT", data.len(), STAT_MIN_LEN));
        }

        let tail = (data.len() >= STAT_FULL_LEN).then(|| StatTail {
            voltage: be_u16(data, 41),
            elapsed_ms: be_u32(data, 43),
            server_timestamp: be_u32(data, 47),
            error_code: be_u16(data, 51),
        });

        Ok(Stat {
            event: StatEvent::from_code([data[0], data[1], data[2], data[3]]),
            crlf_count: data[4],
            mas_initialized: data[5],
            mas_mode: data[6],
            buffer_size: be_u32(data, 7),
            fullness: be_u32(data, 11),
            bytes_received: be_uint(&data[15..23]),
            signal_strength: be_u16(data, 23),
            jiffies: be_u32(data, 25),
            output_buffer_size: be_u32(data, 29),
            output_buffer_fullness: be_u32(data, 33),
            elapsed_seconds: be_u32(data, 37),
            tail,
        })
    }

    pub fn to_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(STAT_FULL_LEN);
        out.extend_from_slice(&self.event.code());
        out.extend_from_slice(&[self.crlf_count, self.mas_initialized, self.mas_mode]);
        out.extend_from_slice(&self.buffer_size.to_be_bytes());
        out.extend_from_slice(&self.fullness.to_be_bytes());
        out.extend_from_slice(&self.bytes_received.to_be_bytes());
        out.extend_from_slice(&self.signal_strength.to_be_bytes());
        out.extend_from_slice(&self.jiffies.to_be_bytes());
        out.extend_from_slice(&self.output_buffer_size.to_be_bytes());
        out.extend_from_slice(&self.output_buffer_fullness.to_be_bytes());
        out.extend_from_slice(&self.elapsed_seconds.to_be_bytes());
        if let Some(tail) = &self.tail {
            out.extend_from_slice(&tail.voltage.to_be_bytes());
            out.extend_from_slice(&tail.elapsed_ms.to_be_bytes());
            out.extend_from_slice(&tail.server_timestamp.to_be_bytes());
            out.extend_from_slice(&tail.error_code.to_be_bytes());
        }
        out
    }

    /// Buffer occupancy in percent; an unreported (zero) buffer size reads as empty
    pub fn fullness_percent(&self) -> f64 {
        if self.buffer_size == 0 {
            return 0.0;
        }
        (100.0 * f64::from(self.fullness) / f64::from(self.buffer_size)).min(100.0)
    }
}

// ---------------------------------------------------------------------------
// Server -> device
// ---------------------------------------------------------------------------

/// `strm` sub-command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamCommand {
    Start,
    Stop,
    Status,
}

impl StreamCommand {
    pub fn as_byte(self) -> u8 {
        match self {
            StreamCommand::Start => b's',
            StreamCommand::Stop => b'q',
            StreamCommand::Status => b't',
        }
    }

    pub fn from_byte(byte: u8) -> Result<Self, ProtocolError> {
        match byte {
            b's' => Ok(StreamCommand::Start),
            b'q' => Ok(StreamCommand::Stop),
            b't' => Ok(StreamCommand::Status),
            other => Err(ProtocolError::InvalidCommand(format!(
                "strm {}",
                other as char
            ))),
        }
    }
}

/// Stream control command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Strm {
    pub command: StreamCommand,
    pub autostart: u8,
    pub format: u8,
    /// Sample size, rate, channels, endianness; `?` lets the device detect them
    pub pcm: [u8; 4],
    pub threshold: u8,
    pub spdif_enable: u8,
    pub transition_period: u8,
    pub transition_type: u8,
    pub flags: u8,
    pub output_threshold: u8,
    pub reserved: u8,
    pub replay_gain: u32,
    pub server_port: u16,
    /// Zero means "the address this control connection came from"
    pub server_ip: Ipv4Addr,
    pub http_request: Vec<u8>,
}

impl Strm {
    fn control(command: StreamCommand) -> Self {
        Self {
            command,
            autostart: b'0',
            format: b'm',
            pcm: *b"????",
            threshold: 0,
            spdif_enable: 0,
            transition_period: 0,
            transition_type: b'0',
            flags: 0,
            output_threshold: 0,
            reserved: 0,
            replay_gain: 0,
            server_port: 0,
            server_ip: Ipv4Addr::UNSPECIFIED,
            http_request: Vec::new(),
        }
    }

    /// Stop playback and drop whatever the device has buffered
    pub fn stop() -> Self {
        Self::control(StreamCommand::Stop)
    }

    /// Ask the device for a STAT report
    pub fn status() -> Self {
        Self::control(StreamCommand::Status)
    }

    /// Start streaming `/stream/{endpoint_id}` from `server_port` on the control peer
    pub fn start(format: u8, server_port: u16, endpoint_id: &str) -> Self {
        Self {
            autostart: b'1',
            format,
            threshold: 255,
            transition_period: 10,
            server_port,
            http_request: stream_request(endpoint_id),
            ..Self::control(StreamCommand::Start)
        }
    }

    /// Path of the embedded HTTP request line, if any
    pub fn stream_path(&self) -> Option<&str> {
        let line = std::str::from_utf8(&self.http_request).ok()?;
        let mut parts = line.lines().next()?.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some("GET"), Some(path)) => Some(path),
            _ => None,
        }
    }

    fn write_body(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&[self.command.as_byte(), self.autostart, self.format]);
        out.extend_from_slice(&self.pcm);
        out.extend_from_slice(&[
            self.threshold,
            self.spdif_enable,
            self.transition_period,
            self.transition_type,
            self.flags,
            self.output_threshold,
            self.reserved,
        ]);
        out.extend_from_slice(&self.replay_gain.to_be_bytes());
        out.extend_from_slice(&self.server_port.to_be_bytes());
        out.extend_from_slice(&self.server_ip.octets());
        out.extend_from_slice(&self.http_request);
    }

    fn parse_body(body: &[u8]) -> Result<Self, ProtocolError> {
        if body.len() < STRM_HEADER_LEN {
            return Err(too_short("strm", body.len(), STRM_HEADER_LEN));
        }
        Ok(Self {
            command: StreamCommand::from_byte(body[0])?,
            autostart: body[1],
            format: body[2],
            pcm: [body[3], body[4], body[5], body[6]],
            threshold: body[7],
            spdif_enable: body[8],
            transition_period: body[9],
            transition_type: body[10],
            flags: body[11],
            output_threshold: body[12],
            reserved: body[13],
            replay_gain: be_u32(body, 14),
            server_port: be_u16(body, 18),
            server_ip: Ipv4Addr::new(body[20], body[21], body[22], body[23]),
            http_request: body[STRM_HEADER_LEN..].to_vec(),
        })
    }
}

/// HTTP request line the device replays against the stream server
pub fn stream_request(endpoint_id: &str) -> Vec<u8> {
    format!("GET /stream/{endpoint_id} HTTP/1.0\r\n\r\n").into_bytes()
}

/// Volume block; only the neutral setting is ever sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Audg {
    pub old_left: u32,
    pub old_right: u32,
    pub digital_volume_control: u8,
    pub preamp: u8,
    pub new_left: u32,
    pub new_right: u32,
    pub sequence: u32,
}

impl Audg {
    /// Unity gain on both channels (16.16 fixed point), full preamp
    pub fn neutral() -> Self {
        Self {
            old_left: 80,
            old_right: 80,
            digital_volume_control: 0,
            preamp: 255,
            new_left: 0x0001_0000,
            new_right: 0x0001_0000,
            sequence: 0,
        }
    }

    const BODY_LEN: usize = 22;

    fn write_body(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.old_left.to_be_bytes());
        out.extend_from_slice(&self.old_right.to_be_bytes());
        out.extend_from_slice(&[self.digital_volume_control, self.preamp]);
        out.extend_from_slice(&self.new_left.to_be_bytes());
        out.extend_from_slice(&self.new_right.to_be_bytes());
        out.extend_from_slice(&self.sequence.to_be_bytes());
    }

    fn parse_body(body: &[u8]) -> Result<Self, ProtocolError> {
        if body.len() < Self::BODY_LEN {
            return Err(too_short("audg", body.len(), Self::BODY_LEN));
        }
        Ok(Self {
            old_left: be_u32(body, 0),
            old_right: be_u32(body, 4),
            digital_volume_control: body[8],
            preamp: body[9],
            new_left: be_u32(body, 10),
            new_right: be_u32(body, 14),
            sequence: be_u32(body, 18),
        })
    }
}

/// Commands the server sends to a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerCommand {
    Strm(Strm),
    /// Request a device setting by parameter id
    Setd(u8),
    /// Enable or disable the S/PDIF and DAC outputs
    Aude { spdif: bool, dac: bool },
    Audg(Audg),
}

impl ServerCommand {
    pub fn code(&self) -> &'static CommandCode {
        match self {
            ServerCommand::Strm(_) => b"strm",
            ServerCommand::Setd(_) => b"setd",
            ServerCommand::Aude { .. } => b"aude",
            ServerCommand::Audg(_) => b"audg",
        }
    }

    /// Command code followed by the fixed-shape body
    pub fn payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        out.extend_from_slice(self.code());
        match self {
            ServerCommand::Strm(strm) => strm.write_body(&mut out),
            ServerCommand::Setd(param) => out.push(*param),
            ServerCommand::Aude { spdif, dac } => {
                out.extend_from_slice(&[u8::from(*spdif), u8::from(*dac)])
            }
            ServerCommand::Audg(audg) => audg.write_body(&mut out),
        }
        out
    }

    /// Serialize to bytes: `[length:u16 BE][payload]`, length excluding itself
    pub fn to_frame(&self) -> Result<Vec<u8>, ProtocolError> {
        let payload = self.payload();
        let len =
            u16::try_from(payload.len()).map_err(|_| ProtocolError::FrameTooLarge(payload.len()))?;

        let mut frame = Vec::with_capacity(payload.len() + 2);
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    /// Decode a payload (without the length prefix) as a device would
    pub fn from_payload(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() < 4 {
            return Err(too_short("server command", payload.len(), 4));
        }
        let (code, body) = payload.split_at(4);
        match code {
            b"strm" => Ok(ServerCommand::Strm(Strm::parse_body(body)?)),
            b"setd" => body
                .first()
                .map(|param| ServerCommand::Setd(*param))
                .ok_or_else(|| too_short("setd", body.len(), 1)),
            b"aude" => {
                if body.len() < 2 {
                    return Err(too_short("aude", body.len(), 2));
                }
                Ok(ServerCommand::Aude {
                    spdif: body[0] != 0,
                    dac: body[1] != 0,
                })
            }
            b"audg" => Ok(ServerCommand::Audg(Audg::parse_body(body)?)),
            other => Err(ProtocolError::InvalidCommand(code_str(other))),
        }
    }
}

impl fmt::Display for ServerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerCommand::Strm(strm) => write!(f, "strm {}", strm.command.as_byte() as char),
            ServerCommand::Setd(param) => write!(f, "setd {param}"),
            ServerCommand::Aude { spdif, dac } => write!(f, "aude spdif={spdif} dac={dac}"),
            ServerCommand::Audg(_) => f.write_str("audg"),
        }
    }
}
