//! SlimProto wire codec
//!
//! Devices send `[command:4][length:u32 BE][payload]` frames; the server answers with
//! `[length:u16 BE][command:4][body]`. This crate covers both directions so the server
//! and test device simulators share one definition of the format.

pub mod client;
pub mod connection;
pub mod protocol;

pub use client::DeviceClient;
pub use connection::{split, FrameReader, FrameWriter};
pub use protocol::{
    Audg, CommandCode, DeviceMessage, Helo, InboundFrame, ProtocolError, ServerCommand, Stat,
    StatEvent, StatTail, StreamCommand, Strm, SETD_DEVICE_ID, SETD_PLAYER_NAME, SLIMPROTO_PORT,
};
