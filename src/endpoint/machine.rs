use crate::formats::FormatRegistry;
use crate::playlist::Playlist;
use log::{debug, info, trace, warn};
use serde::Serialize;
use slimproto::{
    Audg, Helo, ServerCommand, Stat, StatEvent, Strm, SETD_DEVICE_ID, SETD_PLAYER_NAME,
};
use std::fmt;
use std::path::{Path, PathBuf};

/// Format byte used when a track has no profile; the stream request will then fail with 415
const FALLBACK_FORMAT_TAG: u8 = b'm';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Accepted, waiting for HELO
    Connected,
    /// Setup sequence in flight
    Provisioning,
    Idle,
    Playing,
    Disconnected,
}

impl Phase {
    fn is_provisioned(self) -> bool {
        matches!(self, Phase::Idle | Phase::Playing)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Connected => "connected",
            Phase::Provisioning => "provisioning",
            Phase::Idle => "idle",
            Phase::Playing => "playing",
            Phase::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// Everything that can happen to an endpoint
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Helo(Helo),
    Stat(Stat),
    Queue(Vec<PathBuf>),
    /// `pos` is 1-based and takes precedence over `delta`
    Play {
        delta: i64,
        pos: Option<i64>,
        flush: bool,
    },
    Flush,
    Heartbeat,
    /// The setup frames queued by a HELO reached the socket
    SetupSent,
    ConnectionLost,
}

/// Side effects the actor carries out, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Send(ServerCommand),
    CancelStream,
}

/// Per-device protocol state, free of I/O
pub struct EndpointMachine {
    id: String,
    stream_port: u16,
    formats: &'static FormatRegistry,
    phase: Phase,
    playlist: Playlist,
    helo: Option<Helo>,
    fullness: f64,
}

impl EndpointMachine {
    pub fn new(id: String, stream_port: u16, formats: &'static FormatRegistry) -> Self {
        Self {
            id,
            stream_port,
            formats,
            phase: Phase::Connected,
            playlist: Playlist::new(),
            helo: None,
            fullness: 0.0,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn playlist(&self) -> &Playlist {
        &self.playlist
    }

    pub fn helo(&self) -> Option<&Helo> {
        self.helo.as_ref()
    }

    pub fn fullness_percent(&self) -> f64 {
        self.fullness
    }

    pub fn current_track(&self) -> Option<&Path> {
        self.playlist.current_track()
    }

    pub fn handle(&mut self, input: Input) -> Vec<Effect> {
        if self.phase == Phase::Disconnected {
            return Vec::new();
        }

        match input {
            Input::Helo(helo) => self.on_helo(helo),
            Input::Stat(stat) => self.on_stat(stat),
            Input::Queue(tracks) => self.on_queue(tracks),
            Input::Play { delta, pos, flush } => {
                if !self.phase.is_provisioned() {
                    debug!("{}: ignoring play before handshake", self.id);
                    return Vec::new();
                }
                self.play(delta, pos, flush)
            }
            Input::Flush => self.on_flush(),
            Input::Heartbeat => vec![Effect::Send(ServerCommand::Strm(Strm::status()))],
            Input::SetupSent => self.on_setup_sent(),
            Input::ConnectionLost => {
                self.phase = Phase::Disconnected;
                vec![Effect::CancelStream]
            }
        }
    }

    fn on_helo(&mut self, helo: Helo) -> Vec<Effect> {
        if self.helo.is_some() {
            warn!("⚠️  {}: repeated HELO, running setup again", self.id);
        }
        self.helo = Some(helo);
        self.phase = Phase::Provisioning;

        vec![
            Effect::Send(ServerCommand::Strm(Strm::stop())),
            Effect::Send(ServerCommand::Setd(SETD_PLAYER_NAME)),
            Effect::Send(ServerCommand::Setd(SETD_DEVICE_ID)),
            Effect::Send(ServerCommand::Aude {
                spdif: true,
                dac: true,
            }),
            Effect::Send(ServerCommand::Audg(Audg::neutral())),
        ]
    }

    fn on_setup_sent(&mut self) -> Vec<Effect> {
        if self.phase != Phase::Provisioning {
            return Vec::new();
        }
        self.phase = Phase::Idle;
        if self.playlist.is_empty() {
            Vec::new()
        } else {
            self.play(1, None, false)
        }
    }

    fn on_stat(&mut self, stat: Stat) -> Vec<Effect> {
        self.fullness = stat.fullness_percent();
        trace!(
            "{}: STAT {} fullness {:.1}% elapsed {}s",
            self.id,
            stat.event,
            self.fullness,
            stat.elapsed_seconds
        );

        match stat.event {
            StatEvent::DecoderReady if self.phase == Phase::Playing => {
                info!("🎶 {}: track drained, advancing", self.id);
                self.play(1, None, false)
            }
            StatEvent::Underrun | StatEvent::OutputUnderrun => {
                warn!("⚠️  {}: device reported {}", self.id, stat.event);
                Vec::new()
            }
            StatEvent::TrackStarted
                if self.phase.is_provisioned() && self.playlist.current_track().is_some() =>
            {
                debug!("{}: track started on device", self.id);
                self.phase = Phase::Playing;
                Vec::new()
            }
            StatEvent::TrackStarted => {
                debug!("{}: device started a track with none selected", self.id);
                Vec::new()
            }
            StatEvent::Flushed => {
                debug!("{}: device flushed", self.id);
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    fn on_queue(&mut self, tracks: Vec<PathBuf>) -> Vec<Effect> {
        debug!("{}: queueing {} tracks", self.id, tracks.len());
        self.playlist.append(tracks);

        if self.phase == Phase::Idle && self.playlist.current_index().is_none() {
            self.play(1, None, false)
        } else {
            Vec::new()
        }
    }

    fn on_flush(&mut self) -> Vec<Effect> {
        self.playlist.clear();
        if !self.phase.is_provisioned() {
            return vec![Effect::CancelStream];
        }
        self.phase = Phase::Idle;
        vec![
            Effect::CancelStream,
            Effect::Send(ServerCommand::Strm(Strm::stop())),
        ]
    }

    fn play(&mut self, delta: i64, pos: Option<i64>, flush: bool) -> Vec<Effect> {
        let mut effects = Vec::new();
        if flush {
            effects.push(Effect::Send(ServerCommand::Strm(Strm::stop())));
            effects.push(Effect::CancelStream);
        }
        if delta != 0 || pos.is_some() {
            self.playlist.reposition(delta, pos);
        }

        let Some(track) = self.playlist.current_track() else {
            self.phase = Phase::Idle;
            return effects;
        };

        let format_tag = match self.formats.lookup(track) {
            Some(profile) => profile.format_tag,
            None => {
                warn!("⚠️  {}: no format profile for {}", self.id, track.display());
                FALLBACK_FORMAT_TAG
            }
        };
        info!(
            "▶️  {}: playing #{} {}",
            self.id,
            self.playlist.current_index().map_or(0, |i| i + 1),
            track.display()
        );

        if !flush {
            effects.push(Effect::CancelStream);
        }
        effects.push(Effect::Send(ServerCommand::Strm(Strm::start(
            format_tag,
            self.stream_port,
            &self.id,
        ))));
        effects.push(Effect::Send(ServerCommand::Audg(Audg::neutral())));
        self.phase = Phase::Playing;
        effects
    }
}
