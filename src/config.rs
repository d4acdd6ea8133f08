use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("max_endpoints must be at least 1")]
    ZeroCapacity,
    #[error("{0} must be greater than zero")]
    ZeroChunkSize(&'static str),
    #[error("heartbeat interval must be greater than zero")]
    ZeroHeartbeat,
    #[error("throttle percent {0} is outside (0, 100]")]
    ThrottleOutOfRange(f64),
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address devices connect to
    pub slimproto_addr: SocketAddr,
    /// Address of the streaming and control HTTP listener
    pub http_addr: SocketAddr,
    /// Port advertised to devices in `strm` start frames; `None` uses the bound HTTP port
    pub stream_port: Option<u16>,
    pub max_endpoints: usize,
    pub heartbeat_interval: Duration,
    pub direct_chunk_size: usize,
    pub transcode_chunk_size: usize,
    /// Direct-file streaming pauses while the device buffer is fuller than this
    pub throttle_percent: f64,
    pub throttle_pause: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            slimproto_addr: SocketAddr::from(([0, 0, 0, 0], slimproto::SLIMPROTO_PORT)),
            http_addr: SocketAddr::from(([0, 0, 0, 0], 9000)),
            stream_port: None,
            max_endpoints: 3,
            heartbeat_interval: Duration::from_secs(5),
            direct_chunk_size: 64 * 1024,
            transcode_chunk_size: 32 * 1024,
            throttle_percent: 90.0,
            throttle_pause: Duration::from_millis(250),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_endpoints == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        if self.direct_chunk_size == 0 {
            return Err(ConfigError::ZeroChunkSize("direct_chunk_size"));
        }
        if self.transcode_chunk_size == 0 {
            return Err(ConfigError::ZeroChunkSize("transcode_chunk_size"));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::ZeroHeartbeat);
        }
        if !(self.throttle_percent > 0.0 && self.throttle_percent <= 100.0) {
            return Err(ConfigError::ThrottleOutOfRange(self.throttle_percent));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.slimproto_addr.port(), 3483);
        assert_eq!(config.http_addr.port(), 9000);
        assert_eq!(config.max_endpoints, 3);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_validation() {
        let config = ServerConfig {
            max_endpoints: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::ZeroCapacity));

        let config = ServerConfig {
            transcode_chunk_size: 0,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroChunkSize("transcode_chunk_size"))
        );

        let config = ServerConfig {
            heartbeat_interval: Duration::ZERO,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::ZeroHeartbeat));

        for throttle_percent in [0.0, -5.0, 100.5, f64::NAN] {
            let config = ServerConfig {
                throttle_percent,
                ..Default::default()
            };
            assert!(config.validate().is_err(), "{throttle_percent}");
        }

        let config = ServerConfig {
            throttle_percent: 100.0,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }
}
