//! Replication configuration (spec §3 "Configuration (replication)").

use core::time::Duration;

/// Acknowledgement protocol: the point at which an application write is
/// completed upstream.
#[cfg_attr(feature = "config", derive(serde::Deserialize, serde::Serialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// Ack on local commit ("fire and forget" at the app level).
    A,
    /// Ack on peer receipt (`RecvAck`).
    B,
    /// Ack on peer commit (`WriteAck`).
    C,
}

impl Default for Protocol {
    fn default() -> Self {
        Protocol::C
    }
}

/// Tunables that change behavior at the points named in spec §4.
#[cfg_attr(feature = "config", derive(serde::Deserialize, serde::Serialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicationConfig {
    /// Acknowledgement protocol.
    pub protocol: Protocol,
    /// Send timeout on the data socket, in 100 ms units (as in the original
    /// `conf.timeout`).
    pub timeout_centiseconds: u32,
    /// Capacity of the in-memory transfer log ring.
    pub tl_size: usize,
    /// Number of 4 MiB activity-log extents kept resident.
    pub al_extents: u32,
    /// Keep-alive cadence for the meta socket.
    pub ping_interval: Duration,
}

impl ReplicationConfig {
    /// Resolve [`Self::timeout_centiseconds`] to a [`Duration`].
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.timeout_centiseconds) * 100)
    }

    /// Validate ranges that would otherwise surface as confusing panics deep
    /// inside the activity log or transfer log.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tl_size < 8 {
            return Err(ConfigError::TlSizeTooSmall(self.tl_size));
        }
        if self.al_extents == 0 {
            return Err(ConfigError::AlExtentsZero);
        }
        if self.timeout_centiseconds == 0 {
            return Err(ConfigError::TimeoutZero);
        }
        Ok(())
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            protocol: Protocol::default(),
            timeout_centiseconds: 60,
            tl_size: 256,
            al_extents: 1237,
            ping_interval: Duration::from_secs(10),
        }
    }
}

/// Errors from [`ReplicationConfig::validate`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// `tl_size` below the minimum needed for barrier cadence to make sense.
    #[error("tl_size {0} is too small (minimum 8)")]
    TlSizeTooSmall(usize),
    /// `al_extents` of zero would bound the AL to nothing.
    #[error("al_extents must be at least 1")]
    AlExtentsZero,
    /// A zero send timeout can never expire into a ping.
    #[error("timeout_centiseconds must be at least 1")]
    TimeoutZero,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        ReplicationConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_degenerate_tl_size() {
        let mut cfg = ReplicationConfig::default();
        cfg.tl_size = 1;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::TlSizeTooSmall(1))
        ));
    }
}
