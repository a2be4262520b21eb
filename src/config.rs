use std::time::Duration;

use crate::error::{ChannelError, ChannelResult};

pub const MIN_SHMEM_REGION_SIZE: usize = 20_000;
pub const MAX_SHMEM_REGION_SIZE: usize = 2_000_000;

/// Read-only tuning parameters consumed by the connection managers and the carriers.
///
/// The config is handed in explicitly at construction time (together with the
///  dispatcher) - there is no process-wide parameter registry.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// upper bound for opening a physical connection, including the security handshake
    pub connect_timeout: Duration,
    /// default finish deadline for a message whose caller did not supply one
    pub send_timeout: Duration,

    /// a connection with no successful exchange for this long is closed by the keeper timer
    pub close_after_inactivity: Duration,
    /// a connection idle for this long (but less than `close_after_inactivity`) gets a
    ///  zero-length ping to keep NAT/firewall mappings alive and detect half-open failures
    pub ping_after_inactivity: Duration,
    /// how often the keeper timer scans the connection table
    pub keeper_interval: Duration,

    /// interval to sleep between reconnection attempts for recoverable failures
    pub reconnect_interval: Duration,
    /// upper bound on reconnection attempts before the logical connection is torn down
    pub max_reconnect_attempts: u32,

    /// hard upper bound for a single framed packet, on both send and receive
    pub max_packet_size: usize,
    /// backpressure limit for bytes queued towards one peer
    pub max_queue_bytes: usize,

    /// total size of the bidirectional shared-memory region, validated against
    ///  [MIN_SHMEM_REGION_SIZE]..=[MAX_SHMEM_REGION_SIZE]
    pub shmem_region_size: usize,

    /// packet size the HTTP tunnel aims for when splitting large content
    pub http_recommended_packet_size: usize,
    /// how long the server holds an open listener request before answering
    ///  with a 'timed out, ask again' packet
    pub http_listener_hold_timeout: Duration,
}

impl ChannelConfig {
    pub fn default_config() -> ChannelConfig {
        ChannelConfig {
            connect_timeout: Duration::from_secs(30),
            send_timeout: Duration::from_secs(120),
            close_after_inactivity: Duration::from_secs(120),
            ping_after_inactivity: Duration::from_secs(40),
            keeper_interval: Duration::from_secs(10),
            reconnect_interval: Duration::from_secs(5),
            max_reconnect_attempts: 12,
            max_packet_size: 16 * 1024 * 1024,
            max_queue_bytes: 64 * 1024 * 1024,
            shmem_region_size: 65_536,
            http_recommended_packet_size: 64 * 1024,
            http_listener_hold_timeout: Duration::from_secs(30),
        }
    }

    pub fn validate(&self) -> ChannelResult<()> {
        if self.shmem_region_size < MIN_SHMEM_REGION_SIZE
            || self.shmem_region_size > MAX_SHMEM_REGION_SIZE
        {
            return Err(ChannelError::TooLarge {
                size: self.shmem_region_size,
                limit: MAX_SHMEM_REGION_SIZE,
            });
        }
        if self.max_packet_size == 0 {
            return Err(ChannelError::logic("max_packet_size must be non-zero"));
        }
        if self.ping_after_inactivity >= self.close_after_inactivity {
            return Err(ChannelError::logic(
                "ping_after_inactivity must be shorter than close_after_inactivity",
            ));
        }
        Ok(())
    }
}

pub fn default_config() -> ChannelConfig {
    ChannelConfig::default_config()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    #[rstest]
    fn test_default_config_is_valid() {
        assert!(ChannelConfig::default_config().validate().is_ok());
    }

    #[rstest]
    #[case::too_small(19_999, false)]
    #[case::lower_bound(20_000, true)]
    #[case::upper_bound(2_000_000, true)]
    #[case::too_big(2_000_001, false)]
    fn test_region_size_bounds(#[case] region_size: usize, #[case] valid: bool) {
        let mut config = ChannelConfig::default_config();
        config.shmem_region_size = region_size;
        assert_eq!(config.validate().is_ok(), valid);
    }

    #[rstest]
    fn test_ping_must_precede_close() {
        let mut config = ChannelConfig::default_config();
        config.ping_after_inactivity = config.close_after_inactivity;
        assert!(config.validate().is_err());
    }
}
