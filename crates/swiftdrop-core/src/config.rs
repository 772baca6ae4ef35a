use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Current protocol version this implementation speaks.
pub const PROTOCOL_VERSION: u16 = 1;

/// Tunables for the transfer protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Protocol version this peer advertises.
    pub protocol_version: u16,
    /// Minimum protocol version this peer will accept from a remote.
    pub min_supported_version: u16,
    /// Chunk size used when preparing a file for sending.
    pub chunk_size: u32,
    /// Maximum retransmission attempts per chunk before the transfer fails.
    pub max_chunk_retries: u32,
    /// Maximum number of transfers (send + receive, counted independently)
    /// the controller will run concurrently.
    pub max_concurrent_transfers: usize,

    pub handshake_reply_timeout: Duration,
    pub handshake_confirm_timeout: Duration,
    pub file_meta_response_timeout: Duration,
    pub chunk_ack_timeout: Duration,
    pub transfer_verified_timeout: Duration,
    pub accept_connection_timeout: Duration,

    pub device_timeout: Duration,
    pub discovery_interval: Duration,
    pub discovery_cleanup_interval: Duration,
    pub max_visible_devices: usize,
    pub udp_broadcast_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            min_supported_version: 1,
            chunk_size: 64 * 1024,
            max_chunk_retries: 3,
            max_concurrent_transfers: 3,

            handshake_reply_timeout: Duration::from_secs(15),
            handshake_confirm_timeout: Duration::from_secs(30),
            file_meta_response_timeout: Duration::from_secs(60),
            chunk_ack_timeout: Duration::from_secs(30),
            transfer_verified_timeout: Duration::from_secs(30),
            accept_connection_timeout: Duration::from_secs(30),

            device_timeout: Duration::from_secs(15),
            discovery_interval: Duration::from_secs(3),
            discovery_cleanup_interval: Duration::from_secs(5),
            max_visible_devices: 10,
            udp_broadcast_port: 41234,
        }
    }
}

impl Config {
    pub fn version_in_range(&self, remote_version: u16) -> bool {
        (self.min_supported_version..=self.protocol_version).contains(&remote_version)
    }
}
