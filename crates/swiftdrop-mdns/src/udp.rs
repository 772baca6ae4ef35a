//! UDP broadcast discovery fallback, for networks where mDNS is blocked.
//!
//! Packet layout, all multi-byte fields big-endian: 7-byte magic `SWFTDRP`,
//! 1-byte protocol version, 8 ASCII bytes of short id, 2 bytes transfer
//! port, 1-byte device-class code, 1-byte name length, then that many
//! UTF-8 bytes of display name. Minimum length 20 (empty name).

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::{trace, warn};

use swiftdrop_core::device::DeviceClass;

pub const MAGIC: &[u8; 7] = b"SWFTDRP";
const SHORT_ID_LEN: usize = 8;
const MIN_PACKET_LEN: usize = 20;
const MAX_NAME_LEN: usize = 255;

#[derive(Debug, Error)]
pub enum UdpDiscoveryError {
    #[error("failed to bind UDP broadcast socket: {0}")]
    Bind(#[source] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpAnnouncement {
    pub protocol_version: u8,
    pub short_id: String,
    pub transfer_port: u16,
    pub device_class: DeviceClass,
    pub display_name: String,
}

/// Right-pad/truncate `short_id` into the fixed 8-byte ASCII field.
fn pack_short_id(short_id: &str) -> [u8; SHORT_ID_LEN] {
    let mut out = [0u8; SHORT_ID_LEN];
    let bytes = short_id.as_bytes();
    let n = bytes.len().min(SHORT_ID_LEN);
    out[..n].copy_from_slice(&bytes[..n]);
    out
}

fn unpack_short_id(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).to_string()
}

pub fn encode(ann: &UdpAnnouncement) -> Vec<u8> {
    let name_bytes = ann.display_name.as_bytes();
    let name_len = name_bytes.len().min(MAX_NAME_LEN);

    let mut out = Vec::with_capacity(MIN_PACKET_LEN + name_len);
    out.extend_from_slice(MAGIC);
    out.push(ann.protocol_version);
    out.extend_from_slice(&pack_short_id(&ann.short_id));
    out.extend_from_slice(&ann.transfer_port.to_be_bytes());
    out.push(ann.device_class.wire_byte());
    out.push(name_len as u8);
    out.extend_from_slice(&name_bytes[..name_len]);
    out
}

/// Parse one UDP packet. Returns `None` on any failed magic/length/bounds
/// check, such packets are silently dropped, not errors.
pub fn decode(buf: &[u8]) -> Option<UdpAnnouncement> {
    if buf.len() < MIN_PACKET_LEN {
        return None;
    }
    if &buf[0..7] != MAGIC {
        return None;
    }
    let protocol_version = buf[7];
    let short_id = unpack_short_id(&buf[8..8 + SHORT_ID_LEN]);
    let transfer_port = u16::from_be_bytes([buf[16], buf[17]]);
    let device_class = DeviceClass::from_wire_byte(buf[18]);
    let name_len = buf[19] as usize;
    if buf.len() != MIN_PACKET_LEN + name_len {
        return None;
    }
    let display_name = std::str::from_utf8(&buf[20..20 + name_len]).ok()?.to_string();

    Some(UdpAnnouncement {
        protocol_version,
        short_id,
        transfer_port,
        device_class,
        display_name,
    })
}

/// Bind a UDP socket on `port` with `SO_BROADCAST`/`SO_REUSEADDR` set, ready
/// to both send and receive fallback announcements.
pub fn bind_broadcast_socket(port: u16) -> Result<UdpSocket, UdpDiscoveryError> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(UdpDiscoveryError::Bind)?;
    socket.set_reuse_address(true).map_err(UdpDiscoveryError::Bind)?;
    socket.set_broadcast(true).map_err(UdpDiscoveryError::Bind)?;
    socket.set_nonblocking(true).map_err(UdpDiscoveryError::Bind)?;
    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    socket.bind(&addr.into()).map_err(UdpDiscoveryError::Bind)?;
    UdpSocket::from_std(socket.into()).map_err(UdpDiscoveryError::Bind)
}

/// Broadcast `ann` once to `255.255.255.255:port`.
pub async fn send_announcement(socket: &UdpSocket, ann: &UdpAnnouncement, port: u16) -> std::io::Result<()> {
    let packet = encode(ann);
    let dest = SocketAddr::from((Ipv4Addr::BROADCAST, port));
    socket.send_to(&packet, dest).await?;
    Ok(())
}

/// Receive one fallback announcement and the address it arrived from,
/// ignoring malformed packets and packets whose short id matches
/// `local_short_id` (self-loopback).
pub async fn recv_announcement(
    socket: &UdpSocket,
    local_short_id: &str,
) -> std::io::Result<Option<(UdpAnnouncement, SocketAddr)>> {
    let mut buf = [0u8; 1024];
    let (n, from) = socket.recv_from(&mut buf).await?;
    match decode(&buf[..n]) {
        Some(ann) if ann.short_id == local_short_id => {
            trace!(%from, "dropped self-originated udp announcement");
            Ok(None)
        }
        Some(ann) => Ok(Some((ann, from))),
        None => {
            warn!(%from, len = n, "dropped malformed udp discovery packet");
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> UdpAnnouncement {
        UdpAnnouncement {
            protocol_version: 1,
            short_id: "abcd1234".to_string(),
            transfer_port: 9876,
            device_class: DeviceClass::Linux,
            display_name: "desk".to_string(),
        }
    }

    #[test]
    fn round_trip() {
        let ann = sample();
        let packet = encode(&ann);
        assert_eq!(packet.len(), MIN_PACKET_LEN + ann.display_name.len());
        assert_eq!(decode(&packet), Some(ann));
    }

    #[test]
    fn empty_name_hits_minimum_length() {
        let mut ann = sample();
        ann.display_name.clear();
        let packet = encode(&ann);
        assert_eq!(packet.len(), MIN_PACKET_LEN);
        assert!(decode(&packet).is_some());
    }

    #[test]
    fn bad_magic_is_dropped() {
        let mut packet = encode(&sample());
        packet[0] = b'X';
        assert!(decode(&packet).is_none());
    }

    #[test]
    fn too_short_is_dropped() {
        assert!(decode(&[0u8; MIN_PACKET_LEN - 1]).is_none());
    }

    #[test]
    fn name_length_inconsistent_with_buffer_is_dropped() {
        let mut packet = encode(&sample());
        packet[19] = 200;
        assert!(decode(&packet).is_none());
    }

    #[tokio::test]
    async fn send_and_receive_over_loopback_broadcast() {
        let sender = bind_broadcast_socket(0).unwrap();
        let receiver = bind_broadcast_socket(41235).unwrap();

        let ann = sample();
        send_announcement(&sender, &ann, 41235).await.unwrap();

        let received = recv_announcement(&receiver, "zzzzzzzz").await.unwrap();
        assert_eq!(received.map(|(a, _)| a), Some(ann));
    }

    #[tokio::test]
    async fn self_announcement_is_dropped() {
        let sender = bind_broadcast_socket(0).unwrap();
        let receiver = bind_broadcast_socket(41236).unwrap();

        let ann = sample();
        send_announcement(&sender, &ann, 41236).await.unwrap();

        let received = recv_announcement(&receiver, &ann.short_id).await.unwrap();
        assert_eq!(received, None);
    }
}
