//! Zero-configuration LAN peer discovery for SwiftDrop.
//!
//! Combines an mDNS advertise/browse pair with a UDP broadcast fallback,
//! feeding both into one capped, timeout-swept [`DeviceTable`]. Either
//! backend may fail independently without taking down the other, mDNS
//! backend errors and UDP bind contention are both non-fatal.

pub mod announce;
pub mod device_table;
pub mod discover;
pub mod model;
pub mod net;
pub mod udp;

use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

pub use announce::{Announcer, LocalAdvertisement, SERVICE_TYPE};
pub use device_table::DeviceTable;
use swiftdrop_core::device::Device;

/// Everything discovery needs to know about the local device it advertises.
#[derive(Debug, Clone)]
pub struct LocalDevice {
    pub short_id: String,
    pub display_name: String,
    pub device_class: swiftdrop_core::device::DeviceClass,
    pub protocol_version: u16,
    pub transfer_port: u16,
}

/// Runs mDNS advertise + browse and the UDP fallback concurrently, all
/// feeding one [`DeviceTable`]. Dropping the returned handle stops every
/// background task.
pub struct Discovery {
    table: std::sync::Arc<DeviceTable>,
    _announcer: Option<Announcer>,
    _tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl Discovery {
    pub fn device_updates(&self) -> broadcast::Receiver<Vec<Device>> {
        self.table.subscribe()
    }

    pub async fn snapshot(&self) -> Vec<Device> {
        self.table.snapshot().await
    }

    /// Start advertising and browsing for `local`. `host_name`/`ip_addr`
    /// are the mDNS service's own address fields; if mDNS registration
    /// fails, that failure is logged and browsing/UDP continue alone.
    pub async fn start(
        local: LocalDevice,
        host_name: String,
        ip_addr: String,
        device_timeout: Duration,
        discovery_interval: Duration,
        cleanup_interval: Duration,
        udp_port: u16,
        max_visible_devices: usize,
    ) -> Self {
        let table = std::sync::Arc::new(DeviceTable::new(max_visible_devices));
        let mut tasks = Vec::new();

        let announcer = match Announcer::register_local(LocalAdvertisement {
            short_id: local.short_id.clone(),
            display_name: local.display_name.clone(),
            device_class: local.device_class,
            protocol_version: local.protocol_version,
            transfer_port: local.transfer_port,
            host_name,
            ip_addr,
        }) {
            Ok(a) => Some(a),
            Err(e) => {
                warn!(error = %e, "mdns advertisement failed, continuing with udp fallback only");
                None
            }
        };

        // mDNS browse -> device table.
        {
            let table = table.clone();
            let (tx, mut rx) = mpsc::channel(32);
            match discover::spawn_browser(SERVICE_TYPE, tx) {
                Ok(()) => {
                    tasks.push(tokio::spawn(async move {
                        while let Some(discovered) = rx.recv().await {
                            if let Some(device) = discover::to_device(&discovered) {
                                table.observe(device).await;
                            }
                        }
                    }));
                }
                Err(e) => warn!(error = %e, "mdns browse failed, continuing with udp fallback only"),
            }
        }

        // UDP broadcast fallback: announce on an interval, listen continuously.
        if let Ok(listen_socket) = udp::bind_broadcast_socket(udp_port) {
            let table = table.clone();
            let local_short_id = local.short_id.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    match udp::recv_announcement(&listen_socket, &local_short_id).await {
                        Ok(Some((ann, from))) => {
                            let device = udp_announcement_to_device(ann, from.ip());
                            table.observe(device).await;
                        }
                        Ok(None) => {}
                        Err(e) => {
                            warn!(error = %e, "udp discovery recv failed");
                            break;
                        }
                    }
                }
            }));
        } else {
            warn!("udp broadcast bind failed, relying on mdns alone");
        }

        if let Ok(send_socket) = udp::bind_broadcast_socket(0) {
            let ann = udp::UdpAnnouncement {
                protocol_version: local.protocol_version as u8,
                short_id: local.short_id.clone(),
                transfer_port: local.transfer_port,
                device_class: local.device_class,
                display_name: local.display_name.clone(),
            };
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(discovery_interval);
                loop {
                    ticker.tick().await;
                    if let Err(e) = udp::send_announcement(&send_socket, &ann, udp_port).await {
                        warn!(error = %e, "udp discovery broadcast failed");
                    }
                }
            }));
        }

        // Cleanup sweep.
        {
            let table = table.clone();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(cleanup_interval);
                loop {
                    ticker.tick().await;
                    table.sweep(device_timeout).await;
                }
            }));
        }

        info!("discovery started");
        Self {
            table,
            _announcer: announcer,
            _tasks: tasks,
        }
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        for task in &self._tasks {
            task.abort();
        }
    }
}

fn udp_announcement_to_device(ann: udp::UdpAnnouncement, from_ip: std::net::IpAddr) -> Device {
    use std::net::SocketAddr;
    use swiftdrop_core::device::{ConnectionKind, DeviceState};

    Device {
        short_id: ann.short_id,
        display_name: ann.display_name,
        device_class: ann.device_class,
        address: SocketAddr::new(from_ip, ann.transfer_port),
        connection_kind: ConnectionKind::Wifi,
        protocol_version: ann.protocol_version as u16,
        state: DeviceState::Available,
        last_seen: std::time::Instant::now(),
    }
}
