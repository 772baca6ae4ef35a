//! mDNS browsing for `_swiftdrop._tcp` and the translation from a resolved
//! service into a [`Device`].

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use anyhow::Result;
use mdns_sd::{ServiceDaemon, ServiceEvent};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::model::DiscoveredService;
use swiftdrop_core::device::{ConnectionKind, Device, DeviceClass, DeviceState};

/// One-shot blocking browse, kept for simple CLI/test use. Prefer
/// [`spawn_browser`] for a long-running service.
pub fn browse_blocking(service_type: &str, timeout: Duration, _interface: &str) -> Result<Vec<DiscoveredService>> {
    let daemon = ServiceDaemon::new()?;
    let service_type = if service_type.ends_with('.') {
        service_type.to_string()
    } else {
        format!("{}.", service_type)
    };

    let receiver = daemon.browse(&service_type)?;
    let mut out = Vec::new();

    let start = Instant::now();
    while start.elapsed() < timeout {
        if let Ok(event) = receiver.recv_timeout(Duration::from_millis(2000)) {
            if let ServiceEvent::ServiceResolved(info) = event {
                out.push(resolved_to_discovered(&service_type, &info));
            }
        }
    }
    Ok(out)
}

fn resolved_to_discovered(service_type: &str, info: &mdns_sd::ServiceInfo) -> DiscoveredService {
    let txt = info
        .get_properties()
        .iter()
        .map(|prop| (prop.key().to_string(), prop.val_str().to_string()))
        .collect::<Vec<_>>();

    DiscoveredService {
        fullname: info.get_fullname().to_string(),
        instance_name: info.get_hostname().to_string(),
        service_type: service_type.to_string(),
        host_name: info.get_hostname().to_string(),
        port: info.get_port(),
        addresses: info.get_addresses().iter().copied().collect(),
        txt,
    }
}

/// Runs `ServiceDaemon::browse` on a blocking thread for as long as `tx`
/// stays open, forwarding every resolved service. The daemon (and the
/// browse) stops when the task is dropped or `tx` closes.
pub fn spawn_browser(service_type: &str, tx: mpsc::Sender<DiscoveredService>) -> Result<()> {
    let daemon = ServiceDaemon::new()?;
    let service_type = if service_type.ends_with('.') {
        service_type.to_string()
    } else {
        format!("{}.", service_type)
    };
    let receiver = daemon.browse(&service_type)?;

    tokio::task::spawn_blocking(move || {
        let _daemon = daemon;
        loop {
            match receiver.recv_timeout(Duration::from_secs(1)) {
                Ok(ServiceEvent::ServiceResolved(info)) => {
                    let discovered = resolved_to_discovered(&service_type, &info);
                    if tx.blocking_send(discovered).is_err() {
                        break;
                    }
                }
                Ok(ServiceEvent::ServiceRemoved(_, fullname)) => {
                    trace!(%fullname, "mdns service removed");
                }
                Ok(_) => {}
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    if tx.is_closed() {
                        break;
                    }
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }
        debug!("mdns browser stopped");
    });

    Ok(())
}

/// Parse the `dn|dt|v|id|tp` TXT keys out of a resolved
/// service's key/value list. Returns `None` if any required key is
/// missing or malformed, such a service is ignored, not an error.
pub fn to_device(discovered: &DiscoveredService) -> Option<Device> {
    let get = |key: &str| discovered.txt.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str());

    let display_name = get("dn")?.to_string();
    let device_class = DeviceClass::from_wire_byte(get("dt")?.bytes().next()?);
    let protocol_version: u16 = get("v")?.parse().ok()?;
    let short_id = get("id")?.to_string();
    let transfer_port: u16 = get("tp")?.parse().ok()?;

    let ip = discovered.addresses.first()?;
    let address = SocketAddr::new(*ip, transfer_port);

    Some(Device {
        short_id,
        display_name,
        device_class,
        address,
        connection_kind: ConnectionKind::Wifi,
        protocol_version,
        state: DeviceState::Available,
        last_seen: Instant::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(txt: Vec<(&str, &str)>, addr: std::net::IpAddr) -> DiscoveredService {
        DiscoveredService {
            fullname: "SwiftDrop-abcd1234._swiftdrop._tcp.local.".to_string(),
            instance_name: "swiftdrop-abcd1234".to_string(),
            service_type: "_swiftdrop._tcp.local.".to_string(),
            host_name: "swiftdrop-abcd1234.local.".to_string(),
            port: 9876,
            addresses: vec![addr],
            txt: txt.into_iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        }
    }

    #[test]
    fn parses_well_formed_txt_into_device() {
        let svc = sample(
            vec![("dn", "Alice's Phone"), ("dt", "a"), ("v", "1"), ("id", "abcd1234"), ("tp", "9876")],
            "192.168.1.42".parse().unwrap(),
        );
        let device = to_device(&svc).expect("device");
        assert_eq!(device.short_id, "abcd1234");
        assert_eq!(device.display_name, "Alice's Phone");
        assert_eq!(device.device_class, DeviceClass::Android);
        assert_eq!(device.protocol_version, 1);
        assert_eq!(device.address.port(), 9876);
    }

    #[test]
    fn missing_required_key_is_ignored() {
        let svc = sample(vec![("dn", "Alice's Phone"), ("v", "1")], "192.168.1.42".parse().unwrap());
        assert!(to_device(&svc).is_none());
    }
}
