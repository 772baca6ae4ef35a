//! mDNS advertisement of the local device on `_swiftdrop._tcp`.

use anyhow::Result;
use mdns_sd::{ServiceDaemon, ServiceInfo};

use crate::model::{ServiceAnnouncement, TxtRecord};
use swiftdrop_core::device::DeviceClass;

pub const SERVICE_TYPE: &str = "_swiftdrop._tcp.local.";

/// What the local device advertises itself as.
pub struct LocalAdvertisement {
    pub short_id: String,
    pub display_name: String,
    pub device_class: DeviceClass,
    pub protocol_version: u16,
    pub transfer_port: u16,
    pub host_name: String,
    pub ip_addr: String,
}

impl LocalAdvertisement {
    fn into_service_announcement(self) -> ServiceAnnouncement {
        let txt = TxtRecord(vec![
            ("dn".to_string(), self.display_name),
            ("dt".to_string(), (self.device_class.wire_byte() as char).to_string()),
            ("v".to_string(), self.protocol_version.to_string()),
            ("id".to_string(), self.short_id.clone()),
            ("tp".to_string(), self.transfer_port.to_string()),
        ]);
        ServiceAnnouncement {
            service_type: SERVICE_TYPE.to_string(),
            instance_name: format!("SwiftDrop-{}", self.short_id),
            host_name: self.host_name,
            ip_addr: self.ip_addr,
            port: self.transfer_port,
            txt: Some(txt),
        }
    }
}

/// Handle so the service stays registered while this is alive.
pub struct Announcer {
    _daemon: ServiceDaemon,
    fullname: String,
}

impl Announcer {
    pub fn register(ann: ServiceAnnouncement) -> Result<Self> {
        let daemon = ServiceDaemon::new()?;

        let txt_kv = ann.txt.unwrap_or(TxtRecord(vec![])).0;

        let service_type = ensure_dot(&ann.service_type);
        let host_name = ensure_dot(&ann.host_name);

        let info = ServiceInfo::new(
            &service_type,
            &ann.instance_name,
            &host_name,
            &ann.ip_addr,
            ann.port,
            &*txt_kv,
        )?;

        daemon.register(info.clone())?;
        Ok(Self {
            _daemon: daemon,
            fullname: info.get_fullname().to_string(),
        })
    }

    /// Register the local device directly, building its TXT records
    /// (`dn|dt|v|id|tp`).
    pub fn register_local(local: LocalAdvertisement) -> Result<Self> {
        Self::register(local.into_service_announcement())
    }

    pub fn fullname(&self) -> &str {
        &self.fullname
    }
}

fn ensure_dot(s: &str) -> String {
    if s.ends_with('.') {
        s.to_string()
    } else {
        format!("{}.", s)
    }
}
