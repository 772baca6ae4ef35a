//! The capped, timeout-driven device table and its cleanup sweep.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, Mutex};
use tracing::debug;

use swiftdrop_core::device::{Device, DeviceState};

/// Shared table of currently known peers. Mutated only while holding the
/// internal mutex; every mutation that changes the visible list emits the
/// full snapshot on `updates`.
pub struct DeviceTable {
    devices: Mutex<HashMap<String, Device>>,
    max_visible: usize,
    updates: broadcast::Sender<Vec<Device>>,
}

impl DeviceTable {
    pub fn new(max_visible: usize) -> Self {
        let (updates, _) = broadcast::channel(32);
        Self {
            devices: Mutex::new(HashMap::new()),
            max_visible,
            updates,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Vec<Device>> {
        self.updates.subscribe()
    }

    /// Insert or refresh a discovered device. New devices beyond
    /// `max_visible` are silently dropped; refreshing an existing entry
    /// never evicts it even if the table is momentarily over capacity.
    pub async fn observe(&self, mut device: Device) {
        let mut table = self.devices.lock().await;
        let now = device.last_seen;
        match table.get_mut(&device.short_id) {
            Some(existing) => {
                existing.refresh(now);
                existing.display_name = device.display_name;
                existing.device_class = device.device_class;
                existing.address = device.address;
                existing.connection_kind = device.connection_kind;
                existing.protocol_version = device.protocol_version;
            }
            None => {
                if table.len() >= self.max_visible {
                    debug!(short_id = %device.short_id, "device table full, dropping new device");
                    return;
                }
                device.refresh(now);
                table.insert(device.short_id.clone(), device);
            }
        }
        self.emit(&table);
    }

    /// Periodic sweep: demote devices past `device_timeout` to `Offline`,
    /// remove devices past `2 * device_timeout`. Call this from a
    /// `tokio::time::interval` loop at a fixed cadence.
    pub async fn sweep(&self, device_timeout: Duration) {
        let now = Instant::now();
        let mut table = self.devices.lock().await;
        let mut changed = false;

        table.retain(|_, device| {
            if device.is_expired(now, device_timeout) {
                changed = true;
                return false;
            }
            if device.is_timed_out(now, device_timeout) && device.state != DeviceState::Offline {
                device.state = DeviceState::Offline;
                changed = true;
            }
            true
        });

        if changed {
            self.emit(&table);
        }
    }

    pub async fn snapshot(&self) -> Vec<Device> {
        self.devices.lock().await.values().cloned().collect()
    }

    fn emit(&self, table: &HashMap<String, Device>) {
        let _ = self.updates.send(table.values().cloned().collect());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use swiftdrop_core::device::{ConnectionKind, DeviceClass};

    fn sample(short_id: &str) -> Device {
        Device {
            short_id: short_id.to_string(),
            display_name: "peer".to_string(),
            device_class: DeviceClass::Linux,
            address: "127.0.0.1:9876".parse::<SocketAddr>().unwrap(),
            connection_kind: ConnectionKind::Wifi,
            protocol_version: 1,
            state: DeviceState::Available,
            last_seen: Instant::now(),
        }
    }

    #[tokio::test]
    async fn overflow_devices_are_dropped() {
        let table = DeviceTable::new(2);
        table.observe(sample("a")).await;
        table.observe(sample("b")).await;
        table.observe(sample("c")).await;
        assert_eq!(table.snapshot().await.len(), 2);
    }

    #[tokio::test]
    async fn refreshing_an_existing_device_does_not_evict_it() {
        let table = DeviceTable::new(1);
        table.observe(sample("a")).await;
        table.observe(sample("a")).await;
        assert_eq!(table.snapshot().await.len(), 1);
    }

    #[tokio::test]
    async fn sweep_demotes_then_removes_stale_devices() {
        let table = DeviceTable::new(10);
        let device_timeout = Duration::from_secs(10);

        // Timed out (>= 10s) but not yet expired (< 20s): demote only.
        let mut stale = sample("a");
        stale.last_seen = Instant::now() - Duration::from_secs(15);
        table.devices.lock().await.insert("a".to_string(), stale);

        table.sweep(device_timeout).await;
        assert_eq!(table.snapshot().await[0].state, DeviceState::Offline);

        // Push it past the expiry threshold (>= 20s) and sweep again.
        table.devices.lock().await.get_mut("a").unwrap().last_seen = Instant::now() - Duration::from_secs(25);
        table.sweep(device_timeout).await;
        assert!(table.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn observe_emits_full_snapshot_to_subscribers() {
        let table = DeviceTable::new(10);
        let mut rx = table.subscribe();
        table.observe(sample("a")).await;
        let snapshot = rx.recv().await.unwrap();
        assert_eq!(snapshot.len(), 1);
    }
}
