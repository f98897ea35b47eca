//! In-memory source of truth for known devices and their telemetry.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::DeviceError;

use super::control::DeviceStatus;
use super::types::{Device, DeviceId, DiscoveryEvent, Telemetry};

/// A control call that failed outside the poll path, waiting to be folded
/// into the registry on the next reconciliation cycle.
#[derive(Debug, Clone)]
pub struct ControlFailure {
    pub id: DeviceId,
    pub error: DeviceError,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Inner {
    devices: Vec<Device>,
    next_seq: u64,
}

/// Registry of devices in registration order.
///
/// All writes go through one lock and are issued by the reconciliation loop.
/// Readers receive owned snapshots and never hold the lock across awaits.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    inner: RwLock<Inner>,
    control_failures: Mutex<Vec<ControlFailure>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consistent copy of every device, in registration order.
    pub fn snapshot(&self) -> Vec<Device> {
        self.inner.read().devices.clone()
    }

    /// Online devices, in registration order.
    pub fn online(&self) -> Vec<Device> {
        self.inner
            .read()
            .devices
            .iter()
            .filter(|d| d.is_online())
            .cloned()
            .collect()
    }

    pub fn get(&self, id: &DeviceId) -> Option<Device> {
        self.inner.read().devices.iter().find(|d| &d.id == id).cloned()
    }

    pub fn ids(&self) -> Vec<DeviceId> {
        self.inner.read().devices.iter().map(|d| d.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Applies a discovery notification. Returns `true` if the registry changed.
    ///
    /// Re-discovering a known address refreshes its class and rating but keeps
    /// its telemetry and registration order.
    pub fn apply_discovery(&self, event: DiscoveryEvent) -> bool {
        let mut inner = self.inner.write();
        match event {
            DiscoveryEvent::Added {
                id,
                class,
                firmware,
                rated_power_w,
            } => {
                if let Some(existing) = inner.devices.iter_mut().find(|d| d.id == id) {
                    existing.class = class;
                    existing.firmware = firmware;
                    existing.rated_power_w = rated_power_w;
                    debug!(device = %id, "device re-discovered");
                    return true;
                }
                let seq = inner.next_seq;
                inner.next_seq += 1;
                info!(device = %id, class = %class.name, ?firmware, rated_power_w, "device registered");
                inner.devices.push(Device {
                    id,
                    class,
                    firmware,
                    rated_power_w,
                    registered_seq: seq,
                    telemetry: Telemetry::default(),
                });
                true
            }
            DiscoveryEvent::Removed(id) => {
                let before = inner.devices.len();
                inner.devices.retain(|d| d.id != id);
                let removed = inner.devices.len() != before;
                if removed {
                    info!(device = %id, "device removed");
                }
                removed
            }
        }
    }

    /// Stores a successful poll and resets the failure counter.
    pub fn record_success(&self, id: &DeviceId, status: &DeviceStatus, now: DateTime<Utc>) {
        let mut inner = self.inner.write();
        let Some(device) = inner.devices.iter_mut().find(|d| &d.id == id) else {
            return;
        };
        let t = &mut device.telemetry;
        if !t.online && status.online {
            info!(device = %id, "device online");
        }
        t.online = status.online;
        t.mining = status.mining;
        t.frequency_mhz = status.frequency_mhz;
        t.voltage = status.voltage;
        t.power_w = status.power_w;
        t.throughput_ths = status.throughput_ths;
        t.temperature_c = status.temperature_c;
        t.consecutive_failures = 0;
        t.last_seen = Some(now);
        t.last_error = None;
    }

    /// Counts a failed poll. Once `offline_after` consecutive failures are
    /// reached the device is marked offline and stops counting toward capacity.
    ///
    /// Returns `true` when this call took the device offline.
    pub fn record_failure(&self, id: &DeviceId, error: &DeviceError, offline_after: u32) -> bool {
        let mut inner = self.inner.write();
        let Some(device) = inner.devices.iter_mut().find(|d| &d.id == id) else {
            return false;
        };
        let t = &mut device.telemetry;
        t.consecutive_failures = t.consecutive_failures.saturating_add(1);
        t.last_error = Some(error.to_string());

        if t.consecutive_failures >= offline_after && t.online {
            t.online = false;
            t.mining = false;
            t.power_w = 0.0;
            t.throughput_ths = 0.0;
            warn!(
                device = %id,
                failures = t.consecutive_failures,
                %error,
                "device marked offline"
            );
            return true;
        }
        false
    }

    /// Queues a failed control call for the next reconciliation cycle.
    pub fn report_control_failure(&self, id: DeviceId, error: DeviceError) {
        self.control_failures.lock().push(ControlFailure {
            id,
            error,
            at: Utc::now(),
        });
    }

    /// Folds queued control failures into device telemetry (`last_error`).
    pub fn fold_control_failures(&self) -> usize {
        let pending = std::mem::take(&mut *self.control_failures.lock());
        if pending.is_empty() {
            return 0;
        }
        let mut inner = self.inner.write();
        for failure in &pending {
            if let Some(device) = inner.devices.iter_mut().find(|d| d.id == failure.id) {
                device.telemetry.last_error = Some(format!(
                    "control failed at {}: {}",
                    failure.at.format("%H:%M:%S"),
                    failure.error
                ));
            }
        }
        pending.len()
    }
}
