//! Aggregate fleet metrics and the dashboard status view.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::devices::{Device, DeviceId, FirmwareFamily};

use super::command::CommandSource;
use super::state_machine::Phase;

/// Aggregates derived from one registry snapshot.
///
/// Computed after every reconciliation cycle and handed to the state machine
/// and the persistence sink.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FleetMetrics {
    pub timestamp: DateTime<Utc>,
    pub total_devices: usize,
    pub online_devices: usize,
    pub mining_devices: usize,
    /// Devices at or past the offline failure threshold.
    pub unreachable_devices: usize,
    /// Full-output draw of the online devices (kW).
    pub online_capacity_kw: f32,
    /// Measured draw of the online devices (kW).
    pub active_power_kw: f32,
    pub throughput_ths: f32,
}

impl FleetMetrics {
    /// Computes aggregates over `devices`.
    ///
    /// # Arguments
    ///
    /// * `devices` - Registry snapshot
    /// * `offline_after` - Failure count at which a device counts as unreachable
    /// * `timestamp` - Time the snapshot was taken
    pub fn from_devices(devices: &[Device], offline_after: u32, timestamp: DateTime<Utc>) -> Self {
        let mut metrics = Self {
            timestamp,
            total_devices: devices.len(),
            online_devices: 0,
            mining_devices: 0,
            unreachable_devices: 0,
            online_capacity_kw: 0.0,
            active_power_kw: 0.0,
            throughput_ths: 0.0,
        };

        for d in devices {
            let t = &d.telemetry;
            if t.consecutive_failures >= offline_after {
                metrics.unreachable_devices += 1;
            }
            if !d.is_online() {
                continue;
            }
            metrics.online_devices += 1;
            metrics.online_capacity_kw += d.full_power_w() / 1000.0;
            metrics.active_power_kw += t.power_w / 1000.0;
            if t.mining {
                metrics.mining_devices += 1;
                metrics.throughput_ths += t.throughput_ths;
            }
        }
        metrics
    }

    /// Share of registered devices that are unreachable; 0 for an empty fleet.
    pub fn unreachable_fraction(&self) -> f32 {
        if self.total_devices == 0 {
            0.0
        } else {
            self.unreachable_devices as f32 / self.total_devices as f32
        }
    }
}

impl fmt::Display for FleetMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} online, {} mining, {} unreachable, {:.2}/{:.2} kW, {:.1} TH/s",
            self.online_devices,
            self.total_devices,
            self.mining_devices,
            self.unreachable_devices,
            self.active_power_kw,
            self.online_capacity_kw,
            self.throughput_ths
        )
    }
}

/// Per-device line of the status view.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSummary {
    pub address: DeviceId,
    pub class: String,
    pub firmware: FirmwareFamily,
    pub online: bool,
    pub mining: bool,
    pub frequency_mhz: Option<u32>,
    pub voltage: Option<f32>,
    pub power_w: f32,
    pub throughput_ths: f32,
    pub temperature_c: Option<f32>,
    pub consecutive_failures: u32,
    pub last_seen: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl From<&Device> for DeviceSummary {
    fn from(d: &Device) -> Self {
        let t = &d.telemetry;
        Self {
            address: d.id.clone(),
            class: d.class.name.clone(),
            firmware: d.firmware,
            online: t.online,
            mining: t.mining,
            frequency_mhz: t.frequency_mhz,
            voltage: t.voltage,
            power_w: t.power_w,
            throughput_ths: t.throughput_ths,
            temperature_c: t.temperature_c,
            consecutive_failures: t.consecutive_failures,
            last_seen: t.last_seen,
            last_error: t.last_error.clone(),
        }
    }
}

/// Full fleet view for operators.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetStatus {
    pub phase: Phase,
    pub is_available_for_dispatch: bool,
    pub running_status: u8,
    pub rated_power_kw: f32,
    pub active_power_kw: f32,
    pub target_power_kw: f32,
    pub override_active: bool,
    pub override_target_kw: Option<f32>,
    pub last_command_source: Option<CommandSource>,
    pub last_command_at: Option<DateTime<Utc>>,
    pub total_devices: usize,
    pub online_devices: usize,
    pub mining_devices: usize,
    pub unreachable_devices: usize,
    pub throughput_ths: f32,
    pub config_version: u64,
    pub devices: Vec<DeviceSummary>,
}

/// Rounds to two decimals, as reported on the dispatch boundary.
pub fn round2(value: f32) -> f32 {
    (value * 100.0).round() / 100.0
}
