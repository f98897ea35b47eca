//! Power allocation: turns an aggregate power target into a per-device plan.
//!
//! The engine is a pure function of (online devices, target, mode, runtime
//! configuration). It never touches device state and never logs; callers
//! decide what to do with the plan.

use serde::{Deserialize, Serialize};

use crate::config::RuntimeConfig;
use crate::devices::{Device, DeviceId};
use crate::error::{FleetError, FleetResult};

/// Slack for float round-trips between kW and W.
const EPSILON_W: f32 = 0.5;

/// How devices may be driven.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationMode {
    /// Each device is either at full output or idle.
    OnOff,
    /// Full devices plus at most one frequency-tuned swing device.
    #[default]
    Frequency,
}

impl AllocationMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OnOff => "on_off",
            Self::Frequency => "frequency",
        }
    }
}

/// What to do with a swing remainder below the curve's lowest point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BelowFloor {
    /// Run the swing device at its lowest curve point.
    #[default]
    Floor,
    /// Leave the remainder unallocated.
    Idle,
}

/// Role of a device in a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceAction {
    Full,
    Swing,
    Idle,
}

/// Planned setting for one device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceAllocation {
    pub id: DeviceId,
    pub action: DeviceAction,
    /// `None` for idle devices and for devices without frequency control.
    pub frequency_mhz: Option<u32>,
    pub voltage: Option<f32>,
    pub estimated_power_w: f32,
}

/// Counts and totals of a plan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanSummary {
    pub mode: AllocationMode,
    pub full_count: usize,
    pub swing_count: usize,
    pub idle_count: usize,
    /// Target after clamping to capacity (W).
    pub target_w: f32,
    pub estimated_total_w: f32,
}

/// Immutable result of one allocation call, in priority order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AllocationPlan {
    pub devices: Vec<DeviceAllocation>,
    pub summary: PlanSummary,
}

impl AllocationPlan {
    pub fn get(&self, id: &DeviceId) -> Option<&DeviceAllocation> {
        self.devices.iter().find(|a| &a.id == id)
    }

    pub fn swing(&self) -> Option<&DeviceAllocation> {
        self.devices.iter().find(|a| a.action == DeviceAction::Swing)
    }

    pub fn estimated_total_kw(&self) -> f32 {
        self.summary.estimated_total_w / 1000.0
    }

    /// `true` when no device is asked to draw power.
    pub fn is_all_idle(&self) -> bool {
        self.devices.iter().all(|a| a.action == DeviceAction::Idle)
    }
}

/// Physical capacity of the online devices (W).
pub fn online_capacity_w(devices: &[Device]) -> f32 {
    devices
        .iter()
        .filter(|d| d.is_online())
        .map(Device::full_power_w)
        .sum()
}

/// Capacity reported to the dispatcher (kW): the configured override when
/// set, else the online capacity.
pub fn rated_capacity_kw(devices: &[Device], config: &RuntimeConfig) -> f32 {
    let physical_kw = online_capacity_w(devices) / 1000.0;
    match config.rated_power_override_kw {
        Some(rated) => rated.min(physical_kw).max(0.0),
        None => physical_kw,
    }
}

/// Online devices sorted by configured priority, then registration order.
pub fn priority_order<'a>(devices: &'a [Device], priority: &[DeviceId]) -> Vec<&'a Device> {
    let mut ordered: Vec<&Device> = devices.iter().filter(|d| d.is_online()).collect();
    ordered.sort_by_key(|d| {
        let rank = priority
            .iter()
            .position(|p| p == &d.id)
            .unwrap_or(usize::MAX);
        (rank, d.registered_seq)
    });
    ordered
}

/// Computes a per-device plan for `target_kw`.
///
/// Offline devices in `devices` are ignored. The target is clamped to
/// `[0, capacity]` before allocation.
///
/// # Errors
///
/// * [`FleetError::NoDevicesAvailable`] if no device is online
/// * [`FleetError::CapacityExceeded`] if `target_kw` is above the rated capacity
pub fn allocate(
    devices: &[Device],
    target_kw: f32,
    mode: AllocationMode,
    config: &RuntimeConfig,
) -> FleetResult<AllocationPlan> {
    let ordered = priority_order(devices, &config.priority);
    if ordered.is_empty() {
        return Err(FleetError::NoDevicesAvailable);
    }

    let capacity_kw = rated_capacity_kw(devices, config);
    if target_kw * 1000.0 > capacity_kw * 1000.0 + EPSILON_W {
        return Err(FleetError::CapacityExceeded {
            requested_kw: target_kw,
            capacity_kw,
        });
    }
    let target_w = (target_kw * 1000.0).max(0.0).min(capacity_kw * 1000.0);

    let mut actions: Vec<Option<DeviceAllocation>> = vec![None; ordered.len()];
    let mut remaining = target_w;

    // Full pass in priority order, stopping at the first device that does not fit.
    let mut assigned = 0;
    for (slot, device) in actions.iter_mut().zip(&ordered) {
        let full_w = device.full_power_w();
        if full_w > remaining + EPSILON_W {
            break;
        }
        remaining = (remaining - full_w).max(0.0);
        *slot = Some(full(device));
        assigned += 1;
    }

    if mode == AllocationMode::Frequency && remaining > EPSILON_W {
        let candidate = actions
            .iter_mut()
            .zip(&ordered)
            .skip(assigned)
            .find(|(_, d)| d.capabilities().frequency_control);
        if let Some((slot, device)) = candidate {
            *slot = swing(device, remaining, config.below_floor);
        }
    }

    let devices: Vec<DeviceAllocation> = actions
        .into_iter()
        .zip(&ordered)
        .map(|(slot, device)| slot.unwrap_or_else(|| idle(device)))
        .collect();

    let count = |action: DeviceAction| devices.iter().filter(|a| a.action == action).count();
    let summary = PlanSummary {
        mode,
        full_count: count(DeviceAction::Full),
        swing_count: count(DeviceAction::Swing),
        idle_count: count(DeviceAction::Idle),
        target_w,
        estimated_total_w: devices.iter().map(|a| a.estimated_power_w).sum(),
    };

    Ok(AllocationPlan { devices, summary })
}

fn full(device: &Device) -> DeviceAllocation {
    if device.capabilities().frequency_control {
        let setting = device.class.full_setting();
        DeviceAllocation {
            id: device.id.clone(),
            action: DeviceAction::Full,
            frequency_mhz: Some(setting.frequency_mhz),
            voltage: Some(setting.voltage),
            estimated_power_w: setting.power_w,
        }
    } else {
        DeviceAllocation {
            id: device.id.clone(),
            action: DeviceAction::Full,
            frequency_mhz: None,
            voltage: None,
            estimated_power_w: device.rated_power_w,
        }
    }
}

fn swing(device: &Device, remaining_w: f32, below_floor: BelowFloor) -> Option<DeviceAllocation> {
    let curve = device.class.curve();
    if remaining_w < curve.floor().power_w && below_floor == BelowFloor::Idle {
        return None;
    }
    let setting = curve.setting_for_power(remaining_w);
    Some(DeviceAllocation {
        id: device.id.clone(),
        action: DeviceAction::Swing,
        frequency_mhz: Some(setting.frequency_mhz),
        voltage: Some(setting.voltage),
        estimated_power_w: setting.power_w,
    })
}

fn idle(device: &Device) -> DeviceAllocation {
    DeviceAllocation {
        id: device.id.clone(),
        action: DeviceAction::Idle,
        frequency_mhz: None,
        voltage: None,
        estimated_power_w: 0.0,
    }
}
