//! Device identity, capability classes, and live telemetry.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::curve::{CurveSetting, PowerCurve};
use crate::error::FleetResult;

/// Stable device identity: the network address it was discovered at.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Firmware family, detected once at discovery time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FirmwareFamily {
    /// Vendor firmware: power on/off only.
    Stock,
    /// Vnish: CGI config with frequency and voltage control.
    Vnish,
    /// Braiins OS: frequency tuning through its own API.
    Braiins,
}

impl FirmwareFamily {
    pub fn capabilities(self) -> Capabilities {
        match self {
            Self::Stock => Capabilities {
                frequency_control: false,
                voltage_control: false,
            },
            Self::Vnish => Capabilities {
                frequency_control: true,
                voltage_control: true,
            },
            Self::Braiins => Capabilities {
                frequency_control: true,
                voltage_control: false,
            },
        }
    }
}

/// What the control dialect of a device can express.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub frequency_control: bool,
    pub voltage_control: bool,
}

/// Hardware class shared by many devices: frequency window plus curve.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceClass {
    pub name: String,
    pub min_frequency_mhz: u32,
    pub max_frequency_mhz: u32,
    curve: Arc<PowerCurve>,
}

impl DeviceClass {
    /// Builds a class whose curve is restricted to its frequency window.
    ///
    /// # Errors
    ///
    /// Returns `CurveUnavailable` if no curve point lies inside the window.
    pub fn new(
        name: impl Into<String>,
        min_frequency_mhz: u32,
        max_frequency_mhz: u32,
        curve: &PowerCurve,
    ) -> FleetResult<Self> {
        let curve = Arc::new(curve.restricted(min_frequency_mhz, max_frequency_mhz)?);
        Ok(Self {
            name: name.into(),
            min_frequency_mhz,
            max_frequency_mhz,
            curve,
        })
    }

    /// Default S9 class: 250–650 MHz, topping out at 1460 W.
    pub fn s9() -> Self {
        let curve = PowerCurve::s9();
        Self::new("s9", 250, 650, &curve).unwrap_or_else(|_| Self {
            name: "s9".into(),
            min_frequency_mhz: 250,
            max_frequency_mhz: 650,
            curve: Arc::new(curve),
        })
    }

    pub fn curve(&self) -> &Arc<PowerCurve> {
        &self.curve
    }

    /// Setting at maximum supported frequency.
    pub fn full_setting(&self) -> CurveSetting {
        CurveSetting::from(self.curve.ceiling())
    }
}

/// Last observed state of a device, refreshed by the reconciliation loop.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Telemetry {
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

/// A registered device.
#[derive(Debug, Clone)]
pub struct Device {
    pub id: DeviceId,
    pub class: Arc<DeviceClass>,
    pub firmware: FirmwareFamily,
    /// Nameplate draw at full output (W).
    pub rated_power_w: f32,
    /// Registration order; ties in priority are broken by this.
    pub registered_seq: u64,
    pub telemetry: Telemetry,
}

impl Device {
    pub fn capabilities(&self) -> Capabilities {
        self.firmware.capabilities()
    }

    pub fn is_online(&self) -> bool {
        self.telemetry.online
    }

    /// Power drawn at full output: the class curve's ceiling when tunable,
    /// nameplate rating otherwise.
    pub fn full_power_w(&self) -> f32 {
        if self.capabilities().frequency_control {
            self.class.full_setting().power_w
        } else {
            self.rated_power_w
        }
    }
}

/// Device add/remove notifications produced by the discovery collaborator.
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    Added {
        id: DeviceId,
        class: Arc<DeviceClass>,
        firmware: FirmwareFamily,
        rated_power_w: f32,
    },
    Removed(DeviceId),
}
