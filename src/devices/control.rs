//! The Device Control Interface consumed by the control core.
//!
//! Implementations live outside the core, one per transport family
//! (CGMiner TCP status API, firmware CGI, ...). The core only sees this trait.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::DeviceError;

use super::types::DeviceId;

/// Status reported by one device query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceStatus {
    pub online: bool,
    pub mining: bool,
    pub throughput_ths: f32,
    pub temperature_c: Option<f32>,
    pub power_w: f32,
    pub frequency_mhz: Option<u32>,
    pub voltage: Option<f32>,
}

/// Mining on/off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    On,
    Off,
}

/// Operator-level control actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    Start,
    Stop,
    Restart,
    Reboot,
    Reset,
}

impl ControlAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::Reboot => "reboot",
            Self::Reset => "reset",
        }
    }
}

/// Acknowledgement of a control call.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Ack {
    /// How long the device expects to take before the change is observable.
    pub expected_completion: Option<Duration>,
}

/// Transport-independent device control.
#[async_trait]
pub trait DeviceControl: Send + Sync {
    async fn query_status(&self, id: &DeviceId) -> Result<DeviceStatus, DeviceError>;

    async fn set_frequency(
        &self,
        id: &DeviceId,
        frequency_mhz: u32,
        voltage: Option<f32>,
    ) -> Result<Ack, DeviceError>;

    async fn set_power_state(&self, id: &DeviceId, state: PowerState) -> Result<Ack, DeviceError>;

    async fn issue_control_action(
        &self,
        id: &DeviceId,
        action: ControlAction,
    ) -> Result<Ack, DeviceError>;
}

/// Runs a device call under `timeout`, mapping elapsed deadlines to
/// [`DeviceError::Timeout`].
pub async fn with_timeout<T, F>(timeout: Duration, call: F) -> Result<T, DeviceError>
where
    F: std::future::Future<Output = Result<T, DeviceError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(DeviceError::Timeout(timeout.as_millis() as u64)),
    }
}
