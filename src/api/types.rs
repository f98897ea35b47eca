//! Request and response bodies.
//!
//! The dispatch-facing types (`ActivateRequest`, `DispatchResponse`) use the
//! camelCase field names the energy-management system expects.

use serde::{Deserialize, Serialize};

use crate::devices::ControlAction;
use crate::fleet::{AllocationMode, AllocationPlan, CommandOutcome};

/// `POST /api/activate` body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivateRequest {
    pub activation_power_in_kw: f32,
}

/// Answer to activate and deactivate.
#[derive(Debug, Serialize)]
pub struct DispatchResponse {
    pub accepted: bool,
    pub message: String,
}

impl From<&CommandOutcome> for DispatchResponse {
    fn from(outcome: &CommandOutcome) -> Self {
        Self {
            accepted: outcome.accepted,
            message: outcome.message.clone(),
        }
    }
}

/// `POST /api/override` body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverrideRequest {
    pub enabled: bool,
    #[serde(default)]
    pub target_power_kw: Option<f32>,
}

/// `POST /api/apply` body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyRequest {
    pub target_power_kw: f32,
    #[serde(default)]
    pub mode: Option<AllocationMode>,
}

/// `GET /api/preview` query.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewQuery {
    pub target_kw: f32,
    pub mode: Option<AllocationMode>,
}

/// `GET /api/history` query.
#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

/// `POST /api/devices/{address}/control` body.
#[derive(Debug, Deserialize)]
pub struct ControlRequest {
    pub action: ControlAction,
}

/// Answer to operator commands: the dispatch pair plus the applied plan.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorResponse {
    pub accepted: bool,
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<AllocationPlan>,
}

impl From<CommandOutcome> for OperatorResponse {
    fn from(outcome: CommandOutcome) -> Self {
        Self {
            accepted: outcome.accepted,
            success: outcome.success,
            message: outcome.message,
            plan: outcome.plan,
        }
    }
}

/// Error body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: Vec::new(),
        }
    }
}
