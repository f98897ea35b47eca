//! Command records and the bounded command history.

use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::devices::DeviceId;
use crate::error::FleetError;

use super::allocation::AllocationPlan;

/// Who issued a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandSource {
    /// The external energy-management system.
    Dispatcher,
    /// An operator holding the manual override or controlling one device.
    Manual,
    /// The dashboard "apply" button.
    LocalApply,
}

impl fmt::Display for CommandSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Dispatcher => "dispatcher",
            Self::Manual => "manual",
            Self::LocalApply => "local_apply",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Activate,
    Deactivate,
    SetPower,
    ToggleOverride,
    /// Start/stop/restart/reboot/reset of one device.
    DeviceControl,
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Activate => "activate",
            Self::Deactivate => "deactivate",
            Self::SetPower => "set_power",
            Self::ToggleOverride => "toggle_override",
            Self::DeviceControl => "device_control",
        })
    }
}

/// An immutable entry of the command history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Command {
    pub seq: u64,
    pub source: CommandSource,
    pub kind: CommandKind,
    pub requested_power_kw: Option<f32>,
    /// Target device of a [`CommandKind::DeviceControl`] command.
    pub device: Option<DeviceId>,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub message: String,
}

/// Typed result handed back to every command submitter.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutcome {
    /// The command passed validation and arbitration.
    pub accepted: bool,
    /// The command was fully realised.
    pub success: bool,
    pub message: String,
    pub error: Option<FleetError>,
    pub plan: Option<AllocationPlan>,
}

impl CommandOutcome {
    pub fn applied(message: impl Into<String>, plan: Option<AllocationPlan>) -> Self {
        Self {
            accepted: true,
            success: true,
            message: message.into(),
            error: None,
            plan,
        }
    }

    /// Accepted, but not every device action went through.
    pub fn degraded(error: FleetError, plan: Option<AllocationPlan>) -> Self {
        Self {
            accepted: true,
            success: false,
            message: error.to_string(),
            error: Some(error),
            plan,
        }
    }

    pub fn rejected(error: FleetError) -> Self {
        Self {
            accepted: false,
            success: false,
            message: error.to_string(),
            error: Some(error),
            plan: None,
        }
    }
}

/// Details of a command about to be recorded.
#[derive(Debug, Clone)]
pub(crate) struct CommandDraft {
    pub source: CommandSource,
    pub kind: CommandKind,
    pub requested_power_kw: Option<f32>,
    pub device: Option<DeviceId>,
}

#[derive(Debug)]
struct HistoryInner {
    entries: VecDeque<Command>,
    capacity: usize,
    next_seq: u64,
    last_timestamp: Option<DateTime<Utc>>,
}

/// Fixed-capacity ring of the most recent commands.
///
/// Timestamps are strictly increasing in `seq` order even when the wall
/// clock stalls or steps backwards.
#[derive(Debug)]
pub struct CommandHistory {
    inner: Mutex<HistoryInner>,
}

impl CommandHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(HistoryInner {
                entries: VecDeque::with_capacity(capacity.min(1024)),
                capacity: capacity.max(1),
                next_seq: 1,
                last_timestamp: None,
            }),
        }
    }

    pub(crate) fn record(&self, draft: CommandDraft, outcome: &CommandOutcome) -> Command {
        let mut inner = self.inner.lock();
        let now = Utc::now();
        let timestamp = match inner.last_timestamp {
            Some(last) if now <= last => last + ChronoDuration::microseconds(1),
            _ => now,
        };
        let command = Command {
            seq: inner.next_seq,
            source: draft.source,
            kind: draft.kind,
            requested_power_kw: draft.requested_power_kw,
            device: draft.device,
            timestamp,
            success: outcome.success,
            message: outcome.message.clone(),
        };
        inner.next_seq += 1;
        inner.last_timestamp = Some(timestamp);
        if inner.entries.len() == inner.capacity {
            inner.entries.pop_front();
        }
        inner.entries.push_back(command.clone());
        command
    }

    /// Up to `limit` most recent commands, newest first.
    pub fn recent(&self, limit: usize) -> Vec<Command> {
        self.inner.lock().entries.iter().rev().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
