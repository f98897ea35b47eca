//! Fleet control core: allocation, phase tracking, arbitration, and polling.

/// Aggregate power target → per-device plan.
pub mod allocation;
/// Serialized command handling.
pub mod arbiter;
pub mod command;
pub mod metrics;
/// Periodic device polling.
pub mod reconcile;
pub mod state_machine;

pub use allocation::{AllocationMode, AllocationPlan, BelowFloor, DeviceAction, DeviceAllocation};
pub use arbiter::{CommandArbiter, DispatchStatus, FleetState, ManualOverride};
pub use command::{Command, CommandKind, CommandOutcome, CommandSource};
pub use metrics::{FleetMetrics, FleetStatus};
pub use reconcile::{CycleReport, ReconciliationLoop};
pub use state_machine::{FleetStateMachine, Phase, PhaseEvent, RunningStatus};
