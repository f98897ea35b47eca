//! Fleet operational phase and dispatch readiness.
//!
//! [`Phase::next`] is a total transition function over (phase, event). The
//! [`FleetStateMachine`] feeds it from command outcomes and from aggregate
//! metrics after every reconciliation cycle.

use std::fmt;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::StateMachineConfig;

use super::metrics::FleetMetrics;

/// Operational phase of the fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Initializing,
    Standby,
    Activating,
    Active,
    Deactivating,
    Fault,
}

/// Inputs that may move the fleet between phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PhaseEvent {
    /// First reconciliation cycle with a usable answer completed.
    RegistryReady,
    ActivateAccepted,
    DeactivateAccepted,
    /// Measured power stayed in tolerance for enough cycles.
    TargetReached,
    ActivationTimedOut,
    /// No device reports mining.
    AllIdle,
    UnreachableAboveThreshold,
    UnreachableBelowThreshold,
    /// A deactivation accepted after a fault not caused by unreachable devices.
    FaultAcknowledged,
}

/// Running status reported to the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunningStatus {
    StandBy = 1,
    Running = 2,
}

impl RunningStatus {
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl Phase {
    pub const ALL: [Phase; 6] = [
        Phase::Initializing,
        Phase::Standby,
        Phase::Activating,
        Phase::Active,
        Phase::Deactivating,
        Phase::Fault,
    ];

    /// Next phase for `event`. Pairs without a rule keep the current phase.
    pub fn next(self, event: PhaseEvent) -> Phase {
        use Phase::*;
        use PhaseEvent::*;

        match (self, event) {
            (_, UnreachableAboveThreshold) => Fault,
            (Fault, UnreachableBelowThreshold) => Standby,
            (phase, UnreachableBelowThreshold) => phase,

            (Initializing, RegistryReady) => Standby,
            (phase, RegistryReady) => phase,

            (Standby | Activating | Active | Deactivating, ActivateAccepted) => Activating,
            (phase @ (Initializing | Fault), ActivateAccepted) => phase,

            (Activating | Active, DeactivateAccepted) => Deactivating,
            (phase @ (Initializing | Standby | Deactivating | Fault), DeactivateAccepted) => phase,

            (Activating, TargetReached) => Active,
            (phase, TargetReached) => phase,

            (Activating, ActivationTimedOut) => Fault,
            (phase, ActivationTimedOut) => phase,

            (Deactivating, AllIdle) => Standby,
            (phase, AllIdle) => phase,

            (Fault, FaultAcknowledged) => Standby,
            (phase, FaultAcknowledged) => phase,
        }
    }

    /// `Running` only while `Active`.
    pub fn running_status(self) -> RunningStatus {
        if self == Phase::Active {
            RunningStatus::Running
        } else {
            RunningStatus::StandBy
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Standby => "standby",
            Self::Activating => "activating",
            Self::Active => "active",
            Self::Deactivating => "deactivating",
            Self::Fault => "fault",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A phase change, returned so callers can react to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: Phase,
    pub to: Phase,
    pub event: PhaseEvent,
}

/// Owner of the fleet phase.
#[derive(Debug, Clone)]
pub struct FleetStateMachine {
    phase: Phase,
    config: StateMachineConfig,
    /// Power the current plan is expected to draw (kW).
    expected_kw: f32,
    in_band_cycles: u32,
    activating_since: Option<Instant>,
    /// Event that put the fleet into `Fault`.
    fault_cause: Option<PhaseEvent>,
}

impl FleetStateMachine {
    pub fn new(config: StateMachineConfig) -> Self {
        Self {
            phase: Phase::Initializing,
            config,
            expected_kw: 0.0,
            in_band_cycles: 0,
            activating_since: None,
            fault_cause: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Power the fleet is converging to (kW).
    pub fn expected_kw(&self) -> f32 {
        self.expected_kw
    }

    /// Applies `event`, logging and returning the transition if the phase changed.
    pub fn apply(&mut self, event: PhaseEvent) -> Option<Transition> {
        let from = self.phase;
        let to = from.next(event);
        if from == to {
            return None;
        }
        self.phase = to;
        if to != Phase::Activating {
            self.activating_since = None;
        }
        self.fault_cause = (to == Phase::Fault).then_some(event);
        if to == Phase::Fault {
            warn!(%from, %to, ?event, "fleet phase transition");
        } else {
            info!(%from, %to, ?event, "fleet phase transition");
        }
        Some(Transition { from, to, event })
    }

    /// Records an accepted activation whose plan is expected to draw `expected_kw`.
    ///
    /// A plan that draws nothing is treated as a deactivation.
    pub fn on_activate(&mut self, expected_kw: f32, now: Instant) -> Option<Transition> {
        if expected_kw <= 0.0 {
            return self.on_deactivate();
        }
        self.expected_kw = expected_kw;
        self.in_band_cycles = 0;
        let transition = self.apply(PhaseEvent::ActivateAccepted);
        if self.phase == Phase::Activating {
            self.activating_since = Some(now);
        }
        transition
    }

    /// Records an accepted deactivation.
    ///
    /// Clears a fault left by an activation timeout; a fault from unreachable
    /// devices only clears once they answer again.
    pub fn on_deactivate(&mut self) -> Option<Transition> {
        self.expected_kw = 0.0;
        self.in_band_cycles = 0;
        if self.fault_cause == Some(PhaseEvent::ActivationTimedOut) {
            return self.apply(PhaseEvent::FaultAcknowledged);
        }
        self.apply(PhaseEvent::DeactivateAccepted)
    }

    /// Tolerance band around the expected power (kW).
    fn tolerance_kw(&self) -> f32 {
        (self.config.tolerance_pct * self.expected_kw).max(self.config.tolerance_min_kw)
    }

    /// Evaluates the metrics of one reconciliation cycle.
    ///
    /// Returns every transition taken, in order.
    pub fn evaluate(&mut self, metrics: &FleetMetrics, now: Instant) -> Vec<Transition> {
        let mut transitions = Vec::new();

        let unreachable = metrics.unreachable_fraction();
        if unreachable > self.config.unreachable_fault_fraction {
            transitions.extend(self.apply(PhaseEvent::UnreachableAboveThreshold));
            self.fault_cause = Some(PhaseEvent::UnreachableAboveThreshold);
            return transitions;
        }
        if self.phase != Phase::Fault
            || self.fault_cause == Some(PhaseEvent::UnreachableAboveThreshold)
        {
            transitions.extend(self.apply(PhaseEvent::UnreachableBelowThreshold));
        }

        match self.phase {
            Phase::Initializing => {
                if metrics.online_devices > 0 || metrics.total_devices == 0 {
                    transitions.extend(self.apply(PhaseEvent::RegistryReady));
                }
            }
            Phase::Activating => {
                let error = (metrics.active_power_kw - self.expected_kw).abs();
                if error <= self.tolerance_kw() {
                    self.in_band_cycles += 1;
                } else {
                    self.in_band_cycles = 0;
                }

                if self.in_band_cycles >= self.config.settle_cycles {
                    transitions.extend(self.apply(PhaseEvent::TargetReached));
                } else if self
                    .activating_since
                    .is_some_and(|since| now.duration_since(since) >= self.config.activation_timeout())
                {
                    transitions.extend(self.apply(PhaseEvent::ActivationTimedOut));
                }
            }
            Phase::Deactivating => {
                if metrics.mining_devices == 0 {
                    transitions.extend(self.apply(PhaseEvent::AllIdle));
                }
            }
            Phase::Standby | Phase::Active | Phase::Fault => {}
        }
        transitions
    }
}
