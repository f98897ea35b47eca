//! Single serialization point for every command that mutates fleet state.
//!
//! Commands run one at a time inside an async critical section. Two pieces of
//! state live outside it so they never wait behind a running command: the
//! manual-override flag (checked first by dispatcher commands) and a
//! pre-emption epoch that an override toggle bumps to abort an in-flight
//! dispatcher apply.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{ArbiterConfig, ConfigHandle, FleetConfig, RuntimeConfig};
use crate::devices::control::with_timeout;
use crate::devices::{ControlAction, Device, DeviceControl, DeviceId, DeviceRegistry, PowerState};
use crate::error::{DeviceError, FleetError};
use crate::io::history::HistoryHandle;

use super::allocation::{self, AllocationMode, AllocationPlan, DeviceAction};
use super::command::{
    Command, CommandDraft, CommandHistory, CommandKind, CommandOutcome, CommandSource,
};
use super::metrics::{DeviceSummary, FleetMetrics, FleetStatus, round2};
use super::state_machine::{FleetStateMachine, Phase, Transition};

/// Operator-held override of the dispatch target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualOverride {
    pub active: bool,
    pub target_kw: Option<f32>,
}

/// Consistent view of the fleet-wide control state.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetState {
    pub phase: Phase,
    pub target_power_kw: f32,
    /// Source of the current target.
    pub target_source: Option<CommandSource>,
    pub manual_override: ManualOverride,
    pub last_command_source: Option<CommandSource>,
    pub last_command_timestamp: Option<DateTime<Utc>>,
    pub is_available_for_dispatch: bool,
}

/// Dispatch-facing status, values rounded to two decimals.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchStatus {
    pub is_available_for_dispatch: bool,
    pub running_status: u8,
    pub rated_power_in_kw: f32,
    pub active_power_in_kw: f32,
}

#[derive(Debug)]
struct Core {
    machine: FleetStateMachine,
    target_kw: f32,
    target_source: Option<CommandSource>,
    manual_override: ManualOverride,
    last_source: Option<CommandSource>,
    last_at: Option<DateTime<Utc>>,
    last_plan: Option<AllocationPlan>,
}

impl Core {
    fn state(&self) -> FleetState {
        FleetState {
            phase: self.machine.phase(),
            target_power_kw: self.target_kw,
            target_source: self.target_source,
            manual_override: self.manual_override,
            last_command_source: self.last_source,
            last_command_timestamp: self.last_at,
            is_available_for_dispatch: self.machine.phase() != Phase::Fault
                && !self.manual_override.active,
        }
    }
}

/// Result of pushing one plan to the devices.
#[derive(Debug, Default)]
struct ApplyReport {
    attempted: usize,
    succeeded: usize,
    failed: Vec<(DeviceId, DeviceError)>,
    preempted: bool,
}

/// One turn of the apply loop.
enum Polled<T> {
    /// The pre-emption epoch moved (`true`) or its sender is gone (`false`).
    Preempted(bool),
    Next(Option<T>),
}

/// Steps needed to move one device to its planned setting.
#[derive(Debug)]
struct DeviceSteps {
    id: DeviceId,
    power: Option<PowerState>,
    frequency: Option<(u32, Option<f32>)>,
}

/// Serializes fleet commands and pushes the resulting plans to the devices.
pub struct CommandArbiter {
    registry: Arc<DeviceRegistry>,
    control: Arc<dyn DeviceControl>,
    config: ConfigHandle,
    settings: ArbiterConfig,
    max_concurrency: usize,
    offline_after: u32,
    core: Mutex<Core>,
    override_active: AtomicBool,
    preempt: watch::Sender<u64>,
    state_tx: watch::Sender<FleetState>,
    history: CommandHistory,
    sink: Option<HistoryHandle>,
}

impl CommandArbiter {
    /// Creates an arbiter in phase `Initializing` with no target.
    pub fn new(
        registry: Arc<DeviceRegistry>,
        control: Arc<dyn DeviceControl>,
        config: ConfigHandle,
        fleet: &FleetConfig,
    ) -> Self {
        let core = Core {
            machine: FleetStateMachine::new(fleet.state_machine.clone()),
            target_kw: 0.0,
            target_source: None,
            manual_override: ManualOverride::default(),
            last_source: None,
            last_at: None,
            last_plan: None,
        };
        let (state_tx, _) = watch::channel(core.state());
        let (preempt, _) = watch::channel(0);
        Self {
            registry,
            control,
            config,
            settings: fleet.arbiter.clone(),
            max_concurrency: fleet.poll.max_concurrency.max(1),
            offline_after: fleet.poll.offline_after_failures,
            core: Mutex::new(core),
            override_active: AtomicBool::new(false),
            preempt,
            state_tx,
            history: CommandHistory::new(fleet.arbiter.history_capacity),
            sink: None,
        }
    }

    /// Forwards every recorded command to the persistence writer.
    pub fn with_history_sink(mut self, sink: HistoryHandle) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    /// Latest fully-applied fleet state.
    pub fn state(&self) -> FleetState {
        self.state_tx.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<FleetState> {
        self.state_tx.subscribe()
    }

    pub fn history(&self, limit: usize) -> Vec<Command> {
        self.history.recent(limit)
    }

    /// Dispatch-facing status. Never waits for a running command.
    pub fn status(&self) -> DispatchStatus {
        let state = self.state();
        let devices = self.registry.snapshot();
        let config = self.config.current();
        let active_w: f32 = devices
            .iter()
            .filter(|d| d.is_online())
            .map(|d| d.telemetry.power_w)
            .sum();
        DispatchStatus {
            is_available_for_dispatch: state.is_available_for_dispatch,
            running_status: state.phase.running_status().code(),
            rated_power_in_kw: round2(allocation::rated_capacity_kw(&devices, &config)),
            active_power_in_kw: round2(active_w / 1000.0),
        }
    }

    /// Full operator view of the fleet.
    pub fn fleet_status(&self) -> FleetStatus {
        let state = self.state();
        let devices = self.registry.snapshot();
        let config = self.config.current();
        let metrics = FleetMetrics::from_devices(&devices, self.offline_after, Utc::now());
        FleetStatus {
            phase: state.phase,
            is_available_for_dispatch: state.is_available_for_dispatch,
            running_status: state.phase.running_status().code(),
            rated_power_kw: round2(allocation::rated_capacity_kw(&devices, &config)),
            active_power_kw: round2(metrics.active_power_kw),
            target_power_kw: round2(state.target_power_kw),
            override_active: state.manual_override.active,
            override_target_kw: state.manual_override.target_kw,
            last_command_source: state.last_command_source,
            last_command_at: state.last_command_timestamp,
            total_devices: metrics.total_devices,
            online_devices: metrics.online_devices,
            mining_devices: metrics.mining_devices,
            unreachable_devices: metrics.unreachable_devices,
            throughput_ths: metrics.throughput_ths,
            config_version: config.version,
            devices: devices.iter().map(DeviceSummary::from).collect(),
        }
    }

    /// The plan an immediate local apply of `target_kw` would push.
    ///
    /// # Errors
    ///
    /// Same as [`allocation::allocate`].
    pub fn preview(
        &self,
        target_kw: f32,
        mode: Option<AllocationMode>,
    ) -> Result<AllocationPlan, FleetError> {
        let config = self.config.current();
        let devices = self.registry.snapshot();
        allocation::allocate(&devices, target_kw, mode.unwrap_or(config.mode), &config)
    }

    /// Dispatcher activation at `power_kw`.
    pub async fn activate(&self, power_kw: f32) -> CommandOutcome {
        let draft = CommandDraft {
            source: CommandSource::Dispatcher,
            kind: CommandKind::Activate,
            requested_power_kw: Some(power_kw),
            device: None,
        };
        if self.override_active.load(Ordering::Acquire) {
            return self.reject(draft, override_conflict());
        }
        let preempt = self.preempt.subscribe();
        let mut core = self.core.lock().await;
        if let Err(e) = self.check_dispatchable(&core) {
            return self.reject(draft, e);
        }
        let config = self.config.current();
        self.apply_target(&mut core, draft, power_kw, None, &config, Some(preempt))
            .await
    }

    /// Dispatcher deactivation: a set-power to zero. Repeated calls succeed.
    ///
    /// Only the manual override blocks it; reachable devices are idled in
    /// every phase, `Fault` and `Initializing` included.
    pub async fn deactivate(&self) -> CommandOutcome {
        let draft = CommandDraft {
            source: CommandSource::Dispatcher,
            kind: CommandKind::Deactivate,
            requested_power_kw: Some(0.0),
            device: None,
        };
        if self.override_active.load(Ordering::Acquire) {
            return self.reject(draft, override_conflict());
        }
        let preempt = self.preempt.subscribe();
        let mut core = self.core.lock().await;
        if core.manual_override.active || self.override_active.load(Ordering::Acquire) {
            return self.reject(draft, override_conflict());
        }
        let config = self.config.current();
        self.apply_target(&mut core, draft, 0.0, None, &config, Some(preempt))
            .await
    }

    /// Dashboard apply of `target_kw`, optionally in a different mode.
    pub async fn local_apply(&self, target_kw: f32, mode: Option<AllocationMode>) -> CommandOutcome {
        let draft = CommandDraft {
            source: CommandSource::LocalApply,
            kind: CommandKind::SetPower,
            requested_power_kw: Some(target_kw),
            device: None,
        };
        if self.override_active.load(Ordering::Acquire) {
            return self.reject(draft, override_conflict());
        }
        let preempt = self.preempt.subscribe();
        let mut core = self.core.lock().await;
        if let Err(e) = self.check_dispatchable(&core) {
            return self.reject(draft, e);
        }
        let config = self.config.current();
        self.apply_target(&mut core, draft, target_kw, mode, &config, Some(preempt))
            .await
    }

    /// Enables or disables the manual override.
    ///
    /// The toggle takes effect before waiting for the critical section and
    /// aborts any dispatcher apply in flight. Enabling with a target applies
    /// it; enabling without one freezes the current target.
    pub async fn set_override(&self, enabled: bool, target_kw: Option<f32>) -> CommandOutcome {
        let currently = self.override_active.load(Ordering::Acquire);
        let kind = if enabled && currently {
            CommandKind::SetPower
        } else {
            CommandKind::ToggleOverride
        };
        let draft = CommandDraft {
            source: CommandSource::Manual,
            kind,
            requested_power_kw: target_kw.filter(|_| enabled),
            device: None,
        };

        let config = self.config.current();
        if let (true, Some(kw)) = (enabled, target_kw) {
            let devices = self.registry.snapshot();
            if let Err(e) = allocation::allocate(&devices, kw, config.mode, &config) {
                let idles_empty_fleet = kw <= 0.0 && e == FleetError::NoDevicesAvailable;
                if !idles_empty_fleet {
                    return self.reject(draft, e);
                }
            }
        }

        self.override_active.store(enabled, Ordering::Release);
        self.preempt.send_modify(|epoch| *epoch += 1);

        let mut core = self.core.lock().await;
        if !enabled {
            core.manual_override = ManualOverride::default();
            core.target_source = Some(CommandSource::Manual);
            info!("manual override released");
            let outcome = CommandOutcome::applied("manual override released", None);
            return self.finish(&mut core, draft, outcome);
        }

        let previous = (core.manual_override, core.target_source);
        let target = target_kw.unwrap_or(core.target_kw);
        core.manual_override = ManualOverride {
            active: true,
            target_kw: Some(target),
        };
        core.target_source = Some(CommandSource::Manual);
        info!(target_kw = target, "manual override engaged");

        match target_kw {
            Some(kw) => {
                let outcome = self
                    .apply_target(&mut core, draft, kw, None, &config, None)
                    .await;
                if !outcome.accepted {
                    // The registry changed since the check above.
                    (core.manual_override, core.target_source) = previous;
                    self.override_active.store(previous.0.active, Ordering::Release);
                    self.state_tx.send_replace(core.state());
                }
                outcome
            }
            None => {
                let outcome = CommandOutcome::applied(
                    format!("manual override engaged at {target:.2} kW"),
                    None,
                );
                self.finish(&mut core, draft, outcome)
            }
        }
    }

    /// Issues a start/stop/restart/reboot/reset to one device.
    pub async fn control_device(&self, id: &DeviceId, action: ControlAction) -> CommandOutcome {
        let draft = CommandDraft {
            source: CommandSource::Manual,
            kind: CommandKind::DeviceControl,
            requested_power_kw: None,
            device: Some(id.clone()),
        };
        let mut core = self.core.lock().await;
        if self.registry.get(id).is_none() {
            let err = FleetError::DeviceUnreachable {
                address: id.to_string(),
                source: DeviceError::Unreachable("not registered".into()),
            };
            return self.reject(draft, err);
        }

        let call = self.control.issue_control_action(id, action);
        let outcome = match with_timeout(self.settings.control_timeout(), call).await {
            Ok(ack) => {
                info!(device = %id, action = action.as_str(), "control action issued");
                let eta = ack
                    .expected_completion
                    .map(|d| format!(", expected in {} s", d.as_secs()))
                    .unwrap_or_default();
                CommandOutcome::applied(format!("{} sent to {id}{eta}", action.as_str()), None)
            }
            Err(source) => {
                self.registry.report_control_failure(id.clone(), source.clone());
                let err = FleetError::DeviceUnreachable {
                    address: id.to_string(),
                    source,
                };
                CommandOutcome::degraded(err, None)
            }
        };
        self.finish(&mut core, draft, outcome)
    }

    /// Runs the state machine over one cycle's metrics.
    pub async fn evaluate(&self, metrics: &FleetMetrics) -> Vec<Transition> {
        let mut core = self.core.lock().await;
        let transitions = core.machine.evaluate(metrics, Instant::now());
        if !transitions.is_empty() {
            self.state_tx.send_replace(core.state());
        }
        transitions
    }

    fn check_dispatchable(&self, core: &Core) -> Result<(), FleetError> {
        if core.manual_override.active || self.override_active.load(Ordering::Acquire) {
            return Err(override_conflict());
        }
        match core.machine.phase() {
            Phase::Fault => Err(FleetError::Conflict("fleet is in fault".into())),
            Phase::Initializing => Err(FleetError::Conflict("fleet is still initializing".into())),
            _ => Ok(()),
        }
    }

    /// Allocates, updates the target and phase, and pushes the plan.
    async fn apply_target(
        &self,
        core: &mut Core,
        draft: CommandDraft,
        target_kw: f32,
        mode: Option<AllocationMode>,
        config: &RuntimeConfig,
        preempt: Option<watch::Receiver<u64>>,
    ) -> CommandOutcome {
        let devices = self.registry.snapshot();
        let mode = mode.unwrap_or(config.mode);
        let plan = match allocation::allocate(&devices, target_kw, mode, config) {
            Ok(plan) => plan,
            Err(FleetError::NoDevicesAvailable) if target_kw <= 0.0 => {
                core.target_kw = 0.0;
                core.target_source = Some(draft.source);
                core.machine.on_deactivate();
                let outcome = CommandOutcome::applied("no online devices to idle", None);
                return self.finish(core, draft, outcome);
            }
            Err(e) => return self.reject(draft, e),
        };

        core.target_kw = plan.summary.target_w / 1000.0;
        core.target_source = Some(draft.source);
        let unchanged =
            core.machine.phase() == Phase::Active && core.last_plan.as_ref() == Some(&plan);
        let transition = if unchanged {
            None
        } else if plan.is_all_idle() {
            core.machine.on_deactivate()
        } else {
            core.machine.on_activate(plan.estimated_total_kw(), Instant::now())
        };
        self.state_tx.send_replace(core.state());
        info!(
            source = %draft.source,
            kind = %draft.kind,
            target_kw = core.target_kw,
            estimated_kw = plan.estimated_total_kw(),
            full = plan.summary.full_count,
            swing = plan.summary.swing_count,
            idle = plan.summary.idle_count,
            mode = mode.as_str(),
            config_version = config.version,
            phase = ?transition.map(|t| t.to),
            "allocation accepted"
        );

        let report = self.execute(&plan, &devices, core.last_plan.as_ref(), preempt).await;
        core.last_plan = Some(plan.clone());

        let outcome = if report.preempted {
            warn!(source = %draft.source, "apply pre-empted by manual override");
            CommandOutcome::degraded(
                FleetError::Conflict("pre-empted by manual override".into()),
                Some(plan),
            )
        } else if report.attempted > 0
            && (report.succeeded as f32 / report.attempted as f32) + f32::EPSILON
                < self.settings.min_apply_fraction
        {
            for (id, err) in &report.failed {
                warn!(device = %id, error = %err, "device action failed");
            }
            CommandOutcome::degraded(
                FleetError::PartialApplyFailure {
                    succeeded: report.succeeded,
                    attempted: report.attempted,
                },
                Some(plan),
            )
        } else {
            let message = format!(
                "{} full, {} swing, {} idle, {:.2} kW planned",
                plan.summary.full_count,
                plan.summary.swing_count,
                plan.summary.idle_count,
                plan.estimated_total_kw()
            );
            CommandOutcome::applied(message, Some(plan))
        };
        self.finish(core, draft, outcome)
    }

    /// Pushes `plan` to the devices with bounded fan-out.
    ///
    /// Calls already issued are not rolled back when others fail or when the
    /// apply is pre-empted.
    async fn execute(
        &self,
        plan: &AllocationPlan,
        devices: &[Device],
        previous: Option<&AllocationPlan>,
        preempt: Option<watch::Receiver<u64>>,
    ) -> ApplyReport {
        let steps: Vec<DeviceSteps> = plan
            .devices
            .iter()
            .filter_map(|a| {
                let device = devices.iter().find(|d| d.id == a.id)?;
                let was_running = previous
                    .and_then(|p| p.get(&a.id))
                    .is_some_and(|p| p.action != DeviceAction::Idle);
                let mining = device.telemetry.mining;
                let steps = match a.action {
                    DeviceAction::Idle => DeviceSteps {
                        id: a.id.clone(),
                        power: (mining || was_running).then_some(PowerState::Off),
                        frequency: None,
                    },
                    DeviceAction::Full | DeviceAction::Swing => {
                        let caps = device.capabilities();
                        let frequency = a
                            .frequency_mhz
                            .filter(|f| caps.frequency_control && device.telemetry.frequency_mhz != Some(*f))
                            .map(|f| (f, a.voltage.filter(|_| caps.voltage_control)));
                        DeviceSteps {
                            id: a.id.clone(),
                            power: (!mining).then_some(PowerState::On),
                            frequency,
                        }
                    }
                };
                (steps.power.is_some() || steps.frequency.is_some()).then_some(steps)
            })
            .collect();

        let mut report = ApplyReport {
            attempted: steps.len(),
            ..ApplyReport::default()
        };
        if steps.is_empty() {
            return report;
        }

        let timeout = self.settings.control_timeout();
        let control = &self.control;
        let mut results = futures::stream::iter(steps)
            .map(|s| async move {
                let result = apply_steps(control.as_ref(), &s, timeout).await;
                (s.id, result)
            })
            .buffer_unordered(self.max_concurrency);

        let mut preempt = preempt;
        loop {
            let polled = match preempt.as_mut() {
                Some(rx) => tokio::select! {
                    biased;
                    changed = rx.changed() => Polled::Preempted(changed.is_ok()),
                    next = results.next() => Polled::Next(next),
                },
                None => Polled::Next(results.next().await),
            };
            let (id, result) = match polled {
                Polled::Preempted(true) => {
                    report.preempted = true;
                    break;
                }
                Polled::Preempted(false) => {
                    preempt = None;
                    continue;
                }
                Polled::Next(None) => break,
                Polled::Next(Some(item)) => item,
            };
            match result {
                Ok(()) => report.succeeded += 1,
                Err(e) => {
                    debug!(device = %id, error = %e, "control call failed");
                    self.registry.report_control_failure(id.clone(), e.clone());
                    report.failed.push((id, e));
                }
            }
        }
        report
    }

    fn reject(&self, draft: CommandDraft, error: FleetError) -> CommandOutcome {
        warn!(source = %draft.source, kind = %draft.kind, %error, "command rejected");
        let outcome = CommandOutcome::rejected(error);
        self.record(&draft, &outcome);
        outcome
    }

    /// Records the outcome and publishes the resulting state.
    fn finish(&self, core: &mut Core, draft: CommandDraft, outcome: CommandOutcome) -> CommandOutcome {
        let command = self.record(&draft, &outcome);
        core.last_source = Some(command.source);
        core.last_at = Some(command.timestamp);
        self.state_tx.send_replace(core.state());
        outcome
    }

    fn record(&self, draft: &CommandDraft, outcome: &CommandOutcome) -> Command {
        let command = self.history.record(draft.clone(), outcome);
        if let Some(sink) = &self.sink {
            sink.record_command(&command);
        }
        command
    }
}

async fn apply_steps(
    control: &dyn DeviceControl,
    steps: &DeviceSteps,
    timeout: std::time::Duration,
) -> Result<(), DeviceError> {
    if steps.power == Some(PowerState::Off) {
        with_timeout(timeout, control.set_power_state(&steps.id, PowerState::Off)).await?;
        return Ok(());
    }
    if let Some((frequency, voltage)) = steps.frequency {
        with_timeout(timeout, control.set_frequency(&steps.id, frequency, voltage)).await?;
    }
    if let Some(state) = steps.power {
        with_timeout(timeout, control.set_power_state(&steps.id, state)).await?;
    }
    Ok(())
}

fn override_conflict() -> FleetError {
    FleetError::Conflict("manual override active".into())
}
