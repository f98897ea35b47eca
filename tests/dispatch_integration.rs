//! End-to-end dispatch scenarios over a two-miner fleet.

mod common;

use common::{Call, Harness};
use fleet_ems::devices::{DeviceId, PowerState};
use fleet_ems::error::FleetError;
use fleet_ems::fleet::{AllocationMode, CommandKind, CommandSource, DeviceAction, Phase};

#[tokio::test]
async fn scenario_a_on_off_never_overshoots() {
    let h = Harness::s9_pair(AllocationMode::OnOff).await;
    let outcome = h.arbiter.activate(2.0).await;

    assert!(outcome.accepted && outcome.success, "{}", outcome.message);
    let plan = outcome.plan.expect("accepted activate carries its plan");
    assert_eq!(plan.summary.full_count, 1);
    assert_eq!(plan.summary.idle_count, 1);
    assert!((plan.estimated_total_kw() - 1.46).abs() < 0.01);

    assert!(h.control.is_mining("10.0.0.1"));
    assert!(!h.control.is_mining("10.0.0.2"));
    assert_eq!(h.arbiter.state().phase, Phase::Activating);
}

#[tokio::test]
async fn scenario_b_frequency_mode_tunes_one_swing_device() {
    let h = Harness::s9_pair(AllocationMode::Frequency).await;
    let outcome = h.arbiter.activate(2.0).await;

    assert!(outcome.success, "{}", outcome.message);
    let plan = outcome.plan.expect("plan");
    let first = plan.get(&DeviceId::new("10.0.0.1")).expect("device 1 planned");
    let second = plan.get(&DeviceId::new("10.0.0.2")).expect("device 2 planned");
    assert_eq!(first.action, DeviceAction::Full);
    assert_eq!(first.frequency_mhz, Some(650));
    assert_eq!(second.action, DeviceAction::Swing);
    assert!((second.estimated_power_w - 540.0).abs() < 5.0);
    assert!((plan.estimated_total_kw() - 2.0).abs() < 0.01);

    let swing_freq = h.control.frequency("10.0.0.2").expect("registered");
    assert!((250..300).contains(&swing_freq));
    assert!(h.control.is_mining("10.0.0.2"));
}

#[tokio::test]
async fn scenario_c_capacity_exceeded_changes_nothing() {
    let h = Harness::s9_pair(AllocationMode::Frequency).await;
    let before = h.arbiter.state();
    let outcome = h.arbiter.activate(5.0).await;

    assert!(!outcome.accepted);
    assert!(matches!(
        outcome.error,
        Some(FleetError::CapacityExceeded { .. })
    ));
    assert!(h.control.commands().is_empty());
    assert_eq!(h.arbiter.state(), before);

    let recorded = h.arbiter.history(1);
    assert_eq!(recorded.len(), 1);
    assert!(!recorded[0].success);
    assert_eq!(recorded[0].kind, CommandKind::Activate);
    assert_eq!(recorded[0].source, CommandSource::Dispatcher);
}

#[tokio::test]
async fn scenario_d_override_blocks_dispatcher() {
    let h = Harness::s9_pair(AllocationMode::Frequency).await;
    let engaged = h.arbiter.set_override(true, Some(1.5)).await;
    assert!(engaged.success, "{}", engaged.message);

    let outcome = h.arbiter.activate(2.0).await;
    assert!(!outcome.accepted);
    assert!(matches!(outcome.error, Some(FleetError::Conflict(_))));

    let state = h.arbiter.state();
    assert!(state.manual_override.active);
    assert!((state.target_power_kw - 1.5).abs() < 1e-3);
    assert_eq!(state.target_source, Some(CommandSource::Manual));
    assert!(!state.is_available_for_dispatch);
    assert!(!h.arbiter.status().is_available_for_dispatch);
}

#[tokio::test]
async fn scenario_e_offline_device_leaves_capacity_and_plans() {
    let mut h = Harness::s9_pair(AllocationMode::OnOff).await;
    h.control.set_unreachable("10.0.0.2", true);
    h.cycles(3).await;

    let device = h
        .registry
        .get(&DeviceId::new("10.0.0.2"))
        .expect("still registered");
    assert!(!device.is_online());
    assert!((h.arbiter.status().rated_power_in_kw - 1.46).abs() < 1e-3);

    let plan = h.arbiter.preview(1.0, None).expect("one device online");
    assert!(plan.get(&DeviceId::new("10.0.0.2")).is_none());

    let outcome = h.arbiter.activate(2.0).await;
    assert!(matches!(
        outcome.error,
        Some(FleetError::CapacityExceeded { .. })
    ));
    // Half the fleet unreachable is not above the fault threshold.
    assert_ne!(h.arbiter.state().phase, Phase::Fault);
}

#[tokio::test]
async fn activation_settles_into_active_then_back_to_standby() {
    let mut h = Harness::s9_pair(AllocationMode::Frequency).await;
    assert!(h.arbiter.activate(2.0).await.success);
    assert_eq!(h.arbiter.status().running_status, 1);

    h.cycles(2).await;
    assert_eq!(h.arbiter.state().phase, Phase::Active);
    let status = h.arbiter.status();
    assert_eq!(status.running_status, 2);
    assert!((status.active_power_in_kw - 2.0).abs() < 0.05);

    let outcome = h.arbiter.deactivate().await;
    assert!(outcome.accepted && outcome.success);
    assert_eq!(h.arbiter.state().phase, Phase::Deactivating);
    assert!(!h.control.is_mining("10.0.0.1"));
    assert!(!h.control.is_mining("10.0.0.2"));

    h.cycles(1).await;
    assert_eq!(h.arbiter.state().phase, Phase::Standby);
}

#[tokio::test]
async fn deactivate_is_idempotent() {
    let h = Harness::s9_pair(AllocationMode::Frequency).await;
    for _ in 0..3 {
        let outcome = h.arbiter.deactivate().await;
        assert!(outcome.accepted, "{}", outcome.message);
    }
    assert!(h.control.commands().is_empty());
    assert_eq!(h.arbiter.state().phase, Phase::Standby);
    assert_eq!(h.arbiter.history(10).len(), 3);
}

#[tokio::test]
async fn deactivate_in_fault_idles_reachable_devices() {
    let mut config = fleet_ems::config::FleetConfig::default();
    config.allocation.mode = AllocationMode::OnOff;
    config.state_machine.unreachable_fault_fraction = 0.4;
    let mut h = Harness::with_events(
        config,
        common::s9_pair(fleet_ems::devices::FirmwareFamily::Vnish),
    );
    h.cycles(1).await;
    assert!(h.arbiter.activate(1.46).await.success);
    assert!(h.control.is_mining("10.0.0.1"));

    h.control.set_unreachable("10.0.0.2", true);
    h.cycles(3).await;
    assert_eq!(h.arbiter.state().phase, Phase::Fault);

    let outcome = h.arbiter.deactivate().await;
    assert!(outcome.accepted && outcome.success, "{}", outcome.message);
    assert!(!h.control.is_mining("10.0.0.1"));
    assert_eq!(h.arbiter.state().phase, Phase::Fault);
    assert!(h.arbiter.activate(1.0).await.error.is_some());
}

#[tokio::test]
async fn deactivate_before_first_poll_is_accepted() {
    let h = Harness::with_events(
        fleet_ems::config::FleetConfig::default(),
        common::s9_pair(fleet_ems::devices::FirmwareFamily::Vnish),
    );
    assert_eq!(h.arbiter.state().phase, Phase::Initializing);
    let outcome = h.arbiter.deactivate().await;
    assert!(outcome.accepted, "{}", outcome.message);
    assert_eq!(h.arbiter.state().phase, Phase::Initializing);
}

#[tokio::test]
async fn identical_activate_keeps_fleet_running() {
    let mut h = Harness::s9_pair(AllocationMode::Frequency).await;
    assert!(h.arbiter.activate(2.0).await.success);
    h.cycles(2).await;
    assert_eq!(h.arbiter.state().phase, Phase::Active);
    h.control.clear_calls();

    let outcome = h.arbiter.activate(2.0).await;
    assert!(outcome.accepted && outcome.success, "{}", outcome.message);
    assert_eq!(h.arbiter.state().phase, Phase::Active);
    assert_eq!(h.arbiter.status().running_status, 2);
    assert!(h.control.commands().is_empty());

    // A different target starts a new activation.
    assert!(h.arbiter.activate(1.46).await.success);
    assert_eq!(h.arbiter.state().phase, Phase::Activating);
}

#[tokio::test]
async fn repeated_activate_sends_nothing_new() {
    let mut h = Harness::s9_pair(AllocationMode::Frequency).await;
    assert!(h.arbiter.activate(2.0).await.success);
    h.cycles(1).await;
    h.control.clear_calls();

    let again = h.arbiter.activate(2.0).await;
    assert!(again.success);
    assert!(h.control.commands().is_empty());
}

#[tokio::test]
async fn partial_apply_failure_is_reported_and_folded() {
    let mut h = Harness::s9_pair(AllocationMode::OnOff).await;
    h.control.set_reject_commands("10.0.0.2", true);

    let outcome = h.arbiter.activate(2.92).await;
    assert!(outcome.accepted);
    assert!(!outcome.success);
    assert_eq!(
        outcome.error,
        Some(FleetError::PartialApplyFailure {
            succeeded: 1,
            attempted: 2
        })
    );
    assert!(h.control.is_mining("10.0.0.1"));

    h.cycles(1).await;
    let device = h.registry.get(&DeviceId::new("10.0.0.2")).expect("registered");
    let last_error = device.telemetry.last_error.as_ref().expect("control failure folded");
    assert!(last_error.starts_with("control failed at"));
    // Control failures do not count as missed polls.
    assert!(device.is_online());
}

#[tokio::test]
async fn widespread_outage_faults_and_recovers() {
    let mut h = Harness::s9_pair(AllocationMode::Frequency).await;
    h.control.set_unreachable("10.0.0.1", true);
    h.control.set_unreachable("10.0.0.2", true);
    h.cycles(3).await;

    assert_eq!(h.arbiter.state().phase, Phase::Fault);
    assert!(!h.arbiter.status().is_available_for_dispatch);
    let outcome = h.arbiter.activate(1.0).await;
    assert!(matches!(outcome.error, Some(FleetError::Conflict(_))));
    // Nothing is reachable to idle, but the request is still honoured.
    let outcome = h.arbiter.deactivate().await;
    assert!(outcome.accepted, "{}", outcome.message);
    assert_eq!(h.arbiter.state().phase, Phase::Fault);

    h.control.set_unreachable("10.0.0.1", false);
    h.control.set_unreachable("10.0.0.2", false);
    h.cycles(1).await;
    assert_eq!(h.arbiter.state().phase, Phase::Standby);
    assert!(h.arbiter.status().is_available_for_dispatch);
}

#[tokio::test]
async fn priority_list_decides_who_runs() {
    let h = Harness::s9_pair(AllocationMode::OnOff).await;
    let patch = fleet_ems::config::RuntimeConfigPatch {
        priority: Some(vec![DeviceId::new("10.0.0.2")]),
        ..Default::default()
    };
    let updated = h.arbiter.config().update(patch).expect("valid patch");
    assert_eq!(updated.version, 2);

    assert!(h.arbiter.activate(1.46).await.success);
    assert!(h.control.is_mining("10.0.0.2"));
    assert!(!h.control.is_mining("10.0.0.1"));
    assert!(
        h.control
            .commands()
            .contains(&Call::SetPower(DeviceId::new("10.0.0.2"), PowerState::On))
    );
}

#[tokio::test]
async fn stock_firmware_is_switched_but_never_tuned() {
    let mut config = fleet_ems::config::FleetConfig::default();
    config.allocation.mode = AllocationMode::Frequency;
    let mut h = Harness::with_events(
        config,
        common::s9_pair(fleet_ems::devices::FirmwareFamily::Stock),
    );
    h.cycles(1).await;

    let outcome = h.arbiter.activate(2.0).await;
    assert!(outcome.success, "{}", outcome.message);
    let plan = outcome.plan.expect("plan");
    assert!(plan.swing().is_none());
    assert!(
        h.control
            .commands()
            .iter()
            .all(|c| !matches!(c, Call::SetFrequency(..)))
    );
}

#[tokio::test]
async fn empty_fleet_reports_no_devices() {
    let mut h = Harness::with_events(fleet_ems::config::FleetConfig::default(), Vec::new());
    h.cycles(1).await;
    assert_eq!(h.arbiter.state().phase, Phase::Standby);

    let outcome = h.arbiter.activate(1.0).await;
    assert_eq!(outcome.error, Some(FleetError::NoDevicesAvailable));
    assert!(h.arbiter.deactivate().await.accepted);
}
