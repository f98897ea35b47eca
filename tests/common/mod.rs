//! Shared test fixtures for integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use fleet_ems::config::{ConfigHandle, FleetConfig};
use fleet_ems::devices::{
    Ack, ControlAction, DeviceClass, DeviceControl, DeviceId, DeviceRegistry, DeviceStatus,
    DiscoveryEvent, FirmwareFamily, PowerState,
};
use fleet_ems::error::DeviceError;
use fleet_ems::fleet::{AllocationMode, CommandArbiter, ReconciliationLoop};
use fleet_ems::io::history::HistoryHandle;

/// One call seen by [`FakeControl`].
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Query(DeviceId),
    SetFrequency(DeviceId, u32),
    SetPower(DeviceId, PowerState),
    Control(DeviceId, ControlAction),
}

#[derive(Debug)]
struct FakeDevice {
    class: Arc<DeviceClass>,
    rated_power_w: f32,
    frequency_control: bool,
    mining: bool,
    frequency_mhz: u32,
    unreachable: bool,
    reject_commands: bool,
}

impl FakeDevice {
    fn status(&self) -> DeviceStatus {
        let setting = self.class.curve().setting_at_frequency(self.frequency_mhz);
        let power_w = match (self.mining, self.frequency_control) {
            (false, _) => 0.0,
            (true, true) => setting.power_w,
            (true, false) => self.rated_power_w,
        };
        DeviceStatus {
            online: true,
            mining: self.mining,
            throughput_ths: if self.mining { setting.throughput_ths } else { 0.0 },
            temperature_c: Some(50.0),
            power_w,
            frequency_mhz: Some(self.frequency_mhz),
            voltage: Some(setting.voltage),
        }
    }
}

/// Scriptable transport: commands take effect immediately, failures are
/// toggled per device, and every call is logged.
#[derive(Debug, Default)]
pub struct FakeControl {
    devices: Mutex<HashMap<DeviceId, FakeDevice>>,
    calls: Mutex<Vec<Call>>,
    command_delay: Mutex<Duration>,
    query_delays: Mutex<HashMap<DeviceId, Duration>>,
    queries_in_flight: AtomicUsize,
    max_queries_in_flight: AtomicUsize,
}

/// Counts a status query as in flight until dropped.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FakeControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, event: &DiscoveryEvent) {
        if let DiscoveryEvent::Added {
            id,
            class,
            firmware,
            rated_power_w,
        } = event
        {
            self.devices.lock().insert(
                id.clone(),
                FakeDevice {
                    class: Arc::clone(class),
                    rated_power_w: *rated_power_w,
                    frequency_control: firmware.capabilities().frequency_control,
                    mining: false,
                    frequency_mhz: class.curve().floor().frequency_mhz,
                    unreachable: false,
                    reject_commands: false,
                },
            );
        }
    }

    /// Makes every call to `id` fail with `Unreachable`.
    pub fn set_unreachable(&self, id: &str, unreachable: bool) {
        if let Some(d) = self.devices.lock().get_mut(&DeviceId::new(id)) {
            d.unreachable = unreachable;
        }
    }

    /// Makes set-calls to `id` fail while status queries still succeed.
    pub fn set_reject_commands(&self, id: &str, reject: bool) {
        if let Some(d) = self.devices.lock().get_mut(&DeviceId::new(id)) {
            d.reject_commands = reject;
        }
    }

    /// Delay added to every set-call.
    pub fn set_command_delay(&self, delay: Duration) {
        *self.command_delay.lock() = delay;
    }

    /// Delay before `id` answers a status query.
    pub fn set_query_delay(&self, id: &str, delay: Duration) {
        self.query_delays.lock().insert(DeviceId::new(id), delay);
    }

    /// Most status queries ever outstanding at once.
    pub fn max_queries_in_flight(&self) -> usize {
        self.max_queries_in_flight.load(Ordering::SeqCst)
    }

    pub fn is_mining(&self, id: &str) -> bool {
        self.devices
            .lock()
            .get(&DeviceId::new(id))
            .is_some_and(|d| d.mining)
    }

    pub fn frequency(&self, id: &str) -> Option<u32> {
        self.devices
            .lock()
            .get(&DeviceId::new(id))
            .map(|d| d.frequency_mhz)
    }

    /// Calls other than status queries.
    pub fn commands(&self) -> Vec<Call> {
        self.calls
            .lock()
            .iter()
            .filter(|c| !matches!(c, Call::Query(_)))
            .cloned()
            .collect()
    }

    /// Status queries sent to `id`.
    pub fn query_count(&self, id: &str) -> usize {
        let id = DeviceId::new(id);
        self.calls
            .lock()
            .iter()
            .filter(|c| matches!(c, Call::Query(q) if *q == id))
            .count()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    async fn command<T>(
        &self,
        call: Call,
        id: &DeviceId,
        f: impl FnOnce(&mut FakeDevice) -> T,
    ) -> Result<T, DeviceError> {
        self.calls.lock().push(call);
        let delay = *self.command_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut devices = self.devices.lock();
        let device = devices
            .get_mut(id)
            .ok_or_else(|| DeviceError::Unreachable(id.to_string()))?;
        if device.unreachable {
            return Err(DeviceError::Unreachable(id.to_string()));
        }
        if device.reject_commands {
            return Err(DeviceError::AuthFailure(id.to_string()));
        }
        Ok(f(device))
    }
}

#[async_trait]
impl DeviceControl for FakeControl {
    async fn query_status(&self, id: &DeviceId) -> Result<DeviceStatus, DeviceError> {
        self.calls.lock().push(Call::Query(id.clone()));
        let now = self.queries_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_queries_in_flight.fetch_max(now, Ordering::SeqCst);
        let _in_flight = InFlight(&self.queries_in_flight);
        let delay = self.query_delays.lock().get(id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let devices = self.devices.lock();
        match devices.get(id) {
            Some(d) if !d.unreachable => Ok(d.status()),
            _ => Err(DeviceError::Unreachable(id.to_string())),
        }
    }

    async fn set_frequency(
        &self,
        id: &DeviceId,
        frequency_mhz: u32,
        _voltage: Option<f32>,
    ) -> Result<Ack, DeviceError> {
        self.command(Call::SetFrequency(id.clone(), frequency_mhz), id, |d| {
            d.frequency_mhz = frequency_mhz;
            Ack::default()
        })
        .await
    }

    async fn set_power_state(&self, id: &DeviceId, state: PowerState) -> Result<Ack, DeviceError> {
        self.command(Call::SetPower(id.clone(), state), id, |d| {
            d.mining = state == PowerState::On;
            Ack::default()
        })
        .await
    }

    async fn issue_control_action(
        &self,
        id: &DeviceId,
        action: ControlAction,
    ) -> Result<Ack, DeviceError> {
        self.command(Call::Control(id.clone(), action), id, |d| {
            match action {
                ControlAction::Start => d.mining = true,
                ControlAction::Stop | ControlAction::Reboot | ControlAction::Reset => {
                    d.mining = false;
                }
                ControlAction::Restart => {}
            }
            Ack {
                expected_completion: Some(Duration::from_secs(60)),
            }
        })
        .await
    }
}

/// The two-miner fleet: S9s at 10.0.0.1 and 10.0.0.2, 1.46 kW each.
pub fn s9_pair(firmware: FirmwareFamily) -> Vec<DiscoveryEvent> {
    let class = Arc::new(DeviceClass::s9());
    ["10.0.0.1", "10.0.0.2"]
        .into_iter()
        .map(|addr| DiscoveryEvent::Added {
            id: DeviceId::new(addr),
            class: Arc::clone(&class),
            firmware,
            rated_power_w: 1460.0,
        })
        .collect()
}

/// Registry, transport, arbiter, and a poll loop wired together.
pub struct Harness {
    pub config: FleetConfig,
    pub registry: Arc<DeviceRegistry>,
    pub control: Arc<FakeControl>,
    pub arbiter: Arc<CommandArbiter>,
    pub reconcile: ReconciliationLoop,
}

impl Harness {
    /// Builds the harness around `events` without polling.
    pub fn with_events(config: FleetConfig, events: Vec<DiscoveryEvent>) -> Self {
        Self::build(config, events, None)
    }

    /// Like [`Harness::with_events`], with arbiter and loop feeding `sink`.
    pub fn with_history(
        config: FleetConfig,
        events: Vec<DiscoveryEvent>,
        sink: HistoryHandle,
    ) -> Self {
        Self::build(config, events, Some(sink))
    }

    fn build(config: FleetConfig, events: Vec<DiscoveryEvent>, sink: Option<HistoryHandle>) -> Self {
        let control = Arc::new(FakeControl::new());
        let registry = Arc::new(DeviceRegistry::new());
        for event in events {
            control.register(&event);
            registry.apply_discovery(event);
        }
        let dyn_control: Arc<dyn DeviceControl> = Arc::clone(&control) as Arc<dyn DeviceControl>;
        let mut arbiter = CommandArbiter::new(
            Arc::clone(&registry),
            Arc::clone(&dyn_control),
            ConfigHandle::new(config.runtime()),
            &config,
        );
        if let Some(sink) = &sink {
            arbiter = arbiter.with_history_sink(sink.clone());
        }
        let arbiter = Arc::new(arbiter);
        let mut reconcile = ReconciliationLoop::new(
            Arc::clone(&registry),
            dyn_control,
            Arc::clone(&arbiter),
            config.poll.clone(),
        );
        if let Some(sink) = sink {
            reconcile = reconcile.with_history_sink(sink);
        }
        Self {
            config,
            registry,
            control,
            arbiter,
            reconcile,
        }
    }

    /// Two Vnish S9s in `mode`, polled once so the fleet is in standby.
    pub async fn s9_pair(mode: AllocationMode) -> Self {
        let mut config = FleetConfig::default();
        config.allocation.mode = mode;
        let mut h = Self::with_events(config, s9_pair(FirmwareFamily::Vnish));
        h.reconcile.run_cycle().await;
        h
    }

    /// Runs `n` poll cycles.
    pub async fn cycles(&mut self, n: usize) {
        for _ in 0..n {
            self.reconcile.run_cycle().await;
        }
    }
}
