//! In-process device transport used by the binary when no hardware is attached.
//!
//! Each simulated device follows its class curve. Commanded changes become
//! visible after a settle delay, reported power carries Gaussian noise, and
//! outages can be injected per device.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::{Rng, SeedableRng, rngs::StdRng};
use tokio::time::Instant;

use crate::curve::PowerCurve;
use crate::error::DeviceError;

use super::control::{Ack, ControlAction, DeviceControl, DeviceStatus, PowerState};
use super::types::{Capabilities, DeviceId, DiscoveryEvent};

/// Draws a zero-mean Gaussian sample (Box-Muller).
pub fn gaussian_noise(rng: &mut StdRng, std_dev: f32) -> f32 {
    if std_dev <= 0.0 {
        return 0.0;
    }

    let u1: f32 = rng.random::<f32>().clamp(1e-6, 1.0);
    let u2: f32 = rng.random::<f32>();
    let z0 = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f32::consts::PI * u2).cos();
    z0 * std_dev
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Operating {
    mining: bool,
    frequency_mhz: u32,
    voltage: f32,
}

#[derive(Debug)]
struct SimDevice {
    curve: Arc<PowerCurve>,
    capabilities: Capabilities,
    rated_power_w: f32,
    observed: Operating,
    commanded: Operating,
    settles_at: Instant,
    outage: bool,
}

impl SimDevice {
    fn refresh(&mut self, now: Instant) {
        if now >= self.settles_at {
            self.observed = self.commanded;
        }
    }

    fn command(&mut self, next: Operating, settle: Duration) {
        self.commanded = next;
        self.settles_at = Instant::now() + settle;
    }
}

#[derive(Debug)]
struct SimState {
    rng: StdRng,
    devices: HashMap<DeviceId, SimDevice>,
}

/// Seedable fleet simulator implementing [`DeviceControl`].
#[derive(Debug)]
pub struct SimulatedFleet {
    state: Mutex<SimState>,
    noise_std: f32,
    settle: Duration,
    latency: Duration,
}

impl SimulatedFleet {
    /// Creates an empty simulator.
    ///
    /// # Arguments
    ///
    /// * `seed` - Random seed for reproducible telemetry noise
    /// * `noise_std` - Standard deviation of power noise as a fraction of draw
    pub fn new(seed: u64, noise_std: f32) -> Self {
        Self {
            state: Mutex::new(SimState {
                rng: StdRng::seed_from_u64(seed),
                devices: HashMap::new(),
            }),
            noise_std: noise_std.max(0.0),
            settle: Duration::ZERO,
            latency: Duration::ZERO,
        }
    }

    /// Delay before a commanded change shows up in status queries.
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Artificial delay added to every call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Adds the device described by an `Added` event; other events are ignored.
    ///
    /// New devices start idle at their class floor frequency.
    pub fn register(&self, event: &DiscoveryEvent) {
        let DiscoveryEvent::Added {
            id,
            class,
            firmware,
            rated_power_w,
        } = event
        else {
            return;
        };
        let floor = class.curve().floor();
        let idle = Operating {
            mining: false,
            frequency_mhz: floor.frequency_mhz,
            voltage: floor.voltage,
        };
        self.state.lock().devices.insert(
            id.clone(),
            SimDevice {
                curve: Arc::clone(class.curve()),
                capabilities: firmware.capabilities(),
                rated_power_w: *rated_power_w,
                observed: idle,
                commanded: idle,
                settles_at: Instant::now(),
                outage: false,
            },
        );
    }

    /// Makes a device stop answering (or answer again).
    pub fn set_outage(&self, id: &DeviceId, outage: bool) {
        if let Some(device) = self.state.lock().devices.get_mut(id) {
            device.outage = outage;
        }
    }

    async fn delay(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    fn with_device<T>(
        &self,
        id: &DeviceId,
        f: impl FnOnce(&mut SimDevice, &mut StdRng) -> Result<T, DeviceError>,
    ) -> Result<T, DeviceError> {
        let mut state = self.state.lock();
        let SimState { rng, devices } = &mut *state;
        let device = devices
            .get_mut(id)
            .ok_or_else(|| DeviceError::Unreachable(format!("no route to {id}")))?;
        if device.outage {
            return Err(DeviceError::Unreachable(format!("{id}: connection refused")));
        }
        f(device, rng)
    }
}

#[async_trait]
impl DeviceControl for SimulatedFleet {
    async fn query_status(&self, id: &DeviceId) -> Result<DeviceStatus, DeviceError> {
        self.delay().await;
        let noise_std = self.noise_std;
        self.with_device(id, |device, rng| {
            device.refresh(Instant::now());
            let op = device.observed;
            if !op.mining {
                return Ok(DeviceStatus {
                    online: true,
                    mining: false,
                    throughput_ths: 0.0,
                    temperature_c: Some(35.0),
                    power_w: 0.0,
                    frequency_mhz: Some(op.frequency_mhz),
                    voltage: Some(op.voltage),
                });
            }

            let setting = device.curve.setting_at_frequency(op.frequency_mhz);
            let base_w = if device.capabilities.frequency_control {
                setting.power_w
            } else {
                device.rated_power_w
            };
            let power_w = (base_w * (1.0 + gaussian_noise(rng, noise_std))).max(0.0);
            let temperature_c = 45.0 + 30.0 * (power_w / device.rated_power_w.max(1.0)).min(1.2);

            Ok(DeviceStatus {
                online: true,
                mining: true,
                throughput_ths: setting.throughput_ths,
                temperature_c: Some(temperature_c),
                power_w,
                frequency_mhz: Some(op.frequency_mhz),
                voltage: Some(op.voltage),
            })
        })
    }

    async fn set_frequency(
        &self,
        id: &DeviceId,
        frequency_mhz: u32,
        voltage: Option<f32>,
    ) -> Result<Ack, DeviceError> {
        self.delay().await;
        let settle = self.settle;
        self.with_device(id, |device, _| {
            if !device.capabilities.frequency_control {
                return Err(DeviceError::ParseError(
                    "firmware does not accept frequency settings".into(),
                ));
            }
            let setting = device.curve.setting_at_frequency(frequency_mhz);
            let voltage = match (voltage, device.capabilities.voltage_control) {
                (Some(v), true) => v,
                _ => setting.voltage,
            };
            let next = Operating {
                frequency_mhz: setting.frequency_mhz,
                voltage,
                ..device.commanded
            };
            device.command(next, settle);
            Ok(Ack {
                expected_completion: Some(settle),
            })
        })
    }

    async fn set_power_state(&self, id: &DeviceId, state: PowerState) -> Result<Ack, DeviceError> {
        self.delay().await;
        let settle = self.settle;
        self.with_device(id, |device, _| {
            let next = Operating {
                mining: state == PowerState::On,
                ..device.commanded
            };
            device.command(next, settle);
            Ok(Ack {
                expected_completion: Some(settle),
            })
        })
    }

    async fn issue_control_action(
        &self,
        id: &DeviceId,
        action: ControlAction,
    ) -> Result<Ack, DeviceError> {
        self.delay().await;
        let settle = self.settle;
        self.with_device(id, |device, _| {
            let mut next = device.commanded;
            let completion = match action {
                ControlAction::Start => {
                    next.mining = true;
                    settle
                }
                ControlAction::Stop => {
                    next.mining = false;
                    settle
                }
                ControlAction::Restart => {
                    next.mining = true;
                    settle * 2
                }
                ControlAction::Reboot => {
                    next.mining = true;
                    settle.max(Duration::from_secs(60))
                }
                ControlAction::Reset => {
                    let ceiling = device.curve.ceiling();
                    next.frequency_mhz = ceiling.frequency_mhz;
                    next.voltage = ceiling.voltage;
                    settle.max(Duration::from_secs(60))
                }
            };
            device.command(next, completion);
            Ok(Ack {
                expected_completion: Some(completion),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::types::{DeviceClass, FirmwareFamily};

    fn sim_with(firmware: FirmwareFamily) -> (SimulatedFleet, DeviceId) {
        let sim = SimulatedFleet::new(7, 0.0);
        let id = DeviceId::new("10.0.0.1");
        sim.register(&DiscoveryEvent::Added {
            id: id.clone(),
            class: Arc::new(DeviceClass::s9()),
            firmware,
            rated_power_w: 1460.0,
        });
        (sim, id)
    }

    #[test]
    fn test_gaussian_noise_zero_std() {
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(gaussian_noise(&mut rng, 0.0), 0.0);
        assert_eq!(gaussian_noise(&mut rng, -1.0), 0.0);
    }

    #[test]
    fn test_gaussian_noise_is_reproducible() {
        let mut a = StdRng::seed_from_u64(42);
        let mut b = StdRng::seed_from_u64(42);
        for _ in 0..10 {
            assert_eq!(gaussian_noise(&mut a, 0.05), gaussian_noise(&mut b, 0.05));
        }
    }

    #[tokio::test]
    async fn new_device_is_idle() {
        let (sim, id) = sim_with(FirmwareFamily::Vnish);
        let status = sim.query_status(&id).await.expect("reachable");
        assert!(status.online);
        assert!(!status.mining);
        assert_eq!(status.power_w, 0.0);
    }

    #[tokio::test]
    async fn frequency_follows_class_curve() {
        let (sim, id) = sim_with(FirmwareFamily::Vnish);
        sim.set_power_state(&id, PowerState::On).await.expect("ack");
        sim.set_frequency(&id, 650, None).await.expect("ack");
        let status = sim.query_status(&id).await.expect("reachable");
        assert!(status.mining);
        assert_eq!(status.frequency_mhz, Some(650));
        assert_eq!(status.power_w, 1460.0);
    }

    #[tokio::test]
    async fn stock_firmware_rejects_frequency() {
        let (sim, id) = sim_with(FirmwareFamily::Stock);
        let err = sim.set_frequency(&id, 500, None).await;
        assert!(matches!(err, Err(DeviceError::ParseError(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn changes_become_visible_after_settle() {
        let (sim, id) = sim_with(FirmwareFamily::Vnish);
        let sim = sim.with_settle(Duration::from_secs(5));
        sim.set_power_state(&id, PowerState::On).await.expect("ack");
        assert!(!sim.query_status(&id).await.expect("reachable").mining);
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(sim.query_status(&id).await.expect("reachable").mining);
    }

    #[tokio::test]
    async fn outage_makes_device_unreachable() {
        let (sim, id) = sim_with(FirmwareFamily::Braiins);
        sim.set_outage(&id, true);
        assert!(matches!(
            sim.query_status(&id).await,
            Err(DeviceError::Unreachable(_))
        ));
        sim.set_outage(&id, false);
        assert!(sim.query_status(&id).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_device_hits_call_timeout() {
        let (sim, id) = sim_with(FirmwareFamily::Vnish);
        let sim = sim.with_latency(Duration::from_secs(3));
        let result = crate::devices::control::with_timeout(
            Duration::from_secs(2),
            sim.query_status(&id),
        )
        .await;
        assert!(matches!(result, Err(DeviceError::Timeout(2000))));
    }
}
