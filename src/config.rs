//! TOML configuration, validation, and the versioned runtime configuration.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::curve::{CurveLibrary, PowerCurve, PowerCurvePoint, S9_CURVE};
use crate::devices::{DeviceClass, DeviceId, DiscoveryEvent, FirmwareFamily};
use crate::fleet::allocation::{AllocationMode, BelowFloor};

/// Top-level configuration parsed from TOML.
///
/// Every section has defaults; an empty document is a valid configuration
/// with no seed devices. Use [`FleetConfig::demo`] for the two-miner fleet.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FleetConfig {
    #[serde(default)]
    pub poll: PollConfig,
    #[serde(default)]
    pub state_machine: StateMachineConfig,
    #[serde(default)]
    pub arbiter: ArbiterConfig,
    /// Runtime-mutable allocation settings (initial values).
    #[serde(default)]
    pub allocation: AllocationConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub simulator: SimulatorConfig,
    /// Extra device classes; `s9` is always available.
    #[serde(default)]
    pub classes: Vec<ClassConfig>,
    /// Seed devices announced at startup.
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

/// Reconciliation loop timing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PollConfig {
    /// Poll cycle period (ms).
    pub interval_ms: u64,
    /// Per-device query deadline (ms).
    pub device_timeout_ms: u64,
    /// Maximum concurrent device queries per cycle.
    pub max_concurrency: usize,
    /// Consecutive misses before a device is marked offline.
    pub offline_after_failures: u32,
    /// Upper bound on cycles skipped between polls of an offline device.
    pub max_backoff_cycles: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5000,
            device_timeout_ms: 2000,
            max_concurrency: 32,
            offline_after_failures: 3,
            max_backoff_cycles: 4,
        }
    }
}

impl PollConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn device_timeout(&self) -> Duration {
        Duration::from_millis(self.device_timeout_ms)
    }
}

/// Fleet phase evaluation thresholds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StateMachineConfig {
    /// Tolerance band as a fraction of the expected power.
    pub tolerance_pct: f32,
    /// Lower bound on the tolerance band (kW).
    pub tolerance_min_kw: f32,
    /// Consecutive in-band cycles needed to reach `Active`.
    pub settle_cycles: u32,
    /// Time allowed in `Activating` before faulting (ms).
    pub activation_timeout_ms: u64,
    /// Unreachable fraction above which the fleet faults.
    pub unreachable_fault_fraction: f32,
}

impl Default for StateMachineConfig {
    fn default() -> Self {
        Self {
            tolerance_pct: 0.10,
            tolerance_min_kw: 0.1,
            settle_cycles: 2,
            activation_timeout_ms: 60_000,
            unreachable_fault_fraction: 0.5,
        }
    }
}

impl StateMachineConfig {
    pub fn activation_timeout(&self) -> Duration {
        Duration::from_millis(self.activation_timeout_ms)
    }
}

/// Command arbitration settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ArbiterConfig {
    /// Per-call deadline for device control calls (ms).
    pub control_timeout_ms: u64,
    /// Fraction of planned device actions that must succeed.
    pub min_apply_fraction: f32,
    /// Commands kept in the in-memory history.
    pub history_capacity: usize,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            control_timeout_ms: 1500,
            min_apply_fraction: 1.0,
            history_capacity: 1000,
        }
    }
}

impl ArbiterConfig {
    pub fn control_timeout(&self) -> Duration {
        Duration::from_millis(self.control_timeout_ms)
    }
}

/// Initial allocation settings; see [`RuntimeConfig`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AllocationConfig {
    pub mode: AllocationMode,
    /// Device addresses allocated first, in list order.
    pub priority: Vec<String>,
    /// Rated power reported to the dispatcher instead of the online sum (kW).
    pub rated_power_override_kw: Option<f32>,
    pub below_floor: BelowFloor,
}

/// Persistence sink settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HistoryConfig {
    pub snapshot_csv: Option<PathBuf>,
    pub command_csv: Option<PathBuf>,
    /// Records buffered before new ones are dropped.
    pub queue_capacity: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            snapshot_csv: None,
            command_csv: None,
            queue_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ApiConfig {
    pub bind: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
        }
    }
}

/// Simulated transport parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimulatorConfig {
    pub seed: u64,
    /// Power noise standard deviation as a fraction of draw.
    pub noise_std: f32,
    /// Delay before commanded changes are observable (ms).
    pub settle_ms: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            noise_std: 0.01,
            settle_ms: 2000,
        }
    }
}

/// A device class: frequency window over a named or inline curve.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClassConfig {
    pub name: String,
    pub min_frequency_mhz: u32,
    pub max_frequency_mhz: u32,
    /// Built-in curve name, used when `points` is empty.
    #[serde(default = "default_curve")]
    pub curve: String,
    #[serde(default)]
    pub points: Vec<PowerCurvePoint>,
}

/// A statically configured device.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceConfig {
    pub address: String,
    #[serde(default = "default_curve")]
    pub class: String,
    #[serde(default = "default_rated_power_w")]
    pub rated_power_w: f32,
    #[serde(default = "default_firmware")]
    pub firmware: FirmwareFamily,
}

fn default_curve() -> String {
    S9_CURVE.to_string()
}

fn default_rated_power_w() -> f32 {
    1460.0
}

fn default_firmware() -> FirmwareFamily {
    FirmwareFamily::Vnish
}

/// Configuration error with field path and constraint description.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigError {
    /// Dotted field path (e.g., `"poll.interval_ms"`).
    pub field: String,
    /// Human-readable constraint description.
    pub message: String,
}

impl ConfigError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "config error: {}: {}", self.field, self.message)
    }
}

impl std::error::Error for ConfigError {}

impl FleetConfig {
    /// Defaults plus the two S9 miners at 10.0.0.1 and 10.0.0.2.
    pub fn demo() -> Self {
        let device = |address: &str| DeviceConfig {
            address: address.to_string(),
            class: default_curve(),
            rated_power_w: default_rated_power_w(),
            firmware: default_firmware(),
        };
        Self {
            devices: vec![device("10.0.0.1"), device("10.0.0.2")],
            ..Self::default()
        }
    }

    /// Parses a configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the file cannot be read or the TOML is invalid.
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| {
            ConfigError::new("config", format!("cannot read \"{}\": {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    /// Parses a configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the TOML is invalid or contains unknown fields.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        toml::from_str(s).map_err(|e| ConfigError::new("toml", e.to_string()))
    }

    /// The runtime-mutable part, at version 1.
    pub fn runtime(&self) -> RuntimeConfig {
        let a = &self.allocation;
        RuntimeConfig {
            version: 1,
            mode: a.mode,
            priority: a.priority.iter().map(|p| DeviceId::new(p.as_str())).collect(),
            rated_power_override_kw: a.rated_power_override_kw,
            below_floor: a.below_floor,
        }
    }

    /// Resolves the configured classes plus the built-in `s9` class.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` naming the class whose curve cannot be built.
    pub fn device_classes(&self) -> Result<HashMap<String, Arc<DeviceClass>>, ConfigError> {
        let library = CurveLibrary::builtin();
        let mut classes = HashMap::new();
        classes.insert(S9_CURVE.to_string(), Arc::new(DeviceClass::s9()));

        for (i, c) in self.classes.iter().enumerate() {
            let field = format!("classes[{i}]");
            let curve = if c.points.is_empty() {
                library
                    .get(&c.curve)
                    .map_err(|e| ConfigError::new(format!("{field}.curve"), e.to_string()))?
            } else {
                Arc::new(
                    PowerCurve::new(c.name.clone(), c.points.clone())
                        .map_err(|e| ConfigError::new(format!("{field}.points"), e.to_string()))?,
                )
            };
            let class = DeviceClass::new(&c.name, c.min_frequency_mhz, c.max_frequency_mhz, &curve)
                .map_err(|e| ConfigError::new(field, e.to_string()))?;
            classes.insert(c.name.clone(), Arc::new(class));
        }
        Ok(classes)
    }

    /// Discovery events announcing the configured seed devices, in order.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if a device names an unknown class.
    pub fn seed_events(&self) -> Result<Vec<DiscoveryEvent>, ConfigError> {
        let classes = self.device_classes()?;
        self.devices
            .iter()
            .enumerate()
            .map(|(i, d)| {
                let class = classes.get(&d.class).ok_or_else(|| {
                    ConfigError::new(
                        format!("devices[{i}].class"),
                        format!("unknown class \"{}\"", d.class),
                    )
                })?;
                Ok(DiscoveryEvent::Added {
                    id: DeviceId::new(d.address.as_str()),
                    class: Arc::clone(class),
                    firmware: d.firmware,
                    rated_power_w: d.rated_power_w,
                })
            })
            .collect()
    }

    /// Validates all fields and returns a list of errors.
    ///
    /// Returns an empty vector if configuration is valid.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();

        let p = &self.poll;
        if p.interval_ms == 0 {
            errors.push(ConfigError::new("poll.interval_ms", "must be > 0"));
        }
        if p.device_timeout_ms == 0 || p.device_timeout_ms > p.interval_ms {
            errors.push(ConfigError::new(
                "poll.device_timeout_ms",
                "must be > 0 and <= poll.interval_ms",
            ));
        }
        if p.max_concurrency == 0 {
            errors.push(ConfigError::new("poll.max_concurrency", "must be > 0"));
        }
        if p.offline_after_failures == 0 {
            errors.push(ConfigError::new("poll.offline_after_failures", "must be > 0"));
        }
        if p.max_backoff_cycles == 0 {
            errors.push(ConfigError::new("poll.max_backoff_cycles", "must be > 0"));
        }

        let sm = &self.state_machine;
        if !(0.0..=1.0).contains(&sm.tolerance_pct) {
            errors.push(ConfigError::new(
                "state_machine.tolerance_pct",
                "must be in [0.0, 1.0]",
            ));
        }
        if sm.tolerance_min_kw.is_nan() || sm.tolerance_min_kw < 0.0 {
            errors.push(ConfigError::new("state_machine.tolerance_min_kw", "must be >= 0"));
        }
        if sm.settle_cycles == 0 {
            errors.push(ConfigError::new("state_machine.settle_cycles", "must be > 0"));
        }
        if sm.unreachable_fault_fraction.is_nan()
            || sm.unreachable_fault_fraction <= 0.0
            || sm.unreachable_fault_fraction > 1.0
        {
            errors.push(ConfigError::new(
                "state_machine.unreachable_fault_fraction",
                "must be in (0.0, 1.0]",
            ));
        }

        let ar = &self.arbiter;
        if ar.control_timeout_ms == 0 {
            errors.push(ConfigError::new("arbiter.control_timeout_ms", "must be > 0"));
        }
        if !(0.0..=1.0).contains(&ar.min_apply_fraction) {
            errors.push(ConfigError::new(
                "arbiter.min_apply_fraction",
                "must be in [0.0, 1.0]",
            ));
        }
        if ar.history_capacity == 0 {
            errors.push(ConfigError::new("arbiter.history_capacity", "must be > 0"));
        }

        if let Some(rated) = self.allocation.rated_power_override_kw {
            if !rated.is_finite() || rated <= 0.0 {
                errors.push(ConfigError::new(
                    "allocation.rated_power_override_kw",
                    "must be a positive number",
                ));
            }
        }
        let mut seen = HashSet::new();
        for addr in &self.allocation.priority {
            if !seen.insert(addr) {
                errors.push(ConfigError::new(
                    "allocation.priority",
                    format!("duplicate address \"{addr}\""),
                ));
            }
        }

        if self.history.queue_capacity == 0 {
            errors.push(ConfigError::new("history.queue_capacity", "must be > 0"));
        }
        if self.api.bind.parse::<SocketAddr>().is_err() {
            errors.push(ConfigError::new(
                "api.bind",
                format!("\"{}\" is not a socket address", self.api.bind),
            ));
        }

        for (i, c) in self.classes.iter().enumerate() {
            if c.min_frequency_mhz >= c.max_frequency_mhz {
                errors.push(ConfigError::new(
                    format!("classes[{i}].min_frequency_mhz"),
                    "must be < max_frequency_mhz",
                ));
            }
        }
        let classes = match self.device_classes() {
            Ok(classes) => classes,
            Err(e) => {
                errors.push(e);
                HashMap::new()
            }
        };

        let mut addresses = HashSet::new();
        for (i, d) in self.devices.iter().enumerate() {
            if d.address.trim().is_empty() {
                errors.push(ConfigError::new(format!("devices[{i}].address"), "must not be empty"));
            } else if !addresses.insert(d.address.as_str()) {
                errors.push(ConfigError::new(
                    format!("devices[{i}].address"),
                    format!("duplicate address \"{}\"", d.address),
                ));
            }
            if !classes.is_empty() && !classes.contains_key(&d.class) {
                errors.push(ConfigError::new(
                    format!("devices[{i}].class"),
                    format!("unknown class \"{}\"", d.class),
                ));
            }
            if d.rated_power_w.is_nan() || d.rated_power_w <= 0.0 {
                errors.push(ConfigError::new(format!("devices[{i}].rated_power_w"), "must be > 0"));
            }
        }

        errors
    }
}

/// Allocation settings that may change while the system runs.
///
/// Each accepted update produces a new value with a higher `version`;
/// callers hold an `Arc` snapshot for the duration of one decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuntimeConfig {
    pub version: u64,
    pub mode: AllocationMode,
    pub priority: Vec<DeviceId>,
    pub rated_power_override_kw: Option<f32>,
    pub below_floor: BelowFloor,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            version: 1,
            mode: AllocationMode::default(),
            priority: Vec::new(),
            rated_power_override_kw: None,
            below_floor: BelowFloor::default(),
        }
    }
}

/// Partial update of [`RuntimeConfig`]. Absent fields are left unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfigPatch {
    pub mode: Option<AllocationMode>,
    pub priority: Option<Vec<DeviceId>>,
    /// A value `<= 0` clears the override.
    pub rated_power_override_kw: Option<f32>,
    pub below_floor: Option<BelowFloor>,
}

/// Shared owner of the current [`RuntimeConfig`].
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    tx: Arc<watch::Sender<Arc<RuntimeConfig>>>,
}

impl ConfigHandle {
    pub fn new(initial: RuntimeConfig) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(initial));
        Self { tx: Arc::new(tx) }
    }

    /// Snapshot of the current configuration.
    pub fn current(&self) -> Arc<RuntimeConfig> {
        Arc::clone(&self.tx.borrow())
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<RuntimeConfig>> {
        self.tx.subscribe()
    }

    /// Applies `patch` atomically and bumps the version.
    ///
    /// # Errors
    ///
    /// Returns every violated constraint; the current value is left untouched.
    pub fn update(&self, patch: RuntimeConfigPatch) -> Result<Arc<RuntimeConfig>, Vec<ConfigError>> {
        let mut errors = Vec::new();
        if let Some(rated) = patch.rated_power_override_kw {
            if !rated.is_finite() {
                errors.push(ConfigError::new(
                    "rated_power_override_kw",
                    "must be a finite number",
                ));
            }
        }
        if let Some(priority) = &patch.priority {
            let unique: HashSet<_> = priority.iter().collect();
            if unique.len() != priority.len() {
                errors.push(ConfigError::new("priority", "contains duplicate addresses"));
            }
        }
        if !errors.is_empty() {
            return Err(errors);
        }

        let mut updated = None;
        self.tx.send_modify(|current| {
            let mut next = (**current).clone();
            next.version += 1;
            if let Some(mode) = patch.mode {
                next.mode = mode;
            }
            if let Some(priority) = patch.priority {
                next.priority = priority;
            }
            if let Some(rated) = patch.rated_power_override_kw {
                next.rated_power_override_kw = (rated > 0.0).then_some(rated);
            }
            if let Some(below_floor) = patch.below_floor {
                next.below_floor = below_floor;
            }
            let next = Arc::new(next);
            updated = Some(Arc::clone(&next));
            *current = next;
        });
        Ok(updated.unwrap_or_else(|| self.current()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let errors = FleetConfig::default().validate();
        assert!(errors.is_empty(), "defaults should be valid: {errors:?}");
        let errors = FleetConfig::demo().validate();
        assert!(errors.is_empty(), "demo should be valid: {errors:?}");
    }

    #[test]
    fn valid_toml_parses() {
        let toml = r#"
[poll]
interval_ms = 2000
device_timeout_ms = 1000
max_concurrency = 8

[state_machine]
settle_cycles = 3

[allocation]
mode = "on_off"
priority = ["10.0.0.2"]
rated_power_override_kw = 2.5

[history]
command_csv = "commands.csv"

[[classes]]
name = "s9-eco"
min_frequency_mhz = 250
max_frequency_mhz = 550

[[devices]]
address = "10.0.0.1"

[[devices]]
address = "10.0.0.2"
class = "s9-eco"
firmware = "braiins"
rated_power_w = 1250.0
"#;
        let cfg = FleetConfig::from_toml_str(toml).expect("valid TOML should parse");
        assert!(cfg.validate().is_empty(), "{:?}", cfg.validate());
        assert_eq!(cfg.poll.interval_ms, 2000);
        assert_eq!(cfg.poll.offline_after_failures, 3);
        assert_eq!(cfg.allocation.mode, AllocationMode::OnOff);
        assert_eq!(cfg.devices[1].firmware, FirmwareFamily::Braiins);

        let runtime = cfg.runtime();
        assert_eq!(runtime.priority, vec![DeviceId::new("10.0.0.2")]);
        assert_eq!(runtime.rated_power_override_kw, Some(2.5));

        let events = cfg.seed_events().expect("classes resolve");
        assert_eq!(events.len(), 2);
        let DiscoveryEvent::Added { class, .. } = &events[1] else {
            panic!("expected Added");
        };
        assert_eq!(class.full_setting().power_w, 1250.0);
    }

    #[test]
    fn invalid_toml_unknown_field() {
        let toml = r#"
[poll]
interval_ms = 1000
bogus_field = true
"#;
        assert!(FleetConfig::from_toml_str(toml).is_err());
    }

    #[test]
    fn validation_catches_bad_values() {
        let mut cfg = FleetConfig::demo();
        cfg.poll.device_timeout_ms = cfg.poll.interval_ms + 1;
        cfg.arbiter.min_apply_fraction = 1.5;
        cfg.state_machine.unreachable_fault_fraction = 0.0;
        cfg.api.bind = "nowhere".into();
        let errors = cfg.validate();
        for field in [
            "poll.device_timeout_ms",
            "arbiter.min_apply_fraction",
            "state_machine.unreachable_fault_fraction",
            "api.bind",
        ] {
            assert!(errors.iter().any(|e| e.field == field), "missing {field}");
        }
    }

    #[test]
    fn validation_catches_duplicate_and_unknown_devices() {
        let mut cfg = FleetConfig::demo();
        cfg.devices[1].address = "10.0.0.1".into();
        cfg.devices.push(DeviceConfig {
            address: "10.0.0.3".into(),
            class: "l3".into(),
            rated_power_w: 800.0,
            firmware: FirmwareFamily::Stock,
        });
        let errors = cfg.validate();
        assert!(errors.iter().any(|e| e.field == "devices[1].address"));
        assert!(errors.iter().any(|e| e.field == "devices[2].class"));
    }

    #[test]
    fn class_window_without_points_is_rejected() {
        let mut cfg = FleetConfig::default();
        cfg.classes.push(ClassConfig {
            name: "tiny".into(),
            min_frequency_mhz: 10,
            max_frequency_mhz: 20,
            curve: default_curve(),
            points: Vec::new(),
        });
        let errors = cfg.validate();
        assert!(errors.iter().any(|e| e.field == "classes[0]"), "{errors:?}");
    }

    #[test]
    fn update_bumps_version_and_is_visible_to_subscribers() {
        let handle = ConfigHandle::new(RuntimeConfig::default());
        let rx = handle.subscribe();
        let next = handle
            .update(RuntimeConfigPatch {
                mode: Some(AllocationMode::OnOff),
                rated_power_override_kw: Some(2.0),
                ..RuntimeConfigPatch::default()
            })
            .expect("valid patch");
        assert_eq!(next.version, 2);
        assert_eq!(rx.borrow().mode, AllocationMode::OnOff);
        assert_eq!(handle.current().rated_power_override_kw, Some(2.0));

        let cleared = handle
            .update(RuntimeConfigPatch {
                rated_power_override_kw: Some(0.0),
                ..RuntimeConfigPatch::default()
            })
            .expect("valid patch");
        assert_eq!(cleared.version, 3);
        assert_eq!(cleared.rated_power_override_kw, None);
        assert_eq!(cleared.mode, AllocationMode::OnOff);
    }

    #[test]
    fn rejected_update_leaves_config_untouched() {
        let handle = ConfigHandle::new(RuntimeConfig::default());
        let result = handle.update(RuntimeConfigPatch {
            priority: Some(vec![DeviceId::new("a"), DeviceId::new("a")]),
            ..RuntimeConfigPatch::default()
        });
        assert!(result.is_err());
        assert_eq!(handle.current().version, 1);
    }
}
