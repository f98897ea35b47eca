//! Device model, control interface, and registry.

/// Transport-independent Device Control Interface.
pub mod control;
/// Registered devices and their last-observed telemetry.
pub mod registry;
/// Seedable in-process device transport.
pub mod simulated;
pub mod types;

pub use control::{Ack, ControlAction, DeviceControl, DeviceStatus, PowerState};
pub use registry::DeviceRegistry;
pub use simulated::SimulatedFleet;
pub use types::{Capabilities, Device, DeviceClass, DeviceId, DiscoveryEvent, FirmwareFamily, Telemetry};
