//! Error taxonomy for allocation, arbitration, and device control.

use thiserror::Error;

/// Failure of a single call through the Device Control Interface.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    /// The device did not answer or the connection was refused.
    #[error("device unreachable: {0}")]
    Unreachable(String),
    /// The device rejected our credentials.
    #[error("authentication failed: {0}")]
    AuthFailure(String),
    /// The device answered with something we could not interpret.
    #[error("malformed response: {0}")]
    ParseError(String),
    /// The per-call deadline elapsed.
    #[error("timed out after {0} ms")]
    Timeout(u64),
}

/// Fleet-level error kinds surfaced by the control core.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FleetError {
    /// Requested power is above what the online fleet can draw.
    #[error("requested {requested_kw:.2} kW exceeds rated capacity of {capacity_kw:.2} kW")]
    CapacityExceeded { requested_kw: f32, capacity_kw: f32 },

    /// There is no online device to allocate power to.
    #[error("no online devices available")]
    NoDevicesAvailable,

    /// Command refused because another source holds control or the fleet is faulted.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A device could not be polled or commanded.
    #[error("device {address} unreachable: {source}")]
    DeviceUnreachable {
        address: String,
        #[source]
        source: DeviceError,
    },

    /// Some planned device actions failed.
    #[error("{succeeded}/{attempted} device actions applied")]
    PartialApplyFailure { succeeded: usize, attempted: usize },

    /// Curve data is not monotonic in power; lookups fall back to nearest point.
    #[error("power curve for class {0} is not monotonic in power")]
    InconsistentCurve(String),

    /// The device class has no loaded curve.
    #[error("no power curve loaded for class {0}")]
    CurveUnavailable(String),
}

/// Result alias for fleet operations.
pub type FleetResult<T> = Result<T, FleetError>;

/// Failure of the persistence sink. Never reaches the control path.
#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("history i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("history csv: {0}")]
    Csv(#[from] csv::Error),
}
