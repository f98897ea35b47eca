//! Power dispatch core for a fleet of cryptocurrency mining devices.
//!
//! An external energy-management system asks for an aggregate power draw;
//! the crate turns it into per-device on/off and frequency settings, keeps a
//! polled view of every device, and tracks the fleet through its activation
//! lifecycle.

/// HTTP adapter (feature `api`).
#[cfg(feature = "api")]
pub mod api;
pub mod config;
/// Frequency/power curves.
pub mod curve;
pub mod devices;
pub mod error;
pub mod fleet;
pub mod io;
