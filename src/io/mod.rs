//! Input/output: persistence of snapshots and command history.

pub mod history;
