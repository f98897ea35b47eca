//! Periodic polling that keeps the registry truthful.
//!
//! Each cycle drains discovery events, queries every due device with bounded
//! fan-out and a per-device timeout, folds the results and any failed control
//! calls into the registry, then hands aggregate metrics to the state machine
//! and the history sink.
//! Cycles never overlap: a late cycle makes the next tick be skipped.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::PollConfig;
use crate::devices::control::with_timeout;
use crate::devices::{DeviceControl, DeviceId, DeviceRegistry, DeviceStatus, DiscoveryEvent};
use crate::error::DeviceError;
use crate::io::history::HistoryHandle;

use super::arbiter::CommandArbiter;
use super::metrics::FleetMetrics;
use super::state_machine::Transition;

/// What happened during one cycle.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub cycle: u64,
    pub polled: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Offline devices skipped by backoff.
    pub skipped: usize,
    /// Devices that went offline in this cycle.
    pub went_offline: Vec<DeviceId>,
    /// The cycle hit its deadline before every query returned.
    pub abandoned: bool,
    pub metrics: FleetMetrics,
    pub transitions: Vec<Transition>,
}

/// Poll schedule of one unreachable device.
#[derive(Debug, Clone, Copy, Default)]
struct Backoff {
    skip_remaining: u32,
}

/// Owner of the poll cycle.
pub struct ReconciliationLoop {
    registry: Arc<DeviceRegistry>,
    control: Arc<dyn DeviceControl>,
    arbiter: Arc<CommandArbiter>,
    poll: PollConfig,
    discovery: Option<mpsc::Receiver<DiscoveryEvent>>,
    sink: Option<HistoryHandle>,
    backoff: HashMap<DeviceId, Backoff>,
    cycle: u64,
}

impl ReconciliationLoop {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        control: Arc<dyn DeviceControl>,
        arbiter: Arc<CommandArbiter>,
        poll: PollConfig,
    ) -> Self {
        Self {
            registry,
            control,
            arbiter,
            poll,
            discovery: None,
            sink: None,
            backoff: HashMap::new(),
            cycle: 0,
        }
    }

    /// Consumes device add/remove events at the start of every cycle.
    pub fn with_discovery(mut self, rx: mpsc::Receiver<DiscoveryEvent>) -> Self {
        self.discovery = Some(rx);
        self
    }

    /// Sends a metrics snapshot to the persistence writer after every cycle.
    pub fn with_history_sink(mut self, sink: HistoryHandle) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Runs cycles on the poll interval until `shutdown` flips to `true` or
    /// its sender is dropped.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.poll.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval_ms = self.poll.interval_ms, "reconciliation loop started");

        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let report = self.run_cycle().await;
                    if report.abandoned {
                        warn!(cycle = report.cycle, "poll cycle hit its deadline");
                    }
                }
            }
        }
        info!(cycles = self.cycle, "reconciliation loop stopped");
    }

    /// Runs one full cycle.
    pub async fn run_cycle(&mut self) -> CycleReport {
        self.cycle += 1;
        let deadline = Instant::now() + self.poll.interval();

        self.drain_discovery();

        let mut due = Vec::new();
        let mut skipped = 0;
        for id in self.registry.ids() {
            match self.backoff.get_mut(&id) {
                Some(b) if b.skip_remaining > 0 => {
                    b.skip_remaining -= 1;
                    skipped += 1;
                }
                _ => due.push(id),
            }
        }

        let polled = due.len();
        let timeout = self.poll.device_timeout();
        let control = Arc::clone(&self.control);
        let mut results = futures::stream::iter(due.clone())
            .map(move |id| {
                let control = Arc::clone(&control);
                async move {
                    let result = with_timeout(timeout, control.query_status(&id)).await;
                    (id, result)
                }
            })
            .buffer_unordered(self.poll.max_concurrency.max(1));

        let mut succeeded = 0;
        let mut failed = 0;
        let mut went_offline = Vec::new();
        let mut answered = HashSet::new();
        let collect = async {
            while let Some((id, result)) = results.next().await {
                answered.insert(id.clone());
                match result {
                    Ok(status) => {
                        succeeded += 1;
                        self.on_success(&id, &status);
                    }
                    Err(e) => {
                        failed += 1;
                        if self.on_failure(&id, &e) {
                            went_offline.push(id);
                        }
                    }
                }
            }
        };
        let abandoned = tokio::time::timeout_at(deadline, collect).await.is_err();
        drop(results);

        // Queries still queued or in flight at the deadline count as timeouts.
        if abandoned {
            let error = DeviceError::Timeout(self.poll.interval_ms);
            for id in due.iter().filter(|id| !answered.contains(*id)) {
                failed += 1;
                if self.on_failure(id, &error) {
                    went_offline.push(id.clone());
                }
            }
        }

        // A successful poll clears last_error, so control failures go in last.
        let folded = self.registry.fold_control_failures();
        if folded > 0 {
            debug!(count = folded, "folded control failures");
        }

        let devices = self.registry.snapshot();
        let metrics =
            FleetMetrics::from_devices(&devices, self.poll.offline_after_failures, Utc::now());
        let transitions = self.arbiter.evaluate(&metrics).await;
        if let Some(sink) = &self.sink {
            sink.record_snapshot(&metrics);
        }
        debug!(cycle = self.cycle, %metrics, "poll cycle complete");

        CycleReport {
            cycle: self.cycle,
            polled,
            succeeded,
            failed,
            skipped,
            went_offline,
            abandoned,
            metrics,
            transitions,
        }
    }

    fn drain_discovery(&mut self) {
        let Some(rx) = self.discovery.as_mut() else {
            return;
        };
        while let Ok(event) = rx.try_recv() {
            if let DiscoveryEvent::Removed(id) = &event {
                self.backoff.remove(id);
            }
            self.registry.apply_discovery(event);
        }
    }

    fn on_success(&mut self, id: &DeviceId, status: &DeviceStatus) {
        self.registry.record_success(id, status, Utc::now());
        self.backoff.remove(id);
    }

    /// Returns `true` if the device went offline.
    fn on_failure(&mut self, id: &DeviceId, error: &DeviceError) -> bool {
        debug!(device = %id, %error, "poll failed");
        let threshold = self.poll.offline_after_failures;
        let went_offline = self.registry.record_failure(id, error, threshold);

        let failures = self
            .registry
            .get(id)
            .map_or(0, |d| d.telemetry.consecutive_failures);
        if failures >= threshold {
            let period = backoff_period(failures - threshold, self.poll.max_backoff_cycles);
            self.backoff.insert(
                id.clone(),
                Backoff {
                    skip_remaining: period - 1,
                },
            );
        }
        went_offline
    }
}

/// Cycles between polls of a device `misses` failures past the threshold:
/// `2^misses`, capped at `max_cycles` and never below one.
fn backoff_period(misses: u32, max_cycles: u32) -> u32 {
    let period = 1u32.checked_shl(misses).unwrap_or(u32::MAX);
    period.min(max_cycles).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_cap() {
        let periods: Vec<u32> = (0..6).map(|k| backoff_period(k, 4)).collect();
        assert_eq!(periods, vec![1, 2, 4, 4, 4, 4]);
        assert_eq!(backoff_period(40, 8), 8);
        assert_eq!(backoff_period(3, 0), 1);
    }
}
