//! Persistence of snapshots and commands, kept off the control path.
//!
//! The control core only holds a [`HistoryHandle`]: a bounded queue in front
//! of a writer thread that owns the actual [`HistorySink`]. A full queue drops
//! the record with a warning instead of blocking the caller.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::HistoryError;
use crate::fleet::command::Command;
use crate::fleet::metrics::FleetMetrics;

/// Column header of the snapshot CSV.
const SNAPSHOT_HEADER: &str = "timestamp,total,online,mining,unreachable,\
                               online_capacity_kw,active_power_kw,throughput_ths";

/// Column header of the command CSV.
const COMMAND_HEADER: &str = "seq,timestamp,source,kind,requested_kw,device,success,message";

/// Destination for history records.
pub trait HistorySink: Send {
    /// # Errors
    ///
    /// Returns a `HistoryError` if the record cannot be stored.
    fn record_snapshot(&mut self, metrics: &FleetMetrics) -> Result<(), HistoryError>;

    /// # Errors
    ///
    /// Returns a `HistoryError` if the record cannot be stored.
    fn record_command(&mut self, command: &Command) -> Result<(), HistoryError>;
}

/// Appends snapshots and commands to two CSV streams.
pub struct CsvHistorySink<S: Write, C: Write> {
    snapshots: Option<csv::Writer<S>>,
    commands: Option<csv::Writer<C>>,
}

impl CsvHistorySink<File, File> {
    /// Opens (or creates) the given files in append mode.
    ///
    /// A header row is written only to files that start out empty.
    ///
    /// # Errors
    ///
    /// Returns an `io::Error` if a file cannot be opened.
    pub fn open(snapshot_path: Option<&Path>, command_path: Option<&Path>) -> io::Result<Self> {
        let open = |path: &Path, header: &str| -> io::Result<csv::Writer<File>> {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            let fresh = file.metadata()?.len() == 0;
            let mut wtr = csv::WriterBuilder::new().from_writer(file);
            if fresh {
                wtr.write_record(header.split(',').map(str::trim))?;
                wtr.flush()?;
            }
            Ok(wtr)
        };
        Ok(Self {
            snapshots: snapshot_path.map(|p| open(p, SNAPSHOT_HEADER)).transpose()?,
            commands: command_path.map(|p| open(p, COMMAND_HEADER)).transpose()?,
        })
    }
}

impl<S: Write, C: Write> CsvHistorySink<S, C> {
    /// Writes to arbitrary writers, emitting headers immediately.
    ///
    /// # Errors
    ///
    /// Returns a `HistoryError` if a header cannot be written.
    pub fn from_writers(snapshots: S, commands: C) -> Result<Self, HistoryError> {
        let mut s = csv::WriterBuilder::new().from_writer(snapshots);
        s.write_record(SNAPSHOT_HEADER.split(',').map(str::trim))?;
        let mut c = csv::WriterBuilder::new().from_writer(commands);
        c.write_record(COMMAND_HEADER.split(',').map(str::trim))?;
        Ok(Self {
            snapshots: Some(s),
            commands: Some(c),
        })
    }

    /// Flushes and returns the underlying writers.
    pub fn into_inner(self) -> (Option<S>, Option<C>) {
        (
            self.snapshots.and_then(|w| w.into_inner().ok()),
            self.commands.and_then(|w| w.into_inner().ok()),
        )
    }
}

impl<S: Write + Send, C: Write + Send> HistorySink for CsvHistorySink<S, C> {
    fn record_snapshot(&mut self, m: &FleetMetrics) -> Result<(), HistoryError> {
        let Some(wtr) = self.snapshots.as_mut() else {
            return Ok(());
        };
        wtr.write_record(&[
            m.timestamp.to_rfc3339(),
            m.total_devices.to_string(),
            m.online_devices.to_string(),
            m.mining_devices.to_string(),
            m.unreachable_devices.to_string(),
            format!("{:.3}", m.online_capacity_kw),
            format!("{:.3}", m.active_power_kw),
            format!("{:.2}", m.throughput_ths),
        ])?;
        wtr.flush()?;
        Ok(())
    }

    fn record_command(&mut self, c: &Command) -> Result<(), HistoryError> {
        let Some(wtr) = self.commands.as_mut() else {
            return Ok(());
        };
        wtr.write_record(&[
            c.seq.to_string(),
            c.timestamp.to_rfc3339(),
            c.source.to_string(),
            c.kind.to_string(),
            c.requested_power_kw.map(|kw| format!("{kw:.3}")).unwrap_or_default(),
            c.device.as_ref().map(ToString::to_string).unwrap_or_default(),
            c.success.to_string(),
            c.message.clone(),
        ])?;
        wtr.flush()?;
        Ok(())
    }
}

/// Records kept by a [`MemoryHistorySink`].
#[derive(Debug, Default)]
pub struct MemoryHistory {
    pub snapshots: Vec<FleetMetrics>,
    pub commands: Vec<Command>,
}

/// In-memory sink; clones share the same storage.
#[derive(Debug, Clone, Default)]
pub struct MemoryHistorySink {
    store: Arc<Mutex<MemoryHistory>>,
}

impl MemoryHistorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot_count(&self) -> usize {
        self.store.lock().snapshots.len()
    }

    pub fn commands(&self) -> Vec<Command> {
        self.store.lock().commands.clone()
    }
}

impl HistorySink for MemoryHistorySink {
    fn record_snapshot(&mut self, metrics: &FleetMetrics) -> Result<(), HistoryError> {
        self.store.lock().snapshots.push(metrics.clone());
        Ok(())
    }

    fn record_command(&mut self, command: &Command) -> Result<(), HistoryError> {
        self.store.lock().commands.push(command.clone());
        Ok(())
    }
}

#[derive(Debug)]
enum HistoryRecord {
    Snapshot(FleetMetrics),
    Command(Command),
}

/// Non-blocking front of the history writer.
#[derive(Debug, Clone)]
pub struct HistoryHandle {
    tx: mpsc::Sender<HistoryRecord>,
}

impl HistoryHandle {
    pub fn record_snapshot(&self, metrics: &FleetMetrics) {
        self.enqueue(HistoryRecord::Snapshot(metrics.clone()), "snapshot");
    }

    pub fn record_command(&self, command: &Command) {
        self.enqueue(HistoryRecord::Command(command.clone()), "command");
    }

    fn enqueue(&self, record: HistoryRecord, what: &'static str) {
        match self.tx.try_send(record) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(record = what, "history queue full, dropping record");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(record = what, "history writer stopped, dropping record");
            }
        }
    }
}

/// Starts the writer on a blocking thread.
///
/// The writer exits once every [`HistoryHandle`] has been dropped and the
/// queue is drained.
pub fn spawn_history_writer(
    mut sink: Box<dyn HistorySink>,
    capacity: usize,
) -> (HistoryHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel(capacity.max(1));
    let task = tokio::task::spawn_blocking(move || {
        while let Some(record) = rx.blocking_recv() {
            let result = match &record {
                HistoryRecord::Snapshot(m) => sink.record_snapshot(m),
                HistoryRecord::Command(c) => sink.record_command(c),
            };
            if let Err(e) = result {
                warn!(error = %e, "history write failed");
            }
        }
    });
    (HistoryHandle { tx }, task)
}
