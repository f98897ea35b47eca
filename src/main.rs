//! fleet-ems entry point: configuration, wiring, and the long-running tasks.

mod cli;

use std::path::Path;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use fleet_ems::config::{ConfigHandle, FleetConfig};
use fleet_ems::devices::{DeviceControl, DeviceRegistry, SimulatedFleet};
use fleet_ems::fleet::{CommandArbiter, ReconciliationLoop};
use fleet_ems::io::history::{CsvHistorySink, HistoryHandle, spawn_history_writer};

/// Discovery events buffered between the announcer and the loop.
const DISCOVERY_QUEUE: usize = 64;

fn init_logging(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_config(opts: &cli::CliOptions) -> FleetConfig {
    let mut config = match &opts.config {
        Some(path) => match FleetConfig::from_toml_file(Path::new(path)) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("{e}");
                process::exit(1);
            }
        },
        None => FleetConfig::demo(),
    };

    if let Some(seed) = opts.seed {
        config.simulator.seed = seed;
    }
    if let Some(bind) = &opts.bind {
        config.api.bind.clone_from(bind);
    }

    let errors = config.validate();
    if !errors.is_empty() {
        for e in &errors {
            eprintln!("{e}");
        }
        process::exit(1);
    }
    config
}

fn open_history(config: &FleetConfig) -> Option<(HistoryHandle, tokio::task::JoinHandle<()>)> {
    let h = &config.history;
    if h.snapshot_csv.is_none() && h.command_csv.is_none() {
        return None;
    }
    match CsvHistorySink::open(h.snapshot_csv.as_deref(), h.command_csv.as_deref()) {
        Ok(sink) => Some(spawn_history_writer(Box::new(sink), h.queue_capacity)),
        Err(e) => {
            warn!(error = %e, "history files unavailable, running without persistence");
            None
        }
    }
}

async fn run(config: FleetConfig) -> Result<(), String> {
    let events = config.seed_events().map_err(|e| e.to_string())?;

    let sim = Arc::new(
        SimulatedFleet::new(config.simulator.seed, config.simulator.noise_std)
            .with_settle(Duration::from_millis(config.simulator.settle_ms)),
    );
    for event in &events {
        sim.register(event);
    }
    let control: Arc<dyn DeviceControl> = sim;

    let registry = Arc::new(DeviceRegistry::new());
    let handle = ConfigHandle::new(config.runtime());
    let history = open_history(&config);

    let mut arbiter = CommandArbiter::new(
        Arc::clone(&registry),
        Arc::clone(&control),
        handle,
        &config,
    );
    if let Some((sink, _)) = &history {
        arbiter = arbiter.with_history_sink(sink.clone());
    }
    let arbiter = Arc::new(arbiter);

    let (discovery_tx, discovery_rx) = mpsc::channel(DISCOVERY_QUEUE.max(events.len()));
    for event in events {
        if discovery_tx.send(event).await.is_err() {
            return Err("discovery channel closed before startup".to_string());
        }
    }

    let mut reconcile = ReconciliationLoop::new(
        Arc::clone(&registry),
        control,
        Arc::clone(&arbiter),
        config.poll.clone(),
    )
    .with_discovery(discovery_rx);
    if let Some((sink, _)) = &history {
        reconcile = reconcile.with_history_sink(sink.clone());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let loop_task = tokio::spawn(reconcile.run(shutdown_rx.clone()));

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
        }
        let _ = shutdown_tx.send(true);
    });

    #[cfg(feature = "api")]
    {
        let addr = config
            .api
            .bind
            .parse()
            .map_err(|e| format!("api.bind {:?}: {e}", config.api.bind))?;
        let state = Arc::new(fleet_ems::api::AppState {
            arbiter: Arc::clone(&arbiter),
        });
        if let Err(e) = fleet_ems::api::serve(state, addr, shutdown_rx).await {
            error!(error = %e, "API server failed");
            return Err(format!("API server on {addr}: {e}"));
        }
    }

    if let Err(e) = loop_task.await {
        error!(error = %e, "reconciliation loop panicked");
    }
    drop(arbiter);
    // The writer exits once the last handle is gone.
    if let Some((sink, writer)) = history {
        drop(sink);
        let _ = writer.await;
    }
    info!("stopped");
    Ok(())
}

fn main() {
    let opts = match cli::parse_args() {
        Ok(opts) => opts,
        Err(e) => {
            eprintln!("error: {e}");
            cli::print_usage();
            process::exit(1);
        }
    };
    if opts.help {
        cli::print_usage();
        return;
    }

    init_logging(opts.log_level.as_deref());
    let config = load_config(&opts);
    if opts.check {
        println!(
            "configuration OK: {} device(s), {} class(es)",
            config.devices.len(),
            config.classes.len() + 1
        );
        return;
    }

    let rt = tokio::runtime::Runtime::new().unwrap_or_else(|e| {
        eprintln!("error: failed to create tokio runtime: {e}");
        process::exit(1);
    });
    if let Err(e) = rt.block_on(run(config)) {
        eprintln!("error: {e}");
        process::exit(1);
    }
}
