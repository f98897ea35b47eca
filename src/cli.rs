use std::env;
use std::path::PathBuf;

/// Parsed command-line options.
#[derive(Debug, Default)]
pub struct CliOptions {
    pub config: Option<PathBuf>,
    pub log_level: Option<String>,
    pub bind: Option<String>,
    pub seed: Option<u64>,
    /// Validate the configuration and exit.
    pub check: bool,
    pub help: bool,
}

pub fn parse_args() -> Result<CliOptions, String> {
    let args: Vec<String> = env::args().skip(1).collect();
    parse_args_from(args)
}

pub fn parse_args_from(args: Vec<String>) -> Result<CliOptions, String> {
    let mut opts = CliOptions::default();
    let mut i = 0usize;

    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                i += 1;
                let path = args.next_or_err(i, "missing value for --config (expected a TOML file path)")?;
                if opts.config.replace(PathBuf::from(path)).is_some() {
                    return Err("--config provided more than once".to_string());
                }
            }
            "--log-level" => {
                i += 1;
                let level = args.next_or_err(i, "missing value for --log-level (e.g. info, debug)")?;
                opts.log_level = Some(level.to_string());
            }
            "--bind" => {
                i += 1;
                let addr = args.next_or_err(i, "missing value for --bind (expected host:port)")?;
                opts.bind = Some(addr.to_string());
            }
            "--seed" => {
                i += 1;
                let raw = args.next_or_err(i, "missing value for --seed (expected a u64)")?;
                let seed = raw
                    .parse::<u64>()
                    .map_err(|_| format!("--seed value \"{raw}\" is not a valid u64"))?;
                opts.seed = Some(seed);
            }
            "--check" => opts.check = true,
            "--help" | "-h" => opts.help = true,
            other => return Err(format!("unknown argument: {other}")),
        }
        i += 1;
    }

    Ok(opts)
}

trait SliceArgExt {
    fn next_or_err(&self, index: usize, err: &str) -> Result<&str, String>;
}

impl SliceArgExt for [String] {
    fn next_or_err(&self, index: usize, err: &str) -> Result<&str, String> {
        self.get(index)
            .map(String::as_str)
            .ok_or_else(|| err.to_string())
    }
}

pub fn print_usage() {
    eprintln!("fleet-ems: power dispatch for a fleet of mining devices");
    eprintln!();
    eprintln!("Usage: fleet-ems [OPTIONS]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --config <path>       Load configuration from a TOML file");
    eprintln!("  --log-level <filter>  Log filter (default: info, or RUST_LOG)");
    eprintln!("  --bind <host:port>    Override api.bind");
    eprintln!("  --seed <u64>          Override simulator.seed");
    eprintln!("  --check               Validate the configuration and exit");
    eprintln!("  --help                Show this help message");
    eprintln!();
    eprintln!("Without --config the two-miner demo fleet is simulated.");
}
