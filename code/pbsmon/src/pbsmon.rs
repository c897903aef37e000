/// `pbsmon` -- Collect PBS scheduler snapshots and report job statistics
///
/// `pbsmon collect` is meant to be run by cron or a systemd timer at a fixed interval (ten minutes
/// is typical).  Each run is one collection cycle; a run that finds the previous one still going
/// gives up at once and the next interval picks up where it left off.
///
/// `pbsmon stats` reads the store without locking it and can be run at any time, also while a
/// cycle is in progress.
///
/// Settings come from the built-in defaults, then a JSON config file (`--config-file`, or the file
/// named by $PBS_MONITOR_CONFIG), then the command line.
///
/// Logging goes to stderr and is controlled by RUST_LOG (default `info`); `--verbose` forces
/// `debug`.  Report output goes to stdout.
mod format;
mod report;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use pbslog::{MonitorError, PbsClient, Period, Store};
use rustutils::MonitorConfig;
use std::env;
use std::io;
use std::path::Path;
use std::process;
use std::str::FromStr;
use tracing::{error, info, warn};
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Log at debug level regardless of RUST_LOG
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print information about the program
    Version,

    /// Run one collection cycle: fetch node and job state, back it up, and store it
    Collect(CollectArgs),

    /// Print job counts per user and machine for a window of days
    Stats(StatsArgs),

    /// Rebuild the store from the raw backups, oldest first
    Replay(ReplayArgs),
}

#[derive(Args, Debug)]
pub struct ConfigArgs {
    /// JSON file with monitor settings [default: $PBS_MONITOR_CONFIG if set]
    #[arg(long)]
    config_file: Option<String>,

    /// Path of the SQLite database
    #[arg(long)]
    db_path: Option<String>,
}

#[derive(Args, Debug)]
pub struct CollectArgs {
    #[command(flatten)]
    config_args: ConfigArgs,

    /// Directory for the raw JSON backups
    #[arg(long)]
    backup_dir: Option<String>,

    /// Do not write raw JSON backups
    #[arg(long, default_value_t = false)]
    no_backup: bool,
}

#[derive(Args, Debug)]
pub struct StatsArgs {
    #[command(flatten)]
    config_args: ConfigArgs,

    /// Number of days to report, ending now, or `all` for the complete history
    #[arg(long, default_value = "7")]
    days: String,

    /// Only jobs owned by this user
    #[arg(long)]
    user: Option<String>,

    /// Only jobs that ran on this machine
    #[arg(long)]
    machine: Option<String>,

    /// Select fields and format, or `help` for the list
    #[arg(long)]
    fmt: Option<String>,
}

#[derive(Args, Debug)]
pub struct ReplayArgs {
    #[command(flatten)]
    config_args: ConfigArgs,

    /// Directory holding the raw JSON backups
    #[arg(long)]
    backup_dir: Option<String>,
}

const CONFIG_ENV: &str = "PBS_MONITOR_CONFIG";

fn main() {
    match pbsmon() {
        Ok(()) => {}
        Err(msg) => {
            eprintln!("ERROR: {}", msg);
            process::exit(1);
        }
    }
}

fn pbsmon() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Version => {
            println!("pbsmon version({})", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Commands::Collect(ref args) => collect(args),
        Commands::Stats(ref args) => stats(args),
        Commands::Replay(ref args) => replay(args),
    }
}

fn init_logging(verbose: bool) {
    let log_filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy()
    };
    tracing_subscriber::fmt()
        .with_env_filter(log_filter)
        .with_writer(io::stderr)
        .init();
}

fn collect(args: &CollectArgs) -> Result<()> {
    let mut config = load_config(&args.config_args)?;
    if let Some(ref dir) = args.backup_dir {
        config.backup_dir = dir.clone();
    }
    let backup_dir = if args.no_backup {
        None
    } else {
        Some(Path::new(&config.backup_dir))
    };
    let client = PbsClient::new(&config);
    match pbslog::run_cycle(
        &client,
        Path::new(&config.db_path),
        backup_dir,
        rustutils::now(),
    ) {
        Ok(_) => Ok(()),
        Err(e @ MonitorError::LockContention(_)) => {
            warn!("previous cycle still in progress, skipping this one");
            Err(e.into())
        }
        Err(e) => {
            error!("collection cycle failed: {e}");
            Err(e.into())
        }
    }
}

fn stats(args: &StatsArgs) -> Result<()> {
    let mut stdout = io::stdout();
    if format::maybe_help(&mut stdout, args.fmt.as_deref(), report::fmt_help)? {
        return Ok(());
    }
    let period = Period::from_str(&args.days)?;
    let config = load_config(&args.config_args)?;
    let store = Store::open_reader(&config.db_path)?;
    let report = pbslog::generate_report(
        &store,
        rustutils::now(),
        period,
        args.user.as_deref(),
        args.machine.as_deref(),
    )?;
    report::print_report(&mut stdout, &report, args.fmt.as_deref())
}

fn replay(args: &ReplayArgs) -> Result<()> {
    let mut config = load_config(&args.config_args)?;
    if let Some(ref dir) = args.backup_dir {
        config.backup_dir = dir.clone();
    }
    let summary = pbslog::replay_backups(
        Path::new(&config.db_path),
        Path::new(&config.backup_dir),
    )?;
    info!(
        cycles = summary.cycles,
        nodes = summary.nodes,
        jobs = summary.jobs,
        "store rebuilt from backups"
    );
    Ok(())
}

// Defaults, then the config file if there is one, then --db-path.

fn load_config(args: &ConfigArgs) -> Result<MonitorConfig> {
    let config_file = match args.config_file {
        Some(ref f) => Some(f.clone()),
        None => env::var(CONFIG_ENV).ok().filter(|f| !f.is_empty()),
    };
    let mut config = match config_file {
        Some(ref f) => rustutils::read_monitor_config(f)?,
        None => MonitorConfig::default(),
    };
    if let Some(ref p) = args.db_path {
        config.db_path = p.clone();
    }
    Ok(config)
}
