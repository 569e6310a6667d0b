use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use rtiocompiler_backend::SystemConfig;
use rtioexpctrl_backend::*;

/// Compile the default cycle of an RTIO configuration, check it against the core device
/// and stream it.
#[derive(Parser, Debug)]
#[command(name = "rtioexpctrl", version, about)]
struct Cli {
    /// Configuration file (defaults to rtio.toml in the working directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Repetitions to stream
    #[arg(long, default_value_t = 1)]
    nreps: usize,

    /// Overrides the configured log level
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compile and run the slack analysis
    Check,
    /// Compile, check and stream to the log
    Stream {
        /// Use long-lived stream workers instead of a one-shot stream
        #[arg(long)]
        workers: bool,
    },
}

fn run(cli: Cli) -> Result<()> {
    let mut cfg = SystemConfig::load(cli.config.as_deref())?;
    if let Some(level) = cli.log_level {
        cfg.logging.level = level;
    }
    init_logging(&cfg.logging)?;

    let mut exp = Experiment::from_config(&cfg)?;
    exp.schedule_default_cycle(&cfg)?;
    let (seq, report) = exp.check(None)?;
    tracing::info!(
        events = seq.len(),
        duration_s = seq.duration_s(),
        lanes_used = seq.lane_report.lanes_used,
        "sequence ready"
    );
    println!("{report}");

    match cli.command {
        Command::Check => Ok(()),
        Command::Stream { workers: false } => exp.stream_exp(&LogSink, cli.nreps),
        Command::Stream { workers: true } => {
            let mut workers = exp.spawn_workers(Arc::new(LogSink))?;
            workers.run(cli.nreps)?;
            workers.close()
        }
    }
}

fn main() {
    if let Err(e) = run(Cli::parse()) {
        tracing::error!(error = %e, "run failed");
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
