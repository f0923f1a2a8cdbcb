//! # rt-harness
//!
//! Command-line front end of the harness.
//!
//! ```text
//! rt-harness PROCNAME [--mode jitter|multi|pipeline] [--config FILE]
//!                     [--period-ms N] [--wait sleep|overrun]
//!                     [--input FILE] [--output FILE] [--stop-at-eof]
//!                     [--priority N] [--cpu N] [--lock-memory]
//! ```
//!
//! | Mode       | What runs                                                |
//! |------------|----------------------------------------------------------|
//! | `jitter`   | One periodic task with the integration load              |
//! | `multi`    | Three periodic tasks at priorities 20 / 50 / 75          |
//! | `pipeline` | Sensor → processing → storage over two bounded queues    |
//!
//! Settings come from the config file (if any), then from flags. The run
//! ends on SIGINT/SIGTERM, or when the pipeline input runs out with
//! `--stop-at-eof`.

use std::path::PathBuf;
use std::process;
use std::thread;

use anyhow::{bail, Context};
use clap::error::{ContextKind, ContextValue, ErrorKind};
use clap::{ArgAction, Parser};
use tracing::{error, info, warn};

use rt_harness::arch::linux::{self, TerminationSignals};
use rt_harness::config::{HarnessConfig, Mode};
use rt_harness::launch::launch;
use rt_harness::logging;
use rt_harness::runtime::Runtime;
use rt_harness::scheduler::WaitMode;

#[derive(Parser, Debug)]
#[command(name = "rt-harness", version, about = "Periodic real-time task harness")]
struct Cli {
    /// Process name, echoed in every log line
    procname: String,

    /// Task set to run
    #[arg(long, value_enum)]
    mode: Option<Mode>,

    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Activation period in milliseconds
    #[arg(long = "period-ms")]
    period_ms: Option<u64>,

    /// Wait primitive: absolute sleep or overrun-counting timer
    #[arg(long, value_enum)]
    wait: Option<WaitMode>,

    /// Pipeline input file
    #[arg(long)]
    input: Option<PathBuf>,

    /// Pipeline output file (truncated at start)
    #[arg(long)]
    output: Option<PathBuf>,

    /// Stop the pipeline once the input is exhausted
    #[arg(long = "stop-at-eof", action = ArgAction::SetTrue)]
    stop_at_eof: bool,

    /// Run tasks under SCHED_FIFO at this priority (1-99)
    #[arg(long)]
    priority: Option<u8>,

    /// Pin every task to this core
    #[arg(long)]
    cpu: Option<usize>,

    /// Lock all pages in memory before starting tasks
    #[arg(long = "lock-memory", action = ArgAction::SetTrue)]
    lock_memory: bool,

    /// Warn about activations later than this many milliseconds
    #[arg(long = "lag-warning-ms")]
    lag_warning_ms: Option<u64>,

    /// Increase verbosity (-v, -vv)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    verbosity: u8,
}

impl Cli {
    /// Load the config file (or defaults) and apply flag overrides.
    fn resolve_config(&self) -> anyhow::Result<HarnessConfig> {
        let mut config = match &self.config {
            Some(path) => HarnessConfig::load(path)
                .with_context(|| format!("loading config {}", path.display()))?,
            None => HarnessConfig::default(),
        };

        if let Some(mode) = self.mode {
            config.mode = mode;
        }
        if let Some(period_ms) = self.period_ms {
            config.period_ms = period_ms;
        }
        if let Some(wait) = self.wait {
            config.wait_mode = wait;
        }
        if let Some(input) = &self.input {
            config.pipeline.input = input.clone();
        }
        if let Some(output) = &self.output {
            config.pipeline.output = output.clone();
        }
        if self.stop_at_eof {
            config.pipeline.stop_at_end_of_input = true;
        }
        if self.priority.is_some() {
            config.priority = self.priority;
        }
        if self.cpu.is_some() {
            config.cpu = self.cpu;
        }
        if self.lock_memory {
            config.lock_memory = true;
        }
        if self.lag_warning_ms.is_some() {
            config.lag_warning_ms = self.lag_warning_ms;
        }

        config.validate()?;
        Ok(config)
    }

    fn log_level(&self) -> tracing::Level {
        match self.verbosity {
            0 => tracing::Level::INFO,
            1 => tracing::Level::DEBUG,
            _ => tracing::Level::TRACE,
        }
    }
}

/// Argument-count mistakes (no PROCNAME, or more than one) get the short
/// usage line and exit -1; anything else keeps clap's own report.
fn is_usage_error(err: &clap::Error) -> bool {
    match err.kind() {
        ErrorKind::MissingRequiredArgument => true,
        // An extra positional, not a misspelled flag.
        ErrorKind::UnknownArgument => matches!(
            err.get(ContextKind::InvalidArg),
            Some(ContextValue::String(arg)) if !arg.starts_with('-')
        ),
        _ => false,
    }
}

fn parse_cli() -> Cli {
    match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if is_usage_error(&e) => {
            let program = std::env::args().next().unwrap_or_else(|| "rt-harness".into());
            println!("Usage: {program} PROCNAME, where PROCNAME is a string");
            process::exit(-1);
        }
        Err(e) => e.exit(),
    }
}

fn main() -> anyhow::Result<()> {
    let cli = parse_cli();

    // Must precede every thread spawn so tasks inherit the blocked mask.
    let signals = TerminationSignals::block().context("blocking termination signals")?;
    logging::init(cli.log_level())?;

    let config = cli.resolve_config()?;
    if config.lock_memory {
        linux::lock_memory().context("locking memory")?;
    }

    info!(
        process = %cli.procname,
        mode = ?config.mode,
        period_ms = config.period_ms,
        wait_mode = ?config.wait_mode,
        "harness starting"
    );

    let mut runtime = Runtime::new(cli.procname.clone());
    let shutdown = runtime.shutdown_token();
    thread::Builder::new()
        .name("signals".into())
        .spawn(move || match signals.wait() {
            Ok(signal) => {
                info!(%signal, "termination requested");
                shutdown.cancel();
            }
            Err(e) => error!(error = %e, "signal wait failed"),
        })
        .context("spawning signal thread")?;

    launch(&mut runtime, &config).context("starting tasks")?;

    // Returns once every task is done (end of input, or all failed) or the
    // signal thread cancelled the token; the latter closes every queue.
    let reports = runtime.wait_for_exit();

    let failed = reports.iter().filter(|r| r.result.is_err()).count();
    for report in &reports {
        if let Err(e) = &report.result {
            warn!(task = %report.name, error = %e, "task ended with error");
        }
    }
    info!(tasks = reports.len(), failed, "harness stopped");

    if failed > 0 {
        bail!("{failed} task(s) ended with an error");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_defaults() {
        let cli = Cli::try_parse_from([
            "rt-harness",
            "proc",
            "--mode",
            "pipeline",
            "--period-ms",
            "20",
            "--wait",
            "overrun",
            "--input",
            "in.txt",
            "--stop-at-eof",
            "--cpu",
            "0",
        ])
        .unwrap();
        let config = cli.resolve_config().unwrap();

        assert_eq!(cli.procname, "proc");
        assert_eq!(config.mode, Mode::Pipeline);
        assert_eq!(config.period_ms, 20);
        assert_eq!(config.wait_mode, WaitMode::OverrunCounting);
        assert_eq!(config.pipeline.input, PathBuf::from("in.txt"));
        assert!(config.pipeline.stop_at_end_of_input);
        assert_eq!(config.cpu, Some(0));
        assert_eq!(config.priority, None);
    }

    #[test]
    fn test_missing_procname_is_usage_error() {
        let err = Cli::try_parse_from(["rt-harness"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
        assert!(is_usage_error(&err));
    }

    #[test]
    fn test_extra_positional_is_usage_error() {
        let err = Cli::try_parse_from(["rt-harness", "proc", "extra"]).unwrap_err();
        assert!(is_usage_error(&err));
    }

    #[test]
    fn test_unknown_flag_keeps_clap_report() {
        let err = Cli::try_parse_from(["rt-harness", "proc", "--bogus"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownArgument);
        assert!(!is_usage_error(&err));
    }

    #[test]
    fn test_zero_period_flag_rejected() {
        let cli = Cli::try_parse_from(["rt-harness", "p", "--period-ms", "0"]).unwrap();
        assert!(cli.resolve_config().is_err());
    }

    #[test]
    fn test_config_file_then_flags() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("harness.toml");
        std::fs::write(&path, "mode = \"multi\"\nperiod_ms = 50\n").unwrap();

        let cli = Cli::try_parse_from([
            "rt-harness",
            "p",
            "--config",
            path.to_str().unwrap(),
            "--period-ms",
            "25",
        ])
        .unwrap();
        let config = cli.resolve_config().unwrap();
        assert_eq!(config.mode, Mode::Multi);
        assert_eq!(config.period_ms, 25);
    }
}
