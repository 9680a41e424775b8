use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use chrono::Local;
use clap::{ArgAction, Parser};
use controller::{
    CancelLevel, CancelToken, ChamberConfig, ControlContext, CsvLog, CycleConfig, CycleScheduler,
    Fanout, JsonlTrace, LogAlert, RunOutcome, TickSink,
};
use sim::{PlantParams, Scenario, SimChamber};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "tacc",
    version,
    about = "Thermal cycling of detector modules in the cold chamber (simulated instruments)"
)]
struct Args {
    /// Modules to cycle (1-4). None selects all four.
    modules: Vec<u8>,

    /// Number of cycles
    #[arg(short = 'n', long, default_value_t = 10)]
    cycles: u32,

    /// Minimum and maximum cycle temperature (°C)
    #[arg(
        short = 't',
        long = "temp-range",
        num_args = 2,
        value_names = ["MIN", "MAX"],
        default_values_t = [-40.0, 45.0],
        allow_negative_numbers = true
    )]
    temperatures: Vec<f64>,

    /// Chamber tuning file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory for the interlock CSV log
    #[arg(long, default_value = ".")]
    log_dir: PathBuf,

    /// Also write every tick record as JSON lines to stdout
    #[arg(long)]
    trace: bool,

    #[arg(long, default_value_t = Scenario::Nominal)]
    scenario: Scenario,

    /// RNG seed for the simulated probes
    #[arg(long, default_value_t = 12345)]
    seed: u64,

    /// Run the simulated chamber this many times faster than real time
    #[arg(long)]
    pace: Option<f64>,

    /// More log output (-v info, -vv debug)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

/// First Ctrl+C asks for an orderly stop, the second abandons waits.
fn spawn_signal_listener(cancel: CancelToken) -> Result<()> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building signal runtime")?;
    thread::Builder::new()
        .name("ctrl-c".into())
        .spawn(move || {
            rt.block_on(async {
                while tokio::signal::ctrl_c().await.is_ok() {
                    match cancel.request() {
                        CancelLevel::Immediate => {
                            warn!("second interrupt, shutting down now");
                            break;
                        }
                        _ => warn!("interrupt, finishing the current tick then shutting down"),
                    }
                }
            })
        })
        .context("spawning signal listener")?;
    Ok(())
}

fn main() -> Result<ExitCode> {
    let args = Args::parse();
    init_logging(args.verbose);

    let (min, max) = match args.temperatures[..] {
        [min, max] => (min, max),
        _ => anyhow::bail!("expected two temperatures"),
    };
    let cycle = CycleConfig::new(min, max, args.cycles, args.modules.iter().copied())?;
    let chamber_cfg = match &args.config {
        Some(path) => ChamberConfig::load_from(path)?,
        None => ChamberConfig::default(),
    };

    let chamber = SimChamber::new(cycle.modules().iter().copied(), PlantParams::default(), args.seed);
    args.scenario.apply(&chamber);
    info!(scenario = %args.scenario, seed = args.seed, "simulated chamber ready");

    let clock = match args.pace {
        Some(speedup) => chamber.clock().paced(speedup),
        None => chamber.clock(),
    };

    let csv = CsvLog::create(&args.log_dir, Local::now())
        .with_context(|| format!("creating log in {}", args.log_dir.display()))?;
    info!(path = %csv.path().display(), "logging ticks");
    let mut sinks: Vec<Box<dyn TickSink>> = vec![Box::new(csv)];
    if args.trace {
        sinks.push(Box::new(JsonlTrace::new(io::stdout())));
    }

    let cancel = CancelToken::new();
    spawn_signal_listener(cancel.clone())?;

    let ctx = ControlContext::new(
        chamber.instruments(),
        &chamber_cfg,
        Arc::new(clock),
        cancel,
        Box::new(Fanout(sinks)),
        Box::new(LogAlert),
    )?;
    let mut scheduler = CycleScheduler::new(cycle, chamber_cfg, ctx)?;
    let report = scheduler.run().context("control run failed")?;

    info!(report = %serde_json::to_string(&report)?, "done");
    Ok(match report.outcome {
        RunOutcome::Completed => {
            warn!("{} cycles completed", report.cycles_completed);
            ExitCode::SUCCESS
        }
        RunOutcome::Tripped(cause) => {
            error!(%cause, cycles = report.cycles_completed, "run tripped");
            ExitCode::from(2)
        }
        RunOutcome::Aborted => {
            warn!(cycles = report.cycles_completed, "run aborted by operator");
            ExitCode::from(130)
        }
    })
}
