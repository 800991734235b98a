use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info};

use mcw_meter_cal::caldone::{CalDoneResult, run_cal_done};
use mcw_meter_cal::config::Config;
use mcw_meter_cal::init::initialize;
use mcw_meter_cal::operator::{AutoOperator, InquireOperator, Operator};
use mcw_meter_cal::orchestrator::{Orchestrator, RunOutcome};
use mcw_meter_cal::params::read_parameters;
use mcw_meter_cal::postcal::{ProgramRequest, ProgramStatus, current_yymm, run_programming};
use mcw_meter_cal::register::{MeterRating, MeterVariant};
use mcw_meter_cal::simulator::{BankSettings, SimulatedConnector};
use mcw_meter_cal::transport::Connector;

/// Calibrate electricity meter banks behind MCW/TCP gateways.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// YAML configuration file
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Number of meters on the bench, overrides the configuration
    #[arg(long, global = true)]
    meters: Option<u16>,

    /// Directory holding progress and report files
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    /// Talk to simulated meters instead of the gateways
    #[arg(long, global = true)]
    simulate: bool,

    /// Pass every operator gate without asking
    #[arg(long, short, global = true)]
    yes: bool,

    /// Append log output to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the current calibration group on every unfinished socket
    Calibrate,
    /// Show the bookmark, done flags and problematic meters
    Status,
    /// Send the gateway initialization commands
    Init,
    /// Read measurements back and check them against their limits
    ReadParams,
    /// Write and verify the cal-done flag
    CalDone,
    /// Program serial number, manufacture date and model code
    Program {
        /// First serial number, six digits
        #[arg(long)]
        serial_start: Option<String>,
        /// 100A or 80A
        #[arg(long)]
        rating: Option<MeterRating>,
        /// 2TS, MODBUS or MBUS
        #[arg(long)]
        variant: Option<MeterVariant>,
    },
}

fn init_logging(log_file: Option<&Path>) -> Result<()> {
    let env = env_logger::Env::default().default_filter_or("info");
    let mut builder = env_logger::Builder::from_env(env);
    builder.format_timestamp_millis();
    if let Some(path) = log_file {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("cannot open log file {}", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.init();
    Ok(())
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some(meters) = cli.meters {
        config.meter_count = meters;
    }
    if let Some(dir) = &cli.state_dir {
        config.state_dir = dir.clone();
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn operator(cli: &Cli) -> Box<dyn Operator> {
    if cli.yes {
        Box::new(AutoOperator)
    } else {
        Box::new(InquireOperator)
    }
}

fn status(config: &Config) -> Result<()> {
    let store = config.state_store();
    let plan = config.plan();
    let topology = config.topology()?;
    let mut progress = store.load_progress()?;
    progress.normalize(plan.group_count());
    let group = progress.group();

    println!("Plan:          {} ({} groups)", plan.name, plan.group_count());
    println!("Current group: {}/{}", group, plan.group_count());
    for socket in topology.sockets() {
        let state = if progress.is_done(group, socket) {
            "done"
        } else {
            "pending"
        };
        println!("  {:<24} {}", socket.to_string(), state);
    }
    let problematic = store.load_problematic()?;
    if problematic.is_empty() {
        println!("Problematic:   none");
    } else {
        let ids: Vec<String> = problematic.iter().map(|g| g.0.to_string()).collect();
        println!("Problematic:   {}", ids.join(", "));
    }
    Ok(())
}

fn dispatch<C: Connector>(cli: &Cli, config: &Config, mut connector: C) -> Result<()> {
    let store = config.state_store();
    match &cli.command {
        Command::Status => status(config)?,
        Command::Calibrate => {
            let mut orchestrator = Orchestrator::new(config, connector, operator(cli))?;
            match orchestrator.run()? {
                RunOutcome::Advanced { group, next } => {
                    println!("Group {group} complete. Run again for group {next}.")
                }
                RunOutcome::PlanComplete { group } => {
                    println!("Group {group} complete. Calibration plan finished.")
                }
                RunOutcome::Incomplete { group, pending } => {
                    let pending: Vec<String> = pending.iter().map(ToString::to_string).collect();
                    println!(
                        "Group {group} unfinished on {}. Run again to retry.",
                        pending.join(", ")
                    );
                }
            }
        }
        Command::Init => {
            let failed = initialize(config, &mut connector)?;
            println!(
                "Initialized {}/{} sockets",
                config.sockets.len() - failed.len(),
                config.sockets.len()
            );
        }
        Command::ReadParams => {
            let report = read_parameters(config, &mut connector, &store)?;
            let passed = report.values().filter(|m| m.pass).count();
            println!("{}/{} meters passed the parameter check", passed, report.len());
        }
        Command::CalDone => {
            let log = run_cal_done(config, &mut connector, &store)?;
            let confirmed = log
                .values()
                .filter(|r| r.result == CalDoneResult::CalSuccess)
                .count();
            println!("{}/{} meters confirmed cal done", confirmed, log.len());
        }
        Command::Program {
            serial_start,
            rating,
            variant,
        } => {
            let mut operator = operator(cli);
            let request = ProgramRequest::resolve(
                &mut operator,
                serial_start.as_deref(),
                *rating,
                *variant,
                current_yymm(),
            )?;
            let log = run_programming(config, &mut connector, &store, &request)?;
            let passed = log
                .meters
                .iter()
                .filter(|e| e.status == ProgramStatus::Pass)
                .count();
            println!("{} meters programmed", passed);
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_file.as_deref())?;

    let result = load_config(&cli).and_then(|config| {
        if cli.simulate {
            info!("Using simulated meters");
            let settings = BankSettings {
                meters: config.meters_per_socket,
                slave_id: config.slave_id,
                ..Default::default()
            };
            dispatch(&cli, &config, SimulatedConnector::new(settings))
        } else {
            dispatch(&cli, &config, config.tcp_connector())
        }
    });
    if let Err(e) = &result {
        error!("{e:#}");
    }
    result
}
