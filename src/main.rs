//! `stripscan` command line.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use stripscan::config::BenchConfig;
use stripscan::controller::CalibrationOutcome;
use stripscan::geometry::{Padfile, Position};
use stripscan::hardware::sim::SimBench;
use stripscan::hardware::DriverRegistry;
use stripscan::measurement::MeasurementRegistry;
use stripscan::sequence::{
    validate_sequence, ItemState, RunOptions, Sequence, SequenceRunner, SequenceStrategy,
};
use stripscan::station::Station;
use stripscan::writer::JsonWriter;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "stripscan")]
#[command(about = "Automated strip sensor characterization bench", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Bench configuration (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level, overridden by RUST_LOG
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Log JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    /// Use the simulated bench instead of real hardware
    #[arg(long, global = true)]
    simulate: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Run a sequence
    Run {
        /// Sequence definition (YAML)
        sequence: PathBuf,

        /// Sensor padfile
        #[arg(short, long)]
        padfile: PathBuf,

        /// Operator name
        #[arg(short, long)]
        operator: String,

        /// Output directory
        #[arg(short = 'O', long)]
        output: PathBuf,

        /// Sensor name
        #[arg(long, default_value = "")]
        sensor_name: String,

        /// Sensor type
        #[arg(long, default_value = "")]
        sensor_type: String,
    },

    /// Check a sequence against a padfile without hardware
    Validate {
        /// Sequence definition (YAML)
        sequence: PathBuf,

        /// Sensor padfile
        #[arg(short, long)]
        padfile: PathBuf,
    },

    /// Calibrate a stage
    Calibrate {
        /// Stage to calibrate
        #[arg(value_enum)]
        target: Stage,
    },

    /// Print an environment box snapshot
    Environ,

    /// Print the effective configuration
    Config,
}

#[derive(Clone, Copy, ValueEnum)]
enum Stage {
    Table,
    Needle,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    stripscan::logging::init(&cli.log_level, cli.json_logs)?;
    let config = load_config(cli.config.as_deref(), cli.simulate)?;

    match cli.command {
        Command::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
        Command::Validate { sequence, padfile } => {
            let sequence = Sequence::load(&sequence)?;
            let padfile = Padfile::load(&padfile)?;
            validate_sequence(&sequence, &padfile, &MeasurementRegistry::builtin())?;
            println!("{}: ok", sequence.name);
            Ok(())
        }
        Command::Environ => {
            let mut station = open_station(&config, cli.simulate)?;
            let snapshot = station.environ().refresh();
            station.shutdown();
            println!("{}", serde_json::to_string_pretty(&snapshot?)?);
            Ok(())
        }
        Command::Calibrate { target } => {
            let mut station = open_station(&config, cli.simulate)?;
            let outcome = calibrate(&station, target);
            station.shutdown();
            match outcome? {
                CalibrationOutcome::Completed => println!("calibration completed"),
                CalibrationOutcome::Aborted => println!("calibration aborted"),
            }
            Ok(())
        }
        Command::Run {
            sequence,
            padfile,
            operator,
            output,
            sensor_name,
            sensor_type,
        } => {
            let sequence = Sequence::load(&sequence)
                .with_context(|| format!("failed to load sequence {}", sequence.display()))?;
            let padfile = Padfile::load(&padfile)
                .with_context(|| format!("failed to load padfile {}", padfile.display()))?;
            let options = RunOptions {
                operator,
                sensor_name,
                sensor_type,
                output_dir: Some(output.clone()),
            };
            run(&config, cli.simulate, sequence, padfile, options, output)
        }
    }
}

fn load_config(path: Option<&Path>, simulate: bool) -> Result<BenchConfig> {
    let mut config = BenchConfig::load(path).context("failed to load configuration")?;
    if simulate {
        config.resources = SimBench::resources();
    }
    Ok(config)
}

fn open_station(config: &BenchConfig, simulate: bool) -> Result<Station> {
    let registry = if simulate {
        SimBench::new().registry()
    } else {
        DriverRegistry::with_builtin()
    };
    Ok(Station::new(registry, config)?)
}

fn calibrate(station: &Station, stage: Stage) -> Result<CalibrationOutcome> {
    let outcome = match stage {
        Stage::Table => match station.table() {
            Some(table) => table.calibrate()?.wait()?,
            None => bail!("no table configured"),
        },
        Stage::Needle => match station.needle() {
            Some(needle) => needle.calibrate()?.wait()?,
            None => bail!("no needle stage configured"),
        },
    };
    Ok(outcome)
}

fn run(
    config: &BenchConfig,
    simulate: bool,
    sequence: Sequence,
    padfile: Padfile,
    options: RunOptions,
    output: PathBuf,
) -> Result<()> {
    let station = open_station(config, simulate)?;
    let alignment = config.alignment_points().or_else(|| {
        // The simulated table follows design coordinates.
        simulate.then(|| design_alignment(&padfile)).flatten()
    });

    let mut strategy = SequenceStrategy::new(
        station,
        config.sequence.clone(),
        MeasurementRegistry::builtin(),
    );
    strategy.set_padfile(padfile);
    strategy.set_alignment(alignment);
    strategy.add_writer(JsonWriter::new(output));

    let runner = SequenceRunner::start(strategy, sequence, options)?;
    let completed = runner.join()?;
    completed.strategy.into_station().shutdown();
    let report = completed.result?;

    for (key, state) in &report.states {
        if *state != ItemState::Ignored {
            println!("{state:>10}  {key}");
        }
    }
    info!(run_id = %report.run_id, "run complete");
    if let Some(err) = report.error {
        bail!("run failed: {err}");
    }
    if report.aborted {
        warn!("run aborted");
    }
    Ok(())
}

fn design_alignment(padfile: &Padfile) -> Option<[Position; 3]> {
    match padfile.references().as_slice() {
        [a, b, c, ..] => Some([a.position(), b.position(), c.position()]),
        _ => None,
    }
}
