//! rust_labexec command line interface.
//!
//! Runs a queue of measurements against devices, inspects finished records and
//! lists the built-in measurements.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use rust_labexec::config::{LoggingConfig, Settings};
use rust_labexec::data::ResultStore;
use rust_labexec::device::Device;
use rust_labexec::experiment::{ExecutionEngine, StopReason, TaskState, ToDo};
use rust_labexec::measurement::{MeasurementRegistry, Parameters};
use serde_json::Value;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rust_labexec")]
#[command(about = "Sequential measurement execution for devices under test", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Measure every device with one measurement
    Run {
        /// TOML configuration file; LABEXEC_* variables override it
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Device as `<id>:<type>`, repeatable
        #[arg(short, long = "device", required = true)]
        devices: Vec<String>,

        /// Registered measurement name
        #[arg(short, long, default_value = "DummyMeas")]
        measurement: String,

        /// Parameter override as `<name>=<value>`, repeatable
        #[arg(short, long = "param")]
        params: Vec<String>,

        /// Sweep one parameter as `<name>=<v1>,<v2>,...`
        #[arg(short, long)]
        sweep: Option<String>,

        /// Output directory, overrides the configuration
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Load finished records and list them
    Inspect {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// List registered measurements
    List,
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    if logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Parse `<id>:<type>`.
fn parse_device(arg: &str) -> Result<Device> {
    let (id, device_type) = arg
        .split_once(':')
        .ok_or_else(|| anyhow!("device '{arg}' must look like <id>:<type>"))?;
    if id.is_empty() || device_type.is_empty() {
        return Err(anyhow!("device '{arg}' has an empty id or type"));
    }
    Ok(Device::new(id, device_type))
}

/// JSON literal if it parses as one, plain string otherwise.
fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn parse_assignment(raw: &str) -> Result<(&str, &str)> {
    raw.split_once('=')
        .filter(|(name, _)| !name.is_empty())
        .ok_or_else(|| anyhow!("'{raw}' must look like <name>=<value>"))
}

fn sweep_rows(arg: &str) -> Result<Vec<Parameters>> {
    let (name, values) = parse_assignment(arg)?;
    Ok(values
        .split(',')
        .map(|v| Parameters::new().with(name, parse_value(v.trim())))
        .collect())
}

async fn run(
    config: Option<PathBuf>,
    devices: Vec<String>,
    measurement: String,
    params: Vec<String>,
    sweep: Option<String>,
    output: Option<PathBuf>,
) -> Result<()> {
    let mut settings = match &config {
        Some(path) => Settings::load_from(path),
        None => Settings::from_env(),
    }
    .context("Failed to load configuration")?;
    if let Some(dir) = output {
        settings.output.raw_output_path = dir;
    }
    init_tracing(&settings.logging);

    let registry = MeasurementRegistry::new();
    let mut overrides = Parameters::new();
    for raw in &params {
        let (name, value) = parse_assignment(raw)?;
        overrides.set(name, parse_value(value));
    }
    let rows = sweep.as_deref().map(sweep_rows).transpose()?;

    let mut engine = ExecutionEngine::new(settings);
    for arg in &devices {
        let device = parse_device(arg)?;
        let handle = registry.create(&measurement)?.with_parameters(&overrides);
        match &rows {
            Some(rows) => {
                engine.enqueue_sweep(&device, &handle, rows)?;
            }
            None => engine.enqueue(ToDo::new(device, handle)),
        }
    }
    info!(queued = engine.queue().len(), "Starting run");

    let report = engine.run().await?;
    for task in &report.executed {
        println!(
            "{:<10} {:<20} {:<24} {}",
            format!("{:?}", task.state),
            task.device_id,
            task.measurement,
            task.file_path.display()
        );
    }
    println!(
        "\n{} completed, {} failed, {} aborted; stopped: {:?}; {} left in queue",
        report.count(TaskState::Completed),
        report.count(TaskState::Failed),
        report.count(TaskState::Aborted),
        report.stop,
        engine.queue().len(),
    );
    if report.stop != StopReason::QueueEmpty && report.pause_requested {
        error!("Run stopped after a failed measurement");
        std::process::exit(1);
    }
    Ok(())
}

fn inspect(files: Vec<PathBuf>) -> Result<()> {
    init_tracing(&LoggingConfig::default());
    let mut store = ResultStore::new();
    for file in &files {
        if let Err(e) = store.load_file(file) {
            error!(file = %file.display(), "Could not load record: {e}");
        }
    }
    for stored in store.iter() {
        let device = &stored.record["device"];
        println!(
            "{:<28} {:<12} {:<12} {:<20} {}",
            stored.timestamp_iso_known,
            device["id"].as_str().unwrap_or_default(),
            device["type"].as_str().unwrap_or_default(),
            stored.name_known,
            stored.file_path.display()
        );
    }
    println!("\n{} of {} records loaded", store.len(), files.len());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            config,
            devices,
            measurement,
            params,
            sweep,
            output,
        } => run(config, devices, measurement, params, sweep, output).await,
        Command::Inspect { files } => inspect(files),
        Command::List => {
            for name in MeasurementRegistry::new().names() {
                println!("{name}");
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_device() {
        let d = parse_device("D7:ring").unwrap();
        assert_eq!(d.id, "D7");
        assert_eq!(d.device_type, "ring");
        assert!(parse_device("D7").is_err());
        assert!(parse_device(":ring").is_err());
    }

    #[test]
    fn test_sweep_rows_parse_json_values() {
        let rows = sweep_rows("number of points=5, 10,abc").unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].get("number of points"), Some(&Value::from(5)));
        assert_eq!(rows[1].get("number of points"), Some(&Value::from(10)));
        assert_eq!(
            rows[2].get("number of points"),
            Some(&Value::String("abc".into()))
        );
        assert!(sweep_rows("=1,2").is_err());
    }
}
