//! CLI entry point for thermolog.
//!
//! # Usage
//!
//! Log until Enter is pressed, using the simulated bus:
//! ```bash
//! thermolog run --sim
//! ```
//!
//! Log for a fixed time against a custom configuration:
//! ```bash
//! thermolog --config bench.toml run --sim --duration 60
//! ```
//!
//! Validate a configuration without touching any bus:
//! ```bash
//! thermolog --config bench.toml check-config
//! ```

use std::io::{self, BufRead};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};

use thermolog::bus::I2cBus;
use thermolog::config::{self, Settings};
use thermolog::framework::Framework;
use thermolog::sim::{SimBus, SimProfile};
use thermolog::telemetry;

#[derive(Parser)]
#[command(name = "thermolog")]
#[command(about = "Concurrent MCP342x temperature logging over a shared I2C bus", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Acquire and log until stopped
    Run {
        /// Stop after this many seconds instead of waiting for Enter
        #[arg(long)]
        duration: Option<f64>,

        /// Use the simulated bus instead of real hardware
        #[arg(long)]
        sim: bool,
    },

    /// Load and validate the configuration, then exit
    CheckConfig,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init(&cli.log_level).map_err(anyhow::Error::msg)?;

    let settings = Settings::load_from(&cli.config)?;

    match cli.command {
        Commands::Run { duration, sim } => run(settings, duration, sim),
        Commands::CheckConfig => check_config(&settings),
    }
}

fn run(settings: Settings, duration: Option<f64>, sim: bool) -> Result<()> {
    if let Some(secs) = duration {
        if !secs.is_finite() || secs < 0.0 {
            anyhow::bail!("Invalid duration {}. Must be a non-negative number of seconds", secs);
        }
    }

    let backend: Box<dyn I2cBus> = if sim {
        Box::new(sim_backend(&settings))
    } else {
        anyhow::bail!(
            "no hardware I2C backend is built into this binary; \
             rerun with --sim or embed thermolog as a library with your bus implementation"
        );
    };

    let mut framework = Framework::new(settings, backend)?;
    framework.create()?;
    let log_path = framework
        .log_path()
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    framework.start()?;

    println!("Logging {} sensors to '{}'", framework.addresses().len(), log_path);
    match duration {
        Some(secs) => {
            println!("Running for {} s", secs);
            thread::sleep(Duration::from_secs_f64(secs));
        }
        None => {
            println!("Press Enter to stop");
            let mut line = String::new();
            io::stdin().lock().read_line(&mut line)?;
        }
    }

    framework.teardown()?;
    println!("Log written to '{}'", log_path);
    Ok(())
}

fn check_config(settings: &Settings) -> Result<()> {
    settings.validate().map_err(anyhow::Error::msg)?;
    println!("Configuration OK");
    println!("Sample period: {} s", settings.log.sample_period_s);
    println!("Display unit: {}", settings.display.unit.suffix());
    for sensor in settings.enabled_sensors() {
        if let Some(mode) = sensor.conversion_mode() {
            println!(
                "  channel {} at {:#04x}: {} bits, {} Hz",
                sensor.channel,
                sensor.address(),
                mode.bits,
                mode.rate_hz
            );
        }
    }
    Ok(())
}

/// One simulated sensor per enabled channel, each with its own noise seed so
/// the traces differ but a given configuration replays identically.
fn sim_backend(settings: &Settings) -> SimBus {
    let mut bus = SimBus::new();
    for sensor in settings.enabled_sensors() {
        let address = sensor.address();
        bus = bus.with_sensor(address, SimProfile::ambient(u64::from(address)));
    }
    bus
}
