//! CLI entry point for reactor-daq
//!
//! Provides command-line access to:
//! - Running a procedure or single instruction against simulated hardware
//! - Checking a configuration file
//! - Computing pump rates from mixing ratios
//!
//! # Usage
//!
//! ```bash
//! reactor_daq simulate --procedure demos/procedure.json --positions demos/stage_positions.csv --immediate
//! reactor_daq check-config config/reactor.toml
//! reactor_daq rates -p 3 -g 0.5 -r 12.5
//! ```
//!
//! Simulation prints one JSON object per line on stdout: the acknowledgement,
//! a status after every step and every collected spectrum. Logs go to stderr.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use reactor_daq::config::{ReactorConfig, DEFAULT_CONFIG_PATH};
use reactor_daq::flow::{FlowRates, FlowReactor, FlowTiming};
use reactor_daq::hardware::mock::MockDevices;
use reactor_daq::instruction::Instruction;
use reactor_daq::logging;
use reactor_daq::run_state::AdvanceStatus;
use reactor_daq::spectrum::SpectrumPoll;
use serde::Serialize;
use tracing::{info, warn};

/// Positions used when neither the CLI nor the config names a file.
const DEMO_STAGE_POSITIONS: [f64; 3] = [10.0, 20.0, 30.0];

#[derive(Parser)]
#[command(name = "reactor_daq")]
#[command(about = "Flow reactor orchestration with simulated hardware", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an instruction file to completion on mock devices
    Simulate {
        /// JSON instruction (procedure or single instruction)
        #[arg(long)]
        procedure: PathBuf,

        /// Configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// Stage positions CSV; overrides the configured file
        #[arg(long)]
        positions: Option<PathBuf>,

        /// Skip settling delays
        #[arg(long)]
        immediate: bool,
    },

    /// Load and validate a configuration file, then print it
    CheckConfig {
        /// Configuration file
        #[arg(default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },

    /// Compute pump rates from mixing ratios
    Rates {
        /// Precursor to second-liquid ratio
        #[arg(short = 'p', long)]
        precursor_ratio: f64,

        /// Gas to liquid ratio
        #[arg(short = 'g', long)]
        gas_liquid_ratio: f64,

        /// Net flow rate in µL/min
        #[arg(short = 'r', long)]
        net_flow_rate: f64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate {
            procedure,
            config,
            positions,
            immediate,
        } => simulate(&procedure, &config, positions, immediate).await,
        Commands::CheckConfig { config } => check_config(&config),
        Commands::Rates {
            precursor_ratio,
            gas_liquid_ratio,
            net_flow_rate,
        } => {
            let rates = FlowRates::from_ratios(precursor_ratio, gas_liquid_ratio, net_flow_rate);
            print_json(&rates)
        }
    }
}

fn load_config(path: &Path) -> Result<ReactorConfig> {
    let config = ReactorConfig::load_from(path)
        .with_context(|| format!("loading {}", path.display()))?;
    config.validate().map_err(|e| anyhow!(e))?;
    Ok(config)
}

fn check_config(path: &Path) -> Result<()> {
    let config = load_config(path)?;
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

async fn simulate(
    procedure: &Path,
    config_path: &Path,
    positions: Option<PathBuf>,
    immediate: bool,
) -> Result<()> {
    let config = load_config(config_path)?;
    logging::init_from_config(&config).map_err(|e| anyhow!(e))?;

    let mut settings = config.flow_settings();
    if immediate {
        settings.timing = FlowTiming::immediate();
    }
    let mocks = MockDevices::new();
    let reactor = FlowReactor::flow(config.identity(), mocks.devices(), settings);

    match positions.or_else(|| config.calibration.stage_positions_file.clone()) {
        Some(path) => reactor
            .load_stage_positions(&path)
            .with_context(|| format!("loading stage positions from {}", path.display()))?,
        None => {
            warn!(positions = ?DEMO_STAGE_POSITIONS, "No stage positions file, using demo positions");
            reactor.set_stage_positions(DEMO_STAGE_POSITIONS.to_vec())?;
        }
    }
    if let (Some(blank), Some(dark)) = (&config.calibration.blank_file, &config.calibration.dark_file) {
        reactor.load_blank_and_dark(blank, dark).await?;
    }

    let text = tokio::fs::read_to_string(procedure)
        .await
        .with_context(|| format!("reading {}", procedure.display()))?;
    let instruction = Instruction::from_json(&text)?;
    let ack = reactor.new_instruction(&instruction).await?;
    print_json(&serde_json::json!({ "ack": ack.message() }))?;
    if !ack.is_accepted() {
        return Ok(());
    }

    tokio::select! {
        result = drive(&reactor) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, stopping run");
            reactor.stop().await;
        }
    }
    drain_spectra(&reactor).await?;
    print_json(&reactor.get_status().await)
}

/// Advance until the run is over, reporting after every step.
async fn drive(reactor: &FlowReactor) -> Result<()> {
    loop {
        let status = reactor.advance().await?;
        info!(%status, "Advanced");
        drain_spectra(reactor).await?;
        print_json(&reactor.get_status().await)?;
        match status {
            AdvanceStatus::NextStepInitiated => continue,
            AdvanceStatus::SingleInstructionInitiated => {
                reactor.stop().await;
                return Ok(());
            }
            _ => return Ok(()),
        }
    }
}

async fn drain_spectra(reactor: &FlowReactor) -> Result<()> {
    while let SpectrumPoll::Record(record) = reactor.get_spectrum(false, Duration::ZERO).await {
        print_json(&record)?;
    }
    Ok(())
}
