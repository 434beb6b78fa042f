//! CLI entry point for the LAPPD HV controller.
//!
//! Thin front end over [`lappd_hv::controller::SequencingController`]: one
//! subcommand per operation, progress events printed while a ramp runs.
//! With `debug = true` in the settings file, commands go to the in-memory
//! simulated crate; a hardware transport backend plugs in behind the same
//! device interface.
//!
//! # Usage
//!
//! ```bash
//! lappd-hv --config config/hv.toml on 1
//! lappd-hv --config config/hv.toml status 1
//! lappd-hv --config config/hv.toml emergency-off
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use lappd_hv::config::Settings;
use lappd_hv::controller::{SequenceOutcome, SequencingController, Status};
use lappd_hv::device::{DeviceInterface, SimCrate};
use lappd_hv::events::SequenceEventKind;
use lappd_hv::registry::DetectorId;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "lappd-hv")]
#[command(about = "Sequencing control of LAPPD high-voltage supplies", long_about = None)]
struct Cli {
    /// Path to the settings file
    #[arg(long, short, default_value = "config/hv.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ramp a detector's channels up to their configured setpoints
    On { detector: String },

    /// Ramp a detector's channels down and disable the outputs
    Off { detector: String },

    /// Bias the photocathode up to its configured setpoint
    PcOn { detector: String },

    /// Drop the photocathode below MCP1
    PcOff { detector: String },

    /// Reload the settings file and write new setpoints immediately
    LoadSetpoints { detector: String },

    /// Refresh and print one detector's channel state
    Status { detector: String },

    /// Print the configured setpoints of every detector
    Setpoints,

    /// Check a detector's configured setpoints against the safety rules
    Validate { detector: String },

    /// Cut crate main power immediately
    EmergencyOff,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    let settings = Settings::load_from(&cli.config)
        .with_context(|| format!("loading settings from {}", cli.config.display()))?;
    settings.validate()?;

    let device: Arc<dyn DeviceInterface> = if settings.debug {
        tracing::info!("debug settings: using the simulated crate backend");
        Arc::new(SimCrate::new())
    } else {
        // The transport to a physical crate is an external collaborator
        // implementing DeviceInterface; this binary ships the simulator only.
        bail!(
            "no hardware transport is compiled into this binary; \
             set debug = true to use the simulated crate"
        );
    };

    let controller = Arc::new(SequencingController::initialize(&cli.config, device).await?);

    match cli.command {
        Commands::On { detector } => {
            let outcome = run_sequenced(&controller, &detector, |c, d| async move {
                c.channels_on(&d).await
            })
            .await?;
            report_outcome("channels on", outcome);
        }
        Commands::Off { detector } => {
            let outcome = run_sequenced(&controller, &detector, |c, d| async move {
                c.channels_off(&d).await
            })
            .await?;
            report_outcome("channels off", outcome);
        }
        Commands::PcOn { detector } => {
            let outcome = controller
                .photocathode_on(&DetectorId::new(detector))
                .await?;
            report_outcome("photocathode on", outcome);
        }
        Commands::PcOff { detector } => {
            let outcome = controller
                .photocathode_off(&DetectorId::new(detector))
                .await?;
            report_outcome("photocathode off", outcome);
        }
        Commands::LoadSetpoints { detector } => {
            controller
                .load_new_setpoints(&DetectorId::new(detector))
                .await?;
            println!("new setpoints written");
        }
        Commands::Status { detector } => {
            let status = controller.status(&DetectorId::new(detector)).await?;
            print_status(&status);
        }
        Commands::Setpoints => {
            print!("{}", controller.setpoint_summary());
        }
        Commands::Validate { detector } => {
            controller.validate_setpoints(&DetectorId::new(detector))?;
            println!("setpoints pass the safety rules");
        }
        Commands::EmergencyOff => {
            controller.emergency_off().await;
            println!("main power disabled");
        }
    }

    Ok(())
}

/// Run one long sequencing operation on its own task, echoing progress
/// events to stdout until it finishes.
async fn run_sequenced<F, Fut>(
    controller: &Arc<SequencingController>,
    detector: &str,
    op: F,
) -> Result<SequenceOutcome>
where
    F: FnOnce(Arc<SequencingController>, DetectorId) -> Fut,
    Fut: std::future::Future<Output = lappd_hv::error::HvResult<SequenceOutcome>> + Send + 'static,
{
    let mut events = controller.subscribe();
    let mut handle = tokio::spawn(op(controller.clone(), DetectorId::new(detector)));

    loop {
        tokio::select! {
            result = &mut handle => {
                // Drain anything already queued before reporting.
                while let Ok(event) = events.try_recv() {
                    print_event(&event.kind);
                }
                return Ok(result.context("sequencing task panicked")??);
            }
            event = events.recv() => {
                if let Ok(event) = event {
                    print_event(&event.kind);
                }
            }
        }
    }
}

fn print_event(kind: &SequenceEventKind) {
    match kind {
        SequenceEventKind::RampStarted {
            step,
            target_v,
            wait,
        } => println!(
            "ramp step {step}: target {target_v:.1} V, settling for {}s",
            wait.as_secs()
        ),
        SequenceEventKind::RampProgress {
            step,
            elapsed_s,
            total_s,
        } => println!("  {step}: {elapsed_s}/{total_s}s"),
        SequenceEventKind::PhaseSettled { step } => println!("ramp step {step}: settled"),
        SequenceEventKind::ConvergenceFailed {
            tap,
            target_v,
            terminal_v,
            hint,
        } => println!(
            "convergence failure on {tap}: terminal {terminal_v:.1} V, target {target_v:.1} V ({hint})"
        ),
        SequenceEventKind::SequenceComplete => println!("sequence complete"),
        SequenceEventKind::SequenceAborted { reason } => println!("sequence aborted: {reason}"),
    }
}

fn report_outcome(what: &str, outcome: SequenceOutcome) {
    match outcome {
        SequenceOutcome::Completed => println!("{what}: done"),
        SequenceOutcome::AlreadyOn => println!("{what}: already on"),
        SequenceOutcome::AlreadyOff => println!("{what}: already off"),
        SequenceOutcome::AlreadyEnabled => println!("{what}: already enabled"),
        SequenceOutcome::AlreadyDisabled => println!("{what}: already disabled"),
        SequenceOutcome::Cancelled => println!("{what}: cancelled mid-ramp"),
    }
}

fn print_status(status: &Status) {
    println!("detector {}:", status.detector);
    println!("  main power : {}", if status.powered_on { "on" } else { "off" });
    println!("  phase      : {}", status.phase);
    println!(
        "  photocathode : {}",
        if status.photocathode_enabled {
            "enabled"
        } else {
            "disabled"
        }
    );
    for ch in &status.channels {
        println!(
            "  {:<5} set {:>7.1} V  terminal {:>7.1} V  output {}",
            ch.tap.to_string(),
            ch.setpoint_v,
            ch.terminal_v,
            ch.switch
        );
    }
}
