//! Settings loading for the HV control stack.
//!
//! Configuration is loaded with figment from a TOML file merged with
//! `LAPPD_HV_`-prefixed environment variables. A loaded [`Settings`] is an
//! immutable snapshot: operations that honor setpoint edits (`load-setpoints`
//! and the photocathode commands) re-read the file and get a fresh snapshot
//! rather than mutating the current one.
//!
//! # Example
//! ```no_run
//! use lappd_hv::config::Settings;
//!
//! let settings = Settings::load_from("config/hv.toml")?;
//! settings.validate()?;
//! # Ok::<(), lappd_hv::error::HvError>(())
//! ```

use crate::error::{HvError, HvResult};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level settings snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Network address of the HV crate. Consumed by an external transport
    /// backend; carried here so one file configures the whole stack.
    pub crate_addr: String,
    /// Directory holding the crate MIB definitions, if the transport needs it.
    #[serde(default)]
    pub mib_path: Option<PathBuf>,
    /// When true, commands go to the in-memory simulated crate instead of
    /// hardware.
    #[serde(default)]
    pub debug: bool,
    /// Shared voltage rise rate for every channel, in V/s.
    pub ramp_rate: f64,
    /// Shared voltage fall rate for every channel, in V/s.
    pub fall_rate: f64,
    /// Offset applied to the photocathode target when it is logically
    /// disabled, biasing it slightly below MCP1. Must be negative.
    pub pc_off_bias: f64,
    /// Detectors in use, in channel-allocation order.
    pub detectors: Vec<DetectorSettings>,
}

/// Per-detector configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorSettings {
    /// Detector identifier, e.g. `"1"`.
    pub id: String,
    /// Target setpoint per tap, in volts (magnitudes).
    pub set_v: TapVoltages,
    /// Current limit per tap, in amps.
    pub max_i: TapCurrents,
}

/// A voltage value for each of the three taps.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TapVoltages {
    /// Photocathode target.
    pub pc: f64,
    /// MCP1 target.
    pub mcp1: f64,
    /// MCP2 target.
    pub mcp2: f64,
}

/// A current limit for each of the three taps.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TapCurrents {
    /// Photocathode current limit.
    pub pc: f64,
    /// MCP1 current limit.
    pub mcp1: f64,
    /// MCP2 current limit.
    pub mcp2: f64,
}

impl Settings {
    /// Load settings from a TOML file merged with `LAPPD_HV_` environment
    /// variables.
    pub fn load_from<P: AsRef<Path>>(path: P) -> HvResult<Self> {
        let settings: Settings = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("LAPPD_HV_"))
            .extract()?;
        Ok(settings)
    }

    /// Semantic validation after parsing.
    pub fn validate(&self) -> HvResult<()> {
        if !(self.ramp_rate.is_finite() && self.ramp_rate > 0.0) {
            return Err(HvError::ConfigValidation(format!(
                "ramp_rate must be positive and finite, got {}",
                self.ramp_rate
            )));
        }
        if !(self.fall_rate.is_finite() && self.fall_rate > 0.0) {
            return Err(HvError::ConfigValidation(format!(
                "fall_rate must be positive and finite, got {}",
                self.fall_rate
            )));
        }
        if !(self.pc_off_bias.is_finite() && self.pc_off_bias < 0.0) {
            return Err(HvError::ConfigValidation(format!(
                "pc_off_bias must be negative (it biases the photocathode below MCP1), got {}",
                self.pc_off_bias
            )));
        }
        if self.detectors.is_empty() {
            return Err(HvError::ConfigValidation(
                "at least one detector must be configured".into(),
            ));
        }

        let mut ids = std::collections::HashSet::new();
        for det in &self.detectors {
            if det.id.is_empty() {
                return Err(HvError::ConfigValidation("empty detector id".into()));
            }
            if !ids.insert(det.id.as_str()) {
                return Err(HvError::ConfigValidation(format!(
                    "duplicate detector id: {}",
                    det.id
                )));
            }
        }
        Ok(())
    }

    /// Look up the settings block for one detector.
    pub fn detector(&self, id: &str) -> Option<&DetectorSettings> {
        self.detectors.iter().find(|det| det.id == id)
    }
}
