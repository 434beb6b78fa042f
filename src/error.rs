//! Custom error types for the HV control stack.
//!
//! This module defines the primary error type, `HvError`, for the entire
//! crate. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the failure modes of a sequencing operation,
//! from configuration problems to device command failures.
//!
//! ## Error Taxonomy
//!
//! - **`Config` / `ConfigValidation`**: malformed settings files, or settings
//!   that parse but are logically wrong (e.g. a positive photocathode-off
//!   bias). These always block an operation before any device command.
//! - **`SafetyViolation`**: a configured setpoint triple breaks one of the
//!   fixed safety rules. Also blocks before any device command.
//! - **`DeviceCommand`**: transport or protocol failure for a single command.
//! - **`DeviceRejected`**: the device refused an out-of-range write (the
//!   module itself rejects output voltages outside `[0, 2400]`).
//! - **`Convergence`**: a terminal voltage was outside the ±5 V tolerance
//!   window after the computed settling wait. The remaining ramp steps are
//!   aborted and the hardware is left in its last-commanded state; the caller
//!   recovers by ramping the detector off.
//! - **`SequenceBusy`**: a second sequencing request arrived for a detector
//!   already mid-ramp. Requests are rejected, never interleaved.

use crate::registry::{DetectorId, Tap};
use crate::safety::SafetyRule;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type HvResult<T> = std::result::Result<T, HvError>;

/// Errors produced by the HV sequencing stack.
#[derive(Error, Debug)]
pub enum HvError {
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    ConfigValidation(String),

    #[error("Safety violation: {0}")]
    SafetyViolation(#[from] SafetyRule),

    #[error("Device command failed: {0}")]
    DeviceCommand(String),

    #[error("Device rejected {what}: {value}")]
    DeviceRejected { what: &'static str, value: f64 },

    #[error(
        "Convergence failure on detector {detector} {tap}: terminal {terminal_v:.1} V, \
         target {target_v:.1} V (tolerance ±{tolerance:.0} V); turn channels off and retry"
    )]
    Convergence {
        detector: DetectorId,
        tap: Tap,
        target_v: f64,
        terminal_v: f64,
        tolerance: f64,
    },

    #[error("Unknown detector '{0}'")]
    UnknownDetector(DetectorId),

    #[error("Detector '{0}' has a sequencing operation in progress")]
    SequenceBusy(DetectorId),

    #[error("Photocathode operation blocked: {0}")]
    PhotocathodeBlocked(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
