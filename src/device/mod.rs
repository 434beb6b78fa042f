//! Device command interface.
//!
//! The sequencing core talks to the HV module through the small
//! [`DeviceInterface`] trait: write/read a channel voltage, flip a channel
//! output switch, flip the crate main power, and push per-channel limits and
//! slew rates. Everything transport-specific (command encoding, response
//! token parsing, retries) lives behind this seam; the controller never sees
//! a raw device response.
//!
//! # Contract
//!
//! - Voltages cross this interface as non-negative magnitudes. The physical
//!   supply is negative-polarity internally; software never represents sign.
//! - A backend must reject `write_voltage` outside `[0, 2400]` V with
//!   [`HvError::DeviceRejected`].
//! - Commands are strictly serialized: the physical module accepts one
//!   command at a time, so a backend serializes internally and each call
//!   returns once the command round-trip completes.

use crate::error::HvResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod sim;

pub use sim::SimCrate;

/// Hardware ceiling on a single output-voltage write, in volts.
pub const DEVICE_MAX_VOLTAGE: f64 = 2400.0;

/// Address of one output channel on the crate.
///
/// Rendered as the module's `u<module><index>` channel suffix with a
/// two-digit index, e.g. module 1 index 4 is `u104`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChannelAddress {
    /// Module slot number within the crate.
    pub module: u8,
    /// Channel index within the module.
    pub index: u8,
}

impl ChannelAddress {
    /// Build an address from a module slot and channel index.
    pub fn new(module: u8, index: u8) -> Self {
        Self { module, index }
    }
}

impl fmt::Display for ChannelAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "u{}{:02}", self.module, self.index)
    }
}

/// Output switch command codes understood by the module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SwitchCode {
    /// Turn the channel output off.
    Disable = 0,
    /// Turn the channel output on.
    Enable = 1,
    /// Prime the channel ramp generator ahead of an enable or disable.
    PrimeRamp = 10,
}

/// Reported on/off state of a channel output relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SwitchState {
    /// Output relay closed.
    On,
    /// Output relay open.
    Off,
    /// State has never been read from the device.
    Unknown,
}

impl fmt::Display for SwitchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SwitchState::On => write!(f, "On"),
            SwitchState::Off => write!(f, "Off"),
            SwitchState::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Synchronous command/response channel to the physical HV module.
///
/// All voltages are magnitudes in volts, currents in amps, rates in V/s.
#[async_trait]
pub trait DeviceInterface: Send + Sync {
    /// Command a new output voltage setpoint.
    async fn write_voltage(&self, channel: ChannelAddress, volts: f64) -> HvResult<()>;

    /// Read back the commanded setpoint.
    async fn read_voltage(&self, channel: ChannelAddress) -> HvResult<f64>;

    /// Read the measured terminal voltage at the channel output.
    async fn read_terminal_voltage(&self, channel: ChannelAddress) -> HvResult<f64>;

    /// Send an output switch code (enable, disable, prime ramp).
    async fn write_switch(&self, channel: ChannelAddress, code: SwitchCode) -> HvResult<()>;

    /// Read the output relay state.
    async fn read_switch(&self, channel: ChannelAddress) -> HvResult<SwitchState>;

    /// Switch the crate main power.
    async fn write_main_power(&self, on: bool) -> HvResult<()>;

    /// Read the crate main power state.
    async fn read_main_power(&self) -> HvResult<bool>;

    /// Set the channel current limit.
    async fn write_current_limit(&self, channel: ChannelAddress, amps: f64) -> HvResult<()>;

    /// Set the channel voltage rise rate.
    async fn write_ramp_rate(&self, channel: ChannelAddress, volts_per_sec: f64) -> HvResult<()>;

    /// Set the channel voltage fall rate.
    async fn write_fall_rate(&self, channel: ChannelAddress, volts_per_sec: f64) -> HvResult<()>;
}
