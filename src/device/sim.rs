//! Simulated HV crate.
//!
//! Implements [`DeviceInterface`] against an in-memory register file so the
//! whole sequencing stack runs without hardware. Selected at runtime by the
//! `debug = true` settings toggle and used by every integration test.
//!
//! The simulation settles instantly: the terminal voltage reads back the
//! last commanded setpoint. Tests that need a stuck channel install a
//! terminal override, and `fail_commands` turns every command into a
//! transport error. All writes are appended to an ordered command log that
//! tests assert sequencing order against.

use super::{ChannelAddress, DeviceInterface, SwitchCode, SwitchState, DEVICE_MAX_VOLTAGE};
use crate::error::{HvError, HvResult};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Mutex;

/// One write command as seen by the simulated crate, in issue order.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandRecord {
    /// `write_voltage` call.
    Voltage(ChannelAddress, f64),
    /// `write_switch` call.
    Switch(ChannelAddress, SwitchCode),
    /// `write_main_power` call.
    MainPower(bool),
    /// `write_current_limit` call.
    CurrentLimit(ChannelAddress, f64),
    /// `write_ramp_rate` call.
    RampRate(ChannelAddress, f64),
    /// `write_fall_rate` call.
    FallRate(ChannelAddress, f64),
}

#[derive(Debug, Clone, Default)]
struct ChannelRegisters {
    setpoint_v: f64,
    current_limit_a: f64,
    ramp_rate: f64,
    fall_rate: f64,
    switch: Option<bool>,
}

#[derive(Default)]
struct SimState {
    registers: BTreeMap<ChannelAddress, ChannelRegisters>,
    terminal_overrides: BTreeMap<ChannelAddress, f64>,
    main_power: bool,
    fail_commands: bool,
    log: Vec<CommandRecord>,
}

/// In-memory register-file backend for the [`DeviceInterface`] contract.
#[derive(Default)]
pub struct SimCrate {
    state: Mutex<SimState>,
}

impl SimCrate {
    /// Create a simulated crate with main power off and no channels.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SimState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn check_transport(state: &SimState) -> HvResult<()> {
        if state.fail_commands {
            return Err(HvError::DeviceCommand(
                "simulated transport failure".into(),
            ));
        }
        Ok(())
    }

    /// Snapshot of every write command issued so far, in order.
    pub fn command_log(&self) -> Vec<CommandRecord> {
        self.state().log.clone()
    }

    /// Drop the recorded command log.
    pub fn clear_log(&self) {
        self.state().log.clear();
    }

    /// Make every subsequent command fail with a transport error.
    pub fn fail_commands(&self, fail: bool) {
        self.state().fail_commands = fail;
    }

    /// Pin the measured terminal voltage of one channel, simulating an
    /// output that never converges to its setpoint.
    pub fn set_terminal_override(&self, channel: ChannelAddress, volts: f64) {
        self.state().terminal_overrides.insert(channel, volts);
    }

    /// Remove a terminal override installed by [`Self::set_terminal_override`].
    pub fn clear_terminal_override(&self, channel: ChannelAddress) {
        self.state().terminal_overrides.remove(&channel);
    }

    /// Force a channel relay state without going through a switch command,
    /// simulating state the software did not put there.
    pub fn force_switch(&self, channel: ChannelAddress, on: bool) {
        self.state().registers.entry(channel).or_default().switch = Some(on);
    }

    /// Current simulated main power state.
    pub fn main_power(&self) -> bool {
        self.state().main_power
    }
}

#[async_trait]
impl DeviceInterface for SimCrate {
    async fn write_voltage(&self, channel: ChannelAddress, volts: f64) -> HvResult<()> {
        let mut state = self.state();
        Self::check_transport(&state)?;
        if !(0.0..=DEVICE_MAX_VOLTAGE).contains(&volts) {
            return Err(HvError::DeviceRejected {
                what: "output voltage",
                value: volts,
            });
        }
        state.log.push(CommandRecord::Voltage(channel, volts));
        state.registers.entry(channel).or_default().setpoint_v = volts;
        Ok(())
    }

    async fn read_voltage(&self, channel: ChannelAddress) -> HvResult<f64> {
        let state = self.state();
        Self::check_transport(&state)?;
        Ok(state
            .registers
            .get(&channel)
            .map(|reg| reg.setpoint_v)
            .unwrap_or(0.0))
    }

    async fn read_terminal_voltage(&self, channel: ChannelAddress) -> HvResult<f64> {
        let state = self.state();
        Self::check_transport(&state)?;
        if let Some(&volts) = state.terminal_overrides.get(&channel) {
            return Ok(volts);
        }
        Ok(state
            .registers
            .get(&channel)
            .map(|reg| reg.setpoint_v)
            .unwrap_or(0.0))
    }

    async fn write_switch(&self, channel: ChannelAddress, code: SwitchCode) -> HvResult<()> {
        let mut state = self.state();
        Self::check_transport(&state)?;
        state.log.push(CommandRecord::Switch(channel, code));
        let registers = state.registers.entry(channel).or_default();
        match code {
            SwitchCode::Enable => registers.switch = Some(true),
            SwitchCode::Disable => registers.switch = Some(false),
            // Priming arms the ramp generator; the relay state is untouched.
            SwitchCode::PrimeRamp => {}
        }
        Ok(())
    }

    async fn read_switch(&self, channel: ChannelAddress) -> HvResult<SwitchState> {
        let state = self.state();
        Self::check_transport(&state)?;
        Ok(match state.registers.get(&channel).and_then(|reg| reg.switch) {
            Some(true) => SwitchState::On,
            Some(false) => SwitchState::Off,
            None => SwitchState::Unknown,
        })
    }

    async fn write_main_power(&self, on: bool) -> HvResult<()> {
        let mut state = self.state();
        Self::check_transport(&state)?;
        state.log.push(CommandRecord::MainPower(on));
        state.main_power = on;
        Ok(())
    }

    async fn read_main_power(&self) -> HvResult<bool> {
        let state = self.state();
        Self::check_transport(&state)?;
        Ok(state.main_power)
    }

    async fn write_current_limit(&self, channel: ChannelAddress, amps: f64) -> HvResult<()> {
        let mut state = self.state();
        Self::check_transport(&state)?;
        state.log.push(CommandRecord::CurrentLimit(channel, amps));
        state.registers.entry(channel).or_default().current_limit_a = amps;
        Ok(())
    }

    async fn write_ramp_rate(&self, channel: ChannelAddress, volts_per_sec: f64) -> HvResult<()> {
        let mut state = self.state();
        Self::check_transport(&state)?;
        state.log.push(CommandRecord::RampRate(channel, volts_per_sec));
        state.registers.entry(channel).or_default().ramp_rate = volts_per_sec;
        Ok(())
    }

    async fn write_fall_rate(&self, channel: ChannelAddress, volts_per_sec: f64) -> HvResult<()> {
        let mut state = self.state();
        Self::check_transport(&state)?;
        state.log.push(CommandRecord::FallRate(channel, volts_per_sec));
        state.registers.entry(channel).or_default().fall_rate = volts_per_sec;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CH: ChannelAddress = ChannelAddress { module: 1, index: 0 };

    #[tokio::test]
    async fn written_voltage_reads_back_as_magnitude() {
        let sim = SimCrate::new();
        for volts in [0.0, 1.0, 799.5, 1200.0, 2400.0] {
            sim.write_voltage(CH, volts).await.unwrap();
            assert_eq!(sim.read_voltage(CH).await.unwrap(), volts);
            assert!(sim.read_terminal_voltage(CH).await.unwrap() >= 0.0);
        }
    }

    #[tokio::test]
    async fn out_of_range_voltage_rejected() {
        let sim = SimCrate::new();
        assert!(matches!(
            sim.write_voltage(CH, 2400.1).await,
            Err(HvError::DeviceRejected { .. })
        ));
        assert!(matches!(
            sim.write_voltage(CH, -0.1).await,
            Err(HvError::DeviceRejected { .. })
        ));
        // Rejected writes leave no trace in the log or registers.
        assert!(sim.command_log().is_empty());
        assert_eq!(sim.read_voltage(CH).await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn switch_codes_drive_relay_state() {
        let sim = SimCrate::new();
        assert_eq!(sim.read_switch(CH).await.unwrap(), SwitchState::Unknown);

        sim.write_switch(CH, SwitchCode::PrimeRamp).await.unwrap();
        assert_eq!(sim.read_switch(CH).await.unwrap(), SwitchState::Unknown);

        sim.write_switch(CH, SwitchCode::Enable).await.unwrap();
        assert_eq!(sim.read_switch(CH).await.unwrap(), SwitchState::On);

        sim.write_switch(CH, SwitchCode::Disable).await.unwrap();
        assert_eq!(sim.read_switch(CH).await.unwrap(), SwitchState::Off);
    }

    #[tokio::test]
    async fn terminal_override_detaches_terminal_from_setpoint() {
        let sim = SimCrate::new();
        sim.write_voltage(CH, 800.0).await.unwrap();
        sim.set_terminal_override(CH, 120.0);
        assert_eq!(sim.read_terminal_voltage(CH).await.unwrap(), 120.0);
        assert_eq!(sim.read_voltage(CH).await.unwrap(), 800.0);

        sim.clear_terminal_override(CH);
        assert_eq!(sim.read_terminal_voltage(CH).await.unwrap(), 800.0);
    }

    #[tokio::test]
    async fn command_log_preserves_order() {
        let sim = SimCrate::new();
        sim.write_main_power(true).await.unwrap();
        sim.write_voltage(CH, 100.0).await.unwrap();
        sim.write_switch(CH, SwitchCode::Enable).await.unwrap();
        assert_eq!(
            sim.command_log(),
            vec![
                CommandRecord::MainPower(true),
                CommandRecord::Voltage(CH, 100.0),
                CommandRecord::Switch(CH, SwitchCode::Enable),
            ]
        );
    }

    #[tokio::test]
    async fn transport_failures_hit_every_command() {
        let sim = SimCrate::new();
        sim.fail_commands(true);
        assert!(sim.write_voltage(CH, 100.0).await.is_err());
        assert!(sim.read_voltage(CH).await.is_err());
        assert!(sim.write_main_power(false).await.is_err());

        sim.fail_commands(false);
        assert!(sim.write_voltage(CH, 100.0).await.is_ok());
    }
}
