//! Sequencing controller.
//!
//! The core state machine that safely ramps the three coupled tap voltages
//! of each detector up and down, validates operator setpoints against the
//! safety rules, and reconciles logical on/off intent with hardware-reported
//! state.
//!
//! # Ramp ordering
//!
//! The taps are order-dependent: the photocathode must never sit far above
//! MCP1, and MCP1 never far above MCP2. Ramp-up therefore goes
//! MCP2 → (MCP1 & PC together) → PC alone (only when the photocathode is
//! logically enabled); ramp-down drops the photocathode first, lowers MCP1
//! and PC to the measured MCP2 level, then disables all three outputs
//! simultaneously.
//!
//! # Concurrency
//!
//! One logical device session is shared by all detectors and backends
//! serialize commands internally. A sequencing operation blocks its caller
//! for the full ramp duration, so hosting applications run each invocation
//! on its own task. Operations on the same detector are serialized by a
//! per-detector permit; a second request while one is mid-ramp is rejected
//! with [`HvError::SequenceBusy`]. Every settling wait observes a
//! [`CancelToken`] once per second, which is how [`emergency_off`] preempts
//! a blocked ramp.
//!
//! [`emergency_off`]: SequencingController::emergency_off

use crate::config::{DetectorSettings, Settings};
use crate::device::{DeviceInterface, SwitchCode, SwitchState};
use crate::error::{HvError, HvResult};
use crate::events::{CancelToken, RampStep, SequenceEvent, SequenceEventKind};
use crate::registry::{Channel, ChannelRegistry, DetectorId, Tap};
use crate::safety;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::time::sleep;

/// Allowed deviation between terminal voltage and ramp target when
/// declaring convergence, in volts.
pub const CONVERGENCE_TOLERANCE_V: f64 = 5.0;

/// Fixed settling margin added to every computed ramp wait, in seconds.
pub const SETTLE_MARGIN_S: u64 = 4;

const REMEDIATION_HINT: &str = "turn channels off and retry";

/// Wait duration for slewing `delta_v` volts at `rate` volts per second,
/// rounded up to whole seconds plus the fixed settling margin.
pub fn ramp_wait_secs(delta_v: f64, rate: f64) -> u64 {
    let delta = delta_v.max(0.0);
    (delta / rate).ceil() as u64 + SETTLE_MARGIN_S
}

/// Sequencing state of one detector group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetectorPhase {
    /// All outputs off, no ramp in progress.
    SteadyOff,
    /// Ramp-up in progress at the given step.
    RampingUp(RampStep),
    /// Ramp-up finished; outputs energized.
    SteadyOn,
    /// Ramp-down in progress at the given step.
    RampingDown(RampStep),
    /// A ramp step failed to converge. Hardware is in its last-commanded
    /// state; ramping the detector off is the documented remediation.
    Error,
}

impl DetectorPhase {
    fn for_step(step: RampStep) -> Self {
        match step {
            RampStep::Baseline | RampStep::McpPair | RampStep::Photocathode => {
                DetectorPhase::RampingUp(step)
            }
            RampStep::DisablePc | RampStep::Lower | RampStep::FinalDisable => {
                DetectorPhase::RampingDown(step)
            }
        }
    }
}

impl fmt::Display for DetectorPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DetectorPhase::SteadyOff => write!(f, "steady-off"),
            DetectorPhase::RampingUp(step) => write!(f, "ramping-up({step})"),
            DetectorPhase::SteadyOn => write!(f, "steady-on"),
            DetectorPhase::RampingDown(step) => write!(f, "ramping-down({step})"),
            DetectorPhase::Error => write!(f, "error"),
        }
    }
}

/// Transient record of an in-flight ramp step. Discarded when the sequence
/// completes or fails.
#[derive(Debug, Clone)]
struct SequencingSession {
    step: RampStep,
    target_v: f64,
    started: DateTime<Utc>,
}

#[derive(Debug)]
struct DetectorGroup {
    phase: DetectorPhase,
    photocathode_enabled: bool,
    session: Option<SequencingSession>,
}

struct DetectorSlot {
    /// Serializes sequencing operations per detector. `try_lock` failure
    /// means a ramp is in flight and the request is rejected.
    permit: Mutex<()>,
    group: StdMutex<DetectorGroup>,
}

/// How a sequencing operation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceOutcome {
    /// The requested sequence ran to completion.
    Completed,
    /// All three outputs were already on; no command issued.
    AlreadyOn,
    /// All three outputs were already off; no command issued.
    AlreadyOff,
    /// The photocathode was already logically enabled; no command issued.
    AlreadyEnabled,
    /// The photocathode was already logically disabled; no command issued.
    AlreadyDisabled,
    /// The sequence was interrupted by cancellation or emergency off.
    /// Hardware is left in its last-commanded state.
    Cancelled,
}

/// Point-in-time view of one detector, as reported to callers.
#[derive(Debug, Clone)]
pub struct Status {
    /// Detector this status describes.
    pub detector: DetectorId,
    /// Process-wide main power flag.
    pub powered_on: bool,
    /// Current sequencing phase.
    pub phase: DetectorPhase,
    /// Logical photocathode flag (distinct from the PC relay state).
    pub photocathode_enabled: bool,
    /// Per-channel state in PC, MCP1, MCP2 order.
    pub channels: Vec<ChannelStatus>,
}

/// Per-channel slice of a [`Status`].
#[derive(Debug, Clone)]
pub struct ChannelStatus {
    /// Tap this entry describes.
    pub tap: Tap,
    /// Last known setpoint, in volts.
    pub setpoint_v: f64,
    /// Last measured terminal voltage, in volts.
    pub terminal_v: f64,
    /// Last known relay state.
    pub switch: SwitchState,
}

enum WaitOutcome {
    Settled,
    Cancelled,
}

/// Orchestrates multi-step ramps across every configured detector.
pub struct SequencingController {
    device: Arc<dyn DeviceInterface>,
    registry: ChannelRegistry,
    settings: StdRwLock<Arc<Settings>>,
    settings_path: PathBuf,
    slots: HashMap<DetectorId, DetectorSlot>,
    powered_on: AtomicBool,
    events: broadcast::Sender<SequenceEvent>,
    active: StdMutex<HashMap<DetectorId, CancelToken>>,
}

impl SequencingController {
    /// Load settings from `settings_path`, allocate the channel registry and
    /// switch the crate main power on.
    ///
    /// The crate can sit in a soft-off state without the operator knowing,
    /// so startup always asserts main power.
    pub async fn initialize(
        settings_path: impl Into<PathBuf>,
        device: Arc<dyn DeviceInterface>,
    ) -> HvResult<Self> {
        let settings_path = settings_path.into();
        let settings = Settings::load_from(&settings_path)?;
        settings.validate()?;

        let registry = ChannelRegistry::build(&settings, device.clone()).await?;
        device.write_main_power(true).await?;

        let slots = registry
            .detector_ids()
            .iter()
            .map(|det| {
                (
                    det.clone(),
                    DetectorSlot {
                        permit: Mutex::new(()),
                        group: StdMutex::new(DetectorGroup {
                            phase: DetectorPhase::SteadyOff,
                            photocathode_enabled: false,
                            session: None,
                        }),
                    },
                )
            })
            .collect();

        let (events, _) = broadcast::channel(64);
        tracing::info!(
            detectors = settings.detectors.len(),
            ramp_rate = settings.ramp_rate,
            fall_rate = settings.fall_rate,
            "sequencing controller initialized, main power on"
        );

        Ok(Self {
            device,
            registry,
            settings: StdRwLock::new(Arc::new(settings)),
            settings_path,
            slots,
            powered_on: AtomicBool::new(true),
            events,
            active: StdMutex::new(HashMap::new()),
        })
    }

    /// Subscribe to the progress event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<SequenceEvent> {
        self.events.subscribe()
    }

    /// Detector ids in allocation order.
    pub fn detector_ids(&self) -> &[DetectorId] {
        self.registry.detector_ids()
    }

    /// The settings snapshot operations currently run against.
    pub fn current_settings(&self) -> Arc<Settings> {
        match self.settings.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Re-read the settings file and install the new snapshot.
    pub fn reload_settings(&self) -> HvResult<Arc<Settings>> {
        let settings = Settings::load_from(&self.settings_path)?;
        settings.validate()?;
        let snapshot = Arc::new(settings);
        match self.settings.write() {
            Ok(mut guard) => *guard = snapshot.clone(),
            Err(poisoned) => *poisoned.into_inner() = snapshot.clone(),
        }
        Ok(snapshot)
    }

    /// Reload the settings file and check one detector's setpoints against
    /// the safety rules without touching the device.
    pub fn validate_setpoints(&self, detector: &DetectorId) -> HvResult<()> {
        let settings = self.reload_settings()?;
        let cfg = Self::detector_settings(&settings, detector)?;
        safety::validate_setpoints(&cfg.set_v)?;
        Ok(())
    }

    /// Ramp all three channels of a detector up to their configured targets.
    ///
    /// No-op when the registry reports all three outputs already on.
    /// Rejected with [`HvError::SequenceBusy`] while another sequencing
    /// operation holds the detector.
    pub async fn channels_on(&self, detector: &DetectorId) -> HvResult<SequenceOutcome> {
        let slot = self.slot(detector)?;
        let _permit = slot
            .permit
            .try_lock()
            .map_err(|_| HvError::SequenceBusy(detector.clone()))?;

        let channels = self.registry.channels_of(detector).await?;
        if channels.iter().all(|ch| ch.switch == SwitchState::On) {
            tracing::info!(%detector, "channels already on");
            return Ok(SequenceOutcome::AlreadyOn);
        }

        let settings = self.current_settings();
        let cfg = Self::detector_settings(&settings, detector)?.clone();
        safety::validate_setpoints(&cfg.set_v)?;

        let token = self.register_token(detector);
        let result = self
            .ramp_up(detector, &cfg, settings.ramp_rate, &token)
            .await;
        self.clear_token(detector);
        result
    }

    /// Ramp a detector down and disable its outputs.
    ///
    /// No-op when the registry reports all three outputs already off.
    pub async fn channels_off(&self, detector: &DetectorId) -> HvResult<SequenceOutcome> {
        let slot = self.slot(detector)?;
        let _permit = slot
            .permit
            .try_lock()
            .map_err(|_| HvError::SequenceBusy(detector.clone()))?;

        let channels = self.registry.channels_of(detector).await?;
        if channels.iter().all(|ch| ch.switch == SwitchState::Off) {
            tracing::info!(%detector, "channels already off");
            return Ok(SequenceOutcome::AlreadyOff);
        }

        let settings = self.current_settings();
        let cfg = Self::detector_settings(&settings, detector)?.clone();

        let token = self.register_token(detector);
        let result = self
            .ramp_down(
                detector,
                &cfg,
                settings.fall_rate,
                settings.pc_off_bias,
                &token,
            )
            .await;
        self.clear_token(detector);
        result
    }

    /// Bias the photocathode up to its configured target.
    ///
    /// Reloads the settings file first. Fails while MCP1 is unpowered: the
    /// photocathode must never be biased above a dead MCP1. The write is a
    /// single setpoint command; the device's own ramp rate does the slewing,
    /// so there is no settling wait.
    pub async fn photocathode_on(&self, detector: &DetectorId) -> HvResult<SequenceOutcome> {
        let slot = self.slot(detector)?;
        let _permit = slot
            .permit
            .try_lock()
            .map_err(|_| HvError::SequenceBusy(detector.clone()))?;

        if self.with_group(detector, |group| group.photocathode_enabled)? {
            tracing::info!(%detector, "photocathode already enabled");
            return Ok(SequenceOutcome::AlreadyEnabled);
        }

        let settings = self.reload_settings()?;
        let cfg = Self::detector_settings(&settings, detector)?.clone();

        self.registry.refresh(detector).await?;
        let mcp1 = self.registry.get(detector, Tap::Mcp1).await?;
        if mcp1.terminal_v <= 0.0 {
            return Err(HvError::PhotocathodeBlocked(format!(
                "MCP1 terminal voltage is {:.1} V; cannot bias the photocathode above an unpowered MCP1",
                mcp1.terminal_v
            )));
        }
        safety::validate_setpoints(&cfg.set_v)?;

        let pc = self.registry.get(detector, Tap::Pc).await?;
        self.device.write_voltage(pc.address, cfg.set_v.pc).await?;
        self.registry
            .set_setpoint(detector, Tap::Pc, cfg.set_v.pc)
            .await;
        self.with_group(detector, |group| group.photocathode_enabled = true)?;
        tracing::info!(%detector, target_v = cfg.set_v.pc, "photocathode enabled");
        Ok(SequenceOutcome::Completed)
    }

    /// Drop the photocathode to its off bias below MCP1.
    pub async fn photocathode_off(&self, detector: &DetectorId) -> HvResult<SequenceOutcome> {
        let slot = self.slot(detector)?;
        let _permit = slot
            .permit
            .try_lock()
            .map_err(|_| HvError::SequenceBusy(detector.clone()))?;

        if !self.with_group(detector, |group| group.photocathode_enabled)? {
            tracing::info!(%detector, "photocathode already disabled");
            return Ok(SequenceOutcome::AlreadyDisabled);
        }

        let settings = self.reload_settings()?;
        let cfg = Self::detector_settings(&settings, detector)?.clone();
        self.disable_photocathode(detector, &cfg, settings.pc_off_bias)
            .await?;
        Ok(SequenceOutcome::Completed)
    }

    /// Whether the photocathode is biased above MCP1.
    ///
    /// This is a setpoint comparison, deliberately decoupled from the relay
    /// state: it answers "is PC biased above MCP1", not "is the PC output
    /// relay closed".
    pub async fn is_photocathode_on(&self, detector: &DetectorId) -> HvResult<bool> {
        let pc = self.registry.get(detector, Tap::Pc).await?;
        let mcp1 = self.registry.get(detector, Tap::Mcp1).await?;
        Ok(pc.setpoint_v > mcp1.setpoint_v)
    }

    /// Reload the settings file and write the configured targets to all
    /// three channels immediately, with no stepped ramp.
    ///
    /// Assumes the channels are already energized; switch state is not
    /// touched. While the photocathode is logically disabled its written
    /// value is the MCP1 target plus the off bias, not the configured PC
    /// value.
    pub async fn load_new_setpoints(&self, detector: &DetectorId) -> HvResult<()> {
        let slot = self.slot(detector)?;
        let _permit = slot
            .permit
            .try_lock()
            .map_err(|_| HvError::SequenceBusy(detector.clone()))?;

        let settings = self.reload_settings()?;
        let cfg = Self::detector_settings(&settings, detector)?.clone();
        safety::validate_setpoints(&cfg.set_v)?;

        let enabled = self.with_group(detector, |group| group.photocathode_enabled)?;
        for tap in Tap::ALL {
            let target = match tap {
                Tap::Pc if !enabled => (cfg.set_v.mcp1 + settings.pc_off_bias).max(0.0),
                Tap::Pc => cfg.set_v.pc,
                Tap::Mcp1 => cfg.set_v.mcp1,
                Tap::Mcp2 => cfg.set_v.mcp2,
            };
            let channel = self.registry.get(detector, tap).await?;
            self.device.write_voltage(channel.address, target).await?;
            self.registry.set_setpoint(detector, tap, target).await;
        }
        tracing::info!(%detector, "new setpoints written");
        Ok(())
    }

    /// Unconditional main-power cutoff.
    ///
    /// Cancels every in-flight sequencing operation, issues the main-power
    /// disable and clears the process-wide powered flag. Best effort: the
    /// command result is never surfaced and this call cannot fail. Logical
    /// per-detector flags are left as they are; a later `status` refresh
    /// reconciles them against hardware after manual power restoration.
    pub async fn emergency_off(&self) {
        tracing::warn!("emergency off: cutting crate main power");
        let tokens: Vec<CancelToken> = {
            let active = self.active_tokens();
            active.values().cloned().collect()
        };
        for token in tokens {
            token.cancel();
        }

        if let Err(err) = self.device.write_main_power(false).await {
            tracing::error!(%err, "main power disable command failed");
        }
        self.powered_on.store(false, Ordering::SeqCst);
    }

    /// Cancel an in-flight sequencing operation for one detector.
    ///
    /// Returns false when nothing was in flight.
    pub fn cancel(&self, detector: &DetectorId) -> bool {
        let active = self.active_tokens();
        match active.get(detector) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Refresh one detector from hardware and report its state.
    pub async fn status(&self, detector: &DetectorId) -> HvResult<Status> {
        self.registry.refresh(detector).await?;
        let channels = self.registry.channels_of(detector).await?;
        let (phase, photocathode_enabled) = self.with_group(detector, |group| {
            (group.phase.clone(), group.photocathode_enabled)
        })?;
        Ok(Status {
            detector: detector.clone(),
            powered_on: self.powered_on.load(Ordering::SeqCst),
            phase,
            photocathode_enabled,
            channels: channels
                .iter()
                .map(|ch| ChannelStatus {
                    tap: ch.key.tap,
                    setpoint_v: ch.setpoint_v,
                    terminal_v: ch.terminal_v,
                    switch: ch.switch,
                })
                .collect(),
        })
    }

    /// Render the configured setpoints of every detector as text.
    pub fn setpoint_summary(&self) -> String {
        let settings = self.current_settings();
        let mut out = String::new();
        for det in &settings.detectors {
            let _ = writeln!(out, "{}:", det.id);
            let _ = writeln!(out, "\tpc : {} V", det.set_v.pc);
            let _ = writeln!(out, "\tmcp1 : {} V", det.set_v.mcp1);
            let _ = writeln!(out, "\tmcp2 : {} V", det.set_v.mcp2);
        }
        out
    }

    // ---- internals -------------------------------------------------------

    async fn ramp_up(
        &self,
        detector: &DetectorId,
        cfg: &DetectorSettings,
        ramp_rate: f64,
        token: &CancelToken,
    ) -> HvResult<SequenceOutcome> {
        let [pc, mcp1, mcp2] = self.registry.channels_of(detector).await?;
        let pc_enabled = self.with_group(detector, |group| group.photocathode_enabled)?;

        // Step 1: every tap to the MCP2 target, then enable all outputs.
        let baseline = cfg.set_v.mcp2;
        self.begin_step(detector, RampStep::Baseline, baseline)?;
        for channel in [&mcp2, &mcp1, &pc] {
            self.write_setpoint(detector, channel, baseline).await?;
        }
        for channel in [&mcp2, &mcp1, &pc] {
            self.device
                .write_switch(channel.address, SwitchCode::PrimeRamp)
                .await?;
            self.device
                .write_switch(channel.address, SwitchCode::Enable)
                .await?;
            self.registry
                .set_switch(detector, channel.key.tap, SwitchState::On)
                .await;
        }
        let wait = ramp_wait_secs(baseline, ramp_rate);
        if let WaitOutcome::Cancelled = self
            .settling_wait(detector, RampStep::Baseline, baseline, wait, token)
            .await
        {
            return self.abort_cancelled(detector);
        }
        self.verify_converged(
            detector,
            RampStep::Baseline,
            &[Tap::Pc, Tap::Mcp1, Tap::Mcp2],
            baseline,
        )
        .await?;

        // Step 2: MCP1 and PC rise together to the MCP1 target. MCP2 has
        // already settled and is skipped from here on.
        let pair_target = cfg.set_v.mcp1;
        self.begin_step(detector, RampStep::McpPair, pair_target)?;
        for channel in [&mcp1, &pc] {
            self.write_setpoint(detector, channel, pair_target).await?;
        }
        let wait = ramp_wait_secs(pair_target - baseline, ramp_rate);
        if let WaitOutcome::Cancelled = self
            .settling_wait(detector, RampStep::McpPair, pair_target, wait, token)
            .await
        {
            return self.abort_cancelled(detector);
        }
        self.verify_converged(
            detector,
            RampStep::McpPair,
            &[Tap::Mcp1, Tap::Pc],
            pair_target,
        )
        .await?;

        // Step 3: PC alone, only when logically enabled.
        if pc_enabled {
            let pc_target = cfg.set_v.pc;
            self.begin_step(detector, RampStep::Photocathode, pc_target)?;
            self.write_setpoint(detector, &pc, pc_target).await?;
            let wait = ramp_wait_secs(pc_target - pair_target, ramp_rate);
            if let WaitOutcome::Cancelled = self
                .settling_wait(detector, RampStep::Photocathode, pc_target, wait, token)
                .await
            {
                return self.abort_cancelled(detector);
            }
            self.verify_converged(detector, RampStep::Photocathode, &[Tap::Pc], pc_target)
                .await?;
        }

        self.finish_sequence(detector, DetectorPhase::SteadyOn)?;
        tracing::info!(%detector, "channels on");
        Ok(SequenceOutcome::Completed)
    }

    async fn ramp_down(
        &self,
        detector: &DetectorId,
        cfg: &DetectorSettings,
        fall_rate: f64,
        pc_off_bias: f64,
        token: &CancelToken,
    ) -> HvResult<SequenceOutcome> {
        let [pc, mcp1, mcp2] = self.registry.channels_of(detector).await?;

        // Drop the photocathode below MCP1 before anything else moves.
        self.begin_step(
            detector,
            RampStep::DisablePc,
            (cfg.set_v.mcp1 + pc_off_bias).max(0.0),
        )?;
        self.disable_photocathode(detector, cfg, pc_off_bias).await?;

        // Lower MCP1 and PC to the measured MCP2 terminal voltage, not the
        // configured setpoint.
        self.registry.refresh(detector).await?;
        let mcp2_terminal = self.registry.get(detector, Tap::Mcp2).await?.terminal_v;
        self.begin_step(detector, RampStep::Lower, mcp2_terminal)?;
        for channel in [&mcp1, &pc] {
            self.write_setpoint(detector, channel, mcp2_terminal).await?;
        }
        let wait = ramp_wait_secs(mcp2_terminal, fall_rate);
        if let WaitOutcome::Cancelled = self
            .settling_wait(detector, RampStep::Lower, mcp2_terminal, wait, token)
            .await
        {
            return self.abort_cancelled(detector);
        }
        self.verify_converged(detector, RampStep::Lower, &[Tap::Mcp1, Tap::Pc], mcp2_terminal)
            .await?;

        // Simultaneous output disable. No post-disable verification: the
        // hardware fall rate takes the outputs to 0 V unattended.
        self.begin_step(detector, RampStep::FinalDisable, 0.0)?;
        for channel in [&pc, &mcp1, &mcp2] {
            self.device
                .write_switch(channel.address, SwitchCode::PrimeRamp)
                .await?;
        }
        for channel in [&pc, &mcp1, &mcp2] {
            self.device
                .write_switch(channel.address, SwitchCode::Disable)
                .await?;
            self.registry
                .set_switch(detector, channel.key.tap, SwitchState::Off)
                .await;
        }

        self.finish_sequence(detector, DetectorPhase::SteadyOff)?;
        tracing::info!(%detector, "channels off");
        Ok(SequenceOutcome::Completed)
    }

    /// Immediate photocathode disable: a single setpoint write, no wait.
    /// No-op when already logically disabled.
    async fn disable_photocathode(
        &self,
        detector: &DetectorId,
        cfg: &DetectorSettings,
        pc_off_bias: f64,
    ) -> HvResult<()> {
        if !self.with_group(detector, |group| group.photocathode_enabled)? {
            return Ok(());
        }
        let target = (cfg.set_v.mcp1 + pc_off_bias).max(0.0);
        let pc = self.registry.get(detector, Tap::Pc).await?;
        self.write_setpoint(detector, &pc, target).await?;
        self.with_group(detector, |group| group.photocathode_enabled = false)?;
        tracing::info!(%detector, target_v = target, "photocathode disabled");
        Ok(())
    }

    async fn write_setpoint(
        &self,
        detector: &DetectorId,
        channel: &Channel,
        volts: f64,
    ) -> HvResult<()> {
        self.device.write_voltage(channel.address, volts).await?;
        self.registry
            .set_setpoint(detector, channel.key.tap, volts)
            .await;
        Ok(())
    }

    /// Sleep out a settling wait in one-second ticks, emitting a progress
    /// event on even seconds and honoring cancellation between ticks.
    async fn settling_wait(
        &self,
        detector: &DetectorId,
        step: RampStep,
        target_v: f64,
        total_s: u64,
        token: &CancelToken,
    ) -> WaitOutcome {
        self.emit(
            detector,
            SequenceEventKind::RampStarted {
                step,
                target_v,
                wait: Duration::from_secs(total_s),
            },
        );
        for elapsed in 0..total_s {
            if token.is_cancelled() {
                return WaitOutcome::Cancelled;
            }
            tokio::select! {
                () = token.cancelled() => return WaitOutcome::Cancelled,
                () = sleep(Duration::from_secs(1)) => {}
            }
            let done = elapsed + 1;
            if done % 2 == 0 {
                self.emit(
                    detector,
                    SequenceEventKind::RampProgress {
                        step,
                        elapsed_s: done,
                        total_s,
                    },
                );
            }
        }
        WaitOutcome::Settled
    }

    /// Re-read terminal voltages and require every listed tap to sit within
    /// the tolerance window of the step target. On failure the detector is
    /// parked in the `Error` phase and the remaining ramp steps are skipped;
    /// there is no automatic rollback.
    async fn verify_converged(
        &self,
        detector: &DetectorId,
        step: RampStep,
        taps: &[Tap],
        target_v: f64,
    ) -> HvResult<()> {
        self.registry.refresh(detector).await?;
        for &tap in taps {
            let channel = self.registry.get(detector, tap).await?;
            let error = (channel.terminal_v - target_v).abs();
            if error > CONVERGENCE_TOLERANCE_V {
                tracing::error!(
                    %detector, %tap,
                    terminal_v = channel.terminal_v,
                    target_v,
                    "convergence failure; {REMEDIATION_HINT}"
                );
                self.emit(
                    detector,
                    SequenceEventKind::ConvergenceFailed {
                        tap,
                        target_v,
                        terminal_v: channel.terminal_v,
                        hint: REMEDIATION_HINT,
                    },
                );
                self.with_group(detector, |group| {
                    group.phase = DetectorPhase::Error;
                    group.session = None;
                })?;
                return Err(HvError::Convergence {
                    detector: detector.clone(),
                    tap,
                    target_v,
                    terminal_v: channel.terminal_v,
                    tolerance: CONVERGENCE_TOLERANCE_V,
                });
            }
        }
        self.emit(detector, SequenceEventKind::PhaseSettled { step });
        Ok(())
    }

    fn begin_step(&self, detector: &DetectorId, step: RampStep, target_v: f64) -> HvResult<()> {
        self.with_group(detector, |group| {
            group.phase = DetectorPhase::for_step(step);
            group.session = Some(SequencingSession {
                step,
                target_v,
                started: Utc::now(),
            });
        })
    }

    fn finish_sequence(&self, detector: &DetectorId, phase: DetectorPhase) -> HvResult<()> {
        self.with_group(detector, |group| {
            group.phase = phase;
            group.session = None;
        })?;
        self.emit(detector, SequenceEventKind::SequenceComplete);
        Ok(())
    }

    /// Cancellation leaves the phase at the interrupted step: the hardware
    /// really is mid-ramp and a later operation or refresh reconciles it.
    fn abort_cancelled(&self, detector: &DetectorId) -> HvResult<SequenceOutcome> {
        if let Some(session) = self.with_group(detector, |group| group.session.take())? {
            tracing::warn!(
                %detector,
                step = %session.step,
                target_v = session.target_v,
                started = %session.started,
                "sequence cancelled mid-ramp"
            );
        }
        self.emit(
            detector,
            SequenceEventKind::SequenceAborted {
                reason: "cancelled".into(),
            },
        );
        Ok(SequenceOutcome::Cancelled)
    }

    fn detector_settings<'a>(
        settings: &'a Settings,
        detector: &DetectorId,
    ) -> HvResult<&'a DetectorSettings> {
        settings
            .detector(detector.as_str())
            .ok_or_else(|| HvError::UnknownDetector(detector.clone()))
    }

    fn slot(&self, detector: &DetectorId) -> HvResult<&DetectorSlot> {
        self.slots
            .get(detector)
            .ok_or_else(|| HvError::UnknownDetector(detector.clone()))
    }

    fn with_group<R>(
        &self,
        detector: &DetectorId,
        f: impl FnOnce(&mut DetectorGroup) -> R,
    ) -> HvResult<R> {
        let slot = self.slot(detector)?;
        let mut group = match slot.group.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Ok(f(&mut group))
    }

    fn active_tokens(&self) -> std::sync::MutexGuard<'_, HashMap<DetectorId, CancelToken>> {
        match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn register_token(&self, detector: &DetectorId) -> CancelToken {
        let token = CancelToken::new();
        self.active_tokens().insert(detector.clone(), token.clone());
        token
    }

    fn clear_token(&self, detector: &DetectorId) {
        self.active_tokens().remove(detector);
    }

    fn emit(&self, detector: &DetectorId, kind: SequenceEventKind) {
        // Nobody listening is fine; the stream is observability only.
        let _ = self.events.send(SequenceEvent::new(detector.clone(), kind));
    }
}
