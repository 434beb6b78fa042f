//! End-to-end sequencing scenarios against the simulated crate.
//!
//! These run under a paused tokio clock, so the multi-second settling waits
//! complete instantly while elapsed-time assertions stay exact.

mod common;

use common::{controller_with, MCP1, MCP2, PC, SETTINGS};
use lappd_hv::controller::{DetectorPhase, SequenceOutcome};
use lappd_hv::device::sim::CommandRecord;
use lappd_hv::device::{SwitchCode, SwitchState};
use lappd_hv::error::HvError;
use lappd_hv::events::{RampStep, SequenceEventKind};
use lappd_hv::registry::{DetectorId, Tap};
use std::time::Duration;
use tokio::time::{sleep, Instant};

fn det() -> DetectorId {
    DetectorId::new("1")
}

/// Index of the first log entry matching the predicate, or panic.
fn position(log: &[CommandRecord], pred: impl Fn(&CommandRecord) -> bool) -> usize {
    log.iter()
        .position(pred)
        .unwrap_or_else(|| panic!("expected command not found in log: {log:#?}"))
}

#[tokio::test(start_paused = true)]
async fn ramp_up_writes_baseline_everywhere_before_raising_mcp1() {
    let (controller, sim, _file) = controller_with(SETTINGS).await;
    sim.clear_log();

    let outcome = controller.channels_on(&det()).await.unwrap();
    assert_eq!(outcome, SequenceOutcome::Completed);

    let log = sim.command_log();

    // Step 1 writes the MCP2 target to all three channels first.
    assert_eq!(log[0], CommandRecord::Voltage(MCP2, 800.0));
    assert_eq!(log[1], CommandRecord::Voltage(MCP1, 800.0));
    assert_eq!(log[2], CommandRecord::Voltage(PC, 800.0));

    // Every output is primed and enabled before the MCP1 target is written.
    let last_enable = log
        .iter()
        .rposition(|cmd| matches!(cmd, CommandRecord::Switch(_, SwitchCode::Enable)))
        .unwrap();
    let first_mcp1_raise = position(&log, |cmd| *cmd == CommandRecord::Voltage(MCP1, 1100.0));
    assert!(last_enable < first_mcp1_raise);

    // Photocathode is logically disabled, so its configured target is never
    // written; it rides along at the MCP1 level.
    assert!(!log.contains(&CommandRecord::Voltage(PC, 1200.0)));
    assert!(log.contains(&CommandRecord::Voltage(PC, 1100.0)));
    assert!(!controller.is_photocathode_on(&det()).await.unwrap());

    let status = controller.status(&det()).await.unwrap();
    assert_eq!(status.phase, DetectorPhase::SteadyOn);
    for ch in &status.channels {
        assert_eq!(ch.switch, SwitchState::On);
    }
}

#[tokio::test(start_paused = true)]
async fn ramp_up_without_photocathode_takes_two_waits() {
    let (controller, _sim, _file) = controller_with(SETTINGS).await;

    let start = Instant::now();
    controller.channels_on(&det()).await.unwrap();
    // 800/100+4 = 12 s baseline, (1100-800)/100+4 = 7 s pair step.
    assert_eq!(start.elapsed().as_secs(), 19);
}

#[tokio::test(start_paused = true)]
async fn full_ramp_with_photocathode_enabled() {
    let (controller, sim, _file) = controller_with(SETTINGS).await;
    controller.channels_on(&det()).await.unwrap();

    // Enabling the photocathode is a single immediate write.
    let start = Instant::now();
    assert_eq!(
        controller.photocathode_on(&det()).await.unwrap(),
        SequenceOutcome::Completed
    );
    assert_eq!(start.elapsed().as_secs(), 0);
    assert!(controller.is_photocathode_on(&det()).await.unwrap());

    // Pretend the outputs dropped out behind our back; a status refresh
    // picks the relay states up and a new full ramp runs with the
    // photocathode still logically enabled.
    sim.force_switch(PC, false);
    sim.force_switch(MCP1, false);
    sim.force_switch(MCP2, false);
    controller.status(&det()).await.unwrap();
    sim.clear_log();

    let start = Instant::now();
    let outcome = controller.channels_on(&det()).await.unwrap();
    assert_eq!(outcome, SequenceOutcome::Completed);
    // 12 s + 7 s + (1200-1100)/100+4 = 5 s.
    assert_eq!(start.elapsed().as_secs(), 24);

    let log = sim.command_log();
    assert!(log.contains(&CommandRecord::Voltage(PC, 1200.0)));
    // The true PC target is the last voltage write of the whole sequence.
    let last_voltage = log
        .iter()
        .rev()
        .find(|cmd| matches!(cmd, CommandRecord::Voltage(_, _)))
        .unwrap();
    assert_eq!(*last_voltage, CommandRecord::Voltage(PC, 1200.0));

    let status = controller.status(&det()).await.unwrap();
    let setpoints: Vec<f64> = status.channels.iter().map(|ch| ch.setpoint_v).collect();
    assert_eq!(setpoints, vec![1200.0, 1100.0, 800.0]);
    for ch in &status.channels {
        assert!((ch.terminal_v - ch.setpoint_v).abs() <= 5.0);
    }
}

#[tokio::test(start_paused = true)]
async fn channels_on_is_idempotent() {
    let (controller, sim, _file) = controller_with(SETTINGS).await;
    controller.channels_on(&det()).await.unwrap();

    sim.clear_log();
    let outcome = controller.channels_on(&det()).await.unwrap();
    assert_eq!(outcome, SequenceOutcome::AlreadyOn);
    assert!(sim.command_log().is_empty());
}

#[tokio::test(start_paused = true)]
async fn ramp_down_disables_photocathode_first_and_trusts_the_fall() {
    let (controller, sim, _file) = controller_with(SETTINGS).await;
    controller.channels_on(&det()).await.unwrap();
    controller.photocathode_on(&det()).await.unwrap();
    sim.clear_log();

    let start = Instant::now();
    let outcome = controller.channels_off(&det()).await.unwrap();
    assert_eq!(outcome, SequenceOutcome::Completed);
    // Single fall wait: 800/50+4 = 20 s.
    assert_eq!(start.elapsed().as_secs(), 20);

    let log = sim.command_log();
    // Photocathode bias drop comes before anything else moves.
    assert_eq!(log[0], CommandRecord::Voltage(PC, 1090.0));
    // MCP1 and PC are lowered to the measured MCP2 terminal voltage.
    assert!(log.contains(&CommandRecord::Voltage(MCP1, 800.0)));
    assert!(log.contains(&CommandRecord::Voltage(PC, 800.0)));
    // The sequence ends in a prime + disable of all three outputs, with no
    // voltage write after it.
    let first_disable = position(&log, |cmd| {
        matches!(cmd, CommandRecord::Switch(_, SwitchCode::Disable))
    });
    assert!(log[first_disable..]
        .iter()
        .all(|cmd| matches!(cmd, CommandRecord::Switch(_, SwitchCode::Disable))));

    assert!(!controller.is_photocathode_on(&det()).await.unwrap());
    let status = controller.status(&det()).await.unwrap();
    assert_eq!(status.phase, DetectorPhase::SteadyOff);
    for ch in &status.channels {
        assert_eq!(ch.switch, SwitchState::Off);
    }

    // Symmetric no-op.
    sim.clear_log();
    let outcome = controller.channels_off(&det()).await.unwrap();
    assert_eq!(outcome, SequenceOutcome::AlreadyOff);
    assert!(sim.command_log().is_empty());
}

#[tokio::test(start_paused = true)]
async fn second_request_is_rejected_while_mid_ramp() {
    let (controller, _sim, _file) = controller_with(SETTINGS).await;

    let background = controller.clone();
    let handle = tokio::spawn(async move { background.channels_on(&det()).await });

    // Let the ramp reach its first settling wait.
    sleep(Duration::from_millis(10)).await;
    assert!(matches!(
        controller.channels_on(&det()).await,
        Err(HvError::SequenceBusy(_))
    ));
    // Photocathode operations contend for the same detector permit.
    assert!(matches!(
        controller.photocathode_on(&det()).await,
        Err(HvError::SequenceBusy(_))
    ));

    let outcome = handle.await.unwrap().unwrap();
    assert_eq!(outcome, SequenceOutcome::Completed);
}

#[tokio::test(start_paused = true)]
async fn convergence_failure_aborts_and_parks_the_detector_in_error() {
    let (controller, sim, _file) = controller_with(SETTINGS).await;
    // MCP1 sticks far below the baseline target.
    sim.set_terminal_override(MCP1, 100.0);
    sim.clear_log();

    let result = controller.channels_on(&det()).await;
    assert!(matches!(
        result,
        Err(HvError::Convergence { tap: Tap::Mcp1, .. })
    ));

    // The remaining ramp steps never ran.
    assert!(!sim.command_log().contains(&CommandRecord::Voltage(MCP1, 1100.0)));
    let status = controller.status(&det()).await.unwrap();
    assert_eq!(status.phase, DetectorPhase::Error);

    // Recovery path: ramping off still works once the channel unsticks.
    sim.clear_terminal_override(MCP1);
    let outcome = controller.channels_off(&det()).await.unwrap();
    assert_eq!(outcome, SequenceOutcome::Completed);
    let status = controller.status(&det()).await.unwrap();
    assert_eq!(status.phase, DetectorPhase::SteadyOff);
}

#[tokio::test(start_paused = true)]
async fn photocathode_requires_a_powered_mcp1() {
    let (controller, _sim, _file) = controller_with(SETTINGS).await;

    // Channels never ramped: MCP1 terminal is 0 V.
    assert!(matches!(
        controller.photocathode_on(&det()).await,
        Err(HvError::PhotocathodeBlocked(_))
    ));
    // And the disable direction is a no-op when already disabled.
    assert_eq!(
        controller.photocathode_off(&det()).await.unwrap(),
        SequenceOutcome::AlreadyDisabled
    );
}

#[tokio::test(start_paused = true)]
async fn photocathode_off_applies_the_bias_immediately() {
    let (controller, sim, _file) = controller_with(SETTINGS).await;
    controller.channels_on(&det()).await.unwrap();
    controller.photocathode_on(&det()).await.unwrap();
    assert!(controller.is_photocathode_on(&det()).await.unwrap());

    sim.clear_log();
    let outcome = controller.photocathode_off(&det()).await.unwrap();
    assert_eq!(outcome, SequenceOutcome::Completed);

    // One write: mcp1 setpoint plus the (negative) off bias.
    assert_eq!(sim.command_log(), vec![CommandRecord::Voltage(PC, 1090.0)]);
    assert!(!controller.is_photocathode_on(&det()).await.unwrap());

    // The relay is untouched: logically off, physically still closed.
    let status = controller.status(&det()).await.unwrap();
    assert_eq!(status.channels[0].switch, SwitchState::On);
    assert!(!status.photocathode_enabled);

    // Repeat is a no-op.
    sim.clear_log();
    assert_eq!(
        controller.photocathode_off(&det()).await.unwrap(),
        SequenceOutcome::AlreadyDisabled
    );
    assert!(sim.command_log().is_empty());
}

#[tokio::test(start_paused = true)]
async fn load_new_setpoints_respects_the_photocathode_flag() {
    let (controller, sim, file) = controller_with(SETTINGS).await;
    controller.channels_on(&det()).await.unwrap();

    // Photocathode logically disabled: PC gets mcp1 + bias, not 1200.
    sim.clear_log();
    let start = Instant::now();
    controller.load_new_setpoints(&det()).await.unwrap();
    assert_eq!(start.elapsed().as_secs(), 0);
    let log = sim.command_log();
    assert!(log.contains(&CommandRecord::Voltage(PC, 1090.0)));
    assert!(log.contains(&CommandRecord::Voltage(MCP1, 1100.0)));
    assert!(log.contains(&CommandRecord::Voltage(MCP2, 800.0)));
    assert!(!log.contains(&CommandRecord::Voltage(PC, 1200.0)));

    // Edits to the settings file are picked up on the next load.
    std::fs::write(file.path(), SETTINGS.replace("mcp2 = 800.0", "mcp2 = 805.0")).unwrap();
    sim.clear_log();
    controller.load_new_setpoints(&det()).await.unwrap();
    assert!(sim.command_log().contains(&CommandRecord::Voltage(MCP2, 805.0)));

    // With the photocathode enabled, the configured PC target is written.
    controller.photocathode_on(&det()).await.unwrap();
    sim.clear_log();
    controller.load_new_setpoints(&det()).await.unwrap();
    assert!(sim.command_log().contains(&CommandRecord::Voltage(PC, 1200.0)));
}

#[tokio::test(start_paused = true)]
async fn load_new_setpoints_blocks_on_a_safety_violation() {
    let (controller, sim, file) = controller_with(SETTINGS).await;
    controller.channels_on(&det()).await.unwrap();

    // pc - mcp1 = 200 breaks the 150 V rule.
    std::fs::write(file.path(), SETTINGS.replace("pc = 1200.0", "pc = 1300.0")).unwrap();
    sim.clear_log();
    assert!(matches!(
        controller.load_new_setpoints(&det()).await,
        Err(HvError::SafetyViolation(_))
    ));
    // Blocked before any device command.
    assert!(sim.command_log().is_empty());
}

#[tokio::test(start_paused = true)]
async fn ramp_emits_progress_events_on_even_seconds() {
    let (controller, _sim, _file) = controller_with(SETTINGS).await;
    let mut events = controller.subscribe();

    controller.channels_on(&det()).await.unwrap();

    let mut collected = Vec::new();
    while let Ok(event) = events.try_recv() {
        collected.push(event.kind);
    }

    assert!(matches!(
        collected.first(),
        Some(SequenceEventKind::RampStarted {
            step: RampStep::Baseline,
            wait,
            ..
        }) if wait.as_secs() == 12
    ));
    let baseline_progress: Vec<u64> = collected
        .iter()
        .filter_map(|kind| match kind {
            SequenceEventKind::RampProgress {
                step: RampStep::Baseline,
                elapsed_s,
                ..
            } => Some(*elapsed_s),
            _ => None,
        })
        .collect();
    assert_eq!(baseline_progress, vec![2, 4, 6, 8, 10, 12]);
    assert!(matches!(
        collected.last(),
        Some(SequenceEventKind::SequenceComplete)
    ));
}

#[tokio::test]
async fn unknown_detector_is_rejected_up_front() {
    let (controller, _sim, _file) = controller_with(SETTINGS).await;
    let ghost = DetectorId::new("9");
    assert!(matches!(
        controller.channels_on(&ghost).await,
        Err(HvError::UnknownDetector(_))
    ));
    assert!(matches!(
        controller.status(&ghost).await,
        Err(HvError::UnknownDetector(_))
    ));
}
