//! Setpoint safety validation.
//!
//! Pure checks applied to a candidate setpoint triple before any voltage is
//! written and before the photocathode is enabled. These bounds exist to
//! catch configuration typos before they reach hardware: the photocathode
//! must never be biased far above MCP1, the plates have a maximum allowed
//! spread, and everything is capped below the module ceiling.
//!
//! The rules are evaluated in a fixed order and the first violated rule is
//! returned. Equality at a bound passes (`pc - mcp1 == 150` is legal,
//! `151` is not).

use crate::config::TapVoltages;
use thiserror::Error;

/// Software ceiling on any single setpoint, in volts. The device itself
/// additionally rejects writes above 2400 V.
pub const MAX_SETPOINT_V: f64 = 2600.0;

/// Maximum allowed photocathode bias above MCP1, in volts.
pub const MAX_PC_OVER_MCP1_V: f64 = 150.0;

/// Maximum allowed MCP1 bias above MCP2, in volts.
pub const MAX_MCP1_OVER_MCP2_V: f64 = 1400.0;

/// Ceiling on the MCP2 setpoint, in volts.
pub const MAX_MCP2_V: f64 = 1300.0;

/// One violated safety rule. Carries the offending values so operators can
/// see how far out of range the configuration is.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SafetyRule {
    #[error("setpoint {volts:.1} V exceeds the {MAX_SETPOINT_V:.0} V software ceiling")]
    CeilingExceeded { volts: f64 },

    #[error("setpoint {volts:.1} V is negative; voltages are magnitudes")]
    NegativeSetpoint { volts: f64 },

    #[error("pc - mcp1 = {delta_v:.1} V exceeds the {MAX_PC_OVER_MCP1_V:.0} V limit")]
    PcAboveMcp1 { delta_v: f64 },

    #[error("mcp1 - mcp2 = {delta_v:.1} V exceeds the {MAX_MCP1_OVER_MCP2_V:.0} V limit")]
    Mcp1AboveMcp2 { delta_v: f64 },

    #[error("mcp2 = {volts:.1} V exceeds the {MAX_MCP2_V:.0} V limit")]
    Mcp2Ceiling { volts: f64 },
}

/// Validate a candidate setpoint triple against the fixed safety rules.
///
/// Returns the first violated rule; a triggering operation must issue no
/// device command when this fails.
pub fn validate_setpoints(set_v: &TapVoltages) -> Result<(), SafetyRule> {
    for volts in [set_v.pc, set_v.mcp1, set_v.mcp2] {
        if volts > MAX_SETPOINT_V {
            return Err(SafetyRule::CeilingExceeded { volts });
        }
    }
    for volts in [set_v.pc, set_v.mcp1, set_v.mcp2] {
        if volts < 0.0 {
            return Err(SafetyRule::NegativeSetpoint { volts });
        }
    }

    let pc_delta = set_v.pc - set_v.mcp1;
    if pc_delta > MAX_PC_OVER_MCP1_V {
        return Err(SafetyRule::PcAboveMcp1 { delta_v: pc_delta });
    }

    let mcp_delta = set_v.mcp1 - set_v.mcp2;
    if mcp_delta > MAX_MCP1_OVER_MCP2_V {
        return Err(SafetyRule::Mcp1AboveMcp2 { delta_v: mcp_delta });
    }

    if set_v.mcp2 > MAX_MCP2_V {
        return Err(SafetyRule::Mcp2Ceiling { volts: set_v.mcp2 });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn taps(pc: f64, mcp1: f64, mcp2: f64) -> TapVoltages {
        TapVoltages { pc, mcp1, mcp2 }
    }

    #[test]
    fn nominal_setpoints_pass() {
        assert!(validate_setpoints(&taps(1200.0, 1100.0, 800.0)).is_ok());
    }

    #[test]
    fn all_zero_passes() {
        assert!(validate_setpoints(&taps(0.0, 0.0, 0.0)).is_ok());
    }

    #[test]
    fn ceiling_is_inclusive() {
        // 2600 itself passes; anything above it trips the ceiling rule.
        assert!(validate_setpoints(&taps(2600.0, 2500.0, 1300.0)).is_ok());
        assert!(matches!(
            validate_setpoints(&taps(2600.1, 2500.0, 1300.0)),
            Err(SafetyRule::CeilingExceeded { .. })
        ));
    }

    #[test]
    fn negative_setpoint_rejected() {
        assert!(matches!(
            validate_setpoints(&taps(1200.0, 1100.0, -1.0)),
            Err(SafetyRule::NegativeSetpoint { .. })
        ));
    }

    #[test]
    fn pc_mcp1_boundary() {
        // 150 passes, 151 fails
        assert!(validate_setpoints(&taps(1250.0, 1100.0, 800.0)).is_ok());
        assert!(matches!(
            validate_setpoints(&taps(1251.0, 1100.0, 800.0)),
            Err(SafetyRule::PcAboveMcp1 { delta_v }) if delta_v == 151.0
        ));
    }

    #[test]
    fn mcp1_mcp2_boundary() {
        assert!(validate_setpoints(&taps(2200.0, 2200.0, 800.0)).is_ok());
        assert!(matches!(
            validate_setpoints(&taps(2201.0, 2201.0, 800.0)),
            Err(SafetyRule::Mcp1AboveMcp2 { .. })
        ));
    }

    #[test]
    fn mcp2_ceiling_boundary() {
        assert!(validate_setpoints(&taps(1400.0, 1350.0, 1300.0)).is_ok());
        assert!(matches!(
            validate_setpoints(&taps(1400.0, 1350.0, 1301.0)),
            Err(SafetyRule::Mcp2Ceiling { .. })
        ));
    }

    #[test]
    fn first_violated_rule_wins() {
        // Both the ceiling and the pc-mcp1 spread are broken; ceiling is
        // checked first.
        assert!(matches!(
            validate_setpoints(&taps(2700.0, 1100.0, 800.0)),
            Err(SafetyRule::CeilingExceeded { .. })
        ));
    }
}
