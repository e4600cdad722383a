//! Mutual exclusion between the battery-load and grid-load relays.
//!
//! The decision functions here are pure. They must be fed the sibling's
//! *committed* record, and the coordinator pins that record's version in the
//! same batch as the target write, so a sibling that changes between the read
//! and the commit fails the batch instead of slipping past the check.

use solarflow_client::domain::{RelayCommand, RelayMode, RelayState, UnitId};

use crate::error::EngineError;

pub const SIBLING_ACTIVE: &str = "interlock: sibling unit active";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterlockDecision {
    Allow,
    Deny { sibling: UnitId, reason: &'static str },
}

impl InterlockDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }

    pub fn into_result(self, unit: UnitId, requested: RelayState) -> Result<(), EngineError> {
        match self {
            Self::Allow => Ok(()),
            Self::Deny { sibling, .. } => Err(EngineError::InterlockViolation {
                unit,
                requested,
                sibling,
            }),
        }
    }

    pub fn into_global_result(self, requested: RelayMode) -> Result<(), EngineError> {
        match self {
            Self::Allow => Ok(()),
            Self::Deny { .. } => Err(EngineError::GlobalInterlockViolation { requested }),
        }
    }
}

/// Whether a command needs the sibling's committed state at all.
pub fn applies(mode: RelayMode, requested: RelayState) -> bool {
    mode == RelayMode::Manual && requested.is_on()
}

/// Decide a single-unit command against the sibling's committed record.
///
/// Only manual/on requests for units 2 and 3 are constrained. A sibling whose
/// record does not exist yet counts as off.
pub fn validate(
    target: UnitId,
    mode: RelayMode,
    requested: RelayState,
    committed_sibling: Option<&RelayCommand>,
) -> InterlockDecision {
    if !applies(mode, requested) {
        return InterlockDecision::Allow;
    }
    let Some(sibling) = target.interlock_sibling() else {
        return InterlockDecision::Allow;
    };

    match committed_sibling {
        Some(cmd) if cmd.desired_state.is_on() => InterlockDecision::Deny {
            sibling,
            reason: SIBLING_ACTIVE,
        },
        _ => InterlockDecision::Allow,
    }
}

/// Decide a global switch to `mode` given the committed battery-load and
/// grid-load records. Moving both units into manual while both are commanded
/// on would create the exact state the interlock forbids.
pub fn validate_global(
    mode: RelayMode,
    battery_load: &RelayCommand,
    grid_load: &RelayCommand,
) -> InterlockDecision {
    if mode == RelayMode::Manual && battery_load.desired_state.is_on() && grid_load.desired_state.is_on() {
        return InterlockDecision::Deny {
            sibling: UnitId::GridLoad,
            reason: SIBLING_ACTIVE,
        };
    }
    InterlockDecision::Allow
}

/// True when the two committed records violate the invariant.
pub fn violated(battery_load: &RelayCommand, grid_load: &RelayCommand) -> bool {
    let manual = battery_load.mode == RelayMode::Manual || grid_load.mode == RelayMode::Manual;
    manual && battery_load.desired_state.is_on() && grid_load.desired_state.is_on()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(mode: RelayMode, state: RelayState) -> RelayCommand {
        RelayCommand {
            mode,
            desired_state: state,
            updated_at: None,
        }
    }

    #[test]
    fn denies_battery_load_while_grid_load_is_on() {
        let grid = cmd(RelayMode::Manual, RelayState::On);
        let decision = validate(UnitId::BatteryLoad, RelayMode::Manual, RelayState::On, Some(&grid));
        assert_eq!(
            decision,
            InterlockDecision::Deny {
                sibling: UnitId::GridLoad,
                reason: SIBLING_ACTIVE,
            }
        );
    }

    #[test]
    fn sibling_in_auto_but_commanded_on_still_blocks() {
        let battery = cmd(RelayMode::Auto, RelayState::On);
        let decision = validate(UnitId::GridLoad, RelayMode::Manual, RelayState::On, Some(&battery));
        assert!(!decision.is_allowed());
    }

    #[test]
    fn switching_off_or_auto_is_never_constrained() {
        let grid = cmd(RelayMode::Manual, RelayState::On);
        assert!(validate(UnitId::BatteryLoad, RelayMode::Manual, RelayState::Off, Some(&grid)).is_allowed());
        assert!(validate(UnitId::BatteryLoad, RelayMode::Auto, RelayState::On, Some(&grid)).is_allowed());
    }

    #[test]
    fn solar_diversion_is_unconstrained() {
        let any = cmd(RelayMode::Manual, RelayState::On);
        assert!(validate(UnitId::SolarDiversion, RelayMode::Manual, RelayState::On, Some(&any)).is_allowed());
    }

    #[test]
    fn missing_sibling_record_counts_as_off() {
        assert!(validate(UnitId::GridLoad, RelayMode::Manual, RelayState::On, None).is_allowed());
    }

    #[test]
    fn global_manual_refused_when_both_loads_commanded_on() {
        let on = cmd(RelayMode::Auto, RelayState::On);
        let off = cmd(RelayMode::Auto, RelayState::Off);
        assert!(!validate_global(RelayMode::Manual, &on, &on).is_allowed());
        assert!(validate_global(RelayMode::Manual, &on, &off).is_allowed());
        assert!(validate_global(RelayMode::Auto, &on, &on).is_allowed());
    }

    #[test]
    fn denial_maps_to_interlock_violation() {
        let err = validate(
            UnitId::GridLoad,
            RelayMode::Manual,
            RelayState::On,
            Some(&cmd(RelayMode::Manual, RelayState::On)),
        )
        .into_result(UnitId::GridLoad, RelayState::On)
        .unwrap_err();

        assert_eq!(
            err,
            EngineError::InterlockViolation {
                unit: UnitId::GridLoad,
                requested: RelayState::On,
                sibling: UnitId::BatteryLoad,
            }
        );
    }
}
