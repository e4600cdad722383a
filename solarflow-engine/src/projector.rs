//! Folds the three independently-written relay records into one view.

use std::collections::BTreeMap;

use solarflow_client::{
    db::{codec, Record},
    domain::{RelayCommand, RelayMode, RelayPatch, UnitId, RELAY_COLLECTION},
    StoreError,
};

use crate::interlock;
use crate::pipeline::{PipelineError, Reconcile};

/// Consistent three-unit command view. Units never observed read as `{auto, off}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommandView {
    units: [RelayCommand; 3],
}

impl CommandView {
    pub fn get(&self, unit: UnitId) -> &RelayCommand {
        &self.units[unit.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = (UnitId, &RelayCommand)> {
        UnitId::ALL.into_iter().map(move |u| (u, self.get(u)))
    }

    /// The console is in manual override when any unit is manual.
    pub fn is_manual_override(&self) -> bool {
        self.units.iter().any(|c| c.mode == RelayMode::Manual)
    }

    pub fn interlock_violated(&self) -> bool {
        interlock::violated(self.get(UnitId::BatteryLoad), self.get(UnitId::GridLoad))
    }

    /// Keyed by unit number, for serialization.
    pub fn to_map(&self) -> BTreeMap<u8, RelayCommand> {
        self.iter().map(|(u, c)| (u.number(), *c)).collect()
    }
}

/// A change to exactly one unit's record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitUpdate {
    pub unit: UnitId,
    /// Store version of the record this update was read from.
    pub version: u64,
    pub patch: RelayPatch,
}

impl UnitUpdate {
    /// `None` for records in the relay collection that are not units, such as
    /// the billing singleton.
    pub fn from_record(record: &Record) -> Result<Option<Self>, StoreError> {
        if record.key.collection != RELAY_COLLECTION {
            return Ok(None);
        }
        let Some(unit) = UnitId::from_record_id(&record.key.id) else {
            return Ok(None);
        };
        let patch: RelayPatch = codec::decode_record(record)?;
        Ok(Some(Self {
            unit,
            version: record.version,
            patch,
        }))
    }
}

/// Committed command held by a relay record. Fields the record lacks keep
/// their `{auto, off}` defaults.
pub fn decode_command(record: &Record) -> Result<RelayCommand, StoreError> {
    let patch: RelayPatch = codec::decode_record(record)?;
    let mut command = RelayCommand::default();
    command.apply(&patch);
    Ok(command)
}

#[derive(Debug, Clone, Default)]
pub struct CommandProjector {
    view: CommandView,
    /// Highest store version applied per unit; 0 before the first update.
    versions: [u64; 3],
}

impl CommandProjector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn view(&self) -> CommandView {
        self.view
    }

    /// Apply one update to its own unit only. Updates older than one already
    /// applied for that unit are dropped. Returns whether the view changed.
    pub fn apply(&mut self, update: &UnitUpdate) -> bool {
        let slot = update.unit.index();
        if update.version <= self.versions[slot] {
            return false;
        }
        self.versions[slot] = update.version;

        let before = self.view.units[slot];
        self.view.units[slot].apply(&update.patch);
        before != self.view.units[slot]
    }

    /// Apply a notification batch in arrival order.
    pub fn apply_all<'a>(&mut self, updates: impl IntoIterator<Item = &'a UnitUpdate>) -> bool {
        updates.into_iter().fold(false, |changed, u| self.apply(u) | changed)
    }
}

impl Reconcile for CommandProjector {
    fn reconcile(&mut self, record: &Record) -> Result<bool, PipelineError> {
        match UnitUpdate::from_record(record) {
            Ok(Some(update)) => Ok(self.apply(&update)),
            Ok(None) => Ok(false),
            Err(e) => Err(PipelineError::Decode(e.to_string())),
        }
    }
}
