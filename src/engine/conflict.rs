use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Timelike};
use chrono_tz::Tz;
use ulid::Ulid;

use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

/// A bookable slot: calendar day plus minute-of-day, both in the engine's
/// organizational timezone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotKey {
    pub day: NaiveDate,
    pub minute: u16,
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:02}:{:02}", self.day, self.minute / 60, self.minute % 60)
    }
}

/// Map a start instant onto its slot. Seconds and milliseconds are dropped,
/// so two starts within the same wall-clock minute share a slot.
pub fn slot_of(start: Ms, tz: Tz) -> Option<SlotKey> {
    let local = DateTime::from_timestamp_millis(start)?.with_timezone(&tz);
    Some(SlotKey {
        day: local.date_naive(),
        minute: (local.hour() * 60 + local.minute()) as u16,
    })
}

pub(crate) fn validate_times(start: Ms, end: Ms) -> Result<(), EngineError> {
    use crate::limits::*;
    if start >= end {
        return Err(EngineError::Validation(format!(
            "start_time ({start}) must be before end_time ({end})"
        )));
    }
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if end - start > MAX_EVENT_DURATION_MS {
        return Err(EngineError::LimitExceeded("interview too long"));
    }
    Ok(())
}

/// Per-interviewer slot index: slot → the one live event occupying it.
#[derive(Debug, Clone, Default)]
pub struct ConflictIndex {
    slots: HashMap<SlotKey, Ulid>,
}

impl ConflictIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// The event holding `slot`, unless it is `exclude`.
    pub fn find_conflict(&self, slot: SlotKey, exclude: Option<Ulid>) -> Option<Ulid> {
        self.slots
            .get(&slot)
            .copied()
            .filter(|occupant| Some(*occupant) != exclude)
    }

    pub fn has_conflict(&self, slot: SlotKey, exclude: Option<Ulid>) -> bool {
        self.find_conflict(slot, exclude).is_some()
    }

    /// Claim a slot. Returns `false` and leaves the index alone when another
    /// event already holds it.
    pub fn insert(&mut self, slot: SlotKey, id: Ulid) -> bool {
        match self.slots.get(&slot) {
            Some(occupant) if *occupant != id => false,
            _ => {
                self.slots.insert(slot, id);
                true
            }
        }
    }

    /// Release a slot, but only if `id` is the one holding it.
    pub fn remove(&mut self, slot: SlotKey, id: Ulid) {
        if self.slots.get(&slot) == Some(&id) {
            self.slots.remove(&slot);
        }
    }
}
