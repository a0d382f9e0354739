use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::slot_of;
use super::{Engine, EngineError, SharedSubjectState};

impl Engine {
    /// Snapshot of every interviewer's state handle. Collected up front so no
    /// map guard is held across an await.
    pub(super) fn subject_handles(&self) -> Vec<SharedSubjectState> {
        self.subjects.iter().map(|e| e.value().clone()).collect()
    }

    pub async fn get_event(&self, id: Ulid) -> Option<InterviewEvent> {
        // The event may move between the lookup and the read; retry on the
        // new owner.
        for _ in 0..MAX_RESOLVE_ATTEMPTS {
            let key = self.subject_of(&id)?;
            let rs = self.subjects.get(&key).map(|e| e.value().clone())?;
            let guard = rs.read().await;
            if let Some(event) = guard.events.get(&id) {
                return Some(event.clone());
            }
        }
        None
    }

    /// Events matching `filter`, ordered by start time then id.
    pub async fn list_events(&self, filter: &EventFilter) -> Result<Vec<InterviewEvent>, EngineError> {
        if let (Some(from), Some(before)) = (filter.start_from, filter.start_before)
            && before.saturating_sub(from) > MAX_QUERY_WINDOW_MS {
                return Err(EngineError::LimitExceeded("query window too wide"));
            }

        let handles = match filter.interviewer.as_deref() {
            Some(key) => {
                let key = normalize_subject(key);
                self.subjects
                    .get(&key)
                    .map(|e| vec![e.value().clone()])
                    .unwrap_or_default()
            }
            None => self.subject_handles(),
        };

        let mut events = Vec::new();
        for rs in handles {
            let guard = rs.read().await;
            events.extend(guard.events.values().filter(|e| filter.matches(e)).cloned());
        }
        events.sort_by(|a, b| a.start.cmp(&b.start).then(a.id.cmp(&b.id)));
        Ok(events)
    }

    /// Would an event for `interviewer` starting at `start` collide with a
    /// live one? Advisory only; the authoritative check runs inside each
    /// mutation.
    pub async fn has_conflict(
        &self,
        interviewer: &str,
        start: Ms,
        exclude: Option<Ulid>,
    ) -> Result<bool, EngineError> {
        let key = normalize_subject(interviewer);
        let slot = slot_of(start, self.config.timezone)
            .ok_or_else(|| EngineError::Validation(format!("start_time {start} is not a valid instant")))?;
        let Some(rs) = self.subjects.get(&key).map(|e| e.value().clone()) else {
            return Ok(false);
        };
        let guard = rs.read().await;
        Ok(guard.index.has_conflict(slot, exclude))
    }

    /// Interviewers that currently have at least one event, sorted.
    pub async fn interviewers(&self) -> Vec<String> {
        let mut keys = Vec::new();
        for rs in self.subject_handles() {
            let guard = rs.read().await;
            if !guard.events.is_empty() {
                keys.push(guard.key.clone());
            }
        }
        keys.sort();
        keys
    }

    pub fn event_count(&self) -> usize {
        self.event_to_subject.len()
    }
}
