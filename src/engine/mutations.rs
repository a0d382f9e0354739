use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{oneshot, Mutex, OwnedMutexGuard};
use tracing::debug;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::audit::{AuditTrail, Mutation};
use super::conflict::{now_ms, slot_of, validate_times, SlotKey};
use super::{Engine, EngineError, SubjectState, WalCommand};

fn validate_subject(key: &str) -> Result<(), EngineError> {
    if key.is_empty() {
        return Err(EngineError::Validation("interviewer must not be empty".into()));
    }
    if key.len() > MAX_SUBJECT_KEY_LEN {
        return Err(EngineError::LimitExceeded("interviewer key too long"));
    }
    Ok(())
}

fn validate_text(value: Option<&String>, max: usize, what: &'static str) -> Result<(), EngineError> {
    match value {
        Some(v) if v.len() > max => Err(EngineError::LimitExceeded(what)),
        _ => Ok(()),
    }
}

fn validate_patch(patch: &EventPatch) -> Result<(), EngineError> {
    validate_text(patch.candidate_name.as_ref().and_then(Option::as_ref), MAX_NAME_LEN, "candidate name too long")?;
    validate_text(patch.position.as_ref().and_then(Option::as_ref), MAX_NAME_LEN, "position too long")?;
    validate_text(patch.notes.as_ref().and_then(Option::as_ref), MAX_NOTES_LEN, "notes too long")
}

fn slot_for(start: Ms, engine: &Engine) -> Result<SlotKey, EngineError> {
    slot_of(start, engine.config.timezone)
        .ok_or_else(|| EngineError::Validation(format!("start_time {start} is not a valid instant")))
}

fn conflict(interviewer: &str, slot: SlotKey, existing: Ulid) -> EngineError {
    metrics::counter!(crate::observability::SLOT_CONFLICTS_TOTAL).increment(1);
    debug!(%interviewer, %slot, %existing, "slot conflict");
    EngineError::Conflict {
        interviewer: interviewer.to_string(),
        slot: slot.to_string(),
        existing,
    }
}

fn notice(event: &InterviewEvent, action: AuditAction, actor: &Actor) -> ChangeNotice {
    ChangeNotice {
        interviewer: event.interviewer.clone(),
        event_id: event.id,
        action,
        actor_email: actor.email.clone(),
        version: event.version,
    }
}

/// Exclusive hold on one request token for the length of a create.
struct TokenClaim<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    token: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for TokenClaim<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks
            .remove_if(&self.token, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Count the outcome of a mutation by operation and error class.
fn observe<T>(op: &'static str, result: Result<T, EngineError>) -> Result<T, EngineError> {
    let outcome = match &result {
        Ok(_) => "ok",
        Err(e) => e.kind().as_str(),
    };
    metrics::counter!(crate::observability::MUTATIONS_TOTAL, "op" => op, "outcome" => outcome)
        .increment(1);
    result
}

impl Engine {
    /// Create an event. The conflict check and the insert run under the
    /// interviewer's write lock, so concurrent creates for one slot commit at
    /// most once.
    pub async fn create_event(&self, actor: &Actor, new: NewEvent) -> Result<InterviewEvent, EngineError> {
        observe("create", self.create_event_locked(actor, new).await)
    }

    async fn create_event_locked(&self, actor: &Actor, new: NewEvent) -> Result<InterviewEvent, EngineError> {
        self.authorize(actor, AuditAction::Create)?;
        let key = normalize_subject(&new.interviewer);
        validate_subject(&key)?;
        validate_times(new.start, new.end)?;
        validate_text(new.candidate_name.as_ref(), MAX_NAME_LEN, "candidate name too long")?;
        validate_text(new.position.as_ref(), MAX_NAME_LEN, "position too long")?;
        validate_text(new.notes.as_ref(), MAX_NOTES_LEN, "notes too long")?;
        validate_text(new.request_token.as_ref(), MAX_REQUEST_TOKEN_LEN, "request token too long")?;
        let slot = slot_for(new.start, self)?;

        // Creates sharing a token run one at a time, whichever interviewer
        // they name, so a retry racing the original sees its commit here.
        let _claim = match new.request_token.as_deref() {
            Some(token) => Some(self.claim_token(token).await),
            None => None,
        };
        if let Some(ref token) = new.request_token
            && let Some(existing) = self.event_for_token(token).await {
                debug!(%token, event = %existing.id, "create deduplicated by request token");
                return Ok(existing);
            }

        let tz = self.config.timezone;
        let _commit = self.commit_gate.read().await;
        let rs = self.subject(&key);
        let mut guard = rs.write().await;

        if guard.events.len() >= MAX_EVENTS_PER_SUBJECT {
            return Err(EngineError::LimitExceeded("too many events for interviewer"));
        }
        if let Some(existing) = guard.index.find_conflict(slot, None) {
            return Err(conflict(&key, slot, existing));
        }

        let now = now_ms();
        let event = InterviewEvent {
            id: Ulid::new(),
            interviewer: key.clone(),
            start: new.start,
            end: new.end,
            status: new.status.unwrap_or(EventStatus::Pending),
            marked_by: actor.email.clone(),
            marked_at: now,
            candidate_name: new.candidate_name,
            position: new.position,
            notes: new.notes,
            created_by: actor.email.clone(),
            created_at: now,
            updated_at: now,
            version: 1,
        };
        let audit = AuditTrail::prepare(actor, Mutation::Created(&event), now);
        self.wal_append(Record::EventCreated {
            event: event.clone(),
            request_token: new.request_token.clone(),
            audit: audit.clone(),
        })
        .await?;

        guard.insert_event(event.clone(), tz);
        self.event_to_subject.insert(event.id, key.clone());
        if let Some(token) = new.request_token {
            self.request_tokens.insert(token, (event.id, now));
        }
        self.audit.append(audit).await;
        drop(guard);

        self.notify.send(&key, &notice(&event, AuditAction::Create, actor));
        debug!(id = %event.id, interviewer = %key, %slot, "event created");
        Ok(event)
    }

    /// Apply a partial update. Time or interviewer changes re-check the slot
    /// (excluding the event itself); a status change stamps `marked_by` /
    /// `marked_at`. A patch that changes nothing commits nothing.
    pub async fn update_event(
        &self,
        actor: &Actor,
        id: Ulid,
        patch: EventPatch,
    ) -> Result<InterviewEvent, EngineError> {
        observe("update", self.update_event_locked(actor, id, patch).await)
    }

    async fn update_event_locked(
        &self,
        actor: &Actor,
        id: Ulid,
        patch: EventPatch,
    ) -> Result<InterviewEvent, EngineError> {
        self.authorize(actor, AuditAction::Update)?;
        validate_patch(&patch)?;
        let target = match patch.interviewer {
            Some(ref k) => {
                let k = normalize_subject(k);
                validate_subject(&k)?;
                Some(k)
            }
            None => None,
        };

        let _commit = self.commit_gate.read().await;
        for _ in 0..MAX_RESOLVE_ATTEMPTS {
            let key = self.subject_of(&id).ok_or(EngineError::NotFound(id))?;
            match target.as_ref().filter(|t| **t != key) {
                None => {
                    let rs = self.subject(&key);
                    let mut guard = rs.write_owned().await;
                    if !guard.events.contains_key(&id) {
                        if self.moved_away(&id, &key) {
                            continue;
                        }
                        return Err(EngineError::NotFound(id));
                    }
                    return self.commit_update(actor, id, &patch, &mut guard, None).await;
                }
                Some(to) => {
                    let (mut src, mut dst) = self.lock_pair(&key, to).await;
                    if !src.events.contains_key(&id) {
                        if self.moved_away(&id, &key) {
                            continue;
                        }
                        return Err(EngineError::NotFound(id));
                    }
                    return self
                        .commit_update(actor, id, &patch, &mut src, Some(&mut *dst))
                        .await;
                }
            }
        }
        Err(EngineError::NotFound(id))
    }

    /// Validate, log, and apply an update. `src` holds the event; `dst` is
    /// the new interviewer's state when the patch moves it.
    async fn commit_update(
        &self,
        actor: &Actor,
        id: Ulid,
        patch: &EventPatch,
        src: &mut SubjectState,
        dst: Option<&mut SubjectState>,
    ) -> Result<InterviewEvent, EngineError> {
        let tz = self.config.timezone;
        let current = src.events.get(&id).cloned().ok_or(EngineError::NotFound(id))?;
        let mut next = patch.apply_to(&current);
        if next == current {
            return Ok(current);
        }

        let times_changed = next.start != current.start || next.end != current.end;
        let moved = next.interviewer != current.interviewer;
        if times_changed {
            validate_times(next.start, next.end)?;
        }
        if times_changed || moved {
            let slot = slot_for(next.start, self)?;
            let target = dst.as_deref().unwrap_or(&*src);
            if let Some(existing) = target.index.find_conflict(slot, Some(id)) {
                return Err(conflict(&next.interviewer, slot, existing));
            }
            if moved && target.events.len() >= MAX_EVENTS_PER_SUBJECT {
                return Err(EngineError::LimitExceeded("too many events for interviewer"));
            }
        }

        let now = now_ms();
        if next.status != current.status {
            next.marked_by = actor.email.clone();
            next.marked_at = now;
        }
        next.updated_at = now;
        next.version = current.version + 1;

        let audit = AuditTrail::prepare(
            actor,
            Mutation::Updated {
                before: &current,
                after: &next,
            },
            now,
        );
        self.wal_append(Record::EventUpdated {
            previous_interviewer: current.interviewer.clone(),
            event: next.clone(),
            audit: audit.clone(),
        })
        .await?;

        src.remove_event(id, tz);
        match dst {
            Some(d) => d.insert_event(next.clone(), tz),
            None => src.insert_event(next.clone(), tz),
        }
        self.event_to_subject.insert(id, next.interviewer.clone());
        self.audit.append(audit).await;

        let n = notice(&next, AuditAction::Update, actor);
        self.notify.send(&current.interviewer, &n);
        if moved {
            self.notify.send(&next.interviewer, &n);
        }
        debug!(%id, version = next.version, "event updated");
        Ok(next)
    }

    /// Physically remove an event, returning its final state. A second
    /// delete of the same id reports `NotFound` and writes no audit entry.
    pub async fn delete_event(&self, actor: &Actor, id: Ulid) -> Result<InterviewEvent, EngineError> {
        observe("delete", self.delete_event_locked(actor, id).await)
    }

    async fn delete_event_locked(&self, actor: &Actor, id: Ulid) -> Result<InterviewEvent, EngineError> {
        self.authorize(actor, AuditAction::Delete)?;
        let tz = self.config.timezone;
        let _commit = self.commit_gate.read().await;
        for _ in 0..MAX_RESOLVE_ATTEMPTS {
            let key = self.subject_of(&id).ok_or(EngineError::NotFound(id))?;
            let rs = self.subject(&key);
            let mut guard = rs.write().await;
            let Some(current) = guard.events.get(&id).cloned() else {
                if self.moved_away(&id, &key) {
                    continue;
                }
                return Err(EngineError::NotFound(id));
            };

            let now = now_ms();
            let audit = AuditTrail::prepare(actor, Mutation::Deleted(&current), now);
            self.wal_append(Record::EventDeleted {
                id,
                interviewer: key.clone(),
                audit: audit.clone(),
            })
            .await?;

            guard.remove_event(id, tz);
            self.event_to_subject.remove(&id);
            self.audit.append(audit).await;
            drop(guard);

            self.notify.send(&key, &notice(&current, AuditAction::Delete, actor));
            debug!(%id, interviewer = %key, "event deleted");
            return Ok(current);
        }
        Err(EngineError::NotFound(id))
    }

    fn moved_away(&self, id: &Ulid, from: &str) -> bool {
        self.subject_of(id).is_some_and(|k| k != from)
    }

    /// Token → event id, unless the token has expired.
    pub(super) fn live_token(&self, token: &str) -> Option<Ulid> {
        let (id, issued_at) = self.request_tokens.get(token).map(|e| *e.value())?;
        (now_ms() - issued_at <= self.config.token_ttl_ms).then_some(id)
    }

    async fn claim_token(&self, token: &str) -> TokenClaim<'_> {
        let lock = self.token_locks.entry(token.to_string()).or_default().value().clone();
        TokenClaim {
            locks: &self.token_locks,
            token: token.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    async fn event_for_token(&self, token: &str) -> Option<InterviewEvent> {
        let id = self.live_token(token)?;
        self.get_event(id).await
    }

    /// Drop request tokens older than the TTL. Returns how many went.
    pub fn prune_request_tokens(&self, now: Ms) -> usize {
        let ttl = self.config.token_ttl_ms;
        let before = self.request_tokens.len();
        self.request_tokens.retain(|_, (_, issued_at)| now - *issued_at <= ttl);
        before.saturating_sub(self.request_tokens.len())
    }

    /// Rewrite the WAL as one snapshot per live event plus the full audit
    /// history. Holds the commit gate exclusively, so no mutation can land
    /// between the snapshot and the swap.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _exclusive = self.commit_gate.write().await;
        let now = now_ms();
        let ttl = self.config.token_ttl_ms;
        let tokens: HashMap<Ulid, String> = self
            .request_tokens
            .iter()
            .filter(|e| now - e.value().1 <= ttl)
            .map(|e| (e.value().0, e.key().clone()))
            .collect();

        let mut records = Vec::new();
        for rs in self.subject_handles() {
            let guard = rs.read().await;
            let mut events: Vec<&InterviewEvent> = guard.events.values().collect();
            events.sort_by_key(|e| e.id);
            for event in events {
                records.push(Record::EventRestored {
                    event: event.clone(),
                    request_token: tokens.get(&event.id).cloned(),
                });
            }
        }
        records.extend(self.audit.all().await.into_iter().map(Record::AuditArchived));

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { records, response: tx })
            .await
            .map_err(|_| EngineError::StorageUnavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::StorageUnavailable("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::StorageUnavailable(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
