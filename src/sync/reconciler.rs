use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::debug;
use ulid::Ulid;

use crate::engine::{EngineError, ErrorKind};
use crate::model::*;

use super::api::SchedulingApi;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// The view shows the last server-confirmed value.
    Synced,
    /// A mutation is in flight; the view shows its optimistic result.
    Pending,
    /// The last mutation failed; the view is back on the confirmed value and
    /// the error is held until dismissed.
    RolledBack,
}

/// A mutation as the reconciler sends it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Create(NewEvent),
    Update(EventPatch),
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationError {
    pub kind: ErrorKind,
    pub message: String,
    /// The failed mutation, kept only when it may be retried.
    pub retry: Option<Op>,
    /// Queued edits dropped along with the failed one.
    pub discarded: usize,
}

impl MutationError {
    pub fn is_retryable(&self) -> bool {
        self.retry.is_some()
    }
}

/// What a resolved mutation did to the view.
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciled {
    Confirmed(InterviewEvent),
    /// A provisional entry now lives under the server's id.
    Created {
        provisional: Ulid,
        event: InterviewEvent,
    },
    Deleted(Ulid),
    RolledBack {
        id: Ulid,
        error: MutationError,
    },
    /// The event no longer exists on the server and was dropped locally.
    Vanished(Ulid),
    /// The entry was forgotten while its mutation was in flight.
    Discarded(Ulid),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncError {
    UnknownEvent(Ulid),
    /// The event is being deleted; it takes no further edits.
    Deleted(Ulid),
    NotRetryable(Ulid),
    Api(EngineError),
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::UnknownEvent(id) => write!(f, "no such event in view: {id}"),
            SyncError::Deleted(id) => write!(f, "event {id} is being deleted"),
            SyncError::NotRetryable(id) => write!(f, "event {id} has no retryable failure"),
            SyncError::Api(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for SyncError {}

struct InFlight {
    op: Op,
    sent_at: Instant,
}

struct Completion {
    key: Ulid,
    op: Op,
    result: Result<InterviewEvent, EngineError>,
}

/// Per-event reconciliation state.
struct Tracked {
    server: Option<InterviewEvent>,
    view: Option<InterviewEvent>,
    state: SyncState,
    in_flight: Option<InFlight>,
    queued: VecDeque<Op>,
    error: Option<MutationError>,
    /// Completion generation at which `server` was last confirmed.
    confirmed_gen: u64,
}

impl Tracked {
    fn new(server: Option<InterviewEvent>, generation: u64) -> Self {
        Self {
            view: server.clone(),
            server,
            state: SyncState::Synced,
            in_flight: None,
            queued: VecDeque::new(),
            error: None,
            confirmed_gen: generation,
        }
    }

    fn deleting(&self) -> bool {
        self.in_flight.as_ref().is_some_and(|f| f.op == Op::Delete) || self.queued.contains(&Op::Delete)
    }

    /// View = confirmed value with the in-flight and queued ops replayed
    /// over it, in send order.
    fn recompute(&mut self, key: Ulid, actor: &Actor) {
        let mut view = self.server.clone();
        for op in self.in_flight.iter().map(|f| &f.op).chain(self.queued.iter()) {
            view = match op {
                Op::Create(new) => Some(preview_create(key, new, actor)),
                Op::Update(patch) => view.map(|v| preview_update(&v, patch, actor)),
                Op::Delete => None,
            };
        }
        self.view = view;
    }
}

fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

fn preview_create(key: Ulid, new: &NewEvent, actor: &Actor) -> InterviewEvent {
    let now = now_ms();
    InterviewEvent {
        id: key,
        interviewer: normalize_subject(&new.interviewer),
        start: new.start,
        end: new.end,
        status: new.status.unwrap_or(EventStatus::Pending),
        marked_by: actor.email.clone(),
        marked_at: now,
        candidate_name: new.candidate_name.clone(),
        position: new.position.clone(),
        notes: new.notes.clone(),
        created_by: actor.email.clone(),
        created_at: now,
        updated_at: now,
        version: 0,
    }
}

fn preview_update(base: &InterviewEvent, patch: &EventPatch, actor: &Actor) -> InterviewEvent {
    let mut next = patch.apply_to(base);
    if next.status != base.status {
        next.marked_by = actor.email.clone();
        next.marked_at = now_ms();
    }
    next
}

/// Send `op` for the entry at `key`. The request runs on its own task and is
/// never cancelled; its result comes back through `tx`.
fn dispatch<A: SchedulingApi>(
    api: &Arc<A>,
    tx: &mpsc::UnboundedSender<Completion>,
    outstanding: &mut usize,
    key: Ulid,
    tracked: &mut Tracked,
    op: Op,
) {
    *outstanding += 1;
    tracked.state = SyncState::Pending;
    tracked.in_flight = Some(InFlight {
        op: op.clone(),
        sent_at: Instant::now(),
    });
    let target = tracked.server.as_ref().map(|e| e.id);
    let api = api.clone();
    let tx = tx.clone();
    tokio::spawn(async move {
        let result = match (&op, target) {
            (Op::Create(new), _) => api.create_event(new.clone()).await,
            (Op::Update(patch), Some(id)) => api.update_event(id, patch.clone()).await,
            (Op::Delete, Some(id)) => api.delete_event(id).await,
            (_, None) => Err(EngineError::Validation("event has no server id yet".into())),
        };
        // The reconciler may be gone by now; the write has happened either way.
        let _ = tx.send(Completion { key, op, result });
    });
}

/// Editable view of interview events for one client session.
///
/// Edits show up immediately and are sent one at a time per event; later
/// edits queue behind the in-flight one. Refreshes never overwrite an event
/// with a mutation in flight.
pub struct SyncReconciler<A: SchedulingApi> {
    api: Arc<A>,
    actor: Actor,
    filter: EventFilter,
    entries: HashMap<Ulid, Tracked>,
    /// Generation at which a delete (or vanish) of each id was confirmed.
    removed: HashMap<Ulid, u64>,
    generation: u64,
    outstanding: usize,
    tx: mpsc::UnboundedSender<Completion>,
    rx: mpsc::UnboundedReceiver<Completion>,
    notices: Option<broadcast::Receiver<ChangeNotice>>,
}

impl<A: SchedulingApi> SyncReconciler<A> {
    /// `actor` is only used to stamp optimistic previews; the server stamps
    /// the real values.
    pub fn new(api: Arc<A>, actor: Actor, filter: EventFilter) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let notices = api.subscribe();
        Self {
            api,
            actor,
            filter,
            entries: HashMap::new(),
            removed: HashMap::new(),
            generation: 0,
            outstanding: 0,
            tx,
            rx,
            notices,
        }
    }

    pub fn get(&self, id: Ulid) -> Option<&InterviewEvent> {
        self.entries.get(&id).and_then(|t| t.view.as_ref())
    }

    pub fn state(&self, id: Ulid) -> Option<SyncState> {
        self.entries.get(&id).map(|t| t.state)
    }

    pub fn error(&self, id: Ulid) -> Option<&MutationError> {
        self.entries.get(&id).and_then(|t| t.error.as_ref())
    }

    /// Last server-confirmed value, ignoring anything in flight.
    pub fn confirmed(&self, id: Ulid) -> Option<&InterviewEvent> {
        self.entries.get(&id).and_then(|t| t.server.as_ref())
    }

    /// Visible events, by start time.
    pub fn events(&self) -> Vec<&InterviewEvent> {
        let mut events: Vec<&InterviewEvent> =
            self.entries.values().filter_map(|t| t.view.as_ref()).collect();
        events.sort_by(|a, b| a.start.cmp(&b.start).then(a.id.cmp(&b.id)));
        events
    }

    /// Mutations sent and not yet reconciled, forgotten entries included.
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Optimistically create an event. Returns the provisional id it is
    /// shown under until the server assigns the real one. The provisional id
    /// doubles as the request token unless the caller set one.
    pub fn create(&mut self, mut new: NewEvent) -> Ulid {
        let key = Ulid::new();
        new.request_token.get_or_insert_with(|| key.to_string());
        let mut tracked = Tracked::new(None, self.generation);
        dispatch(&self.api, &self.tx, &mut self.outstanding, key, &mut tracked, Op::Create(new));
        tracked.recompute(key, &self.actor);
        self.entries.insert(key, tracked);
        key
    }

    pub fn edit(&mut self, id: Ulid, patch: EventPatch) -> Result<(), SyncError> {
        if patch.is_empty() {
            return self.visible(id).map(|_| ());
        }
        self.submit(id, Op::Update(patch))
    }

    /// Optimistically delete: the entry is hidden until the server confirms.
    pub fn delete(&mut self, id: Ulid) -> Result<(), SyncError> {
        self.submit(id, Op::Delete)
    }

    fn visible(&mut self, id: Ulid) -> Result<&mut Tracked, SyncError> {
        let tracked = self.entries.get_mut(&id).ok_or(SyncError::UnknownEvent(id))?;
        if tracked.view.is_none() {
            return Err(if tracked.deleting() {
                SyncError::Deleted(id)
            } else {
                SyncError::UnknownEvent(id)
            });
        }
        Ok(tracked)
    }

    fn submit(&mut self, id: Ulid, op: Op) -> Result<(), SyncError> {
        self.visible(id)?;
        let Some(tracked) = self.entries.get_mut(&id) else {
            return Err(SyncError::UnknownEvent(id));
        };
        if tracked.state == SyncState::RolledBack {
            tracked.error = None;
            tracked.state = SyncState::Synced;
        }
        if tracked.in_flight.is_some() {
            tracked.queued.push_back(op);
        } else {
            dispatch(&self.api, &self.tx, &mut self.outstanding, id, tracked, op);
        }
        tracked.recompute(id, &self.actor);
        Ok(())
    }

    /// Resend a failed mutation that may be retried. A create keeps its
    /// request token, so the server will not create it twice.
    pub fn retry(&mut self, id: Ulid) -> Result<(), SyncError> {
        let tracked = self.entries.get_mut(&id).ok_or(SyncError::UnknownEvent(id))?;
        let Some(op) = tracked.error.as_ref().and_then(|e| e.retry.clone()) else {
            return Err(SyncError::NotRetryable(id));
        };
        tracked.error = None;
        dispatch(&self.api, &self.tx, &mut self.outstanding, id, tracked, op);
        tracked.recompute(id, &self.actor);
        Ok(())
    }

    /// Drop queued edits. The in-flight one still completes and is applied.
    pub fn abandon(&mut self, id: Ulid) -> usize {
        let Some(tracked) = self.entries.get_mut(&id) else {
            return 0;
        };
        let dropped = tracked.queued.len();
        tracked.queued.clear();
        tracked.recompute(id, &self.actor);
        dropped
    }

    /// Remove an entry locally. A result still in flight for it is
    /// discarded when it arrives.
    pub fn forget(&mut self, id: Ulid) -> bool {
        self.entries.remove(&id).is_some()
    }

    /// Acknowledge a rollback. A failed create disappears with it.
    pub fn dismiss_error(&mut self, id: Ulid) -> Option<MutationError> {
        let tracked = self.entries.get_mut(&id)?;
        let error = tracked.error.take()?;
        if tracked.state == SyncState::RolledBack {
            tracked.state = SyncState::Synced;
        }
        if tracked.server.is_none() && tracked.in_flight.is_none() {
            self.entries.remove(&id);
        }
        Some(error)
    }

    /// Entries whose in-flight mutation has been out longer than `timeout`.
    /// Advisory: a late result is still reconciled.
    pub fn stalled(&self, timeout: Duration) -> Vec<Ulid> {
        let mut ids: Vec<Ulid> = self
            .entries
            .iter()
            .filter(|(_, t)| t.in_flight.as_ref().is_some_and(|f| f.sent_at.elapsed() >= timeout))
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    /// Wait for the next mutation result and reconcile it. `None` when
    /// nothing is outstanding.
    pub async fn next_completion(&mut self) -> Option<Reconciled> {
        if self.outstanding == 0 {
            return None;
        }
        let completion = self.rx.recv().await?;
        Some(self.apply_completion(completion))
    }

    /// Reconcile every result that has already arrived, without waiting.
    pub fn try_reconcile_ready(&mut self) -> Vec<Reconciled> {
        let mut done = Vec::new();
        while let Ok(completion) = self.rx.try_recv() {
            done.push(self.apply_completion(completion));
        }
        done
    }

    fn apply_completion(&mut self, completion: Completion) -> Reconciled {
        let Completion { key, op, result } = completion;
        self.outstanding = self.outstanding.saturating_sub(1);
        self.generation += 1;
        let generation = self.generation;

        let Some(mut tracked) = self.entries.remove(&key) else {
            debug!(%key, "result for forgotten entry discarded");
            return Reconciled::Discarded(key);
        };
        tracked.in_flight = None;

        match (op, result) {
            (Op::Delete, Ok(_)) | (Op::Delete, Err(EngineError::NotFound(_))) => {
                self.removed.insert(key, generation);
                Reconciled::Deleted(key)
            }
            (Op::Update(_), Err(EngineError::NotFound(_))) => {
                debug!(%key, "event vanished on the server");
                self.removed.insert(key, generation);
                Reconciled::Vanished(key)
            }
            (_, Ok(event)) => {
                let id = event.id;
                if id != key
                    && let Some(existing) = self.entries.get_mut(&id)
                {
                    // A refresh already brought the created event in.
                    if existing.server.as_ref().is_none_or(|s| s.version <= event.version) {
                        existing.server = Some(event.clone());
                        existing.confirmed_gen = generation;
                    }
                    existing.queued.extend(tracked.queued);
                    if existing.in_flight.is_none()
                        && let Some(next) = existing.queued.pop_front()
                    {
                        dispatch(&self.api, &self.tx, &mut self.outstanding, id, existing, next);
                    }
                    existing.recompute(id, &self.actor);
                    return Reconciled::Created {
                        provisional: key,
                        event,
                    };
                }

                tracked.server = Some(event.clone());
                tracked.confirmed_gen = generation;
                tracked.error = None;
                tracked.state = SyncState::Synced;
                if let Some(next) = tracked.queued.pop_front() {
                    dispatch(&self.api, &self.tx, &mut self.outstanding, id, &mut tracked, next);
                }
                tracked.recompute(id, &self.actor);
                self.entries.insert(id, tracked);
                if id == key {
                    Reconciled::Confirmed(event)
                } else {
                    Reconciled::Created {
                        provisional: key,
                        event,
                    }
                }
            }
            (op, Err(err)) => {
                let error = MutationError {
                    kind: err.kind(),
                    message: err.to_string(),
                    retry: err.is_retryable().then_some(op),
                    discarded: tracked.queued.len(),
                };
                debug!(%key, kind = error.kind.as_str(), "mutation rolled back");
                tracked.queued.clear();
                tracked.state = SyncState::RolledBack;
                tracked.error = Some(error.clone());
                tracked.recompute(key, &self.actor);
                self.entries.insert(key, tracked);
                Reconciled::RolledBack { id: key, error }
            }
        }
    }

    /// Fetch the server's current events and merge them into the view.
    /// Returns how many entries changed.
    pub async fn refresh(&mut self) -> Result<usize, SyncError> {
        let started = self.generation;
        let events = self.api.list_events(&self.filter).await.map_err(SyncError::Api)?;
        Ok(self.apply_snapshot_at(started, events))
    }

    /// Merge a server snapshot taken after every result reconciled so far.
    pub fn apply_snapshot(&mut self, events: Vec<InterviewEvent>) -> usize {
        self.apply_snapshot_at(self.generation, events)
    }

    /// Count of results reconciled so far. Record it before fetching a
    /// snapshot out of band and pass it to [`Self::apply_snapshot_at`].
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Merge a snapshot fetched when [`Self::generation`] was `taken_at`.
    ///
    /// Pending entries are left alone, rows older than what is held are
    /// ignored, and an entry missing from the snapshot is dropped only if it
    /// was not confirmed after the snapshot was taken. Rows for events whose
    /// delete was confirmed after that point are skipped.
    pub fn apply_snapshot_at(&mut self, taken_at: u64, events: Vec<InterviewEvent>) -> usize {
        let mut seen = HashSet::with_capacity(events.len());
        let mut changed = 0;
        for event in events {
            let id = event.id;
            seen.insert(id);
            match self.entries.get_mut(&id) {
                None if self.removed.get(&id).is_some_and(|g| *g > taken_at) => {}
                None => {
                    self.entries.insert(id, Tracked::new(Some(event), self.generation));
                    changed += 1;
                }
                Some(tracked) if tracked.state == SyncState::Pending => {}
                Some(tracked) => {
                    if tracked.server.as_ref().is_some_and(|s| s.version >= event.version) {
                        continue;
                    }
                    tracked.server = Some(event);
                    tracked.recompute(id, &self.actor);
                    changed += 1;
                }
            }
        }

        let before = self.entries.len();
        self.entries.retain(|id, t| {
            seen.contains(id)
                || t.state == SyncState::Pending
                || t.server.is_none()
                || t.confirmed_gen > taken_at
        });
        self.removed.retain(|_, g| *g > taken_at);
        changed + (before - self.entries.len())
    }

    /// Refresh if any change notice arrived since the last check.
    pub async fn refresh_if_notified(&mut self) -> Result<bool, SyncError> {
        let Some(notices) = self.notices.as_mut() else {
            return Ok(false);
        };
        let mut notified = false;
        loop {
            match notices.try_recv() {
                Ok(_) | Err(broadcast::error::TryRecvError::Lagged(_)) => notified = true,
                Err(_) => break,
            }
        }
        if notified {
            self.refresh().await?;
        }
        Ok(notified)
    }
}
