mod audit;
mod conflict;
mod error;
mod mutations;
mod queries;
#[cfg(test)]
mod tests;

pub use audit::{diff, snapshot, AuditTrail, Mutation};
pub use conflict::{slot_of, ConflictIndex, SlotKey};
pub use error::{EngineError, ErrorKind};

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono_tz::Tz;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock};
use tracing::warn;
use ulid::Ulid;

use crate::guard::{AuthorizationGuard, ResourceClass};
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedSubjectState = Arc<RwLock<SubjectState>>;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Timezone whose calendar days and wall-clock minutes define a slot.
    pub timezone: Tz,
    /// How long a create's request token keeps deduplicating retries.
    pub token_ttl_ms: Ms,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timezone: chrono_tz::UTC,
            token_ttl_ms: 24 * 3_600_000,
        }
    }
}

/// One interviewer's schedule. Every mutation holds this state's write lock
/// across its conflict check, WAL append, and apply.
#[derive(Debug, Clone)]
pub struct SubjectState {
    pub key: String,
    pub events: HashMap<Ulid, InterviewEvent>,
    pub index: ConflictIndex,
}

impl SubjectState {
    pub fn new(key: String) -> Self {
        Self {
            key,
            events: HashMap::new(),
            index: ConflictIndex::new(),
        }
    }

    pub fn insert_event(&mut self, event: InterviewEvent, tz: Tz) {
        if let Some(slot) = slot_of(event.start, tz)
            && !self.index.insert(slot, event.id) {
                // Only reachable on replay after a timezone change.
                warn!(
                    interviewer = %self.key,
                    event = %event.id,
                    %slot,
                    "slot already held on replay; event kept but not indexed"
                );
            }
        self.events.insert(event.id, event);
    }

    pub fn remove_event(&mut self, id: Ulid, tz: Tz) -> Option<InterviewEvent> {
        let event = self.events.remove(&id)?;
        if let Some(slot) = slot_of(event.start, tz) {
            self.index.remove(slot, id);
        }
        Some(event)
    }
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        record: Record,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        records: Vec<Record>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type Pending = (Record, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit:
/// take the first append, drain whatever else is already queued, then one
/// flush + fsync for the whole batch before answering every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let mut batch = match cmd {
            WalCommand::Append { record, response } => vec![(record, response)],
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { record, response } => batch.push((record, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        respond_batch(batch, &result);

        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

/// Append and sync a whole batch. On any failure the batch is cut back out
/// of the log, so a record reported as failed can never be replayed.
fn flush_batch(wal: &mut Wal, batch: &[Pending]) -> io::Result<()> {
    let result = batch
        .iter()
        .try_for_each(|(record, _)| wal.append_buffered(record))
        .and_then(|()| wal.flush_sync());
    if result.is_err()
        && let Err(e) = wal.discard_unsynced()
    {
        tracing::error!("WAL rollback failed, retrying before next append: {e}");
    }
    result
}

fn respond_batch(batch: Vec<Pending>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { records, response } => {
            let result = Wal::write_compact_file(wal.path(), &records)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// In-memory state rebuilt from the WAL before the engine starts serving.
#[derive(Default)]
struct Replay {
    subjects: HashMap<String, SubjectState>,
    tokens: HashMap<String, (Ulid, Ms)>,
    audit: Vec<AuditLogEntry>,
}

impl Replay {
    fn subject(&mut self, key: &str) -> &mut SubjectState {
        self.subjects
            .entry(key.to_string())
            .or_insert_with(|| SubjectState::new(key.to_string()))
    }

    fn apply(&mut self, record: Record, tz: Tz) {
        match record {
            Record::EventCreated {
                event,
                request_token,
                audit,
            } => {
                self.restore(event, request_token, tz);
                self.audit.push(audit);
            }
            Record::EventRestored {
                event,
                request_token,
            } => self.restore(event, request_token, tz),
            Record::EventUpdated {
                previous_interviewer,
                event,
                audit,
            } => {
                if let Some(rs) = self.subjects.get_mut(&previous_interviewer) {
                    rs.remove_event(event.id, tz);
                }
                self.subject(&event.interviewer.clone()).insert_event(event, tz);
                self.audit.push(audit);
            }
            Record::EventDeleted {
                id,
                interviewer,
                audit,
            } => {
                if let Some(rs) = self.subjects.get_mut(&interviewer) {
                    rs.remove_event(id, tz);
                }
                self.audit.push(audit);
            }
            Record::AuditArchived(entry) => self.audit.push(entry),
        }
    }

    fn restore(&mut self, event: InterviewEvent, request_token: Option<String>, tz: Tz) {
        if let Some(token) = request_token {
            self.tokens.insert(token, (event.id, event.created_at));
        }
        self.subject(&event.interviewer.clone()).insert_event(event, tz);
    }
}

/// The scheduling service: sole writer of interview events.
pub struct Engine {
    pub(super) subjects: DashMap<String, SharedSubjectState>,
    /// Reverse lookup: event id → interviewer key.
    pub(super) event_to_subject: DashMap<Ulid, String>,
    /// Create request token → (event id, issued at).
    pub(super) request_tokens: DashMap<String, (Ulid, Ms)>,
    /// Tokens of creates currently in progress.
    pub(super) token_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    pub(super) audit: AuditTrail,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Mutations hold this shared while they commit; compaction holds it
    /// exclusively so its snapshot cannot miss an in-flight record.
    pub(super) commit_gate: RwLock<()>,
    pub notify: Arc<NotifyHub>,
    pub(super) guard: Arc<dyn AuthorizationGuard>,
    pub(super) config: EngineConfig,
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        guard: Arc<dyn AuthorizationGuard>,
        config: EngineConfig,
    ) -> io::Result<Self> {
        let mut replay = Replay::default();
        for record in Wal::recover(&wal_path)? {
            replay.apply(record, config.timezone);
        }

        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let event_to_subject = DashMap::new();
        let subjects = DashMap::new();
        for (key, rs) in replay.subjects {
            for id in rs.events.keys() {
                event_to_subject.insert(*id, key.clone());
            }
            subjects.insert(key, Arc::new(RwLock::new(rs)));
        }

        Ok(Self {
            subjects,
            event_to_subject,
            request_tokens: replay.tokens.into_iter().collect(),
            token_locks: DashMap::new(),
            audit: AuditTrail::from_entries(replay.audit),
            wal_tx,
            commit_gate: RwLock::new(()),
            notify,
            guard,
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn audit(&self) -> &AuditTrail {
        &self.audit
    }

    /// Get or lazily create an interviewer's state. Interviewers are soft
    /// references, so any key is accepted.
    pub(super) fn subject(&self, key: &str) -> SharedSubjectState {
        if let Some(rs) = self.subjects.get(key) {
            return rs.value().clone();
        }
        self.subjects
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(SubjectState::new(key.to_string()))))
            .value()
            .clone()
    }

    pub(super) fn subject_of(&self, id: &Ulid) -> Option<String> {
        self.event_to_subject.get(id).map(|e| e.value().clone())
    }

    /// Write-lock two interviewers in key order so concurrent moves between
    /// the same pair cannot deadlock. Returns `(a, b)` in argument order.
    pub(super) async fn lock_pair(
        &self,
        a: &str,
        b: &str,
    ) -> (OwnedRwLockWriteGuard<SubjectState>, OwnedRwLockWriteGuard<SubjectState>) {
        let (ra, rb) = (self.subject(a), self.subject(b));
        if a < b {
            let ga = ra.write_owned().await;
            let gb = rb.write_owned().await;
            (ga, gb)
        } else {
            let gb = rb.write_owned().await;
            let ga = ra.write_owned().await;
            (ga, gb)
        }
    }

    pub(super) fn authorize(&self, actor: &Actor, action: AuditAction) -> Result<(), EngineError> {
        if self
            .guard
            .authorize(actor, action, ResourceClass::InterviewEvent)
            .is_allowed()
        {
            return Ok(());
        }
        metrics::counter!(crate::observability::AUTH_DENIALS_TOTAL, "action" => action.as_str())
            .increment(1);
        tracing::debug!(actor = %actor.email, %action, "write denied");
        Err(EngineError::Forbidden {
            actor: actor.email.clone(),
            action,
        })
    }

    /// Write a record through the group-commit writer and wait until it is
    /// durable.
    pub(super) async fn wal_append(&self, record: Record) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                record,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::StorageUnavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::StorageUnavailable("WAL writer dropped response".into()))?
            .map_err(|e| {
                tracing::error!("WAL append failed: {e}");
                EngineError::StorageUnavailable(e.to_string())
            })
    }
}
