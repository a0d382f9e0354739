//! Append-only audit trail.
//!
//! Entries are built by [`AuditTrail::prepare`] before a mutation commits,
//! travel inside the same WAL record as the data change, and are appended
//! here only after that record is durable. Nothing outside the engine can
//! append; everything else is a read-only projection.

use std::collections::BTreeMap;

use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;

/// What happened to an event, with the states needed to describe it.
pub enum Mutation<'a> {
    Created(&'a InterviewEvent),
    Updated {
        before: &'a InterviewEvent,
        after: &'a InterviewEvent,
    },
    Deleted(&'a InterviewEvent),
}

/// The audited fields of an event. Bookkeeping (`updated_at`, `version`)
/// is left out so diffs only show what an editor changed.
fn fields(event: &InterviewEvent) -> [(&'static str, FieldValue); 11] {
    [
        ("interviewer", FieldValue::Text(event.interviewer.clone())),
        ("start_time", FieldValue::Int(event.start)),
        ("end_time", FieldValue::Int(event.end)),
        ("status", FieldValue::Text(event.status.as_str().to_string())),
        ("marked_by", FieldValue::Text(event.marked_by.clone())),
        ("marked_at", FieldValue::Int(event.marked_at)),
        ("candidate_name", FieldValue::text(&event.candidate_name)),
        ("position", FieldValue::text(&event.position)),
        ("notes", FieldValue::text(&event.notes)),
        ("created_by", FieldValue::Text(event.created_by.clone())),
        ("created_at", FieldValue::Int(event.created_at)),
    ]
}

pub fn snapshot(event: &InterviewEvent) -> BTreeMap<String, FieldValue> {
    fields(event)
        .into_iter()
        .map(|(name, value)| (name.to_string(), value))
        .collect()
}

/// Field-level diff containing only the fields whose value changed.
pub fn diff(before: &InterviewEvent, after: &InterviewEvent) -> BTreeMap<String, FieldChange> {
    fields(before)
        .into_iter()
        .zip(fields(after))
        .filter(|((_, from), (_, to))| from != to)
        .map(|((name, from), (_, to))| (name.to_string(), FieldChange { from, to }))
        .collect()
}

#[derive(Debug, Default)]
pub struct AuditTrail {
    entries: RwLock<Vec<AuditLogEntry>>,
}

impl AuditTrail {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_entries(entries: Vec<AuditLogEntry>) -> Self {
        Self {
            entries: RwLock::new(entries),
        }
    }

    /// Build (but do not store) the entry describing `mutation`.
    pub fn prepare(actor: &Actor, mutation: Mutation<'_>, timestamp: Ms) -> AuditLogEntry {
        let (action, entity_id, changes) = match mutation {
            Mutation::Created(ev) => (AuditAction::Create, ev.id, Changes::Created(snapshot(ev))),
            Mutation::Updated { before, after } => {
                (AuditAction::Update, after.id, Changes::Updated(diff(before, after)))
            }
            Mutation::Deleted(ev) => (AuditAction::Delete, ev.id, Changes::Deleted(snapshot(ev))),
        };
        AuditLogEntry {
            id: Ulid::new(),
            actor_email: actor.email.clone(),
            actor_name: actor.name.clone(),
            action,
            entity_type: ENTITY_TYPE.to_string(),
            entity_id,
            changes,
            timestamp,
        }
    }

    /// Store an entry whose WAL record has already been committed.
    pub(crate) async fn append(&self, entry: AuditLogEntry) {
        self.entries.write().await.push(entry);
        metrics::counter!(crate::observability::AUDIT_ENTRIES_TOTAL).increment(1);
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Every entry, oldest first. Used by compaction.
    pub(crate) async fn all(&self) -> Vec<AuditLogEntry> {
        self.entries.read().await.clone()
    }

    /// Entries matching `filter`, newest first.
    pub async fn list(&self, filter: &AuditFilter) -> Vec<AuditLogEntry> {
        let limit = filter
            .limit
            .unwrap_or(crate::limits::MAX_AUDIT_ROWS)
            .min(crate::limits::MAX_AUDIT_ROWS);
        let actor = filter.actor_email.as_deref().map(normalize_subject);
        let entries = self.entries.read().await;
        let mut matched: Vec<AuditLogEntry> = entries
            .iter()
            .filter(|e| filter.entity_id.is_none_or(|id| e.entity_id == id))
            .filter(|e| actor.as_deref().is_none_or(|a| e.actor_email == a))
            .filter(|e| filter.action.is_none_or(|a| e.action == a))
            .filter(|e| filter.since.is_none_or(|t| e.timestamp >= t))
            .cloned()
            .collect();
        // Stable sort keeps commit order among equal timestamps.
        matched.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        matched.truncate(limit);
        matched
    }

    pub async fn by_entity(&self, entity_id: Ulid) -> Vec<AuditLogEntry> {
        self.list(&AuditFilter {
            entity_id: Some(entity_id),
            ..Default::default()
        })
        .await
    }

    pub async fn by_actor(&self, actor_email: &str) -> Vec<AuditLogEntry> {
        self.list(&AuditFilter {
            actor_email: Some(actor_email.to_string()),
            ..Default::default()
        })
        .await
    }

    pub async fn recent(&self, limit: usize) -> Vec<AuditLogEntry> {
        self.list(&AuditFilter {
            limit: Some(limit),
            ..Default::default()
        })
        .await
    }

    /// Entry count per action name.
    pub async fn stats_by_action(&self) -> BTreeMap<String, u64> {
        let entries = self.entries.read().await;
        let mut stats = BTreeMap::new();
        for entry in entries.iter() {
            *stats.entry(entry.action.as_str().to_string()).or_insert(0) += 1;
        }
        stats
    }
}
