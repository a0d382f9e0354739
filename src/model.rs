use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only time type.
pub type Ms = i64;

/// Outcome of an interview. Any status may move to any other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Pending,
    Attended,
    Ghosted,
    Cancelled,
}

impl EventStatus {
    pub const ALL: [EventStatus; 4] = [
        EventStatus::Pending,
        EventStatus::Attended,
        EventStatus::Ghosted,
        EventStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "pending",
            EventStatus::Attended => "attended",
            EventStatus::Ghosted => "ghosted",
            EventStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(EventStatus::Pending),
            "attended" => Ok(EventStatus::Attended),
            "ghosted" => Ok(EventStatus::Ghosted),
            "cancelled" | "canceled" => Ok(EventStatus::Cancelled),
            other => Err(format!("unknown status: {other}")),
        }
    }
}

/// Whoever is performing a mutation. The email doubles as the audit key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub email: String,
    pub name: String,
}

impl Actor {
    pub fn new(email: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            name: name.into(),
        }
    }
}

/// Trim + lowercase so slot identity never depends on how an email was typed.
pub fn normalize_subject(key: &str) -> String {
    key.trim().to_lowercase()
}

/// The canonical, server-confirmed interview record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterviewEvent {
    pub id: Ulid,
    /// Interviewer email. A soft reference: no interviewer record is required.
    pub interviewer: String,
    pub start: Ms,
    pub end: Ms,
    pub status: EventStatus,
    pub marked_by: String,
    pub marked_at: Ms,
    pub candidate_name: Option<String>,
    pub position: Option<String>,
    pub notes: Option<String>,
    pub created_by: String,
    pub created_at: Ms,
    pub updated_at: Ms,
    /// Bumped on every committed update, starting at 1.
    pub version: u64,
}

/// Input to a create.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NewEvent {
    pub interviewer: String,
    pub start: Ms,
    pub end: Ms,
    /// Defaults to `pending`.
    pub status: Option<EventStatus>,
    pub candidate_name: Option<String>,
    pub position: Option<String>,
    pub notes: Option<String>,
    /// Client-generated token; a retried create with the same token returns
    /// the original event.
    pub request_token: Option<String>,
}

impl NewEvent {
    pub fn new(interviewer: impl Into<String>, start: Ms, end: Ms) -> Self {
        Self {
            interviewer: interviewer.into(),
            start,
            end,
            ..Default::default()
        }
    }
}

/// Partial update. `None` leaves a field alone; for free-form text,
/// `Some(None)` clears it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EventPatch {
    pub interviewer: Option<String>,
    pub start: Option<Ms>,
    pub end: Option<Ms>,
    pub status: Option<EventStatus>,
    pub candidate_name: Option<Option<String>>,
    pub position: Option<Option<String>>,
    pub notes: Option<Option<String>>,
}

impl EventPatch {
    pub fn status(status: EventStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn start(start: Ms) -> Self {
        Self {
            start: Some(start),
            ..Default::default()
        }
    }

    pub fn times(start: Ms, end: Ms) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Merge the patch over `base`. Pure field merge: no validation, no
    /// stamping. The server stamps and validates the result; clients use it
    /// for the optimistic preview.
    pub fn apply_to(&self, base: &InterviewEvent) -> InterviewEvent {
        let mut merged = base.clone();
        if let Some(ref k) = self.interviewer {
            merged.interviewer = normalize_subject(k);
        }
        if let Some(start) = self.start {
            merged.start = start;
        }
        if let Some(end) = self.end {
            merged.end = end;
        }
        if let Some(status) = self.status {
            merged.status = status;
        }
        if let Some(ref v) = self.candidate_name {
            merged.candidate_name = v.clone();
        }
        if let Some(ref v) = self.position {
            merged.position = v.clone();
        }
        if let Some(ref v) = self.notes {
            merged.notes = v.clone();
        }
        merged
    }
}

/// Read-side filter for `list_events`. The date range applies to `start`,
/// as `[start_from, start_before)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    pub interviewer: Option<String>,
    pub status: Option<EventStatus>,
    pub start_from: Option<Ms>,
    pub start_before: Option<Ms>,
}

impl EventFilter {
    pub fn for_interviewer(key: &str) -> Self {
        Self {
            interviewer: Some(normalize_subject(key)),
            ..Default::default()
        }
    }

    pub fn matches(&self, event: &InterviewEvent) -> bool {
        if let Some(ref k) = self.interviewer
            && *k != event.interviewer {
                return false;
            }
        if let Some(s) = self.status
            && s != event.status {
                return false;
            }
        if let Some(from) = self.start_from
            && event.start < from {
                return false;
            }
        if let Some(before) = self.start_before
            && event.start >= before {
                return false;
            }
        true
    }
}

// ── Audit ────────────────────────────────────────────────────────

pub const ENTITY_TYPE: &str = "interview_event";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AuditAction {
    Create,
    Update,
    Delete,
}

impl AuditAction {
    /// Verb + entity type, e.g. `update_interview_event`.
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Create => "create_interview_event",
            AuditAction::Update => "update_interview_event",
            AuditAction::Delete => "delete_interview_event",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create_interview_event" | "create" => Ok(AuditAction::Create),
            "update_interview_event" | "update" => Ok(AuditAction::Update),
            "delete_interview_event" | "delete" => Ok(AuditAction::Delete),
            other => Err(format!("unknown audit action: {other}")),
        }
    }
}

/// A single field value as it appears in an audit diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldValue {
    Null,
    Text(String),
    Int(i64),
}

impl FieldValue {
    pub fn text(v: &Option<String>) -> Self {
        match v {
            Some(s) => FieldValue::Text(s.clone()),
            None => FieldValue::Null,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            FieldValue::Null => serde_json::Value::Null,
            FieldValue::Text(s) => serde_json::Value::String(s.clone()),
            FieldValue::Int(i) => serde_json::Value::from(*i),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldChange {
    pub from: FieldValue,
    pub to: FieldValue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Changes {
    /// Full snapshot of the new record.
    Created(BTreeMap<String, FieldValue>),
    /// Only the fields that changed.
    Updated(BTreeMap<String, FieldChange>),
    /// Final state of the removed record.
    Deleted(BTreeMap<String, FieldValue>),
}

impl Changes {
    pub fn to_json(&self) -> serde_json::Value {
        let snapshot = |fields: &BTreeMap<String, FieldValue>| {
            fields
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect::<serde_json::Map<_, _>>()
        };
        match self {
            Changes::Created(fields) => serde_json::json!({ "created": snapshot(fields) }),
            Changes::Deleted(fields) => serde_json::json!({ "deleted": snapshot(fields) }),
            Changes::Updated(diff) => {
                let map: serde_json::Map<_, _> = diff
                    .iter()
                    .map(|(k, c)| {
                        (k.clone(), serde_json::json!({ "from": c.from.to_json(), "to": c.to.to_json() }))
                    })
                    .collect();
                serde_json::Value::Object(map)
            }
        }
    }
}

/// Immutable record of one committed mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: Ulid,
    pub actor_email: String,
    pub actor_name: String,
    pub action: AuditAction,
    pub entity_type: String,
    pub entity_id: Ulid,
    pub changes: Changes,
    pub timestamp: Ms,
}

/// Filter criteria for audit queries. Results come back newest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditFilter {
    pub entity_id: Option<Ulid>,
    pub actor_email: Option<String>,
    pub action: Option<AuditAction>,
    pub since: Option<Ms>,
    pub limit: Option<usize>,
}

// ── WAL records ──────────────────────────────────────────────────

/// WAL record format. Each mutating record carries its audit entry so the
/// data change and the audit row are durable together or not at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Record {
    EventCreated {
        event: InterviewEvent,
        request_token: Option<String>,
        audit: AuditLogEntry,
    },
    EventUpdated {
        /// Previous interviewer, so replay can move the event between subjects.
        previous_interviewer: String,
        event: InterviewEvent,
        audit: AuditLogEntry,
    },
    EventDeleted {
        id: Ulid,
        interviewer: String,
        audit: AuditLogEntry,
    },
    /// Compaction snapshot of a live event.
    EventRestored {
        event: InterviewEvent,
        request_token: Option<String>,
    },
    /// Compaction copy of a historical audit entry.
    AuditArchived(AuditLogEntry),
}

/// Broadcast to subscribers of an interviewer's schedule after each commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeNotice {
    pub interviewer: String,
    pub event_id: Ulid,
    pub action: AuditAction,
    pub actor_email: String,
    pub version: u64,
}
