//! Client-side synchronization: an editable view of interview events that
//! applies edits optimistically and reconciles them with the server.

mod api;
mod reconciler;

pub use api::{EngineSession, SchedulingApi};
pub use reconciler::{MutationError, Op, Reconciled, SyncError, SyncReconciler, SyncState};
