use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::engine::{Engine, EngineError};
use crate::model::*;

/// The scheduling operations a client session can call. Every call is made
/// on behalf of the session's actor.
#[async_trait]
pub trait SchedulingApi: Send + Sync + 'static {
    async fn create_event(&self, new: NewEvent) -> Result<InterviewEvent, EngineError>;

    async fn update_event(&self, id: Ulid, patch: EventPatch) -> Result<InterviewEvent, EngineError>;

    /// Returns the event's final state.
    async fn delete_event(&self, id: Ulid) -> Result<InterviewEvent, EngineError>;

    async fn get_event(&self, id: Ulid) -> Result<Option<InterviewEvent>, EngineError>;

    async fn list_events(&self, filter: &EventFilter) -> Result<Vec<InterviewEvent>, EngineError>;

    /// Change notices that should trigger a refresh, if the transport has them.
    fn subscribe(&self) -> Option<broadcast::Receiver<ChangeNotice>> {
        None
    }
}

/// In-process session: an engine plus the actor calls are made as.
pub struct EngineSession {
    engine: Arc<Engine>,
    actor: Actor,
}

impl EngineSession {
    pub fn new(engine: Arc<Engine>, actor: Actor) -> Self {
        Self { engine, actor }
    }

    pub fn actor(&self) -> &Actor {
        &self.actor
    }
}

#[async_trait]
impl SchedulingApi for EngineSession {
    async fn create_event(&self, new: NewEvent) -> Result<InterviewEvent, EngineError> {
        self.engine.create_event(&self.actor, new).await
    }

    async fn update_event(&self, id: Ulid, patch: EventPatch) -> Result<InterviewEvent, EngineError> {
        self.engine.update_event(&self.actor, id, patch).await
    }

    async fn delete_event(&self, id: Ulid) -> Result<InterviewEvent, EngineError> {
        self.engine.delete_event(&self.actor, id).await
    }

    async fn get_event(&self, id: Ulid) -> Result<Option<InterviewEvent>, EngineError> {
        Ok(self.engine.get_event(id).await)
    }

    async fn list_events(&self, filter: &EventFilter) -> Result<Vec<InterviewEvent>, EngineError> {
        self.engine.list_events(filter).await
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<ChangeNotice>> {
        Some(self.engine.notify.subscribe_all())
    }
}
