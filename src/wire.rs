use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use async_trait::async_trait;
use futures::{stream, Sink, SinkExt};
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::response::NotificationResponse;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tracing::debug;

use crate::auth::InterviewdAuthSource;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability::{self, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command};
use crate::tenant::TenantManager;

/// Channel carrying every change notice of a tenant.
pub const ALL_EVENTS_CHANNEL: &str = "interview_events";
/// Prefix of per-interviewer channels: `interviewer:<email>`.
pub const INTERVIEWER_CHANNEL_PREFIX: &str = "interviewer:";

/// One handler per connection; it owns that connection's LISTEN
/// subscriptions, which go away with it.
pub struct InterviewdHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<InterviewdQueryParser>,
    listening: Mutex<HashMap<String, broadcast::Receiver<ChangeNotice>>>,
}

impl InterviewdHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(InterviewdQueryParser),
            listening: Mutex::new(HashMap::new()),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| {
            metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
            user_error("08006", format!("tenant error: {e}"))
        })
    }

    /// The login user is the acting email.
    fn resolve_actor<C: ClientInfo>(&self, client: &C) -> PgWireResult<Actor> {
        match client.metadata().get("user").filter(|u| !u.trim().is_empty()) {
            Some(user) => Ok(self.tenant_manager.policy().actor_for(user)),
            None => {
                metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
                Err(user_error("28000", "no login user".to_string()))
            }
        }
    }

    /// Parse, execute, and time one statement, delivering queued change
    /// notices first.
    async fn run<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        self.deliver_notices(client).await?;
        let engine = self.resolve_engine(client)?;
        let actor = self.resolve_actor(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;

        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(&engine, &actor, cmd).await;
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        result
    }

    async fn execute_command(
        &self,
        engine: &Engine,
        actor: &Actor,
        cmd: Command,
    ) -> PgWireResult<Vec<Response>> {
        match cmd {
            Command::InsertEvent { event, returning } => {
                let created = engine.create_event(actor, event).await.map_err(engine_err)?;
                Ok(vec![write_response("INSERT", returning, created)])
            }
            Command::UpdateEvent { id, patch, returning } => {
                let updated = engine.update_event(actor, id, patch).await.map_err(engine_err)?;
                Ok(vec![write_response("UPDATE", returning, updated)])
            }
            Command::DeleteEvent { id, returning } => {
                let deleted = engine.delete_event(actor, id).await.map_err(engine_err)?;
                Ok(vec![write_response("DELETE", returning, deleted)])
            }
            Command::GetEvent { id } => {
                let found = engine.get_event(id).await;
                Ok(vec![event_rows(found.into_iter().collect())])
            }
            Command::SelectEvents { filter } => {
                let events = engine.list_events(&filter).await.map_err(engine_err)?;
                Ok(vec![event_rows(events)])
            }
            Command::SelectConflict {
                interviewer,
                start,
                exclude,
            } => {
                let conflict = engine
                    .has_conflict(&interviewer, start, exclude)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(conflict_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&normalize_subject(&interviewer))?;
                encoder.encode_field(&start)?;
                encoder.encode_field(&conflict)?;
                let rows: Vec<PgWireResult<_>> = vec![Ok(encoder.take_row())];
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectAudit { filter } => {
                let entries = engine.audit().list(&filter).await;
                Ok(vec![audit_rows(entries)])
            }
            Command::SelectAuditStats => {
                let stats = engine.audit().stats_by_action().await;
                let schema = Arc::new(stats_schema());
                let rows: Vec<PgWireResult<_>> = stats
                    .into_iter()
                    .map(|(action, count)| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&action)?;
                        encoder.encode_field(&(count as i64))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::Listen { channel } => {
                let rx = if channel == ALL_EVENTS_CHANNEL {
                    engine.notify.subscribe_all()
                } else if let Some(email) = channel.strip_prefix(INTERVIEWER_CHANNEL_PREFIX) {
                    engine.notify.subscribe(&normalize_subject(email))
                } else {
                    return Err(user_error(
                        "42000",
                        format!(
                            "invalid channel: {channel} (expected {ALL_EVENTS_CHANNEL} or {INTERVIEWER_CHANNEL_PREFIX}<email>)"
                        ),
                    ));
                };
                // Re-listening keeps the existing subscription.
                self.listening().entry(channel).or_insert(rx);
                Ok(vec![Response::Execution(Tag::new("LISTEN"))])
            }
            Command::Unlisten { channel } => {
                self.listening().remove(&channel);
                if let Some(email) = channel.strip_prefix(INTERVIEWER_CHANNEL_PREFIX) {
                    engine.notify.remove_if_idle(&normalize_subject(email));
                }
                Ok(vec![Response::Execution(Tag::new("UNLISTEN"))])
            }
            Command::UnlistenAll => {
                self.listening().clear();
                Ok(vec![Response::Execution(Tag::new("UNLISTEN"))])
            }
        }
    }

    fn listening(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<String, broadcast::Receiver<ChangeNotice>>> {
        self.listening.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Send every notice queued on this connection's channels.
    async fn deliver_notices<C>(&self, client: &mut C) -> PgWireResult<()>
    where
        C: Sink<PgWireBackendMessage> + Unpin + Send,
        PgWireError: From<C::Error>,
    {
        let mut pending = Vec::new();
        {
            let mut listening = self.listening();
            for (channel, rx) in listening.iter_mut() {
                loop {
                    match rx.try_recv() {
                        Ok(notice) => pending.push((channel.clone(), notice)),
                        Err(broadcast::error::TryRecvError::Lagged(n)) => {
                            debug!(%channel, "listener lagged, {n} notices dropped");
                        }
                        Err(_) => break,
                    }
                }
            }
        }
        for (channel, notice) in pending {
            let payload = serde_json::to_string(&notice)
                .map_err(|e| user_error("XX000", format!("notice encoding failed: {e}")))?;
            client
                .send(PgWireBackendMessage::NotificationResponse(
                    NotificationResponse::new(0, channel, payload),
                ))
                .await?;
        }
        Ok(())
    }
}

fn write_response(tag: &str, returning: bool, event: InterviewEvent) -> Response {
    if returning {
        event_rows(vec![event])
    } else {
        Response::Execution(Tag::new(tag).with_rows(1))
    }
}

// ── Row schemas ──────────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn event_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("interviewer", Type::VARCHAR),
        field("start_time", Type::INT8),
        field("end_time", Type::INT8),
        field("status", Type::VARCHAR),
        field("marked_by", Type::VARCHAR),
        field("marked_at", Type::INT8),
        field("candidate_name", Type::VARCHAR),
        field("position", Type::VARCHAR),
        field("notes", Type::VARCHAR),
        field("created_by", Type::VARCHAR),
        field("created_at", Type::INT8),
        field("updated_at", Type::INT8),
        field("version", Type::INT8),
    ]
}

fn audit_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("actor_email", Type::VARCHAR),
        field("actor_name", Type::VARCHAR),
        field("action", Type::VARCHAR),
        field("entity_type", Type::VARCHAR),
        field("entity_id", Type::VARCHAR),
        field("changes", Type::VARCHAR),
        field("timestamp", Type::INT8),
    ]
}

fn stats_schema() -> Vec<FieldInfo> {
    vec![field("action", Type::VARCHAR), field("count", Type::INT8)]
}

fn conflict_schema() -> Vec<FieldInfo> {
    vec![
        field("interviewer", Type::VARCHAR),
        field("start_time", Type::INT8),
        field("conflict", Type::BOOL),
    ]
}

fn event_rows(events: Vec<InterviewEvent>) -> Response {
    let schema = Arc::new(event_schema());
    let rows: Vec<PgWireResult<_>> = events
        .into_iter()
        .map(|ev| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&ev.id.to_string())?;
            encoder.encode_field(&ev.interviewer)?;
            encoder.encode_field(&ev.start)?;
            encoder.encode_field(&ev.end)?;
            encoder.encode_field(&ev.status.to_string())?;
            encoder.encode_field(&ev.marked_by)?;
            encoder.encode_field(&ev.marked_at)?;
            encoder.encode_field(&ev.candidate_name)?;
            encoder.encode_field(&ev.position)?;
            encoder.encode_field(&ev.notes)?;
            encoder.encode_field(&ev.created_by)?;
            encoder.encode_field(&ev.created_at)?;
            encoder.encode_field(&ev.updated_at)?;
            encoder.encode_field(&(ev.version as i64))?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn audit_rows(entries: Vec<AuditLogEntry>) -> Response {
    let schema = Arc::new(audit_schema());
    let rows: Vec<PgWireResult<_>> = entries
        .into_iter()
        .map(|entry| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&entry.id.to_string())?;
            encoder.encode_field(&entry.actor_email)?;
            encoder.encode_field(&entry.actor_name)?;
            encoder.encode_field(&entry.action.to_string())?;
            encoder.encode_field(&entry.entity_type)?;
            encoder.encode_field(&entry.entity_id.to_string())?;
            encoder.encode_field(&entry.changes.to_json().to_string())?;
            encoder.encode_field(&entry.timestamp)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

/// Result columns for a statement, judged from its text so that
/// placeholders need not parse.
fn schema_for_sql(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    let reads = upper.trim_start().starts_with("SELECT");
    if reads && upper.contains("AUDIT_STATS") {
        stats_schema()
    } else if reads && upper.contains("AUDIT_LOG") {
        audit_schema()
    } else if reads && upper.contains("SLOT_CONFLICTS") {
        conflict_schema()
    } else if upper.contains("INTERVIEW_EVENTS") && (reads || upper.contains("RETURNING")) {
        event_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for InterviewdHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        self.run(client, query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct InterviewdQueryParser;

#[async_trait]
impl QueryParser for InterviewdQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(schema_for_sql(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for InterviewdHandler {
    type Statement = String;
    type QueryParser = InterviewdQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let sql = substitute_params(portal);
        let mut responses = self.run(client, &sql).await?;
        Ok(responses.remove(0))
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            schema_for_sql(&target.statement),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(schema_for_sql(
            &target.statement.statement,
        )))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if let Ok(n) = sql[start..i].parse::<usize>() {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();
    // Highest index first so $1 never clobbers the prefix of $10.
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct InterviewdFactory {
    handler: Arc<InterviewdHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<InterviewdAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl InterviewdFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = InterviewdAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(InterviewdHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for InterviewdFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes. Each connection gets its
/// own handler, so LISTEN state is dropped on disconnect.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = InterviewdFactory::new(tenant_manager, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

/// SQLSTATE for an engine error.
pub fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Validation(_) => "22023",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::Conflict { .. } => "23505",
        EngineError::Forbidden { .. } => "42501",
        EngineError::NotFound(_) => "P0002",
        EngineError::StorageUnavailable(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
