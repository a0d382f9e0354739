use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

pub const EVENTS_TABLE: &str = "interview_events";
pub const AUDIT_TABLE: &str = "audit_log";
pub const AUDIT_STATS_TABLE: &str = "audit_stats";
pub const CONFLICTS_TABLE: &str = "slot_conflicts";

/// Positional column order for `INSERT INTO interview_events VALUES (...)`
/// without a column list.
const INSERT_COLUMNS: [&str; 8] = [
    "interviewer",
    "start_time",
    "end_time",
    "status",
    "candidate_name",
    "position",
    "notes",
    "request_token",
];

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertEvent {
        event: NewEvent,
        returning: bool,
    },
    UpdateEvent {
        id: Ulid,
        patch: EventPatch,
        returning: bool,
    },
    DeleteEvent {
        id: Ulid,
        returning: bool,
    },
    GetEvent {
        id: Ulid,
    },
    SelectEvents {
        filter: EventFilter,
    },
    SelectConflict {
        interviewer: String,
        start: Ms,
        exclude: Option<Ulid>,
    },
    SelectAudit {
        filter: AuditFilter,
    },
    SelectAuditStats,
    Listen {
        channel: String,
    },
    Unlisten {
        channel: String,
    },
    UnlistenAll,
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    let upper = trimmed.to_uppercase();
    if upper.starts_with("LISTEN ") {
        return Ok(Command::Listen {
            channel: channel_name(&trimmed[7..])?,
        });
    }
    if upper == "UNLISTEN *" || upper == "UNLISTEN" {
        return Ok(Command::UnlistenAll);
    }
    if upper.starts_with("UNLISTEN ") {
        return Ok(Command::Unlisten {
            channel: channel_name(&trimmed[9..])?,
        });
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            returning,
            ..
        } => parse_update(table, assignments, selection, returning.is_some()),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Channel names may be bare or double-quoted (emails need quoting).
fn channel_name(raw: &str) -> Result<String, SqlError> {
    let name = raw.trim().trim_matches('"').trim();
    if name.is_empty() {
        return Err(SqlError::Parse("missing channel name".into()));
    }
    Ok(name.to_string())
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    if table != EVENTS_TABLE {
        return Err(SqlError::UnknownTable(table));
    }
    let values = extract_insert_values(insert)?;
    let columns: Vec<String> = if insert.columns.is_empty() {
        INSERT_COLUMNS.iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if values.len() > columns.len() {
        return Err(SqlError::WrongArity(EVENTS_TABLE, columns.len(), values.len()));
    }

    let (mut interviewer, mut start, mut end) = (None, None, None);
    let mut event = NewEvent::default();
    for (column, expr) in columns.iter().zip(&values) {
        match column.as_str() {
            "interviewer" => interviewer = parse_text(expr)?,
            "start_time" => start = Some(parse_time(expr)?),
            "end_time" => end = Some(parse_time(expr)?),
            "status" => event.status = parse_text(expr)?.map(|s| parse_status(&s)).transpose()?,
            "candidate_name" => event.candidate_name = parse_text(expr)?,
            "position" => event.position = parse_text(expr)?,
            "notes" => event.notes = parse_text(expr)?,
            "request_token" => event.request_token = parse_text(expr)?,
            other => return Err(SqlError::UnknownColumn(other.to_string())),
        }
    }
    event.interviewer = interviewer.ok_or(SqlError::MissingValue("interviewer"))?;
    event.start = start.ok_or(SqlError::MissingValue("start_time"))?;
    event.end = end.ok_or(SqlError::MissingValue("end_time"))?;

    Ok(Command::InsertEvent {
        event,
        returning: insert.returning.is_some(),
    })
}

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
    returning: bool,
) -> Result<Command, SqlError> {
    let name = table_factor_name(&table.relation)?;
    if name != EVENTS_TABLE {
        return Err(SqlError::UnknownTable(name));
    }
    let id = extract_where_id(selection)?;

    let mut patch = EventPatch::default();
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name)
                .ok_or_else(|| SqlError::Parse("empty column name".into()))?,
            AssignmentTarget::Tuple(_) => {
                return Err(SqlError::Unsupported("tuple assignment".into()));
            }
        };
        let expr = &assignment.value;
        match column.as_str() {
            "interviewer" => {
                patch.interviewer = Some(parse_text(expr)?.ok_or(SqlError::NotNullable("interviewer"))?)
            }
            "start_time" => patch.start = Some(parse_time(expr)?),
            "end_time" => patch.end = Some(parse_time(expr)?),
            "status" => {
                let status = parse_text(expr)?.ok_or(SqlError::NotNullable("status"))?;
                patch.status = Some(parse_status(&status)?);
            }
            "candidate_name" => patch.candidate_name = Some(parse_text(expr)?),
            "position" => patch.position = Some(parse_text(expr)?),
            "notes" => patch.notes = Some(parse_text(expr)?),
            other => return Err(SqlError::UnknownColumn(other.to_string())),
        }
    }

    Ok(Command::UpdateEvent { id, patch, returning })
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    if table != EVENTS_TABLE {
        return Err(SqlError::UnknownTable(table));
    }
    Ok(Command::DeleteEvent {
        id: extract_where_id(&delete.selection)?,
        returning: delete.returning.is_some(),
    })
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_filters(selection, &mut filters)?;
    }

    match table.as_str() {
        EVENTS_TABLE => parse_event_filters(filters),
        AUDIT_TABLE => parse_audit_filters(filters),
        AUDIT_STATS_TABLE => Ok(Command::SelectAuditStats),
        CONFLICTS_TABLE => parse_conflict_filters(filters),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// One `column <op> value` term of a WHERE conjunction.
struct Filter<'a> {
    column: String,
    op: ast::BinaryOperator,
    value: &'a Expr,
}

fn collect_filters<'a>(expr: &'a Expr, out: &mut Vec<Filter<'a>>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_filters(inner, out),
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_filters(left, out)?;
            collect_filters(right, out)
        }
        Expr::BinaryOp { left, op, right } => {
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter {expr}")))?;
            out.push(Filter {
                column,
                op: op.clone(),
                value: right,
            });
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

fn unsupported_filter(f: &Filter<'_>) -> SqlError {
    SqlError::Unsupported(format!("filter {} {} ...", f.column, f.op))
}

fn parse_event_filters(filters: Vec<Filter<'_>>) -> Result<Command, SqlError> {
    use ast::BinaryOperator::*;
    let mut filter = EventFilter::default();
    for f in &filters {
        match (f.column.as_str(), &f.op) {
            ("id", Eq) => return Ok(Command::GetEvent { id: parse_ulid_expr(f.value)? }),
            ("interviewer", Eq) => {
                filter.interviewer = Some(required_text(f.value, "interviewer")?)
            }
            ("status", Eq) => {
                filter.status = Some(parse_status(&required_text(f.value, "status")?)?)
            }
            ("start_time", GtEq) => filter.start_from = Some(parse_time(f.value)?),
            ("start_time", Gt) => filter.start_from = Some(parse_time(f.value)? + 1),
            ("start_time", Lt) => filter.start_before = Some(parse_time(f.value)?),
            ("start_time", LtEq) => filter.start_before = Some(parse_time(f.value)? + 1),
            _ => return Err(unsupported_filter(f)),
        }
    }
    Ok(Command::SelectEvents { filter })
}

fn parse_audit_filters(filters: Vec<Filter<'_>>) -> Result<Command, SqlError> {
    use ast::BinaryOperator::*;
    let mut filter = AuditFilter::default();
    for f in &filters {
        match (f.column.as_str(), &f.op) {
            ("entity_id", Eq) => filter.entity_id = Some(parse_ulid_expr(f.value)?),
            ("actor" | "actor_email", Eq) => {
                filter.actor_email = Some(required_text(f.value, "actor")?)
            }
            ("action", Eq) => {
                let action = required_text(f.value, "action")?;
                filter.action = Some(action.parse().map_err(SqlError::Parse)?);
            }
            ("since", Eq) => filter.since = Some(parse_time(f.value)?),
            ("max_rows", Eq) => {
                let n = parse_i64_expr(f.value)?;
                filter.limit = Some(
                    usize::try_from(n).map_err(|_| SqlError::Parse(format!("bad max_rows: {n}")))?,
                );
            }
            _ => return Err(unsupported_filter(f)),
        }
    }
    Ok(Command::SelectAudit { filter })
}

fn parse_conflict_filters(filters: Vec<Filter<'_>>) -> Result<Command, SqlError> {
    use ast::BinaryOperator::*;
    let (mut interviewer, mut start, mut exclude) = (None, None, None);
    for f in &filters {
        match (f.column.as_str(), &f.op) {
            ("interviewer", Eq) => interviewer = Some(required_text(f.value, "interviewer")?),
            ("start_time", Eq) => start = Some(parse_time(f.value)?),
            ("id", Eq) => exclude = Some(parse_ulid_expr(f.value)?),
            _ => return Err(unsupported_filter(f)),
        }
    }
    Ok(Command::SelectConflict {
        interviewer: interviewer.ok_or(SqlError::MissingFilter("interviewer"))?,
        start: start.ok_or(SqlError::MissingFilter("start_time"))?,
        exclude,
    })
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => parse_ulid_expr(right),
        _ => Err(SqlError::MissingFilter("id")),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

/// A time is integer Unix milliseconds, or an RFC 3339 string.
fn parse_time(expr: &Expr) -> Result<Ms, SqlError> {
    if let Some(Value::SingleQuotedString(s)) = extract_value(expr)
        && s.parse::<i64>().is_err()
    {
        return chrono::DateTime::parse_from_rfc3339(s)
            .map(|t| t.timestamp_millis())
            .map_err(|e| SqlError::Parse(format!("bad timestamp {s:?}: {e}")));
    }
    parse_i64_expr(expr)
}

/// Text value, with `NULL` as `None`.
fn parse_text(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) => Ok(Some(s.clone())),
        Some(Value::Number(n, _)) => Ok(Some(n.clone())),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn required_text(expr: &Expr, column: &'static str) -> Result<String, SqlError> {
    parse_text(expr)?.ok_or(SqlError::NotNullable(column))
}

fn parse_status(s: &str) -> Result<EventStatus, SqlError> {
    s.parse().map_err(SqlError::Parse)
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
    MissingValue(&'static str),
    NotNullable(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected at most {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::MissingValue(col) => write!(f, "missing value: {col}"),
            SqlError::NotNullable(col) => write!(f, "{col} cannot be NULL"),
        }
    }
}

impl std::error::Error for SqlError {}
