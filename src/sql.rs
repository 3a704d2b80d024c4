use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input. Ids are client-supplied ULIDs, like
/// the rest of the dialect: positional VALUES, text encoding.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertUser {
        id: Ulid,
        name: String,
        email: Option<String>,
        credential: Option<String>,
    },
    InsertSession {
        id: Ulid,
        date: Ms,
        slots: u32,
    },
    /// Voluntary join: INSERT INTO signups.
    InsertSignup {
        session_id: Ulid,
        user_id: Ulid,
    },
    /// Admin add by display name: INSERT INTO participants.
    InsertParticipant {
        session_id: Ulid,
        name: String,
    },
    /// Voluntary leave: DELETE FROM signups.
    DeleteSignup {
        session_id: Ulid,
        user_id: Ulid,
    },
    /// Admin removal from the confirmed list.
    DeleteParticipant {
        session_id: Ulid,
        user_id: Ulid,
    },
    /// Admin removal from the waitlist.
    DeleteWaitlisted {
        session_id: Ulid,
        user_id: Ulid,
    },
    DeleteSession {
        id: Ulid,
    },
    /// Resize. Signed so a negative count reaches the engine's
    /// validation instead of dying in the parser.
    UpdateSlots {
        id: Ulid,
        slots: i64,
    },
    UpdateDate {
        id: Ulid,
        date: Ms,
    },
    UpdateShuttles {
        id: Ulid,
        count: u32,
    },
    /// Reorder either list or both. Ids arrive as a comma-joined text
    /// column value.
    UpdateOrder {
        id: Ulid,
        participants: Option<Vec<Ulid>>,
        waitlist: Option<Vec<Ulid>>,
    },
    SelectSessions {
        id: Option<Ulid>,
    },
    SelectParticipants {
        session_id: Ulid,
    },
    SelectWaitlist {
        session_id: Ulid,
    },
    SelectRoster {
        session_id: Ulid,
    },
    SelectUsers {
        id: Option<Ulid>,
    },
    Listen {
        channel: String,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim();
    if trimmed.to_uppercase().starts_with("LISTEN ") {
        let channel = trimmed[7..].trim().trim_matches(';').to_string();
        return Ok(Command::Listen { channel });
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(table, assignments, selection),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "users" => {
            if values.len() < 2 {
                return Err(SqlError::WrongArity("users", 2, values.len()));
            }
            let email = if values.len() >= 3 {
                parse_string_or_null(&values[2])?
            } else {
                None
            };
            let credential = if values.len() >= 4 {
                parse_string_or_null(&values[3])?
            } else {
                None
            };
            Ok(Command::InsertUser {
                id: parse_ulid(&values[0])?,
                name: parse_string(&values[1])?,
                email,
                credential,
            })
        }
        "sessions" => {
            if values.len() < 3 {
                return Err(SqlError::WrongArity("sessions", 3, values.len()));
            }
            Ok(Command::InsertSession {
                id: parse_ulid(&values[0])?,
                date: parse_i64(&values[1])?,
                slots: parse_u32(&values[2])?,
            })
        }
        "signups" => {
            if values.len() < 2 {
                return Err(SqlError::WrongArity("signups", 2, values.len()));
            }
            Ok(Command::InsertSignup {
                session_id: parse_ulid(&values[0])?,
                user_id: parse_ulid(&values[1])?,
            })
        }
        "participants" => {
            if values.len() < 2 {
                return Err(SqlError::WrongArity("participants", 2, values.len()));
            }
            Ok(Command::InsertParticipant {
                session_id: parse_ulid(&values[0])?,
                name: parse_string(&values[1])?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = collect_eq_filters(&delete.selection)?;

    match table.as_str() {
        "sessions" => Ok(Command::DeleteSession {
            id: filters.id.ok_or(SqlError::MissingFilter("id"))?,
        }),
        "signups" => Ok(Command::DeleteSignup {
            session_id: filters.session_id.ok_or(SqlError::MissingFilter("session_id"))?,
            user_id: filters.user_id.ok_or(SqlError::MissingFilter("user_id"))?,
        }),
        "participants" => Ok(Command::DeleteParticipant {
            session_id: filters.session_id.ok_or(SqlError::MissingFilter("session_id"))?,
            user_id: filters.user_id.ok_or(SqlError::MissingFilter("user_id"))?,
        }),
        "waitlist" => Ok(Command::DeleteWaitlisted {
            session_id: filters.session_id.ok_or(SqlError::MissingFilter("session_id"))?,
            user_id: filters.user_id.ok_or(SqlError::MissingFilter("user_id"))?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(&table.relation)?;
    if table != "sessions" {
        return Err(SqlError::UnknownTable(table));
    }
    let id = collect_eq_filters(selection)?
        .id
        .ok_or(SqlError::MissingFilter("id"))?;

    let mut slots: Option<i64> = None;
    let mut date: Option<Ms> = None;
    let mut shuttles: Option<u32> = None;
    let mut participants: Option<Vec<Ulid>> = None;
    let mut waitlist: Option<Vec<Ulid>> = None;

    for a in assignments {
        let col = assignment_column(a).ok_or_else(|| SqlError::Parse("bad assignment target".into()))?;
        match col.as_str() {
            "slots" => slots = Some(parse_i64(&a.value)?),
            "date" => date = Some(parse_i64(&a.value)?),
            "shuttles_used" => shuttles = Some(parse_u32(&a.value)?),
            "participants" => participants = Some(parse_ulid_csv(&a.value)?),
            "waitlist" => waitlist = Some(parse_ulid_csv(&a.value)?),
            other => return Err(SqlError::Unsupported(format!("column: {other}"))),
        }
    }

    let has_order = participants.is_some() || waitlist.is_some();
    let scalar_count = [slots.is_some(), date.is_some(), shuttles.is_some()]
        .iter()
        .filter(|b| **b)
        .count();
    if has_order && scalar_count > 0 {
        return Err(SqlError::Unsupported(
            "cannot mix roster order with other columns".into(),
        ));
    }
    if scalar_count > 1 {
        return Err(SqlError::Unsupported("one column per UPDATE".into()));
    }

    if has_order {
        Ok(Command::UpdateOrder {
            id,
            participants,
            waitlist,
        })
    } else if let Some(slots) = slots {
        Ok(Command::UpdateSlots { id, slots })
    } else if let Some(date) = date {
        Ok(Command::UpdateDate { id, date })
    } else if let Some(count) = shuttles {
        Ok(Command::UpdateShuttles { id, count })
    } else {
        Err(SqlError::Parse("UPDATE without assignments".into()))
    }
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
    let filters = collect_eq_filters(&select.selection)?;

    match table.as_str() {
        "sessions" => Ok(Command::SelectSessions { id: filters.id }),
        "participants" => Ok(Command::SelectParticipants {
            session_id: filters.session_id.ok_or(SqlError::MissingFilter("session_id"))?,
        }),
        "waitlist" => Ok(Command::SelectWaitlist {
            session_id: filters.session_id.ok_or(SqlError::MissingFilter("session_id"))?,
        }),
        "roster" => Ok(Command::SelectRoster {
            session_id: filters.session_id.ok_or(SqlError::MissingFilter("session_id"))?,
        }),
        "users" => Ok(Command::SelectUsers { id: filters.id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── Helpers ───────────────────────────────────────────────────

#[derive(Default)]
struct EqFilters {
    id: Option<Ulid>,
    session_id: Option<Ulid>,
    user_id: Option<Ulid>,
}

/// Walk a WHERE clause of AND-joined equality comparisons, collecting
/// the id columns this dialect filters on.
fn collect_eq_filters(selection: &Option<Expr>) -> Result<EqFilters, SqlError> {
    let mut filters = EqFilters::default();
    if let Some(expr) = selection {
        walk_eq(expr, &mut filters)?;
    }
    Ok(filters)
}

fn walk_eq(expr: &Expr, filters: &mut EqFilters) -> Result<(), SqlError> {
    if let Expr::BinaryOp { left, op, right } = expr {
        match op {
            ast::BinaryOperator::And => {
                walk_eq(left, filters)?;
                walk_eq(right, filters)?;
            }
            ast::BinaryOperator::Eq => match expr_column_name(left).as_deref() {
                Some("id") => filters.id = Some(parse_ulid_expr(right)?),
                Some("session_id") => filters.session_id = Some(parse_ulid_expr(right)?),
                Some("user_id") => filters.user_id = Some(parse_ulid_expr(right)?),
                _ => {}
            },
            _ => {}
        }
    }
    Ok(())
}

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

fn assignment_column(a: &ast::Assignment) -> Option<String> {
    match &a.target {
        ast::AssignmentTarget::ColumnName(name) => object_name_last(name),
        _ => None,
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(values.rows[0].clone())
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
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
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) | Value::Number(s, _) => {
                Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
            }
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            Value::SingleQuotedString(s) => s
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

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    parse_ulid_expr(expr)
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    parse_i64_expr(expr)
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) => Ok(s.clone()),
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Null => Ok(None),
            Value::SingleQuotedString(s) => Ok(Some(s.clone())),
            _ => Err(SqlError::Parse(format!(
                "expected string or NULL, got {value:?}"
            ))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

/// Ids joined with commas in one quoted value. An empty string is an
/// empty ordering (identity reorder).
fn parse_ulid_csv(expr: &Expr) -> Result<Vec<Ulid>, SqlError> {
    let raw = parse_string(expr)?;
    let mut ids = Vec::new();
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        ids.push(Ulid::from_string(part).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))?);
    }
    Ok(ids)
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
