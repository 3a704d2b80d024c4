use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::{Sink, SinkExt};
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
use pgwire::messages::response::{
    CommandComplete, NotificationResponse, ReadyForQuery, TransactionStatus,
};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::broadcast::error::RecvError;
use ulid::Ulid;

use crate::auth::RosterdAuthSource;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::notify::Notice;
use crate::observability;
use crate::sql::{self, Command};
use crate::tenant::TenantManager;

/// Serve one client connection end to end.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls_acceptor: Option<TlsAcceptor>,
) -> Result<(), std::io::Error> {
    let factory = RosterdFactory::new(tenant_manager, password);
    pgwire::tokio::process_socket(socket, tls_acceptor, factory).await
}

pub struct RosterdHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<RosterdQueryParser>,
}

impl RosterdHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(RosterdQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| {
            metrics::counter!(observability::TENANT_ERRORS_TOTAL).increment(1);
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("tenant error: {e}"),
            )))
        })
    }

    async fn execute_command(
        &self,
        engine: &Engine,
        cmd: Command,
    ) -> PgWireResult<Vec<Response>> {
        match cmd {
            Command::InsertUser {
                id,
                name,
                email,
                credential,
            } => {
                engine
                    .register_user(id, name, email, credential)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::InsertSession { id, date, slots } => {
                engine
                    .create_session(id, date, slots)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::InsertSignup {
                session_id,
                user_id,
            } => {
                let receipt = engine.join(session_id, user_id).await.map_err(engine_err)?;
                Ok(vec![signup_response(&receipt)?])
            }
            Command::InsertParticipant { session_id, name } => {
                let receipt = engine
                    .admin_add(session_id, &name)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![signup_response(&receipt)?])
            }
            Command::DeleteSignup {
                session_id,
                user_id,
            } => {
                let receipt = engine
                    .leave(session_id, user_id)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![leave_response(&receipt)?])
            }
            Command::DeleteParticipant {
                session_id,
                user_id,
            } => {
                let receipt = engine
                    .admin_remove(session_id, user_id, false)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![leave_response(&receipt)?])
            }
            Command::DeleteWaitlisted {
                session_id,
                user_id,
            } => {
                let receipt = engine
                    .admin_remove(session_id, user_id, true)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![leave_response(&receipt)?])
            }
            Command::DeleteSession { id } => {
                engine.delete_session(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::UpdateSlots { id, slots } => {
                let report = engine.resize(id, slots).await.map_err(engine_err)?;
                Ok(vec![resize_response(&report)?])
            }
            Command::UpdateDate { id, date } => {
                engine.reschedule(id, date).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::UpdateShuttles { id, count } => {
                engine.record_shuttles(id, count).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::UpdateOrder {
                id,
                participants,
                waitlist,
            } => {
                engine
                    .reorder(id, participants, waitlist)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::SelectSessions { id } => {
                let infos = match id {
                    Some(id) => vec![engine.get_session_info(id).await.map_err(engine_err)?],
                    None => engine.list_sessions().await,
                };

                let schema = Arc::new(sessions_schema());
                let rows: Vec<PgWireResult<_>> = infos
                    .into_iter()
                    .map(|info| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&info.id.to_string())?;
                        encoder.encode_field(&info.date)?;
                        encoder.encode_field(&(info.slots as i64))?;
                        encoder.encode_field(&(info.remaining as i64))?;
                        encoder.encode_field(&(info.waitlist_count as i64))?;
                        encoder.encode_field(&(info.shuttles_used as i64))?;
                        encoder.encode_field(&info.locked)?;
                        Ok(encoder.take_row())
                    })
                    .collect();

                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectParticipants { session_id } => {
                let members = engine
                    .list_participants(session_id)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![members_response(&members)])
            }
            Command::SelectWaitlist { session_id } => {
                let members = engine
                    .list_waitlist(session_id)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![members_response(&members)])
            }
            Command::SelectRoster { session_id } => {
                let roster = engine.roster(session_id).await.map_err(engine_err)?;
                let participants =
                    serde_json::to_string(&roster.participants).map_err(json_err)?;
                let waitlist = serde_json::to_string(&roster.waitlist).map_err(json_err)?;

                let schema = Arc::new(roster_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&participants)?;
                encoder.encode_field(&waitlist)?;
                let rows: Vec<PgWireResult<_>> = vec![Ok(encoder.take_row())];

                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectUsers { id } => {
                let users = match id {
                    Some(id) => vec![engine.get_user(id).map_err(engine_err)?],
                    None => engine.list_users(),
                };

                let schema = Arc::new(users_schema());
                let rows: Vec<PgWireResult<_>> = users
                    .into_iter()
                    .map(|user| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&user.id.to_string())?;
                        encoder.encode_field(&user.name)?;
                        encoder.encode_field(&user.email)?;
                        Ok(encoder.take_row())
                    })
                    .collect();

                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            // Reached only through the extended protocol; the simple
            // path intercepts LISTEN before dispatching here.
            Command::Listen { .. } => Err(PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "0A000".into(),
                "LISTEN requires the simple query protocol".into(),
            )))),
        }
    }

    /// Turn the connection into a dedicated notification feed. The
    /// acknowledgement is written by hand because this function holds the
    /// socket for the rest of the connection's life: every committed
    /// change to the session is forwarded as a NotificationResponse until
    /// the client goes away or the session is deleted.
    async fn run_listen_feed<C>(
        &self,
        client: &mut C,
        engine: &Engine,
        channel: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let session_id = parse_channel(channel)?;
        if engine.get_session(&session_id).is_none() {
            return Err(engine_err(EngineError::SessionNotFound(session_id)));
        }
        let mut rx = engine.notify.subscribe(session_id);

        client
            .send(PgWireBackendMessage::CommandComplete(CommandComplete::new(
                "LISTEN".to_owned(),
            )))
            .await?;
        client
            .send(PgWireBackendMessage::ReadyForQuery(ReadyForQuery::new(
                TransactionStatus::Idle,
            )))
            .await?;

        let pid = std::process::id() as i32;
        loop {
            match rx.recv().await {
                Ok(notice) => {
                    if let Some(payload) = notice_payload(&notice) {
                        client
                            .send(PgWireBackendMessage::NotificationResponse(
                                NotificationResponse::new(pid, channel.to_string(), payload),
                            ))
                            .await?;
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!("listener on {channel} lagged, {missed} notices dropped");
                }
                Err(RecvError::Closed) => {
                    // Session deleted. The final change notice has been
                    // delivered; end the feed by dropping the connection.
                    return Err(PgWireError::IoError(std::io::Error::new(
                        std::io::ErrorKind::ConnectionAborted,
                        "notification channel closed",
                    )));
                }
            }
        }
    }
}

/// JSON payload for one notice, None for events with no feed mapping.
fn notice_payload(notice: &Notice) -> Option<String> {
    let value = match notice {
        Notice::Change(event) => match event {
            Event::MemberJoined { user_id, seat, .. } => json!({
                "kind": "joined",
                "user_id": user_id.to_string(),
                "seat": seat_label(*seat),
            }),
            Event::MemberLeft {
                user_id,
                seat,
                promoted,
                ..
            } => json!({
                "kind": "left",
                "user_id": user_id.to_string(),
                "seat": seat_label(*seat),
                "promoted": promoted.map(|id| id.to_string()),
            }),
            Event::SessionResized {
                slots,
                promoted,
                demoted,
                ..
            } => json!({
                "kind": "resized",
                "slots": slots,
                "promoted": promoted.iter().map(|id| id.to_string()).collect::<Vec<_>>(),
                "demoted": demoted.iter().map(|id| id.to_string()).collect::<Vec<_>>(),
            }),
            Event::SessionRescheduled { date, .. } => json!({
                "kind": "rescheduled",
                "date": date,
            }),
            Event::RosterReordered { .. } => json!({"kind": "reordered"}),
            Event::ShuttlesRecorded { count, .. } => json!({
                "kind": "shuttles",
                "count": count,
            }),
            Event::SessionDeleted { .. } => json!({"kind": "deleted"}),
            Event::SessionCreated { .. } | Event::UserRegistered { .. } => return None,
        },
        Notice::Locked => json!({"kind": "locked"}),
    };
    Some(value.to_string())
}

fn parse_channel(channel: &str) -> PgWireResult<Ulid> {
    let id_str = channel.strip_prefix("session_").ok_or_else(|| {
        PgWireError::UserError(Box::new(ErrorInfo::new(
            "ERROR".into(),
            "42000".into(),
            format!("invalid channel: {channel} (expected session_{{id}})"),
        )))
    })?;
    Ulid::from_string(id_str).map_err(|e| {
        PgWireError::UserError(Box::new(ErrorInfo::new(
            "ERROR".into(),
            "42000".into(),
            format!("bad ULID in channel: {e}"),
        )))
    })
}

fn seat_label(seat: Seat) -> &'static str {
    match seat {
        Seat::Confirmed => "confirmed",
        Seat::Waitlisted => "waitlisted",
    }
}

// ── Row schemas ──────────────────────────────────────────────────

fn sessions_schema() -> Vec<FieldInfo> {
    vec![
        FieldInfo::new("id".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("date".into(), None, None, Type::INT8, FieldFormat::Text),
        FieldInfo::new("slots".into(), None, None, Type::INT8, FieldFormat::Text),
        FieldInfo::new("remaining".into(), None, None, Type::INT8, FieldFormat::Text),
        FieldInfo::new(
            "waitlist_count".into(),
            None,
            None,
            Type::INT8,
            FieldFormat::Text,
        ),
        FieldInfo::new(
            "shuttles_used".into(),
            None,
            None,
            Type::INT8,
            FieldFormat::Text,
        ),
        FieldInfo::new("locked".into(), None, None, Type::BOOL, FieldFormat::Text),
    ]
}

fn members_schema() -> Vec<FieldInfo> {
    vec![
        FieldInfo::new("position".into(), None, None, Type::INT8, FieldFormat::Text),
        FieldInfo::new("user_id".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("name".into(), None, None, Type::VARCHAR, FieldFormat::Text),
    ]
}

fn roster_schema() -> Vec<FieldInfo> {
    vec![
        FieldInfo::new(
            "participants".into(),
            None,
            None,
            Type::VARCHAR,
            FieldFormat::Text,
        ),
        FieldInfo::new("waitlist".into(), None, None, Type::VARCHAR, FieldFormat::Text),
    ]
}

fn users_schema() -> Vec<FieldInfo> {
    vec![
        FieldInfo::new("id".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("name".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("email".into(), None, None, Type::VARCHAR, FieldFormat::Text),
    ]
}

fn signup_schema() -> Vec<FieldInfo> {
    vec![
        FieldInfo::new("user_id".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("status".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("remaining".into(), None, None, Type::INT8, FieldFormat::Text),
        FieldInfo::new(
            "waitlist_count".into(),
            None,
            None,
            Type::INT8,
            FieldFormat::Text,
        ),
    ]
}

fn leave_schema() -> Vec<FieldInfo> {
    vec![
        FieldInfo::new("promoted".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("remaining".into(), None, None, Type::INT8, FieldFormat::Text),
        FieldInfo::new(
            "waitlist_count".into(),
            None,
            None,
            Type::INT8,
            FieldFormat::Text,
        ),
    ]
}

fn resize_schema() -> Vec<FieldInfo> {
    vec![
        FieldInfo::new("promoted".into(), None, None, Type::INT8, FieldFormat::Text),
        FieldInfo::new("demoted".into(), None, None, Type::INT8, FieldFormat::Text),
        FieldInfo::new("remaining".into(), None, None, Type::INT8, FieldFormat::Text),
        FieldInfo::new(
            "waitlist_count".into(),
            None,
            None,
            Type::INT8,
            FieldFormat::Text,
        ),
    ]
}

// ── Row builders ─────────────────────────────────────────────────

fn signup_response(receipt: &SignupReceipt) -> PgWireResult<Response> {
    let schema = Arc::new(signup_schema());
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&receipt.user_id.to_string())?;
    encoder.encode_field(&seat_label(receipt.seat).to_string())?;
    encoder.encode_field(&(receipt.remaining as i64))?;
    encoder.encode_field(&(receipt.waitlist_count as i64))?;
    let rows: Vec<PgWireResult<_>> = vec![Ok(encoder.take_row())];
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn leave_response(receipt: &LeaveReceipt) -> PgWireResult<Response> {
    let schema = Arc::new(leave_schema());
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&receipt.promoted.map(|id| id.to_string()))?;
    encoder.encode_field(&(receipt.remaining as i64))?;
    encoder.encode_field(&(receipt.waitlist_count as i64))?;
    let rows: Vec<PgWireResult<_>> = vec![Ok(encoder.take_row())];
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn resize_response(report: &ResizeReport) -> PgWireResult<Response> {
    let schema = Arc::new(resize_schema());
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&(report.promoted as i64))?;
    encoder.encode_field(&(report.demoted as i64))?;
    encoder.encode_field(&(report.remaining as i64))?;
    encoder.encode_field(&(report.waitlist_count as i64))?;
    let rows: Vec<PgWireResult<_>> = vec![Ok(encoder.take_row())];
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn members_response(members: &[MemberInfo]) -> Response {
    let schema = Arc::new(members_schema());
    let rows: Vec<PgWireResult<_>> = members
        .iter()
        .enumerate()
        .map(|(i, member)| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&(i as i64 + 1))?;
            encoder.encode_field(&member.id.to_string())?;
            encoder.encode_field(&member.name)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

#[async_trait]
impl SimpleQueryHandler for RosterdHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);

        if let Command::Listen { channel } = cmd {
            metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => "ok")
                .increment(1);
            return self.run_listen_feed(client, &engine, &channel).await;
        }

        let start = Instant::now();
        let result = self.execute_command(&engine, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(start.elapsed().as_secs_f64());
        result
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct RosterdQueryParser;

#[async_trait]
impl QueryParser for RosterdQueryParser {
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
        Ok(result_schema_for(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for RosterdHandler {
    type Statement = String;
    type QueryParser = RosterdQueryParser;

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
        let engine = self.resolve_engine(client)?;
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        let label = observability::command_label(&cmd);

        let start = Instant::now();
        let result = self.execute_command(&engine, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(start.elapsed().as_secs_f64());

        let mut responses = result?;
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
            result_schema_for(&target.statement),
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
        Ok(DescribePortalResponse::new(result_schema_for(
            &target.statement.statement,
        )))
    }
}

/// Best-effort row schema from the SQL text, for Describe. Mutations and
/// receipt-returning commands describe as empty; clients running those
/// through the extended protocol get the rows regardless.
fn result_schema_for(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    if !upper.contains("SELECT") {
        return vec![];
    }
    if upper.contains("ROSTER") {
        roster_schema()
    } else if upper.contains("PARTICIPANTS") || upper.contains("WAITLIST") {
        members_schema()
    } else if upper.contains("SESSIONS") {
        sessions_schema()
    } else if upper.contains("USERS") {
        users_schema()
    } else {
        vec![]
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
            if i > start {
                if let Ok(n) = sql[start..i].parse::<usize>() {
                    if n > max {
                        max = n;
                    }
                }
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let sql = portal.statement.statement.to_string();
    let params = &portal.parameters;
    let mut result = sql;

    for (i, param) in params.iter().enumerate().rev() {
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

pub struct RosterdFactory {
    handler: Arc<RosterdHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<RosterdAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl RosterdFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = RosterdAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(RosterdHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for RosterdFactory {
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

fn engine_err(e: EngineError) -> PgWireError {
    let code = match &e {
        EngineError::SessionNotFound(_)
        | EngineError::UserNotFound(_)
        | EngineError::NotFound(_)
        | EngineError::NotAMember(_) => "P0002",
        EngineError::AlreadyJoined(_)
        | EngineError::AlreadyWaitlisted(_)
        | EngineError::EmailTaken(_) => "23505",
        EngineError::SessionLocked(_) => "55000",
        EngineError::InvalidSlotCount(_) | EngineError::InvalidName(_) => "22023",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "XX000",
    };
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        e.to_string(),
    )))
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}

fn json_err(e: serde_json::Error) -> PgWireError {
    PgWireError::ApiError(Box::new(e))
}
