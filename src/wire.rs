use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
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
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tracing::debug;
use ulid::Ulid;

use crate::auth::SharedPassword;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, SqlError};

pub struct BarreHandler {
    engine: Arc<Engine>,
    query_parser: Arc<BarreQueryParser>,
}

impl BarreHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(BarreQueryParser),
        }
    }

    /// The login name is the caller's account id. Anything else maps to
    /// the nil id, which no account has, so every gated command refuses it.
    fn caller<C: ClientInfo>(&self, client: &C) -> Ulid {
        let user = client.metadata().get("user").map(String::as_str).unwrap_or("");
        match Ulid::from_string(user) {
            Ok(id) => id,
            Err(_) => {
                metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
                debug!("login name {user:?} is not an account id");
                Ulid::nil()
            }
        }
    }

    async fn run(&self, caller: Ulid, cmd: Command) -> PgWireResult<Vec<Response>> {
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(caller, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        debug!("{caller} {label}: {status}");
        result
    }

    async fn execute_command(&self, caller: Ulid, cmd: Command) -> PgWireResult<Vec<Response>> {
        let engine = &self.engine;
        match cmd {
            Command::InsertAccount { account } => {
                engine.create_account(caller, account).await.map_err(engine_err)?;
                Ok(vec![written("INSERT", 1)])
            }
            Command::InsertStyle { style } => {
                engine.create_style(caller, style).await.map_err(engine_err)?;
                Ok(vec![written("INSERT", 1)])
            }
            Command::UpdateStyle { id, patch } => {
                engine.update_style(caller, id, patch).await.map_err(engine_err)?;
                Ok(vec![written("UPDATE", 1)])
            }
            Command::DeleteStyle { id } => {
                engine.delete_style(caller, id).await.map_err(engine_err)?;
                Ok(vec![written("DELETE", 1)])
            }
            Command::InsertTrainer { trainer } => {
                engine.create_trainer(caller, trainer).await.map_err(engine_err)?;
                Ok(vec![written("INSERT", 1)])
            }
            Command::SetTrainerStyles { id, styles } => {
                engine
                    .set_trainer_styles(caller, id, styles)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![written("UPDATE", 1)])
            }
            Command::InsertSchedule { entry } => {
                engine.create_schedule(caller, entry).await.map_err(engine_err)?;
                Ok(vec![written("INSERT", 1)])
            }
            Command::InsertRecurring { rule, until } => {
                let created = engine
                    .create_recurring_schedules(caller, rule, until)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![written("INSERT", created.len())])
            }
            Command::UpdateSchedule { id, patch } => {
                engine
                    .update_schedule(caller, id, patch)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![written("UPDATE", 1)])
            }
            Command::DeleteSchedule { id } => {
                engine.delete_schedule(caller, id).await.map_err(engine_err)?;
                Ok(vec![written("DELETE", 1)])
            }
            Command::InsertBooking { id, schedule_id } => {
                engine.book(caller, id, schedule_id).await.map_err(engine_err)?;
                Ok(vec![written("INSERT", 1)])
            }
            Command::CancelBooking { id } => {
                engine.cancel(caller, id).await.map_err(engine_err)?;
                Ok(vec![written("UPDATE", 1)])
            }
            Command::MarkBookings {
                schedule_id,
                status,
            } => {
                let changed = match status {
                    BookingStatus::Attended => engine.mark_attended(caller, schedule_id).await,
                    BookingStatus::Cancelled => engine.mark_cancelled(caller, schedule_id).await,
                    other => {
                        return Err(sql_err(SqlError::Unsupported(format!(
                            "cannot mark a class {other}"
                        ))));
                    }
                }
                .map_err(engine_err)?;
                Ok(vec![written("UPDATE", changed)])
            }
            Command::SweepMissed => {
                let swept = engine.sweep_missed(caller).await.map_err(engine_err)?;
                Ok(vec![written("UPDATE", swept)])
            }
            Command::SelectOccurrences { filter, from, to } => {
                let views = engine
                    .occurrences_in_range(filter, from, to)
                    .await
                    .map_err(engine_err)?;
                let now = engine.now_ms();
                Ok(vec![query_rows(occurrence_schema(), views, |enc, view| {
                    encode_occurrence(enc, &view, now)
                })])
            }
            Command::SelectSchedule { id } => {
                let view = engine.get_schedule(id).await.map_err(engine_err)?;
                let now = engine.now_ms();
                Ok(vec![query_rows(occurrence_schema(), [view], |enc, view| {
                    encode_occurrence(enc, &view, now)
                })])
            }
            Command::SelectRoster { schedule_id } => {
                let roster = engine
                    .schedule_roster(caller, schedule_id)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![query_rows(roster_schema(), roster, |enc, b| {
                    enc.encode_field(&b.id.to_string())?;
                    enc.encode_field(&b.client_id.to_string())?;
                    enc.encode_field(&b.schedule_id.to_string())?;
                    enc.encode_field(&b.class_date.to_string())?;
                    enc.encode_field(&b.booking_date)?;
                    enc.encode_field(&b.status.to_string())
                })])
            }
            Command::SelectOwnBookings => {
                let profile = engine.client_bookings(caller).await.map_err(engine_err)?;
                let rows = profile
                    .active
                    .into_iter()
                    .map(|v| ("active", v))
                    .chain(profile.history.into_iter().map(|v| ("history", v)));
                Ok(vec![query_rows(own_bookings_schema(), rows, |enc, (section, v)| {
                    enc.encode_field(&v.booking.id.to_string())?;
                    enc.encode_field(&v.booking.schedule_id.to_string())?;
                    enc.encode_field(&v.entry.class_date.to_string())?;
                    enc.encode_field(&v.entry.start_time.format("%H:%M").to_string())?;
                    enc.encode_field(&v.entry.dance_style.to_string())?;
                    enc.encode_field(&v.entry.trainer.to_string())?;
                    enc.encode_field(&v.booking.status.to_string())?;
                    enc.encode_field(&v.effective_status.to_string())?;
                    enc.encode_field(&section.to_string())
                })])
            }
            Command::SelectBookingStats => {
                let stats = engine.client_bookings(caller).await.map_err(engine_err)?.stats;
                Ok(vec![query_rows(stats_schema(), [stats], |enc, s| {
                    enc.encode_field(&(s.booked as i64))?;
                    enc.encode_field(&(s.attended as i64))?;
                    enc.encode_field(&(s.missed as i64))?;
                    enc.encode_field(&(s.cancelled as i64))?;
                    enc.encode_field(&(s.total_history as i64))?;
                    enc.encode_field(&s.attendance_rate)
                })])
            }
            Command::SelectStyles => {
                Ok(vec![query_rows(styles_schema(), engine.list_styles(), |enc, s| {
                    enc.encode_field(&s.id.to_string())?;
                    enc.encode_field(&s.name)?;
                    enc.encode_field(&s.description)?;
                    enc.encode_field(&s.image)
                })])
            }
            Command::SelectTrainers => {
                Ok(vec![query_rows(trainers_schema(), engine.list_trainers(), |enc, t| {
                    let styles: Vec<String> = t.styles.iter().map(Ulid::to_string).collect();
                    enc.encode_field(&t.id.to_string())?;
                    enc.encode_field(&t.user_id.to_string())?;
                    enc.encode_field(&t.bio)?;
                    enc.encode_field(&t.photo)?;
                    enc.encode_field(&styles.join(","))
                })])
            }
        }
    }
}

fn written(tag: &str, rows: usize) -> Response {
    Response::Execution(Tag::new(tag).with_rows(rows))
}

fn query_rows<T>(
    schema: Vec<FieldInfo>,
    items: impl IntoIterator<Item = T>,
    encode: impl Fn(&mut DataRowEncoder, T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<_>> = items
        .into_iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn encode_occurrence(enc: &mut DataRowEncoder, view: &OccurrenceView, now: Ms) -> PgWireResult<()> {
    let entry = &view.entry;
    enc.encode_field(&entry.id.to_string())?;
    enc.encode_field(&view.date.to_string())?;
    enc.encode_field(&entry.day_of_week().to_string())?;
    enc.encode_field(&entry.start_time.format("%H:%M").to_string())?;
    enc.encode_field(&entry.end_time.format("%H:%M").to_string())?;
    enc.encode_field(&entry.dance_style.to_string())?;
    enc.encode_field(&entry.trainer.to_string())?;
    enc.encode_field(&i64::from(entry.max_participants))?;
    enc.encode_field(&i64::from(view.taken))?;
    enc.encode_field(&i64::from(view.available))?;
    enc.encode_field(&entry.is_active)?;
    enc.encode_field(&view.is_past)?;
    enc.encode_field(&view.is_today)?;
    enc.encode_field(&view.is_future)?;
    enc.encode_field(&view.span.contains_instant(now))?;
    enc.encode_field(&view.booking_open)?;
    enc.encode_field(&view.span.start)?;
    enc.encode_field(&view.span.end)
}

// ── Result schemas ───────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn occurrence_schema() -> Vec<FieldInfo> {
    vec![
        field("schedule_id", Type::VARCHAR),
        field("class_date", Type::VARCHAR),
        field("day_of_week", Type::VARCHAR),
        field("start_time", Type::VARCHAR),
        field("end_time", Type::VARCHAR),
        field("style_id", Type::VARCHAR),
        field("trainer_id", Type::VARCHAR),
        field("max_participants", Type::INT8),
        field("taken", Type::INT8),
        field("available", Type::INT8),
        field("is_active", Type::BOOL),
        field("is_past", Type::BOOL),
        field("is_today", Type::BOOL),
        field("is_future", Type::BOOL),
        field("in_progress", Type::BOOL),
        field("booking_open", Type::BOOL),
        field("start_ms", Type::INT8),
        field("end_ms", Type::INT8),
    ]
}

fn roster_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("client_id", Type::VARCHAR),
        field("schedule_id", Type::VARCHAR),
        field("class_date", Type::VARCHAR),
        field("booking_date", Type::INT8),
        field("status", Type::VARCHAR),
    ]
}

fn own_bookings_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("schedule_id", Type::VARCHAR),
        field("class_date", Type::VARCHAR),
        field("start_time", Type::VARCHAR),
        field("style_id", Type::VARCHAR),
        field("trainer_id", Type::VARCHAR),
        field("status", Type::VARCHAR),
        field("effective_status", Type::VARCHAR),
        field("section", Type::VARCHAR),
    ]
}

fn stats_schema() -> Vec<FieldInfo> {
    vec![
        field("booked", Type::INT8),
        field("attended", Type::INT8),
        field("missed", Type::INT8),
        field("cancelled", Type::INT8),
        field("total_history", Type::INT8),
        field("attendance_rate", Type::FLOAT8),
    ]
}

fn styles_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("description", Type::VARCHAR),
        field("image", Type::VARCHAR),
    ]
}

fn trainers_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("user_id", Type::VARCHAR),
        field("bio", Type::VARCHAR),
        field("photo", Type::VARCHAR),
        field("styles", Type::VARCHAR),
    ]
}

/// Row shape of a statement, for Describe. Writes have none.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.to_lowercase();
    if !lower.trim_start().starts_with("select") {
        return vec![];
    }
    let mut words = lower.split_whitespace();
    let table = words
        .by_ref()
        .find(|w| *w == "from")
        .and_then(|_| words.next())
        .map(|t| t.trim_end_matches(';'));
    match table {
        Some("occurrences") | Some("schedules") => occurrence_schema(),
        Some("bookings") if lower.contains(" where ") => roster_schema(),
        Some("bookings") => own_bookings_schema(),
        Some("booking_stats") => stats_schema(),
        Some("styles") => styles_schema(),
        Some("trainers") => trainers_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for BarreHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let caller = self.caller(client);
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        self.run(caller, cmd).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct BarreQueryParser;

#[async_trait]
impl QueryParser for BarreQueryParser {
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
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for BarreHandler {
    type Statement = String;
    type QueryParser = BarreQueryParser;

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
        let caller = self.caller(client);
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        let mut responses = self.run(caller, cmd).await?;
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
            result_schema(&target.statement),
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
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
        )))
    }
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        i += 1;
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if let Ok(n) = sql[start..i].parse::<usize>() {
            max = max.max(n);
        }
    }
    max
}

/// Substitute `$1, $2, ...` with bound values as quoted text. Highest
/// index first so `$1` never eats the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut sql = portal.statement.statement.clone();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let value = match param {
            Some(bytes) => format!("'{}'", String::from_utf8_lossy(bytes).replace('\'', "''")),
            None => "NULL".to_string(),
        };
        sql = sql.replace(&format!("${}", i + 1), &value);
    }
    sql
}

// ── Factory ──────────────────────────────────────────────────────

pub struct BarreFactory {
    handler: Arc<BarreHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<SharedPassword, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl BarreFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        Self {
            handler: Arc::new(BarreHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                SharedPassword::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for BarreFactory {
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

/// Serve one client socket until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = BarreFactory::new(engine, password);
    pgwire::tokio::process_socket(socket, tls, Arc::new(factory)).await
}

// ── Errors ───────────────────────────────────────────────────────

/// SQLSTATE for an engine error. Clients branch on these, so the
/// grouping is part of the protocol.
fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::NotClient | EngineError::NotTrainer | EngineError::NotAdmin => "42501",
        EngineError::ScheduleNotFound(_)
        | EngineError::BookingNotFound(_)
        | EngineError::NotFound(_) => "P0002",
        EngineError::ConcurrencyConflict(_) => "40001",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
        _ => "P0001",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        e.to_string(),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
