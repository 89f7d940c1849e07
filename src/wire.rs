use std::fmt::Debug;
use std::io;
use std::ops::Range;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream;
use futures::Sink;
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
use pgwire::messages::data::DataRow;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tracing::warn;

use crate::auth::ClinicSlotAuthSource;
use crate::engine::{Engine, EngineError, DEFAULT_GRANULARITY_MINUTES};
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS, SLOT_QUERIES_DEGRADED_TOTAL};
use crate::sql::{self, Command};

pub struct ClinicSlotHandler {
    engine: Arc<Engine>,
    query_parser: Arc<ClinicSlotQueryParser>,
}

impl ClinicSlotHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(ClinicSlotQueryParser),
        }
    }

    /// Every statement of a simple query, in order, one response each.
    /// Stops at the first failing statement; earlier ones stay committed.
    async fn run_batch(&self, query: &str) -> PgWireResult<Vec<Response>> {
        let commands = sql::parse_batch(query).map_err(sql_err)?;
        let mut responses = Vec::with_capacity(commands.len());
        for cmd in commands {
            responses.push(self.run_command(cmd).await?);
        }
        Ok(responses)
    }

    async fn run(&self, query: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        self.run_command(cmd).await
    }

    async fn run_command(&self, cmd: Command) -> PgWireResult<Response> {
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd).await;
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::InsertClinic { id, name, timezone } => {
                engine
                    .create_clinic(id, name, timezone.as_deref())
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::InsertOpeningHours {
                clinic_id,
                intervals,
            } => {
                engine
                    .add_opening_hours(clinic_id, &intervals)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(intervals.len())))
            }
            Command::DeleteOpeningHours { clinic_id, weekday } => {
                let before = engine.clinic_hours(clinic_id).map_err(engine_err)?;
                let removed = before
                    .iter()
                    .filter(|h| weekday.is_none_or(|d| h.weekday == d))
                    .count();
                engine
                    .clear_opening_hours(clinic_id, weekday)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(removed)))
            }
            Command::SelectOpeningHours { clinic_id, weekday } => {
                let hours = match weekday {
                    Some(day) => engine.get_intervals(clinic_id, day),
                    None => engine.clinic_hours(clinic_id),
                }
                .map_err(engine_err)?;
                let schema = Arc::new(hours_schema());
                let rows: Vec<PgWireResult<DataRow>> = hours
                    .iter()
                    .map(|h| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&clinic_id.to_string())?;
                        encoder.encode_field(&i64::from(h.weekday))?;
                        encoder.encode_field(&clock(h.open))?;
                        encoder.encode_field(&clock(h.close))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(query_response(schema, rows))
            }
            Command::InsertClosure { clinic_id, date } => {
                engine.add_closure(clinic_id, date).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteClosure { clinic_id, date } => {
                let removed = engine
                    .remove_closure(clinic_id, date)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(usize::from(removed))))
            }
            Command::SelectClosures { clinic_id } => {
                let dates = engine.closures(clinic_id).map_err(engine_err)?;
                let schema = Arc::new(closures_schema());
                let rows: Vec<PgWireResult<DataRow>> = dates
                    .iter()
                    .map(|d| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&clinic_id.to_string())?;
                        encoder.encode_field(&d.format("%Y-%m-%d").to_string())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(query_response(schema, rows))
            }
            Command::InsertProfessional(professional) => {
                engine
                    .save_professional(professional)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::SelectProfessionals { active_only } => {
                let schema = Arc::new(professionals_schema());
                let rows: Vec<PgWireResult<DataRow>> = engine
                    .list_professionals(active_only)
                    .iter()
                    .map(|p| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&p.id.to_string())?;
                        encoder.encode_field(&p.name)?;
                        encoder.encode_field(&p.active)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(query_response(schema, rows))
            }
            Command::InsertPatient(patient) => {
                engine.save_patient(patient).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::InsertAppointmentType(appointment_type) => {
                engine
                    .save_appointment_type(appointment_type)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::SelectSlots {
                clinic_id,
                professional_id,
                date,
                duration,
                granularity,
            } => {
                let granularity = granularity.unwrap_or(DEFAULT_GRANULARITY_MINUTES);
                let slots = match engine
                    .compute_slots(clinic_id, professional_id, date, duration, granularity)
                    .await
                {
                    Ok(slots) => slots,
                    Err(EngineError::Unavailable(reason)) => {
                        warn!(
                            clinic = %clinic_id,
                            professional = %professional_id,
                            "slot query degraded to empty: {reason}"
                        );
                        metrics::counter!(SLOT_QUERIES_DEGRADED_TOTAL).increment(1);
                        Vec::new()
                    }
                    Err(e) => return Err(engine_err(e)),
                };
                let schema = Arc::new(slots_schema());
                let rows: Vec<PgWireResult<DataRow>> = slots
                    .iter()
                    .map(|slot| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&slot.label())?;
                        encoder.encode_field(&slot.start)?;
                        encoder.encode_field(&rfc3339(slot.start))?;
                        encoder.encode_field(&i64::from(slot.duration_min))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(query_response(schema, rows))
            }
            Command::InsertAppointment(request) => {
                let appointment = engine.book(request).await.map_err(engine_err)?;
                self.appointment_rows(vec![CalendarEntry {
                    appointment,
                    other_clinic: false,
                }])
            }
            Command::UpdateAppointmentStatus { id, status } => {
                let appointment = engine.update_status(id, status).await.map_err(engine_err)?;
                self.appointment_rows(vec![CalendarEntry {
                    appointment,
                    other_clinic: false,
                }])
            }
            Command::SelectAppointment { id } => {
                let entries = engine
                    .get_appointment(id)
                    .await
                    .map(|appointment| CalendarEntry {
                        appointment,
                        other_clinic: false,
                    })
                    .into_iter()
                    .collect();
                self.appointment_rows(entries)
            }
            Command::SelectAppointments {
                professional_id,
                start,
                end,
                active_only,
                clinic_id,
            } => {
                let entries = engine
                    .calendar_view(professional_id, clinic_id, start, end, active_only)
                    .await
                    .map_err(engine_err)?;
                self.appointment_rows(entries)
            }
        }
    }

    fn appointment_rows(&self, entries: Vec<CalendarEntry>) -> PgWireResult<Response> {
        let schema = Arc::new(appointments_schema());
        let rows: Vec<PgWireResult<DataRow>> = entries
            .iter()
            .map(|entry| {
                let a = &entry.appointment;
                let patient_name = self.engine.get_patient(a.patient_id).and_then(|p| p.name);
                let appointment_type = self.engine.get_appointment_type(a.type_id);
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&a.id.to_string())?;
                encoder.encode_field(&a.clinic_id.to_string())?;
                encoder.encode_field(&a.professional_id.to_string())?;
                encoder.encode_field(&a.patient_id.to_string())?;
                encoder.encode_field(&patient_name)?;
                encoder.encode_field(&a.type_id.to_string())?;
                encoder.encode_field(&appointment_type.as_ref().and_then(|t| t.name.clone()))?;
                encoder.encode_field(&appointment_type.and_then(|t| t.color))?;
                encoder.encode_field(&a.start)?;
                encoder.encode_field(&a.end())?;
                encoder.encode_field(&i64::from(a.duration_min))?;
                encoder.encode_field(&a.status.as_str())?;
                encoder.encode_field(&a.created_at)?;
                encoder.encode_field(&entry.other_clinic)?;
                Ok(encoder.take_row())
            })
            .collect();
        Ok(query_response(schema, rows))
    }
}

fn query_response(schema: Arc<Vec<FieldInfo>>, rows: Vec<PgWireResult<DataRow>>) -> Response {
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

/// Minute of day as `HH:MM`; 1440 renders as `24:00`.
fn clock(minute: u16) -> String {
    format!("{:02}:{:02}", minute / 60, minute % 60)
}

fn rfc3339(ms: Ms) -> Option<String> {
    DateTime::<Utc>::from_timestamp_millis(ms).map(|dt| dt.to_rfc3339())
}

// ── Result schemas ───────────────────────────────────────────────

fn text(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int8(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn boolean(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::BOOL, FieldFormat::Text)
}

fn slots_schema() -> Vec<FieldInfo> {
    vec![text("slot"), int8("start"), text("start_at"), int8("duration")]
}

fn appointments_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("clinic_id"),
        text("professional_id"),
        text("patient_id"),
        text("patient_name"),
        text("type_id"),
        text("type_name"),
        text("type_color"),
        int8("start"),
        int8("end"),
        int8("duration"),
        text("status"),
        int8("created_at"),
        boolean("other_clinic"),
    ]
}

fn hours_schema() -> Vec<FieldInfo> {
    vec![text("clinic_id"), int8("weekday"), text("open"), text("close")]
}

fn closures_schema() -> Vec<FieldInfo> {
    vec![text("clinic_id"), text("date")]
}

fn professionals_schema() -> Vec<FieldInfo> {
    vec![text("id"), text("name"), boolean("active")]
}

/// Result columns a statement will produce, judged from its text so that
/// statements with unbound `$n` placeholders can be described.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.trim_start().to_uppercase();
    let mentions = |table: &str| {
        upper
            .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .any(|word| word == table)
    };
    let is_select = upper.starts_with("SELECT");
    let writes_row = upper.starts_with("INSERT") || upper.starts_with("UPDATE");
    if mentions("APPOINTMENTS") && (is_select || writes_row) {
        appointments_schema()
    } else if !is_select {
        vec![]
    } else if mentions("SLOTS") {
        slots_schema()
    } else if mentions("OPENING_HOURS") {
        hours_schema()
    } else if mentions("CLOSURES") {
        closures_schema()
    } else if mentions("PROFESSIONALS") {
        professionals_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for ClinicSlotHandler {
    async fn do_query<C>(
        &self,
        _client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        self.run_batch(query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct ClinicSlotQueryParser;

#[async_trait]
impl QueryParser for ClinicSlotQueryParser {
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
impl ExtendedQueryHandler for ClinicSlotHandler {
    type Statement = String;
    type QueryParser = ClinicSlotQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        _client: &mut C,
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
        self.run(&sql).await
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

/// `$N` placeholders outside string literals and quoted identifiers, as
/// `(byte range, N)` in order of appearance.
fn placeholders(sql: &str) -> Vec<(Range<usize>, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if let Some(q) = quote {
            // A doubled quote is an escaped quote and keeps the literal open.
            if b == q {
                if bytes.get(i + 1) == Some(&q) {
                    i += 1;
                } else {
                    quote = None;
                }
            }
            i += 1;
            continue;
        }
        match b {
            b'\'' | b'"' => {
                quote = Some(b);
                i += 1;
            }
            b'$' => {
                let start = i;
                i += 1;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                if let Ok(n) = sql[start + 1..i].parse::<usize>() {
                    found.push((start..i, n));
                }
            }
            _ => i += 1,
        }
    }
    found
}

/// Highest `$N` placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    placeholders(sql).iter().map(|(_, n)| *n).max().unwrap_or(0)
}

/// Replace each placeholder with its bound value (text format) in one
/// left-to-right pass, so bound text is never rescanned.
fn bind_params<P: AsRef<[u8]>>(sql: &str, params: &[Option<P>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut last = 0;
    for (range, n) in placeholders(sql) {
        let Some(param) = n.checked_sub(1).and_then(|i| params.get(i)) else {
            continue;
        };
        out.push_str(&sql[last..range.start]);
        match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                out.push('\'');
                out.push_str(&text.replace('\'', "''"));
                out.push('\'');
            }
            None => out.push_str("NULL"),
        }
        last = range.end;
    }
    out.push_str(&sql[last..]);
    out
}

fn substitute_params(portal: &Portal<String>) -> String {
    bind_params(&portal.statement.statement, &portal.parameters)
}

// ── Factory ──────────────────────────────────────────────────────

pub struct ClinicSlotFactory {
    handler: Arc<ClinicSlotHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<ClinicSlotAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl ClinicSlotFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        let auth_source = ClinicSlotAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(ClinicSlotHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for ClinicSlotFactory {
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

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(ClinicSlotFactory::new(engine, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::InvalidArgument(_) => "22023",
        EngineError::NotFound(_) => "P0002",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::Conflict(_) => "23P01",
        EngineError::InvalidTransition { .. } => "55000",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::Unavailable(_) => "58000",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
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
