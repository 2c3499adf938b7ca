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
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo, QueryResponse,
    Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use ulid::Ulid;

use crate::auth::SlotkeeperAuthSource;
use crate::engine::{EngineError, ErrorClass};
use crate::gateway::{BookingChannel, Gateway, GatewayError};
use crate::model::*;
use crate::observability::{QUERIES_TOTAL, QUERY_DURATION_SECONDS, command_label};
use crate::sql::{self, Command, WaitlistAction};

pub struct SlotkeeperHandler {
    gateway: Arc<Gateway>,
    query_parser: Arc<SlotkeeperQueryParser>,
}

impl SlotkeeperHandler {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self {
            gateway,
            query_parser: Arc::new(SlotkeeperQueryParser),
        }
    }

    async fn run(&self, query: &str) -> PgWireResult<Vec<Response>> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Vec<Response>> {
        let gw = &self.gateway;
        let now = gw.now();
        match cmd {
            Command::UpsertLocation { id, name, timezone } => {
                gw.call("upsert_location", move |engine| {
                    let (name, timezone) = (name.clone(), timezone.clone());
                    async move { engine.upsert_location(id, name, &timezone).await }
                })
                .await
                .map_err(gateway_err)?;
                Ok(vec![inserted()])
            }
            Command::UpsertService { service } => {
                gw.call("upsert_service", move |engine| {
                    let service = service.clone();
                    async move { engine.upsert_service(service).await }
                })
                .await
                .map_err(gateway_err)?;
                Ok(vec![inserted()])
            }
            Command::UpsertStaff { staff } => {
                // Rows carry no time off, so the engine keeps what is on file.
                gw.call("upsert_staff", move |engine| {
                    let staff = staff.clone();
                    async move { engine.upsert_staff(staff).await }
                })
                .await
                .map_err(gateway_err)?;
                Ok(vec![inserted()])
            }
            Command::InsertTimeOff { staff_id, time_off } => {
                gw.call("add_time_off", move |engine| {
                    let time_off = time_off.clone();
                    async move { engine.add_time_off(staff_id, time_off).await }
                })
                .await
                .map_err(gateway_err)?;
                Ok(vec![inserted()])
            }
            Command::DeleteTimeOff { id } => {
                gw.call("remove_time_off", move |engine| async move {
                    let staff_id = engine
                        .time_off_owner(&id)
                        .ok_or(EngineError::NotFound { kind: "time off", id })?;
                    engine.remove_time_off(staff_id, id).await
                })
                .await
                .map_err(gateway_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectSlots { request } => {
                let slots = gw.propose(request).await.map_err(gateway_err)?;
                Ok(vec![slot_rows(slots)])
            }
            Command::ConfirmAppointment { selection, client } => {
                let appointment = gw.confirm(selection, client).await.map_err(gateway_err)?;
                Ok(vec![appointment_rows(vec![appointment])])
            }
            Command::MoveAppointment { id, start, staff_id } => {
                let appointment = gw
                    .move_appointment(id, start, staff_id)
                    .await
                    .map_err(gateway_err)?;
                Ok(vec![appointment_rows(vec![appointment])])
            }
            Command::TransitionAppointment { id, event } => {
                let appointment = gw.transition(id, event).await.map_err(gateway_err)?;
                Ok(vec![appointment_rows(vec![appointment])])
            }
            Command::SelectAppointments { staff_id, date } => {
                let appointments = gw
                    .call("list_appointments", move |engine| async move {
                        engine.list_appointments(&staff_id, date)
                    })
                    .await
                    .map_err(gateway_err)?;
                Ok(vec![appointment_rows(appointments)])
            }
            Command::SelectAppointment { id } => {
                let appointment = gw
                    .call("get_appointment", move |engine| async move { engine.get_appointment(&id) })
                    .await
                    .map_err(gateway_err)?;
                Ok(vec![appointment_rows(vec![appointment])])
            }
            Command::JoinWaitlist { request } => {
                let view = gw
                    .call("join_waitlist", move |engine| {
                        let request = request.clone();
                        async move { engine.join_waitlist(request, now).await }
                    })
                    .await
                    .map_err(gateway_err)?;
                Ok(vec![waitlist_rows(vec![view])])
            }
            Command::UpdateWaitlist { id, action } => {
                let view = match action {
                    WaitlistAction::Notify => {
                        gw.call("notify_waitlist", move |engine| async move {
                            engine.notify_waitlist(id, now).await
                        })
                        .await
                    }
                    WaitlistAction::Leave => self.remove_walk_in(id, WaitlistStatus::Left, now).await,
                    WaitlistAction::NoShow => self.remove_walk_in(id, WaitlistStatus::NoShow, now).await,
                    WaitlistAction::Seat {
                        staff_id,
                        appointment_id,
                        service_ids,
                    } => {
                        // Fixed before the first attempt so retries cannot seat twice.
                        let appointment_id = appointment_id.unwrap_or_else(Ulid::new);
                        gw.call("seat", move |engine| {
                            let service_ids = service_ids.clone();
                            async move {
                                engine
                                    .seat(id, appointment_id, staff_id, service_ids, now)
                                    .await
                                    .map(|(view, _)| view)
                            }
                        })
                        .await
                    }
                }
                .map_err(gateway_err)?;
                Ok(vec![waitlist_rows(vec![view])])
            }
            Command::ReorderWaitlist { id, position } => {
                let view = gw
                    .call("reorder_waitlist", move |engine| async move {
                        engine.reorder_waitlist(id, position, now).await
                    })
                    .await
                    .map_err(gateway_err)?;
                Ok(vec![waitlist_rows(vec![view])])
            }
            Command::SelectWaitlist { location_id } => {
                let views = gw
                    .call("recompute_waitlist", move |engine| async move {
                        engine.recompute_waitlist(&location_id, now).await
                    })
                    .await
                    .map_err(gateway_err)?;
                Ok(vec![waitlist_rows(views)])
            }
            Command::SelectWaitlistEntry { id } => {
                let view = gw
                    .call("waitlist_entry", move |engine| async move {
                        engine.waitlist_entry(&id, now).await
                    })
                    .await
                    .map_err(gateway_err)?;
                Ok(vec![waitlist_rows(vec![view])])
            }
        }
    }
}

impl SlotkeeperHandler {
    async fn remove_walk_in(&self, id: Ulid, status: WaitlistStatus, now: Ms) -> Result<WaitlistView, GatewayError> {
        self.gateway
            .call("remove_from_waitlist", move |engine| async move {
                engine.remove_from_waitlist(id, status, now).await
            })
            .await
    }
}

fn inserted() -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(1))
}

// ── Result sets ──────────────────────────────────────────────────

fn text_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn slots_schema() -> Vec<FieldInfo> {
    vec![
        text_field("start", Type::INT8),
        text_field("end", Type::INT8),
        text_field("available_staff", Type::VARCHAR),
    ]
}

fn appointments_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("location_id", Type::VARCHAR),
        text_field("staff_id", Type::VARCHAR),
        text_field("client", Type::VARCHAR),
        text_field("service_ids", Type::VARCHAR),
        text_field("start", Type::INT8),
        text_field("end", Type::INT8),
        text_field("date", Type::VARCHAR),
        text_field("status", Type::VARCHAR),
        text_field("channel", Type::VARCHAR),
        text_field("external_call_id", Type::VARCHAR),
    ]
}

fn waitlist_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("location_id", Type::VARCHAR),
        text_field("client", Type::VARCHAR),
        text_field("notes", Type::VARCHAR),
        text_field("status", Type::VARCHAR),
        text_field("position", Type::INT4),
        text_field("estimated_wait", Type::INT4),
        text_field("estimated_duration", Type::INT4),
        text_field("arrived_at", Type::INT8),
        text_field("appointment_id", Type::VARCHAR),
    ]
}

fn join_ids(ids: &[Ulid]) -> String {
    ids.iter().map(Ulid::to_string).collect::<Vec<_>>().join(",")
}

fn slot_rows(slots: Vec<TimeSlot>) -> Response {
    let schema = Arc::new(slots_schema());
    let rows: Vec<PgWireResult<_>> = slots
        .into_iter()
        .map(|slot| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&slot.start)?;
            encoder.encode_field(&slot.span().end)?;
            encoder.encode_field(&join_ids(&slot.available_staff))?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn appointment_rows(appointments: Vec<Appointment>) -> Response {
    let schema = Arc::new(appointments_schema());
    let rows: Vec<PgWireResult<_>> = appointments
        .into_iter()
        .map(|a| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&a.id.to_string())?;
            encoder.encode_field(&a.location_id.to_string())?;
            encoder.encode_field(&a.staff_id.to_string())?;
            encoder.encode_field(&a.client.to_string())?;
            encoder.encode_field(&join_ids(&a.service_ids))?;
            encoder.encode_field(&a.span.start)?;
            encoder.encode_field(&a.span.end)?;
            encoder.encode_field(&a.date.to_string())?;
            encoder.encode_field(&a.status.as_str().to_string())?;
            encoder.encode_field(&a.channel.as_str().to_string())?;
            encoder.encode_field(&a.external_ref)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn waitlist_rows(views: Vec<WaitlistView>) -> Response {
    let schema = Arc::new(waitlist_schema());
    let rows: Vec<PgWireResult<_>> = views
        .into_iter()
        .map(|v| {
            let e = &v.entry;
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&e.id.to_string())?;
            encoder.encode_field(&e.location_id.to_string())?;
            encoder.encode_field(&e.client.to_string())?;
            encoder.encode_field(&e.notes)?;
            encoder.encode_field(&e.status.as_str().to_string())?;
            encoder.encode_field(&v.position.map(|p| p as i32))?;
            encoder.encode_field(&v.estimated_wait_min.map(|w| w as i32))?;
            encoder.encode_field(&(e.estimated_duration_min as i32))?;
            encoder.encode_field(&e.arrived_at)?;
            encoder.encode_field(&e.appointment_id.map(|id| id.to_string()))?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

/// Row shape a statement will produce, judged from its text so that
/// statements with unbound `$n` placeholders can be described.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.trim_start().to_lowercase();
    if lower.starts_with("delete") {
        return vec![];
    }
    let mentions = |table: &str| {
        lower
            .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .any(|word| word == table)
    };
    if mentions("slots") {
        slots_schema()
    } else if mentions("appointments") {
        appointments_schema()
    } else if mentions("waitlist") {
        waitlist_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for SlotkeeperHandler {
    async fn do_query<C>(&self, _client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        self.run(query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotkeeperQueryParser;

#[async_trait]
impl QueryParser for SlotkeeperQueryParser {
    type Statement = String;

    async fn parse_sql<C>(&self, _client: &C, sql: &str, _types: &[Option<Type>]) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(&self, stmt: &String, _column_format: Option<&Format>) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for SlotkeeperHandler {
    type Statement = String;
    type QueryParser = SlotkeeperQueryParser;

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
        let mut responses = self.run(&sql).await?;
        if responses.is_empty() {
            return Ok(Response::EmptyQuery);
        }
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
        Ok(DescribeStatementResponse::new(param_types, result_schema(&target.statement)))
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
        Ok(DescribePortalResponse::new(result_schema(&target.statement.statement)))
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
            if i > start
                && let Ok(n) = sql[start..i].parse::<usize>()
            {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
/// Highest index first so `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();
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

pub struct SlotkeeperFactory {
    handler: Arc<SlotkeeperHandler>,
    auth_handler: Arc<CleartextPasswordAuthStartupHandler<SlotkeeperAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl SlotkeeperFactory {
    pub fn new(gateway: Arc<Gateway>, password: String) -> Self {
        let auth_source = SlotkeeperAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(SlotkeeperHandler::new(gateway)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(auth_source, param_provider)),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotkeeperFactory {
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
    factory: Arc<SlotkeeperFactory>,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

/// SQLSTATE for each error class.
fn sqlstate(class: ErrorClass) -> &'static str {
    match class {
        ErrorClass::Validation => "22023",
        ErrorClass::Conflict => "23P01",
        ErrorClass::InvalidTransition => "55000",
        ErrorClass::StoreUnavailable => "58000",
    }
}

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

fn gateway_err(e: GatewayError) -> PgWireError {
    user_error(sqlstate(e.class()), e.to_string())
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
