use std::fmt::Debug;
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
use ulid::Ulid;

use crate::auth::UniRoomAuthSource;
use crate::campus::CampusManager;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command};

pub struct UniRoomHandler {
    campuses: Arc<CampusManager>,
    query_parser: Arc<UniRoomQueryParser>,
}

impl UniRoomHandler {
    pub fn new(campuses: Arc<CampusManager>) -> Self {
        Self {
            campuses,
            query_parser: Arc::new(UniRoomQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.campuses.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("campus error: {e}"),
            )))
        })
    }

    /// Every statement executes against the identity carried in the
    /// connection's `user` startup parameter, format `<role>_<ulid>`.
    /// The identity collaborator authenticated it; the core trusts it.
    fn resolve_identity<C: ClientInfo>(&self, client: &C) -> PgWireResult<Requester> {
        let user = client
            .metadata()
            .get("user")
            .cloned()
            .unwrap_or_default();
        parse_identity(&user).ok_or_else(|| {
            metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "28000".into(),
                format!("user must be <role>_<ulid>, got {user:?}"),
            )))
        })
    }

    async fn execute_command(
        &self,
        engine: &Engine,
        identity: Requester,
        cmd: Command,
    ) -> PgWireResult<Vec<Response>> {
        let label = observability::command_label(&cmd);
        let start = Instant::now();
        let result = self.dispatch(engine, identity, cmd).await;
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(start.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        result
    }

    async fn dispatch(
        &self,
        engine: &Engine,
        identity: Requester,
        cmd: Command,
    ) -> PgWireResult<Vec<Response>> {
        match cmd {
            // Collaborator surfaces: room catalog and class calendar are
            // maintained by staff, outside the booking flow.
            Command::InsertRoom { id, number } => {
                require_admin(&identity)?;
                engine.create_room(id, number).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::DeleteRoom { id } => {
                require_admin(&identity)?;
                engine.delete_room(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::InsertClassBlock {
                id,
                room_id,
                day,
                start_min,
                end_min,
                subject,
                semester,
            } => {
                require_admin(&identity)?;
                engine
                    .add_class_block(id, room_id, day, start_min, end_min, subject, semester)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::DeleteClassBlock { id } => {
                require_admin(&identity)?;
                engine.remove_class_block(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }

            // The booking flow.
            Command::InsertReservation {
                id,
                room_id,
                start,
                end,
            } => {
                let placement = engine
                    .reserve(identity, id, room_id, start, end)
                    .await
                    .map_err(engine_err)?;
                if !placement.superseded.is_empty() {
                    metrics::counter!(observability::OVERRIDES_TOTAL)
                        .increment(placement.superseded.len() as u64);
                }

                let schema = Arc::new(placement_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&placement.reservation.id.to_string())?;
                encoder.encode_field(&placement.reservation.status.as_str())?;
                encoder.encode_field(&(placement.superseded.len() as i64))?;
                let rows = vec![Ok(encoder.take_row())];

                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::DeleteReservation { id } => {
                engine.cancel(identity, id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }

            // Read surfaces.
            Command::SelectRooms => {
                let rooms = engine.list_rooms().await;
                let schema = Arc::new(rooms_schema());
                let rows: Vec<PgWireResult<_>> = rooms
                    .into_iter()
                    .map(|room| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&room.id.to_string())?;
                        encoder.encode_field(&room.number)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectSchedule { room_id } => {
                let blocks = engine.get_schedule(room_id).await;
                let schema = Arc::new(schedule_schema());
                let rows: Vec<PgWireResult<_>> = blocks
                    .into_iter()
                    .map(|b| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&b.id.to_string())?;
                        encoder.encode_field(&b.room_id.to_string())?;
                        encoder.encode_field(&b.day.as_str())?;
                        encoder.encode_field(&i32::from(b.start_min))?;
                        encoder.encode_field(&i32::from(b.end_min))?;
                        encoder.encode_field(&b.subject)?;
                        encoder.encode_field(&b.semester)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectMyReservations => {
                let mine = engine.list_mine(identity.id).await;
                let schema = Arc::new(reservation_schema());
                let rows: Vec<PgWireResult<_>> = mine
                    .into_iter()
                    .map(|r| encode_reservation(&schema, &r))
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectRoomDay { room_id, date } => {
                let view = engine.room_day(room_id, date).await.map_err(engine_err)?;
                let schema = Arc::new(room_day_schema());
                let mut rows: Vec<PgWireResult<_>> = Vec::new();
                for b in &view.blocks {
                    // Recurring blocks materialize onto the queried date as
                    // absolute instants, same coordinates as reservations.
                    let w = b.window_ms();
                    let mut encoder = DataRowEncoder::new(schema.clone());
                    encoder.encode_field(&"class")?;
                    encoder.encode_field(&b.id.to_string())?;
                    encoder.encode_field(&(view.window.start + w.start))?;
                    encoder.encode_field(&(view.window.start + w.end))?;
                    encoder.encode_field(&Some(b.subject.as_str()))?;
                    encoder.encode_field(&None::<&str>)?;
                    encoder.encode_field(&None::<&str>)?;
                    rows.push(Ok(encoder.take_row()));
                }
                for r in &view.reservations {
                    let mut encoder = DataRowEncoder::new(schema.clone());
                    encoder.encode_field(&"reservation")?;
                    encoder.encode_field(&r.id.to_string())?;
                    encoder.encode_field(&r.span.start)?;
                    encoder.encode_field(&r.span.end)?;
                    encoder.encode_field(&None::<&str>)?;
                    encoder.encode_field(&Some(format_identity(&r.requester)))?;
                    encoder.encode_field(&Some(r.status.as_str()))?;
                    rows.push(Ok(encoder.take_row()));
                }
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectAvailability {
                room_id,
                start,
                end,
                min_duration,
            } => {
                let slots = engine
                    .compute_availability(room_id, start, end, min_duration)
                    .await
                    .map_err(engine_err)?;

                let schema = Arc::new(availability_schema());
                let rid_str = room_id.to_string();
                let rows: Vec<PgWireResult<_>> = slots
                    .into_iter()
                    .map(|slot| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&rid_str)?;
                        encoder.encode_field(&slot.start)?;
                        encoder.encode_field(&slot.end)?;
                        Ok(encoder.take_row())
                    })
                    .collect();

                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectOverrides => {
                let entries = engine.ledger.list_for(identity.id);
                let schema = Arc::new(overrides_schema());
                let rows: Vec<PgWireResult<_>> = entries
                    .into_iter()
                    .map(|e| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&format_identity(&e.actor))?;
                        encoder.encode_field(&e.reservation_id.to_string())?;
                        encoder.encode_field(&e.room_id.to_string())?;
                        encoder.encode_field(&e.at)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
        }
    }
}

fn encode_reservation(
    schema: &Arc<Vec<FieldInfo>>,
    r: &Reservation,
) -> PgWireResult<pgwire::messages::data::DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&r.id.to_string())?;
    encoder.encode_field(&r.room_id.to_string())?;
    encoder.encode_field(&format_identity(&r.requester))?;
    encoder.encode_field(&r.span.start)?;
    encoder.encode_field(&r.span.end)?;
    encoder.encode_field(&r.status.as_str())?;
    encoder.encode_field(&r.overridden_by.as_ref().map(format_identity))?;
    Ok(encoder.take_row())
}

/// Wire form of an identity, the same `<role>_<ulid>` shape the `user`
/// startup parameter carries.
fn format_identity(requester: &Requester) -> String {
    format!("{}_{}", requester.role.as_str(), requester.id)
}

fn parse_identity(user: &str) -> Option<Requester> {
    let (role, id) = user.split_once('_')?;
    Some(Requester {
        id: Ulid::from_string(id).ok()?,
        role: Role::parse(role)?,
    })
}

fn require_admin(identity: &Requester) -> PgWireResult<()> {
    if identity.role == Role::Admin {
        Ok(())
    } else {
        Err(PgWireError::UserError(Box::new(ErrorInfo::new(
            "ERROR".into(),
            "42501".into(),
            "room catalog and class schedule changes require an admin".into(),
        ))))
    }
}

// ── Row schemas ──────────────────────────────────────────────────

fn varchar(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int8(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn rooms_schema() -> Vec<FieldInfo> {
    vec![varchar("id"), varchar("number")]
}

fn schedule_schema() -> Vec<FieldInfo> {
    vec![
        varchar("id"),
        varchar("room_id"),
        varchar("day"),
        FieldInfo::new("start".into(), None, None, Type::INT4, FieldFormat::Text),
        FieldInfo::new("end".into(), None, None, Type::INT4, FieldFormat::Text),
        varchar("subject"),
        varchar("semester"),
    ]
}

fn placement_schema() -> Vec<FieldInfo> {
    vec![varchar("id"), varchar("status"), int8("overridden_count")]
}

fn reservation_schema() -> Vec<FieldInfo> {
    vec![
        varchar("id"),
        varchar("room_id"),
        varchar("owner"),
        int8("start"),
        int8("end"),
        varchar("status"),
        varchar("overridden_by"),
    ]
}

fn room_day_schema() -> Vec<FieldInfo> {
    vec![
        varchar("kind"),
        varchar("id"),
        int8("start"),
        int8("end"),
        varchar("subject"),
        varchar("owner"),
        varchar("status"),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![varchar("room_id"), int8("start"), int8("end")]
}

fn overrides_schema() -> Vec<FieldInfo> {
    vec![
        varchar("actor"),
        varchar("reservation_id"),
        varchar("room_id"),
        int8("at"),
    ]
}

/// Result schema by statement text, for Describe before execution.
fn schema_for_statement(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    if upper.contains("INSERT") {
        if upper.contains("RESERVATIONS") {
            return placement_schema();
        }
        return vec![];
    }
    if !upper.contains("SELECT") {
        return vec![];
    }
    if upper.contains("MY_RESERVATIONS") {
        reservation_schema()
    } else if upper.contains("ROOM_DAY") {
        room_day_schema()
    } else if upper.contains("AVAILABILITY") {
        availability_schema()
    } else if upper.contains("OVERRIDES") {
        overrides_schema()
    } else if upper.contains("SCHEDULE") {
        schedule_schema()
    } else if upper.contains("ROOMS") {
        rooms_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for UniRoomHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let identity = self.resolve_identity(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        self.execute_command(&engine, identity, cmd).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct UniRoomQueryParser;

#[async_trait]
impl QueryParser for UniRoomQueryParser {
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
        Ok(schema_for_statement(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for UniRoomHandler {
    type Statement = String;
    type QueryParser = UniRoomQueryParser;

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
        let identity = self.resolve_identity(client)?;
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        let mut responses = self.execute_command(&engine, identity, cmd).await?;
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
            schema_for_statement(&target.statement),
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
        Ok(DescribePortalResponse::new(schema_for_statement(
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

pub struct UniRoomFactory {
    handler: Arc<UniRoomHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<UniRoomAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl UniRoomFactory {
    pub fn new(campuses: Arc<CampusManager>, password: String) -> Self {
        let auth_source = UniRoomAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(UniRoomHandler::new(campuses)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for UniRoomFactory {
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
    socket: tokio::net::TcpStream,
    campuses: Arc<CampusManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = UniRoomFactory::new(campuses, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Error mapping ────────────────────────────────────────────────

/// Contested outcomes carry their tag plus a JSON detail of the specific
/// blocking entries, so clients can display who holds the slot.
fn engine_err(e: EngineError) -> PgWireError {
    let message = match e.conflict_type() {
        Some(kind) => {
            metrics::counter!(observability::RESERVATION_CONFLICTS_TOTAL, "kind" => kind)
                .increment(1);
            format!("{kind}: {e} {}", conflict_detail(&e))
        }
        None => e.to_string(),
    };
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "P0001".into(),
        message,
    )))
}

fn conflict_detail(e: &EngineError) -> String {
    let detail = match e {
        EngineError::BaseScheduleConflict { blocks } => serde_json::to_string(blocks),
        EngineError::BlockedByEqualOrHigher { conflicts } | EngineError::Blocked { conflicts } => {
            serde_json::to_string(conflicts)
        }
        _ => return String::new(),
    };
    detail.unwrap_or_default()
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
