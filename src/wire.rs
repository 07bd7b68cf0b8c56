use std::fmt::Debug;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldInfo, QueryResponse,
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

use crate::auth::RoomBookAuthSource;
use crate::engine::{ConflictReason, Engine, EngineError};
use crate::identity::Requester;
use crate::limits::DEFAULT_PAGE_LIMIT;
use crate::model::*;
use crate::observability::{self, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, SqlError};

pub struct RoomBookHandler {
    engine: Arc<Engine>,
    query_parser: Arc<RoomBookQueryParser>,
}

impl RoomBookHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(RoomBookQueryParser),
        }
    }

    /// The login name is the user's email; the startup handler has already
    /// vetted it, but the account may have been deactivated since.
    fn resolve_principal<C: ClientInfo>(&self, client: &C) -> PgWireResult<Requester> {
        let login = client.metadata().get("user").cloned().unwrap_or_default();
        self.engine.resolve_principal(&login).ok_or_else(|| {
            user_error("28000", format!("no active user with email {login:?}"))
        })
    }

    async fn run<C: ClientInfo>(&self, client: &C, sql: &str, format: &Format) -> PgWireResult<Response> {
        let principal = self.resolve_principal(client)?;
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;

        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(&principal, cmd, format).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(
        &self,
        principal: &Requester,
        cmd: Command,
        format: &Format,
    ) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::InsertRoom {
                id,
                name,
                capacity,
                location,
                amenities,
            } => {
                let room = NewRoom {
                    id,
                    name,
                    capacity,
                    location,
                    amenities,
                };
                let (engine, principal) = (engine.clone(), *principal);
                detached(async move { engine.create_room(&principal, room).await }).await?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeactivateRoom { id } => {
                engine
                    .set_room_active(principal, id, false)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectRooms => {
                let rooms = engine.list_rooms(principal).await;
                let schema = Arc::new(room_schema(format));
                let rows: Vec<PgWireResult<_>> = rooms
                    .iter()
                    .map(|room| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&room.id.to_string())?;
                        encoder.encode_field(&room.name)?;
                        encoder.encode_field(&i64::from(room.capacity))?;
                        encoder.encode_field(&room.location)?;
                        encoder.encode_field(&room.amenities)?;
                        encoder.encode_field(&room.active)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::InsertUser {
                id,
                email,
                name,
                is_admin,
            } => {
                let user = NewUser {
                    id,
                    email,
                    name,
                    is_admin,
                };
                let (engine, principal) = (engine.clone(), *principal);
                detached(async move { engine.register_user(&principal, user).await }).await?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeactivateUser { id } => {
                let (engine, principal) = (engine.clone(), *principal);
                detached(async move { engine.set_user_active(&principal, id, false).await }).await?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertBooking {
                id,
                room_id,
                start,
                end,
                purpose,
            } => {
                let request = BookingRequest {
                    id: id.unwrap_or_else(Ulid::new),
                    room_id,
                    span: Span::new(start, end),
                    purpose,
                };
                engine
                    .create_booking(principal, request)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteBooking { id } => {
                engine.delete_booking(principal, id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectBooking { id } => {
                let booking = engine.get_booking(principal, id).await.map_err(engine_err)?;
                booking_rows(&[booking], format)
            }
            Command::SelectBookings { limit, offset } => {
                let page = Page::new(offset.unwrap_or(0), limit.unwrap_or(DEFAULT_PAGE_LIMIT));
                let bookings = engine.list_bookings(principal, page).await;
                booking_rows(&bookings, format)
            }
        }
    }
}

/// Catalog writes run on their own task so a dropped connection cannot cut
/// one off between its WAL append and its apply.
async fn detached<T, F>(write: F) -> PgWireResult<T>
where
    F: Future<Output = Result<T, EngineError>> + Send + 'static,
    T: Send + 'static,
{
    tokio::spawn(write)
        .await
        .map_err(|e| user_error("XX000", format!("write task failed: {e}")))?
        .map_err(engine_err)
}

fn booking_rows(bookings: &[Booking], format: &Format) -> PgWireResult<Response> {
    let schema = Arc::new(booking_schema(format));
    let rows: Vec<PgWireResult<_>> = bookings
        .iter()
        .map(|b| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&b.id.to_string())?;
            encoder.encode_field(&b.room_id.to_string())?;
            encoder.encode_field(&b.user_id.to_string())?;
            encoder.encode_field(&b.span.start)?;
            encoder.encode_field(&b.span.end)?;
            encoder.encode_field(&b.purpose)?;
            encoder.encode_field(&b.created_at)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn fields(columns: &[(&str, Type)], format: &Format) -> Vec<FieldInfo> {
    columns
        .iter()
        .enumerate()
        .map(|(i, (name, ty))| FieldInfo::new((*name).into(), None, None, ty.clone(), format.format_for(i)))
        .collect()
}

fn room_schema(format: &Format) -> Vec<FieldInfo> {
    fields(
        &[
            ("id", Type::VARCHAR),
            ("name", Type::VARCHAR),
            ("capacity", Type::INT8),
            ("location", Type::VARCHAR),
            ("amenities", Type::VARCHAR),
            ("active", Type::BOOL),
        ],
        format,
    )
}

fn booking_schema(format: &Format) -> Vec<FieldInfo> {
    fields(
        &[
            ("id", Type::VARCHAR),
            ("room_id", Type::VARCHAR),
            ("user_id", Type::VARCHAR),
            ("start", Type::INT8),
            ("end", Type::INT8),
            ("purpose", Type::VARCHAR),
            ("created_at", Type::INT8),
        ],
        format,
    )
}

/// Row shape of a statement, decided before parameters are bound.
fn result_schema(sql: &str, format: &Format) -> Vec<FieldInfo> {
    let normalized = sql.split_whitespace().collect::<Vec<_>>().join(" ").to_uppercase();
    if !normalized.starts_with("SELECT") {
        return vec![];
    }
    if normalized.contains("FROM ROOMS") {
        room_schema(format)
    } else if normalized.contains("FROM BOOKINGS") {
        booking_schema(format)
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for RoomBookHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let response = self.run(&*client, query, &Format::UnifiedText).await?;
        Ok(vec![response])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct RoomBookQueryParser;

#[async_trait]
impl QueryParser for RoomBookQueryParser {
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

    fn get_result_schema(&self, stmt: &String, column_format: Option<&Format>) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt, column_format.unwrap_or(&Format::UnifiedText)))
    }
}

#[async_trait]
impl ExtendedQueryHandler for RoomBookHandler {
    type Statement = String;
    type QueryParser = RoomBookQueryParser;

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
        let sql = substitute_params(&portal.statement.statement, &portal.parameters);
        self.run(&*client, &sql, &portal.result_column_format).await
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
        let schema = result_schema(&target.statement, &Format::UnifiedText);
        Ok(DescribeStatementResponse::new(param_types, schema))
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
        let schema = result_schema(&target.statement.statement, &target.result_column_format);
        Ok(DescribePortalResponse::new(schema))
    }
}

/// `$N` placeholders outside quoted text, as `(start, end, N)` byte ranges.
/// A doubled quote inside a literal closes and reopens it, which leaves the
/// scan in the right state.
fn placeholders(sql: &str) -> Vec<(usize, usize, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'\'' || b == b'"' => quote = Some(b),
            None if b == b'$' => {
                let mut end = i + 1;
                while end < bytes.len() && bytes[end].is_ascii_digit() {
                    end += 1;
                }
                if let Ok(n) = sql[i + 1..end].parse::<usize>() {
                    found.push((i, end, n));
                    i = end;
                    continue;
                }
            }
            None => {}
        }
        i += 1;
    }
    found
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    placeholders(sql).iter().map(|&(_, _, n)| n).max().unwrap_or(0)
}

/// Inline bound text parameters as quoted literals in one pass over the
/// statement. Inserted values are never rescanned.
fn substitute_params<P: AsRef<[u8]>>(sql: &str, params: &[Option<P>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut copied = 0;
    for (start, end, n) in placeholders(sql) {
        out.push_str(&sql[copied..start]);
        match n.checked_sub(1).and_then(|i| params.get(i)) {
            Some(Some(value)) => {
                out.push('\'');
                out.push_str(&String::from_utf8_lossy(value.as_ref()).replace('\'', "''"));
                out.push('\'');
            }
            Some(None) => out.push_str("NULL"),
            None => out.push_str(&sql[start..end]),
        }
        copied = end;
    }
    out.push_str(&sql[copied..]);
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct RoomBookFactory {
    handler: Arc<RoomBookHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<RoomBookAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl RoomBookFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        let auth_source = RoomBookAuthSource::new(engine.clone(), password);
        Self {
            handler: Arc::new(RoomBookHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for RoomBookFactory {
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
    let factory = RoomBookFactory::new(engine, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

pub(crate) fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

/// SQLSTATE reported for each engine failure.
fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::NotFound(..) => "P0002",
        EngineError::Conflict(ConflictReason::DuplicateActiveBooking) => "23505",
        EngineError::Conflict(ConflictReason::CapacityExceeded { .. }) => "23P01",
        EngineError::Forbidden => "42501",
        EngineError::AlreadyExists(_) | EngineError::EmailTaken(_) => "23505",
        EngineError::InvalidInput(_) => "22023",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "XX000",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
