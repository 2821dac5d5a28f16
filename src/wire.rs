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
use pgwire::messages::data::DataRow;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use ulid::Ulid;

use crate::auth::RoomShareAuthSource;
use crate::dates::{self, format_timestamp};
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability::{QUERIES_TOTAL, QUERY_DURATION_SECONDS, command_label};
use crate::sql::{self, Command, SqlError};

pub struct RoomShareHandler {
    engine: Arc<Engine>,
    query_parser: Arc<RoomShareQueryParser>,
}

impl RoomShareHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(RoomShareQueryParser),
        }
    }

    /// The login user name is a user id. Anything that does not name a
    /// registered user gives an anonymous session.
    fn resolve_principal<C: ClientInfo>(&self, client: &C) -> Option<Principal> {
        let user = client.metadata().get("user")?;
        let id = Ulid::from_string(user).ok()?;
        self.engine.principal_for(&id)
    }

    async fn run_sql(&self, principal: Option<Principal>, query: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(principal, cmd).await;
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        result
    }

    async fn execute_command(
        &self,
        principal: Option<Principal>,
        cmd: Command,
    ) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::InsertUser {
                id,
                name,
                email,
                role,
            } => {
                engine
                    .register_user(id, name, email, role)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::InsertProperty { id, name, city } => {
                let p = signed_in(principal)?;
                engine
                    .create_property(&p, id, name, city)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::UpdateProperty { id, name, city } => {
                let p = signed_in(principal)?;
                engine
                    .update_property(&p, id, name, city)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::UpdateProfile { id, name, email } => {
                let p = signed_in(principal)?;
                engine
                    .update_profile(&p, id, name, email)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::InsertRoom {
                id,
                property_id,
                label,
                capacity,
            } => {
                let p = signed_in(principal)?;
                engine
                    .create_room(&p, id, property_id, label, capacity)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::UpdateRoom {
                id,
                label,
                capacity,
            } => {
                let p = signed_in(principal)?;
                engine
                    .update_room(&p, id, label, capacity)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::DeleteRoom { id } => {
                let p = signed_in(principal)?;
                engine.delete_room(&p, id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertRequest {
                id,
                room_id,
                move_in,
                months,
            } => {
                let p = signed_in(principal)?;
                engine
                    .submit_request(&p, id, room_id, move_in, months)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DecideRequest { id, accept } => {
                let p = signed_in(principal)?;
                if accept {
                    engine.approve_request(&p, id).await.map_err(engine_err)?;
                } else {
                    engine.decline_request(&p, id).await.map_err(engine_err)?;
                }
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::RecordDeparture { id } => {
                let p = signed_in(principal)?;
                engine.record_departure(&p, id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::InsertGuardianLink { id, counterpart_id } => {
                let p = signed_in(principal)?;
                engine
                    .request_guardian_link(&p, id, counterpart_id)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::RespondGuardianLink { id, accept } => {
                let p = signed_in(principal)?;
                engine
                    .respond_guardian_link(&p, id, accept)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::SelectProperties { id } => {
                let p = signed_in(principal)?;
                let properties = match id {
                    Some(id) => vec![engine.property_details(&p, id).map_err(engine_err)?],
                    None => engine.list_properties(&p).map_err(engine_err)?,
                };
                let schema = Arc::new(properties_schema());
                let rows = properties
                    .iter()
                    .map(|s| encode_property(&schema, s))
                    .collect();
                Ok(query_response(schema, rows))
            }
            Command::SelectProfile => {
                let p = signed_in(principal)?;
                let user = engine.profile(&p).map_err(engine_err)?;
                let schema = Arc::new(users_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&user.id.to_string())?;
                encoder.encode_field(&user.name)?;
                encoder.encode_field(&user.email)?;
                encoder.encode_field(&user.role.as_str())?;
                encoder.encode_field(&format_timestamp(user.registered_at))?;
                Ok(query_response(schema, vec![Ok(encoder.take_row())]))
            }
            Command::SelectRooms {
                property_id,
                only_available,
            } => {
                let rooms = engine.list_rooms(property_id, only_available).await;
                let schema = Arc::new(rooms_schema());
                let rows: Vec<PgWireResult<DataRow>> = rooms
                    .iter()
                    .map(|r| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&r.id.to_string())?;
                        encoder.encode_field(&r.property_id.to_string())?;
                        encoder.encode_field(&r.label)?;
                        encoder.encode_field(&i64::from(r.capacity))?;
                        encoder.encode_field(&r.is_available)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(query_response(schema, rows))
            }
            Command::SelectAvailability { room_id } => {
                let info = engine
                    .room_availability(room_id, dates::now())
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(availability_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&info.room_id.to_string())?;
                encoder.encode_field(&i64::from(info.capacity))?;
                encoder.encode_field(&(info.current as i64))?;
                encoder.encode_field(&(info.upcoming as i64))?;
                encoder.encode_field(&info.available)?;
                Ok(query_response(schema, vec![Ok(encoder.take_row())]))
            }
            Command::SelectOccupancies { room_id } => {
                let roster = engine
                    .room_roster(room_id, dates::now())
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(occupancies_schema());
                let sections = [
                    ("current", &roster.current),
                    ("upcoming", &roster.upcoming),
                    ("past", &roster.past),
                ];
                let mut rows = Vec::new();
                for (section, occupancies) in sections {
                    for o in occupancies {
                        rows.push(encode_occupancy(&schema, section, o));
                    }
                }
                Ok(query_response(schema, rows))
            }
            Command::SelectRequests {
                property_id,
                status,
            } => {
                let p = signed_in(principal)?;
                let requests = engine
                    .requests_for(&p, property_id, status)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(requests_schema());
                let rows = requests
                    .iter()
                    .map(|r| encode_request(&schema, r))
                    .collect();
                Ok(query_response(schema, rows))
            }
            Command::SelectPendingCount => {
                let p = signed_in(principal)?;
                let count = engine.pending_count(&p).await.map_err(engine_err)?;
                let schema = Arc::new(pending_count_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&(count as i64))?;
                Ok(query_response(schema, vec![Ok(encoder.take_row())]))
            }
            Command::SelectStays { resident_id } => {
                let p = signed_in(principal)?;
                let status = engine
                    .stay_status(&p, resident_id, dates::now())
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(stays_schema());
                Ok(query_response(schema.clone(), encode_stays(&schema, &status)))
            }
            Command::SelectGuardianLinks => {
                let p = signed_in(principal)?;
                let schema = Arc::new(guardian_links_schema());
                let rows = engine
                    .guardian_links(&p)
                    .iter()
                    .map(|l| encode_link(&schema, l))
                    .collect();
                Ok(query_response(schema, rows))
            }
            Command::Listen { channel } => {
                let room_id_str = channel.strip_prefix("room_").ok_or_else(|| {
                    PgWireError::UserError(Box::new(ErrorInfo::new(
                        "ERROR".into(),
                        "42000".into(),
                        format!("invalid channel: {channel} (expected room_{{id}})"),
                    )))
                })?;
                let _room_id = Ulid::from_string(room_id_str).map_err(|e| {
                    PgWireError::UserError(Box::new(ErrorInfo::new(
                        "ERROR".into(),
                        "42000".into(),
                        format!("bad ULID in channel: {e}"),
                    )))
                })?;
                Ok(Response::Execution(Tag::new("LISTEN")))
            }
        }
    }
}

fn query_response(schema: Arc<Vec<FieldInfo>>, rows: Vec<PgWireResult<DataRow>>) -> Response {
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

// ── Row encoding ─────────────────────────────────────────────────

fn opt_id(id: Option<Ulid>) -> Option<String> {
    id.map(|id| id.to_string())
}

fn opt_ts(ts: Option<Timestamp>) -> Option<String> {
    ts.map(format_timestamp)
}

fn encode_property(schema: &Arc<Vec<FieldInfo>>, s: &PropertySummary) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&s.property.id.to_string())?;
    encoder.encode_field(&s.property.owner_id.to_string())?;
    encoder.encode_field(&s.property.name)?;
    encoder.encode_field(&s.property.city)?;
    encoder.encode_field(&(s.room_count as i64))?;
    Ok(encoder.take_row())
}

fn encode_occupancy(
    schema: &Arc<Vec<FieldInfo>>,
    section: &str,
    o: &Occupancy,
) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&section)?;
    encoder.encode_field(&o.id.to_string())?;
    encoder.encode_field(&o.user_id.to_string())?;
    encoder.encode_field(&opt_id(o.request_id))?;
    encoder.encode_field(&opt_ts(o.joined_at))?;
    encoder.encode_field(&opt_ts(o.exit_date))?;
    encoder.encode_field(&o.is_active)?;
    encoder.encode_field(&o.status.as_str())?;
    Ok(encoder.take_row())
}

fn encode_request(schema: &Arc<Vec<FieldInfo>>, r: &BookingRequest) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&r.id.to_string())?;
    encoder.encode_field(&r.room_id.to_string())?;
    encoder.encode_field(&r.resident_id.to_string())?;
    encoder.encode_field(&format_timestamp(r.move_in))?;
    encoder.encode_field(&i64::from(r.months))?;
    encoder.encode_field(&r.status.as_str())?;
    encoder.encode_field(&format_timestamp(r.created_at))?;
    encoder.encode_field(&format_timestamp(r.expires_at))?;
    encoder.encode_field(&r.note)?;
    Ok(encoder.take_row())
}

/// One row for the current stay, one per roommate, one per past stay.
fn encode_stays(schema: &Arc<Vec<FieldInfo>>, status: &StayStatus) -> Vec<PgWireResult<DataRow>> {
    let stay_row = |section: &str, o: &Occupancy| -> PgWireResult<DataRow> {
        let mut encoder = DataRowEncoder::new(schema.clone());
        encoder.encode_field(&section)?;
        encoder.encode_field(&Some(o.id.to_string()))?;
        encoder.encode_field(&o.room_id.to_string())?;
        encoder.encode_field(&o.user_id.to_string())?;
        encoder.encode_field(&opt_ts(o.joined_at))?;
        encoder.encode_field(&opt_ts(o.exit_date))?;
        encoder.encode_field(&o.status.as_str())?;
        Ok(encoder.take_row())
    };

    let mut rows = Vec::new();
    if let Some(current) = &status.current {
        rows.push(stay_row("current", current));
        for mate in &status.roommates {
            rows.push(encode_roommate(schema, current.room_id, *mate));
        }
    }
    for past in &status.past {
        rows.push(stay_row("past", past));
    }
    rows
}

fn encode_roommate(schema: &Arc<Vec<FieldInfo>>, room_id: Ulid, user_id: Ulid) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&"roommate")?;
    encoder.encode_field(&None::<String>)?;
    encoder.encode_field(&room_id.to_string())?;
    encoder.encode_field(&user_id.to_string())?;
    encoder.encode_field(&None::<String>)?;
    encoder.encode_field(&None::<String>)?;
    encoder.encode_field(&None::<String>)?;
    Ok(encoder.take_row())
}

fn encode_link(schema: &Arc<Vec<FieldInfo>>, l: &GuardianLink) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&l.id.to_string())?;
    encoder.encode_field(&l.guardian_id.to_string())?;
    encoder.encode_field(&l.resident_id.to_string())?;
    encoder.encode_field(&l.requested_by.to_string())?;
    encoder.encode_field(&l.status.as_str())?;
    encoder.encode_field(&format_timestamp(l.requested_at))?;
    encoder.encode_field(&opt_ts(l.responded_at))?;
    Ok(encoder.take_row())
}

// ── Result schemas ───────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn properties_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("owner_id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("city", Type::VARCHAR),
        field("room_count", Type::INT8),
    ]
}

fn users_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("email", Type::VARCHAR),
        field("role", Type::VARCHAR),
        field("registered_at", Type::VARCHAR),
    ]
}

fn rooms_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("property_id", Type::VARCHAR),
        field("label", Type::VARCHAR),
        field("capacity", Type::INT8),
        field("is_available", Type::BOOL),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        field("room_id", Type::VARCHAR),
        field("capacity", Type::INT8),
        field("current", Type::INT8),
        field("upcoming", Type::INT8),
        field("available", Type::BOOL),
    ]
}

fn occupancies_schema() -> Vec<FieldInfo> {
    vec![
        field("section", Type::VARCHAR),
        field("id", Type::VARCHAR),
        field("user_id", Type::VARCHAR),
        field("request_id", Type::VARCHAR),
        field("joined_at", Type::VARCHAR),
        field("exit_date", Type::VARCHAR),
        field("is_active", Type::BOOL),
        field("status", Type::VARCHAR),
    ]
}

fn requests_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("room_id", Type::VARCHAR),
        field("resident_id", Type::VARCHAR),
        field("move_in", Type::VARCHAR),
        field("months", Type::INT8),
        field("status", Type::VARCHAR),
        field("created_at", Type::VARCHAR),
        field("expires_at", Type::VARCHAR),
        field("note", Type::VARCHAR),
    ]
}

fn pending_count_schema() -> Vec<FieldInfo> {
    vec![field("count", Type::INT8)]
}

fn stays_schema() -> Vec<FieldInfo> {
    vec![
        field("section", Type::VARCHAR),
        field("occupancy_id", Type::VARCHAR),
        field("room_id", Type::VARCHAR),
        field("user_id", Type::VARCHAR),
        field("joined_at", Type::VARCHAR),
        field("exit_date", Type::VARCHAR),
        field("status", Type::VARCHAR),
    ]
}

fn guardian_links_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("guardian_id", Type::VARCHAR),
        field("resident_id", Type::VARCHAR),
        field("requested_by", Type::VARCHAR),
        field("status", Type::VARCHAR),
        field("requested_at", Type::VARCHAR),
        field("responded_at", Type::VARCHAR),
    ]
}

/// Result columns of a statement, found from the table after `FROM`.
/// Non-SELECT statements return no rows.
fn result_schema(stmt: &str) -> Vec<FieldInfo> {
    let mut tokens = stmt.split_whitespace();
    if !tokens
        .next()
        .is_some_and(|t| t.eq_ignore_ascii_case("SELECT"))
    {
        return vec![];
    }
    let table = tokens
        .skip_while(|t| !t.eq_ignore_ascii_case("FROM"))
        .nth(1)
        .map(|t| t.trim_end_matches(';').to_lowercase());
    match table.as_deref() {
        Some("properties") => properties_schema(),
        Some("users") => users_schema(),
        Some("rooms") => rooms_schema(),
        Some("availability") => availability_schema(),
        Some("occupancies") => occupancies_schema(),
        Some("booking_requests") => requests_schema(),
        Some("pending_count") => pending_count_schema(),
        Some("stays") => stays_schema(),
        Some("guardian_links") => guardian_links_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for RoomShareHandler {
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
        let principal = self.resolve_principal(client);
        Ok(vec![self.run_sql(principal, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct RoomShareQueryParser;

#[async_trait]
impl QueryParser for RoomShareQueryParser {
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
impl ExtendedQueryHandler for RoomShareHandler {
    type Statement = String;
    type QueryParser = RoomShareQueryParser;

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
        let principal = self.resolve_principal(client);
        let sql = substitute_params(portal);
        self.run_sql(principal, &sql).await
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
                    max = max.max(n);
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
    bind_params(&portal.statement.statement, &portal.parameters)
}

/// One left-to-right pass, so text inside a bound value is never rescanned.
/// `$` inside a quoted literal of the statement is left alone, as is a
/// placeholder with no matching parameter.
fn bind_params<P: AsRef<[u8]>>(sql: &str, params: &[Option<P>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.char_indices().peekable();
    let mut in_literal = false;

    while let Some((i, c)) = chars.next() {
        if c == '\'' {
            in_literal = !in_literal;
        }
        if c != '$' || in_literal {
            out.push(c);
            continue;
        }
        let mut end = i + 1;
        while let Some(&(j, d)) = chars.peek() {
            if !d.is_ascii_digit() {
                break;
            }
            end = j + 1;
            chars.next();
        }
        let param = sql[i + 1..end]
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|n| params.get(n));
        match param {
            Some(Some(bytes)) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                out.push('\'');
                out.push_str(&text.replace('\'', "''"));
                out.push('\'');
            }
            Some(None) => out.push_str("NULL"),
            None => out.push_str(&sql[i..end]),
        }
    }
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct RoomShareFactory {
    handler: Arc<RoomShareHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<RoomShareAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl RoomShareFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        let auth_source = RoomShareAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(RoomShareHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for RoomShareFactory {
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
    let factory = Arc::new(RoomShareFactory::new(engine, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

fn signed_in(principal: Option<Principal>) -> PgWireResult<Principal> {
    principal.ok_or_else(|| {
        user_error(
            "42501",
            "permission denied: log in with a registered user id".into(),
        )
    })
}

fn engine_err(e: EngineError) -> PgWireError {
    let code = match e {
        EngineError::Forbidden(_) => "42501",
        _ => "P0001",
    };
    user_error(code, e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sqlstate(e: PgWireError) -> String {
        assert!(matches!(e, PgWireError::UserError(_)), "unexpected error {e:?}");
        let debug = format!("{e:?}");
        ["42501", "42601", "P0001"]
            .into_iter()
            .find(|code| debug.contains(&format!("\"{code}\"")))
            .unwrap_or_default()
            .to_string()
    }

    #[test]
    fn counts_highest_placeholder() {
        assert_eq!(count_params("SELECT * FROM rooms"), 0);
        assert_eq!(
            count_params("INSERT INTO booking_requests VALUES ($1, $2, $3, $10)"),
            10
        );
    }

    #[test]
    fn bound_values_are_not_rescanned() {
        let params = [Some(b"abc".as_slice()), Some(b"x$1y".as_slice())];
        assert_eq!(
            bind_params("UPDATE users SET name = $2 WHERE id = $1", &params),
            "UPDATE users SET name = 'x$1y' WHERE id = 'abc'"
        );
    }

    #[test]
    fn binds_quotes_nulls_and_double_digits() {
        let mut params: Vec<Option<&[u8]>> = vec![None; 10];
        params[0] = Some(b"O'Neil".as_slice());
        params[9] = Some(b"ten".as_slice());
        assert_eq!(
            bind_params("VALUES ($1, $2, $10, '$1', $11)", &params),
            "VALUES ('O''Neil', NULL, 'ten', '$1', $11)"
        );
    }

    #[test]
    fn schema_follows_from_table() {
        let names = |stmt: &str| -> Vec<String> {
            result_schema(stmt)
                .iter()
                .map(|f| f.name().to_string())
                .collect()
        };
        assert_eq!(names("select count from pending_count;")[0], "count");
        assert_eq!(names("SELECT * FROM properties")[4], "room_count");
        assert_eq!(names("SELECT * FROM users")[2], "email");
        assert_eq!(names("SELECT * FROM availability WHERE room_id = $1").len(), 5);
        assert_eq!(names("SELECT * FROM stays WHERE resident_id = $1")[0], "section");
        assert!(names("UPDATE rooms SET capacity = 2 WHERE id = $1").is_empty());
        assert!(names("SELECT * FROM nowhere").is_empty());
    }

    #[test]
    fn forbidden_maps_to_insufficient_privilege() {
        assert_eq!(sqlstate(engine_err(EngineError::Forbidden("host role required"))), "42501");
        assert_eq!(sqlstate(engine_err(EngineError::NotFound(Ulid::new()))), "P0001");
        assert_eq!(sqlstate(signed_in(None).unwrap_err()), "42501");
        assert_eq!(sqlstate(sql_err(SqlError::Empty)), "42601");
    }
}
