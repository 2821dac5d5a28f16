use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::dates;
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertUser {
        id: Ulid,
        name: String,
        email: String,
        role: Role,
    },
    InsertProperty {
        id: Ulid,
        name: String,
        city: Option<String>,
    },
    /// `None` fields keep their stored value.
    UpdateProperty {
        id: Ulid,
        name: Option<String>,
        city: Option<String>,
    },
    UpdateProfile {
        id: Ulid,
        name: Option<String>,
        email: Option<String>,
    },
    InsertRoom {
        id: Ulid,
        property_id: Ulid,
        label: Option<String>,
        capacity: u32,
    },
    UpdateRoom {
        id: Ulid,
        label: Option<String>,
        capacity: Option<u32>,
    },
    DeleteRoom {
        id: Ulid,
    },
    InsertRequest {
        id: Ulid,
        room_id: Ulid,
        move_in: Timestamp,
        months: u32,
    },
    /// `status = 'accepted'` approves, `'declined'` declines.
    DecideRequest {
        id: Ulid,
        accept: bool,
    },
    RecordDeparture {
        id: Ulid,
    },
    InsertGuardianLink {
        id: Ulid,
        counterpart_id: Ulid,
    },
    RespondGuardianLink {
        id: Ulid,
        accept: bool,
    },
    /// The caller's properties, or one of them when `id` is set.
    SelectProperties {
        id: Option<Ulid>,
    },
    SelectProfile,
    SelectRooms {
        property_id: Option<Ulid>,
        only_available: bool,
    },
    SelectAvailability {
        room_id: Ulid,
    },
    SelectOccupancies {
        room_id: Ulid,
    },
    SelectRequests {
        property_id: Option<Ulid>,
        status: Option<BookingStatus>,
    },
    SelectPendingCount,
    SelectStays {
        resident_id: Ulid,
    },
    SelectGuardianLinks,
    Listen {
        channel: String,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim();
    if trimmed.get(..7).is_some_and(|kw| kw.eq_ignore_ascii_case("LISTEN ")) {
        let channel = trimmed[7..].trim().trim_end_matches(';').trim().to_string();
        return Ok(Command::Listen { channel });
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

/// One VALUES row keyed by column name. Without a column list the table's
/// declared order applies.
struct Row {
    columns: Vec<String>,
    values: Vec<Expr>,
}

impl Row {
    fn new(insert: &ast::Insert, table: &'static str, default_columns: &[&str]) -> Result<Self, SqlError> {
        let values = extract_insert_values(insert)?;
        let columns: Vec<String> = if insert.columns.is_empty() {
            default_columns.iter().map(|c| c.to_string()).collect()
        } else {
            insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
        };
        let arity_ok = if insert.columns.is_empty() {
            values.len() <= columns.len()
        } else {
            values.len() == columns.len()
        };
        if !arity_ok {
            return Err(SqlError::WrongArity(table, columns.len(), values.len()));
        }
        if let Some(unknown) = columns.iter().find(|c| !default_columns.contains(&c.as_str())) {
            return Err(SqlError::UnknownColumn(table, unknown.clone()));
        }
        Ok(Self { columns, values })
    }

    fn get(&self, column: &str) -> Option<&Expr> {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|i| self.values.get(i))
    }

    fn require(&self, column: &'static str) -> Result<&Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn(column))
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;

    match table.as_str() {
        "users" => {
            let row = Row::new(insert, "users", &["id", "name", "email", "role"])?;
            let role_text = parse_string(row.require("role")?)?;
            Ok(Command::InsertUser {
                id: parse_ulid_expr(row.require("id")?)?,
                name: parse_string(row.require("name")?)?,
                email: parse_string(row.require("email")?)?,
                role: Role::parse(&role_text).ok_or(SqlError::BadValue("role", role_text))?,
            })
        }
        "properties" => {
            let row = Row::new(insert, "properties", &["id", "name", "city"])?;
            Ok(Command::InsertProperty {
                id: parse_ulid_expr(row.require("id")?)?,
                name: parse_string(row.require("name")?)?,
                city: row.get("city").map(parse_string_or_null).transpose()?.flatten(),
            })
        }
        "rooms" => {
            let row = Row::new(insert, "rooms", &["id", "property_id", "label", "capacity"])?;
            Ok(Command::InsertRoom {
                id: parse_ulid_expr(row.require("id")?)?,
                property_id: parse_ulid_expr(row.require("property_id")?)?,
                label: row.get("label").map(parse_string_or_null).transpose()?.flatten(),
                capacity: parse_u32(row.require("capacity")?)?,
            })
        }
        "booking_requests" => {
            let row = Row::new(insert, "booking_requests", &["id", "room_id", "move_in", "months"])?;
            Ok(Command::InsertRequest {
                id: parse_ulid_expr(row.require("id")?)?,
                room_id: parse_ulid_expr(row.require("room_id")?)?,
                move_in: parse_timestamp_expr(row.require("move_in")?)?,
                months: parse_u32(row.require("months")?)?,
            })
        }
        "guardian_links" => {
            let row = Row::new(insert, "guardian_links", &["id", "counterpart_id"])?;
            Ok(Command::InsertGuardianLink {
                id: parse_ulid_expr(row.require("id")?)?,
                counterpart_id: parse_ulid_expr(row.require("counterpart_id")?)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    let id = extract_where_id(selection)?;

    let mut set: Vec<(String, &Expr)> = Vec::with_capacity(assignments.len());
    for a in assignments {
        let column = match &a.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        }
        .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;
        set.push((column, &a.value));
    }
    let assigned = |column: &str| set.iter().find(|(c, _)| c == column).map(|(_, e)| *e);
    let only = |allowed: &[&str]| match set.iter().find(|(c, _)| !allowed.contains(&c.as_str())) {
        Some((c, _)) => Err(SqlError::UnknownColumn(static_table(&table), c.clone())),
        None => Ok(()),
    };

    match table.as_str() {
        "properties" => {
            only(&["name", "city"])?;
            if set.is_empty() {
                return Err(SqlError::MissingColumn("name"));
            }
            Ok(Command::UpdateProperty {
                id,
                name: assigned("name").map(parse_string).transpose()?,
                city: assigned("city").map(parse_string_or_null).transpose()?.flatten(),
            })
        }
        "users" => {
            only(&["name", "email"])?;
            if set.is_empty() {
                return Err(SqlError::MissingColumn("name"));
            }
            Ok(Command::UpdateProfile {
                id,
                name: assigned("name").map(parse_string).transpose()?,
                email: assigned("email").map(parse_string).transpose()?,
            })
        }
        "rooms" => {
            only(&["label", "capacity"])?;
            if set.is_empty() {
                return Err(SqlError::MissingColumn("capacity"));
            }
            Ok(Command::UpdateRoom {
                id,
                label: assigned("label").map(parse_string_or_null).transpose()?.flatten(),
                capacity: assigned("capacity").map(parse_u32).transpose()?,
            })
        }
        "booking_requests" => {
            only(&["status"])?;
            let status = parse_string(assigned("status").ok_or(SqlError::MissingColumn("status"))?)?;
            match status.to_lowercase().as_str() {
                "accepted" => Ok(Command::DecideRequest { id, accept: true }),
                "declined" => Ok(Command::DecideRequest { id, accept: false }),
                _ => Err(SqlError::BadValue("status", status)),
            }
        }
        "occupancies" => {
            only(&["status"])?;
            let status = parse_string(assigned("status").ok_or(SqlError::MissingColumn("status"))?)?;
            if status.eq_ignore_ascii_case("left") {
                Ok(Command::RecordDeparture { id })
            } else {
                Err(SqlError::BadValue("status", status))
            }
        }
        "guardian_links" => {
            only(&["status"])?;
            let status = parse_string(assigned("status").ok_or(SqlError::MissingColumn("status"))?)?;
            match status.to_lowercase().as_str() {
                "accepted" => Ok(Command::RespondGuardianLink { id, accept: true }),
                "declined" => Ok(Command::RespondGuardianLink { id, accept: false }),
                _ => Err(SqlError::BadValue("status", status)),
            }
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn static_table(table: &str) -> &'static str {
    match table {
        "properties" => "properties",
        "users" => "users",
        "rooms" => "rooms",
        "booking_requests" => "booking_requests",
        "occupancies" => "occupancies",
        "guardian_links" => "guardian_links",
        _ => "table",
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "rooms" => Ok(Command::DeleteRoom { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_eq_filters(selection, &mut filters)?;
    }
    let filter = |column: &str| filters.iter().find(|(c, _)| c == column).map(|(_, e)| e);
    let allow = |table: &'static str, allowed: &[&str]| {
        match filters.iter().find(|(c, _)| !allowed.contains(&c.as_str())) {
            Some((c, _)) => Err(SqlError::UnknownColumn(table, c.clone())),
            None => Ok(()),
        }
    };

    match table.as_str() {
        "properties" => {
            allow("properties", &["id"])?;
            Ok(Command::SelectProperties {
                id: filter("id").map(parse_ulid_expr).transpose()?,
            })
        }
        "users" => {
            allow("users", &[])?;
            Ok(Command::SelectProfile)
        }
        "rooms" => {
            allow("rooms", &["property_id", "available", "is_available"])?;
            let available = filter("available").or_else(|| filter("is_available"));
            Ok(Command::SelectRooms {
                property_id: filter("property_id").map(parse_ulid_expr).transpose()?,
                only_available: available.map(parse_bool).transpose()?.unwrap_or(false),
            })
        }
        "availability" => {
            allow("availability", &["room_id"])?;
            Ok(Command::SelectAvailability {
                room_id: parse_ulid_expr(filter("room_id").ok_or(SqlError::MissingFilter("room_id"))?)?,
            })
        }
        "occupancies" => {
            allow("occupancies", &["room_id"])?;
            Ok(Command::SelectOccupancies {
                room_id: parse_ulid_expr(filter("room_id").ok_or(SqlError::MissingFilter("room_id"))?)?,
            })
        }
        "booking_requests" => {
            allow("booking_requests", &["property_id", "status"])?;
            let status = match filter("status") {
                Some(e) => {
                    let text = parse_string(e)?;
                    Some(BookingStatus::parse(&text).ok_or(SqlError::BadValue("status", text))?)
                }
                None => None,
            };
            Ok(Command::SelectRequests {
                property_id: filter("property_id").map(parse_ulid_expr).transpose()?,
                status,
            })
        }
        "pending_count" => {
            allow("pending_count", &[])?;
            Ok(Command::SelectPendingCount)
        }
        "stays" => {
            allow("stays", &["resident_id"])?;
            Ok(Command::SelectStays {
                resident_id: parse_ulid_expr(
                    filter("resident_id").ok_or(SqlError::MissingFilter("resident_id"))?,
                )?,
            })
        }
        "guardian_links" => {
            allow("guardian_links", &[])?;
            Ok(Command::SelectGuardianLinks)
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Flatten `a = x AND b = y AND ...` into `(column, value)` pairs.
fn collect_eq_filters(expr: &Expr, out: &mut Vec<(String, Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_eq_filters(inner, out),
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_eq_filters(left, out)?;
            collect_eq_filters(right, out)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter {expr}")))?;
            out.push((column, right.as_ref().clone()));
            Ok(())
        }
        _ => Err(SqlError::Unsupported(format!("filter {expr}"))),
    }
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
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
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
        Some(value) => Err(SqlError::Parse(format!("expected ULID string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_string(expr).map(Some),
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let text = match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => s,
        Some(value) => return Err(SqlError::Parse(format!("expected number, got {value}"))),
        None => return Err(SqlError::Parse(format!("expected value, got {expr}"))),
    };
    text.parse()
        .map_err(|_| SqlError::Parse(format!("{text} is not a non-negative integer")))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Some(value) => Err(SqlError::Parse(format!("expected bool, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_timestamp_expr(expr: &Expr) -> Result<Timestamp, SqlError> {
    let text = parse_string(expr)?;
    dates::parse_timestamp(&text).ok_or(SqlError::BadValue("timestamp", text))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(&'static str, String),
    MissingColumn(&'static str),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
    BadValue(&'static str, String),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(t, c) => write!(f, "{t}: unknown column {c}"),
            SqlError::MissingColumn(c) => write!(f, "missing value for column: {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::BadValue(what, v) => write!(f, "bad {what}: {v}"),
        }
    }
}

impl std::error::Error for SqlError {}
