use std::collections::HashMap;

use sqlparser::ast::{
    self, Expr, FromTable, LimitClause, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertRoom {
        id: Ulid,
        name: String,
        capacity: u32,
        location: String,
        amenities: String,
    },
    /// `DELETE FROM rooms` soft-deletes: the room stops taking bookings.
    DeactivateRoom {
        id: Ulid,
    },
    SelectRooms,
    InsertUser {
        id: Ulid,
        email: String,
        name: String,
        is_admin: bool,
    },
    DeactivateUser {
        id: Ulid,
    },
    InsertBooking {
        /// Generated by the server when the column is omitted.
        id: Option<Ulid>,
        room_id: Ulid,
        start: Ms,
        end: Ms,
        purpose: String,
    },
    DeleteBooking {
        id: Ulid,
    },
    SelectBooking {
        id: Ulid,
    },
    SelectBookings {
        limit: Option<usize>,
        offset: Option<usize>,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Column order assumed when an INSERT has no column list.
fn default_columns(table: &str) -> &'static [&'static str] {
    match table {
        "rooms" => &["id", "name", "capacity", "location", "amenities"],
        "users" => &["id", "email", "name", "is_admin"],
        "bookings" => &["id", "room_id", "start", "end", "purpose"],
        _ => &[],
    }
}

/// One VALUES row keyed by column name.
struct Row {
    table: &'static str,
    values: HashMap<String, Expr>,
}

impl Row {
    fn optional(&self, column: &str) -> Option<&Expr> {
        self.values.get(column)
    }

    fn required(&self, column: &'static str) -> Result<&Expr, SqlError> {
        self.optional(column)
            .ok_or(SqlError::MissingColumn(self.table, column))
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let row = insert_row(insert, &table)?;

    match row.table {
        "rooms" => Ok(Command::InsertRoom {
            id: parse_ulid_expr(row.required("id")?)?,
            name: parse_string_expr(row.required("name")?)?,
            capacity: row.optional("capacity").map(parse_u32).transpose()?.unwrap_or(1),
            location: row.optional("location").map(parse_string_expr).transpose()?.unwrap_or_default(),
            amenities: row.optional("amenities").map(parse_string_expr).transpose()?.unwrap_or_default(),
        }),
        "users" => Ok(Command::InsertUser {
            id: parse_ulid_expr(row.required("id")?)?,
            email: parse_string_expr(row.required("email")?)?,
            name: row.optional("name").map(parse_string_expr).transpose()?.unwrap_or_default(),
            is_admin: row.optional("is_admin").map(parse_bool).transpose()?.unwrap_or(false),
        }),
        "bookings" => {
            let start = parse_i64_expr(row.required("start")?)?;
            let end = parse_i64_expr(row.required("end")?)?;
            if start >= end {
                return Err(SqlError::InvalidSpan { start, end });
            }
            Ok(Command::InsertBooking {
                id: row.optional("id").map(parse_ulid_or_null).transpose()?.flatten(),
                room_id: parse_ulid_expr(row.required("room_id")?)?,
                start,
                end,
                purpose: row.optional("purpose").map(parse_string_expr).transpose()?.unwrap_or_default(),
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn insert_row(insert: &ast::Insert, table: &str) -> Result<Row, SqlError> {
    let table: &'static str = match table {
        "rooms" => "rooms",
        "users" => "users",
        "bookings" => "bookings",
        _ => return Err(SqlError::UnknownTable(table.to_string())),
    };
    let rows = extract_insert_rows(insert)?;
    if rows.len() != 1 {
        return Err(SqlError::Unsupported(format!("multi-row INSERT into {table}")));
    }
    let exprs = &rows[0];

    let columns: Vec<String> = if insert.columns.is_empty() {
        default_columns(table).iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if exprs.len() != columns.len() {
        return Err(SqlError::WrongArity(table, columns.len(), exprs.len()));
    }

    Ok(Row {
        table,
        values: columns.into_iter().zip(exprs.iter().cloned()).collect(),
    })
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(delete.selection.as_ref())?;

    match table.as_str() {
        "rooms" => Ok(Command::DeactivateRoom { id }),
        "users" => Ok(Command::DeactivateUser { id }),
        "bookings" => Ok(Command::DeleteBooking { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;

    match table.as_str() {
        "rooms" => Ok(Command::SelectRooms),
        "bookings" => {
            if select.selection.is_some() {
                let id = extract_where_id(select.selection.as_ref())?;
                return Ok(Command::SelectBooking { id });
            }
            let (limit, offset) = extract_limit_offset(query.limit_clause.as_ref())?;
            Ok(Command::SelectBookings { limit, offset })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn extract_limit_offset(clause: Option<&LimitClause>) -> Result<(Option<usize>, Option<usize>), SqlError> {
    match clause {
        None => Ok((None, None)),
        Some(LimitClause::LimitOffset { limit, offset, .. }) => {
            let limit = limit.as_ref().map(parse_usize).transpose()?;
            let offset = offset.as_ref().map(|o| parse_usize(&o.value)).transpose()?;
            Ok((limit, offset))
        }
        Some(LimitClause::OffsetCommaLimit { offset, limit }) => {
            Ok((Some(parse_usize(limit)?), Some(parse_usize(offset)?)))
        }
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
    let first = tables_with_joins
        .first()
        .ok_or_else(|| SqlError::Parse("DELETE without table".into()))?;
    table_factor_name(&first.relation)
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_rows(insert: &ast::Insert) -> Result<&[Vec<Expr>], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) if !values.rows.is_empty() => Ok(&values.rows),
        SetExpr::Values(_) => Err(SqlError::Parse("empty VALUES".into())),
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: Option<&Expr>) -> Result<Ulid, SqlError> {
    match selection {
        Some(Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        }) if expr_column_name(left).as_deref() == Some("id") => parse_ulid_expr(right),
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

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(other) => Err(SqlError::Parse(format!("expected string, got {other:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s) | Value::Number(s, _)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(other) => Err(SqlError::Parse(format!("expected string, got {other:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_ulid_expr(expr).map(Some),
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_i64_expr(expr)?);
    }
    match extract_value(expr) {
        Some(Value::Number(s, _) | Value::SingleQuotedString(s)) => s
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
        Some(other) => Err(SqlError::Parse(format!("expected number, got {other:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_usize(expr: &Expr) -> Result<usize, SqlError> {
    let v = parse_i64_expr(expr)?;
    usize::try_from(v).map_err(|_| SqlError::Parse(format!("{v} is not a valid row count")))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        Some(other) => Err(SqlError::Parse(format!("expected bool, got {other:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("{0}: missing column {1}")]
    MissingColumn(&'static str, &'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("booking must end after it starts: start {start}, end {end}")]
    InvalidSpan { start: Ms, end: Ms },
}
