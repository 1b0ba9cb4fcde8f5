use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertRoom {
        id: Ulid,
        number: String,
    },
    DeleteRoom {
        id: Ulid,
    },
    InsertClassBlock {
        id: Ulid,
        room_id: Ulid,
        day: DayOfWeek,
        start_min: u16,
        end_min: u16,
        subject: String,
        semester: String,
    },
    DeleteClassBlock {
        id: Ulid,
    },
    InsertReservation {
        id: Ulid,
        room_id: Ulid,
        start: Ms,
        end: Ms,
    },
    DeleteReservation {
        id: Ulid,
    },
    SelectRooms,
    SelectSchedule {
        room_id: Ulid,
    },
    SelectMyReservations,
    SelectRoomDay {
        room_id: Ulid,
        date: Ms,
    },
    SelectAvailability {
        room_id: Ulid,
        start: Ms,
        end: Ms,
        min_duration: Option<Ms>,
    },
    SelectOverrides,
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "rooms" => {
            if values.len() < 2 {
                return Err(SqlError::WrongArity("rooms", 2, values.len()));
            }
            Ok(Command::InsertRoom {
                id: parse_ulid(&values[0])?,
                number: parse_string(&values[1])?,
            })
        }
        "schedule" => {
            if values.len() < 7 {
                return Err(SqlError::WrongArity("schedule", 7, values.len()));
            }
            Ok(Command::InsertClassBlock {
                id: parse_ulid(&values[0])?,
                room_id: parse_ulid(&values[1])?,
                day: parse_day(&values[2])?,
                start_min: parse_u16(&values[3])?,
                end_min: parse_u16(&values[4])?,
                subject: parse_string(&values[5])?,
                semester: parse_string(&values[6])?,
            })
        }
        "reservations" => {
            if values.len() < 4 {
                return Err(SqlError::WrongArity("reservations", 4, values.len()));
            }
            Ok(Command::InsertReservation {
                id: parse_ulid(&values[0])?,
                room_id: parse_ulid(&values[1])?,
                start: parse_i64(&values[2])?,
                end: parse_i64(&values[3])?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "rooms" => Ok(Command::DeleteRoom { id }),
        "schedule" => Ok(Command::DeleteClassBlock { id }),
        "reservations" => Ok(Command::DeleteReservation { id }),
        _ => Err(SqlError::UnknownTable(table)),
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

    match table.as_str() {
        "rooms" => Ok(Command::SelectRooms),
        "my_reservations" => Ok(Command::SelectMyReservations),
        "overrides" => Ok(Command::SelectOverrides),
        "schedule" => {
            let mut filters = Filters::default();
            if let Some(selection) = &select.selection {
                extract_filters(selection, &mut filters)?;
            }
            Ok(Command::SelectSchedule {
                room_id: filters.room_id.ok_or(SqlError::MissingFilter("room_id"))?,
            })
        }
        "room_day" => {
            let mut filters = Filters::default();
            if let Some(selection) = &select.selection {
                extract_filters(selection, &mut filters)?;
            }
            Ok(Command::SelectRoomDay {
                room_id: filters.room_id.ok_or(SqlError::MissingFilter("room_id"))?,
                date: filters.date.ok_or(SqlError::MissingFilter("date"))?,
            })
        }
        "availability" => {
            let mut filters = Filters::default();
            if let Some(selection) = &select.selection {
                extract_filters(selection, &mut filters)?;
            }
            Ok(Command::SelectAvailability {
                room_id: filters.room_id.ok_or(SqlError::MissingFilter("room_id"))?,
                start: filters.start.ok_or(SqlError::MissingFilter("start"))?,
                end: filters.end.ok_or(SqlError::MissingFilter("end"))?,
                min_duration: filters.min_duration,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// WHERE-clause filters shared by the SELECT surfaces.
#[derive(Default)]
struct Filters {
    room_id: Option<Ulid>,
    date: Option<Ms>,
    start: Option<Ms>,
    end: Option<Ms>,
    min_duration: Option<Ms>,
}

fn extract_filters(expr: &Expr, filters: &mut Filters) -> Result<(), SqlError> {
    if let Expr::BinaryOp { left, op, right } = expr {
        match op {
            ast::BinaryOperator::And => {
                extract_filters(left, filters)?;
                extract_filters(right, filters)?;
            }
            ast::BinaryOperator::Eq => match expr_column_name(left).as_deref() {
                Some("room_id") => filters.room_id = Some(parse_ulid_expr(right)?),
                Some("date") => filters.date = Some(parse_i64_expr(right)?),
                Some("min_duration") => filters.min_duration = Some(parse_i64_expr(right)?),
                _ => {}
            },
            ast::BinaryOperator::GtEq => {
                if expr_column_name(left).as_deref() == Some("start") {
                    filters.start = Some(parse_i64_expr(right)?);
                }
            }
            ast::BinaryOperator::LtEq => {
                if expr_column_name(left).as_deref() == Some("end") {
                    filters.end = Some(parse_i64_expr(right)?);
                }
            }
            _ => {}
        }
    }
    Ok(())
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
            if values.rows.len() > 1 {
                return Err(SqlError::Unsupported("multi-row INSERT".into()));
            }
            Ok(values.rows[0].clone())
        }
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
        } => {
            if expr_column_name(left).as_deref() == Some("id") {
                parse_ulid_expr(right)
            } else {
                Err(SqlError::MissingFilter("id"))
            }
        }
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

fn parse_u16(expr: &Expr) -> Result<u16, SqlError> {
    let v = parse_i64_expr(expr)?;
    u16::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u16 range")))
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

fn parse_day(expr: &Expr) -> Result<DayOfWeek, SqlError> {
    let s = parse_string(expr)?;
    DayOfWeek::parse(&s.to_lowercase()).ok_or_else(|| SqlError::Parse(format!("bad day: {s}")))
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
