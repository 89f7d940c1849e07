use chrono::{DateTime, NaiveDate, NaiveTime, Timelike};
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::limits::MAX_BATCH_SIZE;
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertClinic {
        id: Ulid,
        name: Option<String>,
        timezone: Option<String>,
    },
    InsertOpeningHours {
        clinic_id: Ulid,
        intervals: Vec<OpeningHours>,
    },
    DeleteOpeningHours {
        clinic_id: Ulid,
        weekday: Option<u8>,
    },
    SelectOpeningHours {
        clinic_id: Ulid,
        weekday: Option<u8>,
    },
    InsertClosure {
        clinic_id: Ulid,
        date: NaiveDate,
    },
    DeleteClosure {
        clinic_id: Ulid,
        date: NaiveDate,
    },
    SelectClosures {
        clinic_id: Ulid,
    },
    InsertProfessional(Professional),
    SelectProfessionals {
        active_only: bool,
    },
    InsertPatient(Patient),
    InsertAppointmentType(AppointmentType),
    SelectSlots {
        clinic_id: Ulid,
        professional_id: Ulid,
        date: NaiveDate,
        duration: i64,
        granularity: Option<i64>,
    },
    InsertAppointment(BookingRequest),
    UpdateAppointmentStatus {
        id: Ulid,
        status: AppointmentStatus,
    },
    SelectAppointment {
        id: Ulid,
    },
    SelectAppointments {
        professional_id: Ulid,
        start: Ms,
        end: Ms,
        active_only: bool,
        clinic_id: Option<Ulid>,
    },
}

/// Parse a single statement. More than one statement is an error.
pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let mut commands = parse_batch(sql)?;
    if commands.len() > 1 {
        return Err(SqlError::Unsupported(format!(
            "{} statements where one was expected",
            commands.len()
        )));
    }
    Ok(commands.remove(0))
}

/// Parse every `;`-separated statement, in order. Fails as a whole if any
/// statement is rejected, so nothing runs from a half-understood batch.
pub fn parse_batch(sql: &str) -> Result<Vec<Command>, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }
    if stmts.len() > MAX_BATCH_SIZE {
        return Err(SqlError::Parse(format!("batch exceeds {MAX_BATCH_SIZE} statements")));
    }
    stmts
        .iter()
        .enumerate()
        .map(|(i, stmt)| {
            parse_statement(stmt).map_err(|e| match e {
                SqlError::Parse(msg) if stmts.len() > 1 => {
                    SqlError::Parse(format!("statement {}: {msg}", i + 1))
                }
                other => other,
            })
        })
        .collect()
}

fn parse_statement(stmt: &Statement) -> Result<Command, SqlError> {
    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(table, assignments, selection),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

const CLINIC_COLUMNS: &[&str] = &["id", "name", "timezone"];
const HOURS_COLUMNS: &[&str] = &["clinic_id", "weekday", "open", "close"];
const CLOSURE_COLUMNS: &[&str] = &["clinic_id", "date"];
const PROFESSIONAL_COLUMNS: &[&str] = &["id", "name", "active"];
const PATIENT_COLUMNS: &[&str] = &["id", "name"];
const APPOINTMENT_TYPE_COLUMNS: &[&str] = &["id", "name", "color"];
const APPOINTMENT_COLUMNS: &[&str] = &[
    "clinic_id",
    "professional_id",
    "patient_id",
    "type_id",
    "start",
    "duration",
];

/// Canonical table name plus the columns assumed when an INSERT names none,
/// in VALUES order.
fn insert_schema(table: &str) -> Option<(&'static str, &'static [&'static str])> {
    Some(match table {
        "clinics" => ("clinics", CLINIC_COLUMNS),
        "opening_hours" => ("opening_hours", HOURS_COLUMNS),
        "closures" => ("closures", CLOSURE_COLUMNS),
        "professionals" => ("professionals", PROFESSIONAL_COLUMNS),
        "patients" => ("patients", PATIENT_COLUMNS),
        "appointment_types" => ("appointment_types", APPOINTMENT_TYPE_COLUMNS),
        "appointments" => ("appointments", APPOINTMENT_COLUMNS),
        _ => return None,
    })
}

/// One VALUES row keyed by column name.
struct Row<'a> {
    table: &'static str,
    fields: Vec<(String, &'a Expr)>,
}

impl<'a> Row<'a> {
    fn get(&self, column: &str) -> Option<&'a Expr> {
        self.fields
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, expr)| *expr)
    }

    fn required(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column)
            .ok_or(SqlError::MissingColumn(self.table, column))
    }

    /// Missing or NULL both read as absent.
    fn optional(&self, column: &str) -> Option<&'a Expr> {
        self.get(column).filter(|e| !is_null(e))
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let name = insert_table_name(insert)?;
    let Some((table, defaults)) = insert_schema(&name) else {
        return Err(SqlError::UnknownTable(name));
    };
    let rows = extract_all_insert_rows(insert)?;
    if rows.len() > MAX_BATCH_SIZE {
        return Err(SqlError::Parse(format!("batch exceeds {MAX_BATCH_SIZE} rows")));
    }

    let columns: Vec<String> = if insert.columns.is_empty() {
        defaults.iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    let mut keyed = Vec::with_capacity(rows.len());
    for values in rows {
        if values.len() != columns.len() {
            return Err(SqlError::WrongArity(table, columns.len(), values.len()));
        }
        keyed.push(Row {
            table,
            fields: columns.iter().cloned().zip(values.iter()).collect(),
        });
    }

    if table != "opening_hours" && keyed.len() != 1 {
        return Err(SqlError::Unsupported(format!(
            "multi-row INSERT into {table}"
        )));
    }
    let row = &keyed[0];

    match table {
        "clinics" => Ok(Command::InsertClinic {
            id: parse_ulid_expr(row.required("id")?)?,
            name: row.optional("name").map(parse_string_expr).transpose()?,
            timezone: row.optional("timezone").map(parse_string_expr).transpose()?,
        }),
        "opening_hours" => {
            let clinic_id = parse_ulid_expr(row.required("clinic_id")?)?;
            let mut intervals = Vec::with_capacity(keyed.len());
            for (i, r) in keyed.iter().enumerate() {
                let row_err = |e: SqlError| SqlError::Parse(format!("row {i}: {e}"));
                if parse_ulid_expr(r.required("clinic_id")?).map_err(row_err)? != clinic_id {
                    return Err(SqlError::Unsupported(
                        "opening_hours rows for more than one clinic".into(),
                    ));
                }
                intervals.push(OpeningHours {
                    weekday: parse_weekday_expr(r.required("weekday")?).map_err(row_err)?,
                    open: parse_minute_of_day_expr(r.required("open")?).map_err(row_err)?,
                    close: parse_minute_of_day_expr(r.required("close")?).map_err(row_err)?,
                });
            }
            Ok(Command::InsertOpeningHours {
                clinic_id,
                intervals,
            })
        }
        "closures" => Ok(Command::InsertClosure {
            clinic_id: parse_ulid_expr(row.required("clinic_id")?)?,
            date: parse_date_expr(row.required("date")?)?,
        }),
        "professionals" => Ok(Command::InsertProfessional(Professional {
            id: parse_ulid_expr(row.required("id")?)?,
            name: row.optional("name").map(parse_string_expr).transpose()?,
            active: row.optional("active").map(parse_bool).transpose()?.unwrap_or(true),
        })),
        "patients" => Ok(Command::InsertPatient(Patient {
            id: parse_ulid_expr(row.required("id")?)?,
            name: row.optional("name").map(parse_string_expr).transpose()?,
        })),
        "appointment_types" => Ok(Command::InsertAppointmentType(AppointmentType {
            id: parse_ulid_expr(row.required("id")?)?,
            name: row.optional("name").map(parse_string_expr).transpose()?,
            color: row.optional("color").map(parse_string_expr).transpose()?,
        })),
        "appointments" => Ok(Command::InsertAppointment(BookingRequest {
            id: row.optional("id").map(parse_ulid_expr).transpose()?,
            clinic_id: parse_ulid_expr(row.required("clinic_id")?)?,
            professional_id: parse_ulid_expr(row.required("professional_id")?)?,
            patient_id: parse_ulid_expr(row.required("patient_id")?)?,
            type_id: parse_ulid_expr(row.required("type_id")?)?,
            start: parse_timestamp_expr(row.required("start")?)?,
            duration_minutes: parse_i64_expr(row.required("duration")?)?,
        })),
        _ => Err(SqlError::UnknownTable(table.to_string())),
    }
}

// ── DELETE / UPDATE ───────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = Filters::from_selection(delete.selection.as_ref())?;

    match table.as_str() {
        "opening_hours" => Ok(Command::DeleteOpeningHours {
            clinic_id: parse_ulid_expr(filters.eq("clinic_id")?)?,
            weekday: filters.opt_eq("weekday").map(parse_weekday_expr).transpose()?,
        }),
        "closures" => Ok(Command::DeleteClosure {
            clinic_id: parse_ulid_expr(filters.eq("clinic_id")?)?,
            date: parse_date_expr(filters.eq("date")?)?,
        }),
        "appointments" => Err(SqlError::Unsupported(
            "appointments are never deleted; UPDATE status = 'cancelled' instead".into(),
        )),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(&table.relation)?;
    if table != "appointments" {
        return Err(SqlError::UnknownTable(table));
    }
    let id = extract_where_id(selection)?;

    let mut status = None;
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        };
        match column.as_deref() {
            Some("status") => {
                let raw = parse_string_expr(&assignment.value)?;
                status = Some(
                    AppointmentStatus::parse(&raw)
                        .ok_or_else(|| SqlError::Parse(format!("unknown status: {raw}")))?,
                );
            }
            Some(other) => {
                return Err(SqlError::Unsupported(format!(
                    "updating appointments.{other}"
                )));
            }
            None => return Err(SqlError::Parse("unsupported assignment target".into())),
        }
    }
    Ok(Command::UpdateAppointmentStatus {
        id,
        status: status.ok_or(SqlError::MissingColumn("appointments", "status"))?,
    })
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
    let filters = Filters::from_selection(select.selection.as_ref())?;

    match table.as_str() {
        "slots" => Ok(Command::SelectSlots {
            clinic_id: parse_ulid_expr(filters.eq("clinic_id")?)?,
            professional_id: parse_ulid_expr(filters.eq("professional_id")?)?,
            date: parse_date_expr(filters.eq("date")?)?,
            duration: parse_i64_expr(filters.eq("duration")?)?,
            granularity: filters.opt_eq("granularity").map(parse_i64_expr).transpose()?,
        }),
        "appointments" => {
            if let Some(id) = filters.opt_eq("id") {
                return Ok(Command::SelectAppointment {
                    id: parse_ulid_expr(id)?,
                });
            }
            Ok(Command::SelectAppointments {
                professional_id: parse_ulid_expr(filters.eq("professional_id")?)?,
                start: parse_timestamp_expr(filters.lower("start")?)?,
                end: parse_timestamp_expr(filters.upper("end")?)?,
                active_only: filters.opt_eq("active").map(parse_bool).transpose()?.unwrap_or(false),
                clinic_id: filters.opt_eq("clinic_id").map(parse_ulid_expr).transpose()?,
            })
        }
        "opening_hours" => Ok(Command::SelectOpeningHours {
            clinic_id: parse_ulid_expr(filters.eq("clinic_id")?)?,
            weekday: filters.opt_eq("weekday").map(parse_weekday_expr).transpose()?,
        }),
        "closures" => Ok(Command::SelectClosures {
            clinic_id: parse_ulid_expr(filters.eq("clinic_id")?)?,
        }),
        "professionals" => Ok(Command::SelectProfessionals {
            active_only: filters.opt_eq("active").map(parse_bool).transpose()?.unwrap_or(false),
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Cmp {
    Eq,
    Lower,
    Upper,
}

/// Conjunction of `column <op> value` terms from a WHERE clause.
struct Filters<'a> {
    terms: Vec<(String, Cmp, &'a Expr)>,
}

impl<'a> Filters<'a> {
    fn from_selection(selection: Option<&'a Expr>) -> Result<Self, SqlError> {
        let mut terms = Vec::new();
        if let Some(expr) = selection {
            collect_terms(expr, &mut terms)?;
        }
        Ok(Self { terms })
    }

    fn find(&self, column: &str, cmp: Cmp) -> Option<&'a Expr> {
        self.terms
            .iter()
            .find(|(c, op, _)| c == column && *op == cmp)
            .map(|(_, _, e)| *e)
    }

    fn eq(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.find(column, Cmp::Eq)
            .ok_or(SqlError::MissingFilter(column))
    }

    fn opt_eq(&self, column: &str) -> Option<&'a Expr> {
        self.find(column, Cmp::Eq)
    }

    fn lower(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.find(column, Cmp::Lower)
            .ok_or(SqlError::MissingFilter(column))
    }

    fn upper(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.find(column, Cmp::Upper)
            .ok_or(SqlError::MissingFilter(column))
    }
}

fn collect_terms<'a>(expr: &'a Expr, terms: &mut Vec<(String, Cmp, &'a Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_terms(inner, terms),
        Expr::BinaryOp { left, op, right } => {
            let cmp = match op {
                ast::BinaryOperator::And => {
                    collect_terms(left, terms)?;
                    return collect_terms(right, terms);
                }
                ast::BinaryOperator::Eq => Cmp::Eq,
                ast::BinaryOperator::GtEq | ast::BinaryOperator::Gt => Cmp::Lower,
                ast::BinaryOperator::LtEq | ast::BinaryOperator::Lt => Cmp::Upper,
                other => return Err(SqlError::Unsupported(format!("operator {other}"))),
            };
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Parse(format!("expected column, got {left}")))?;
            terms.push((column, cmp, right.as_ref()));
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
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

fn extract_all_insert_rows(insert: &ast::Insert) -> Result<&[Vec<Expr>], SqlError> {
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

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let filters = Filters::from_selection(selection.as_ref())?;
    parse_ulid_expr(filters.eq("id")?)
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
        Expr::Cast { expr, .. } | Expr::Nested(expr) => extract_value(expr),
        _ => None,
    }
}

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s) | Value::Number(s, _)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
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
            .trim()
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected number, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_weekday_expr(expr: &Expr) -> Result<u8, SqlError> {
    let v = parse_i64_expr(expr)?;
    u8::try_from(v).map_err(|_| SqlError::Parse(format!("weekday {v} out of range")))
}

/// `'HH:MM'` (with `'24:00'` meaning end of day) or a plain minute count.
fn parse_minute_of_day_expr(expr: &Expr) -> Result<u16, SqlError> {
    if let Some(Value::SingleQuotedString(s)) = extract_value(expr)
        && s.contains(':')
    {
        return parse_clock(s);
    }
    let v = parse_i64_expr(expr)?;
    u16::try_from(v).map_err(|_| SqlError::Parse(format!("minute {v} out of range")))
}

fn parse_clock(s: &str) -> Result<u16, SqlError> {
    let s = s.trim();
    if s == "24:00" || s == "24:00:00" {
        return Ok(MINUTES_PER_DAY);
    }
    let time = NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .map_err(|e| SqlError::Parse(format!("bad time {s:?}: {e}")))?;
    // Both fields are bounded by chrono, so the product fits in u16.
    Ok((time.hour() * 60 + time.minute()) as u16)
}

fn parse_date_expr(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string_expr(expr)?;
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|e| SqlError::Parse(format!("bad date {s:?}: {e}")))
}

/// Unix milliseconds, or an RFC 3339 timestamp with offset.
fn parse_timestamp_expr(expr: &Expr) -> Result<Ms, SqlError> {
    if let Some(Value::SingleQuotedString(s)) = extract_value(expr)
        && s.parse::<i64>().is_err()
    {
        return DateTime::parse_from_rfc3339(s.trim())
            .map(|dt| dt.timestamp_millis())
            .map_err(|e| SqlError::Parse(format!("bad timestamp {s:?}: {e}")));
    }
    parse_i64_expr(expr)
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
        Some(value) => Err(SqlError::Parse(format!("expected bool, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
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
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("{0}: missing column {1}")]
    MissingColumn(&'static str, &'static str),
}
