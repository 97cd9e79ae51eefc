use chrono::{NaiveDate, NaiveTime, Weekday};
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::calendar::{OccurrenceFilter, RecurrenceRule, weekday_from_index};
use crate::model::*;

/// Parsed command from SQL input.
///
/// Values are positional, in the column order documented on each table.
/// The caller's identity is not part of the command; it comes from the
/// connection.
#[derive(Debug, PartialEq)]
pub enum Command {
    /// `accounts (id, role, name[, is_staff])`
    InsertAccount {
        account: Account,
    },
    /// `styles (id, name[, description][, image])`
    InsertStyle {
        style: DanceStyle,
    },
    UpdateStyle {
        id: Ulid,
        patch: StylePatch,
    },
    DeleteStyle {
        id: Ulid,
    },
    /// `trainers (id, user_id[, bio][, photo][, styles])`, styles as a
    /// comma-separated list of ULIDs.
    InsertTrainer {
        trainer: Trainer,
    },
    SetTrainerStyles {
        id: Ulid,
        styles: Vec<Ulid>,
    },
    /// `schedules (id, class_date, start_time, end_time, style_id,
    /// trainer_id, max_participants[, is_active])`
    InsertSchedule {
        entry: ScheduleEntry,
    },
    /// `recurring_schedules (day_of_week, start_date, end_date,
    /// start_time, end_time, style_id, trainer_id, max_participants[, until])`
    InsertRecurring {
        rule: RecurrenceRule,
        until: Option<NaiveDate>,
    },
    UpdateSchedule {
        id: Ulid,
        patch: SchedulePatch,
    },
    DeleteSchedule {
        id: Ulid,
    },
    /// `bookings (id, schedule_id)`
    InsertBooking {
        id: Ulid,
        schedule_id: Ulid,
    },
    CancelBooking {
        id: Ulid,
    },
    MarkBookings {
        schedule_id: Ulid,
        status: BookingStatus,
    },
    SweepMissed,
    SelectOccurrences {
        filter: OccurrenceFilter,
        from: NaiveDate,
        to: NaiveDate,
    },
    SelectSchedule {
        id: Ulid,
    },
    SelectRoster {
        schedule_id: Ulid,
    },
    SelectOwnBookings,
    SelectBookingStats,
    SelectStyles,
    SelectTrainers,
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
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

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "accounts" => {
            if values.len() < 3 {
                return Err(SqlError::WrongArity("accounts", 3, values.len()));
            }
            let role = parse_text(&values[1])?
                .parse::<Role>()
                .map_err(SqlError::Parse)?;
            let is_staff = match values.get(3) {
                Some(v) => parse_bool(v)?,
                None => false,
            };
            Ok(Command::InsertAccount {
                account: Account {
                    id: parse_ulid(&values[0])?,
                    role,
                    name: parse_text(&values[2])?,
                    is_staff,
                },
            })
        }
        "styles" => {
            if values.len() < 2 {
                return Err(SqlError::WrongArity("styles", 2, values.len()));
            }
            let description = match values.get(2) {
                Some(v) => parse_text_or_null(v)?.unwrap_or_default(),
                None => String::new(),
            };
            let image = match values.get(3) {
                Some(v) => parse_text_or_null(v)?,
                None => None,
            };
            Ok(Command::InsertStyle {
                style: DanceStyle {
                    id: parse_ulid(&values[0])?,
                    name: parse_text(&values[1])?,
                    description,
                    image,
                },
            })
        }
        "trainers" => {
            if values.len() < 2 {
                return Err(SqlError::WrongArity("trainers", 2, values.len()));
            }
            let bio = match values.get(2) {
                Some(v) => parse_text_or_null(v)?.unwrap_or_default(),
                None => String::new(),
            };
            let photo = match values.get(3) {
                Some(v) => parse_text_or_null(v)?,
                None => None,
            };
            let styles = match values.get(4) {
                Some(v) => parse_ulid_list(v)?,
                None => Vec::new(),
            };
            Ok(Command::InsertTrainer {
                trainer: Trainer {
                    id: parse_ulid(&values[0])?,
                    user_id: parse_ulid(&values[1])?,
                    bio,
                    photo,
                    styles,
                },
            })
        }
        "schedules" => {
            if values.len() < 7 {
                return Err(SqlError::WrongArity("schedules", 7, values.len()));
            }
            let is_active = match values.get(7) {
                Some(v) => parse_bool(v)?,
                None => true,
            };
            Ok(Command::InsertSchedule {
                entry: ScheduleEntry {
                    id: parse_ulid(&values[0])?,
                    class_date: parse_date(&values[1])?,
                    start_time: parse_time(&values[2])?,
                    end_time: parse_time(&values[3])?,
                    dance_style: parse_ulid(&values[4])?,
                    trainer: parse_ulid(&values[5])?,
                    max_participants: parse_u32(&values[6])?,
                    is_active,
                },
            })
        }
        "recurring_schedules" => {
            if values.len() < 8 {
                return Err(SqlError::WrongArity("recurring_schedules", 8, values.len()));
            }
            let until = match values.get(8) {
                Some(v) => parse_date_or_null(v)?,
                None => None,
            };
            Ok(Command::InsertRecurring {
                rule: RecurrenceRule {
                    day_of_week: parse_weekday(&values[0])?,
                    start_date: parse_date(&values[1])?,
                    end_date: parse_date_or_null(&values[2])?,
                    start_time: parse_time(&values[3])?,
                    end_time: parse_time(&values[4])?,
                    dance_style: parse_ulid(&values[5])?,
                    trainer: parse_ulid(&values[6])?,
                    max_participants: parse_u32(&values[7])?,
                },
                until,
            })
        }
        "bookings" => {
            if values.len() < 2 {
                return Err(SqlError::WrongArity("bookings", 2, values.len()));
            }
            Ok(Command::InsertBooking {
                id: parse_ulid(&values[0])?,
                schedule_id: parse_ulid(&values[1])?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    let mut sets = Vec::with_capacity(assignments.len());
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        }
        .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;
        sets.push((column, &assignment.value));
    }

    match table.as_str() {
        "styles" => {
            let id = extract_where_eq(selection, "id")?;
            let mut patch = StylePatch::default();
            for (column, value) in sets {
                match column.as_str() {
                    "name" => patch.name = Some(parse_text(value)?),
                    "description" => {
                        patch.description = Some(parse_text_or_null(value)?.unwrap_or_default())
                    }
                    "image" => patch.image = Some(parse_text_or_null(value)?),
                    _ => return Err(SqlError::UnknownColumn("styles", column)),
                }
            }
            Ok(Command::UpdateStyle { id, patch })
        }
        "schedules" => {
            let id = extract_where_eq(selection, "id")?;
            let mut patch = SchedulePatch::default();
            for (column, value) in sets {
                match column.as_str() {
                    "class_date" => patch.class_date = Some(parse_date(value)?),
                    "start_time" => patch.start_time = Some(parse_time(value)?),
                    "end_time" => patch.end_time = Some(parse_time(value)?),
                    "style_id" | "dance_style" => patch.dance_style = Some(parse_ulid(value)?),
                    "trainer_id" | "trainer" => patch.trainer = Some(parse_ulid(value)?),
                    "max_participants" => patch.max_participants = Some(parse_u32(value)?),
                    "is_active" => patch.is_active = Some(parse_bool(value)?),
                    _ => return Err(SqlError::UnknownColumn("schedules", column)),
                }
            }
            Ok(Command::UpdateSchedule { id, patch })
        }
        "trainers" => {
            let id = extract_where_eq(selection, "id")?;
            match sets.as_slice() {
                [(column, value)] if column == "styles" => Ok(Command::SetTrainerStyles {
                    id,
                    styles: parse_ulid_list(value)?,
                }),
                _ => Err(SqlError::Unsupported(
                    "only SET styles = '..' is supported on trainers".into(),
                )),
            }
        }
        "bookings" => {
            let status = match sets.as_slice() {
                [(column, value)] if column == "status" => parse_text(value)?
                    .parse::<BookingStatus>()
                    .map_err(SqlError::Parse)?,
                _ => {
                    return Err(SqlError::Unsupported(
                        "only SET status = '..' is supported on bookings".into(),
                    ));
                }
            };
            let filter = match selection {
                Some(expr) => Some(where_eq(expr)?),
                None => None,
            };
            match (status, filter) {
                (BookingStatus::Missed, None) => Ok(Command::SweepMissed),
                (BookingStatus::Attended | BookingStatus::Cancelled, Some((col, schedule_id)))
                    if col == "schedule_id" =>
                {
                    Ok(Command::MarkBookings {
                        schedule_id,
                        status,
                    })
                }
                (BookingStatus::Cancelled, Some((col, id))) if col == "id" => {
                    Ok(Command::CancelBooking { id })
                }
                (status, _) => Err(SqlError::Unsupported(format!(
                    "bookings cannot be set to {status} this way"
                ))),
            }
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_eq(&delete.selection, "id")?;

    match table.as_str() {
        "bookings" => Ok(Command::CancelBooking { id }),
        "schedules" => Ok(Command::DeleteSchedule { id }),
        "styles" => Ok(Command::DeleteStyle { id }),
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
        "occurrences" => {
            let mut filters = OccurrenceFilters::default();
            if let Some(selection) = &select.selection {
                filters.collect(selection)?;
            }
            Ok(Command::SelectOccurrences {
                filter: OccurrenceFilter {
                    dance_style: filters.style,
                    trainer: filters.trainer,
                },
                from: filters.from.ok_or(SqlError::MissingFilter("class_date >="))?,
                to: filters.to.ok_or(SqlError::MissingFilter("class_date <="))?,
            })
        }
        "schedules" => Ok(Command::SelectSchedule {
            id: extract_where_eq(&select.selection, "id")?,
        }),
        "bookings" => match &select.selection {
            None => Ok(Command::SelectOwnBookings),
            Some(_) => Ok(Command::SelectRoster {
                schedule_id: extract_where_eq(&select.selection, "schedule_id")?,
            }),
        },
        "booking_stats" => Ok(Command::SelectBookingStats),
        "styles" => Ok(Command::SelectStyles),
        "trainers" => Ok(Command::SelectTrainers),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

#[derive(Default)]
struct OccurrenceFilters {
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
    style: Option<Ulid>,
    trainer: Option<Ulid>,
}

impl OccurrenceFilters {
    fn collect(&mut self, expr: &Expr) -> Result<(), SqlError> {
        match expr {
            Expr::Nested(inner) => self.collect(inner)?,
            Expr::BinaryOp { left, op, right } => {
                let col = expr_column_name(left);
                match (op, col.as_deref()) {
                    (ast::BinaryOperator::And, _) => {
                        self.collect(left)?;
                        self.collect(right)?;
                    }
                    (ast::BinaryOperator::Eq, Some("class_date")) => {
                        let date = parse_date(right)?;
                        self.from = Some(date);
                        self.to = Some(date);
                    }
                    (ast::BinaryOperator::Eq, Some("style_id")) => {
                        self.style = Some(parse_ulid(right)?)
                    }
                    (ast::BinaryOperator::Eq, Some("trainer_id")) => {
                        self.trainer = Some(parse_ulid(right)?)
                    }
                    (ast::BinaryOperator::GtEq, Some("class_date")) => {
                        self.from = Some(parse_date(right)?)
                    }
                    (ast::BinaryOperator::LtEq, Some("class_date")) => {
                        self.to = Some(parse_date(right)?)
                    }
                    _ => return Err(SqlError::Unsupported(format!("filter: {expr}"))),
                }
            }
            Expr::Between {
                expr: inner,
                negated: false,
                low,
                high,
            } if expr_column_name(inner).as_deref() == Some("class_date") => {
                self.from = Some(parse_date(low)?);
                self.to = Some(parse_date(high)?);
            }
            _ => return Err(SqlError::Unsupported(format!("filter: {expr}"))),
        }
        Ok(())
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
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row VALUES".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

/// `column = value` with a ULID on the right.
fn where_eq(expr: &Expr) -> Result<(String, Ulid), SqlError> {
    match expr {
        Expr::Nested(inner) => where_eq(inner),
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter: {expr}")))?;
            Ok((col, parse_ulid(right)?))
        }
        _ => Err(SqlError::Unsupported(format!("filter: {expr}"))),
    }
}

fn extract_where_eq(selection: &Option<Expr>, column: &'static str) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter(column))?;
    match where_eq(sel) {
        Ok((col, id)) if col == column => Ok(id),
        Ok(_) => Err(SqlError::MissingFilter(column)),
        Err(e) => Err(e),
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

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

/// A quoted string, or a bare number rendered as text.
fn parse_text(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_text_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_text(expr).map(Some)
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_text(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
}

/// `'id1,id2'`; NULL or an empty string is the empty list.
fn parse_ulid_list(expr: &Expr) -> Result<Vec<Ulid>, SqlError> {
    let Some(s) = parse_text_or_null(expr)? else {
        return Ok(Vec::new());
    };
    s.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| Ulid::from_string(part).map_err(|e| SqlError::Parse(format!("bad ULID: {e}"))))
        .collect()
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_i64(expr)?);
    }
    match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => s
            .trim()
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad integer: {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
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
        Some(value) => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

/// `'YYYY-MM-DD'`
fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_text(expr)?;
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|e| SqlError::Parse(format!("bad date {s:?}: {e}")))
}

fn parse_date_or_null(expr: &Expr) -> Result<Option<NaiveDate>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_date(expr).map(Some)
}

/// `'HH:MM'` or `'HH:MM:SS'`
fn parse_time(expr: &Expr) -> Result<NaiveTime, SqlError> {
    let s = parse_text(expr)?;
    let s = s.trim();
    NaiveTime::parse_from_str(s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .map_err(|e| SqlError::Parse(format!("bad time {s:?}: {e}")))
}

/// `0` (Monday) through `6`, or a day name such as `'wed'`.
fn parse_weekday(expr: &Expr) -> Result<Weekday, SqlError> {
    let s = parse_text(expr)?;
    let s = s.trim();
    if let Ok(index) = s.parse::<u32>() {
        return weekday_from_index(index)
            .ok_or_else(|| SqlError::Parse(format!("day_of_week out of range: {index}")));
    }
    s.parse::<Weekday>()
        .map_err(|_| SqlError::Parse(format!("bad day_of_week: {s}")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(&'static str, String),
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
            SqlError::UnknownColumn(t, c) => write!(f, "{t}: unknown column {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected at least {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
