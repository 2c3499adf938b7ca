use std::collections::{BTreeSet, HashMap};

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::Deserialize;
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::engine::JoinRequest;
use crate::gateway::{ClientInfo, ProposeRequest, SlotSelection};
use crate::model::*;

/// Walk-in queue actions expressed as `UPDATE waitlist SET status = ..`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitlistAction {
    Notify,
    Seat {
        staff_id: Ulid,
        appointment_id: Option<Ulid>,
        service_ids: Option<Vec<Ulid>>,
    },
    Leave,
    NoShow,
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    UpsertLocation {
        id: Ulid,
        name: String,
        timezone: String,
    },
    UpsertService {
        service: Service,
    },
    UpsertStaff {
        staff: StaffMember,
    },
    InsertTimeOff {
        staff_id: Ulid,
        time_off: TimeOff,
    },
    DeleteTimeOff {
        id: Ulid,
    },
    SelectSlots {
        request: ProposeRequest,
    },
    ConfirmAppointment {
        selection: SlotSelection,
        client: ClientInfo,
    },
    MoveAppointment {
        id: Ulid,
        start: Ms,
        staff_id: Option<Ulid>,
    },
    TransitionAppointment {
        id: Ulid,
        event: StatusEvent,
    },
    SelectAppointments {
        staff_id: Ulid,
        date: NaiveDate,
    },
    SelectAppointment {
        id: Ulid,
    },
    JoinWaitlist {
        request: JoinRequest,
    },
    UpdateWaitlist {
        id: Ulid,
        action: WaitlistAction,
    },
    ReorderWaitlist {
        id: Ulid,
        position: u32,
    },
    SelectWaitlist {
        location_id: Ulid,
    },
    SelectWaitlistEntry {
        id: Ulid,
    },
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
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(table, assignments, selection),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── Column access ─────────────────────────────────────────────

/// Named values of one INSERT row, one UPDATE's SET list, or a WHERE clause.
struct Fields<'a> {
    table: &'static str,
    values: HashMap<String, &'a Expr>,
}

impl<'a> Fields<'a> {
    fn new(table: &'static str) -> Self {
        Self {
            table,
            values: HashMap::new(),
        }
    }

    /// Present and not NULL.
    fn get(&self, col: &str) -> Option<&'a Expr> {
        self.values.get(col).copied().filter(|e| !is_null(e))
    }

    fn req(&self, col: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(col).ok_or(SqlError::MissingColumn(self.table, col))
    }

    fn ulid(&self, col: &'static str) -> Result<Ulid, SqlError> {
        parse_ulid_expr(self.req(col)?)
    }

    fn opt_ulid(&self, col: &str) -> Result<Option<Ulid>, SqlError> {
        self.get(col).map(parse_ulid_expr).transpose()
    }

    fn string(&self, col: &'static str) -> Result<String, SqlError> {
        parse_string_expr(self.req(col)?)
    }

    fn opt_string(&self, col: &str) -> Result<Option<String>, SqlError> {
        self.get(col).map(parse_string_expr).transpose()
    }

    fn u32(&self, col: &'static str) -> Result<u32, SqlError> {
        parse_u32(self.req(col)?)
    }

    fn opt_u32(&self, col: &str) -> Result<Option<u32>, SqlError> {
        self.get(col).map(parse_u32).transpose()
    }

    fn ulid_list(&self, col: &'static str) -> Result<Vec<Ulid>, SqlError> {
        parse_ulid_list(&self.string(col)?)
    }

    fn date(&self, col: &'static str) -> Result<NaiveDate, SqlError> {
        let s = self.string(col)?;
        NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").map_err(|e| SqlError::Parse(format!("bad date {s:?}: {e}")))
    }
}

/// Pair an INSERT's first row with its column list, or with the table's
/// default column order when the statement names none.
fn insert_fields<'a>(
    insert: &ast::Insert,
    row: &'a [Expr],
    table: &'static str,
    default_columns: &[&str],
) -> Result<Fields<'a>, SqlError> {
    let columns: Vec<String> = if insert.columns.is_empty() {
        default_columns.iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if row.len() > columns.len() || (!insert.columns.is_empty() && row.len() != columns.len()) {
        return Err(SqlError::WrongArity(table, columns.len(), row.len()));
    }
    let mut fields = Fields::new(table);
    for (col, expr) in columns.into_iter().zip(row) {
        fields.values.insert(col, expr);
    }
    Ok(fields)
}

/// `a = 1 AND b = 2 ...` into named values. Other predicates are ignored.
fn where_fields<'a>(table: &'static str, selection: &'a Option<Expr>) -> Fields<'a> {
    let mut fields = Fields::new(table);
    if let Some(expr) = selection {
        collect_eq_filters(expr, &mut fields.values);
    }
    fields
}

fn collect_eq_filters<'a>(expr: &'a Expr, out: &mut HashMap<String, &'a Expr>) {
    match expr {
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                collect_eq_filters(left, out);
                collect_eq_filters(right, out);
            }
            ast::BinaryOperator::Eq => {
                if let Some(col) = expr_column_name(left) {
                    out.insert(col, right);
                }
            }
            _ => {}
        },
        Expr::Nested(inner) => collect_eq_filters(inner, out),
        _ => {}
    }
}

// ── Statements ────────────────────────────────────────────────

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let row = extract_insert_values(insert)?;

    match table.as_str() {
        "locations" => {
            let f = insert_fields(insert, &row, "locations", &["id", "name", "timezone"])?;
            Ok(Command::UpsertLocation {
                id: f.ulid("id")?,
                name: f.string("name")?,
                timezone: f.string("timezone")?,
            })
        }
        "services" => {
            let f = insert_fields(
                insert,
                &row,
                "services",
                &["id", "name", "category", "duration", "buffer_before", "buffer_after"],
            )?;
            Ok(Command::UpsertService {
                service: Service {
                    id: f.ulid("id")?,
                    name: f.string("name")?,
                    category: f.string("category")?,
                    duration_min: f.u32("duration")?,
                    buffer_before_min: f.opt_u32("buffer_before")?.unwrap_or(0),
                    buffer_after_min: f.opt_u32("buffer_after")?.unwrap_or(0),
                },
            })
        }
        "staff" => {
            let f = insert_fields(
                insert,
                &row,
                "staff",
                &["id", "location_id", "name", "categories", "schedule", "takes_walk_ins"],
            )?;
            let categories: BTreeSet<String> = f
                .string("categories")?
                .split(',')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string)
                .collect();
            let week = match f.opt_string("schedule")? {
                Some(json) => parse_schedule(&json)?,
                None => WeekSchedule::closed(),
            };
            let takes_walk_ins = match f.get("takes_walk_ins") {
                Some(e) => parse_bool(e)?,
                None => true,
            };
            Ok(Command::UpsertStaff {
                staff: StaffMember {
                    id: f.ulid("id")?,
                    location_id: f.ulid("location_id")?,
                    name: f.string("name")?,
                    categories,
                    week,
                    time_off: Vec::new(),
                    takes_walk_ins,
                },
            })
        }
        "time_off" => {
            let f = insert_fields(insert, &row, "time_off", &["id", "staff_id", "start", "end", "reason"])?;
            Ok(Command::InsertTimeOff {
                staff_id: f.ulid("staff_id")?,
                time_off: TimeOff {
                    id: f.ulid("id")?,
                    start: parse_local_datetime(&f.string("start")?)?,
                    end: parse_local_datetime(&f.string("end")?)?,
                    reason: f.opt_string("reason")?,
                },
            })
        }
        "appointments" => {
            let f = insert_fields(
                insert,
                &row,
                "appointments",
                &["id", "staff_id", "client", "service_ids", "start", "channel", "external_call_id"],
            )?;
            let channel = match f.opt_string("channel")? {
                Some(s) => Channel::parse(&s).ok_or_else(|| SqlError::Parse(format!("unknown channel: {s}")))?,
                None => Channel::Web,
            };
            Ok(Command::ConfirmAppointment {
                selection: SlotSelection {
                    appointment_id: f.ulid("id")?,
                    staff_id: f.ulid("staff_id")?,
                    service_ids: f.ulid_list("service_ids")?,
                    start: parse_i64_expr(f.req("start")?)?,
                },
                client: ClientInfo {
                    client: ClientRef::parse(&f.string("client")?),
                    channel,
                    external_call_id: f.opt_string("external_call_id")?,
                },
            })
        }
        "waitlist" => {
            let f = insert_fields(
                insert,
                &row,
                "waitlist",
                &["id", "location_id", "name", "phone", "notes", "service_ids", "estimated_duration"],
            )?;
            let service_ids = match f.opt_string("service_ids")? {
                Some(s) => parse_ulid_list(&s)?,
                None => Vec::new(),
            };
            Ok(Command::JoinWaitlist {
                request: JoinRequest {
                    id: f.ulid("id")?,
                    location_id: f.ulid("location_id")?,
                    client: ClientRef::Contact {
                        name: f.opt_string("name")?,
                        phone: f.opt_string("phone")?,
                    },
                    notes: f.opt_string("notes")?,
                    service_ids,
                    estimated_duration_min: f.opt_u32("estimated_duration")?,
                },
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "time_off" => Ok(Command::DeleteTimeOff { id }),
        "appointments" => Err(SqlError::Unsupported(
            "appointments are never deleted; set status = 'cancelled'".into(),
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
    let id = extract_where_id(selection)?;
    let mut set = Fields::new("update");
    for assignment in assignments {
        let AssignmentTarget::ColumnName(name) = &assignment.target else {
            return Err(SqlError::Unsupported("tuple assignment".into()));
        };
        let col = object_name_last(name).ok_or_else(|| SqlError::Parse("empty column name".into()))?;
        set.values.insert(col, &assignment.value);
    }

    match table.as_str() {
        "appointments" => {
            if let Some(status) = set.opt_string("status")? {
                if set.values.len() > 1 {
                    return Err(SqlError::Unsupported("status cannot be combined with other columns".into()));
                }
                let event =
                    StatusEvent::parse(&status).ok_or_else(|| SqlError::Parse(format!("unknown status: {status}")))?;
                return Ok(Command::TransitionAppointment { id, event });
            }
            Ok(Command::MoveAppointment {
                id,
                start: parse_i64_expr(set.req("start").map_err(|_| SqlError::MissingColumn("appointments", "start"))?)?,
                staff_id: set.opt_ulid("staff_id")?,
            })
        }
        "waitlist" => {
            if let Some(position) = set.opt_u32("position")? {
                return Ok(Command::ReorderWaitlist { id, position });
            }
            let status = set
                .opt_string("status")?
                .ok_or(SqlError::MissingColumn("waitlist", "status"))?;
            let action = match status.to_ascii_lowercase().as_str() {
                "notified" | "notify" => WaitlistAction::Notify,
                "seated" | "seat" => WaitlistAction::Seat {
                    staff_id: set
                        .opt_ulid("staff_id")?
                        .ok_or(SqlError::MissingColumn("waitlist", "staff_id"))?,
                    appointment_id: set.opt_ulid("appointment_id")?,
                    service_ids: set
                        .opt_string("service_ids")?
                        .map(|s| parse_ulid_list(&s))
                        .transpose()?,
                },
                "left" | "leave" => WaitlistAction::Leave,
                "no_show" => WaitlistAction::NoShow,
                other => return Err(SqlError::Parse(format!("unknown waitlist status: {other}"))),
            };
            Ok(Command::UpdateWaitlist { id, action })
        }
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
        "slots" => {
            let f = where_fields("slots", &select.selection);
            Ok(Command::SelectSlots {
                request: ProposeRequest {
                    location_id: f.ulid("location_id")?,
                    service_ids: f.ulid_list("service_ids")?,
                    date: f.date("date")?,
                    staff_id: f.opt_ulid("staff_id")?,
                    granularity_min: f.opt_u32("granularity")?,
                },
            })
        }
        "appointments" => {
            let f = where_fields("appointments", &select.selection);
            if let Some(id) = f.opt_ulid("id")? {
                return Ok(Command::SelectAppointment { id });
            }
            Ok(Command::SelectAppointments {
                staff_id: f
                    .ulid("staff_id")
                    .map_err(|_| SqlError::MissingFilter("staff_id"))?,
                date: f.date("date").map_err(|e| match e {
                    SqlError::MissingColumn(..) => SqlError::MissingFilter("date"),
                    other => other,
                })?,
            })
        }
        "waitlist" => {
            let f = where_fields("waitlist", &select.selection);
            if let Some(id) = f.opt_ulid("id")? {
                return Ok(Command::SelectWaitlistEntry { id });
            }
            Ok(Command::SelectWaitlist {
                location_id: f
                    .opt_ulid("location_id")?
                    .ok_or(SqlError::MissingFilter("location_id"))?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── Staff schedule documents ──────────────────────────────────

#[derive(Deserialize)]
struct DayDoc {
    start: String,
    end: String,
    #[serde(default)]
    breaks: Vec<BreakDoc>,
}

#[derive(Deserialize)]
struct BreakDoc {
    start: String,
    end: String,
}

/// `{"mon": {"start": "09:00", "end": "17:00", "breaks": [{"start": "12:00", "end": "12:30"}]}, ...}`.
/// Weekdays not named are days off.
pub fn parse_schedule(json: &str) -> Result<WeekSchedule, SqlError> {
    let doc: HashMap<String, DayDoc> =
        serde_json::from_str(json).map_err(|e| SqlError::Parse(format!("bad schedule: {e}")))?;
    let mut week = WeekSchedule::closed();
    for (key, day) in doc {
        let weekday: chrono::Weekday = key
            .parse()
            .map_err(|_| SqlError::Parse(format!("bad weekday in schedule: {key}")))?;
        let mut template = DaySchedule::working(parse_time(&day.start)?, parse_time(&day.end)?);
        for b in day.breaks {
            template = template.with_break(parse_time(&b.start)?, parse_time(&b.end)?);
        }
        week.days[weekday.num_days_from_monday() as usize] = template;
    }
    Ok(week)
}

fn parse_time(s: &str) -> Result<NaiveTime, SqlError> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s.trim(), "%H:%M:%S"))
        .map_err(|_| SqlError::Parse(format!("bad time: {s:?}")))
}

/// `YYYY-MM-DD HH:MM[:SS]`, `YYYY-MM-DDTHH:MM[:SS]` or a bare date (midnight).
fn parse_local_datetime(s: &str) -> Result<NaiveDateTime, SqlError> {
    let s = s.trim();
    for fmt in ["%Y-%m-%d %H:%M", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(dt);
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map(|d| d.and_time(NaiveTime::MIN))
        .map_err(|_| SqlError::Parse(format!("bad local datetime: {s:?}")))
}

fn parse_ulid_list(s: &str) -> Result<Vec<Ulid>, SqlError> {
    s.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| Ulid::from_string(part).map_err(|e| SqlError::Parse(format!("bad ULID {part:?}: {e}"))))
        .collect()
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

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
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

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::DoubleQuotedString(s)) => Ok(s.clone()),
        Some(Value::Number(s, _)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
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

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Boolean(b) => Ok(*b),
            Value::SingleQuotedString(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "1" => Ok(true),
                "false" | "f" | "0" => Ok(false),
                _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
            },
            Value::Number(n, _) => Ok(n != "0"),
            _ => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Error, PartialEq)]
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
}

#[cfg(test)]
mod tests {
    use chrono::Weekday;

    use super::*;

    const A: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
    const B: &str = "01BX5ZZKBKACTAV9WEVGEMMVRZ";

    fn ulid(s: &str) -> Ulid {
        Ulid::from_string(s).unwrap()
    }

    #[test]
    fn parse_insert_location() {
        let sql = format!("INSERT INTO locations (id, name, timezone) VALUES ('{A}', 'Main St', 'America/New_York')");
        match parse_sql(&sql).unwrap() {
            Command::UpsertLocation { id, name, timezone } => {
                assert_eq!(id, ulid(A));
                assert_eq!(name, "Main St");
                assert_eq!(timezone, "America/New_York");
            }
            cmd => panic!("expected UpsertLocation, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_service_defaults_buffers() {
        let sql = format!("INSERT INTO services (id, name, category, duration) VALUES ('{A}', 'Cut', 'hair', 30)");
        match parse_sql(&sql).unwrap() {
            Command::UpsertService { service } => {
                assert_eq!(service.duration_min, 30);
                assert_eq!(service.buffer_before_min, 0);
                assert_eq!(service.buffer_after_min, 0);
            }
            cmd => panic!("expected UpsertService, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_service_positional() {
        let sql = format!("INSERT INTO services VALUES ('{A}', 'Color', 'color', 60, 5, 10)");
        match parse_sql(&sql).unwrap() {
            Command::UpsertService { service } => {
                assert_eq!(service.category, "color");
                assert_eq!(service.buffer_before_min, 5);
                assert_eq!(service.buffer_after_min, 10);
            }
            cmd => panic!("expected UpsertService, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_staff_with_schedule() {
        let schedule = r#"{"mon": {"start": "09:00", "end": "17:00", "breaks": [{"start": "12:00", "end": "12:30"}]}, "sat": {"start": "10:00", "end": "14:00"}}"#;
        let sql = format!(
            "INSERT INTO staff (id, location_id, name, categories, schedule, takes_walk_ins) \
             VALUES ('{A}', '{B}', 'Ana', 'hair, color', '{schedule}', false)"
        );
        match parse_sql(&sql).unwrap() {
            Command::UpsertStaff { staff } => {
                assert_eq!(staff.location_id, ulid(B));
                assert_eq!(staff.categories.len(), 2);
                assert!(staff.categories.contains("color"));
                assert!(!staff.takes_walk_ins);
                let mon = staff.week.for_weekday(Weekday::Mon);
                assert!(mon.enabled);
                assert_eq!(mon.breaks.len(), 1);
                assert!(staff.week.for_weekday(Weekday::Sat).enabled);
                assert!(!staff.week.for_weekday(Weekday::Sun).enabled);
            }
            cmd => panic!("expected UpsertStaff, got {cmd:?}"),
        }
    }

    #[test]
    fn bad_schedule_errors() {
        assert!(parse_schedule(r#"{"funday": {"start": "09:00", "end": "17:00"}}"#).is_err());
        assert!(parse_schedule(r#"{"mon": {"start": "9am", "end": "17:00"}}"#).is_err());
        assert!(parse_schedule("not json").is_err());
    }

    #[test]
    fn parse_time_off_and_delete() {
        let sql = format!(
            r#"INSERT INTO time_off (id, staff_id, start, "end") VALUES ('{A}', '{B}', '2030-03-04 12:00', '2030-03-05')"#
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertTimeOff { staff_id, time_off } => {
                assert_eq!(staff_id, ulid(B));
                assert_eq!(time_off.start.to_string(), "2030-03-04 12:00:00");
                assert_eq!(time_off.end.to_string(), "2030-03-05 00:00:00");
            }
            cmd => panic!("expected InsertTimeOff, got {cmd:?}"),
        }
        let sql = format!("DELETE FROM time_off WHERE id = '{A}'");
        assert_eq!(parse_sql(&sql).unwrap(), Command::DeleteTimeOff { id: ulid(A) });
    }

    #[test]
    fn parse_select_slots() {
        let sql = format!(
            "SELECT * FROM slots WHERE location_id = '{A}' AND service_ids = '{A},{B}' AND date = '2030-03-04' AND granularity = 30"
        );
        match parse_sql(&sql).unwrap() {
            Command::SelectSlots { request } => {
                assert_eq!(request.service_ids, vec![ulid(A), ulid(B)]);
                assert_eq!(request.date, NaiveDate::from_ymd_opt(2030, 3, 4).unwrap());
                assert_eq!(request.granularity_min, Some(30));
                assert_eq!(request.staff_id, None);
            }
            cmd => panic!("expected SelectSlots, got {cmd:?}"),
        }
    }

    #[test]
    fn select_slots_requires_location() {
        let sql = format!("SELECT * FROM slots WHERE service_ids = '{A}' AND date = '2030-03-04'");
        assert_eq!(
            parse_sql(&sql).unwrap_err(),
            SqlError::MissingColumn("slots", "location_id")
        );
    }

    #[test]
    fn parse_confirm_appointment() {
        let sql = format!(
            "INSERT INTO appointments (id, staff_id, client, service_ids, start, channel, external_call_id) \
             VALUES ('{A}', '{B}', 'Dana', '{A}', 1900000000000, 'voice', 'call-9')"
        );
        match parse_sql(&sql).unwrap() {
            Command::ConfirmAppointment { selection, client } => {
                assert_eq!(selection.start, 1_900_000_000_000);
                assert_eq!(client.channel, Channel::Voice);
                assert_eq!(client.external_call_id.as_deref(), Some("call-9"));
                assert!(matches!(client.client, ClientRef::Contact { .. }));
            }
            cmd => panic!("expected ConfirmAppointment, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_appointment_updates() {
        let sql = format!("UPDATE appointments SET start = 1900000000000, staff_id = '{B}' WHERE id = '{A}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::MoveAppointment {
                id: ulid(A),
                start: 1_900_000_000_000,
                staff_id: Some(ulid(B)),
            }
        );
        let sql = format!("UPDATE appointments SET status = 'checked_in' WHERE id = '{A}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::TransitionAppointment {
                id: ulid(A),
                event: StatusEvent::CheckIn,
            }
        );
        let sql = format!("UPDATE appointments SET status = 'teleported' WHERE id = '{A}'");
        assert!(parse_sql(&sql).is_err());
    }

    #[test]
    fn parse_select_appointments() {
        let sql = format!("SELECT * FROM appointments WHERE staff_id = '{A}' AND date = '2030-03-04'");
        assert!(matches!(parse_sql(&sql).unwrap(), Command::SelectAppointments { .. }));
        let sql = format!("SELECT * FROM appointments WHERE id = '{B}'");
        assert_eq!(parse_sql(&sql).unwrap(), Command::SelectAppointment { id: ulid(B) });
        let sql = format!("SELECT * FROM appointments WHERE staff_id = '{A}'");
        assert_eq!(parse_sql(&sql).unwrap_err(), SqlError::MissingFilter("date"));
    }

    #[test]
    fn parse_waitlist_commands() {
        let sql = format!(
            "INSERT INTO waitlist (id, location_id, name, phone, notes, estimated_duration) \
             VALUES ('{A}', '{B}', 'Sam', '+15550100', NULL, 20)"
        );
        match parse_sql(&sql).unwrap() {
            Command::JoinWaitlist { request } => {
                assert_eq!(request.estimated_duration_min, Some(20));
                assert!(request.service_ids.is_empty());
                assert_eq!(request.notes, None);
            }
            cmd => panic!("expected JoinWaitlist, got {cmd:?}"),
        }

        let sql = format!("UPDATE waitlist SET status = 'seated', staff_id = '{B}' WHERE id = '{A}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::UpdateWaitlist {
                id: ulid(A),
                action: WaitlistAction::Seat {
                    staff_id: ulid(B),
                    appointment_id: None,
                    service_ids: None,
                },
            }
        );
        let sql = format!("UPDATE waitlist SET status = 'seated' WHERE id = '{A}'");
        assert_eq!(
            parse_sql(&sql).unwrap_err(),
            SqlError::MissingColumn("waitlist", "staff_id")
        );
        let sql = format!("UPDATE waitlist SET position = 1 WHERE id = '{A}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::ReorderWaitlist { id: ulid(A), position: 1 }
        );
        let sql = format!("SELECT * FROM waitlist WHERE location_id = '{B}'");
        assert_eq!(parse_sql(&sql).unwrap(), Command::SelectWaitlist { location_id: ulid(B) });
    }

    #[test]
    fn update_without_id_errors() {
        assert_eq!(
            parse_sql("UPDATE waitlist SET status = 'left'").unwrap_err(),
            SqlError::MissingFilter("id")
        );
    }

    #[test]
    fn parse_unknown_table_errors() {
        let sql = format!("INSERT INTO foobar (id) VALUES ('{A}')");
        assert_eq!(parse_sql(&sql).unwrap_err(), SqlError::UnknownTable("foobar".into()));
    }

    #[test]
    fn column_count_must_match() {
        let sql = format!("INSERT INTO locations (id, name) VALUES ('{A}', 'x', 'UTC')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::WrongArity("locations", 2, 3))));
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }
}
