use crate::ipc::helpers::{
    class_exists, get_optional_str, get_required_str, student_exists, with_conn, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::schedule::ClockTime;
use crate::session::LogDirection;
use chrono::NaiveDate;
use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

pub fn parse_date_param(raw: &str) -> Result<NaiveDate, HandlerErr> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| HandlerErr::bad_params(format!("invalid date {:?}: expected YYYY-MM-DD", raw)))
}

/// Append one lab login/logout event. The feed is append-only; generation
/// reads it, nothing rewrites it.
fn logs_record(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let student_id = get_required_str(params, "studentId")?;
    let date = get_required_str(params, "date")?;
    parse_date_param(&date)?;
    let time = get_required_str(params, "time")?;
    if ClockTime::parse(&time).is_err() {
        return Err(HandlerErr::bad_params(format!(
            "invalid time {:?}: expected H:MM AM/PM",
            time
        )));
    }
    let direction_raw = get_optional_str(params, "direction")?.unwrap_or_else(|| "in".to_string());
    let Some(direction) = LogDirection::parse(&direction_raw) else {
        return Err(HandlerErr::bad_params("direction must be \"in\" or \"out\""));
    };
    let pc_number = get_optional_str(params, "pcNumber")?;

    if !class_exists(conn, &class_id)? {
        return Err(HandlerErr::not_found("class not found"));
    }
    if !student_exists(conn, &student_id)? {
        return Err(HandlerErr::not_found("student not found"));
    }

    let log_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO raw_logs(id, class_id, student_id, date, time, direction, pc_number)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &log_id,
            &class_id,
            &student_id,
            &date,
            &time,
            direction.as_str(),
            &pc_number,
        ),
    )
    .map_err(|e| HandlerErr::db_write("db_insert_failed", e, "raw_logs"))?;

    Ok(json!({ "logId": log_id }))
}

fn logs_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let date = get_required_str(params, "date")?;
    parse_date_param(&date)?;

    // rowid order is arrival order; time strings do not sort chronologically.
    let mut stmt = conn
        .prepare(
            "SELECT id, student_id, time, direction, pc_number
             FROM raw_logs
             WHERE class_id = ? AND date = ?
             ORDER BY rowid",
        )
        .map_err(HandlerErr::db_query)?;
    let logs = stmt
        .query_map((&class_id, &date), |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "studentId": row.get::<_, String>(1)?,
                "time": row.get::<_, String>(2)?,
                "direction": row.get::<_, String>(3)?,
                "pcNumber": row.get::<_, Option<String>>(4)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;

    Ok(json!({ "logs": logs }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "logs.record" => Some(with_conn(state, req, logs_record)),
        "logs.list" => Some(with_conn(state, req, logs_list)),
        _ => None,
    }
}
