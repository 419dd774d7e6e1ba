use crate::db;
use crate::ipc::handlers::logs::parse_date_param;
use crate::ipc::helpers::{
    class_exists, get_optional_str, get_optional_u64, get_required_str, with_conn, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::schedule::ClockTime;
use crate::session::{self, AttendanceRecord, AttendanceStatus};
use chrono::NaiveDate;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn record_json(rec: &AttendanceRecord) -> serde_json::Value {
    serde_json::to_value(rec).unwrap_or(serde_json::Value::Null)
}

fn records_json(records: &[AttendanceRecord]) -> serde_json::Value {
    json!(records.iter().map(record_json).collect::<Vec<_>>())
}

fn summary_json(records: &[AttendanceRecord]) -> serde_json::Value {
    let s = session::summarize(records);
    json!({
        "present": s.present,
        "late": s.late,
        "absent": s.absent,
        "excused": s.excused,
        "none": s.none,
        "total": s.total,
        "marked": s.marked(),
    })
}

fn archived_at(conn: &Connection, class_id: &str, date: &str) -> Result<Option<String>, HandlerErr> {
    conn.query_row(
        "SELECT archived_at FROM attendance_archives WHERE class_id = ? AND date = ?",
        (class_id, date),
        |r| r.get(0),
    )
    .optional()
    .map_err(HandlerErr::db_query)
}

/// Archived sessions are frozen: generation and marking both refuse.
fn ensure_not_archived(conn: &Connection, class_id: &str, date: &str) -> Result<(), HandlerErr> {
    if archived_at(conn, class_id, date)?.is_some() {
        return Err(HandlerErr::new(
            "archive_blocked",
            format!("session {} is archived", date),
        ));
    }
    Ok(())
}

/// `today` is supplied by the UI so "today" means the user's local date,
/// not the sidecar host's. Falls back to the host clock when omitted.
fn today_param(params: &serde_json::Value) -> Result<NaiveDate, HandlerErr> {
    match get_optional_str(params, "today")? {
        Some(raw) => parse_date_param(&raw),
        None => Ok(chrono::Local::now().date_naive()),
    }
}

fn lookback_param(conn: &Connection, params: &serde_json::Value) -> Result<u32, HandlerErr> {
    match get_optional_u64(params, "lookbackDays")? {
        Some(n) => {
            if n > u64::from(session::MAX_LOOKBACK_DAYS) {
                return Err(HandlerErr::bad_params(format!(
                    "lookbackDays must be at most {}",
                    session::MAX_LOOKBACK_DAYS
                )));
            }
            Ok(n as u32)
        }
        None => session::default_lookback_days(conn).map_err(HandlerErr::db_query),
    }
}

fn attendance_resume(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    if !class_exists(conn, &class_id)? {
        return Err(HandlerErr::not_found("class not found"));
    }
    let today = today_param(params)?;
    let lookback = lookback_param(conn, params)?;

    match session::find_active(conn, &class_id, today, lookback) {
        Some(date) => {
            let records = session::list_by_class_and_date(conn, &class_id, &date)?;
            let archived = archived_at(conn, &class_id, &date)?.is_some();
            Ok(json!({
                "found": true,
                "date": date,
                "records": records_json(&records),
                "summary": summary_json(&records),
                "archived": archived,
            }))
        }
        None => Ok(json!({ "found": false, "date": null })),
    }
}

fn attendance_generate(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let date = get_required_str(params, "date")?;
    parse_date_param(&date)?;
    let actor = get_optional_str(params, "actorId")?;

    if !class_exists(conn, &class_id)? {
        return Err(HandlerErr::not_found("class not found"));
    }
    ensure_not_archived(conn, &class_id, &date)?;

    let out = session::generate(conn, &class_id, &date, actor.as_deref())?;
    Ok(json!({
        "records": records_json(&out.records),
        "summary": summary_json(&out.records),
        "created": out.created,
        "overlaid": out.overlaid,
    }))
}

fn attendance_open(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let date = get_required_str(params, "date")?;
    parse_date_param(&date)?;
    if !class_exists(conn, &class_id)? {
        return Err(HandlerErr::not_found("class not found"));
    }

    let records = session::list_by_class_and_date(conn, &class_id, &date)?;
    let archived = archived_at(conn, &class_id, &date)?.is_some();
    Ok(json!({
        "records": records_json(&records),
        "summary": summary_json(&records),
        "archived": archived,
    }))
}

fn attendance_mark(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let student_id = get_required_str(params, "studentId")?;
    let date = get_required_str(params, "date")?;
    parse_date_param(&date)?;
    let status_raw = get_required_str(params, "status")?;
    let Some(status) = AttendanceStatus::parse(&status_raw) else {
        return Err(HandlerErr::bad_params(format!(
            "unknown status {:?}",
            status_raw
        )));
    };
    let actor = get_optional_str(params, "actorId")?;

    ensure_not_archived(conn, &class_id, &date)?;
    if session::get_record(conn, &class_id, &student_id, &date)?.is_none() {
        return Err(HandlerErr::not_found(
            "no attendance row for that student and date; generate the session first",
        ));
    }

    let mut set_parts: Vec<String> = vec!["status = ?".into(), "marked_by = ?".into()];
    let mut bind_values: Vec<Value> = vec![
        Value::Text(status.as_str().to_string()),
        actor.map(Value::Text).unwrap_or(Value::Null),
    ];
    for (param, column) in [("timeIn", "time_in"), ("timeOut", "time_out")] {
        if let Some(v) = params.get(param) {
            if v.is_null() {
                set_parts.push(format!("{} = NULL", column));
            } else if let Some(s) = v.as_str() {
                if ClockTime::parse(s).is_err() {
                    return Err(HandlerErr::bad_params(format!(
                        "invalid {} {:?}: expected H:MM AM/PM",
                        param, s
                    )));
                }
                set_parts.push(format!("{} = ?", column));
                bind_values.push(Value::Text(s.to_string()));
            } else {
                return Err(HandlerErr::bad_params(format!(
                    "{} must be a string or null",
                    param
                )));
            }
        }
    }
    if let Some(v) = params.get("remarks") {
        if v.is_null() {
            set_parts.push("remarks = NULL".into());
        } else if let Some(s) = v.as_str() {
            set_parts.push("remarks = ?".into());
            bind_values.push(Value::Text(s.to_string()));
        } else {
            return Err(HandlerErr::bad_params("remarks must be a string or null"));
        }
    }
    set_parts.push("updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')".into());

    let sql = format!(
        "UPDATE attendance_records SET {} WHERE class_id = ? AND student_id = ? AND date = ?",
        set_parts.join(", ")
    );
    bind_values.push(Value::Text(class_id.clone()));
    bind_values.push(Value::Text(student_id.clone()));
    bind_values.push(Value::Text(date.clone()));
    conn.execute(&sql, params_from_iter(bind_values))
        .map_err(|e| HandlerErr::db_write("db_update_failed", e, "attendance_records"))?;

    let updated = session::get_record(conn, &class_id, &student_id, &date)?
        .ok_or_else(|| HandlerErr::not_found("attendance row vanished during update"))?;
    Ok(json!({ "record": record_json(&updated) }))
}

fn attendance_bulk_mark(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let date = get_required_str(params, "date")?;
    parse_date_param(&date)?;
    let status_raw = get_required_str(params, "status")?;
    let Some(status) = AttendanceStatus::parse(&status_raw) else {
        return Err(HandlerErr::bad_params(format!(
            "unknown status {:?}",
            status_raw
        )));
    };
    let actor = get_optional_str(params, "actorId")?;
    let Some(ids_json) = params.get("studentIds").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("missing studentIds"));
    };
    let student_ids: Vec<String> = ids_json
        .iter()
        .filter_map(|v| v.as_str().map(|s| s.to_string()))
        .collect();

    ensure_not_archived(conn, &class_id, &date)?;

    let tx = conn.unchecked_transaction().map_err(HandlerErr::db_tx)?;
    let mut marked = 0usize;
    for student_id in &student_ids {
        // Students without a session row are silently skipped.
        let changed = tx
            .execute(
                "UPDATE attendance_records
                 SET status = ?, marked_by = ?, updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')
                 WHERE class_id = ? AND student_id = ? AND date = ?",
                (status.as_str(), &actor, &class_id, student_id, &date),
            )
            .map_err(|e| HandlerErr::db_write("db_update_failed", e, "attendance_records"))?;
        marked += changed;
    }
    tx.commit().map_err(HandlerErr::db_commit)?;

    Ok(json!({ "marked": marked, "requested": student_ids.len() }))
}

fn attendance_summary(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let date = get_required_str(params, "date")?;
    parse_date_param(&date)?;
    if !class_exists(conn, &class_id)? {
        return Err(HandlerErr::not_found("class not found"));
    }

    let records = session::list_by_class_and_date(conn, &class_id, &date)?;
    Ok(json!({ "summary": summary_json(&records) }))
}

fn attendance_archive(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let date = get_required_str(params, "date")?;
    parse_date_param(&date)?;
    let actor = get_optional_str(params, "actorId")?;
    if !class_exists(conn, &class_id)? {
        return Err(HandlerErr::not_found("class not found"));
    }

    let records = session::list_by_class_and_date(conn, &class_id, &date)?;
    if records.is_empty() {
        return Err(HandlerErr::not_found("no session for that date"));
    }
    if session::summarize(&records).marked() == 0 {
        return Err(HandlerErr::new(
            "archive_blocked",
            "session has no marked rows",
        ));
    }

    if let Some(at) = archived_at(conn, &class_id, &date)? {
        return Ok(json!({ "archived": true, "archivedAt": at, "alreadyArchived": true }));
    }

    conn.execute(
        "INSERT INTO attendance_archives(id, class_id, date, archived_at, archived_by)
         VALUES(?, ?, ?, strftime('%Y-%m-%dT%H:%M:%SZ','now'), ?)
         ON CONFLICT(class_id, date) DO NOTHING",
        (Uuid::new_v4().to_string(), &class_id, &date, &actor),
    )
    .map_err(|e| HandlerErr::db_write("db_insert_failed", e, "attendance_archives"))?;

    let at = archived_at(conn, &class_id, &date)?.unwrap_or_default();
    Ok(json!({ "archived": true, "archivedAt": at, "alreadyArchived": false }))
}

/// Dashboard feed: one entry per active class whose lookback window holds
/// an active session, newest session first.
fn attendance_recent(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let today = today_param(params)?;
    let lookback = lookback_param(conn, params)?;

    let mut stmt = conn
        .prepare(
            "SELECT id, subject_code, subject_name FROM classes
             WHERE active = 1
             ORDER BY subject_code, subject_name",
        )
        .map_err(HandlerErr::db_query)?;
    let classes = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;

    let mut sessions = Vec::new();
    for (class_id, subject_code, subject_name) in classes {
        let Some(date) = session::find_active(conn, &class_id, today, lookback) else {
            continue;
        };
        let records = session::list_by_class_and_date(conn, &class_id, &date)?;
        let archived = archived_at(conn, &class_id, &date)?.is_some();
        sessions.push(json!({
            "classId": class_id,
            "subjectCode": subject_code,
            "subjectName": subject_name,
            "date": date,
            "summary": summary_json(&records),
            "archived": archived,
        }));
    }
    sessions.sort_by(|a, b| b["date"].as_str().cmp(&a["date"].as_str()));

    Ok(json!({ "sessions": sessions }))
}

fn attendance_settings_get(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    match get_optional_str(params, "classId")? {
        Some(class_id) => {
            if !class_exists(conn, &class_id)? {
                return Err(HandlerErr::not_found("class not found"));
            }
            let override_grace: Option<i64> = conn
                .query_row(
                    "SELECT grace_minutes FROM attendance_settings WHERE class_id = ?",
                    [&class_id],
                    |r| r.get(0),
                )
                .optional()
                .map_err(HandlerErr::db_query)?;
            let effective = session::grace_minutes_for(conn, &class_id).map_err(HandlerErr::db_query)?;
            Ok(json!({
                "classId": class_id,
                "graceMinutes": effective,
                "override": override_grace,
            }))
        }
        None => {
            let (grace, lookback) = session::workspace_defaults(conn).map_err(HandlerErr::db_query)?;
            Ok(json!({ "graceMinutes": grace, "lookbackDays": lookback }))
        }
    }
}

/// Per-class scope sets or clears the grace override; workspace scope
/// (no classId) merges into the shared defaults row.
fn attendance_settings_set(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    match get_optional_str(params, "classId")? {
        Some(class_id) => {
            if !class_exists(conn, &class_id)? {
                return Err(HandlerErr::not_found("class not found"));
            }
            let Some(gv) = params.get("graceMinutes") else {
                return Err(HandlerErr::bad_params("missing graceMinutes"));
            };
            if gv.is_null() {
                conn.execute(
                    "DELETE FROM attendance_settings WHERE class_id = ?",
                    [&class_id],
                )
                .map_err(|e| HandlerErr::db_write("db_delete_failed", e, "attendance_settings"))?;
                let effective =
                    session::grace_minutes_for(conn, &class_id).map_err(HandlerErr::db_query)?;
                return Ok(json!({
                    "classId": class_id,
                    "graceMinutes": effective,
                    "override": null,
                }));
            }
            let Some(grace) = gv.as_u64() else {
                return Err(HandlerErr::bad_params(
                    "graceMinutes must be a non-negative integer or null",
                ));
            };
            if grace > u64::from(session::MAX_GRACE_MINUTES) {
                return Err(HandlerErr::bad_params(format!(
                    "graceMinutes must be at most {}",
                    session::MAX_GRACE_MINUTES
                )));
            }
            conn.execute(
                "INSERT INTO attendance_settings(class_id, grace_minutes) VALUES(?, ?)
                 ON CONFLICT(class_id) DO UPDATE SET grace_minutes = excluded.grace_minutes",
                (&class_id, grace as i64),
            )
            .map_err(|e| HandlerErr::db_write("db_update_failed", e, "attendance_settings"))?;
            Ok(json!({
                "classId": class_id,
                "graceMinutes": grace,
                "override": grace,
            }))
        }
        None => {
            let grace = get_optional_u64(params, "graceMinutes")?;
            let lookback = get_optional_u64(params, "lookbackDays")?;
            if grace.is_none() && lookback.is_none() {
                return Err(HandlerErr::bad_params(
                    "must include graceMinutes or lookbackDays",
                ));
            }
            if let Some(g) = grace {
                if g > u64::from(session::MAX_GRACE_MINUTES) {
                    return Err(HandlerErr::bad_params(format!(
                        "graceMinutes must be at most {}",
                        session::MAX_GRACE_MINUTES
                    )));
                }
            }
            if let Some(l) = lookback {
                if l > u64::from(session::MAX_LOOKBACK_DAYS) {
                    return Err(HandlerErr::bad_params(format!(
                        "lookbackDays must be at most {}",
                        session::MAX_LOOKBACK_DAYS
                    )));
                }
            }

            let mut value = db::settings_get_json(conn, session::DEFAULTS_SETTINGS_KEY)
                .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?
                .unwrap_or_else(|| json!({}));
            if let Some(g) = grace {
                value["graceMinutes"] = json!(g);
            }
            if let Some(l) = lookback {
                value["lookbackDays"] = json!(l);
            }
            db::settings_set_json(conn, session::DEFAULTS_SETTINGS_KEY, &value)
                .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;

            let (grace_now, lookback_now) =
                session::workspace_defaults(conn).map_err(HandlerErr::db_query)?;
            Ok(json!({ "graceMinutes": grace_now, "lookbackDays": lookback_now }))
        }
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attendance.resume" => Some(with_conn(state, req, attendance_resume)),
        "attendance.generate" => Some(with_conn(state, req, attendance_generate)),
        "attendance.open" => Some(with_conn(state, req, attendance_open)),
        "attendance.mark" => Some(with_conn(state, req, attendance_mark)),
        "attendance.bulkMark" => Some(with_conn(state, req, attendance_bulk_mark)),
        "attendance.summary" => Some(with_conn(state, req, attendance_summary)),
        "attendance.archive" => Some(with_conn(state, req, attendance_archive)),
        "attendance.recent" => Some(with_conn(state, req, attendance_recent)),
        "attendance.settings.get" => Some(with_conn(state, req, attendance_settings_get)),
        "attendance.settings.set" => Some(with_conn(state, req, attendance_settings_set)),
        _ => None,
    }
}
