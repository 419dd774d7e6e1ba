use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_optional_str, get_required_str, with_conn, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::schedule::{self, ClockTime, ScheduleDay};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn invalid_schedule(e: schedule::ScheduleError) -> HandlerErr {
    HandlerErr::new("invalid_schedule", e.to_string())
}

/// A schedule arrives either as canonical text ("MWF 9:00 AM-10:00 AM") or
/// as the portal's picker fields: days[] plus startTime/endTime. Both paths
/// come back canonicalized, so stored text always round-trips.
fn schedule_from_params(params: &serde_json::Value) -> Result<String, HandlerErr> {
    if let Some(text) = get_optional_str(params, "schedule")? {
        let parsed = schedule::parse_schedule(&text).map_err(invalid_schedule)?;
        return schedule::format_schedule(&parsed.days, parsed.start, parsed.end)
            .map_err(invalid_schedule);
    }

    let Some(day_values) = params.get("days").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params(
            "missing schedule (or days/startTime/endTime)",
        ));
    };
    let mut days = Vec::new();
    for v in day_values {
        let Some(key) = v.as_str() else {
            return Err(HandlerErr::bad_params("days entries must be strings"));
        };
        let Some(day) = ScheduleDay::from_key(key) else {
            return Err(HandlerErr::new(
                "invalid_schedule",
                format!("unknown day {:?}", key),
            ));
        };
        days.push(day);
    }
    let start = ClockTime::parse(&get_required_str(params, "startTime")?).map_err(invalid_schedule)?;
    let end = ClockTime::parse(&get_required_str(params, "endTime")?).map_err(invalid_schedule)?;
    schedule::format_schedule(&days, start, end).map_err(invalid_schedule)
}

fn fetch_class(conn: &Connection, class_id: &str) -> Result<Option<serde_json::Value>, HandlerErr> {
    conn.query_row(
        "SELECT id, subject_code, subject_name, schedule, room, active, enrolled_count,
                created_at, updated_at
         FROM classes WHERE id = ?",
        [class_id],
        |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "subjectCode": row.get::<_, String>(1)?,
                "subjectName": row.get::<_, String>(2)?,
                "schedule": row.get::<_, String>(3)?,
                "room": row.get::<_, Option<String>>(4)?,
                "active": row.get::<_, i64>(5)? != 0,
                "enrolledCount": row.get::<_, i64>(6)?,
                "createdAt": row.get::<_, Option<String>>(7)?,
                "updatedAt": row.get::<_, Option<String>>(8)?,
            }))
        },
    )
    .optional()
    .map_err(HandlerErr::db_query)
}

fn handle_classes_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "classes": [] }));
    };

    // Include session counts so the UI can show a useful dashboard.
    // Correlated subquery avoids double-counting from joins.
    let mut stmt = match conn.prepare(
        "SELECT
           c.id,
           c.subject_code,
           c.subject_name,
           c.schedule,
           c.room,
           c.active,
           c.enrolled_count,
           (SELECT COUNT(DISTINCT ar.date)
              FROM attendance_records ar WHERE ar.class_id = c.id) AS session_count
         FROM classes c
         ORDER BY c.subject_code, c.subject_name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "subjectCode": row.get::<_, String>(1)?,
                "subjectName": row.get::<_, String>(2)?,
                "schedule": row.get::<_, String>(3)?,
                "room": row.get::<_, Option<String>>(4)?,
                "active": row.get::<_, i64>(5)? != 0,
                "enrolledCount": row.get::<_, i64>(6)?,
                "sessionCount": row.get::<_, i64>(7)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(classes) => ok(&req.id, json!({ "classes": classes })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn classes_get(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let Some(mut class) = fetch_class(conn, &class_id)? else {
        return Err(HandlerErr::not_found("class not found"));
    };
    // Stored schedules are canonical, so this parse only fails on rows
    // written by something other than this sidecar.
    if let Some(text) = class.get("schedule").and_then(|v| v.as_str()) {
        if let Ok(days) = schedule::parse_days(text) {
            class["scheduleDays"] = json!(days.iter().map(|d| d.key()).collect::<Vec<_>>());
        }
    }
    Ok(json!({ "class": class }))
}

fn classes_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let subject_code = get_required_str(params, "subjectCode")?.trim().to_string();
    let subject_name = get_required_str(params, "subjectName")?.trim().to_string();
    if subject_code.is_empty() || subject_name.is_empty() {
        return Err(HandlerErr::bad_params(
            "subjectCode and subjectName must not be empty",
        ));
    }
    let room = get_optional_str(params, "room")?;
    let schedule_text = schedule_from_params(params)?;

    let class_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO classes(id, subject_code, subject_name, schedule, room, active,
            enrolled_count, created_at)
         VALUES(?, ?, ?, ?, ?, 1, 0, strftime('%Y-%m-%dT%H:%M:%SZ','now'))",
        (&class_id, &subject_code, &subject_name, &schedule_text, &room),
    )
    .map_err(|e| HandlerErr::db_write("db_insert_failed", e, "classes"))?;

    Ok(json!({
        "classId": class_id,
        "subjectCode": subject_code,
        "subjectName": subject_name,
        "schedule": schedule_text,
        "room": room,
    }))
}

fn classes_update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let Some(patch) = params.get("patch") else {
        return Err(HandlerErr::bad_params("missing patch"));
    };

    let mut set_parts: Vec<String> = Vec::new();
    let mut bind_values: Vec<Value> = Vec::new();

    if patch.get("subjectCode").is_some() {
        let v = get_required_str(patch, "subjectCode")?.trim().to_string();
        if v.is_empty() {
            return Err(HandlerErr::bad_params("subjectCode must not be empty"));
        }
        set_parts.push("subject_code = ?".into());
        bind_values.push(Value::Text(v));
    }
    if patch.get("subjectName").is_some() {
        let v = get_required_str(patch, "subjectName")?.trim().to_string();
        if v.is_empty() {
            return Err(HandlerErr::bad_params("subjectName must not be empty"));
        }
        set_parts.push("subject_name = ?".into());
        bind_values.push(Value::Text(v));
    }
    if patch.get("schedule").is_some() || patch.get("days").is_some() {
        let canonical = schedule_from_params(patch)?;
        set_parts.push("schedule = ?".into());
        bind_values.push(Value::Text(canonical));
    }
    if let Some(v) = patch.get("room") {
        if v.is_null() {
            set_parts.push("room = NULL".into());
        } else if let Some(s) = v.as_str() {
            set_parts.push("room = ?".into());
            bind_values.push(Value::Text(s.to_string()));
        } else {
            return Err(HandlerErr::bad_params("patch.room must be a string or null"));
        }
    }
    if let Some(v) = patch.get("active") {
        let Some(b) = v.as_bool() else {
            return Err(HandlerErr::bad_params("patch.active must be a boolean"));
        };
        set_parts.push("active = ?".into());
        bind_values.push(Value::Integer(if b { 1 } else { 0 }));
    }

    if set_parts.is_empty() {
        return Err(HandlerErr::bad_params("patch must include at least one field"));
    }
    set_parts.push("updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')".into());

    let sql = format!("UPDATE classes SET {} WHERE id = ?", set_parts.join(", "));
    bind_values.push(Value::Text(class_id.clone()));
    let changed = conn
        .execute(&sql, params_from_iter(bind_values))
        .map_err(|e| HandlerErr::db_write("db_update_failed", e, "classes"))?;
    if changed == 0 {
        return Err(HandlerErr::not_found("class not found"));
    }

    let class = fetch_class(conn, &class_id)?
        .ok_or_else(|| HandlerErr::not_found("class not found"))?;
    Ok(json!({ "class": class }))
}

fn classes_delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;

    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM classes WHERE id = ?", [&class_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(HandlerErr::db_query)?;
    if exists.is_none() {
        return Err(HandlerErr::not_found("class not found"));
    }

    let tx = conn.unchecked_transaction().map_err(HandlerErr::db_tx)?;

    // Explicitly delete in dependency order (no ON DELETE CASCADE).
    for (table, sql) in [
        (
            "attendance_archives",
            "DELETE FROM attendance_archives WHERE class_id = ?",
        ),
        (
            "attendance_settings",
            "DELETE FROM attendance_settings WHERE class_id = ?",
        ),
        ("raw_logs", "DELETE FROM raw_logs WHERE class_id = ?"),
        (
            "attendance_records",
            "DELETE FROM attendance_records WHERE class_id = ?",
        ),
        ("enrollments", "DELETE FROM enrollments WHERE class_id = ?"),
        ("classes", "DELETE FROM classes WHERE id = ?"),
    ] {
        if let Err(e) = tx.execute(sql, [&class_id]) {
            let _ = tx.rollback();
            return Err(HandlerErr::db_write("db_delete_failed", e, table));
        }
    }

    tx.commit().map_err(HandlerErr::db_commit)?;
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "classes.list" => Some(handle_classes_list(state, req)),
        "classes.get" => Some(with_conn(state, req, classes_get)),
        "classes.create" => Some(with_conn(state, req, classes_create)),
        "classes.update" => Some(with_conn(state, req, classes_update)),
        "classes.delete" => Some(with_conn(state, req, classes_delete)),
        _ => None,
    }
}
