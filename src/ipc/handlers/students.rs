use crate::ipc::helpers::{get_optional_str, get_required_str, with_conn, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn fetch_student(conn: &Connection, student_id: &str) -> Result<Option<serde_json::Value>, HandlerErr> {
    conn.query_row(
        "SELECT id, student_code, last_name, first_name, middle_name, active
         FROM students WHERE id = ?",
        [student_id],
        |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "studentCode": row.get::<_, String>(1)?,
                "lastName": row.get::<_, String>(2)?,
                "firstName": row.get::<_, String>(3)?,
                "middleName": row.get::<_, Option<String>>(4)?,
                "active": row.get::<_, i64>(5)? != 0,
            }))
        },
    )
    .optional()
    .map_err(HandlerErr::db_query)
}

fn students_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_code = get_required_str(params, "studentCode")?.trim().to_string();
    let last_name = get_required_str(params, "lastName")?.trim().to_string();
    let first_name = get_required_str(params, "firstName")?.trim().to_string();
    if student_code.is_empty() || last_name.is_empty() || first_name.is_empty() {
        return Err(HandlerErr::bad_params(
            "studentCode, lastName and firstName must not be empty",
        ));
    }
    let middle_name = get_optional_str(params, "middleName")?;

    let student_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students(id, student_code, last_name, first_name, middle_name, active,
            created_at)
         VALUES(?, ?, ?, ?, ?, 1, strftime('%Y-%m-%dT%H:%M:%SZ','now'))",
        (&student_id, &student_code, &last_name, &first_name, &middle_name),
    )
    .map_err(|e| HandlerErr::db_write("db_insert_failed", e, "students"))?;

    Ok(json!({
        "studentId": student_id,
        "studentCode": student_code,
        "lastName": last_name,
        "firstName": first_name,
        "middleName": middle_name,
    }))
}

/// Patch never rewrites the name copies already embedded in attendance
/// rows; those stay as they were on the day the session was generated.
fn students_update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let Some(patch) = params.get("patch") else {
        return Err(HandlerErr::bad_params("missing patch"));
    };

    let mut set_parts: Vec<String> = Vec::new();
    let mut bind_values: Vec<Value> = Vec::new();

    for (param, column) in [
        ("studentCode", "student_code"),
        ("lastName", "last_name"),
        ("firstName", "first_name"),
    ] {
        if patch.get(param).is_some() {
            let v = get_required_str(patch, param)?.trim().to_string();
            if v.is_empty() {
                return Err(HandlerErr::bad_params(format!("{} must not be empty", param)));
            }
            set_parts.push(format!("{} = ?", column));
            bind_values.push(Value::Text(v));
        }
    }
    if let Some(v) = patch.get("middleName") {
        if v.is_null() {
            set_parts.push("middle_name = NULL".into());
        } else if let Some(s) = v.as_str() {
            set_parts.push("middle_name = ?".into());
            bind_values.push(Value::Text(s.to_string()));
        } else {
            return Err(HandlerErr::bad_params(
                "patch.middleName must be a string or null",
            ));
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

    let sql = format!("UPDATE students SET {} WHERE id = ?", set_parts.join(", "));
    bind_values.push(Value::Text(student_id.clone()));
    let changed = conn
        .execute(&sql, params_from_iter(bind_values))
        .map_err(|e| HandlerErr::db_write("db_update_failed", e, "students"))?;
    if changed == 0 {
        return Err(HandlerErr::not_found("student not found"));
    }

    let student = fetch_student(conn, &student_id)?
        .ok_or_else(|| HandlerErr::not_found("student not found"))?;
    Ok(json!({ "student": student }))
}

fn students_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let active_only = params
        .get("activeOnly")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let sql = format!(
        "SELECT s.id, s.student_code, s.last_name, s.first_name, s.middle_name, s.active,
                (SELECT COUNT(*) FROM enrollments e WHERE e.student_id = s.id) AS enrolled_classes
         FROM students s
         {}
         ORDER BY s.last_name, s.first_name, s.id",
        if active_only { "WHERE s.active = 1" } else { "" }
    );
    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::db_query)?;
    let students = stmt
        .query_map([], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "studentCode": row.get::<_, String>(1)?,
                "lastName": row.get::<_, String>(2)?,
                "firstName": row.get::<_, String>(3)?,
                "middleName": row.get::<_, Option<String>>(4)?,
                "active": row.get::<_, i64>(5)? != 0,
                "enrolledClasses": row.get::<_, i64>(6)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;

    Ok(json!({ "students": students }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.create" => Some(with_conn(state, req, students_create)),
        "students.update" => Some(with_conn(state, req, students_update)),
        "students.list" => Some(with_conn(state, req, students_list)),
        _ => None,
    }
}
