use crate::ipc::helpers::{
    class_exists, get_required_str, student_exists, with_conn, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;

/// The cached classes.enrolled_count follows the enrollments table; it is
/// refreshed inside the same transaction as any membership change.
fn refresh_enrolled_count(conn: &Connection, class_id: &str) -> Result<i64, HandlerErr> {
    conn.execute(
        "UPDATE classes SET enrolled_count =
            (SELECT COUNT(*) FROM enrollments e WHERE e.class_id = classes.id)
         WHERE id = ?",
        [class_id],
    )
    .map_err(|e| HandlerErr::db_write("db_update_failed", e, "classes"))?;
    conn.query_row(
        "SELECT enrolled_count FROM classes WHERE id = ?",
        [class_id],
        |r| r.get(0),
    )
    .map_err(HandlerErr::db_query)
}

fn enrollment_add(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let student_id = get_required_str(params, "studentId")?;

    if !class_exists(conn, &class_id)? {
        return Err(HandlerErr::not_found("class not found"));
    }
    if !student_exists(conn, &student_id)? {
        return Err(HandlerErr::not_found("student not found"));
    }

    let tx = conn.unchecked_transaction().map_err(HandlerErr::db_tx)?;
    let added = tx
        .execute(
            "INSERT INTO enrollments(class_id, student_id, enrolled_at)
             VALUES(?, ?, strftime('%Y-%m-%dT%H:%M:%SZ','now'))
             ON CONFLICT(class_id, student_id) DO NOTHING",
            (&class_id, &student_id),
        )
        .map_err(|e| HandlerErr::db_write("db_insert_failed", e, "enrollments"))?;
    let enrolled_count = refresh_enrolled_count(&tx, &class_id)?;
    tx.commit().map_err(HandlerErr::db_commit)?;

    Ok(json!({ "added": added > 0, "enrolledCount": enrolled_count }))
}

/// Unenrolling never touches attendance rows already generated for the
/// student; future sessions simply stop including them.
fn enrollment_remove(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let student_id = get_required_str(params, "studentId")?;

    if !class_exists(conn, &class_id)? {
        return Err(HandlerErr::not_found("class not found"));
    }

    let tx = conn.unchecked_transaction().map_err(HandlerErr::db_tx)?;
    let removed = tx
        .execute(
            "DELETE FROM enrollments WHERE class_id = ? AND student_id = ?",
            (&class_id, &student_id),
        )
        .map_err(|e| HandlerErr::db_write("db_delete_failed", e, "enrollments"))?;
    let enrolled_count = refresh_enrolled_count(&tx, &class_id)?;
    tx.commit().map_err(HandlerErr::db_commit)?;

    Ok(json!({ "removed": removed > 0, "enrolledCount": enrolled_count }))
}

fn enrollment_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    if !class_exists(conn, &class_id)? {
        return Err(HandlerErr::not_found("class not found"));
    }

    let mut stmt = conn
        .prepare(
            "SELECT s.id, s.student_code, s.last_name, s.first_name, s.middle_name, s.active,
                    e.enrolled_at
             FROM students s
             JOIN enrollments e ON e.student_id = s.id
             WHERE e.class_id = ?
             ORDER BY s.last_name, s.first_name, s.id",
        )
        .map_err(HandlerErr::db_query)?;
    let students = stmt
        .query_map([&class_id], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "studentCode": row.get::<_, String>(1)?,
                "lastName": row.get::<_, String>(2)?,
                "firstName": row.get::<_, String>(3)?,
                "middleName": row.get::<_, Option<String>>(4)?,
                "active": row.get::<_, i64>(5)? != 0,
                "enrolledAt": row.get::<_, Option<String>>(6)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;

    Ok(json!({ "students": students }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "enrollment.add" => Some(with_conn(state, req, enrollment_add)),
        "enrollment.remove" => Some(with_conn(state, req, enrollment_remove)),
        "enrollment.list" => Some(with_conn(state, req, enrollment_list)),
        _ => None,
    }
}
