use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub const DB_FILE: &str = "rollbook.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            subject_code TEXT NOT NULL,
            subject_name TEXT NOT NULL,
            schedule TEXT NOT NULL,
            room TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            enrolled_count INTEGER NOT NULL DEFAULT 0,
            created_at TEXT,
            updated_at TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            student_code TEXT NOT NULL UNIQUE,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            middle_name TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT,
            updated_at TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS enrollments(
            class_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            enrolled_at TEXT,
            PRIMARY KEY(class_id, student_id),
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollments_student ON enrollments(student_id)",
        [],
    )?;

    // The (class_id, student_id, date) primary key is what makes session
    // generation idempotent; never replace it with a surrogate id.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance_records(
            class_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            date TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT '',
            time_in TEXT,
            time_out TEXT,
            remarks TEXT,
            student_code TEXT NOT NULL DEFAULT '',
            last_name TEXT NOT NULL DEFAULT '',
            first_name TEXT NOT NULL DEFAULT '',
            middle_name TEXT,
            created_by TEXT,
            marked_by TEXT,
            updated_at TEXT,
            PRIMARY KEY(class_id, student_id, date),
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    ensure_records_audit_columns(conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_records_class_date
            ON attendance_records(class_id, date)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_records_student ON attendance_records(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS raw_logs(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            date TEXT NOT NULL,
            time TEXT NOT NULL,
            direction TEXT NOT NULL DEFAULT 'in',
            pc_number TEXT,
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    ensure_raw_logs_direction(conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_raw_logs_class_date ON raw_logs(class_id, date)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance_settings(
            class_id TEXT PRIMARY KEY,
            grace_minutes INTEGER NOT NULL DEFAULT 15,
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance_archives(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            date TEXT NOT NULL,
            archived_at TEXT NOT NULL,
            archived_by TEXT,
            UNIQUE(class_id, date),
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_archives_class ON attendance_archives(class_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        [],
    )?;

    Ok(())
}

// Workspaces written before per-row audit fields existed lack these columns.
fn ensure_records_audit_columns(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "attendance_records", "created_by")? {
        conn.execute("ALTER TABLE attendance_records ADD COLUMN created_by TEXT", [])?;
    }
    if !table_has_column(conn, "attendance_records", "marked_by")? {
        conn.execute("ALTER TABLE attendance_records ADD COLUMN marked_by TEXT", [])?;
    }
    if !table_has_column(conn, "attendance_records", "updated_at")? {
        conn.execute("ALTER TABLE attendance_records ADD COLUMN updated_at TEXT", [])?;
    }
    Ok(())
}

fn ensure_raw_logs_direction(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "raw_logs", "direction")? {
        return Ok(());
    }
    // Older log dumps only recorded logins.
    conn.execute(
        "ALTER TABLE raw_logs ADD COLUMN direction TEXT NOT NULL DEFAULT 'in'",
        [],
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row("SELECT value FROM settings WHERE key = ?", [key], |row| row.get(0))
        .optional()?;
    match raw {
        Some(text) => Ok(Some(serde_json::from_str(&text)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(conn: &Connection, key: &str, value: &serde_json::Value) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        (key, value.to_string()),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_records_table_gains_audit_columns() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute(
            "CREATE TABLE attendance_records(
                class_id TEXT NOT NULL,
                student_id TEXT NOT NULL,
                date TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT '',
                time_in TEXT,
                time_out TEXT,
                remarks TEXT,
                student_code TEXT NOT NULL DEFAULT '',
                last_name TEXT NOT NULL DEFAULT '',
                first_name TEXT NOT NULL DEFAULT '',
                middle_name TEXT,
                PRIMARY KEY(class_id, student_id, date)
            )",
            [],
        )
        .unwrap();

        init_schema(&conn).unwrap();
        assert!(table_has_column(&conn, "attendance_records", "created_by").unwrap());
        assert!(table_has_column(&conn, "attendance_records", "marked_by").unwrap());
        assert!(table_has_column(&conn, "attendance_records", "updated_at").unwrap());

        // Running again on a current schema changes nothing.
        init_schema(&conn).unwrap();
    }

    #[test]
    fn settings_json_round_trips() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        assert!(settings_get_json(&conn, "attendance.defaults").unwrap().is_none());

        let value = serde_json::json!({"graceMinutes": 10, "lookbackDays": 14});
        settings_set_json(&conn, "attendance.defaults", &value).unwrap();
        assert_eq!(
            settings_get_json(&conn, "attendance.defaults").unwrap(),
            Some(value)
        );

        let replaced = serde_json::json!({"graceMinutes": 5});
        settings_set_json(&conn, "attendance.defaults", &replaced).unwrap();
        assert_eq!(
            settings_get_json(&conn, "attendance.defaults").unwrap(),
            Some(replaced)
        );
    }
}
