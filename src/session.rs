//! Attendance session lifecycle engine.
//!
//! A session is the set of attendance rows sharing one (class, date) pair;
//! it exists iff at least one row does, and it is *active* iff at least one
//! row carries a non-empty status. The engine materializes sessions
//! idempotently (one row per enrolled student), discovers resumable sessions
//! by probing a bounded lookback window, and aggregates status counts. It
//! never deletes rows; archival is a marker row plus queries.

use std::collections::HashMap;

use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use thiserror::Error;

use crate::schedule::{self, ClockTime};

/// Status a freshly generated row starts with. The scanner's "active"
/// test relies on plain generation leaving rows unmarked; only the raw-log
/// overlay or a teacher edit assigns a concrete status.
pub const GENERATED_STATUS: AttendanceStatus = AttendanceStatus::None;

pub const DEFAULT_GRACE_MINUTES: u32 = 15;
pub const DEFAULT_LOOKBACK_DAYS: u32 = 7;
/// Upper bound for the scanner window (archive views). The scan is a
/// bounded substitute for a last-active-date pointer, not an index; callers
/// asking for more than this are using the wrong tool.
pub const MAX_LOOKBACK_DAYS: u32 = 90;
/// Upper bound for grace. Grace feeds minutes-since-midnight arithmetic,
/// so a full day is the largest value that still means anything.
pub const MAX_GRACE_MINUTES: u32 = 1440;

/// Workspace-level settings key holding `{"graceMinutes": .., "lookbackDays": ..}`.
pub const DEFAULTS_SETTINGS_KEY: &str = "attendance.defaults";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid schedule: {0}")]
    InvalidSchedule(#[from] schedule::ScheduleError),
    #[error("generation failed: {0}")]
    GenerationFailed(String),
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
}

impl EngineError {
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::InvalidSchedule(_) => "invalid_schedule",
            EngineError::GenerationFailed(_) => "generation_failed",
            EngineError::StoreUnavailable(_) => "store_unavailable",
        }
    }

    fn generation(e: rusqlite::Error) -> EngineError {
        EngineError::GenerationFailed(e.to_string())
    }

    fn store(e: rusqlite::Error) -> EngineError {
        EngineError::StoreUnavailable(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttendanceStatus {
    None,
    Present,
    Absent,
    Late,
    Excused,
}

impl AttendanceStatus {
    /// Store form; the empty string is the "no status" sentinel, which is
    /// what makes "non-empty status" the activity test.
    pub fn as_str(self) -> &'static str {
        match self {
            AttendanceStatus::None => "",
            AttendanceStatus::Present => "present",
            AttendanceStatus::Absent => "absent",
            AttendanceStatus::Late => "late",
            AttendanceStatus::Excused => "excused",
        }
    }

    pub fn parse(s: &str) -> Option<AttendanceStatus> {
        match s {
            "" | "none" => Some(AttendanceStatus::None),
            "present" => Some(AttendanceStatus::Present),
            "absent" => Some(AttendanceStatus::Absent),
            "late" => Some(AttendanceStatus::Late),
            "excused" => Some(AttendanceStatus::Excused),
            _ => None,
        }
    }

    pub fn is_marked(self) -> bool {
        self != AttendanceStatus::None
    }
}

impl Serialize for AttendanceStatus {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(self.as_str())
    }
}

/// One attendance row; (class_id, student_id, date) is the natural key.
/// Name fields are denormalized at generation time so sessions render
/// without a roster join.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceRecord {
    pub class_id: String,
    pub student_id: String,
    pub date: String,
    pub status: AttendanceStatus,
    pub time_in: Option<String>,
    pub time_out: Option<String>,
    pub remarks: Option<String>,
    pub student_code: String,
    pub last_name: String,
    pub first_name: String,
    pub middle_name: Option<String>,
    pub created_by: Option<String>,
    pub marked_by: Option<String>,
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EnrolledStudent {
    pub student_id: String,
    pub student_code: String,
    pub last_name: String,
    pub first_name: String,
    pub middle_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogDirection {
    In,
    Out,
}

impl LogDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            LogDirection::In => "in",
            LogDirection::Out => "out",
        }
    }

    pub fn parse(s: &str) -> Option<LogDirection> {
        match s {
            "in" => Some(LogDirection::In),
            "out" => Some(LogDirection::Out),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RawLogEntry {
    pub student_id: String,
    pub time: String,
    pub direction: LogDirection,
    pub pc_number: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SessionSummary {
    pub present: usize,
    pub late: usize,
    pub absent: usize,
    pub excused: usize,
    pub none: usize,
    pub total: usize,
}

impl SessionSummary {
    /// Rows carrying any concrete status. Archive gating requires this > 0.
    pub fn marked(&self) -> usize {
        self.total - self.none
    }
}

#[derive(Debug)]
pub struct GenerateOutcome {
    /// Full session after generation, roster-ordered.
    pub records: Vec<AttendanceRecord>,
    /// Rows inserted by this call.
    pub created: usize,
    /// Subset of `created` whose status came from the raw-log overlay.
    pub overlaid: usize,
}

const RECORD_COLUMNS: &str = "class_id, student_id, date, status, time_in, time_out, remarks,
        student_code, last_name, first_name, middle_name, created_by, marked_by, updated_at";

fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<AttendanceRecord> {
    let status_raw: String = row.get(3)?;
    Ok(AttendanceRecord {
        class_id: row.get(0)?,
        student_id: row.get(1)?,
        date: row.get(2)?,
        status: AttendanceStatus::parse(&status_raw).unwrap_or(AttendanceStatus::None),
        time_in: row.get(4)?,
        time_out: row.get(5)?,
        remarks: row.get(6)?,
        student_code: row.get(7)?,
        last_name: row.get(8)?,
        first_name: row.get(9)?,
        middle_name: row.get(10)?,
        created_by: row.get(11)?,
        marked_by: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

// --- AttendanceStore -------------------------------------------------------

pub fn get_record(
    conn: &Connection,
    class_id: &str,
    student_id: &str,
    date: &str,
) -> Result<Option<AttendanceRecord>, EngineError> {
    conn.query_row(
        &format!(
            "SELECT {RECORD_COLUMNS} FROM attendance_records
             WHERE class_id = ? AND student_id = ? AND date = ?"
        ),
        (class_id, student_id, date),
        row_to_record,
    )
    .optional()
    .map_err(EngineError::store)
}

/// Natural-key upsert: concurrent writers converge on one row per triple.
pub fn put_record(conn: &Connection, rec: &AttendanceRecord) -> Result<(), EngineError> {
    conn.execute(
        "INSERT INTO attendance_records(class_id, student_id, date, status, time_in, time_out,
            remarks, student_code, last_name, first_name, middle_name, created_by, marked_by,
            updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(class_id, student_id, date) DO UPDATE SET
           status = excluded.status,
           time_in = excluded.time_in,
           time_out = excluded.time_out,
           remarks = excluded.remarks,
           marked_by = excluded.marked_by,
           updated_at = excluded.updated_at",
        (
            &rec.class_id,
            &rec.student_id,
            &rec.date,
            rec.status.as_str(),
            &rec.time_in,
            &rec.time_out,
            &rec.remarks,
            &rec.student_code,
            &rec.last_name,
            &rec.first_name,
            &rec.middle_name,
            &rec.created_by,
            &rec.marked_by,
            &rec.updated_at,
        ),
    )
    .map(|_| ())
    .map_err(EngineError::store)
}

pub fn list_by_class_and_date(
    conn: &Connection,
    class_id: &str,
    date: &str,
) -> Result<Vec<AttendanceRecord>, EngineError> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM attendance_records
             WHERE class_id = ? AND date = ?
             ORDER BY last_name, first_name, student_id"
        ))
        .map_err(EngineError::store)?;
    stmt.query_map((class_id, date), row_to_record)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(EngineError::store)
}

// --- Collaborator reads ----------------------------------------------------

/// Membership as of the moment this runs; enroll/unenroll in the portal is
/// only visible to generation through this snapshot.
pub fn enrollment_snapshot(
    conn: &Connection,
    class_id: &str,
) -> rusqlite::Result<Vec<EnrolledStudent>> {
    let mut stmt = conn.prepare(
        "SELECT s.id, s.student_code, s.last_name, s.first_name, s.middle_name
         FROM students s
         JOIN enrollments e ON e.student_id = s.id
         WHERE e.class_id = ? AND s.active = 1
         ORDER BY s.last_name, s.first_name, s.id",
    )?;
    let rows = stmt.query_map([class_id], |r| {
        Ok(EnrolledStudent {
            student_id: r.get(0)?,
            student_code: r.get(1)?,
            last_name: r.get(2)?,
            first_name: r.get(3)?,
            middle_name: r.get(4)?,
        })
    })?;
    rows.collect()
}

pub fn logs_for(conn: &Connection, class_id: &str, date: &str) -> rusqlite::Result<Vec<RawLogEntry>> {
    let mut stmt = conn.prepare(
        "SELECT student_id, time, direction, pc_number
         FROM raw_logs
         WHERE class_id = ? AND date = ?
         ORDER BY time",
    )?;
    let rows = stmt.query_map((class_id, date), |r| {
        let dir_raw: String = r.get(2)?;
        Ok(RawLogEntry {
            student_id: r.get(0)?,
            time: r.get(1)?,
            direction: LogDirection::parse(&dir_raw).unwrap_or(LogDirection::In),
            pc_number: r.get(3)?,
        })
    })?;
    rows.collect()
}

/// Per-class grace, falling back to the workspace default, then the built-in.
pub fn grace_minutes_for(conn: &Connection, class_id: &str) -> rusqlite::Result<u32> {
    let per_class: Option<i64> = conn
        .query_row(
            "SELECT grace_minutes FROM attendance_settings WHERE class_id = ?",
            [class_id],
            |r| r.get(0),
        )
        .optional()?;
    if let Some(g) = per_class {
        return Ok(g.clamp(0, i64::from(MAX_GRACE_MINUTES)) as u32);
    }
    Ok(workspace_defaults(conn)?.0)
}

pub fn default_lookback_days(conn: &Connection) -> rusqlite::Result<u32> {
    Ok(workspace_defaults(conn)?.1)
}

/// Workspace-wide `(grace minutes, lookback days)` from the settings row,
/// with built-in fallbacks. Stored values are clamped to their caps; the
/// settings row is plain JSON and may hold anything.
pub fn workspace_defaults(conn: &Connection) -> rusqlite::Result<(u32, u32)> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value FROM settings WHERE key = ?",
            [DEFAULTS_SETTINGS_KEY],
            |r| r.get(0),
        )
        .optional()?;
    let mut grace = DEFAULT_GRACE_MINUTES;
    let mut lookback = DEFAULT_LOOKBACK_DAYS;
    if let Some(text) = raw {
        if let Ok(v) = serde_json::from_str::<serde_json::Value>(&text) {
            if let Some(g) = v.get("graceMinutes").and_then(|x| x.as_u64()) {
                grace = g.min(u64::from(MAX_GRACE_MINUTES)) as u32;
            }
            if let Some(l) = v.get("lookbackDays").and_then(|x| x.as_u64()) {
                lookback = (l as u32).min(MAX_LOOKBACK_DAYS);
            }
        }
    }
    Ok((grace, lookback))
}

// --- SessionGenerator ------------------------------------------------------

/// Materialize the session for (class, date): one row per currently-enrolled
/// student, rows that already exist left untouched. Runs in a single
/// transaction; any failure rolls back and surfaces as `GenerationFailed`.
///
/// The raw-log overlay runs only when at least one log exists for the date
/// (no rows means the log source never ran), and only on rows inserted by
/// this call, so manual edits survive regeneration.
pub fn generate(
    conn: &Connection,
    class_id: &str,
    date: &str,
    actor: Option<&str>,
) -> Result<GenerateOutcome, EngineError> {
    let schedule_text: String = conn
        .query_row(
            "SELECT schedule FROM classes WHERE id = ?",
            [class_id],
            |r| r.get(0),
        )
        .map_err(EngineError::generation)?;
    let sched = schedule::parse_schedule(&schedule_text)?;
    let grace = grace_minutes_for(conn, class_id).map_err(EngineError::generation)?;

    let tx = conn.unchecked_transaction().map_err(EngineError::generation)?;

    let snapshot = enrollment_snapshot(&tx, class_id).map_err(EngineError::generation)?;
    let logs = logs_for(&tx, class_id, date).map_err(EngineError::generation)?;
    let overlay = if logs.is_empty() {
        None
    } else {
        Some(collect_log_times(&logs))
    };

    let start_min = sched.start.minutes_since_midnight();
    let end_min = sched.end.minutes_since_midnight();

    let mut created = 0usize;
    let mut overlaid = 0usize;
    for student in &snapshot {
        let (status, time_in, time_out) = match &overlay {
            None => (GENERATED_STATUS, None, None),
            Some(times) => {
                let first_in = times.first_in.get(&student.student_id);
                let last_out = times.last_out.get(&student.student_id);
                let status = overlay_status(first_in.map(|t| t.0), start_min, end_min, grace);
                (
                    status,
                    first_in.map(|t| t.1.clone()),
                    last_out.map(|t| t.1.clone()),
                )
            }
        };
        let inserted = tx
            .execute(
                "INSERT INTO attendance_records(class_id, student_id, date, status, time_in,
                    time_out, remarks, student_code, last_name, first_name, middle_name,
                    created_by, marked_by, updated_at)
                 VALUES(?, ?, ?, ?, ?, ?, NULL, ?, ?, ?, ?, ?, NULL, NULL)
                 ON CONFLICT(class_id, student_id, date) DO NOTHING",
                (
                    class_id,
                    &student.student_id,
                    date,
                    status.as_str(),
                    &time_in,
                    &time_out,
                    &student.student_code,
                    &student.last_name,
                    &student.first_name,
                    &student.middle_name,
                    &actor,
                ),
            )
            .map_err(EngineError::generation)?;
        created += inserted;
        if inserted > 0 && status.is_marked() {
            overlaid += 1;
        }
    }

    let records = list_by_class_and_date(&tx, class_id, date)
        .map_err(|e| EngineError::GenerationFailed(e.to_string()))?;
    tx.commit().map_err(EngineError::generation)?;

    Ok(GenerateOutcome {
        records,
        created,
        overlaid,
    })
}

struct LogTimes {
    // student_id -> (minutes since midnight, original time string)
    first_in: HashMap<String, (u32, String)>,
    last_out: HashMap<String, (u32, String)>,
}

fn collect_log_times(logs: &[RawLogEntry]) -> LogTimes {
    let mut times = LogTimes {
        first_in: HashMap::new(),
        last_out: HashMap::new(),
    };
    for log in logs {
        let Ok(clock) = ClockTime::parse(&log.time) else {
            continue;
        };
        let minutes = clock.minutes_since_midnight();
        match log.direction {
            LogDirection::In => {
                let slot = times
                    .first_in
                    .entry(log.student_id.clone())
                    .or_insert((minutes, log.time.clone()));
                if minutes < slot.0 {
                    *slot = (minutes, log.time.clone());
                }
            }
            LogDirection::Out => {
                let slot = times
                    .last_out
                    .entry(log.student_id.clone())
                    .or_insert((minutes, log.time.clone()));
                if minutes > slot.0 {
                    *slot = (minutes, log.time.clone());
                }
            }
        }
    }
    times
}

/// Status for one student under the overlay. A login only counts if it
/// lands before the session end; inside the grace window it is `present`,
/// past it `late`, and no qualifying login at all is `absent`.
fn overlay_status(
    first_in_min: Option<u32>,
    start_min: u32,
    end_min: u32,
    grace_min: u32,
) -> AttendanceStatus {
    match first_in_min {
        None => AttendanceStatus::Absent,
        Some(t) if t >= end_min => AttendanceStatus::Absent,
        Some(t) if t > start_min.saturating_add(grace_min) => AttendanceStatus::Late,
        Some(_) => AttendanceStatus::Present,
    }
}

// --- ActiveSessionScanner --------------------------------------------------

/// Whether (class, date) holds at least one row with a non-empty status.
pub fn session_is_active(
    conn: &Connection,
    class_id: &str,
    date: &str,
) -> Result<bool, EngineError> {
    conn.query_row(
        "SELECT 1 FROM attendance_records
         WHERE class_id = ? AND date = ? AND status != ''
         LIMIT 1",
        (class_id, date),
        |_| Ok(()),
    )
    .optional()
    .map(|v| v.is_some())
    .map_err(EngineError::store)
}

/// Most recent date within the window (today back through `lookback_days`)
/// whose session is active, newest first. There is no persisted
/// last-active-date pointer; this bounded probe stands in for one. A store
/// error on a single candidate date is absorbed as "no match for that date"
/// and the scan continues.
pub fn find_active(
    conn: &Connection,
    class_id: &str,
    today: NaiveDate,
    lookback_days: u32,
) -> Option<String> {
    for back in 0..=i64::from(lookback_days) {
        let date = (today - chrono::Duration::days(back))
            .format("%Y-%m-%d")
            .to_string();
        if session_is_active(conn, class_id, &date).unwrap_or(false) {
            return Some(date);
        }
    }
    None
}

// --- StatusAggregator ------------------------------------------------------

/// Counts by status; total over any record set, including empty. The
/// counters always sum to `records.len()`.
pub fn summarize(records: &[AttendanceRecord]) -> SessionSummary {
    let mut summary = SessionSummary {
        total: records.len(),
        ..SessionSummary::default()
    };
    for rec in records {
        match rec.status {
            AttendanceStatus::Present => summary.present += 1,
            AttendanceStatus::Late => summary.late += 1,
            AttendanceStatus::Absent => summary.absent += 1,
            AttendanceStatus::Excused => summary.excused += 1,
            AttendanceStatus::None => summary.none += 1,
        }
    }
    summary
}
