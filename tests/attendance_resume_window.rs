use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_rollbookd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn rollbookd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn seed_class_with_student(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id_class: &str,
    id_student: &str,
    id_enroll: &str,
    code: &str,
) -> (String, String) {
    let created = request_ok(
        stdin,
        reader,
        id_class,
        "classes.create",
        json!({
            "subjectCode": code,
            "subjectName": format!("{} Lecture", code),
            "schedule": "MWF 9:00 AM-10:00 AM"
        }),
    );
    let class_id = created
        .get("classId")
        .and_then(|v| v.as_str())
        .expect("classId")
        .to_string();
    let student = request_ok(
        stdin,
        reader,
        id_student,
        "students.create",
        json!({
            "studentCode": format!("{}-001", code),
            "lastName": "Reyes",
            "firstName": "Ana"
        }),
    );
    let student_id = student
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string();
    let _ = request_ok(
        stdin,
        reader,
        id_enroll,
        "enrollment.add",
        json!({ "classId": class_id, "studentId": student_id }),
    );
    (class_id, student_id)
}

#[test]
fn resume_skips_unmarked_sessions_and_picks_the_newest_marked_one() {
    let workspace = temp_dir("rollbook-resume");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let (class_id, student_id) =
        seed_class_with_student(&mut stdin, &mut reader, "2", "3", "4", "CS101");

    for (id, date) in [("5", "2026-03-02"), ("6", "2026-03-04")] {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            id,
            "attendance.generate",
            json!({ "classId": class_id, "date": date }),
        );
    }

    // Generated-only sessions are invisible to the scanner.
    let blank = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "attendance.resume",
        json!({ "classId": class_id, "today": "2026-03-06" }),
    );
    assert_eq!(blank.get("found").and_then(|v| v.as_bool()), Some(false));
    assert!(blank.get("date").map(|v| v.is_null()).unwrap_or(false));

    let bulk = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "attendance.bulkMark",
        json!({
            "classId": class_id,
            "date": "2026-03-02",
            "studentIds": [student_id],
            "status": "present"
        }),
    );
    assert_eq!(bulk.get("marked").and_then(|v| v.as_u64()), Some(1));

    let found = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "attendance.resume",
        json!({ "classId": class_id, "today": "2026-03-06" }),
    );
    assert_eq!(found.get("found").and_then(|v| v.as_bool()), Some(true));
    assert_eq!(found.get("date").and_then(|v| v.as_str()), Some("2026-03-02"));
    assert_eq!(
        found
            .get("summary")
            .and_then(|s| s.get("present"))
            .and_then(|v| v.as_u64()),
        Some(1)
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "attendance.mark",
        json!({
            "classId": class_id,
            "studentId": student_id,
            "date": "2026-03-04",
            "status": "late"
        }),
    );
    let newer = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "attendance.resume",
        json!({ "classId": class_id, "today": "2026-03-06" }),
    );
    assert_eq!(newer.get("date").and_then(|v| v.as_str()), Some("2026-03-04"));
}

#[test]
fn resume_window_is_inclusive_and_the_cap_is_enforced() {
    let workspace = temp_dir("rollbook-resume-window");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let (class_id, student_id) =
        seed_class_with_student(&mut stdin, &mut reader, "2", "3", "4", "PE201");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "attendance.generate",
        json!({ "classId": class_id, "date": "2026-03-02" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "attendance.mark",
        json!({
            "classId": class_id,
            "studentId": student_id,
            "date": "2026-03-02",
            "status": "present"
        }),
    );

    // Exactly lookbackDays back still counts.
    let edge = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "attendance.resume",
        json!({ "classId": class_id, "today": "2026-03-09", "lookbackDays": 7 }),
    );
    assert_eq!(edge.get("found").and_then(|v| v.as_bool()), Some(true));
    assert_eq!(edge.get("date").and_then(|v| v.as_str()), Some("2026-03-02"));

    // One day past the window it drops out.
    let past = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "attendance.resume",
        json!({ "classId": class_id, "today": "2026-03-10", "lookbackDays": 7 }),
    );
    assert_eq!(past.get("found").and_then(|v| v.as_bool()), Some(false));

    // A wider window finds it again.
    let wide = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "attendance.resume",
        json!({ "classId": class_id, "today": "2026-03-10", "lookbackDays": 30 }),
    );
    assert_eq!(wide.get("found").and_then(|v| v.as_bool()), Some(true));

    let capped = request(
        &mut stdin,
        &mut reader,
        "10",
        "attendance.resume",
        json!({ "classId": class_id, "today": "2026-03-10", "lookbackDays": 120 }),
    );
    assert_eq!(capped.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        capped
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str()),
        Some("bad_params")
    );
}

#[test]
fn workspace_defaults_drive_the_scanner_window() {
    let workspace = temp_dir("rollbook-resume-defaults");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let (class_id, student_id) =
        seed_class_with_student(&mut stdin, &mut reader, "2", "3", "4", "CHEM3");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "attendance.generate",
        json!({ "classId": class_id, "date": "2026-03-02" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "attendance.mark",
        json!({
            "classId": class_id,
            "studentId": student_id,
            "date": "2026-03-02",
            "status": "excused"
        }),
    );

    // Session is 9 days back; the built-in 7-day default misses it.
    let miss = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "attendance.resume",
        json!({ "classId": class_id, "today": "2026-03-11" }),
    );
    assert_eq!(miss.get("found").and_then(|v| v.as_bool()), Some(false));

    let set = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "attendance.settings.set",
        json!({ "lookbackDays": 14 }),
    );
    assert_eq!(set.get("lookbackDays").and_then(|v| v.as_u64()), Some(14));

    let hit = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "attendance.resume",
        json!({ "classId": class_id, "today": "2026-03-11" }),
    );
    assert_eq!(hit.get("found").and_then(|v| v.as_bool()), Some(true));

    let defaults = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "attendance.settings.get",
        json!({}),
    );
    assert_eq!(defaults.get("graceMinutes").and_then(|v| v.as_u64()), Some(15));
    assert_eq!(defaults.get("lookbackDays").and_then(|v| v.as_u64()), Some(14));

    // Workspace grace obeys the same cap as the per-class override; a
    // rejected set leaves the stored defaults alone.
    let too_big = request(
        &mut stdin,
        &mut reader,
        "11",
        "attendance.settings.set",
        json!({ "graceMinutes": 4294967000u64 }),
    );
    assert_eq!(too_big.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        too_big
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str()),
        Some("bad_params")
    );
    let unchanged = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "attendance.settings.get",
        json!({}),
    );
    assert_eq!(
        unchanged.get("graceMinutes").and_then(|v| v.as_u64()),
        Some(15)
    );
    assert_eq!(
        unchanged.get("lookbackDays").and_then(|v| v.as_u64()),
        Some(14)
    );
}

#[test]
fn recent_lists_each_active_class_once_newest_first() {
    let workspace = temp_dir("rollbook-recent");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let (math, math_student) =
        seed_class_with_student(&mut stdin, &mut reader, "2", "3", "4", "MATH1");
    let (phys, phys_student) =
        seed_class_with_student(&mut stdin, &mut reader, "5", "6", "7", "PHYS1");

    for (id, class_id, student_id, date) in [
        ("8", &math, &math_student, "2026-03-02"),
        ("9", &phys, &phys_student, "2026-03-04"),
    ] {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            id,
            "attendance.generate",
            json!({ "classId": class_id, "date": date }),
        );
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("{}m", id),
            "attendance.mark",
            json!({
                "classId": class_id,
                "studentId": student_id,
                "date": date,
                "status": "present"
            }),
        );
    }

    let recent = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "attendance.recent",
        json!({ "today": "2026-03-06" }),
    );
    let sessions = recent
        .get("sessions")
        .and_then(|v| v.as_array())
        .expect("sessions");
    assert_eq!(sessions.len(), 2);
    assert_eq!(
        sessions[0].get("date").and_then(|v| v.as_str()),
        Some("2026-03-04")
    );
    assert_eq!(
        sessions[0].get("subjectCode").and_then(|v| v.as_str()),
        Some("PHYS1")
    );
    assert_eq!(
        sessions[1].get("date").and_then(|v| v.as_str()),
        Some("2026-03-02")
    );
    assert_eq!(
        sessions[1]
            .get("summary")
            .and_then(|s| s.get("present"))
            .and_then(|v| v.as_u64()),
        Some(1)
    );
}
