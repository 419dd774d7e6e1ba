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

// A teacher's laptop and a lab machine can both point at the same
// workspace directory; the single-row-per-student guarantee has to
// hold across processes, not just within one connection.
#[test]
fn two_sidecars_converge_on_one_row_per_student() {
    let workspace = temp_dir("rollbook-two-writers");

    let (_teacher, mut teacher_in, mut teacher_out) = spawn_sidecar();
    let _ = request_ok(
        &mut teacher_in,
        &mut teacher_out,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let created = request_ok(
        &mut teacher_in,
        &mut teacher_out,
        "2",
        "classes.create",
        json!({
            "subjectCode": "CS101",
            "subjectName": "Intro to Computing",
            "schedule": "MWF 9:00 AM-10:00 AM"
        }),
    );
    let class_id = created
        .get("classId")
        .and_then(|v| v.as_str())
        .expect("classId")
        .to_string();

    let mut student_ids = Vec::new();
    for (i, (code, last)) in [("2019-001", "Reyes"), ("2019-002", "Santos")]
        .iter()
        .enumerate()
    {
        let student = request_ok(
            &mut teacher_in,
            &mut teacher_out,
            &format!("s{}", i),
            "students.create",
            json!({ "studentCode": code, "lastName": last, "firstName": "Test" }),
        );
        let student_id = student
            .get("studentId")
            .and_then(|v| v.as_str())
            .expect("studentId")
            .to_string();
        let _ = request_ok(
            &mut teacher_in,
            &mut teacher_out,
            &format!("e{}", i),
            "enrollment.add",
            json!({ "classId": class_id, "studentId": student_id.clone() }),
        );
        student_ids.push(student_id);
    }

    let (_lab, mut lab_in, mut lab_out) = spawn_sidecar();
    let _ = request_ok(
        &mut lab_in,
        &mut lab_out,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    // Whoever generates first creates the rows; the second call adds none.
    let first = request_ok(
        &mut teacher_in,
        &mut teacher_out,
        "10",
        "attendance.generate",
        json!({ "classId": class_id, "date": "2026-03-02" }),
    );
    assert_eq!(first.get("created").and_then(|v| v.as_u64()), Some(2));

    let second = request_ok(
        &mut lab_in,
        &mut lab_out,
        "2",
        "attendance.generate",
        json!({ "classId": class_id, "date": "2026-03-02" }),
    );
    assert_eq!(second.get("created").and_then(|v| v.as_u64()), Some(0));
    assert_eq!(
        second
            .get("records")
            .and_then(|v| v.as_array())
            .map(|a| a.len()),
        Some(2)
    );

    // Marks written by one process are visible to the other.
    let bulk = request_ok(
        &mut lab_in,
        &mut lab_out,
        "3",
        "attendance.bulkMark",
        json!({
            "classId": class_id,
            "date": "2026-03-02",
            "studentIds": student_ids,
            "status": "present",
            "actorId": "lab-checker"
        }),
    );
    assert_eq!(bulk.get("marked").and_then(|v| v.as_u64()), Some(2));

    let seen = request_ok(
        &mut teacher_in,
        &mut teacher_out,
        "11",
        "attendance.open",
        json!({ "classId": class_id, "date": "2026-03-02" }),
    );
    let summary = seen.get("summary").expect("summary");
    assert_eq!(summary.get("present").and_then(|v| v.as_u64()), Some(2));
    assert_eq!(summary.get("total").and_then(|v| v.as_u64()), Some(2));
    let records = seen.get("records").and_then(|v| v.as_array()).expect("records");
    for record in records {
        assert_eq!(
            record.get("markedBy").and_then(|v| v.as_str()),
            Some("lab-checker")
        );
    }

    let resumed = request_ok(
        &mut teacher_in,
        &mut teacher_out,
        "12",
        "attendance.resume",
        json!({ "classId": class_id, "today": "2026-03-02" }),
    );
    assert_eq!(resumed.get("found").and_then(|v| v.as_bool()), Some(true));
    assert_eq!(
        resumed.get("date").and_then(|v| v.as_str()),
        Some("2026-03-02")
    );
}
