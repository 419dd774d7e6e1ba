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

#[test]
fn export_then_import_restores_the_marked_session() {
    let source = temp_dir("rollbook-export-src");
    let target = temp_dir("rollbook-export-dst");
    let out_dir = temp_dir("rollbook-export-out");
    let bundle = out_dir.join("rollbook-backup.zip");

    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": source.to_string_lossy() }),
    );
    let created = request_ok(
        &mut stdin,
        &mut reader,
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
    let student = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.create",
        json!({ "studentCode": "2019-001", "lastName": "Reyes", "firstName": "Ana" }),
    );
    let student_id = student
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "enrollment.add",
        json!({ "classId": class_id, "studentId": student_id }),
    );
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

    let exported = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "workspace.export",
        json!({ "outPath": bundle.to_string_lossy() }),
    );
    assert_eq!(
        exported.get("bundleFormat").and_then(|v| v.as_str()),
        Some("rollbook-workspace-v1")
    );
    assert_eq!(exported.get("entryCount").and_then(|v| v.as_u64()), Some(3));
    let exported_sha = exported
        .get("dbSha256")
        .and_then(|v| v.as_str())
        .expect("dbSha256")
        .to_string();
    assert_eq!(exported_sha.len(), 64);
    assert!(bundle.is_file());

    // Switch to an empty workspace and pull the bundle in.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "workspace.select",
        json!({ "path": target.to_string_lossy() }),
    );
    let empty = request_ok(&mut stdin, &mut reader, "9", "classes.list", json!({}));
    assert_eq!(
        empty
            .get("classes")
            .and_then(|v| v.as_array())
            .map(|a| a.len()),
        Some(0)
    );

    let imported = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "workspace.import",
        json!({ "inPath": bundle.to_string_lossy() }),
    );
    assert_eq!(
        imported.get("bundleFormatDetected").and_then(|v| v.as_str()),
        Some("rollbook-workspace-v1")
    );
    assert_eq!(
        imported.get("dbSha256").and_then(|v| v.as_str()),
        Some(exported_sha.as_str())
    );

    let opened = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "attendance.open",
        json!({ "classId": class_id, "date": "2026-03-02" }),
    );
    let records = opened
        .get("records")
        .and_then(|v| v.as_array())
        .expect("records");
    assert_eq!(records.len(), 1);
    assert_eq!(
        records[0].get("status").and_then(|v| v.as_str()),
        Some("present")
    );
    assert_eq!(
        records[0].get("studentId").and_then(|v| v.as_str()),
        Some(student_id.as_str())
    );
}

#[test]
fn tampered_bundles_are_rejected() {
    let workspace = temp_dir("rollbook-import-tamper");
    let out_dir = temp_dir("rollbook-import-tamper-out");
    let bundle = out_dir.join("bad.zip");

    // A well-formed v1 bundle whose manifest checksum does not match the payload.
    let file = std::fs::File::create(&bundle).expect("create bundle");
    let mut zip = zip::ZipWriter::new(file);
    let options = zip::write::FileOptions::default();
    zip.start_file("manifest.json", options).expect("start manifest");
    let manifest = json!({
        "format": "rollbook-workspace-v1",
        "version": 1,
        "exportedAt": "2026-03-02T08:00:00Z",
        "dbSha256": "0000000000000000000000000000000000000000000000000000000000000000"
    });
    zip.write_all(manifest.to_string().as_bytes())
        .expect("write manifest");
    zip.start_file("db/rollbook.sqlite3", options)
        .expect("start db entry");
    zip.write_all(b"not-a-real-database").expect("write db entry");
    zip.finish().expect("finish bundle");

    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let created = request_ok(
        &mut stdin,
        &mut reader,
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

    let rejected = request(
        &mut stdin,
        &mut reader,
        "3",
        "workspace.import",
        json!({ "inPath": bundle.to_string_lossy() }),
    );
    assert_eq!(rejected.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        rejected
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str()),
        Some("bundle_invalid")
    );

    // The workspace database was not replaced by the bad payload.
    let db_path = workspace.join("rollbook.sqlite3");
    let bytes = std::fs::read(&db_path).expect("read workspace db");
    assert_ne!(bytes.as_slice(), b"not-a-real-database");

    // The session stays on its previous database; no re-select needed.
    let still_there = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "classes.get",
        json!({ "classId": class_id }),
    );
    assert_eq!(
        still_there
            .get("class")
            .and_then(|c| c.get("subjectCode"))
            .and_then(|v| v.as_str()),
        Some("CS101")
    );
}

#[test]
fn importing_a_missing_bundle_is_not_found() {
    let workspace = temp_dir("rollbook-import-missing");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let missing = request(
        &mut stdin,
        &mut reader,
        "2",
        "workspace.import",
        json!({ "inPath": workspace.join("no-such-bundle.zip").to_string_lossy() }),
    );
    assert_eq!(missing.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        missing
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str()),
        Some("not_found")
    );
}
