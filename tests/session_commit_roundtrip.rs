use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_gradebookd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn gradebookd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request_ok(
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
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

struct Course {
    class_id: String,
    subject_id: String,
    student_ids: Vec<String>,
}

fn seed_course(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &std::path::Path,
    students: &[(&str, &str)],
) -> Course {
    request_ok(
        stdin,
        reader,
        "seed-ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let class = request_ok(
        stdin,
        reader,
        "seed-class",
        "classes.create",
        json!({ "name": "8D" }),
    );
    let class_id = class
        .get("classId")
        .and_then(|v| v.as_str())
        .unwrap()
        .to_string();

    let subject = request_ok(
        stdin,
        reader,
        "seed-subject",
        "subjects.create",
        json!({ "classId": class_id.clone(), "name": "Mathematics" }),
    );
    let subject_id = subject
        .get("subjectId")
        .and_then(|v| v.as_str())
        .unwrap()
        .to_string();

    request_ok(
        stdin,
        reader,
        "seed-components",
        "subjects.saveComponents",
        json!({
            "subjectId": subject_id.clone(),
            "components": [
                { "name": "Participation", "weight": 10.0 },
                { "name": "Assignment", "weight": 20.0 },
                { "name": "Midterm", "weight": 30.0 },
                { "name": "Final", "weight": 40.0 }
            ]
        }),
    );

    let mut student_ids = Vec::new();
    for (i, (last, first)) in students.iter().enumerate() {
        let added = request_ok(
            stdin,
            reader,
            &format!("seed-student-{}", i),
            "students.add",
            json!({ "classId": class_id.clone(), "lastName": last, "firstName": first }),
        );
        student_ids.push(
            added
                .get("studentId")
                .and_then(|v| v.as_str())
                .unwrap()
                .to_string(),
        );
    }

    Course {
        class_id,
        subject_id,
        student_ids,
    }
}

fn component_ids(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    subject_id: &str,
) -> Vec<String> {
    let listed = request_ok(
        stdin,
        reader,
        "components",
        "subjects.listComponents",
        json!({ "subjectId": subject_id }),
    );
    listed
        .get("components")
        .and_then(|v| v.as_array())
        .unwrap()
        .iter()
        .map(|c| c.get("id").and_then(|v| v.as_str()).unwrap().to_string())
        .collect()
}

#[test]
fn batch_session_previews_and_commits_weighted_averages() {
    let workspace = tempfile::tempdir().expect("temp workspace");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let course = seed_course(
        &mut stdin,
        &mut reader,
        workspace.path(),
        &[("Ayers", "Dana"), ("Brook", "Sam")],
    );
    let comps = component_ids(&mut stdin, &mut reader, &course.subject_id);
    let (s1, s2) = (course.student_ids[0].clone(), course.student_ids[1].clone());

    request_ok(
        &mut stdin,
        &mut reader,
        "att",
        "attendance.setRate",
        json!({ "classId": course.class_id.clone(), "studentId": s1.clone(), "rate": 0.85 }),
    );

    let begun = request_ok(
        &mut stdin,
        &mut reader,
        "begin",
        "session.begin",
        json!({ "subjectId": course.subject_id.clone() }),
    );
    assert_eq!(begun.get("studentCount").and_then(|v| v.as_i64()), Some(2));
    assert_eq!(begun.get("componentCount").and_then(|v| v.as_i64()), Some(4));

    // Stage the full row for the first student.
    for (i, (comp, score)) in comps
        .iter()
        .zip([8.0, 7.0, 6.0, 9.0])
        .enumerate()
    {
        request_ok(
            &mut stdin,
            &mut reader,
            &format!("set-{}", i),
            "session.setValue",
            json!({
                "studentId": s1.clone(),
                "componentId": comp.clone(),
                "value": score
            }),
        );
    }

    // 0.8 + 1.4 + 1.8 + 3.6, without touching the server.
    let live = request_ok(
        &mut stdin,
        &mut reader,
        "live-avg",
        "session.liveAverage",
        json!({ "studentId": s1.clone() }),
    );
    assert_eq!(live.get("average").and_then(|v| v.as_f64()), Some(7.6));

    let live = request_ok(
        &mut stdin,
        &mut reader,
        "live-status",
        "session.liveStatus",
        json!({ "studentId": s1.clone() }),
    );
    assert_eq!(live.get("status").and_then(|v| v.as_str()), Some("passed"));

    // Second student: one graded component out of four. The average covers
    // only the graded portion, so it lands below the pass mark.
    request_ok(
        &mut stdin,
        &mut reader,
        "set-partial",
        "session.setValue",
        json!({
            "studentId": s2.clone(),
            "componentId": comps[3].clone(),
            "value": 9.0
        }),
    );
    let live = request_ok(
        &mut stdin,
        &mut reader,
        "live-partial",
        "session.liveStatus",
        json!({ "studentId": s2.clone() }),
    );
    assert_eq!(live.get("average").and_then(|v| v.as_f64()), Some(3.6));
    assert_eq!(live.get("status").and_then(|v| v.as_str()), Some("failed"));

    // Nothing has hit the server before commit.
    let details = request_ok(
        &mut stdin,
        &mut reader,
        "pre-commit",
        "grades.courseDetails",
        json!({ "subjectId": course.subject_id.clone() }),
    );
    let rows = details.get("students").and_then(|v| v.as_array()).unwrap();
    for row in rows {
        assert!(row.get("average").map(|v| v.is_null()).unwrap_or(false));
        assert_eq!(row.get("status").and_then(|v| v.as_str()), Some("incomplete"));
    }

    let committed = request_ok(
        &mut stdin,
        &mut reader,
        "commit",
        "session.commit",
        json!({}),
    );
    assert_eq!(
        committed.get("successCount").and_then(|v| v.as_i64()),
        Some(2)
    );
    assert_eq!(committed.get("failCount").and_then(|v| v.as_i64()), Some(0));

    // Canonical state after commit carries the derived average and status.
    let details = request_ok(
        &mut stdin,
        &mut reader,
        "post-commit",
        "grades.courseDetails",
        json!({ "subjectId": course.subject_id.clone() }),
    );
    let rows = details.get("students").and_then(|v| v.as_array()).unwrap();
    let row1 = rows
        .iter()
        .find(|r| r.get("studentId").and_then(|v| v.as_str()) == Some(s1.as_str()))
        .expect("first student row");
    assert_eq!(row1.get("average").and_then(|v| v.as_f64()), Some(7.6));
    assert_eq!(row1.get("status").and_then(|v| v.as_str()), Some("passed"));
    assert!(row1
        .get("updatedAt")
        .and_then(|v| v.as_str())
        .map(|s| !s.is_empty())
        .unwrap_or(false));

    let row2 = rows
        .iter()
        .find(|r| r.get("studentId").and_then(|v| v.as_str()) == Some(s2.as_str()))
        .expect("second student row");
    assert_eq!(row2.get("average").and_then(|v| v.as_f64()), Some(3.6));
    assert_eq!(row2.get("status").and_then(|v| v.as_str()), Some("failed"));

    // The session is gone once committed.
    let payload = json!({
        "id": "post-live",
        "method": "session.liveAverage",
        "params": { "studentId": s1.clone() }
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read response");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse json");
    assert_eq!(value.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        value
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str()),
        Some("edit_mode_conflict")
    );
}
