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
fn graded_component_cannot_be_deleted_but_can_be_renamed() {
    let workspace = tempfile::tempdir().expect("temp workspace");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.path().to_string_lossy() }),
    );
    let class = request_ok(&mut stdin, &mut reader, "2", "classes.create", json!({ "name": "8D" }));
    let class_id = class.get("classId").and_then(|v| v.as_str()).unwrap().to_string();
    let subject = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "subjects.create",
        json!({ "classId": class_id.clone(), "name": "Physics" }),
    );
    let subject_id = subject.get("subjectId").and_then(|v| v.as_str()).unwrap().to_string();
    request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "subjects.saveComponents",
        json!({
            "subjectId": subject_id.clone(),
            "components": [
                { "name": "Midterm", "weight": 40.0 },
                { "name": "Final", "weight": 60.0 }
            ]
        }),
    );
    let student = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "students.add",
        json!({ "classId": class_id.clone(), "lastName": "Ayers", "firstName": "Dana" }),
    );
    let student_id = student.get("studentId").and_then(|v| v.as_str()).unwrap().to_string();

    let comps = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "subjects.listComponents",
        json!({ "subjectId": subject_id.clone() }),
    );
    let comp_arr = comps.get("components").and_then(|v| v.as_array()).unwrap().clone();
    let midterm_id = comp_arr[0].get("id").and_then(|v| v.as_str()).unwrap().to_string();
    let final_id = comp_arr[1].get("id").and_then(|v| v.as_str()).unwrap().to_string();

    // Grade the midterm so the definition is referenced by a real score.
    request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "editing.beginInline",
        json!({ "studentId": student_id.clone() }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "grades.updateCell",
        json!({
            "subjectId": subject_id.clone(),
            "studentId": student_id.clone(),
            "componentId": midterm_id.clone(),
            "score": 8.0,
            "comment": "solid improvement"
        }),
    );
    request_ok(&mut stdin, &mut reader, "9", "editing.endInline", json!({}));

    // Dropping the graded component is refused outright.
    let refused = request(
        &mut stdin,
        &mut reader,
        "10",
        "subjects.saveComponents",
        json!({
            "subjectId": subject_id.clone(),
            "components": [
                { "id": final_id.clone(), "name": "Final", "weight": 100.0 }
            ]
        }),
    );
    assert_eq!(refused.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        refused
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str()),
        Some("component_in_use")
    );

    // Renaming and reweighting the same definition is fine; the recorded
    // score survives and the stored average follows the new weights.
    let saved = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "subjects.saveComponents",
        json!({
            "subjectId": subject_id.clone(),
            "components": [
                { "id": midterm_id.clone(), "name": "Term Exam", "weight": 70.0 },
                { "id": final_id.clone(), "name": "Final", "weight": 30.0 }
            ]
        }),
    );
    assert_eq!(
        saved.get("recomputedGrades").and_then(|v| v.as_i64()),
        Some(1)
    );

    let details = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "grades.courseDetails",
        json!({ "subjectId": subject_id.clone() }),
    );
    let names: Vec<&str> = details
        .get("components")
        .and_then(|v| v.as_array())
        .unwrap()
        .iter()
        .map(|c| c.get("name").and_then(|v| v.as_str()).unwrap())
        .collect();
    assert_eq!(names, vec!["Term Exam", "Final"]);

    let row = details
        .get("students")
        .and_then(|v| v.as_array())
        .and_then(|a| a.first())
        .expect("student row");
    let score = row
        .get("scores")
        .and_then(|v| v.as_array())
        .unwrap()
        .iter()
        .find(|s| s.get("componentId").and_then(|v| v.as_str()) == Some(midterm_id.as_str()))
        .expect("midterm score entry");
    assert_eq!(score.get("score").and_then(|v| v.as_f64()), Some(8.0));
    assert_eq!(
        score.get("comment").and_then(|v| v.as_str()),
        Some("solid improvement")
    );
    // 8 * 70 / 100 under the new weighting.
    assert_eq!(row.get("average").and_then(|v| v.as_f64()), Some(5.6));

    // An ungraded component can still be removed once nothing references it.
    let saved = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "subjects.saveComponents",
        json!({
            "subjectId": subject_id.clone(),
            "components": [
                { "id": midterm_id.clone(), "name": "Term Exam", "weight": 100.0 }
            ]
        }),
    );
    let remaining = saved.get("components").and_then(|v| v.as_array()).unwrap();
    assert_eq!(remaining.len(), 1);
    // 8 * 100 / 100 once the exam is the whole grade.
    let details = request_ok(
        &mut stdin,
        &mut reader,
        "14",
        "grades.courseDetails",
        json!({ "subjectId": subject_id.clone() }),
    );
    let row = details
        .get("students")
        .and_then(|v| v.as_array())
        .and_then(|a| a.first())
        .unwrap();
    assert_eq!(row.get("average").and_then(|v| v.as_f64()), Some(8.0));
    assert_eq!(row.get("status").and_then(|v| v.as_str()), Some("passed"));
}
