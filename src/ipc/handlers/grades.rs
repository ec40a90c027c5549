use crate::calc::MAX_SCORE;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::session::EditMode;
use rusqlite::OptionalExtension;
use serde_json::json;
use std::collections::HashMap;

fn handle_course_details(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let subject_id = match req.params.get("subjectId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing subjectId", None),
    };

    let subject = match db::load_subject(conn, &subject_id) {
        Ok(Some(s)) => s,
        Ok(None) => return err(&req.id, "not_found", "subject not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let defs = match db::load_components(conn, &subject_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut students_stmt = match conn.prepare(
        "SELECT id, last_name, first_name, sort_order, active
         FROM students
         WHERE class_id = ?
         ORDER BY sort_order",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let students = match students_stmt
        .query_map([&subject.class_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, i64>(3)?,
                r.get::<_, i64>(4)? != 0,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut rows: Vec<serde_json::Value> = Vec::with_capacity(students.len());
    for (student_id, last, first, sort_order, active) in &students {
        let grade: Option<(String, Option<f64>, String, Option<String>)> = match conn
            .query_row(
                "SELECT id, average, status, updated_at FROM grades
                 WHERE student_id = ? AND subject_id = ?",
                (student_id, &subject_id),
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            )
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };

        let mut scores_by_component: HashMap<String, serde_json::Value> = HashMap::new();
        if let Some((grade_id, _, _, _)) = &grade {
            let mut score_stmt = match conn.prepare(
                "SELECT component_id, score, comment FROM grade_component_scores
                 WHERE grade_id = ?",
            ) {
                Ok(s) => s,
                Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
            };
            let score_rows = score_stmt
                .query_map([grade_id], |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, Option<f64>>(1)?,
                        r.get::<_, Option<String>>(2)?,
                    ))
                })
                .and_then(|it| it.collect::<Result<Vec<_>, _>>());
            match score_rows {
                Ok(list) => {
                    for (component_id, score, comment) in list {
                        scores_by_component.insert(
                            component_id.clone(),
                            json!({
                                "componentId": component_id,
                                "score": score,
                                "comment": comment
                            }),
                        );
                    }
                }
                Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
            }
        }

        // One entry per definition, in definition order; ungraded components
        // surface as explicit nulls.
        let scores: Vec<serde_json::Value> = defs
            .iter()
            .map(|d| {
                scores_by_component.remove(&d.id).unwrap_or_else(|| {
                    json!({ "componentId": d.id, "score": null, "comment": null })
                })
            })
            .collect();

        let attendance = match db::attendance_rate(conn, &subject.class_id, student_id) {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };

        let (grade_id, average, status, updated_at) = match grade {
            Some((id, avg, status, updated)) => (Some(id), avg, status, updated),
            None => (None, None, "incomplete".to_string(), None),
        };

        rows.push(json!({
            "studentId": student_id,
            "displayName": format!("{}, {}", last, first),
            "sortOrder": sort_order,
            "active": active,
            "gradeId": grade_id,
            "average": average,
            "status": status,
            "updatedAt": updated_at,
            "attendanceRate": attendance,
            "scores": scores
        }));
    }

    let components: Vec<serde_json::Value> = defs
        .iter()
        .map(|d| json!({ "id": d.id, "name": d.name, "weight": d.weight }))
        .collect();

    ok(
        &req.id,
        json!({
            "subject": {
                "id": subject.id,
                "name": subject.name,
                "classId": subject.class_id,
                "passMark": subject.pass_mark
            },
            "components": components,
            "students": rows
        }),
    )
}

fn handle_begin_inline(state: &mut AppState, req: &Request) -> serde_json::Value {
    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };

    if state.edit_mode != EditMode::None {
        return err(
            &req.id,
            "edit_mode_conflict",
            format!("cannot start inline edit: {} is active", state.edit_mode.describe()),
            None,
        );
    }

    state.edit_mode = EditMode::SingleRow(student_id.clone());
    ok(&req.id, json!({ "editMode": "singleRow", "studentId": student_id }))
}

fn handle_end_inline(state: &mut AppState, req: &Request) -> serde_json::Value {
    match &state.edit_mode {
        EditMode::SingleRow(_) => {
            state.edit_mode = EditMode::None;
            ok(&req.id, json!({ "editMode": "none" }))
        }
        other => err(
            &req.id,
            "edit_mode_conflict",
            format!("no inline edit to end: {} is active", other.describe()),
            None,
        ),
    }
}

/// Single-row inline edit: validates at the point of entry and persists one
/// component score immediately, re-deriving the grade row in the same call.
fn handle_update_cell(state: &mut AppState, req: &Request) -> serde_json::Value {
    let subject_id = match req.params.get("subjectId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing subjectId", None),
    };
    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };
    let component_id = match req.params.get("componentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing componentId", None),
    };

    match &state.edit_mode {
        EditMode::SingleRow(editing) if *editing == student_id => {}
        other => {
            return err(
                &req.id,
                "edit_mode_conflict",
                format!(
                    "inline edit of student {} is not active ({})",
                    student_id,
                    other.describe()
                ),
                None,
            )
        }
    }

    let score = match req.params.get("score") {
        None => return err(&req.id, "bad_params", "missing score", None),
        Some(v) if v.is_null() => None,
        Some(v) => match v.as_f64() {
            Some(s) if s.is_finite() && (0.0..=MAX_SCORE).contains(&s) => Some(s),
            Some(s) => {
                return err(
                    &req.id,
                    "invalid_score",
                    format!("score {} is outside [0, {}]", s, MAX_SCORE),
                    None,
                )
            }
            None => return err(&req.id, "bad_params", "score must be a number or null", None),
        },
    };
    let comment = req
        .params
        .get("comment")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let subject = match db::load_subject(conn, &subject_id) {
        Ok(Some(s)) => s,
        Ok(None) => return err(&req.id, "not_found", "subject not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let in_class: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM students WHERE id = ? AND class_id = ?",
            (&student_id, &subject.class_id),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if in_class.is_none() {
        return err(&req.id, "not_found", "student not found in class", None);
    }

    let component_ok: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM grade_components WHERE id = ? AND subject_id = ?",
            (&component_id, &subject_id),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if component_ok.is_none() {
        return err(&req.id, "not_found", "component not found in subject", None);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    let grade_id = match db::ensure_grade_row(&tx, &student_id, &subject_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_insert_failed", e.to_string(), None),
    };
    if let Err(e) =
        db::upsert_component_score(&tx, &grade_id, &component_id, score, comment.as_deref())
    {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    let (average, status) = match db::recompute_grade(&tx, &subject, &student_id, &grade_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
    };
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_tx_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({
            "gradeId": grade_id,
            "average": average,
            "status": status.as_str()
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grades.courseDetails" => Some(handle_course_details(state, req)),
        "grades.updateCell" => Some(handle_update_cell(state, req)),
        "editing.beginInline" => Some(handle_begin_inline(state, req)),
        "editing.endInline" => Some(handle_end_inline(state, req)),
        _ => None,
    }
}
