use crate::calc::{self, ComponentDef, DEFAULT_PASS_MARK, MAX_SCORE};
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use log::info;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashSet;
use uuid::Uuid;

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }

    fn db(e: impl std::fmt::Display) -> Self {
        Self {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        }
    }
}

fn parse_pass_mark(v: &serde_json::Value) -> Result<f64, HandlerErr> {
    let Some(mark) = v.as_f64() else {
        return Err(HandlerErr {
            code: "bad_params",
            message: "passMark must be a number".to_string(),
            details: None,
        });
    };
    if !mark.is_finite() || mark < 0.0 || mark > MAX_SCORE {
        return Err(HandlerErr {
            code: "bad_params",
            message: format!("passMark must be in [0, {}]", MAX_SCORE),
            details: Some(json!({ "passMark": mark })),
        });
    }
    Ok(mark)
}

fn components_json(conn: &Connection, subject_id: &str) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id, name, weight, sort_order FROM grade_components
             WHERE subject_id = ? ORDER BY sort_order",
        )
        .map_err(HandlerErr::db)?;
    let components = stmt
        .query_map([subject_id], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let weight: f64 = row.get(2)?;
            let sort_order: i64 = row.get(3)?;
            Ok(json!({
                "id": id,
                "name": name,
                "weight": weight,
                "sortOrder": sort_order
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;
    Ok(json!(components))
}

fn recompute_subject_grades(
    conn: &Connection,
    subject: &db::SubjectRow,
) -> Result<usize, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT id, student_id FROM grades WHERE subject_id = ?")
        .map_err(HandlerErr::db)?;
    let rows = stmt
        .query_map([&subject.id], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    for (grade_id, student_id) in &rows {
        db::recompute_grade(conn, subject, student_id, grade_id).map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: Some(json!({ "gradeId": grade_id })),
        })?;
    }
    Ok(rows.len())
}

fn handle_subjects_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let class_id = match req.params.get("classId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing classId", None),
    };
    let name = match req.params.get("name").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing name", None),
    };
    let pass_mark = match req.params.get("passMark") {
        None => DEFAULT_PASS_MARK,
        Some(v) if v.is_null() => DEFAULT_PASS_MARK,
        Some(v) => match parse_pass_mark(v) {
            Ok(m) => m,
            Err(e) => return e.response(&req.id),
        },
    };

    let class_exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM classes WHERE id = ?", [&class_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if class_exists.is_none() {
        return err(&req.id, "not_found", "class not found", None);
    }

    let sort_order: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM subjects WHERE class_id = ?",
        [&class_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let subject_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO subjects(id, class_id, name, pass_mark, sort_order)
         VALUES(?, ?, ?, ?, ?)",
        (&subject_id, &class_id, &name, pass_mark, sort_order),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "subjects" })),
        );
    }

    ok(
        &req.id,
        json!({ "subjectId": subject_id, "passMark": pass_mark }),
    )
}

fn handle_subjects_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let class_id = match req.params.get("classId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing classId", None),
    };

    let mut stmt = match conn.prepare(
        "SELECT id, name, pass_mark FROM subjects WHERE class_id = ? ORDER BY sort_order",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let basics = match stmt
        .query_map([&class_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, f64>(2)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut subjects: Vec<serde_json::Value> = Vec::with_capacity(basics.len());
    for (id, name, pass_mark) in basics {
        let defs = match db::load_components(conn, &id) {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        subjects.push(json!({
            "id": id,
            "name": name,
            "passMark": pass_mark,
            "componentCount": defs.len(),
            "componentsValid": calc::validate_components(&defs).is_ok()
        }));
    }

    ok(&req.id, json!({ "subjects": subjects }))
}

fn handle_subjects_set_pass_mark(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let subject_id = match req.params.get("subjectId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing subjectId", None),
    };
    let Some(raw_mark) = req.params.get("passMark") else {
        return err(&req.id, "bad_params", "missing passMark", None);
    };
    let pass_mark = match parse_pass_mark(raw_mark) {
        Ok(m) => m,
        Err(e) => return e.response(&req.id),
    };

    if let Some(active) = state.session.as_ref() {
        if active.subject.id == subject_id {
            return err(
                &req.id,
                "edit_mode_conflict",
                "a batch session is open for this subject",
                None,
            );
        }
    }

    let subject = match db::load_subject(conn, &subject_id) {
        Ok(Some(mut s)) => {
            s.pass_mark = pass_mark;
            s
        }
        Ok(None) => return err(&req.id, "not_found", "subject not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute(
        "UPDATE subjects SET pass_mark = ? WHERE id = ?",
        (pass_mark, &subject_id),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    let recomputed = match recompute_subject_grades(&tx, &subject) {
        Ok(n) => n,
        Err(e) => return e.response(&req.id),
    };
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_tx_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({ "passMark": pass_mark, "recomputedGrades": recomputed }),
    )
}

fn handle_subjects_list_components(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let subject_id = match req.params.get("subjectId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing subjectId", None),
    };
    match db::load_subject(conn, &subject_id) {
        Ok(Some(_)) => {}
        Ok(None) => return err(&req.id, "not_found", "subject not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    match components_json(conn, &subject_id) {
        Ok(components) => ok(&req.id, json!({ "components": components })),
        Err(e) => e.response(&req.id),
    }
}

struct SubmittedComponent {
    id: Option<String>,
    name: String,
    weight: f64,
}

fn parse_submitted_components(
    params: &serde_json::Value,
) -> Result<Vec<SubmittedComponent>, HandlerErr> {
    let Some(arr) = params.get("components").and_then(|v| v.as_array()) else {
        return Err(HandlerErr {
            code: "bad_params",
            message: "missing components[]".to_string(),
            details: None,
        });
    };

    let mut out = Vec::with_capacity(arr.len());
    for (i, entry) in arr.iter().enumerate() {
        let Some(obj) = entry.as_object() else {
            return Err(HandlerErr {
                code: "bad_params",
                message: format!("component at index {} must be an object", i),
                details: None,
            });
        };
        let id = match obj.get("id") {
            None => None,
            Some(v) if v.is_null() => None,
            Some(v) => match v.as_str() {
                Some(s) => Some(s.to_string()),
                None => {
                    return Err(HandlerErr {
                        code: "bad_params",
                        message: format!("component at index {} has a non-string id", i),
                        details: None,
                    })
                }
            },
        };
        let name = obj
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let Some(weight) = obj.get("weight").and_then(|v| v.as_f64()) else {
            return Err(HandlerErr {
                code: "bad_params",
                message: format!("component at index {} needs a numeric weight", i),
                details: None,
            });
        };
        out.push(SubmittedComponent { id, name, weight });
    }
    Ok(out)
}

/// Replaces a subject's component set. The set is all-or-nothing: every
/// violation is collected and returned before anything is persisted, and a
/// definition that already has recorded scores cannot be removed.
fn handle_subjects_save_components(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let subject_id = match req.params.get("subjectId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing subjectId", None),
    };

    if let Some(active) = state.session.as_ref() {
        if active.subject.id == subject_id {
            return err(
                &req.id,
                "edit_mode_conflict",
                "a batch session is open for this subject",
                None,
            );
        }
    }

    let subject = match db::load_subject(conn, &subject_id) {
        Ok(Some(s)) => s,
        Ok(None) => return err(&req.id, "not_found", "subject not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let submitted = match parse_submitted_components(&req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    // Assign ids up front so the validated set matches what gets stored.
    let defs: Vec<ComponentDef> = submitted
        .iter()
        .map(|c| ComponentDef {
            id: c
                .id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            name: c.name.clone(),
            weight: c.weight,
        })
        .collect();

    if let Err(issues) = calc::validate_components(&defs) {
        let rendered: Vec<serde_json::Value> = issues.iter().map(|i| i.to_json()).collect();
        return err(
            &req.id,
            "invalid_components",
            "component definitions failed validation",
            Some(json!({ "issues": rendered })),
        );
    }

    let existing = match db::load_components(conn, &subject_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let existing_ids: HashSet<&str> = existing.iter().map(|d| d.id.as_str()).collect();

    for c in &submitted {
        if let Some(id) = &c.id {
            if !existing_ids.contains(id.as_str()) {
                return err(
                    &req.id,
                    "not_found",
                    format!("component {} does not belong to this subject", id),
                    None,
                );
            }
        }
    }

    let submitted_ids: HashSet<&str> = submitted
        .iter()
        .filter_map(|c| c.id.as_deref())
        .collect();
    let removed: Vec<&ComponentDef> = existing
        .iter()
        .filter(|d| !submitted_ids.contains(d.id.as_str()))
        .collect();

    // Renaming is allowed; removing a component that has recorded scores is not.
    for gone in &removed {
        let graded: Option<i64> = match conn
            .query_row(
                "SELECT 1 FROM grade_component_scores
                 WHERE component_id = ? AND score IS NOT NULL
                 LIMIT 1",
                [&gone.id],
                |r| r.get(0),
            )
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        if graded.is_some() {
            return err(
                &req.id,
                "component_in_use",
                format!("component '{}' has recorded scores", gone.name),
                Some(json!({ "componentId": gone.id })),
            );
        }
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    for gone in &removed {
        if let Err(e) = tx.execute(
            "DELETE FROM grade_component_scores WHERE component_id = ?",
            [&gone.id],
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
        if let Err(e) = tx.execute("DELETE FROM grade_components WHERE id = ?", [&gone.id]) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }

    for (i, (c, def)) in submitted.iter().zip(defs.iter()).enumerate() {
        let name = def.name.trim();
        let result = if c.id.is_some() {
            tx.execute(
                "UPDATE grade_components SET name = ?, weight = ?, sort_order = ? WHERE id = ?",
                (name, def.weight, i as i64, &def.id),
            )
        } else {
            tx.execute(
                "INSERT INTO grade_components(id, subject_id, name, weight, sort_order)
                 VALUES(?, ?, ?, ?, ?)",
                (&def.id, &subject_id, name, def.weight, i as i64),
            )
        };
        if let Err(e) = result {
            return err(
                &req.id,
                "db_update_failed",
                e.to_string(),
                Some(json!({ "table": "grade_components" })),
            );
        }
    }

    // Weights changed, so every stored average for the subject is stale.
    let recomputed = match recompute_subject_grades(&tx, &subject) {
        Ok(n) => n,
        Err(e) => return e.response(&req.id),
    };

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_tx_failed", e.to_string(), None);
    }

    info!(
        "subject {}: component set saved ({} components, {} removed, {} grades recomputed)",
        subject_id,
        submitted.len(),
        removed.len(),
        recomputed
    );

    match components_json(conn, &subject_id) {
        Ok(components) => ok(
            &req.id,
            json!({ "components": components, "recomputedGrades": recomputed }),
        ),
        Err(e) => e.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "subjects.create" => Some(handle_subjects_create(state, req)),
        "subjects.list" => Some(handle_subjects_list(state, req)),
        "subjects.setPassMark" => Some(handle_subjects_set_pass_mark(state, req)),
        "subjects.listComponents" => Some(handle_subjects_list_components(state, req)),
        "subjects.saveComponents" => Some(handle_subjects_save_components(state, req)),
        _ => None,
    }
}
