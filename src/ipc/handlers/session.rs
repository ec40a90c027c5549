use crate::calc;
use crate::db::{self, SqlitePersistPort};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{ActiveSession, AppState, Request};
use crate::session::{commit_session, EditMode, EditSession, SessionError, StudentSnapshot};
use log::info;
use serde_json::json;
use std::collections::HashMap;

fn session_err(id: &str, e: &SessionError) -> serde_json::Value {
    err(id, e.code(), e.message(), None)
}

fn handle_session_begin(state: &mut AppState, req: &Request) -> serde_json::Value {
    let subject_id = match req.params.get("subjectId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing subjectId", None),
    };

    if state.edit_mode != EditMode::None {
        return err(
            &req.id,
            "edit_mode_conflict",
            format!(
                "cannot start a batch session: {} is active",
                state.edit_mode.describe()
            ),
            None,
        );
    }

    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
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

    // A subject is only usable for grading once its component set validates.
    if let Err(issues) = calc::validate_components(&defs) {
        let rendered: Vec<serde_json::Value> = issues.iter().map(|i| i.to_json()).collect();
        return err(
            &req.id,
            "invalid_components",
            "subject component definitions are not valid for grading",
            Some(json!({ "issues": rendered })),
        );
    }

    let mut roster_stmt = match conn.prepare(
        "SELECT id FROM students WHERE class_id = ? AND active = 1 ORDER BY sort_order",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let roster = match roster_stmt
        .query_map([&subject.class_id], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    // Snapshot server truth per student, creating grade rows on first use so
    // every snapshot carries a stable grade id for commit.
    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    let mut original: HashMap<String, StudentSnapshot> = HashMap::new();
    for student_id in &roster {
        let grade_id = match db::ensure_grade_row(&tx, student_id, &subject_id) {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_insert_failed", e.to_string(), None),
        };
        let scores = match db::load_scores_for_grade(&tx, &grade_id) {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        original.insert(student_id.clone(), StudentSnapshot { grade_id, scores });
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_tx_failed", e.to_string(), None);
    }

    let student_count = original.len();
    let component_count = defs.len();
    info!(
        "batch session opened for subject {} ({} students)",
        subject_id, student_count
    );

    state.session = Some(ActiveSession {
        subject,
        session: EditSession::new(defs, original),
    });
    state.edit_mode = EditMode::Batch;

    ok(
        &req.id,
        json!({
            "subjectId": subject_id,
            "studentCount": student_count,
            "componentCount": component_count
        }),
    )
}

fn handle_session_set_value(state: &mut AppState, req: &Request) -> serde_json::Value {
    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };
    let component_id = match req.params.get("componentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing componentId", None),
    };
    let value = match req.params.get("value") {
        None => return err(&req.id, "bad_params", "missing value (use null to clear)", None),
        Some(v) if v.is_null() => None,
        Some(v) => match v.as_f64() {
            Some(n) => Some(n),
            None => return err(&req.id, "bad_params", "value must be a number or null", None),
        },
    };

    let Some(active) = state.session.as_mut() else {
        return err(&req.id, "edit_mode_conflict", "no batch session is active", None);
    };

    match active.session.set_value(&student_id, &component_id, value) {
        Ok(()) => ok(
            &req.id,
            json!({ "pendingCount": active.session.pending_count() }),
        ),
        Err(e) => session_err(&req.id, &e),
    }
}

fn handle_session_live_average(state: &mut AppState, req: &Request) -> serde_json::Value {
    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };

    let Some(active) = state.session.as_ref() else {
        return err(&req.id, "edit_mode_conflict", "no batch session is active", None);
    };

    match active.session.live_average(&student_id) {
        Ok(average) => ok(&req.id, json!({ "average": average })),
        Err(e) => session_err(&req.id, &e),
    }
}

fn handle_session_live_status(state: &mut AppState, req: &Request) -> serde_json::Value {
    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };

    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(active) = state.session.as_ref() else {
        return err(&req.id, "edit_mode_conflict", "no batch session is active", None);
    };

    let rate = match db::attendance_rate(conn, &active.subject.class_id, &student_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let average = match active.session.live_average(&student_id) {
        Ok(v) => v,
        Err(e) => return session_err(&req.id, &e),
    };
    let status = match active
        .session
        .live_status(&student_id, active.subject.pass_mark, rate)
    {
        Ok(v) => v,
        Err(e) => return session_err(&req.id, &e),
    };

    ok(
        &req.id,
        json!({
            "average": average,
            "status": status.as_str(),
            "attendanceRate": rate
        }),
    )
}

fn handle_session_discard(state: &mut AppState, req: &Request) -> serde_json::Value {
    let confirm = req
        .params
        .get("confirm")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let Some(active) = state.session.as_mut() else {
        return err(&req.id, "edit_mode_conflict", "no batch session is active", None);
    };

    let pending = active.session.pending_count();
    if let Err(e) = active.session.discard(confirm) {
        return err(
            &req.id,
            e.code(),
            e.message(),
            Some(json!({ "pendingCount": pending })),
        );
    }

    state.session = None;
    state.edit_mode = EditMode::None;
    ok(&req.id, json!({ "discarded": true, "droppedEdits": pending }))
}

fn handle_session_commit(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(active) = state.session.as_ref() else {
        return err(&req.id, "edit_mode_conflict", "no batch session is active", None);
    };

    let mut port = SqlitePersistPort::new(conn, active.subject.clone());
    let result = commit_session(&active.session, &mut port);

    let errors: Vec<serde_json::Value> = result
        .per_student_errors
        .iter()
        .map(|e| {
            json!({
                "studentId": e.student_id,
                "code": e.error.code,
                "message": e.error.message
            })
        })
        .collect();

    // The session is flushed either way; after a partial failure the caller
    // re-fetches canonical state instead of trusting the local snapshot.
    state.session = None;
    state.edit_mode = EditMode::None;

    ok(
        &req.id,
        json!({
            "successCount": result.success_count,
            "failCount": result.fail_count,
            "errors": errors
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "session.begin" => Some(handle_session_begin(state, req)),
        "session.setValue" => Some(handle_session_set_value(state, req)),
        "session.liveAverage" => Some(handle_session_live_average(state, req)),
        "session.liveStatus" => Some(handle_session_live_status(state, req)),
        "session.discard" => Some(handle_session_discard(state, req)),
        "session.commit" => Some(handle_session_commit(state, req)),
        _ => None,
    }
}
