use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;

fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| format!("missing {}", key))
}

fn handle_attendance_get_rate(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let class_id = match get_required_str(&req.params, "classId") {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", m, None),
    };
    let student_id = match get_required_str(&req.params, "studentId") {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", m, None),
    };

    match db::attendance_rate(conn, &class_id, &student_id) {
        Ok(rate) => ok(&req.id, json!({ "rate": rate })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_attendance_set_rate(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let class_id = match get_required_str(&req.params, "classId") {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", m, None),
    };
    let student_id = match get_required_str(&req.params, "studentId") {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", m, None),
    };

    let rate = match req.params.get("rate") {
        None => return err(&req.id, "bad_params", "missing rate", None),
        Some(v) if v.is_null() => None,
        Some(v) => match v.as_f64() {
            Some(r) if r.is_finite() && (0.0..=1.0).contains(&r) => Some(r),
            _ => {
                return err(
                    &req.id,
                    "bad_params",
                    "rate must be in [0, 1] or null",
                    Some(json!({ "rate": v.clone() })),
                )
            }
        },
    };

    let student_exists: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM students WHERE id = ? AND class_id = ?",
            (&student_id, &class_id),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if student_exists.is_none() {
        return err(&req.id, "not_found", "student not found in class", None);
    }

    let write = match rate {
        Some(r) => conn.execute(
            "INSERT INTO attendance_rates(class_id, student_id, rate)
             VALUES(?, ?, ?)
             ON CONFLICT(class_id, student_id) DO UPDATE SET rate = excluded.rate",
            (&class_id, &student_id, r),
        ),
        None => conn.execute(
            "DELETE FROM attendance_rates WHERE class_id = ? AND student_id = ?",
            (&class_id, &student_id),
        ),
    };
    if let Err(e) = write {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    // The attendance gate feeds every persisted status for this student, so
    // stored grades in the class are stale until re-derived.
    let grade_rows: Vec<(String, String)> = {
        let mut stmt = match conn.prepare(
            "SELECT g.id, g.subject_id FROM grades g
             JOIN subjects s ON s.id = g.subject_id
             WHERE g.student_id = ? AND s.class_id = ?",
        ) {
            Ok(s) => s,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        match stmt
            .query_map((&student_id, &class_id), |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    };

    for (grade_id, subject_id) in &grade_rows {
        let subject = match db::load_subject(conn, subject_id) {
            Ok(Some(s)) => s,
            Ok(None) => continue,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        if let Err(e) = db::recompute_grade(conn, &subject, &student_id, grade_id) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }

    ok(
        &req.id,
        json!({ "rate": rate, "recomputedGrades": grade_rows.len() }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attendance.getRate" => Some(handle_attendance_get_rate(state, req)),
        "attendance.setRate" => Some(handle_attendance_set_rate(state, req)),
        _ => None,
    }
}
