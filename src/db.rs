use crate::calc::{self, ComponentDef, ComponentScore, GradeStatus};
use crate::session::{ComponentChange, PersistPort, PortError};
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use uuid::Uuid;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("gradebook.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            active INTEGER NOT NULL,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class_sort ON students(class_id, sort_order)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            name TEXT NOT NULL,
            pass_mark REAL NOT NULL DEFAULT 5.0,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_subjects_class ON subjects(class_id)",
        [],
    )?;

    conn.execute(
        // Name uniqueness (trimmed, case-insensitive) is enforced by the
        // component validator, not a DB constraint; a constraint here would
        // reject transient states while a rename swaps two names.
        "CREATE TABLE IF NOT EXISTS grade_components(
            id TEXT PRIMARY KEY,
            subject_id TEXT NOT NULL,
            name TEXT NOT NULL,
            weight REAL NOT NULL,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(subject_id) REFERENCES subjects(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grade_components_subject ON grade_components(subject_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grades(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            average REAL,
            status TEXT NOT NULL DEFAULT 'incomplete',
            updated_at TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            UNIQUE(student_id, subject_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_subject ON grades(subject_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grade_component_scores(
            id TEXT PRIMARY KEY,
            grade_id TEXT NOT NULL,
            component_id TEXT NOT NULL,
            score REAL,
            comment TEXT,
            FOREIGN KEY(grade_id) REFERENCES grades(id),
            FOREIGN KEY(component_id) REFERENCES grade_components(id),
            UNIQUE(grade_id, component_id)
        )",
        [],
    )?;
    ensure_grade_component_scores_comment(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grade_component_scores_grade
         ON grade_component_scores(grade_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grade_component_scores_component
         ON grade_component_scores(component_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance_rates(
            class_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            rate REAL NOT NULL,
            PRIMARY KEY(class_id, student_id),
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;

    Ok(conn)
}

fn ensure_grade_component_scores_comment(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "grade_component_scores", "comment")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE grade_component_scores ADD COLUMN comment TEXT",
        [],
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

#[derive(Debug, Clone)]
pub struct SubjectRow {
    pub id: String,
    pub class_id: String,
    pub name: String,
    pub pass_mark: f64,
}

pub fn load_subject(conn: &Connection, subject_id: &str) -> anyhow::Result<Option<SubjectRow>> {
    let row = conn
        .query_row(
            "SELECT id, class_id, name, pass_mark FROM subjects WHERE id = ?",
            [subject_id],
            |r| {
                Ok(SubjectRow {
                    id: r.get(0)?,
                    class_id: r.get(1)?,
                    name: r.get(2)?,
                    pass_mark: r.get(3)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

pub fn load_components(conn: &Connection, subject_id: &str) -> anyhow::Result<Vec<ComponentDef>> {
    let mut stmt = conn.prepare(
        "SELECT id, name, weight FROM grade_components
         WHERE subject_id = ? ORDER BY sort_order",
    )?;
    let defs = stmt
        .query_map([subject_id], |r| {
            Ok(ComponentDef {
                id: r.get(0)?,
                name: r.get(1)?,
                weight: r.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(defs)
}

pub fn attendance_rate(
    conn: &Connection,
    class_id: &str,
    student_id: &str,
) -> anyhow::Result<Option<f64>> {
    let rate = conn
        .query_row(
            "SELECT rate FROM attendance_rates WHERE class_id = ? AND student_id = ?",
            (class_id, student_id),
            |r| r.get::<_, f64>(0),
        )
        .optional()?;
    Ok(rate)
}

pub fn load_scores_for_grade(
    conn: &Connection,
    grade_id: &str,
) -> anyhow::Result<Vec<ComponentScore>> {
    let mut stmt = conn.prepare(
        "SELECT component_id, score FROM grade_component_scores WHERE grade_id = ?",
    )?;
    let scores = stmt
        .query_map([grade_id], |r| {
            Ok(ComponentScore {
                component_id: r.get(0)?,
                score: r.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(scores)
}

/// Returns the grade row id for (student, subject), creating an empty
/// `incomplete` row on first use.
pub fn ensure_grade_row(
    conn: &Connection,
    student_id: &str,
    subject_id: &str,
) -> anyhow::Result<String> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM grades WHERE student_id = ? AND subject_id = ?",
            (student_id, subject_id),
            |r| r.get(0),
        )
        .optional()?;
    if let Some(id) = existing {
        return Ok(id);
    }

    let grade_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO grades(id, student_id, subject_id, average, status)
         VALUES(?, ?, ?, NULL, 'incomplete')",
        (&grade_id, student_id, subject_id),
    )?;
    Ok(grade_id)
}

/// Re-derives `grades.average`/`status` from the stored component scores.
/// Grade rows are never hand-edited; this is the only writer.
pub fn recompute_grade(
    conn: &Connection,
    subject: &SubjectRow,
    student_id: &str,
    grade_id: &str,
) -> anyhow::Result<(Option<f64>, GradeStatus)> {
    let defs = load_components(conn, &subject.id)?;
    let scores = load_scores_for_grade(conn, grade_id)?;
    let rate = attendance_rate(conn, &subject.class_id, student_id)?;

    let average = calc::compute_average(&defs, &scores);
    let status = calc::classify(average, subject.pass_mark, rate);
    conn.execute(
        "UPDATE grades SET average = ?, status = ?, updated_at = ? WHERE id = ?",
        (
            average,
            status.as_str(),
            chrono::Utc::now().to_rfc3339(),
            grade_id,
        ),
    )?;
    Ok((average, status))
}

pub fn upsert_component_score(
    conn: &Connection,
    grade_id: &str,
    component_id: &str,
    score: Option<f64>,
    comment: Option<&str>,
) -> anyhow::Result<()> {
    let score_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO grade_component_scores(id, grade_id, component_id, score, comment)
         VALUES(?, ?, ?, ?, ?)
         ON CONFLICT(grade_id, component_id) DO UPDATE SET
           score = excluded.score,
           comment = COALESCE(excluded.comment, grade_component_scores.comment)",
        (&score_id, grade_id, component_id, score, comment),
    )?;
    Ok(())
}

/// Batch-commit backend over the workspace database.
///
/// Each student's save runs in its own transaction and re-derives the grade
/// row before committing. There is no version token on grade writes; when two
/// operators edit the same student, the last successful save wins silently.
pub struct SqlitePersistPort<'a> {
    conn: &'a Connection,
    subject: SubjectRow,
}

impl<'a> SqlitePersistPort<'a> {
    pub fn new(conn: &'a Connection, subject: SubjectRow) -> Self {
        Self { conn, subject }
    }
}

impl PersistPort for SqlitePersistPort<'_> {
    fn save_components(
        &mut self,
        student_id: &str,
        grade_id: &str,
        changes: &[ComponentChange],
    ) -> Result<(), PortError> {
        let owner: Option<(String, String)> = self
            .conn
            .query_row(
                "SELECT student_id, subject_id FROM grades WHERE id = ?",
                [grade_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()
            .map_err(|e| PortError::new("db_query_failed", e.to_string()))?;
        let Some((owner_student, owner_subject)) = owner else {
            return Err(PortError::new("not_found", "grade row no longer exists"));
        };
        if owner_student != student_id || owner_subject != self.subject.id {
            return Err(PortError::new(
                "grade_mismatch",
                "grade row does not belong to this student and subject",
            ));
        }

        let tx = self
            .conn
            .unchecked_transaction()
            .map_err(|e| PortError::new("db_tx_failed", e.to_string()))?;
        for change in changes {
            upsert_component_score(&tx, grade_id, &change.component_id, Some(change.score), None)
                .map_err(|e| PortError::new("db_update_failed", e.to_string()))?;
        }
        recompute_grade(&tx, &self.subject, student_id, grade_id)
            .map_err(|e| PortError::new("db_update_failed", e.to_string()))?;
        tx.commit()
            .map_err(|e| PortError::new("db_tx_failed", e.to_string()))?;
        Ok(())
    }
}
