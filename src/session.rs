use crate::calc::{self, ComponentDef, ComponentScore, GradeStatus, MAX_SCORE};
use log::{info, warn};
use std::collections::HashMap;

/// Which editing surface currently owns score entry. Batch sessions and
/// single-row inline edits are mutually exclusive so the same field can never
/// be submitted through both paths at once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditMode {
    None,
    SingleRow(String),
    Batch,
}

impl EditMode {
    pub fn describe(&self) -> String {
        match self {
            EditMode::None => "none".to_string(),
            EditMode::SingleRow(student_id) => format!("inline edit of student {}", student_id),
            EditMode::Batch => "batch session".to_string(),
        }
    }
}

/// A staged value for one `(student, component)` cell. `Cleared` is an explicit
/// "remove this score" marker; an untouched cell has no entry at all.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PendingValue {
    Set(f64),
    Cleared,
}

/// Server truth for one student at session start.
#[derive(Debug, Clone)]
pub struct StudentSnapshot {
    pub grade_id: String,
    pub scores: Vec<ComponentScore>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionError {
    UnknownStudent { student_id: String },
    UnknownComponent { component_id: String },
    ScoreOutOfRange { value: f64 },
    DiscardNeedsConfirm,
}

impl SessionError {
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::UnknownStudent { .. } => "not_found",
            SessionError::UnknownComponent { .. } => "not_found",
            SessionError::ScoreOutOfRange { .. } => "invalid_score",
            SessionError::DiscardNeedsConfirm => "discard_needs_confirm",
        }
    }

    pub fn message(&self) -> String {
        match self {
            SessionError::UnknownStudent { student_id } => {
                format!("student {} is not part of this session", student_id)
            }
            SessionError::UnknownComponent { component_id } => {
                format!("component {} is not part of this session", component_id)
            }
            SessionError::ScoreOutOfRange { value } => {
                format!("score {} is outside [0, {}]", value, MAX_SCORE)
            }
            SessionError::DiscardNeedsConfirm => {
                "session has pending edits; discard requires confirmation".to_string()
            }
        }
    }
}

/// In-memory staging area for edits across many students and components.
///
/// Pending edits are keyed by `(student_id, component_id)` so one student's
/// in-progress value can never alias another row's identically-named field.
/// Nothing here touches the server; the snapshot taken at session start stays
/// fixed until commit or discard.
pub struct EditSession {
    defs: Vec<ComponentDef>,
    original: HashMap<String, StudentSnapshot>,
    pending: HashMap<(String, String), PendingValue>,
}

impl EditSession {
    pub fn new(defs: Vec<ComponentDef>, original: HashMap<String, StudentSnapshot>) -> Self {
        Self {
            defs,
            original,
            pending: HashMap::new(),
        }
    }

    pub fn is_dirty(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Stages one cell edit. `None` records an explicit Cleared marker.
    /// Values outside `[0, MAX_SCORE]` are rejected before they ever enter
    /// the pending map.
    pub fn set_value(
        &mut self,
        student_id: &str,
        component_id: &str,
        value: Option<f64>,
    ) -> Result<(), SessionError> {
        if !self.original.contains_key(student_id) {
            return Err(SessionError::UnknownStudent {
                student_id: student_id.to_string(),
            });
        }
        if !self.defs.iter().any(|d| d.id == component_id) {
            return Err(SessionError::UnknownComponent {
                component_id: component_id.to_string(),
            });
        }

        let staged = match value {
            Some(v) => {
                if !v.is_finite() || v < 0.0 || v > MAX_SCORE {
                    return Err(SessionError::ScoreOutOfRange { value: v });
                }
                PendingValue::Set(v)
            }
            None => PendingValue::Cleared,
        };
        self.pending
            .insert((student_id.to_string(), component_id.to_string()), staged);
        Ok(())
    }

    /// Pending edits merged over the original snapshot for one student.
    /// Cleared cells drop out of the merged view entirely.
    pub fn merged_scores(&self, student_id: &str) -> Result<Vec<ComponentScore>, SessionError> {
        let snapshot = self
            .original
            .get(student_id)
            .ok_or_else(|| SessionError::UnknownStudent {
                student_id: student_id.to_string(),
            })?;

        let mut by_component: HashMap<&str, Option<f64>> = snapshot
            .scores
            .iter()
            .map(|s| (s.component_id.as_str(), s.score))
            .collect();
        for ((sid, cid), staged) in &self.pending {
            if sid != student_id {
                continue;
            }
            let merged = match staged {
                PendingValue::Set(v) => Some(*v),
                PendingValue::Cleared => None,
            };
            by_component.insert(cid.as_str(), merged);
        }

        Ok(self
            .defs
            .iter()
            .filter_map(|d| {
                by_component.get(d.id.as_str()).map(|score| ComponentScore {
                    component_id: d.id.clone(),
                    score: *score,
                })
            })
            .collect())
    }

    /// Running average for one student as the operator types.
    pub fn live_average(&self, student_id: &str) -> Result<Option<f64>, SessionError> {
        let merged = self.merged_scores(student_id)?;
        Ok(calc::compute_average(&self.defs, &merged))
    }

    pub fn live_status(
        &self,
        student_id: &str,
        pass_mark: f64,
        attendance_rate: Option<f64>,
    ) -> Result<GradeStatus, SessionError> {
        let average = self.live_average(student_id)?;
        Ok(calc::classify(average, pass_mark, attendance_rate))
    }

    /// Drops all pending edits. A dirty session refuses to discard unless the
    /// caller confirms, so the UI can show a data-loss warning first.
    pub fn discard(&mut self, confirm: bool) -> Result<(), SessionError> {
        if self.is_dirty() && !confirm {
            return Err(SessionError::DiscardNeedsConfirm);
        }
        self.pending.clear();
        Ok(())
    }

    /// Per-student change sets for commit, in stable student order.
    ///
    /// Only explicitly Set values are submitted. A Cleared cell is skipped: it
    /// never turns into `score = 0`, and the prior server value stands. A
    /// student whose only pending entries are Cleared therefore produces no
    /// change set at all.
    pub fn change_sets(&self) -> Vec<StudentChangeSet> {
        let mut by_student: HashMap<&str, Vec<ComponentChange>> = HashMap::new();
        for ((sid, cid), staged) in &self.pending {
            let PendingValue::Set(value) = staged else {
                continue;
            };
            by_student
                .entry(sid.as_str())
                .or_default()
                .push(ComponentChange {
                    component_id: cid.clone(),
                    score: *value,
                });
        }

        let mut sets: Vec<StudentChangeSet> = by_student
            .into_iter()
            .filter_map(|(sid, mut changes)| {
                let snapshot = self.original.get(sid)?;
                changes.sort_by(|a, b| a.component_id.cmp(&b.component_id));
                Some(StudentChangeSet {
                    student_id: sid.to_string(),
                    grade_id: snapshot.grade_id.clone(),
                    changes,
                })
            })
            .collect();
        sets.sort_by(|a, b| a.student_id.cmp(&b.student_id));
        sets
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComponentChange {
    pub component_id: String,
    pub score: f64,
}

#[derive(Debug, Clone)]
pub struct StudentChangeSet {
    pub student_id: String,
    pub grade_id: String,
    pub changes: Vec<ComponentChange>,
}

/// Error surfaced by a persistence backend for one student's save.
#[derive(Debug, Clone, PartialEq)]
pub struct PortError {
    pub code: String,
    pub message: String,
}

impl PortError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

/// Persistence backend for batch commits. Each call saves one student's
/// change set and is expected to be idempotent per call.
pub trait PersistPort {
    fn save_components(
        &mut self,
        student_id: &str,
        grade_id: &str,
        changes: &[ComponentChange],
    ) -> Result<(), PortError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct StudentSaveError {
    pub student_id: String,
    pub error: PortError,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchResult {
    pub success_count: usize,
    pub fail_count: usize,
    pub per_student_errors: Vec<StudentSaveError>,
}

/// Flushes a session against the persistence backend, one student at a time.
///
/// One student's failure never aborts the remaining students; there is no
/// cross-student transaction and successes are not rolled back. After a
/// partial failure the caller must re-fetch canonical state rather than trust
/// the local snapshot.
pub fn commit_session(session: &EditSession, port: &mut dyn PersistPort) -> BatchResult {
    let change_sets = session.change_sets();
    let mut success_count = 0_usize;
    let mut per_student_errors: Vec<StudentSaveError> = Vec::new();

    for set in &change_sets {
        match port.save_components(&set.student_id, &set.grade_id, &set.changes) {
            Ok(()) => success_count += 1,
            Err(error) => {
                warn!(
                    "batch commit: save failed for student {}: {} ({})",
                    set.student_id, error.message, error.code
                );
                per_student_errors.push(StudentSaveError {
                    student_id: set.student_id.clone(),
                    error,
                });
            }
        }
    }

    let fail_count = per_student_errors.len();
    info!(
        "batch commit: {} students saved, {} failed, {} staged edits",
        success_count,
        fail_count,
        session.pending_count()
    );

    BatchResult {
        success_count,
        fail_count,
        per_student_errors,
    }
}
