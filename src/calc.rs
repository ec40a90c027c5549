use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;

/// Default pass mark on the 0-10 scale.
pub const DEFAULT_PASS_MARK: f64 = 5.0;
/// Minimum attendance rate required to pass when attendance data exists.
pub const ATTENDANCE_GATE: f64 = 0.80;
/// Upper bound for a recorded component score.
pub const MAX_SCORE: f64 = 10.0;
/// Component weights for a subject must sum to 100 within this tolerance.
pub const WEIGHT_SUM_TOLERANCE: f64 = 0.01;

/// Round-half-up to 2 decimal places:
/// `Int(100*x + 0.5) / 100`
pub fn round_half_up_2(x: f64) -> f64 {
    ((100.0 * x) + 0.5).floor() / 100.0
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComponentDef {
    pub id: String,
    pub name: String,
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComponentScore {
    pub component_id: String,
    /// `None` means "not yet graded", which is distinct from a recorded 0.
    pub score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ValidationIssue {
    EmptyDefinitionSet,
    InvalidWeight { name: String, weight: f64 },
    MissingName { index: usize },
    DuplicateName { name: String },
    WeightSumMismatch { actual: f64 },
}

impl ValidationIssue {
    pub fn code(&self) -> &'static str {
        match self {
            ValidationIssue::EmptyDefinitionSet => "empty_definition_set",
            ValidationIssue::InvalidWeight { .. } => "invalid_weight",
            ValidationIssue::MissingName { .. } => "missing_name",
            ValidationIssue::DuplicateName { .. } => "duplicate_name",
            ValidationIssue::WeightSumMismatch { .. } => "weight_sum_mismatch",
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            ValidationIssue::EmptyDefinitionSet => json!({
                "code": self.code(),
                "message": "at least one grade component is required",
            }),
            ValidationIssue::InvalidWeight { name, weight } => json!({
                "code": self.code(),
                "message": format!("weight for '{}' must be in (0, 100]", name),
                "name": name,
                "weight": weight,
            }),
            ValidationIssue::MissingName { index } => json!({
                "code": self.code(),
                "message": format!("component at index {} has an empty name", index),
                "index": index,
            }),
            ValidationIssue::DuplicateName { name } => json!({
                "code": self.code(),
                "message": format!("component name '{}' is used more than once", name),
                "name": name,
            }),
            ValidationIssue::WeightSumMismatch { actual } => json!({
                "code": self.code(),
                "message": format!("component weights sum to {}, expected 100", actual),
                "actual": actual,
            }),
        }
    }
}

/// Validates a subject's component definitions as a whole set.
///
/// Collects every violation rather than stopping at the first, so callers can
/// surface the complete list. A subject's component set is all-or-nothing
/// valid; nothing is persisted from a set that fails here.
pub fn validate_components(defs: &[ComponentDef]) -> Result<(), Vec<ValidationIssue>> {
    if defs.is_empty() {
        return Err(vec![ValidationIssue::EmptyDefinitionSet]);
    }

    let mut issues: Vec<ValidationIssue> = Vec::new();
    let mut seen_names: HashMap<String, usize> = HashMap::new();

    for (i, def) in defs.iter().enumerate() {
        let trimmed = def.name.trim();
        if trimmed.is_empty() {
            issues.push(ValidationIssue::MissingName { index: i });
        } else {
            let key = trimmed.to_lowercase();
            let count = seen_names.entry(key).or_insert(0);
            *count += 1;
            if *count == 2 {
                issues.push(ValidationIssue::DuplicateName {
                    name: trimmed.to_string(),
                });
            }
        }

        if def.weight <= 0.0 || def.weight > 100.0 {
            issues.push(ValidationIssue::InvalidWeight {
                name: trimmed.to_string(),
                weight: def.weight,
            });
        }
    }

    let sum: f64 = defs.iter().map(|d| d.weight).sum();
    if (sum - 100.0).abs() > WEIGHT_SUM_TOLERANCE {
        issues.push(ValidationIssue::WeightSumMismatch {
            actual: round_half_up_2(sum),
        });
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(issues)
    }
}

/// Weighted average over the recorded component scores.
///
/// An unscored component is excluded from the aggregate; it does not count as
/// zero. When no component has a recorded score the result is `None`.
///
/// Weights are taken as percentages of the full 100%, so a partially graded
/// subject yields the weighted average of only the graded portion, not a value
/// pro-rated back up to 100%.
pub fn compute_average(defs: &[ComponentDef], scores: &[ComponentScore]) -> Option<f64> {
    let by_component: HashMap<&str, f64> = scores
        .iter()
        .filter_map(|s| s.score.map(|v| (s.component_id.as_str(), v)))
        .collect();

    let mut sum = 0.0_f64;
    let mut scored = 0_usize;
    for def in defs {
        let Some(&value) = by_component.get(def.id.as_str()) else {
            continue;
        };
        sum += value * def.weight / 100.0;
        scored += 1;
    }

    if scored == 0 {
        None
    } else {
        Some(round_half_up_2(sum))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum GradeStatus {
    Incomplete,
    Passed,
    Failed,
}

impl GradeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GradeStatus::Incomplete => "incomplete",
            GradeStatus::Passed => "passed",
            GradeStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<GradeStatus> {
        match s {
            "incomplete" => Some(GradeStatus::Incomplete),
            "passed" => Some(GradeStatus::Passed),
            "failed" => Some(GradeStatus::Failed),
            _ => None,
        }
    }
}

/// Classifies an average against the pass mark and the attendance gate.
///
/// Unknown attendance passes the gate; the gate only blocks when data exists
/// and falls below [`ATTENDANCE_GATE`]. This is the single source of truth for
/// both live previews and persisted grade rows.
pub fn classify(average: Option<f64>, pass_mark: f64, attendance_rate: Option<f64>) -> GradeStatus {
    let Some(average) = average else {
        return GradeStatus::Incomplete;
    };
    let meets_score = average >= pass_mark;
    let meets_attendance = attendance_rate.map(|r| r >= ATTENDANCE_GATE).unwrap_or(true);
    if meets_score && meets_attendance {
        GradeStatus::Passed
    } else {
        GradeStatus::Failed
    }
}
