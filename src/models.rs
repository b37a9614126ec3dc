use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::PassThresholds;
use crate::error::ValidationError;

pub type StudentId = i64;

pub const MIN_GRADE: f64 = 0.0;
pub const MAX_GRADE: f64 = 10.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudentSummary {
    pub id: StudentId,
    pub name: String,
    pub age: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Student {
    pub id: StudentId,
    pub name: String,
    pub age: u32,
    #[serde(default)]
    pub grades: Vec<f64>,
    /// One entry per recorded session, `true` when present.
    #[serde(default)]
    pub attendance: Vec<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StudentStatus {
    Passed,
    Failed,
}

impl Student {
    pub fn new(id: StudentId, name: impl Into<String>, age: u32) -> Self {
        Self {
            id,
            name: name.into(),
            age,
            grades: Vec::new(),
            attendance: Vec::new(),
        }
    }

    pub fn mean_grade(&self) -> Option<f64> {
        if self.grades.is_empty() {
            return None;
        }
        Some(self.grades.iter().sum::<f64>() / self.grades.len() as f64)
    }

    /// Percentage of sessions attended.
    pub fn attendance_rate(&self) -> f64 {
        if self.attendance.is_empty() {
            return 0.0;
        }
        let present = self.attendance.iter().filter(|present| **present).count();
        present as f64 * 100.0 / self.attendance.len() as f64
    }

    /// Ungraded students always fail.
    pub fn status(&self, thresholds: &PassThresholds) -> StudentStatus {
        match self.mean_grade() {
            Some(mean)
                if mean >= thresholds.min_mean_grade
                    && self.attendance_rate() >= thresholds.min_attendance_rate =>
            {
                StudentStatus::Passed
            }
            _ => StudentStatus::Failed,
        }
    }

    pub fn summary(&self) -> StudentSummary {
        StudentSummary {
            id: self.id,
            name: self.name.clone(),
            age: self.age,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::EmptyName);
        }
        for grade in &self.grades {
            validate_grade(*grade)?;
        }
        Ok(())
    }
}

pub fn validate_grade(grade: f64) -> Result<(), ValidationError> {
    if !(MIN_GRADE..=MAX_GRADE).contains(&grade) {
        return Err(ValidationError::GradeOutOfRange(grade));
    }
    Ok(())
}

/// Equality ignores `fetched_at`.
#[derive(Debug, Clone)]
pub struct RosterSnapshot<T> {
    entries: Arc<[T]>,
    fetched_at: DateTime<Utc>,
}

impl<T> RosterSnapshot<T> {
    pub fn new(entries: Vec<T>) -> Self {
        Self {
            entries: entries.into(),
            fetched_at: Utc::now(),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn entries(&self) -> &[T] {
        &self.entries
    }

    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T: Clone> RosterSnapshot<T> {
    pub fn to_vec(&self) -> Vec<T> {
        self.entries.to_vec()
    }
}

impl<T> Default for RosterSnapshot<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T: PartialEq> PartialEq for RosterSnapshot<T> {
    fn eq(&self, other: &Self) -> bool {
        self.entries[..] == other.entries[..]
    }
}

impl<T> From<Vec<T>> for RosterSnapshot<T> {
    fn from(entries: Vec<T>) -> Self {
        Self::new(entries)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatisticsResult {
    /// `None` when no student has a grade.
    pub mean_grade_overall: Option<f64>,
    pub student_with_max_mean: Option<Student>,
    pub student_with_min_mean: Option<Student>,
    /// `None` for an empty roster.
    pub mean_age: Option<f64>,
    pub passed: Vec<Student>,
    pub failed: Vec<Student>,
}

impl StatisticsResult {
    pub fn student_count(&self) -> usize {
        self.passed.len() + self.failed.len()
    }

    pub fn max_label(&self) -> String {
        extremal_label(self.student_with_max_mean.as_ref())
    }

    pub fn min_label(&self) -> String {
        extremal_label(self.student_with_min_mean.as_ref())
    }
}

fn extremal_label(student: Option<&Student>) -> String {
    match student.and_then(|s| s.mean_grade().map(|mean| (s, mean))) {
        Some((student, mean)) => format!("{} ({:.2})", student.name, mean),
        None => "none".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn student(grades: &[f64], attendance: &[bool]) -> Student {
        Student {
            id: 1,
            name: "Ana".to_string(),
            age: 20,
            grades: grades.to_vec(),
            attendance: attendance.to_vec(),
        }
    }

    #[test]
    fn mean_grade_is_none_without_grades() {
        assert_eq!(student(&[], &[]).mean_grade(), None);
        assert_eq!(student(&[7.0, 8.0], &[]).mean_grade(), Some(7.5));
    }

    #[test]
    fn attendance_rate_is_a_percentage() {
        assert_eq!(student(&[], &[]).attendance_rate(), 0.0);
        assert_eq!(student(&[], &[true, true, false, true]).attendance_rate(), 75.0);
    }

    #[test]
    fn status_requires_grade_and_attendance() {
        let thresholds = PassThresholds::default();
        assert_eq!(
            student(&[6.0], &[true, true, true, false]).status(&thresholds),
            StudentStatus::Passed
        );
        assert_eq!(
            student(&[9.0], &[true, false]).status(&thresholds),
            StudentStatus::Failed
        );
        assert_eq!(
            student(&[5.9], &[true]).status(&thresholds),
            StudentStatus::Failed
        );
        assert_eq!(student(&[], &[true]).status(&thresholds), StudentStatus::Failed);
    }

    #[test]
    fn validation_rejects_bad_fields() {
        let mut record = student(&[10.0, 0.0], &[]);
        assert!(record.validate().is_ok());
        record.grades.push(10.5);
        assert_eq!(
            record.validate(),
            Err(ValidationError::GradeOutOfRange(10.5))
        );
        record.grades.clear();
        record.name = "  ".to_string();
        assert_eq!(record.validate(), Err(ValidationError::EmptyName));
    }

    #[test]
    fn snapshots_compare_by_content_only() {
        let first = RosterSnapshot::new(vec![student(&[7.0], &[true])]);
        let second = RosterSnapshot::new(vec![student(&[7.0], &[true])]);
        assert_eq!(first, second);
        assert_ne!(first, RosterSnapshot::new(vec![student(&[7.5], &[true])]));
    }

    #[test]
    fn labels_show_name_and_mean() {
        let result = StatisticsResult {
            mean_grade_overall: Some(8.5),
            student_with_max_mean: Some(student(&[8.0, 9.0], &[])),
            student_with_min_mean: None,
            mean_age: Some(20.0),
            passed: Vec::new(),
            failed: Vec::new(),
        };
        assert_eq!(result.max_label(), "Ana (8.50)");
        assert_eq!(result.min_label(), "none");
    }

    #[test]
    fn student_deserializes_without_detail_fields() {
        let parsed: Student = serde_json::from_str(r#"{"id":3,"name":"Bia","age":19}"#)
            .expect("valid student json");
        assert!(parsed.grades.is_empty());
        assert!(parsed.attendance.is_empty());
    }
}
