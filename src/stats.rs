use crate::config::PassThresholds;
use crate::models::{Student, StudentStatus, StatisticsResult};

#[derive(Debug, Clone, Copy, Default)]
pub struct StatisticsAggregator {
    thresholds: PassThresholds,
}

impl StatisticsAggregator {
    pub fn new(thresholds: PassThresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &PassThresholds {
        &self.thresholds
    }

    pub fn compute(&self, students: &[Student]) -> StatisticsResult {
        let (passed, failed): (Vec<Student>, Vec<Student>) = students
            .iter()
            .cloned()
            .partition(|student| student.status(&self.thresholds) == StudentStatus::Passed);

        StatisticsResult {
            mean_grade_overall: mean_grade_overall(students),
            student_with_max_mean: extremal_by_mean(students, |candidate, best| candidate > best)
                .cloned(),
            student_with_min_mean: extremal_by_mean(students, |candidate, best| candidate < best)
                .cloned(),
            mean_age: mean_age(students),
            passed,
            failed,
        }
    }
}

/// Mean of the per-student means. Ungraded students are left out of the denominator.
pub fn mean_grade_overall(students: &[Student]) -> Option<f64> {
    let means: Vec<f64> = students.iter().filter_map(Student::mean_grade).collect();
    if means.is_empty() {
        return None;
    }
    Some(means.iter().sum::<f64>() / means.len() as f64)
}

pub fn mean_age(students: &[Student]) -> Option<f64> {
    if students.is_empty() {
        return None;
    }
    let total: f64 = students.iter().map(|student| f64::from(student.age)).sum();
    Some(total / students.len() as f64)
}

/// Ties keep the first student.
fn extremal_by_mean(
    students: &[Student],
    better: impl Fn(f64, f64) -> bool,
) -> Option<&Student> {
    let mut best: Option<(&Student, f64)> = None;
    for student in students {
        let Some(mean) = student.mean_grade() else {
            continue;
        };
        match best {
            Some((_, best_mean)) if !better(mean, best_mean) => {}
            _ => best = Some((student, mean)),
        }
    }
    best.map(|(student, _)| student)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn student(id: i64, name: &str, age: u32, grades: &[f64], attendance: &[bool]) -> Student {
        Student {
            id,
            name: name.to_string(),
            age,
            grades: grades.to_vec(),
            attendance: attendance.to_vec(),
        }
    }

    #[test]
    fn extremes_and_overall_mean() {
        let roster = vec![
            student(1, "Ana", 20, &[10.0, 10.0], &[true]),
            student(2, "Bia", 22, &[0.0, 0.0], &[true]),
        ];
        let result = StatisticsAggregator::default().compute(&roster);

        assert_eq!(result.mean_grade_overall, Some(5.0));
        assert_eq!(result.student_with_max_mean.as_ref().map(|s| s.id), Some(1));
        assert_eq!(result.student_with_min_mean.as_ref().map(|s| s.id), Some(2));
        assert_eq!(result.mean_age, Some(21.0));
    }

    #[test]
    fn empty_roster_yields_sentinels() {
        let result = StatisticsAggregator::default().compute(&[]);

        assert_eq!(result.mean_grade_overall, None);
        assert_eq!(result.mean_age, None);
        assert!(result.student_with_max_mean.is_none());
        assert!(result.student_with_min_mean.is_none());
        assert!(result.passed.is_empty());
        assert!(result.failed.is_empty());
    }

    #[test]
    fn ungraded_students_are_left_out_of_grade_aggregates() {
        let roster = vec![
            student(1, "Ana", 20, &[], &[true]),
            student(2, "Bia", 30, &[8.0], &[true]),
        ];
        let result = StatisticsAggregator::default().compute(&roster);

        assert_eq!(result.mean_grade_overall, Some(8.0));
        assert_eq!(result.student_with_max_mean.as_ref().map(|s| s.id), Some(2));
        assert_eq!(result.student_with_min_mean.as_ref().map(|s| s.id), Some(2));
        assert_eq!(result.mean_age, Some(25.0));
        assert_eq!(result.failed.iter().map(|s| s.id).collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn all_ungraded_has_no_grade_mean() {
        let roster = vec![student(1, "Ana", 20, &[], &[])];
        let result = StatisticsAggregator::default().compute(&roster);
        assert_eq!(result.mean_grade_overall, None);
        assert!(result.student_with_max_mean.is_none());
        assert_eq!(result.mean_age, Some(20.0));
    }

    #[test]
    fn ties_go_to_the_first_student() {
        let roster = vec![
            student(1, "Ana", 20, &[7.0], &[]),
            student(2, "Bia", 20, &[7.0], &[]),
            student(3, "Caio", 20, &[7.0], &[]),
        ];
        let result = StatisticsAggregator::default().compute(&roster);
        assert_eq!(result.student_with_max_mean.as_ref().map(|s| s.id), Some(1));
        assert_eq!(result.student_with_min_mean.as_ref().map(|s| s.id), Some(1));
    }

    #[test]
    fn partition_preserves_order_and_covers_everyone() {
        let roster = vec![
            student(1, "Ana", 20, &[9.0], &[true, true, true, true]),
            student(2, "Bia", 20, &[9.0], &[true, false]),
            student(3, "Caio", 20, &[6.0], &[true, true, true, false]),
            student(4, "Duda", 20, &[5.5], &[true]),
            student(5, "Eva", 20, &[7.0], &[]),
        ];
        let result = StatisticsAggregator::default().compute(&roster);

        let ids = |list: &[Student]| list.iter().map(|s| s.id).collect::<Vec<_>>();
        assert_eq!(ids(&result.passed), vec![1, 3]);
        assert_eq!(ids(&result.failed), vec![2, 4, 5]);
        assert_eq!(result.student_count(), roster.len());
    }

    #[test]
    fn thresholds_are_configurable() {
        let roster = vec![student(1, "Ana", 20, &[5.0], &[true, false])];
        let lenient = StatisticsAggregator::new(PassThresholds {
            min_mean_grade: 5.0,
            min_attendance_rate: 50.0,
        });
        assert_eq!(lenient.compute(&roster).passed.len(), 1);
        assert_eq!(StatisticsAggregator::default().compute(&roster).failed.len(), 1);
    }
}
