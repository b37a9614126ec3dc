use std::fmt::Write;

use chrono::{DateTime, Utc};

use crate::config::PassThresholds;
use crate::models::{StatisticsResult, Student};

pub fn build_report(
    source_label: &str,
    generated_at: DateTime<Utc>,
    thresholds: &PassThresholds,
    stats: &StatisticsResult,
) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Roster Statistics Report");
    let _ = writeln!(
        output,
        "Generated for {} at {}",
        source_label,
        generated_at.format("%Y-%m-%d %H:%M UTC")
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Overview");
    let _ = writeln!(output, "- Students: {}", stats.student_count());
    let _ = writeln!(
        output,
        "- Overall mean grade: {}",
        format_optional(stats.mean_grade_overall)
    );
    let _ = writeln!(output, "- Mean age: {}", format_optional(stats.mean_age));
    let _ = writeln!(output, "- Highest mean: {}", stats.max_label());
    let _ = writeln!(output, "- Lowest mean: {}", stats.min_label());
    let _ = writeln!(
        output,
        "- Pass rule: mean grade >= {:.1} and attendance >= {:.0}%",
        thresholds.min_mean_grade, thresholds.min_attendance_rate
    );

    write_partition(&mut output, "Passed", &stats.passed);
    write_partition(&mut output, "Failed", &stats.failed);

    output
}

fn write_partition(output: &mut String, title: &str, students: &[Student]) {
    let _ = writeln!(output);
    let _ = writeln!(output, "## {} ({})", title, students.len());

    if students.is_empty() {
        let _ = writeln!(output, "No students.");
        return;
    }

    for student in students {
        let _ = writeln!(
            output,
            "- {} (#{}, age {}) mean {} across {} grades, attendance {:.0}%",
            student.name,
            student.id,
            student.age,
            format_optional(student.mean_grade()),
            student.grades.len(),
            student.attendance_rate()
        );
    }
}

fn format_optional(value: Option<f64>) -> String {
    value
        .map(|v| format!("{v:.2}"))
        .unwrap_or_else(|| "n/a".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::StatisticsAggregator;
    use chrono::TimeZone;

    fn generated_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 14, 30, 0)
            .single()
            .expect("valid timestamp")
    }

    #[test]
    fn report_lists_both_partitions() {
        let roster = vec![
            Student {
                id: 1,
                name: "Ana".to_string(),
                age: 20,
                grades: vec![9.0, 8.0],
                attendance: vec![true, true],
            },
            Student {
                id: 2,
                name: "Bia".to_string(),
                age: 22,
                grades: vec![],
                attendance: vec![false],
            },
        ];
        let thresholds = PassThresholds::default();
        let stats = StatisticsAggregator::new(thresholds).compute(&roster);
        let report = build_report("http://roster.local", generated_at(), &thresholds, &stats);

        assert!(report.contains("Generated for http://roster.local at 2026-03-02 14:30 UTC"));
        assert!(report.contains("- Overall mean grade: 8.50"));
        assert!(report.contains("- Highest mean: Ana (8.50)"));
        assert!(report.contains("## Passed (1)"));
        assert!(report.contains("- Ana (#1, age 20) mean 8.50 across 2 grades, attendance 100%"));
        assert!(report.contains("## Failed (1)"));
        assert!(report.contains("- Bia (#2, age 22) mean n/a across 0 grades, attendance 0%"));
    }

    #[test]
    fn empty_report_uses_placeholders() {
        let thresholds = PassThresholds::default();
        let stats = StatisticsAggregator::default().compute(&[]);
        let report = build_report("csv", generated_at(), &thresholds, &stats);

        assert!(report.contains("- Overall mean grade: n/a"));
        assert!(report.contains("- Highest mean: none"));
        assert!(report.contains("## Passed (0)\nNo students."));
    }
}
